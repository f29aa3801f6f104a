//! Safe ZIP extraction.
//!
//! Inputs may come off the network, so archives are treated as hostile: the
//! whole archive is audited before a single byte is written. Entries that
//! resolve outside the destination or that are symbolic links abort the
//! extraction.

use crate::error::{self, Result};
use crate::filesystem;
use snafu::{OptionExt, ResultExt};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

const COPY_CHUNK: usize = 8192;

/// Unix file type mask and the symlink type, as stored in the upper bits of
/// a zip entry's external attributes.
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Extracts `zip_path` into `destination`, refusing traversal and symlink
/// entries. The destination directory is created if needed.
pub(crate) fn safe_extract_zip(zip_path: &Path, destination: &Path) -> Result<()> {
    filesystem::create_dir_all(destination)?;

    let file = File::open(zip_path).context(error::ReadFileSnafu { path: zip_path })?;
    let mut archive = ZipArchive::new(file).context(error::InvalidArchiveSnafu {
        path: zip_path.to_path_buf(),
    })?;

    // Audit pass: no file is written until every entry has been checked.
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .context(error::InvalidArchiveSnafu {
                path: zip_path.to_path_buf(),
            })?;
        let name = entry.name().to_string();

        sanitize_entry_path(&name).context(error::UnsafeArchiveEntrySnafu { name: &name })?;

        if let Some(mode) = entry.unix_mode() {
            if mode & S_IFMT == S_IFLNK {
                return error::SymlinkArchiveEntrySnafu { name }.fail();
            }
        }
    }

    // Extraction pass: directories first, then file contents in small chunks.
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .context(error::InvalidArchiveSnafu {
                path: zip_path.to_path_buf(),
            })?;
        let name = entry.name().to_string();
        let relative =
            sanitize_entry_path(&name).context(error::UnsafeArchiveEntrySnafu { name: &name })?;
        let target = destination.join(relative);

        if entry.is_dir() || name.ends_with('/') {
            filesystem::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            filesystem::create_dir_all(parent)?;
        }

        let mut output =
            File::create(&target).context(error::WriteFileSnafu { path: &target })?;
        let mut buffer = [0u8; COPY_CHUNK];
        loop {
            let read = entry
                .read(&mut buffer)
                .context(error::ReadFileSnafu { path: zip_path })?;
            if read == 0 {
                break;
            }
            output
                .write_all(&buffer[..read])
                .context(error::WriteFileSnafu { path: &target })?;
        }
    }

    Ok(())
}

/// Resolves a zip entry name to a relative path that stays inside the
/// extraction root. Returns `None` for absolute paths and for any `..`
/// component. Backslash separators are normalised first since archives
/// produced on Windows may carry them.
fn sanitize_entry_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }

    let mut clean = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, build: impl FnOnce(&mut ZipWriter<File>)) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        build(&mut writer);
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_nested_entries() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("input.zip");
        write_zip(&zip_path, |writer| {
            writer
                .add_directory("sub/", FileOptions::default())
                .unwrap();
            writer
                .start_file("sub/data.txt", FileOptions::default())
                .unwrap();
            writer.write_all(b"payload").unwrap();
        });

        let out = dir.path().join("out");
        safe_extract_zip(&zip_path, &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("sub/data.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn rejects_traversal_entries() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("evil.zip");
        write_zip(&zip_path, |writer| {
            writer
                .start_file("../escape.txt", FileOptions::default())
                .unwrap();
            writer.write_all(b"no").unwrap();
        });

        let out = dir.path().join("out");
        let err = safe_extract_zip(&zip_path, &out).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::UnsafeArchiveEntry { .. }
        ));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn rejects_symlink_entries() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("link.zip");
        write_zip(&zip_path, |writer| {
            writer
                .add_symlink("link", "/etc/passwd", FileOptions::default())
                .unwrap();
        });

        let out = dir.path().join("out");
        let err = safe_extract_zip(&zip_path, &out).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::SymlinkArchiveEntry { .. }
        ));
    }

    #[test]
    fn audit_runs_before_any_write() {
        // A good entry listed before a traversal entry must not be written.
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("mixed.zip");
        write_zip(&zip_path, |writer| {
            writer
                .start_file("good.txt", FileOptions::default())
                .unwrap();
            writer.write_all(b"ok").unwrap();
            writer
                .start_file("../../escape.txt", FileOptions::default())
                .unwrap();
            writer.write_all(b"no").unwrap();
        });

        let out = dir.path().join("out");
        assert!(safe_extract_zip(&zip_path, &out).is_err());
        assert!(!out.join("good.txt").exists());
    }

    #[test]
    fn rejects_malformed_archives() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("broken.zip");
        std::fs::write(&zip_path, b"this is not a zip").unwrap();

        let err = safe_extract_zip(&zip_path, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidArchive { .. }));
    }

    #[test]
    fn sanitize_normalises_and_rejects() {
        assert_eq!(
            sanitize_entry_path("a/b/c.txt"),
            Some(PathBuf::from("a/b/c.txt"))
        );
        assert_eq!(
            sanitize_entry_path("a\\b\\c.txt"),
            Some(PathBuf::from("a/b/c.txt"))
        );
        assert_eq!(sanitize_entry_path("./a.txt"), Some(PathBuf::from("a.txt")));
        assert_eq!(sanitize_entry_path("../a.txt"), None);
        assert_eq!(sanitize_entry_path("a/../../b.txt"), None);
        assert_eq!(sanitize_entry_path("/abs.txt"), None);
    }
}
