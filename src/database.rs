//! Database restore, version lookup, compatibility rewrite, and final
//! packaging, all executed through the run's database container.
//!
//! Dumps taken on newer PostgreSQL servers can carry session settings the
//! older engine in the container does not know (`unrecognized configuration
//! parameter`). Restores recover from that automatically by stripping the
//! offending statements and retrying with a compatibility dump.

use crate::command::CommandRunner;
use crate::context::RunContext;
use crate::error::{self, Result};
use crate::filesystem;
use log::{info, warn};
use regex::Regex;
use snafu::ResultExt;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const CONTAINER_SQL_DUMP: &str = "/tmp/dump.sql";
const CONTAINER_BINARY_DUMP: &str = "/tmp/database.dump";
const COMPAT_DUMP_NAME: &str = "dump.compat.sql";

/// How many compatibility rewrite passes a restore gets before giving up.
const MAX_COMPAT_PASSES: u32 = 5;

const PACKAGE_NAME: &str = "upgraded.zip";
const COPY_CHUNK: usize = 8192;

/// Classification of the source input after download/extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceFileType {
    Archive,
    Dump,
}

impl SourceFileType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SourceFileType::Archive => "ZIP",
            SourceFileType::Dump => "DUMP",
        }
    }

    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ZIP" => Some(SourceFileType::Archive),
            "DUMP" => Some(SourceFileType::Dump),
            _ => None,
        }
    }
}

pub(crate) struct DatabaseService<'a> {
    runner: &'a CommandRunner,
    ctx: &'a RunContext,
}

impl<'a> DatabaseService<'a> {
    pub(crate) fn new(runner: &'a CommandRunner, ctx: &'a RunContext) -> Self {
        Self { runner, ctx }
    }

    /// Restores the target database from the prepared source directory.
    pub(crate) fn restore(
        &self,
        file_type: SourceFileType,
        source_dir: &Path,
        filestore_dir: &Path,
    ) -> Result<()> {
        info!("Restoring database...");
        self.drop_and_create()?;

        match file_type {
            SourceFileType::Archive => self.restore_from_archive(source_dir, filestore_dir),
            SourceFileType::Dump => self.restore_from_binary_dump(source_dir),
        }
    }

    /// Drops the target database if it exists and recreates it empty, so a
    /// restore never layers on top of previous state.
    fn drop_and_create(&self) -> Result<()> {
        self.runner.run(
            &self.db_tool(
                "dropdb",
                &["--if-exists", &self.ctx.target_db_name],
            ),
            true,
        )?;
        self.runner
            .run(&self.db_tool("createdb", &[&self.ctx.target_db_name]), true)?;
        Ok(())
    }

    fn restore_from_archive(&self, source_dir: &Path, filestore_dir: &Path) -> Result<()> {
        let dump_path = locate_sql_dump(source_dir)?;

        let source_filestore = source_dir.join("filestore");
        if source_filestore.exists() {
            // The source's filestore replaces whatever the target holds.
            filesystem::cleanup_dir(filestore_dir);
            if let Err(e) = filesystem::create_dir_all(filestore_dir)
                .and_then(|_| filesystem::copy_tree(&source_filestore, filestore_dir))
            {
                warn!("Failed to copy filestore: {}", e);
            } else {
                filesystem::set_tree_permissions(filestore_dir);
            }
        }

        self.copy_into_container(&dump_path, CONTAINER_SQL_DUMP)?;
        let output = self.exec_sql_file(CONTAINER_SQL_DUMP)?;
        if output.success() {
            return Ok(());
        }

        self.retry_with_compat_dumps(&dump_path, source_dir, output.stderr)
    }

    /// Strips unrecognized configuration parameters out of the dump and
    /// retries, up to [`MAX_COMPAT_PASSES`] times. Each pass only widens the
    /// removal set with parameters the server actually complained about.
    fn retry_with_compat_dumps(
        &self,
        dump_path: &Path,
        source_dir: &Path,
        first_stderr: String,
    ) -> Result<()> {
        let mut sql = fs::read_to_string(dump_path)
            .context(error::ReadFileSnafu { path: dump_path })?;
        let mut removed: BTreeSet<String> = BTreeSet::new();
        let mut stderr = first_stderr;
        let compat_path = source_dir.join(COMPAT_DUMP_NAME);

        for pass in 1..=MAX_COMPAT_PASSES {
            let new_params: BTreeSet<String> = extract_unrecognized_parameters(&stderr)
                .difference(&removed)
                .cloned()
                .collect();
            if new_params.is_empty() {
                return error::CompatRewriteExhaustedSnafu {
                    message: stderr.trim().to_string(),
                }
                .fail();
            }

            removed.extend(new_params.iter().cloned());
            let (stripped, dropped) = strip_parameter_statements(&sql, &removed);
            if dropped == 0 {
                return error::CompatRewriteExhaustedSnafu {
                    message: stderr.trim().to_string(),
                }
                .fail();
            }

            info!(
                "Compatibility pass {}: removed {} statement(s) for parameters [{}]",
                pass,
                dropped,
                new_params.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            sql = stripped;
            fs::write(&compat_path, &sql)
                .context(error::WriteFileSnafu { path: &compat_path })?;

            self.drop_and_create()?;
            self.copy_into_container(&compat_path, CONTAINER_SQL_DUMP)?;
            let output = self.exec_sql_file(CONTAINER_SQL_DUMP)?;
            if output.success() {
                return Ok(());
            }
            stderr = output.stderr;
        }

        error::CompatRewriteExhaustedSnafu {
            message: stderr.trim().to_string(),
        }
        .fail()
    }

    fn restore_from_binary_dump(&self, source_dir: &Path) -> Result<()> {
        let dump_path = source_dir.join("database.dump");
        self.copy_into_container(&dump_path, CONTAINER_BINARY_DUMP)?;

        let argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            self.ctx.db_container_name.clone(),
            "pg_restore".to_string(),
            "-U".to_string(),
            self.ctx.db_user.clone(),
            "-d".to_string(),
            self.ctx.target_db_name.clone(),
            "--no-owner".to_string(),
            "--no-privileges".to_string(),
            "--clean".to_string(),
            "--if-exists".to_string(),
            "--single-transaction".to_string(),
            "--exit-on-error".to_string(),
            CONTAINER_BINARY_DUMP.to_string(),
        ];
        let output = self.runner.run(&argv, false)?;
        if output.success() {
            return Ok(());
        }

        if output.stderr.contains("unsupported version") {
            return error::UnsupportedDumpVersionSnafu.fail();
        }
        error::CommandFailedSnafu {
            command: argv.join(" "),
            code: output.code,
            stderr: format!("\n{}", output.stderr.trim()),
        }
        .fail()
    }

    /// Answers the current version string recorded in the ERP metadata, or
    /// an empty string when none of the candidate queries yield one.
    pub(crate) fn probe_version(&self) -> Result<String> {
        let queries = [
            "SELECT latest_version FROM ir_module_module WHERE name = 'base' AND state = 'installed';",
            "SELECT value FROM ir_config_parameter WHERE key = 'database.latest_version';",
            "SELECT latest_version FROM ir_module_module WHERE name = 'base' ORDER BY id DESC LIMIT 1;",
        ];

        for query in queries {
            let argv = vec![
                "docker".to_string(),
                "exec".to_string(),
                "-i".to_string(),
                self.ctx.db_container_name.clone(),
                "psql".to_string(),
                "-U".to_string(),
                self.ctx.db_user.clone(),
                "-d".to_string(),
                self.ctx.target_db_name.clone(),
                "-t".to_string(),
                "-A".to_string(),
                "-c".to_string(),
                query.to_string(),
            ];
            let output = self.runner.run(&argv, false)?;
            if !output.success() {
                continue;
            }
            if let Some(version) = output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
            {
                return Ok(version.to_string());
            }
        }

        Ok(String::new())
    }

    /// Dumps the upgraded database and packages it with the filestore tree.
    pub(crate) fn finalize_package(
        &self,
        output_dir: &Path,
        filestore_dir: &Path,
    ) -> Result<PathBuf> {
        info!("Creating final package...");

        let dump_path = output_dir.join("dump.sql");
        let argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            self.ctx.db_container_name.clone(),
            "pg_dump".to_string(),
            "-U".to_string(),
            self.ctx.db_user.clone(),
            self.ctx.target_db_name.clone(),
        ];
        let output = self
            .runner
            .run(&argv, true)
            .map_err(|e| error::FinalDumpSnafu { message: e.to_string() }.build())?;
        fs::write(&dump_path, output.stdout)
            .context(error::WriteFileSnafu { path: &dump_path })?;

        let package = build_package(output_dir, filestore_dir, &dump_path)?;

        if let Err(e) = fs::remove_file(&dump_path) {
            warn!("Could not remove {}: {}", dump_path.display(), e);
        }

        info!("Upgrade complete. Package: {}", package.display());
        Ok(package)
    }

    fn copy_into_container(&self, local: &Path, container_path: &str) -> Result<()> {
        let argv = vec![
            "docker".to_string(),
            "cp".to_string(),
            local.to_string_lossy().into_owned(),
            format!("{}:{}", self.ctx.db_container_name, container_path),
        ];
        self.runner.run(&argv, true)?;
        Ok(())
    }

    fn exec_sql_file(&self, container_path: &str) -> Result<crate::command::CommandOutput> {
        let argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            "-i".to_string(),
            self.ctx.db_container_name.clone(),
            "psql".to_string(),
            "-U".to_string(),
            self.ctx.db_user.clone(),
            "-d".to_string(),
            self.ctx.target_db_name.clone(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-f".to_string(),
            container_path.to_string(),
        ];
        self.runner.run(&argv, false)
    }

    fn db_tool(&self, tool: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            self.ctx.db_container_name.clone(),
            tool.to_string(),
            "-U".to_string(),
            self.ctx.db_user.clone(),
        ];
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }
}

/// Finds the SQL dump inside the extracted source tree, preferring
/// `dump.sql` at the root, then any root-level `.sql` file, then a recursive
/// search. Candidates are taken in sorted order so the choice is stable.
pub(crate) fn locate_sql_dump(source_dir: &Path) -> Result<PathBuf> {
    let preferred = source_dir.join("dump.sql");
    if preferred.is_file() {
        return Ok(preferred);
    }

    let mut root_candidates: Vec<PathBuf> = fs::read_dir(source_dir)
        .context(error::ReadFileSnafu { path: source_dir })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map(|e| e == "sql").unwrap_or(false))
        .collect();
    root_candidates.sort();
    if let Some(found) = root_candidates.into_iter().next() {
        return Ok(found);
    }

    let mut nested: Vec<PathBuf> = WalkDir::new(source_dir)
        .min_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| path.extension().map(|e| e == "sql").unwrap_or(false))
        .collect();
    nested.sort();
    nested.into_iter().next().ok_or_else(|| error::NoSqlInArchiveSnafu.build())
}

/// Pulls every parameter name out of `unrecognized configuration parameter
/// "<name>"` messages.
pub(crate) fn extract_unrecognized_parameters(stderr: &str) -> BTreeSet<String> {
    let pattern = Regex::new(r#"unrecognized configuration parameter "([^"]+)""#)
        .expect("static regex");
    pattern
        .captures_iter(stderr)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Removes `SET <param> …;` statements and `pg_catalog.set_config('<param>',
/// …)` calls for the given parameters. Returns the rewritten dump and the
/// number of lines dropped. Lines not mentioning the parameters are kept
/// byte-for-byte.
pub(crate) fn strip_parameter_statements(
    sql: &str,
    parameters: &BTreeSet<String>,
) -> (String, usize) {
    let set_patterns: Vec<Regex> = parameters
        .iter()
        .map(|param| {
            Regex::new(&format!(
                r"(?i)^\s*SET\s+{}\s*(=|TO)\s",
                regex::escape(param)
            ))
            .expect("escaped parameter regex")
        })
        .collect();
    let config_markers: Vec<String> = parameters
        .iter()
        .map(|param| format!("pg_catalog.set_config('{}'", param))
        .collect();

    let mut kept = Vec::new();
    let mut dropped = 0usize;
    for line in sql.lines() {
        let strip = set_patterns.iter().any(|p| p.is_match(line))
            || config_markers.iter().any(|marker| line.contains(marker));
        if strip {
            dropped += 1;
        } else {
            kept.push(line);
        }
    }

    let mut result = kept.join("\n");
    if sql.ends_with('\n') {
        result.push('\n');
    }
    (result, dropped)
}

/// Builds `upgraded.zip` with the dump at the archive root and the filestore
/// mirrored under its stable relative path.
pub(crate) fn build_package(
    output_dir: &Path,
    filestore_dir: &Path,
    dump_path: &Path,
) -> Result<PathBuf> {
    let package_path = output_dir.join(PACKAGE_NAME);
    let file = File::create(&package_path)
        .context(error::WriteFileSnafu { path: &package_path })?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    append_file(&mut writer, dump_path, "dump.sql", options)?;

    if filestore_dir.exists() {
        for entry in WalkDir::new(filestore_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let archive_name = entry
                .path()
                .strip_prefix(output_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            append_file(&mut writer, entry.path(), &archive_name, options)?;
        }
    }

    writer
        .finish()
        .context(error::InvalidArchiveSnafu { path: &package_path })?;
    Ok(package_path)
}

fn append_file(
    writer: &mut zip::ZipWriter<File>,
    path: &Path,
    archive_name: &str,
    options: zip::write::FileOptions,
) -> Result<()> {
    writer
        .start_file(archive_name, options)
        .context(error::InvalidArchiveSnafu { path })?;
    let mut input = File::open(path).context(error::ReadFileSnafu { path })?;
    let mut buffer = [0u8; COPY_CHUNK];
    loop {
        let read = input
            .read(&mut buffer)
            .context(error::ReadFileSnafu { path })?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .context(error::WriteFileSnafu { path })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn locate_prefers_dump_sql() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("aaa.sql"), "x").unwrap();
        fs::write(dir.path().join("dump.sql"), "x").unwrap();
        assert_eq!(
            locate_sql_dump(dir.path()).unwrap(),
            dir.path().join("dump.sql")
        );
    }

    #[test]
    fn locate_falls_back_to_first_sql_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("zzz.sql"), "x").unwrap();
        fs::write(dir.path().join("bbb.sql"), "x").unwrap();
        assert_eq!(
            locate_sql_dump(dir.path()).unwrap(),
            dir.path().join("bbb.sql")
        );
    }

    #[test]
    fn locate_searches_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("backup")).unwrap();
        fs::write(dir.path().join("backup/data.sql"), "x").unwrap();
        assert_eq!(
            locate_sql_dump(dir.path()).unwrap(),
            dir.path().join("backup/data.sql")
        );
    }

    #[test]
    fn locate_errors_when_no_sql_present() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("readme.txt"), "x").unwrap();
        let err = locate_sql_dump(dir.path()).unwrap_err();
        assert!(matches!(err, crate::error::Error::NoSqlInArchive));
    }

    #[test]
    fn extracts_parameter_names_from_stderr() {
        let stderr = r#"psql:/tmp/dump.sql:12: ERROR:  unrecognized configuration parameter "transaction_timeout"
psql:/tmp/dump.sql:40: ERROR:  unrecognized configuration parameter "idle_session_timeout"
"#;
        let params = extract_unrecognized_parameters(stderr);
        assert_eq!(
            params.into_iter().collect::<Vec<_>>(),
            vec!["idle_session_timeout", "transaction_timeout"]
        );
    }

    #[test]
    fn strips_only_matching_statements() {
        let sql = "SET statement_timeout = 0;\n\
                   SET transaction_timeout = 0;\n\
                   SELECT pg_catalog.set_config('search_path', '', false);\n\
                   SELECT pg_catalog.set_config('transaction_timeout', '0', false);\n\
                   CREATE TABLE t (id integer);\n";
        let params: BTreeSet<String> = ["transaction_timeout".to_string()].into();
        let (stripped, dropped) = strip_parameter_statements(sql, &params);

        assert_eq!(dropped, 2);
        assert!(stripped.contains("SET statement_timeout = 0;"));
        assert!(stripped.contains("pg_catalog.set_config('search_path'"));
        assert!(stripped.contains("CREATE TABLE t"));
        assert!(!stripped.contains("transaction_timeout"));
    }

    #[test]
    fn strip_handles_set_to_form() {
        let sql = "SET idle_session_timeout TO '5min';\nSELECT 1;\n";
        let params: BTreeSet<String> = ["idle_session_timeout".to_string()].into();
        let (stripped, dropped) = strip_parameter_statements(sql, &params);
        assert_eq!(dropped, 1);
        assert_eq!(stripped, "SELECT 1;\n");
    }

    #[test]
    fn strip_is_a_noop_without_matches() {
        let sql = "SET statement_timeout = 0;\nCREATE TABLE t (id integer);\n";
        let params: BTreeSet<String> = ["transaction_timeout".to_string()].into();
        let (stripped, dropped) = strip_parameter_statements(sql, &params);
        assert_eq!(dropped, 0);
        assert_eq!(stripped, sql);
    }

    #[test]
    fn package_contains_dump_and_filestore_tree() {
        let dir = TempDir::new().unwrap();
        let output_dir = dir.path();
        let filestore = output_dir.join("filestore");
        fs::create_dir_all(filestore.join("ab")).unwrap();
        fs::write(filestore.join("ab/attachment1"), "blob").unwrap();
        let dump = output_dir.join("dump.sql");
        fs::write(&dump, "SELECT 1;\n").unwrap();

        let package = build_package(output_dir, &filestore, &dump).unwrap();
        assert_eq!(package, output_dir.join("upgraded.zip"));

        let file = File::open(&package).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"dump.sql".to_string()));
        assert!(names.contains(&"filestore/ab/attachment1".to_string()));
    }

    #[test]
    fn source_file_type_tags_round_trip() {
        assert_eq!(SourceFileType::Archive.as_str(), "ZIP");
        assert_eq!(
            SourceFileType::from_tag("DUMP"),
            Some(SourceFileType::Dump)
        );
        assert_eq!(SourceFileType::from_tag("TARBALL"), None);
    }
}
