//! The on-disk layout of a run, relative to the working directory.
//!
//! `source/` is scratch space for downloads and extraction and is destroyed
//! on success; everything the user keeps lands under `output/`.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    pub(crate) root: PathBuf,
    pub(crate) source_dir: PathBuf,
    pub(crate) output_dir: PathBuf,
    pub(crate) filestore_dir: PathBuf,
    pub(crate) custom_addons_dir: PathBuf,
    pub(crate) cache_root: PathBuf,
    pub(crate) state_file: PathBuf,
    pub(crate) manifest_file: PathBuf,
    pub(crate) odoo_log: PathBuf,
}

impl Workspace {
    pub(crate) fn new(root: &Path, state_file_override: Option<&Path>) -> Self {
        let output_dir = root.join("output");
        Self {
            root: root.to_path_buf(),
            source_dir: root.join("source"),
            filestore_dir: output_dir.join("filestore"),
            custom_addons_dir: output_dir.join("custom_addons"),
            cache_root: output_dir.join(".cache/openupgrade"),
            state_file: state_file_override
                .map(Path::to_path_buf)
                .unwrap_or_else(|| output_dir.join("run-state.json")),
            manifest_file: output_dir.join("run-manifest.json"),
            odoo_log: output_dir.join("odoo.log"),
            output_dir,
        }
    }

    pub(crate) fn upgraded_package(&self) -> PathBuf {
        self.output_dir.join("upgraded.zip")
    }
}
