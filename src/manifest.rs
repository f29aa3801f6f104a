//! The run manifest: a human-readable JSON report of what the run did.
//!
//! Step records are append-only; finishing a step transitions the most
//! recent running record with that name and derives its duration from the
//! recorded timestamps. Manifest writes are best effort: a failure to write
//! the report must never abort an upgrade, so it is logged and swallowed.

use crate::error::{self, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::{IntoError, ResultExt};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManifestStep {
    pub(crate) name: String,
    pub(crate) status: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) duration_seconds: Option<f64>,
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ManifestVersions {
    pub(crate) source: Option<String>,
    pub(crate) target: Option<String>,
    pub(crate) current: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunManifest {
    pub(crate) run_id: Option<String>,
    pub(crate) status: String,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) duration_seconds: Option<f64>,
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
    pub(crate) versions: ManifestVersions,
    pub(crate) steps: Vec<ManifestStep>,
    pub(crate) artifacts: BTreeMap<String, String>,
    pub(crate) error: Option<String>,
}

impl Default for RunManifest {
    fn default() -> Self {
        Self {
            run_id: None,
            status: "running".to_string(),
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            metadata: BTreeMap::new(),
            versions: ManifestVersions::default(),
            steps: Vec::new(),
            artifacts: BTreeMap::new(),
            error: None,
        }
    }
}

pub(crate) struct ManifestWriter {
    path: PathBuf,
    manifest: RunManifest,
}

impl ManifestWriter {
    pub(crate) fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            manifest: RunManifest::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub(crate) fn start_run(
        &mut self,
        run_id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) {
        self.manifest.run_id = Some(run_id.to_string());
        self.manifest.status = "running".to_string();
        self.manifest.started_at = Some(Utc::now());
        self.manifest.metadata = metadata;
        self.write();
    }

    pub(crate) fn set_versions(
        &mut self,
        source: Option<&str>,
        target: Option<&str>,
        current: Option<&str>,
    ) {
        if let Some(source) = source {
            self.manifest.versions.source = Some(source.to_string());
        }
        if let Some(target) = target {
            self.manifest.versions.target = Some(target.to_string());
        }
        if let Some(current) = current {
            self.manifest.versions.current = Some(current.to_string());
        }
        self.write();
    }

    pub(crate) fn step_started(&mut self, step_name: &str) {
        self.manifest.steps.push(ManifestStep {
            name: step_name.to_string(),
            status: "running".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_seconds: None,
            error: None,
        });
        self.write();
    }

    pub(crate) fn step_finished(&mut self, step_name: &str, status: &str, error: Option<&str>) {
        for step in self.manifest.steps.iter_mut().rev() {
            if step.name == step_name && step.status == "running" {
                let finished = Utc::now();
                step.status = status.to_string();
                step.finished_at = Some(finished);
                step.error = error.map(str::to_string);
                step.duration_seconds = Some(duration_seconds(step.started_at, finished));
                break;
            }
        }
        self.write();
    }

    pub(crate) fn add_artifact(&mut self, key: &str, value: &str) {
        self.manifest
            .artifacts
            .insert(key.to_string(), value.to_string());
        self.write();
    }

    pub(crate) fn finalize(&mut self, status: &str, error: Option<&str>) {
        let finished = Utc::now();
        self.manifest.status = status.to_string();
        self.manifest.finished_at = Some(finished);
        if let Some(started) = self.manifest.started_at {
            self.manifest.duration_seconds = Some(duration_seconds(started, finished));
        }
        self.manifest.error = error.map(str::to_string);
        self.write();
    }

    /// Atomic write, warning instead of failing: the manifest is a report,
    /// not a checkpoint.
    fn write(&self) {
        if let Err(e) = self.try_write() {
            warn!(
                "Could not write manifest file '{}': {}",
                self.path.display(),
                e
            );
        }
    }

    fn try_write(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .context(error::CreateDirSnafu { path: &parent })?;

        let mut temp = tempfile::Builder::new()
            .prefix("run-manifest-")
            .suffix(".json")
            .tempfile_in(&parent)
            .context(error::WriteFileSnafu { path: &self.path })?;
        let rendered = serde_json::to_string_pretty(&self.manifest)
            .context(error::StateSerializeSnafu)?;
        temp.write_all(rendered.as_bytes())
            .and_then(|_| temp.write_all(b"\n"))
            .context(error::WriteFileSnafu { path: &self.path })?;
        temp.persist(&self.path)
            .map_err(|e| error::WriteFileSnafu { path: &self.path }.into_error(e.error))?;
        Ok(())
    }
}

fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}
