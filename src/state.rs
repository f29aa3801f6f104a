//! Checkpointed run state.
//!
//! Every step boundary is persisted so an interrupted run can resume from
//! its last completed step. Writes go through a sibling temp file and an
//! atomic rename; a reader never observes a torn state document.

use crate::context::RunContext;
use crate::error::{self, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ensure, IntoError, ResultExt};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RunStatus {
    Running,
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StepRecord {
    pub(crate) name: String,
    pub(crate) status: StepStatus,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) error: Option<String>,
}

/// The settings that must match for a resume to be valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResumeMetadata {
    pub(crate) source: String,
    pub(crate) target_version: String,
    pub(crate) extra_addons: Option<String>,
    pub(crate) source_sha256: Option<String>,
    pub(crate) extra_addons_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistentState {
    pub(crate) schema_version: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) status: RunStatus,
    pub(crate) metadata: ResumeMetadata,
    pub(crate) run_context: RunContext,
    pub(crate) completed_steps: Vec<String>,
    pub(crate) current_step: Option<String>,
    pub(crate) current_version: Option<String>,
    pub(crate) data: BTreeMap<String, serde_json::Value>,
    pub(crate) steps: Vec<StepRecord>,
    pub(crate) last_error: Option<String>,
}

pub(crate) struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub(crate) fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state file, or `None` when it does not exist yet.
    pub(crate) fn load(&self) -> Result<Option<PersistentState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .context(error::StateReadSnafu { path: &self.path })?;
        let state = serde_json::from_str(&text)
            .context(error::StateParseSnafu { path: &self.path })?;
        Ok(Some(state))
    }

    /// Creates a fresh state, or when `resume` is set and a compatible file
    /// exists, picks it up. Returns the state and whether it was resumed.
    pub(crate) fn initialize(
        &self,
        metadata: ResumeMetadata,
        run_context: &RunContext,
        resume: bool,
    ) -> Result<(PersistentState, bool)> {
        if resume {
            if let Some(mut existing) = self.load()? {
                validate_resume_compatibility(&existing.metadata, &metadata)?;
                ensure!(
                    existing.status != RunStatus::Success,
                    error::ResumeAlreadySuccessfulSnafu
                );
                existing.status = RunStatus::Running;
                self.save(&mut existing)?;
                return Ok((existing, true));
            }
        }

        let now = Utc::now();
        let mut state = PersistentState {
            schema_version: STATE_SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            status: RunStatus::Running,
            metadata,
            run_context: run_context.clone(),
            completed_steps: Vec::new(),
            current_step: None,
            current_version: None,
            data: BTreeMap::new(),
            steps: Vec::new(),
            last_error: None,
        };
        self.save(&mut state)?;
        Ok((state, false))
    }

    /// Writes the whole state atomically, stamping schema version and
    /// `updated_at`.
    pub(crate) fn save(&self, state: &mut PersistentState) -> Result<()> {
        state.schema_version = STATE_SCHEMA_VERSION;
        state.updated_at = Utc::now();

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .context(error::CreateDirSnafu { path: &parent })?;

        let mut temp = tempfile::Builder::new()
            .prefix("run-state-")
            .suffix(".json")
            .tempfile_in(&parent)
            .context(error::StateWriteSnafu { path: &self.path })?;
        let rendered =
            serde_json::to_string_pretty(state).context(error::StateSerializeSnafu)?;
        temp.write_all(rendered.as_bytes())
            .context(error::StateWriteSnafu { path: &self.path })?;
        temp.write_all(b"\n")
            .context(error::StateWriteSnafu { path: &self.path })?;
        temp.as_file()
            .sync_all()
            .context(error::StateWriteSnafu { path: &self.path })?;
        temp.persist(&self.path)
            .map_err(|e| error::StateWriteSnafu { path: &self.path }.into_error(e.error))?;
        Ok(())
    }

    pub(crate) fn mark_step_started(
        &self,
        state: &mut PersistentState,
        step_name: &str,
    ) -> Result<()> {
        state.current_step = Some(step_name.to_string());
        state.steps.push(StepRecord {
            name: step_name.to_string(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
        self.save(state)
    }

    pub(crate) fn mark_step_completed(
        &self,
        state: &mut PersistentState,
        step_name: &str,
    ) -> Result<()> {
        update_step_status(state, step_name, StepStatus::Success, None);
        if !state.completed_steps.iter().any(|s| s == step_name) {
            state.completed_steps.push(step_name.to_string());
        }
        state.current_step = None;
        self.save(state)
    }

    pub(crate) fn mark_step_failed(
        &self,
        state: &mut PersistentState,
        step_name: &str,
        error_message: &str,
    ) -> Result<()> {
        update_step_status(state, step_name, StepStatus::Failed, Some(error_message));
        state.status = RunStatus::Failed;
        state.last_error = Some(error_message.to_string());
        self.save(state)
    }

    pub(crate) fn mark_status(
        &self,
        state: &mut PersistentState,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        state.status = status;
        if let Some(message) = error_message {
            state.last_error = Some(message.to_string());
        }
        self.save(state)
    }

    pub(crate) fn set_current_version(
        &self,
        state: &mut PersistentState,
        version: &str,
    ) -> Result<()> {
        state.current_version = Some(version.to_string());
        self.save(state)
    }

    pub(crate) fn set_value(
        &self,
        state: &mut PersistentState,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        state.data.insert(key.to_string(), value);
        self.save(state)
    }
}

impl PersistentState {
    pub(crate) fn is_step_completed(&self, step_name: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_name)
    }

    pub(crate) fn get_bool(&self, key: &str) -> bool {
        self.data
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Only the most recent unfinished record for a name is completed.
fn update_step_status(
    state: &mut PersistentState,
    step_name: &str,
    status: StepStatus,
    error_message: Option<&str>,
) {
    for step in state.steps.iter_mut().rev() {
        if step.name == step_name && step.status == StepStatus::Running {
            step.status = status;
            step.finished_at = Some(Utc::now());
            step.error = error_message.map(str::to_string);
            return;
        }
    }
}

fn validate_resume_compatibility(
    existing: &ResumeMetadata,
    requested: &ResumeMetadata,
) -> Result<()> {
    let mut mismatches = Vec::new();
    if existing.source != requested.source {
        mismatches.push("source");
    }
    if existing.target_version != requested.target_version {
        mismatches.push("target_version");
    }
    if existing.extra_addons != requested.extra_addons {
        mismatches.push("extra_addons");
    }
    if existing.source_sha256 != requested.source_sha256 {
        mismatches.push("source_sha256");
    }
    if existing.extra_addons_sha256 != requested.extra_addons_sha256 {
        mismatches.push("extra_addons_sha256");
    }

    ensure!(
        mismatches.is_empty(),
        error::ResumeMismatchSnafu {
            fields: mismatches.join(", "),
        }
    );
    Ok(())
}
