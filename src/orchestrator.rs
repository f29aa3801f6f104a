//! The top-level pipeline.
//!
//! Every unit of work runs through the checkpoint wrapper: the state store
//! and manifest writer see a step start before its body executes and see its
//! terminal status before the next step starts. On resume, steps already in
//! `completed_steps` are skipped and recorded as such. Failures carry the
//! step name into the persisted state, and cleanup always runs unless the
//! run is preserved for `--resume`.

use crate::command::CommandRunner;
use crate::config::Settings;
use crate::context::RunContext;
use crate::database::{DatabaseService, SourceFileType};
use crate::docker::{ComposeTool, DockerRuntime};
use crate::download::Downloader;
use crate::error::{self, Error, Result};
use crate::filesystem::{self, DIR_MODE};
use crate::manifest::ManifestWriter;
use crate::progress::LogReporter;
use crate::state::{PersistentState, ResumeMetadata, RunStatus, StateStore};
use crate::upgrade::{
    EvidencePatterns, FailureClass, StepOutcome, UpgradeStepDriver,
};
use crate::validation::{self, Validator};
use crate::version::{supported_versions, OdooVersion, SUPPORTED_MAJORS};
use crate::archive;
use crate::workspace::Workspace;
use log::{error, info, warn};
use snafu::{ensure, IntoError};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct Upgrader {
    settings: Settings,
    workspace: Workspace,
    ctx: RunContext,
    runner: CommandRunner,
    compose: ComposeTool,
    validator: Validator,
    patterns: EvidencePatterns,
    reporter: LogReporter,
    state_store: StateStore,
    manifest: ManifestWriter,
    state: Option<PersistentState>,
    current_step: Option<String>,
    interrupted: Arc<AtomicBool>,
}

impl Upgrader {
    pub(crate) fn new(settings: Settings) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|source| {
            error::CurrentDirSnafu.into_error(source)
        })?;
        Self::with_root(settings, &cwd)
    }

    pub(crate) fn with_root(settings: Settings, root: &Path) -> Result<Self> {
        let runner = CommandRunner::new();
        let compose = ComposeTool::detect(&runner)?;
        Self::assemble(settings, root, compose)
    }

    /// Test seam: skips compose detection so no container tooling is needed.
    #[cfg(test)]
    pub(crate) fn with_compose(
        settings: Settings,
        root: &Path,
        compose: ComposeTool,
    ) -> Result<Self> {
        Self::assemble(settings, root, compose)
    }

    fn assemble(settings: Settings, root: &Path, compose: ComposeTool) -> Result<Self> {
        let workspace = Workspace::new(root, settings.state_file.as_deref());
        let runner = CommandRunner::new();
        let ctx = RunContext::generate()?;
        let validator = Validator::new(settings.allow_insecure_http, PROBE_TIMEOUT);
        let patterns = match (&settings.transient_patterns, &settings.fatal_patterns) {
            (None, None) => EvidencePatterns::defaults(),
            (transient, fatal) => EvidencePatterns::from_lists(
                transient.as_deref().unwrap_or_default(),
                fatal.as_deref().unwrap_or_default(),
            )?,
        };

        let interrupted = Arc::new(AtomicBool::new(false));
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&interrupted))
                .map_err(|source| error::SignalSnafu.into_error(source))?;
        }

        let state_store = StateStore::new(workspace.state_file.clone());
        let manifest = ManifestWriter::new(workspace.manifest_file.clone());

        Ok(Self {
            settings,
            workspace,
            ctx,
            runner,
            compose,
            validator,
            patterns,
            reporter: LogReporter,
            state_store,
            manifest,
            state: None,
            current_step: None,
            interrupted,
        })
    }

    /// Runs the whole pipeline and returns the process exit code.
    pub(crate) fn run(&mut self) -> i32 {
        let outcome = self.execute();

        match outcome {
            Ok(()) => {
                self.manifest.finalize("success", None);
                self.cleanup_runtime();
                0
            }
            Err(e) => {
                let message = e.to_string();
                let (status, status_tag) = if matches!(e, Error::Interrupted) {
                    info!("Operation cancelled by user");
                    (RunStatus::Aborted, "aborted")
                } else {
                    error!("[{:?}] {}", e.kind(), message);
                    (RunStatus::Failed, "failed")
                };

                let failed_step = self
                    .current_step
                    .clone()
                    .unwrap_or_else(|| "run".to_string());
                if let Some(state) = self.state.as_mut() {
                    let _ = self
                        .state_store
                        .mark_step_failed(state, &failed_step, &message);
                    let _ = self.state_store.mark_status(state, status, Some(&message));
                }
                self.manifest.finalize(status_tag, Some(&message));

                if self.settings.resume {
                    warn!(
                        "Preserving runtime artifacts and containers for resume mode. \
                         Run again with --resume to continue from the last completed step."
                    );
                } else {
                    self.cleanup_runtime();
                }
                1
            }
        }
    }

    fn execute(&mut self) -> Result<()> {
        info!("Starting odoo-upgrader run {}...", self.ctx.run_id);

        let target = self.settings.target_version;
        ensure!(
            target.is_supported(),
            error::UnsupportedTargetSnafu {
                version: target.to_string(),
                supported: supported_versions(),
            }
        );

        let resumed = self.initialize_state()?;
        let metadata = self.manifest_metadata();
        let run_id = self.ctx.run_id.clone();
        self.manifest.start_run(&run_id, metadata);
        self.manifest
            .set_versions(None, Some(&target.to_string()), None);

        self.run_step("validate_docker_environment", true, |u| {
            u.docker().validate_environment()
        })?;
        self.run_step("validate_source_accessibility", true, |u| {
            info!("Validating source: {}", u.settings.source);
            u.validator.validate_source_accessibility(
                &u.settings.source,
                u.settings.extra_addons.as_deref(),
                &u.settings.target_version,
            )
        })?;

        let mut database_restored = false;
        let mut current_version = String::new();
        if self.settings.resume {
            if let Some(state) = &self.state {
                database_restored = state.get_bool("database_restored");
                current_version = state.current_version.clone().unwrap_or_default();
            }
        }
        let skip_restore = resumed && database_restored;

        if skip_restore {
            info!("Skipping environment preparation due to resume state.");
        } else {
            self.run_step("prepare_environment", true, |u| u.prepare_environment())?;
            self.run_step("process_extra_addons", true, |u| u.process_extra_addons())?;
        }

        // The database stack is brought up on every run, resumed or not.
        self.run_step("create_db_compose_file", false, |u| {
            u.docker()
                .write_db_compose(&u.ctx, &u.settings.postgres_version)
        })?;
        self.run_step("start_db_container", false, |u| u.docker().start_db(&u.ctx))?;
        self.run_step("wait_for_db", false, |u| u.docker().wait_for_db(&u.ctx))?;

        if skip_restore {
            info!(
                "Resuming from restored database state at version: {}",
                if current_version.is_empty() {
                    "<unknown>"
                } else {
                    current_version.as_str()
                }
            );
            if current_version.is_empty() {
                current_version = self
                    .run_step("detect_current_version", false, |u| {
                        u.database().probe_version()
                    })?
                    .unwrap_or_default();
                if !current_version.is_empty() {
                    self.set_current_version(&current_version)?;
                }
            }
        } else {
            let local_source = match self.run_step("download_source", true, |u| {
                u.downloader().fetch_source(
                    &u.settings.source,
                    &u.workspace.source_dir,
                    u.settings.source_sha256.as_deref(),
                )
            })? {
                Some(path) => path,
                // Skipped on resume: the path was recorded by the earlier run.
                None => self.stored_path("local_source_path")?,
            };
            self.set_value("local_source_path", serde_json::json!(local_source))?;

            let file_type = match self.run_step("process_source", true, |u| {
                u.process_source(&local_source)
            })? {
                Some(file_type) => file_type,
                None => self.stored_file_type()?,
            };
            self.set_value("source_file_type", serde_json::json!(file_type.as_str()))?;

            self.run_step("restore_database", true, |u| {
                u.database().restore(
                    file_type,
                    &u.workspace.source_dir,
                    &u.workspace.filestore_dir,
                )
            })?;
            self.set_value("database_restored", serde_json::json!(true))?;

            if let Some(version) = self.run_step("detect_current_version", true, |u| {
                u.database().probe_version()
            })? {
                current_version = version;
            }
            if !current_version.is_empty() {
                self.set_current_version(&current_version)?;
            }
        }

        ensure!(!current_version.is_empty(), error::VersionUndetectedSnafu);
        info!("Current database version: {}", current_version);
        self.manifest.set_versions(
            Some(&current_version),
            Some(&target.to_string()),
            Some(&current_version),
        );

        let current = parse_lenient(&current_version);
        ensure!(
            current.major >= *SUPPORTED_MAJORS.start(),
            error::SourceBelowFloorSnafu {
                version: current_version.clone(),
            }
        );

        let mut seen_majors: HashSet<u32> = HashSet::new();
        loop {
            self.check_interrupted()?;

            let current = parse_lenient(&current_version);
            ensure!(
                !seen_majors.contains(&current.major),
                error::UpgradeLoopDetectedSnafu {
                    version: current_version.clone(),
                }
            );
            seen_majors.insert(current.major);

            if current.major == target.major {
                info!("Target version reached!");
                break;
            }
            if current.major > target.major {
                warn!("Current version is already higher than target.");
                break;
            }

            let next = current.next_major();
            ensure!(
                next.is_supported(),
                error::NoUpgradePathSnafu {
                    current: current_version.clone(),
                    target: target.to_string(),
                }
            );

            let step_name = format!("upgrade_to_{}", next);
            self.run_step(&step_name, true, |u| u.run_upgrade_step(&next))?;

            let detect_name = format!("detect_current_version_{}", next);
            let new_version = match self
                .run_step(&detect_name, true, |u| u.database().probe_version())?
            {
                Some(version) => version,
                None => self
                    .state
                    .as_ref()
                    .and_then(|s| s.current_version.clone())
                    .unwrap_or_default(),
            };
            ensure!(
                !new_version.is_empty(),
                error::VersionUndetectedAfterStepSnafu
            );

            let new = parse_lenient(&new_version);
            ensure!(
                new.major > current.major,
                error::UpgradeNoProgressSnafu {
                    version: new_version.clone(),
                    target: next.to_string(),
                }
            );

            current_version = new_version;
            self.set_current_version(&current_version)?;
            info!("Database is now at version: {}", current_version);
            self.manifest
                .set_versions(None, Some(&target.to_string()), Some(&current_version));
        }

        self.run_step("finalize_package", true, |u| {
            u.database()
                .finalize_package(&u.workspace.output_dir, &u.workspace.filestore_dir)
                .map(|_| ())
        })?;
        self.run_step("cleanup_artifacts", true, |u| {
            u.cleanup_artifacts();
            Ok(())
        })?;

        if let Some(state) = self.state.as_mut() {
            self.state_store
                .mark_status(state, RunStatus::Success, None)?;
        }

        let package = self.workspace.upgraded_package();
        if package.exists() {
            self.manifest
                .add_artifact("upgraded_zip", &package.to_string_lossy());
        }
        self.manifest
            .add_artifact("odoo_log", &self.workspace.odoo_log.to_string_lossy());
        Ok(())
    }

    /// The checkpoint wrapper. Returns `Ok(None)` when the step was skipped
    /// because a resumed state already lists it as completed.
    pub(crate) fn run_step<T>(
        &mut self,
        name: &str,
        skip_when_completed: bool,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        self.check_interrupted()?;

        if self.settings.resume && skip_when_completed {
            let completed = self
                .state
                .as_ref()
                .map(|s| s.is_step_completed(name))
                .unwrap_or(false);
            if completed {
                info!("Skipping completed step from state: {}", name);
                self.manifest.step_started(name);
                self.manifest.step_finished(name, "skipped", None);
                return Ok(None);
            }
        }

        if let Some(state) = self.state.as_mut() {
            self.state_store.mark_step_started(state, name)?;
        }
        self.manifest.step_started(name);
        self.current_step = Some(name.to_string());

        match body(self) {
            Ok(value) => {
                if let Some(state) = self.state.as_mut() {
                    self.state_store.mark_step_completed(state, name)?;
                }
                self.manifest.step_finished(name, "success", None);
                self.current_step = None;
                Ok(Some(value))
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(state) = self.state.as_mut() {
                    let _ = self.state_store.mark_step_failed(state, name, &message);
                }
                self.manifest.step_finished(name, "failed", Some(&message));
                Err(e)
            }
        }
    }

    pub(crate) fn initialize_state(&mut self) -> Result<bool> {
        filesystem::create_dir_all(&self.workspace.output_dir)?;
        let metadata = self.resume_metadata();
        let (state, resumed) =
            self.state_store
                .initialize(metadata, &self.ctx, self.settings.resume)?;

        if resumed {
            // Reuse the original run's containers and credentials.
            self.ctx = state.run_context.clone();
            info!(
                "Resuming previous run '{}' at step '{}'.",
                self.ctx.run_id,
                state.current_step.as_deref().unwrap_or("<none>")
            );
        } else {
            info!(
                "Run state initialized at {}",
                self.state_store.path().display()
            );
        }

        self.state = Some(state);
        Ok(resumed)
    }

    fn resume_metadata(&self) -> ResumeMetadata {
        ResumeMetadata {
            source: self.settings.source.clone(),
            target_version: self.settings.target_version.to_string(),
            extra_addons: self.settings.extra_addons.clone(),
            source_sha256: self.settings.source_sha256.clone(),
            extra_addons_sha256: self.settings.extra_addons_sha256.clone(),
        }
    }

    fn manifest_metadata(&self) -> BTreeMap<String, serde_json::Value> {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "source".to_string(),
            serde_json::json!(self.settings.source),
        );
        metadata.insert(
            "target_version".to_string(),
            serde_json::json!(self.settings.target_version.to_string()),
        );
        metadata.insert(
            "extra_addons".to_string(),
            serde_json::json!(self.settings.extra_addons),
        );
        metadata.insert(
            "source_sha256".to_string(),
            serde_json::json!(self.settings.source_sha256),
        );
        metadata.insert(
            "extra_addons_sha256".to_string(),
            serde_json::json!(self.settings.extra_addons_sha256),
        );
        metadata.insert(
            "resume_enabled".to_string(),
            serde_json::json!(self.settings.resume),
        );
        metadata.insert(
            "state_file".to_string(),
            serde_json::json!(if self.settings.resume {
                Some(self.state_store.path().to_string_lossy().into_owned())
            } else {
                None
            }),
        );
        metadata
    }

    fn docker(&self) -> DockerRuntime<'_> {
        DockerRuntime::new(
            &self.runner,
            self.compose.clone(),
            self.workspace.root.clone(),
        )
    }

    fn database(&self) -> DatabaseService<'_> {
        DatabaseService::new(&self.runner, &self.ctx)
    }

    fn downloader(&self) -> Downloader<'_> {
        Downloader::new(
            &self.validator,
            &self.reporter,
            self.settings.download_timeout,
            self.settings.retry_count,
            self.settings.retry_backoff,
        )
    }

    fn prepare_environment(&self) -> Result<()> {
        info!("Preparing environment directories...");
        filesystem::cleanup_dir(&self.workspace.source_dir);
        filesystem::cleanup_dir(&self.workspace.output_dir);

        for dir in [
            &self.workspace.source_dir,
            &self.workspace.output_dir,
            &self.workspace.filestore_dir,
            &self.workspace.custom_addons_dir,
        ] {
            filesystem::create_dir_all(dir)?;
            filesystem::set_permissions(dir, DIR_MODE);
        }
        Ok(())
    }

    /// Downloads/copies/extracts the custom addons bundle and normalises its
    /// layout so every module sits in its own child directory.
    fn process_extra_addons(&mut self) -> Result<()> {
        let extra_addons = match self.settings.extra_addons.clone() {
            Some(location) => location,
            None => return Ok(()),
        };

        info!("Processing custom addons...");
        let addons_dir = self.workspace.custom_addons_dir.clone();

        if validation::is_url(&extra_addons) {
            let zip_path = self.workspace.source_dir.join("addons.zip");
            self.downloader().download_file(
                &extra_addons,
                &zip_path,
                "Downloading extra addons...",
                self.settings.extra_addons_sha256.as_deref(),
            )?;
            archive::safe_extract_zip(&zip_path, &addons_dir)?;
            std::fs::remove_file(&zip_path)
                .map_err(|source| error::RemoveFileSnafu { path: &zip_path }.into_error(source))?;
        } else if Path::new(&extra_addons).is_file() {
            archive::safe_extract_zip(Path::new(&extra_addons), &addons_dir)?;
        } else if Path::new(&extra_addons).is_dir() {
            filesystem::copy_tree(Path::new(&extra_addons), &addons_dir)?;
        } else {
            return error::InvalidAddonsSourceSnafu.fail();
        }

        flatten_single_wrapper(&addons_dir)?;
        promote_flat_module(&addons_dir)?;

        self.validator
            .validate_addons_tree(&addons_dir, &self.settings.target_version)?;

        let requirements = addons_dir.join("requirements.txt");
        if !requirements.exists() {
            std::fs::write(&requirements, "")
                .map_err(|source| error::WriteFileSnafu { path: &requirements }.into_error(source))?;
        } else if requirements.metadata().map(|m| m.len() == 0).unwrap_or(false) {
            warn!("Empty requirements.txt found in custom addons.");
        }

        filesystem::set_tree_permissions(&addons_dir);
        info!("Custom addons prepared.");
        Ok(())
    }

    /// Classifies and stages the local source file.
    fn process_source(&self, local_source: &Path) -> Result<SourceFileType> {
        let extension = local_source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "zip" => {
                info!("Extracting ZIP file...");
                archive::safe_extract_zip(local_source, &self.workspace.source_dir)?;
                Ok(SourceFileType::Archive)
            }
            "dump" => {
                info!("Processing DUMP file...");
                let dest = self.workspace.source_dir.join("database.dump");
                filesystem::create_dir_all(&self.workspace.source_dir)?;
                std::fs::copy(local_source, &dest).map_err(|source| {
                    error::CopySnafu {
                        from: local_source,
                        to: &dest,
                    }
                    .into_error(source)
                })?;
                Ok(SourceFileType::Dump)
            }
            _ => error::UnsupportedSourceFileSnafu.fail(),
        }
    }

    fn run_upgrade_step(&self, next: &OdooVersion) -> Result<()> {
        let driver = UpgradeStepDriver {
            runner: &self.runner,
            compose: &self.compose,
            ctx: &self.ctx,
            workspace: &self.workspace,
            patterns: &self.patterns,
            include_custom_addons: self.settings.extra_addons.is_some(),
            container_user: self.settings.container_user.as_deref(),
            retry_count: self.settings.retry_count,
            retry_backoff: self.settings.retry_backoff,
            step_timeout: self.settings.step_timeout,
            verbose: self.settings.verbose,
        };

        match driver.run_step(next)? {
            StepOutcome::Success => Ok(()),
            StepOutcome::Failed(FailureClass::Fatal) => error::FatalMigrationStepSnafu {
                version: next.to_string(),
            }
            .fail(),
            StepOutcome::Failed(FailureClass::Transient) => {
                error::TransientMigrationExhaustedSnafu {
                    version: next.to_string(),
                    attempts: self.settings.retry_count + 1,
                }
                .fail()
            }
        }
    }

    fn cleanup_artifacts(&self) {
        info!("Cleaning up artifacts...");
        filesystem::cleanup_dir(&self.workspace.source_dir);
        filesystem::cleanup_dir(&self.workspace.filestore_dir);
        filesystem::cleanup_dir(&self.workspace.custom_addons_dir);
    }

    fn cleanup_runtime(&self) {
        self.docker().cleanup(&self.ctx);
    }

    fn check_interrupted(&self) -> Result<()> {
        ensure!(
            !self.interrupted.load(Ordering::Relaxed),
            error::InterruptedSnafu
        );
        Ok(())
    }

    fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        if let Some(state) = self.state.as_mut() {
            self.state_store.set_value(state, key, value)?;
        }
        Ok(())
    }

    fn set_current_version(&mut self, version: &str) -> Result<()> {
        if let Some(state) = self.state.as_mut() {
            self.state_store.set_current_version(state, version)?;
        }
        Ok(())
    }

    fn stored_path(&self, key: &str) -> Result<PathBuf> {
        self.state
            .as_ref()
            .and_then(|s| s.get_str(key))
            .map(PathBuf::from)
            .ok_or_else(|| error::ResumeDataMissingSnafu { key }.build())
    }

    fn stored_file_type(&self) -> Result<SourceFileType> {
        self.state
            .as_ref()
            .and_then(|s| s.get_str("source_file_type"))
            .and_then(SourceFileType::from_tag)
            .ok_or_else(|| {
                error::ResumeDataMissingSnafu {
                    key: "source_file_type",
                }
                .build()
            })
    }
}

#[cfg(test)]
impl Upgrader {
    pub(crate) fn state_for_tests(&self) -> Option<&PersistentState> {
        self.state.as_ref()
    }

    pub(crate) fn manifest_for_tests(&self) -> &crate::manifest::RunManifest {
        self.manifest.manifest()
    }

    pub(crate) fn trigger_interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }
}

/// Version strings straight out of the database may be anything; treat the
/// unparseable ones as an ancient release so the floor check reports them.
fn parse_lenient(version: &str) -> OdooVersion {
    version
        .parse()
        .unwrap_or_else(|_| OdooVersion::new(0, 0))
}

/// Single-entry wrapper directories (a zip of `my-addons/...`) are
/// flattened so the modules sit at the root of the addons tree.
fn flatten_single_wrapper(addons_dir: &Path) -> Result<()> {
    let visible: Vec<PathBuf> = list_visible(addons_dir)?;
    if visible.len() != 1 {
        return Ok(());
    }
    let single = &visible[0];
    if !single.is_dir() || validation::is_module_dir(single) {
        return Ok(());
    }

    info!(
        "Detected wrapper directory '{}'. Flattening structure...",
        single.file_name().unwrap_or_default().to_string_lossy()
    );
    for entry in std::fs::read_dir(single)
        .map_err(|source| error::ReadFileSnafu { path: single }.into_error(source))?
    {
        let entry = entry
            .map_err(|source| error::ReadFileSnafu { path: single }.into_error(source))?;
        let target = addons_dir.join(entry.file_name());
        if !target.exists() {
            std::fs::rename(entry.path(), &target).map_err(|source| {
                error::CopySnafu {
                    from: entry.path(),
                    to: &target,
                }
                .into_error(source)
            })?;
        }
    }
    // Leftovers (name collisions) keep the wrapper alive; that is fine.
    let _ = std::fs::remove_dir(single);
    Ok(())
}

/// A flat layout (manifest at the addons root) is promoted into a synthetic
/// child module so the tree always has the directory-of-modules shape.
/// Everything except the requirements file moves.
fn promote_flat_module(addons_dir: &Path) -> Result<()> {
    if !validation::is_module_dir(addons_dir) {
        return Ok(());
    }

    info!("Detected flat addon structure. Reorganizing...");
    let module_dir = addons_dir.join("downloaded_module");
    filesystem::create_dir_all(&module_dir)?;

    for entry in std::fs::read_dir(addons_dir)
        .map_err(|source| error::ReadFileSnafu { path: addons_dir }.into_error(source))?
    {
        let entry = entry
            .map_err(|source| error::ReadFileSnafu { path: addons_dir }.into_error(source))?;
        let name = entry.file_name();
        if name == "requirements.txt" || entry.path() == module_dir {
            continue;
        }
        let target = module_dir.join(&name);
        std::fs::rename(entry.path(), &target).map_err(|source| {
            error::CopySnafu {
                from: entry.path(),
                to: &target,
            }
            .into_error(source)
        })?;
    }
    Ok(())
}

fn list_visible(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| error::ReadFileSnafu { path: dir }.into_error(source))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| !n.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lenient_parse_falls_back_to_zero() {
        assert_eq!(parse_lenient("15.0.1.3"), OdooVersion::new(15, 0));
        assert_eq!(parse_lenient("garbage"), OdooVersion::new(0, 0));
        assert_eq!(parse_lenient(""), OdooVersion::new(0, 0));
    }

    #[test]
    fn wrapper_directories_are_flattened() {
        let dir = TempDir::new().unwrap();
        let addons = dir.path().join("custom_addons");
        let wrapper = addons.join("my-addons-main");
        fs::create_dir_all(wrapper.join("mod_a")).unwrap();
        fs::write(wrapper.join("mod_a/__manifest__.py"), "{'name': 'A'}").unwrap();
        fs::write(wrapper.join("requirements.txt"), "").unwrap();

        flatten_single_wrapper(&addons).unwrap();

        assert!(addons.join("mod_a/__manifest__.py").is_file());
        assert!(addons.join("requirements.txt").is_file());
        assert!(!addons.join("my-addons-main").exists());
    }

    #[test]
    fn module_wrapper_is_not_flattened() {
        // A single directory that IS a module must stay as the module.
        let dir = TempDir::new().unwrap();
        let addons = dir.path().join("custom_addons");
        let module = addons.join("mod_solo");
        fs::create_dir_all(&module).unwrap();
        fs::write(module.join("__manifest__.py"), "{'name': 'Solo'}").unwrap();

        flatten_single_wrapper(&addons).unwrap();
        assert!(addons.join("mod_solo/__manifest__.py").is_file());
    }

    #[test]
    fn flat_layouts_are_promoted_into_a_child_module() {
        let dir = TempDir::new().unwrap();
        let addons = dir.path().join("custom_addons");
        fs::create_dir_all(addons.join("models")).unwrap();
        fs::write(addons.join("__manifest__.py"), "{'name': 'Flat'}").unwrap();
        fs::write(addons.join("models/thing.py"), "").unwrap();
        fs::write(addons.join("requirements.txt"), "requests\n").unwrap();

        promote_flat_module(&addons).unwrap();

        assert!(addons.join("downloaded_module/__manifest__.py").is_file());
        assert!(addons.join("downloaded_module/models/thing.py").is_file());
        // The requirements file stays at the root for the image build.
        assert!(addons.join("requirements.txt").is_file());
        assert!(!addons.join("__manifest__.py").exists());
    }

    #[test]
    fn normalised_trees_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let addons = dir.path().join("custom_addons");
        for module in ["mod_a", "mod_b"] {
            fs::create_dir_all(addons.join(module)).unwrap();
            fs::write(
                addons.join(module).join("__manifest__.py"),
                "{'name': 'X'}",
            )
            .unwrap();
        }

        flatten_single_wrapper(&addons).unwrap();
        promote_flat_module(&addons).unwrap();

        assert!(addons.join("mod_a/__manifest__.py").is_file());
        assert!(addons.join("mod_b/__manifest__.py").is_file());
        assert!(!addons.join("downloaded_module").exists());
    }
}
