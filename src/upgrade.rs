//! OpenUpgrade step execution.
//!
//! Each step builds a per-version runtime image (OpenUpgrade scripts plus any
//! custom addons baked in), launches it against the run's database through
//! compose, and watches the combined output line by line. Failures are
//! classified against configurable evidence patterns: only failures that
//! look like network or timing trouble are retried. Anything else is fatal,
//! because re-running a half-applied migration can corrupt the database.

use crate::command::{terminate, CommandRunner, Retry};
use crate::context::RunContext;
use crate::docker::{self, ComposeTool, DB_PASSWORD_ENV};
use crate::error::{self, Error, Result};
use crate::filesystem;
use crate::validation;
use crate::version::OdooVersion;
use crate::workspace::Workspace;
use duct::cmd;
use log::{debug, error, info, warn};
use regex::Regex;
use snafu::{IntoError, ResultExt};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub(crate) const OPENUPGRADE_REPO: &str = "https://github.com/OCA/OpenUpgrade.git";

/// Where the OpenUpgrade scripts land inside the migration image.
const OPENUPGRADE_MOUNT: &str = "/mnt/extra-addons";
/// Where custom addons land inside the migration image.
const ADDONS_MOUNT: &str = "/mnt/custom-addons";

/// Lines of combined output kept for failure classification and reporting.
const LOG_TAIL_LINES: usize = 40;
/// Time between SIGTERM and SIGKILL when a step exceeds its timeout.
const STREAM_GRACE: Duration = Duration::from_secs(10);
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Failures that look like infrastructure trouble rather than migration
/// trouble. These only matter when no fatal pattern matches as well.
pub(crate) const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)connection reset by peer",
    r"(?i)connection timed out",
    r"(?i)connection refused",
    r"(?i)temporary failure in name resolution",
    r"(?i)could not resolve host",
    r"(?i)network is unreachable",
    r"(?i)tls handshake timeout",
    r"(?i)i/o timeout",
    r"(?i)HTTP (?:500|502|503|504)",
    r"(?i)too many requests",
    r"(?i)status(?: code)? 429",
];

/// Evidence that the migration itself is broken. A retry cannot help and may
/// leave the database in a worse state.
pub(crate) const DEFAULT_FATAL_PATTERNS: &[&str] = &[
    r"(?i)invalid manifest",
    r"(?i)parse ?error",
    r"SyntaxError",
    r"psycopg2\.errors",
    r"(?i)duplicate key value",
    r"(?i)already exists",
    r"IntegrityError",
    r"ProgrammingError",
    r"OperationalError",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Success,
    Failed(FailureClass),
}

/// The transient/fatal evidence policy. The defaults track the failure modes
/// of the external migration tooling and can be replaced wholesale through
/// the config file.
#[derive(Debug)]
pub(crate) struct EvidencePatterns {
    transient: Vec<Regex>,
    fatal: Vec<Regex>,
}

impl EvidencePatterns {
    pub(crate) fn defaults() -> Self {
        Self::from_lists(
            &to_strings(DEFAULT_TRANSIENT_PATTERNS),
            &to_strings(DEFAULT_FATAL_PATTERNS),
        )
        .expect("default patterns compile")
    }

    pub(crate) fn from_lists(transient: &[String], fatal: &[String]) -> Result<Self> {
        Ok(Self {
            transient: compile(transient)?,
            fatal: compile(fatal)?,
        })
    }

    /// Transient iff any transient pattern matches and no fatal pattern
    /// does. Everything else, including evidence matching nothing at all,
    /// is fatal.
    pub(crate) fn classify(&self, evidence: &str) -> FailureClass {
        if self.fatal.iter().any(|p| p.is_match(evidence)) {
            return FailureClass::Fatal;
        }
        if self.transient.iter().any(|p| p.is_match(evidence)) {
            return FailureClass::Transient;
        }
        FailureClass::Fatal
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).context(error::InvalidEvidencePatternSnafu { pattern })
        })
        .collect()
}

fn to_strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|s| s.to_string()).collect()
}

pub(crate) struct UpgradeStepDriver<'a> {
    pub(crate) runner: &'a CommandRunner,
    pub(crate) compose: &'a ComposeTool,
    pub(crate) ctx: &'a RunContext,
    pub(crate) workspace: &'a Workspace,
    pub(crate) patterns: &'a EvidencePatterns,
    pub(crate) include_custom_addons: bool,
    pub(crate) container_user: Option<&'a str>,
    pub(crate) retry_count: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) step_timeout: Option<Duration>,
    pub(crate) verbose: bool,
}

impl<'a> UpgradeStepDriver<'a> {
    /// Runs one migration step towards `version`. `Ok(StepOutcome::Failed)`
    /// means the step itself failed; `Err` means the machinery around it
    /// (cache, rendering, spawning) did.
    pub(crate) fn run_step(&self, version: &OdooVersion) -> Result<StepOutcome> {
        info!("Preparing upgrade step to version {}", version);

        let cache_dir = self.ensure_cache(version)?;
        let cache_relpath = relative_posix(&cache_dir, &self.workspace.root);

        let addons_path_arg = if self.include_custom_addons {
            // Touching a timestamp defeats stale COPY layers from earlier runs.
            let stamp = self.workspace.custom_addons_dir.join(".build_timestamp");
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            fs::write(&stamp, now.to_string())
                .context(error::WriteFileSnafu { path: &stamp })?;

            discover_addons_paths(&self.workspace.custom_addons_dir)
                .into_iter()
                .map(|path| format!(",{}", path))
                .collect::<String>()
        } else {
            String::new()
        };

        let dockerfile = render_dockerfile(version, self.include_custom_addons, &cache_relpath);
        let dockerfile_path = self.workspace.root.join(docker::DOCKERFILE_NAME);
        fs::write(&dockerfile_path, dockerfile)
            .context(error::WriteFileSnafu { path: &dockerfile_path })?;

        let compose_manifest = render_upgrade_compose(self.ctx, &addons_path_arg, self.container_user);
        let compose_path = self.workspace.root.join(docker::UPGRADE_COMPOSE_FILE);
        fs::write(&compose_path, compose_manifest)
            .context(error::WriteFileSnafu { path: &compose_path })?;

        // A stale container with our name would make `up` fail.
        self.runner.run(
            &[
                "docker".to_string(),
                "rm".to_string(),
                "-f".to_string(),
                self.ctx.upgrade_container_name.clone(),
            ],
            false,
        )?;

        let up = self.compose.file_command(
            &compose_path,
            &["up", "--build", "--abort-on-container-exit"],
        );
        let envs = docker::password_env(self.ctx);
        let max_attempts = self.retry_count + 1;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                warn!(
                    "Retrying upgrade step to {} ({}/{}) after {:.1}s",
                    version,
                    attempt,
                    max_attempts,
                    self.retry_backoff.as_secs_f64()
                );
                sleep(self.retry_backoff);
            }

            info!(
                "Upgrading to {} (attempt {}/{})...",
                version, attempt, max_attempts
            );
            let log_offset = file_length(&self.workspace.odoo_log);
            let stream = stream_process(&up, &envs, self.step_timeout, self.verbose)?;

            let mut evidence = stream.tail.join("\n");
            evidence.push('\n');
            evidence.push_str(&read_log_delta(&self.workspace.odoo_log, log_offset));

            if stream.timed_out {
                error!(
                    "Upgrade step to {} exceeded its timeout of {:.0}s.",
                    version,
                    self.step_timeout.unwrap_or_default().as_secs_f64()
                );
                match self.handle_failed_attempt(version, &evidence, &stream.tail, attempt, max_attempts) {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }

            let compose_exit = stream.exit_code.unwrap_or(-1);
            if compose_exit != 0 {
                error!(
                    "Upgrade process returned non-zero exit code: {}",
                    compose_exit
                );
                match self.handle_failed_attempt(version, &evidence, &stream.tail, attempt, max_attempts) {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }

            // Compose reported success; confirm the container agreed.
            match self.inspect_exit_code()? {
                Some(0) => {
                    info!("Upgrade to {} successful.", version);
                    self.compose_down(&envs);
                    return Ok(StepOutcome::Success);
                }
                Some(code) => {
                    error!("Upgrade container exited with code {}", code);
                }
                None => {
                    error!("Could not inspect upgrade container exit code.");
                }
            }
            match self.handle_failed_attempt(version, &evidence, &stream.tail, attempt, max_attempts) {
                Some(outcome) => return Ok(outcome),
                None => continue,
            }
        }

        Ok(StepOutcome::Failed(FailureClass::Transient))
    }

    /// Classifies a failed attempt and decides between retrying (`None`) and
    /// giving up (`Some`). Container state is reset either way.
    fn handle_failed_attempt(
        &self,
        version: &OdooVersion,
        evidence: &str,
        tail: &[String],
        attempt: u32,
        max_attempts: u32,
    ) -> Option<StepOutcome> {
        if !tail.is_empty() {
            error!("Recent upgrade logs:\n{}", tail.join("\n"));
        }

        let envs = docker::password_env(self.ctx);
        self.compose_down(&envs);

        match self.patterns.classify(evidence) {
            FailureClass::Fatal => {
                error!(
                    "Upgrade step to {} failed with fatal evidence; not retrying.",
                    version
                );
                Some(StepOutcome::Failed(FailureClass::Fatal))
            }
            FailureClass::Transient if attempt < max_attempts => {
                warn!("Failure evidence looks transient; the step will be retried.");
                None
            }
            FailureClass::Transient => Some(StepOutcome::Failed(FailureClass::Transient)),
        }
    }

    fn compose_down(&self, envs: &[(String, String)]) {
        let down = self
            .compose
            .file_command(&self.workspace.root.join(docker::UPGRADE_COMPOSE_FILE), &["down"]);
        if let Err(e) = self.runner.run_with(&down, false, None, &Retry::none(), envs) {
            warn!("Could not reset upgrade stack: {}", e);
        }
    }

    fn inspect_exit_code(&self) -> Result<Option<i32>> {
        let output = self.runner.run(
            &[
                "docker".to_string(),
                "inspect".to_string(),
                self.ctx.upgrade_container_name.clone(),
                "--format={{.State.ExitCode}}".to_string(),
            ],
            false,
        )?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output.stdout.trim().parse::<i32>().ok())
    }

    /// Makes sure the OpenUpgrade scripts for `version` are cached locally.
    /// An entry only counts as ready when its requirements file exists;
    /// partial clones are removed and redone.
    pub(crate) fn ensure_cache(&self, version: &OdooVersion) -> Result<PathBuf> {
        let entry = self.workspace.cache_root.join(version.to_string());
        if entry.join("requirements.txt").is_file() {
            debug!(
                "Using cached OpenUpgrade source for {} at {}",
                version,
                entry.display()
            );
            return Ok(entry);
        }

        if entry.exists() {
            warn!(
                "Incomplete OpenUpgrade cache at {}; cloning again.",
                entry.display()
            );
            filesystem::cleanup_dir(&entry);
        }
        filesystem::create_dir_all(&self.workspace.cache_root)?;

        info!(
            "Caching OpenUpgrade source for {} at {}",
            version,
            entry.display()
        );
        let clone = vec![
            "git".to_string(),
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            "--branch".to_string(),
            version.to_string(),
            OPENUPGRADE_REPO.to_string(),
            entry.to_string_lossy().into_owned(),
        ];
        let retry = Retry::new(self.retry_count, self.retry_backoff);
        self.runner
            .run_with(&clone, true, None, &retry, &[])
            .map_err(|e| match e {
                Error::MissingTool { .. } => e,
                other => error::ScriptsCloneSnafu {
                    version: version.to_string(),
                    message: other.to_string(),
                }
                .build(),
            })?;

        if !entry.join("requirements.txt").is_file() {
            return error::ScriptsCloneSnafu {
                version: version.to_string(),
                message: "clone finished but the requirements file is missing".to_string(),
            }
            .fail();
        }
        Ok(entry)
    }
}

/// Result of streaming one compose invocation.
#[derive(Debug)]
pub(crate) struct StreamResult {
    pub(crate) exit_code: Option<i32>,
    pub(crate) timed_out: bool,
    pub(crate) tail: Vec<String>,
}

/// Runs `argv` with combined stdout/stderr, mirroring each line into the log
/// sink and keeping a bounded tail. The wall-clock timeout is enforced on
/// the streaming loop; on expiry the child gets SIGTERM, a grace period,
/// then SIGKILL.
pub(crate) fn stream_process(
    argv: &[String],
    envs: &[(String, String)],
    timeout: Option<Duration>,
    verbose: bool,
) -> Result<StreamResult> {
    let (program, args) = argv.split_first().ok_or_else(|| error::EmptyCommandSnafu.build())?;
    let mut expression = cmd(program.as_str(), args).stderr_to_stdout().unchecked();
    for (key, value) in envs {
        expression = expression.env(key, value);
    }

    let reader = expression.reader().map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            error::MissingToolSnafu {
                tool: program.as_str(),
            }
            .build()
        } else {
            error::CommandSpawnSnafu {
                command: argv.join(" "),
            }
            .into_error(source)
        }
    })?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL_LINES);
    let mut timed_out = false;

    let mut buffered = BufReader::new(&reader);
    let mut line = String::new();
    loop {
        line.clear();
        let read = match buffered.read_line(&mut line) {
            Ok(n) => n,
            // A killed child surfaces as a read error; treat it as EOF.
            Err(_) => 0,
        };
        if read == 0 {
            break;
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                terminate(&reader.pids());
                let grace_deadline = Instant::now() + STREAM_GRACE;
                while Instant::now() < grace_deadline {
                    if matches!(reader.try_wait(), Ok(Some(_))) {
                        break;
                    }
                    sleep(EXIT_POLL);
                }
                let _ = reader.kill();
                break;
            }
        }

        let cleaned = line.trim_end();
        if cleaned.is_empty() {
            continue;
        }
        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(cleaned.to_string());
        if verbose {
            info!("{}", cleaned);
        } else {
            debug!("{}", cleaned);
        }
    }

    let exit_code = if timed_out {
        None
    } else {
        loop {
            match reader.try_wait() {
                Ok(Some(output)) => break output.status.code(),
                Ok(None) => sleep(EXIT_POLL),
                Err(_) => break None,
            }
        }
    };

    Ok(StreamResult {
        exit_code,
        timed_out,
        tail: tail.into_iter().collect(),
    })
}

/// Maps every addons sub-root in the normalised tree to its container-side
/// path. The result is sorted and de-duplicated.
pub(crate) fn discover_addons_paths(custom_addons_dir: &Path) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for module_dir in validation::discover_module_dirs(custom_addons_dir) {
        let sub_root = module_dir
            .parent()
            .filter(|parent| parent.starts_with(custom_addons_dir))
            .unwrap_or(custom_addons_dir);
        let relative = sub_root
            .strip_prefix(custom_addons_dir)
            .unwrap_or_else(|_| Path::new(""));
        if relative.as_os_str().is_empty() {
            paths.insert(ADDONS_MOUNT.to_string());
        } else {
            paths.insert(format!(
                "{}/{}",
                ADDONS_MOUNT,
                relative.to_string_lossy().replace('\\', "/")
            ));
        }
    }
    paths.into_iter().collect()
}

/// Renders the per-version migration image. The OpenUpgrade cache is copied
/// in and its requirements installed; custom addons follow the same pattern
/// when present.
pub(crate) fn render_dockerfile(
    version: &OdooVersion,
    include_custom_addons: bool,
    cache_relpath: &str,
) -> String {
    let custom_addons_section = if include_custom_addons {
        format!(
            r#"RUN mkdir -p {mount}
COPY --chown=odoo:odoo ./output/custom_addons/requirements.txt {mount}/requirements.txt
RUN pip3 install --no-cache-dir -r {mount}/requirements.txt
COPY --chown=odoo:odoo ./output/custom_addons/ {mount}/
"#,
            mount = ADDONS_MOUNT
        )
    } else {
        String::new()
    };

    format!(
        r#"FROM odoo:{version}
USER root
RUN apt-get update && apt-get install -y git && rm -rf /var/lib/apt/lists/*
COPY --chown=odoo:odoo ./{cache_relpath}/ {openupgrade_mount}/
RUN pip3 install --no-cache-dir -r {openupgrade_mount}/requirements.txt

{custom_addons_section}
USER odoo
"#,
        version = version,
        cache_relpath = cache_relpath,
        openupgrade_mount = OPENUPGRADE_MOUNT,
        custom_addons_section = custom_addons_section,
    )
}

/// Renders the migration container manifest: joined to the run's network,
/// pointed at the run's database, with the workspace output and filestore
/// bind-mounted. The password is a compose variable, never a literal.
pub(crate) fn render_upgrade_compose(
    ctx: &RunContext,
    addons_path_arg: &str,
    container_user: Option<&str>,
) -> String {
    let user_line = match container_user {
        Some(user) => format!("    user: \"{}\"\n", user),
        None => String::new(),
    };

    format!(
        r#"services:
  odoo-openupgrade:
    image: odoo-openupgrade
    build:
      context: .
      dockerfile: Dockerfile
    container_name: {upgrade_container}
{user_line}    environment:
      - HOST={db_container}
      - POSTGRES_USER={db_user}
      - POSTGRES_PASSWORD=${{{password_env}}}
    networks:
      - {network}
    volumes:
      - ./output/filestore:/var/lib/odoo/filestore/{target_db}
      - ./output:/var/log/odoo
    restart: "no"
    entrypoint: /entrypoint.sh
    command: >
      odoo -d {target_db}
      --upgrade-path={openupgrade_mount}/openupgrade_scripts/scripts
      --addons-path={openupgrade_mount}{addons_path_arg}
      --update all
      --stop-after-init
      --load=base,web,openupgrade_framework
      --log-level=info
      --logfile=/var/log/odoo/odoo.log
networks:
  {network}:
    external: true
    name: {network}
"#,
        upgrade_container = ctx.upgrade_container_name,
        user_line = user_line,
        db_container = ctx.db_container_name,
        db_user = ctx.db_user,
        password_env = DB_PASSWORD_ENV,
        network = ctx.network_name,
        target_db = ctx.target_db_name,
        openupgrade_mount = OPENUPGRADE_MOUNT,
        addons_path_arg = addons_path_arg,
    )
}

/// `path` rendered relative to `base` with forward slashes, for COPY
/// instructions in the Dockerfile.
fn relative_posix(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn file_length(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Reads everything appended to the on-disk log since `offset`, so each
/// attempt is judged on its own output.
pub(crate) fn read_log_delta(path: &Path, offset: u64) -> String {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return String::new(),
    };
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return String::new();
    }
    let mut delta = String::new();
    match file.read_to_string(&mut delta) {
        Ok(_) => delta,
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> RunContext {
        RunContext::generate().unwrap()
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn transient_evidence_is_transient() {
        let patterns = EvidencePatterns::defaults();
        let evidence = "urllib3 error: Connection reset by peer while fetching wheel";
        assert_eq!(patterns.classify(evidence), FailureClass::Transient);
    }

    #[test]
    fn fatal_markers_override_transient_ones() {
        let patterns = EvidencePatterns::defaults();
        let evidence = "Connection reset by peer\n\
                        psycopg2.errors.DuplicateTable: relation \"res_partner\" already exists";
        assert_eq!(patterns.classify(evidence), FailureClass::Fatal);
    }

    #[test]
    fn unmatched_evidence_defaults_to_fatal() {
        let patterns = EvidencePatterns::defaults();
        assert_eq!(
            patterns.classify("something completely different"),
            FailureClass::Fatal
        );
    }

    #[test]
    fn custom_pattern_lists_replace_the_defaults() {
        let patterns = EvidencePatterns::from_lists(
            &["flaky-proxy".to_string()],
            &["broken-module".to_string()],
        )
        .unwrap();
        assert_eq!(
            patterns.classify("flaky-proxy did it again"),
            FailureClass::Transient
        );
        assert_eq!(
            patterns.classify("flaky-proxy hit broken-module"),
            FailureClass::Fatal
        );
        // Defaults no longer apply once replaced.
        assert_eq!(
            patterns.classify("connection reset by peer"),
            FailureClass::Fatal
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err =
            EvidencePatterns::from_lists(&["(unclosed".to_string()], &[]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::InvalidEvidencePattern { .. }
        ));
    }

    #[test]
    fn dockerfile_pins_the_step_version() {
        let version: OdooVersion = "15.0".parse().unwrap();
        let rendered = render_dockerfile(&version, false, "output/.cache/openupgrade/15.0");
        assert!(rendered.contains("FROM odoo:15.0"));
        assert!(rendered.contains("COPY --chown=odoo:odoo ./output/.cache/openupgrade/15.0/ /mnt/extra-addons/"));
        assert!(!rendered.contains("custom_addons"));
    }

    #[test]
    fn dockerfile_installs_custom_addons_requirements() {
        let version: OdooVersion = "16.0".parse().unwrap();
        let rendered = render_dockerfile(&version, true, "output/.cache/openupgrade/16.0");
        assert!(rendered.contains("COPY --chown=odoo:odoo ./output/custom_addons/requirements.txt"));
        assert!(rendered.contains("pip3 install --no-cache-dir -r /mnt/custom-addons/requirements.txt"));
    }

    #[test]
    fn upgrade_compose_references_run_scoped_objects() {
        let ctx = context();
        let rendered = render_upgrade_compose(&ctx, ",/mnt/custom-addons", None);
        assert!(rendered.contains(&ctx.upgrade_container_name));
        assert!(rendered.contains(&format!("HOST={}", ctx.db_container_name)));
        assert!(rendered.contains(&ctx.network_name));
        assert!(rendered.contains("--addons-path=/mnt/extra-addons,/mnt/custom-addons"));
        assert!(rendered.contains("--stop-after-init"));
        assert!(rendered.contains("--update all"));
        assert!(!rendered.contains("user:"));
    }

    #[test]
    fn upgrade_compose_never_embeds_the_password() {
        let ctx = context();
        let rendered = render_upgrade_compose(&ctx, "", None);
        assert!(!rendered.contains(&ctx.db_password));
        assert!(rendered.contains("POSTGRES_PASSWORD=${UPGRADER_DB_PASSWORD}"));
    }

    #[test]
    fn upgrade_compose_applies_user_namespacing() {
        let ctx = context();
        let rendered = render_upgrade_compose(&ctx, "", Some("1000:1000"));
        assert!(rendered.contains("user: \"1000:1000\""));
    }

    #[test]
    fn addons_paths_cover_nested_sub_roots() {
        let dir = TempDir::new().unwrap();
        let addons = dir.path();
        for module in ["mod_a", "mod_b"] {
            std::fs::create_dir_all(addons.join(module)).unwrap();
            std::fs::write(
                addons.join(module).join("__manifest__.py"),
                "{'name': 'X'}",
            )
            .unwrap();
        }
        std::fs::create_dir_all(addons.join("vendor/extra/mod_c")).unwrap();
        std::fs::write(
            addons.join("vendor/extra/mod_c/__manifest__.py"),
            "{'name': 'C'}",
        )
        .unwrap();

        let paths = discover_addons_paths(addons);
        assert_eq!(
            paths,
            vec![
                "/mnt/custom-addons".to_string(),
                "/mnt/custom-addons/vendor/extra".to_string(),
            ]
        );
    }

    #[test]
    fn stream_keeps_a_bounded_tail_and_exit_code() {
        let result = stream_process(
            &argv(&[
                "sh",
                "-c",
                "for i in $(seq 1 60); do echo line$i; done; exit 3",
            ]),
            &[],
            None,
            false,
        )
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
        assert_eq!(result.tail.len(), LOG_TAIL_LINES);
        assert_eq!(result.tail.first().map(String::as_str), Some("line21"));
        assert_eq!(result.tail.last().map(String::as_str), Some("line60"));
    }

    #[test]
    fn stream_times_out_chatty_children() {
        let started = Instant::now();
        let result = stream_process(
            &argv(&["sh", "-c", "while true; do echo tick; sleep 0.1; done"]),
            &[],
            Some(Duration::from_millis(400)),
            false,
        )
        .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn log_delta_reads_from_the_attempt_offset() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("odoo.log");
        std::fs::write(&log, "old attempt\n").unwrap();
        let offset = std::fs::metadata(&log).unwrap().len();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .unwrap();
        use std::io::Write as _;
        writeln!(file, "new evidence").unwrap();

        assert_eq!(read_log_delta(&log, offset), "new evidence\n");
        assert_eq!(read_log_delta(&log, 0), "old attempt\nnew evidence\n");
        assert_eq!(read_log_delta(dir.path().join("missing.log").as_path(), 0), "");
    }

    #[test]
    fn cache_entry_requires_requirements_file() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path(), None);
        let runner = CommandRunner::new();
        let compose = ComposeTool::fake(&["docker", "compose"]);
        let ctx = context();
        let patterns = EvidencePatterns::defaults();
        let driver = UpgradeStepDriver {
            runner: &runner,
            compose: &compose,
            ctx: &ctx,
            workspace: &ws,
            patterns: &patterns,
            include_custom_addons: false,
            container_user: None,
            retry_count: 0,
            retry_backoff: Duration::from_millis(1),
            step_timeout: None,
            verbose: false,
        };

        let version: OdooVersion = "15.0".parse().unwrap();
        let entry = ws.cache_root.join("15.0");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("requirements.txt"), "openupgradelib\n").unwrap();

        // Ready entry: no clone is attempted, the path comes straight back.
        assert_eq!(driver.ensure_cache(&version).unwrap(), entry);
    }
}
