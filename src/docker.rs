//! Container runtime driver: compose tool detection, database stack
//! rendering and lifecycle, readiness probing, and teardown.
//!
//! Rendered manifests never contain the database password; they reference an
//! environment variable that is set only on the compose child processes.

use crate::command::{CommandRunner, Retry};
use crate::context::RunContext;
use crate::error::{self, Result};
use log::{debug, info, warn};
use snafu::IntoError;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

pub(crate) const DB_COMPOSE_FILE: &str = "db-composer.yml";
pub(crate) const UPGRADE_COMPOSE_FILE: &str = "odoo-upgrade-composer.yml";
pub(crate) const DOCKERFILE_NAME: &str = "Dockerfile";

/// Environment variable the rendered manifests read the password from.
pub(crate) const DB_PASSWORD_ENV: &str = "UPGRADER_DB_PASSWORD";

const READY_ATTEMPTS: u32 = 30;
const READY_SLEEP: Duration = Duration::from_secs(2);

/// The compose tool variant available on this host.
#[derive(Debug, Clone)]
pub(crate) struct ComposeTool {
    base: Vec<String>,
}

impl ComposeTool {
    /// Prefers the v2 `docker compose` subcommand, falls back to the v1
    /// `docker-compose` binary.
    pub(crate) fn detect(runner: &CommandRunner) -> Result<Self> {
        let v2 = vec![
            "docker".to_string(),
            "compose".to_string(),
            "version".to_string(),
        ];
        if matches!(runner.run(&v2, false), Ok(output) if output.success()) {
            return Ok(Self {
                base: vec!["docker".to_string(), "compose".to_string()],
            });
        }

        let v1 = vec!["docker-compose".to_string(), "--version".to_string()];
        if matches!(runner.run(&v1, false), Ok(output) if output.success()) {
            return Ok(Self {
                base: vec!["docker-compose".to_string()],
            });
        }

        error::ComposeMissingSnafu.fail()
    }

    #[cfg(test)]
    pub(crate) fn fake(base: &[&str]) -> Self {
        Self {
            base: base.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub(crate) fn command(&self, args: &[&str]) -> Vec<String> {
        let mut argv = self.base.clone();
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    pub(crate) fn file_command(&self, compose_file: &Path, args: &[&str]) -> Vec<String> {
        let mut argv = self.base.clone();
        argv.push("-f".to_string());
        argv.push(compose_file.to_string_lossy().into_owned());
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }
}

pub(crate) struct DockerRuntime<'a> {
    runner: &'a CommandRunner,
    pub(crate) compose: ComposeTool,
    workdir: PathBuf,
}

impl<'a> DockerRuntime<'a> {
    pub(crate) fn new(runner: &'a CommandRunner, compose: ComposeTool, workdir: PathBuf) -> Self {
        Self {
            runner,
            compose,
            workdir,
        }
    }

    pub(crate) fn db_compose_path(&self) -> PathBuf {
        self.workdir.join(DB_COMPOSE_FILE)
    }

    pub(crate) fn upgrade_compose_path(&self) -> PathBuf {
        self.workdir.join(UPGRADE_COMPOSE_FILE)
    }

    pub(crate) fn dockerfile_path(&self) -> PathBuf {
        self.workdir.join(DOCKERFILE_NAME)
    }

    /// Confirms docker and the detected compose variant answer.
    pub(crate) fn validate_environment(&self) -> Result<()> {
        info!("Validating Docker environment...");
        self.runner
            .run(&["docker".to_string(), "--version".to_string()], true)?;
        self.runner.run(&self.compose.command(&["version"]), true)?;
        info!("Docker is available.");
        Ok(())
    }

    /// Writes the database stack manifest into the working directory.
    pub(crate) fn write_db_compose(&self, ctx: &RunContext, postgres_version: &str) -> Result<()> {
        let path = self.db_compose_path();
        let content = render_db_compose(ctx, postgres_version);
        fs::write(&path, content)
            .map_err(|source| error::WriteFileSnafu { path: &path }.into_error(source))
    }

    /// Brings the database container up, detached.
    pub(crate) fn start_db(&self, ctx: &RunContext) -> Result<()> {
        let argv = self
            .compose
            .file_command(&self.db_compose_path(), &["up", "-d"]);
        self.runner
            .run_with(&argv, true, None, &Retry::none(), &password_env(ctx))?;
        Ok(())
    }

    /// Polls the engine's readiness tool inside the container.
    pub(crate) fn wait_for_db(&self, ctx: &RunContext) -> Result<()> {
        info!("Waiting for database to be ready...");
        let argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            ctx.db_container_name.clone(),
            "pg_isready".to_string(),
            "-U".to_string(),
            ctx.db_user.clone(),
            "-d".to_string(),
            ctx.bootstrap_db_name.clone(),
        ];

        for _ in 0..READY_ATTEMPTS {
            if let Ok(output) = self.runner.run(&argv, false) {
                if output.success() {
                    info!("Database is ready.");
                    return Ok(());
                }
            }
            sleep(READY_SLEEP);
        }

        error::DatabaseNotReadySnafu.fail()
    }

    /// Tears down both compose stacks (volume removal only for the database
    /// stack) and deletes the rendered files. Safe to call in any state,
    /// including when nothing was ever started; failures are warnings.
    pub(crate) fn cleanup(&self, ctx: &RunContext) {
        info!("Cleaning up Docker environment...");

        let upgrade_compose = self.upgrade_compose_path();
        if upgrade_compose.exists() {
            let argv = self.compose.file_command(&upgrade_compose, &["down"]);
            if let Err(e) =
                self.runner
                    .run_with(&argv, false, None, &Retry::none(), &password_env(ctx))
            {
                warn!("Could not tear down upgrade stack: {}", e);
            }
        }

        let db_compose = self.db_compose_path();
        if db_compose.exists() {
            let argv = self.compose.file_command(&db_compose, &["down", "-v"]);
            if let Err(e) =
                self.runner
                    .run_with(&argv, false, None, &Retry::none(), &password_env(ctx))
            {
                warn!("Could not tear down database stack: {}", e);
            }
        }

        for file in [
            self.dockerfile_path(),
            self.upgrade_compose_path(),
            self.db_compose_path(),
        ] {
            if file.exists() {
                match fs::remove_file(&file) {
                    Ok(()) => debug!("Removed {}", file.display()),
                    Err(e) => warn!("Could not remove {}: {}", file.display(), e),
                }
            }
        }
    }
}

pub(crate) fn password_env(ctx: &RunContext) -> Vec<(String, String)> {
    vec![(DB_PASSWORD_ENV.to_string(), ctx.db_password.clone())]
}

/// Renders the database stack: one persistent engine container on a
/// run-scoped bridge network backed by a run-scoped named volume.
pub(crate) fn render_db_compose(ctx: &RunContext, postgres_version: &str) -> String {
    format!(
        r#"services:
  db:
    container_name: {db_container}
    image: postgres:{postgres_version}
    environment:
      - POSTGRES_DB={bootstrap_db}
      - POSTGRES_PASSWORD=${{{password_env}}}
      - POSTGRES_USER={db_user}
    networks:
      - {network}
    volumes:
      - {volume}:/var/lib/postgresql/data
    restart: unless-stopped

networks:
  {network}:
    driver: bridge
    name: {network}

volumes:
  {volume}:
"#,
        db_container = ctx.db_container_name,
        postgres_version = postgres_version,
        bootstrap_db = ctx.bootstrap_db_name,
        password_env = DB_PASSWORD_ENV,
        db_user = ctx.db_user,
        network = ctx.network_name,
        volume = ctx.volume_name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> RunContext {
        RunContext::generate().unwrap()
    }

    #[test]
    fn db_compose_is_run_scoped() {
        let ctx = context();
        let rendered = render_db_compose(&ctx, "13");
        assert!(rendered.contains(&ctx.db_container_name));
        assert!(rendered.contains(&ctx.network_name));
        assert!(rendered.contains(&ctx.volume_name));
        assert!(rendered.contains(&ctx.db_user));
        assert!(rendered.contains("image: postgres:13"));
    }

    #[test]
    fn db_compose_never_embeds_the_password() {
        let ctx = context();
        let rendered = render_db_compose(&ctx, "13");
        assert!(!rendered.contains(&ctx.db_password));
        assert!(rendered.contains("POSTGRES_PASSWORD=${UPGRADER_DB_PASSWORD}"));
    }

    #[test]
    fn compose_tool_builds_file_commands() {
        let compose = ComposeTool::fake(&["docker", "compose"]);
        let argv = compose.file_command(Path::new("db-composer.yml"), &["up", "-d"]);
        assert_eq!(
            argv,
            vec!["docker", "compose", "-f", "db-composer.yml", "up", "-d"]
        );
    }

    #[test]
    fn cleanup_removes_rendered_files_even_without_docker() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        // A compose tool that does not exist: teardown commands fail, which
        // cleanup tolerates, and rendered files are still removed.
        let compose = ComposeTool::fake(&["no-such-compose-binary"]);
        let runtime = DockerRuntime::new(&runner, compose, dir.path().to_path_buf());

        std::fs::write(runtime.db_compose_path(), "x").unwrap();
        std::fs::write(runtime.upgrade_compose_path(), "x").unwrap();
        std::fs::write(runtime.dockerfile_path(), "x").unwrap();

        let ctx = context();
        runtime.cleanup(&ctx);
        runtime.cleanup(&ctx); // idempotent

        assert!(!runtime.db_compose_path().exists());
        assert!(!runtime.upgrade_compose_path().exists());
        assert!(!runtime.dockerfile_path().exists());
    }

    #[test]
    fn write_db_compose_lands_in_workdir() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        let compose = ComposeTool::fake(&["docker", "compose"]);
        let runtime = DockerRuntime::new(&runner, compose, dir.path().to_path_buf());
        let ctx = context();

        runtime.write_db_compose(&ctx, "14").unwrap();
        let content = std::fs::read_to_string(runtime.db_compose_path()).unwrap();
        assert!(content.contains("postgres:14"));
    }
}
