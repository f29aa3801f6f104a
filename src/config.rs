//! Configuration file loading and settings resolution.
//!
//! The config file is a flat TOML mapping of the same knobs the CLI offers;
//! unknown keys are rejected so typos fail loudly. Precedence is
//! CLI > config file > built-in default.

use crate::args::Args;
use crate::error::{self, Result};
use crate::version::OdooVersion;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const DEFAULT_CONFIG_FILE: &str = ".odoo-upgrader.toml";

const DEFAULT_POSTGRES_VERSION: &str = "13";
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: f64 = 60.0;
const DEFAULT_RETRY_COUNT: u32 = 1;
const DEFAULT_RETRY_BACKOFF_SECS: f64 = 2.0;
const DEFAULT_STEP_TIMEOUT_MINUTES: u64 = 120;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigFile {
    pub(crate) source: Option<String>,
    pub(crate) version: Option<String>,
    pub(crate) extra_addons: Option<String>,
    pub(crate) verbose: Option<bool>,
    pub(crate) postgres_version: Option<String>,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) allow_insecure_http: Option<bool>,
    pub(crate) source_sha256: Option<String>,
    pub(crate) extra_addons_sha256: Option<String>,
    pub(crate) resume: Option<bool>,
    pub(crate) state_file: Option<PathBuf>,
    pub(crate) download_timeout: Option<f64>,
    pub(crate) retry_count: Option<u32>,
    pub(crate) retry_backoff_seconds: Option<f64>,
    pub(crate) step_timeout_minutes: Option<u64>,
    pub(crate) container_user: Option<String>,
    pub(crate) transient_patterns: Option<Vec<String>>,
    pub(crate) fatal_patterns: Option<Vec<String>>,
}

impl ConfigFile {
    /// Loads the explicit config path, or the default file when it exists,
    /// or an empty config otherwise.
    pub(crate) fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                ensure!(path.exists(), error::ConfigNotFoundSnafu { path });
                path.to_path_buf()
            }
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let text =
            std::fs::read_to_string(&path).context(error::ConfigReadSnafu { path: &path })?;
        toml::from_str(&text).context(error::ConfigParseSnafu { path: &path })
    }
}

/// Fully resolved run settings.
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) source: String,
    pub(crate) target_version: OdooVersion,
    pub(crate) extra_addons: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) postgres_version: String,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) allow_insecure_http: bool,
    pub(crate) source_sha256: Option<String>,
    pub(crate) extra_addons_sha256: Option<String>,
    pub(crate) resume: bool,
    pub(crate) state_file: Option<PathBuf>,
    pub(crate) download_timeout: Duration,
    pub(crate) retry_count: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) step_timeout: Option<Duration>,
    pub(crate) container_user: Option<String>,
    pub(crate) transient_patterns: Option<Vec<String>>,
    pub(crate) fatal_patterns: Option<Vec<String>>,
}

impl Settings {
    pub(crate) fn resolve(args: Args, config: ConfigFile) -> Result<Self> {
        let source = args
            .source
            .or(config.source)
            .ok_or_else(|| error::MissingOptionSnafu { option: "--source" }.build())?;
        let version = args
            .version
            .or(config.version)
            .ok_or_else(|| error::MissingOptionSnafu { option: "--version" }.build())?;
        let target_version: OdooVersion = version.parse()?;

        let source_sha256 = normalize_sha256(
            args.source_sha256.or(config.source_sha256),
            "--source-sha256",
        )?;
        let extra_addons_sha256 = normalize_sha256(
            args.extra_addons_sha256.or(config.extra_addons_sha256),
            "--extra-addons-sha256",
        )?;

        let step_timeout_minutes = args
            .step_timeout_minutes
            .or(config.step_timeout_minutes)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_MINUTES);

        Ok(Settings {
            source,
            target_version,
            extra_addons: args.extra_addons.or(config.extra_addons),
            verbose: args.verbose || config.verbose.unwrap_or(false),
            postgres_version: args
                .postgres_version
                .or(config.postgres_version)
                .unwrap_or_else(|| DEFAULT_POSTGRES_VERSION.to_string()),
            log_file: args.log_file.or(config.log_file),
            allow_insecure_http: args.allow_insecure_http
                || config.allow_insecure_http.unwrap_or(false),
            source_sha256,
            extra_addons_sha256,
            resume: args.resume || config.resume.unwrap_or(false),
            state_file: args.state_file.or(config.state_file),
            download_timeout: Duration::from_secs_f64(
                args.download_timeout
                    .or(config.download_timeout)
                    .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ),
            retry_count: args
                .retry_count
                .or(config.retry_count)
                .unwrap_or(DEFAULT_RETRY_COUNT),
            retry_backoff: Duration::from_secs_f64(
                args.retry_backoff_seconds
                    .or(config.retry_backoff_seconds)
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS),
            ),
            step_timeout: if step_timeout_minutes == 0 {
                None
            } else {
                Some(Duration::from_secs(step_timeout_minutes * 60))
            },
            container_user: args.container_user.or(config.container_user),
            transient_patterns: config.transient_patterns,
            fatal_patterns: config.fatal_patterns,
        })
    }
}

/// Checksums are accepted case-insensitively but must be 64 hex characters.
fn normalize_sha256(value: Option<String>, option: &str) -> Result<Option<String>> {
    let value = match value {
        Some(value) => value,
        None => return Ok(None),
    };

    let clean = value.trim().to_lowercase();
    ensure!(
        clean.len() == 64 && clean.chars().all(|c| c.is_ascii_hexdigit()),
        error::InvalidChecksumFormatSnafu { option }
    );
    Ok(Some(clean))
}
