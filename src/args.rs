//! Command line arguments.

use argh::FromArgs;
use simplelog::LevelFilter;
use std::path::PathBuf;

/// Automates incremental Odoo database upgrades using OpenUpgrade.
#[derive(FromArgs, Debug, Default)]
pub(crate) struct Args {
    /// how much detail to log; from least to most: ERROR, WARN, INFO, DEBUG, TRACE
    #[argh(option)]
    pub(crate) log_level: Option<LevelFilter>,

    /// path to a local `.zip`/`.dump` file or an HTTPS URL
    #[argh(option)]
    pub(crate) source: Option<String>,

    /// target Odoo version, e.g. 16.0
    #[argh(option)]
    pub(crate) version: Option<String>,

    /// path to a TOML configuration file (default: .odoo-upgrader.toml if present)
    #[argh(option)]
    pub(crate) config: Option<PathBuf>,

    /// custom addons location: local folder, local `.zip` file, or URL to a `.zip` file
    #[argh(option)]
    pub(crate) extra_addons: Option<String>,

    /// mirror container output onto the console
    #[argh(switch)]
    pub(crate) verbose: bool,

    /// postgreSQL version for the database container (default: 13)
    #[argh(option)]
    pub(crate) postgres_version: Option<String>,

    /// path to a log file
    #[argh(option)]
    pub(crate) log_file: Option<PathBuf>,

    /// allow HTTP URLs (insecure); by default only HTTPS URLs are accepted
    #[argh(switch)]
    pub(crate) allow_insecure_http: bool,

    /// expected SHA-256 checksum for the source download (remote source only)
    #[argh(option)]
    pub(crate) source_sha256: Option<String>,

    /// expected SHA-256 checksum for the extra addons download (remote addons only)
    #[argh(option)]
    pub(crate) extra_addons_sha256: Option<String>,

    /// resume a previously interrupted run using the execution state file
    #[argh(switch)]
    pub(crate) resume: bool,

    /// path to the run state file (default: output/run-state.json)
    #[argh(option)]
    pub(crate) state_file: Option<PathBuf>,

    /// HTTP download timeout in seconds (default: 60)
    #[argh(option)]
    pub(crate) download_timeout: Option<f64>,

    /// number of retries for transient runtime/download failures (default: 1)
    #[argh(option)]
    pub(crate) retry_count: Option<u32>,

    /// backoff time in seconds between retries (default: 2)
    #[argh(option)]
    pub(crate) retry_backoff_seconds: Option<f64>,

    /// timeout for each OpenUpgrade step in minutes; 0 disables it (default: 120)
    #[argh(option)]
    pub(crate) step_timeout_minutes: Option<u64>,

    /// uid:gid to run the migration container as
    #[argh(option)]
    pub(crate) container_user: Option<String>,
}
