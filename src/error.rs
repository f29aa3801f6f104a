//! Provides the error catalog for `odoo-upgrader`.
//!
//! Every fallible operation in the crate returns this one tagged error type.
//! Display strings state what happened and, where there is a sensible next
//! action for the operator, suggest it in the same message. New user-facing
//! failures belong here, not in ad-hoc format strings at the call site.

use snafu::Snafu;
use std::path::PathBuf;

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Broad failure categories, used for logging and tests. Each `Error` variant
/// maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    InputFormat,
    TransportPolicy,
    Network,
    ToolMissing,
    Runtime,
    DataIntegrity,
    Progress,
    ResumeConflict,
    FatalMigration,
    TransientMigration,
    Internal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    // ===== input-format =====
    #[snafu(display(
        "{} must be a valid SHA-256 hash (64 hexadecimal characters)",
        option
    ))]
    InvalidChecksumFormat { option: String },

    #[snafu(display(
        "Invalid source format. Supported formats are `.zip` and `.dump`. \
         Use a local or remote source ending with `.zip` or `.dump`."
    ))]
    InvalidSourceFormat,

    #[snafu(display(
        "Invalid addons format. Remote or file addons must be a `.zip` file. \
         Provide a directory or `.zip` package containing valid Odoo modules."
    ))]
    InvalidAddonsFormat,

    #[snafu(display(
        "Source file not found: {}. Check the path or download the source file before retrying.",
        path.display()
    ))]
    SourceNotFound { path: PathBuf },

    #[snafu(display("Source path must be a file: {}", path.display()))]
    SourceNotFile { path: PathBuf },

    #[snafu(display(
        "Extra addons path not found: {}. Provide an existing directory, zip file, or reachable URL for addons.",
        path.display()
    ))]
    AddonsNotFound { path: PathBuf },

    #[snafu(display(
        "Invalid extra addons source. Provide a local directory, a local `.zip` file, \
         or an HTTPS URL to a `.zip` file."
    ))]
    InvalidAddonsSource,

    #[snafu(display(
        "No addon modules found in '{}'. Provide a directory containing at least one valid Odoo module.",
        path.display()
    ))]
    NoModulesFound { path: PathBuf },

    #[snafu(display("Missing manifest file in addon module '{}'", module))]
    ManifestMissing { module: String },

    #[snafu(display("Could not read manifest file '{}': {}", path.display(), source))]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Invalid manifest syntax in '{}'. The manifest must be a Python dictionary literal.",
        path.display()
    ))]
    ManifestSyntax { path: PathBuf },

    #[snafu(display("Manifest '{}' must define a non-empty 'name'", path.display()))]
    ManifestName { path: PathBuf },

    #[snafu(display(
        "Manifest '{}' has invalid 'depends'. It must be a list of module names.",
        path.display()
    ))]
    ManifestDepends { path: PathBuf },

    #[snafu(display("Manifest '{}' has invalid 'version' value", path.display()))]
    ManifestVersionValue { path: PathBuf },

    #[snafu(display(
        "Manifest '{}' has invalid version '{}'. Use versions like 'x.y', 'x.y.z', \
         or target-prefixed variants such as '{}.x.y'.",
        path.display(),
        version,
        target
    ))]
    ManifestVersionFormat {
        path: PathBuf,
        version: String,
        target: String,
    },

    #[snafu(display(
        "Manifest '{}' uses version '{}', which is incompatible with target '{}'. \
         Use addons from the target branch/version before upgrading.",
        path.display(),
        version,
        target
    ))]
    ManifestVersionMismatch {
        path: PathBuf,
        version: String,
        target: String,
    },

    #[snafu(display("Invalid version string '{}'", version))]
    VersionParse { version: String },

    #[snafu(display(
        "Invalid target version '{}'. Supported versions: {}",
        version,
        supported
    ))]
    UnsupportedTarget { version: String, supported: String },

    #[snafu(display(
        "Source database version {} is below 10.0 and is not supported",
        version
    ))]
    SourceBelowFloor { version: String },

    #[snafu(display("Unsupported source file format. Use `.zip` or `.dump`."))]
    UnsupportedSourceFile,

    // ===== transport-policy =====
    #[snafu(display(
        "{} uses insecure HTTP. Switch to HTTPS or use `--allow-insecure-http` only for trusted endpoints.",
        label
    ))]
    InsecureHttp { label: String },

    // ===== network =====
    #[snafu(display("Unable to parse URL {}: {}", url, source))]
    UrlParse {
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("{} is not accessible: {}", label, message))]
    ProbeFailed { label: String, message: String },

    #[snafu(display("Error building HTTP client: {}", source))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("Download failed for {}: {}", description, source))]
    DownloadRequest {
        description: String,
        source: reqwest::Error,
    },

    #[snafu(display("Download failed for {} while reading the stream: {}", description, source))]
    DownloadRead {
        description: String,
        source: std::io::Error,
    },

    #[snafu(display("Download failed for {}: server returned {}", description, status))]
    DownloadStatus {
        description: String,
        status: reqwest::StatusCode,
    },

    #[snafu(display(
        "Checksum mismatch for {}. Expected {}, but got {}.",
        description,
        expected,
        actual
    ))]
    ChecksumMismatch {
        description: String,
        expected: String,
        actual: String,
    },

    #[snafu(display(
        "Failed to fetch OpenUpgrade scripts for {}: {}. Check network access to github.com and retry.",
        version,
        message
    ))]
    ScriptsClone { version: String, message: String },

    // ===== tool-missing =====
    #[snafu(display(
        "Required command not found: {}. Please install it and try again.",
        tool
    ))]
    MissingTool { tool: String },

    #[snafu(display(
        "Docker Compose is not available. Install Docker Compose v2 (`docker compose`) \
         or v1 (`docker-compose`) and try again."
    ))]
    ComposeMissing,

    // ===== runtime =====
    #[snafu(display("Cannot run an empty command"))]
    EmptyCommand,

    #[snafu(display("Failed to execute command: {}: {}", command, source))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("Command failed ({}): {}{}", code, command, stderr))]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[snafu(display("Command timed out after {}s: {}", timeout_secs, command))]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[snafu(display(
        "Database failed to become ready. Check Docker logs and available resources."
    ))]
    DatabaseNotReady,

    #[snafu(display(
        "Could not determine database version after restore. \
         Check that the source dump is a valid Odoo database."
    ))]
    VersionUndetected,

    #[snafu(display(
        "Could not determine database version after upgrade step. \
         Inspect logs to identify migration failures."
    ))]
    VersionUndetectedAfterStep,

    #[snafu(display("Failed to dump final database: {}", message))]
    FinalDump { message: String },

    // ===== data-integrity =====
    #[snafu(display("Invalid ZIP archive: {}", path.display()))]
    InvalidArchive {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    #[snafu(display(
        "Unsafe ZIP entry detected: `{}`. Archive extraction aborted to prevent path traversal.",
        name
    ))]
    UnsafeArchiveEntry { name: String },

    #[snafu(display("Unsafe ZIP entry detected: `{}` is a symbolic link", name))]
    SymlinkArchiveEntry { name: String },

    #[snafu(display(
        "No SQL dump found inside ZIP. Ensure it contains `dump.sql` or another `.sql` file."
    ))]
    NoSqlInArchive,

    #[snafu(display(
        "Restore failed: the dump was created by an unsupported pg_dump version. \
         Raise `--postgres-version` to an engine at least as new as the source server."
    ))]
    UnsupportedDumpVersion,

    #[snafu(display(
        "Restore failed with unrecognized configuration parameters and no compatible \
         rewrite was possible: {}. Raise `--postgres-version` to match the source server.",
        message
    ))]
    CompatRewriteExhausted { message: String },

    // ===== progress =====
    #[snafu(display(
        "Upgrade loop detected at version {}. The database version is not progressing.",
        version
    ))]
    UpgradeLoopDetected { version: String },

    #[snafu(display(
        "Upgrade did not progress: stayed at {} after targeting {}",
        version,
        target
    ))]
    UpgradeNoProgress { version: String, target: String },

    #[snafu(display(
        "No supported upgrade step found from {} to {}",
        current,
        target
    ))]
    NoUpgradePath { current: String, target: String },

    // ===== resume-conflict =====
    #[snafu(display(
        "Cannot resume run with different inputs. Mismatched fields: {}.",
        fields
    ))]
    ResumeMismatch { fields: String },

    #[snafu(display(
        "The state file already belongs to a successful run. \
         Remove it or choose another --state-file."
    ))]
    ResumeAlreadySuccessful,

    #[snafu(display(
        "State file is missing '{}'. Start a fresh run without --resume.",
        key
    ))]
    ResumeDataMissing { key: String },

    #[snafu(display("Could not read state file '{}': {}", path.display(), source))]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("State file '{}' has invalid format: {}", path.display(), source))]
    StateParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Could not write state file '{}': {}", path.display(), source))]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize state: {}", source))]
    StateSerialize { source: serde_json::Error },

    // ===== fatal-migration / transient-migration =====
    #[snafu(display(
        "Upgrade step to {} failed with fatal evidence. \
         Inspect `output/odoo.log` and container logs; this failure is not retried to avoid \
         leaving the database partially migrated.",
        version
    ))]
    FatalMigrationStep { version: String },

    #[snafu(display(
        "Upgrade step to {} failed after {} attempt(s) on transient errors. \
         Inspect `output/odoo.log` and container logs, then resume with `--resume`.",
        version,
        attempts
    ))]
    TransientMigrationExhausted { version: String, attempts: u32 },

    // ===== internal / ambient =====
    #[snafu(display("Config file not found: {}", path.display()))]
    ConfigNotFound { path: PathBuf },

    #[snafu(display("Failed to read config file {}: {}", path.display(), source))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Invalid config file '{}': {}", path.display(), source))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Missing required option '{}' (or provide it in config)", option))]
    MissingOption { option: String },

    #[snafu(display("Invalid evidence pattern '{}': {}", pattern, source))]
    InvalidEvidencePattern {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to remove '{}': {}", path.display(), source))]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to copy '{}' to '{}': {}", from.display(), to.display(), source))]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("Could not determine the working directory: {}", source))]
    CurrentDir { source: std::io::Error },

    #[snafu(display("Failed to set up signal handler: {}", source))]
    Signal { source: std::io::Error },

    #[snafu(display(
        "The platform's secure random number generator is unavailable: {}",
        source
    ))]
    SecureRandom { source: rand::Error },

    #[snafu(display("Operation cancelled by user"))]
    Interrupted,
}

impl Error {
    pub(crate) fn kind(&self) -> Kind {
        use Error::*;
        match self {
            InvalidChecksumFormat { .. }
            | InvalidSourceFormat
            | InvalidAddonsFormat
            | SourceNotFound { .. }
            | SourceNotFile { .. }
            | AddonsNotFound { .. }
            | InvalidAddonsSource
            | NoModulesFound { .. }
            | ManifestMissing { .. }
            | ManifestRead { .. }
            | ManifestSyntax { .. }
            | ManifestName { .. }
            | ManifestDepends { .. }
            | ManifestVersionValue { .. }
            | ManifestVersionFormat { .. }
            | ManifestVersionMismatch { .. }
            | VersionParse { .. }
            | UnsupportedTarget { .. }
            | SourceBelowFloor { .. }
            | UnsupportedSourceFile
            | MissingOption { .. }
            | ConfigNotFound { .. }
            | ConfigRead { .. }
            | ConfigParse { .. } => Kind::InputFormat,

            InsecureHttp { .. } => Kind::TransportPolicy,

            UrlParse { .. }
            | ProbeFailed { .. }
            | HttpClient { .. }
            | DownloadRequest { .. }
            | DownloadRead { .. }
            | DownloadStatus { .. }
            | ChecksumMismatch { .. }
            | ScriptsClone { .. } => Kind::Network,

            MissingTool { .. } | ComposeMissing => Kind::ToolMissing,

            EmptyCommand
            | CommandSpawn { .. }
            | CommandFailed { .. }
            | CommandTimeout { .. }
            | DatabaseNotReady
            | VersionUndetected
            | VersionUndetectedAfterStep
            | FinalDump { .. } => Kind::Runtime,

            InvalidArchive { .. }
            | UnsafeArchiveEntry { .. }
            | SymlinkArchiveEntry { .. }
            | NoSqlInArchive
            | UnsupportedDumpVersion
            | CompatRewriteExhausted { .. } => Kind::DataIntegrity,

            UpgradeLoopDetected { .. }
            | UpgradeNoProgress { .. }
            | NoUpgradePath { .. } => Kind::Progress,

            ResumeMismatch { .. }
            | ResumeAlreadySuccessful
            | ResumeDataMissing { .. }
            | StateRead { .. }
            | StateParse { .. }
            | StateWrite { .. }
            | StateSerialize { .. } => Kind::ResumeConflict,

            FatalMigrationStep { .. } => Kind::FatalMigration,
            TransientMigrationExhausted { .. } => Kind::TransientMigration,

            InvalidEvidencePattern { .. }
            | CreateDir { .. }
            | ReadFile { .. }
            | WriteFile { .. }
            | RemoveFile { .. }
            | Copy { .. }
            | Logger { .. }
            | CurrentDir { .. }
            | Signal { .. }
            | SecureRandom { .. }
            | Interrupted => Kind::Internal,
        }
    }
}
