//! Streaming downloads with SHA-256 verification.
//!
//! Remote artifacts are written straight to disk in small chunks while the
//! digest is computed incrementally, so a multi-gigabyte dump never has to
//! fit in memory. A checksum mismatch removes the partial file before
//! failing. Transport errors are retried with the configured fixed backoff;
//! HTTP status errors and checksum mismatches are not.

use crate::error::{self, Error, Result};
use crate::filesystem;
use crate::progress::ProgressReporter;
use crate::validation::{self, Validator};
use log::{info, warn};
use sha2::{Digest, Sha256};
use snafu::{IntoError, ResultExt};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;
use url::Url;

const DOWNLOAD_CHUNK: usize = 8192;

pub(crate) struct Downloader<'a> {
    validator: &'a Validator,
    reporter: &'a dyn ProgressReporter,
    timeout: Duration,
    retry_count: u32,
    retry_backoff: Duration,
}

enum AttemptError {
    /// Worth another try: the transport failed mid-flight.
    Transport(Error),
    /// Not worth another try: policy, status, or local I/O.
    Fatal(Error),
}

impl<'a> Downloader<'a> {
    pub(crate) fn new(
        validator: &'a Validator,
        reporter: &'a dyn ProgressReporter,
        timeout: Duration,
        retry_count: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            validator,
            reporter,
            timeout,
            retry_count,
            retry_backoff,
        }
    }

    /// Streams `url` into `dest_path`, creating parent directories. When
    /// `expected_sha256` is given the download only succeeds if the digest
    /// matches.
    pub(crate) fn download_file(
        &self,
        url: &str,
        dest_path: &Path,
        description: &str,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());
        self.validator.enforce_transport_policy(url, description)?;

        if let Some(parent) = dest_path.parent() {
            filesystem::create_dir_all(parent)?;
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|source| error::HttpClientSnafu.into_error(source))?;

        let max_attempts = self.retry_count + 1;
        let mut attempt = 1;
        let actual = loop {
            match self.attempt_download(&client, url, dest_path, description) {
                Ok(digest) => break digest,
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transport(e)) => {
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    warn!(
                        "Download attempt {}/{} for {} failed: {}. Retrying in {:.1}s.",
                        attempt,
                        max_attempts,
                        description,
                        e,
                        self.retry_backoff.as_secs_f64()
                    );
                    sleep(self.retry_backoff);
                    attempt += 1;
                }
            }
        };

        if let Some(expected) = expected_sha256 {
            if actual != expected {
                // Do not leave an artifact that failed verification behind.
                let _ = fs::remove_file(dest_path);
                return error::ChecksumMismatchSnafu {
                    description,
                    expected,
                    actual,
                }
                .fail();
            }
        }

        Ok(())
    }

    fn attempt_download(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
        dest_path: &Path,
        description: &str,
    ) -> std::result::Result<String, AttemptError> {
        let mut response = client.get(url).send().map_err(|source| {
            AttemptError::Transport(
                error::DownloadRequestSnafu { description }.into_error(source),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Fatal(
                error::DownloadStatusSnafu {
                    description,
                    status,
                }
                .build(),
            ));
        }

        let total = response.content_length();
        self.reporter.start(description, total);

        let file = File::create(dest_path).map_err(|source| {
            AttemptError::Fatal(error::WriteFileSnafu { path: dest_path }.into_error(source))
        })?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; DOWNLOAD_CHUNK];

        loop {
            let read = response.read(&mut buffer).map_err(|source| {
                AttemptError::Transport(
                    error::DownloadReadSnafu { description }.into_error(source),
                )
            })?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).map_err(|source| {
                AttemptError::Fatal(
                    error::WriteFileSnafu { path: dest_path }.into_error(source),
                )
            })?;
            hasher.update(&buffer[..read]);
            self.reporter.advance(read as u64);
        }

        writer.flush().map_err(|source| {
            AttemptError::Fatal(error::WriteFileSnafu { path: dest_path }.into_error(source))
        })?;
        self.reporter.finish(description);

        Ok(hex::encode(hasher.finalize()))
    }

    /// Resolves the source input to a local file: remote sources are
    /// downloaded into `source_dir` under their URL basename, local sources
    /// are used where they are.
    pub(crate) fn fetch_source(
        &self,
        source: &str,
        source_dir: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<PathBuf> {
        if !validation::is_url(source) {
            return Ok(PathBuf::from(source));
        }

        let url = Url::parse(source).context(error::UrlParseSnafu { url: source })?;
        let ext = validation::location_extension(source);
        let basename = url
            .path_segments()
            .and_then(|segments| segments.last().map(|s| s.to_string()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "downloaded_db{}",
                    if ext.is_empty() { ".dump" } else { &ext }
                )
            });

        let dest = source_dir.join(basename);
        self.download_file(source, &dest, "Downloading source DB...", expected_sha256)?;
        Ok(dest)
    }
}
