//! Subprocess execution with capture, timeout, and retry.
//!
//! All external tools (docker, compose, git) are invoked through this module
//! so that exit handling, logging, and retries stay consistent. Commands are
//! always run one at a time; the only concurrency in the program is between
//! the orchestrator and the child it is currently waiting on.

use crate::error::{self, Result};
use duct::cmd;
use log::{debug, warn};
use snafu::{ensure, IntoError};
use std::io::ErrorKind;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub(crate) code: i32,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.code == 0
    }
}

/// Retry policy for a command invocation. An exit is retryable iff
/// `on_exit_codes` is empty or contains the code; timeouts are always
/// retryable while attempts remain.
#[derive(Debug, Clone, Default)]
pub(crate) struct Retry {
    pub(crate) count: u32,
    pub(crate) backoff: Duration,
    pub(crate) on_exit_codes: Vec<i32>,
}

impl Retry {
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn new(count: u32, backoff: Duration) -> Self {
        Self {
            count,
            backoff,
            on_exit_codes: Vec::new(),
        }
    }

    fn allows(&self, code: i32) -> bool {
        self.on_exit_codes.is_empty() || self.on_exit_codes.contains(&code)
    }
}

#[derive(Debug, Default)]
pub(crate) struct CommandRunner {
    pub(crate) default_timeout: Option<Duration>,
}

impl CommandRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Runs `argv` to completion, capturing stdout and stderr. With `check`,
    /// a non-zero final exit becomes an error naming the command, code, and
    /// trimmed stderr; without it the caller inspects the returned record.
    pub(crate) fn run(&self, argv: &[String], check: bool) -> Result<CommandOutput> {
        self.run_with(argv, check, None, &Retry::none(), &[])
    }

    pub(crate) fn run_with(
        &self,
        argv: &[String],
        check: bool,
        timeout: Option<Duration>,
        retry: &Retry,
        envs: &[(String, String)],
    ) -> Result<CommandOutput> {
        ensure!(!argv.is_empty(), error::EmptyCommandSnafu);
        let command_line = argv.join(" ");
        debug!("Executing: {}", command_line);

        let effective_timeout = timeout.or(self.default_timeout);
        let max_attempts = retry.count + 1;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep(retry.backoff);
            }

            let output = match self.spawn_and_wait(argv, effective_timeout, envs)? {
                Some(output) => output,
                None => {
                    // Timed out; the child has been terminated.
                    if attempt < max_attempts {
                        warn!(
                            "Command timed out on attempt {}/{}. Retrying in {:.1}s: {}",
                            attempt,
                            max_attempts,
                            retry.backoff.as_secs_f64(),
                            command_line
                        );
                        continue;
                    }
                    return error::CommandTimeoutSnafu {
                        command: command_line,
                        timeout_secs: effective_timeout.unwrap_or_default().as_secs(),
                    }
                    .fail();
                }
            };

            if !output.stdout.trim().is_empty() {
                debug!("Command output: {}", output.stdout.trim());
            }

            if output.success() {
                return Ok(output);
            }

            let stderr = output.stderr.trim().to_string();
            let rendered_stderr = if stderr.is_empty() {
                String::new()
            } else {
                format!("\n{}", stderr)
            };

            if attempt < max_attempts && retry.allows(output.code) {
                warn!(
                    "Command failed ({}) on attempt {}/{} and will be retried in {:.1}s: {}{}",
                    output.code,
                    attempt,
                    max_attempts,
                    retry.backoff.as_secs_f64(),
                    command_line,
                    rendered_stderr
                );
                continue;
            }

            if check {
                return error::CommandFailedSnafu {
                    command: command_line,
                    code: output.code,
                    stderr: rendered_stderr,
                }
                .fail();
            }

            warn!(
                "Command failed ({}): {}{}",
                output.code, command_line, rendered_stderr
            );
            return Ok(output);
        }

        // The loop always returns; retries either continue or exit above.
        unreachable!("command retry loop exited without a result")
    }

    /// Returns `Ok(None)` when the child exceeded the timeout and was killed.
    fn spawn_and_wait(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        envs: &[(String, String)],
    ) -> Result<Option<CommandOutput>> {
        let (program, args) = argv.split_first().expect("argv checked non-empty");
        let mut expression = cmd(program.as_str(), args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        for (key, value) in envs {
            expression = expression.env(key, value);
        }

        let handle = expression.start().map_err(|source| {
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
        loop {
            match handle.try_wait() {
                Ok(Some(output)) => {
                    return Ok(Some(CommandOutput {
                        code: output.status.code().unwrap_or(-1),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }));
                }
                Ok(None) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            terminate(&handle.pids());
                            let grace_deadline = Instant::now() + KILL_GRACE;
                            while Instant::now() < grace_deadline {
                                if matches!(handle.try_wait(), Ok(Some(_))) {
                                    return Ok(None);
                                }
                                sleep(POLL_INTERVAL);
                            }
                            let _ = handle.kill();
                            let _ = handle.wait();
                            return Ok(None);
                        }
                    }
                    sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(error::CommandSpawnSnafu {
                        command: argv.join(" "),
                    }
                    .into_error(source));
                }
            }
        }
    }
}

/// Asks the given processes to exit. SIGKILL follows after the grace period
/// if they do not.
#[cfg(unix)]
pub(crate) fn terminate(pids: &[u32]) {
    for pid in pids {
        unsafe {
            libc::kill(*pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate(_pids: &[u32]) {}
