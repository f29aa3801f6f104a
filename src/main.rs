/*!
# Introduction

`odoo-upgrader` automates incremental, multi-major-version upgrades of an
Odoo database. It brings up a disposable PostgreSQL container, restores the
provided snapshot into it, then walks the database one major version at a
time by building and running an OpenUpgrade migration container per step,
until the target version is reached. The result is re-packaged as
`output/upgraded.zip` (a `dump.sql` plus the filestore tree).

Usage example:

```shell
$ odoo-upgrader --source ./backup_v14.zip --version 16.0
```

Runs are checkpointed into `output/run-state.json`; an interrupted or failed
run started with `--resume` picks up after the last completed step and reuses
the same containers and credentials.

Configuration may also come from a flat TOML file (`.odoo-upgrader.toml` by
default, or `--config <path>`); command line options win over the file, which
wins over built-in defaults.
*/

#![deny(rust_2018_idioms)]

mod archive;
mod args;
mod command;
mod config;
mod context;
mod database;
mod docker;
mod download;
mod error;
mod filesystem;
mod manifest;
mod orchestrator;
#[cfg(test)]
mod orchestrator_test;
mod progress;
mod state;
mod upgrade;
mod validation;
mod version;
mod workspace;

use crate::args::Args;
use crate::config::{ConfigFile, Settings};
use crate::error::Result;
use crate::orchestrator::Upgrader;
use simplelog::{
    ColorChoice, CombinedLogger, Config as LogConfig, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use snafu::ResultExt;
use std::fs::File;
use std::path::Path;
use std::process;

fn init_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        LogConfig::default(),
        // Sends errors to stderr and anything less to stdout.
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Some(path) = log_file {
        let file = File::create(path).context(error::WriteFileSnafu { path })?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, LogConfig::default(), file));
    }

    CombinedLogger::init(loggers).context(error::LoggerSnafu)
}

fn run() -> Result<i32> {
    let args: Args = argh::from_env();
    let config = ConfigFile::load(args.config.as_deref())?;

    let level = args.log_level.unwrap_or(if args.verbose || config.verbose.unwrap_or(false) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    let log_file = args
        .log_file
        .clone()
        .or_else(|| config.log_file.clone());
    init_logger(level, log_file.as_deref())?;

    let settings = Settings::resolve(args, config)?;
    let mut upgrader = Upgrader::new(settings)?;
    Ok(upgrader.run())
}

fn main() {
    process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    })
}
