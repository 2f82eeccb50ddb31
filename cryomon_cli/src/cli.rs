//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use cryomon_config::LoggingCfg;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "cryomon", version, about = "Fridge monitoring and upload daemon")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/cryomon.toml")]
    pub config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging].level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start every enabled uploader and poll until interrupted
    Run {
        /// Log payloads instead of posting them to the store
        #[arg(long, action = ArgAction::SetTrue)]
        mock: bool,
    },
    /// Validate the config and print the uploader roster
    CheckConfig,
    /// Ask the store for the newest stored timestamp per dataset
    Latest,
}

/// Install the global subscriber. Flag beats config beats "info"; with
/// `[logging].dir` set, output goes to a daily-rolled file through a
/// non-blocking writer whose guard lives for the rest of the process.
pub fn init_tracing(cfg: &LoggingCfg, json: bool, level_flag: Option<&str>) {
    let level = level_flag
        .map(str::to_string)
        .or_else(|| cfg.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = json || cfg.json;

    match cfg.dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cryomon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            if json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
        }
        None => {
            if json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
    }
}
