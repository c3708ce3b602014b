//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::Coverage;

/// testloop - coverage-gated feedback loop for generated test suites
#[derive(Parser)]
#[command(
    name = "tl",
    about = "Generate a test suite, gate it on coverage and verdict, replay weak stages with feedback",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/testloop/logs/testloop.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short, long, global = true, help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run one feedback session against a source file
    Run {
        /// Source file the suite is generated for
        source: PathBuf,

        /// Retry cycles before giving up
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Coverage below which a FAIL verdict is retried (0-100)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=Coverage::MAX as i64))]
        threshold: Option<u8>,

        /// Initial feedback for the generation stage
        #[arg(short, long)]
        feedback: Option<String>,

        /// Pipeline definition to run (staged pipelines only)
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// Print the execution log of the latest (or given) run
    Stages {
        /// Run id; defaults to the latest run
        #[arg(short, long)]
        run: Option<String>,
    },

    /// Replay one stage of a recorded run
    Replay {
        /// Stage identifier from `tl stages`
        stage_id: String,

        /// Feedback substituted into the stage's inputs
        #[arg(short, long)]
        feedback: Option<String>,

        /// Pipeline definition the run was produced by
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// List pipeline definitions with their generation/evaluation positions
    Pipelines,
}

/// Path of the log file written by `tl`
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("testloop")
        .join("logs")
        .join("testloop.log")
}
