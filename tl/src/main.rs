//! tl - coverage-gated feedback loop for generated test suites
//!
//! CLI entry point: runs sessions, inspects and replays pipeline stages.

use std::fs;
use std::path::Path;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{info, warn};

use testloop::cli::{Cli, Command, get_log_path};
use testloop::config::{Config, PipelineKind};
use testloop::pipeline::{self, PipelineInputs, PipelineLoader, RunStore, StageOutput};
use testloop::domain::{SessionState, StageId, StageRole};
use testloop::r#loop::{CancelHandle, GateRecord, LoopEngine};

fn setup_logging(level: &str) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Write to the log file, never to stdout/stderr
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;
    let filter = tracing_subscriber::EnvFilter::try_new(level.to_lowercase())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // CLI flag > config file > INFO
    let level = cli
        .log_level
        .clone()
        .or_else(|| Config::load_log_level(cli.config.as_ref()))
        .unwrap_or_else(|| "INFO".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        "testloop loaded config: pipeline={:?}, provider={}, model={}",
        config.pipeline.kind, config.llm.provider, config.llm.model
    );

    match cli.command {
        Command::Run {
            source,
            max_iterations,
            threshold,
            feedback,
            pipeline,
        } => cmd_run(config, &source, max_iterations, threshold, feedback, pipeline.as_deref()).await,
        Command::Stages { run } => cmd_stages(&config, run.as_deref()).await,
        Command::Replay {
            stage_id,
            feedback,
            pipeline,
        } => cmd_replay(&config, &stage_id, feedback, pipeline.as_deref()).await,
        Command::Pipelines => cmd_pipelines(&config),
    }
}

/// Run one session to acceptance
async fn cmd_run(
    mut config: Config,
    source: &Path,
    max_iterations: Option<u32>,
    threshold: Option<u8>,
    feedback: Option<String>,
    definition: Option<&str>,
) -> Result<()> {
    if let Some(max) = max_iterations {
        config.session.max_iterations = max;
    }
    if let Some(threshold) = threshold {
        config.session.coverage_threshold = threshold;
    }

    let (pipeline, resolver) = pipeline::create_pipeline(&config, definition)?;

    // The first generation pass sees blank feedback unless told otherwise
    let mut inputs = PipelineInputs::with_feedback(feedback.unwrap_or_else(|| " ".to_string()));
    inputs.insert("source_path", source.display().to_string());

    let cancel = CancelHandle::new();
    let mut engine = LoopEngine::new(pipeline, resolver, config.session.clone()).with_cancel(cancel.signal());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            cancel.cancel();
        }
    });

    println!(
        "Session {} on {} (max {} retries, threshold {}%)",
        engine.session_id,
        source.display(),
        config.session.max_iterations,
        config.session.coverage_threshold
    );

    let result = engine.run(&inputs).await;
    print_history(engine.history());

    match result {
        Ok(state) => {
            println!("{} after {} retry cycles", "ACCEPTED".green().bold(), engine.iteration());
            print_state(&state);
            if config.pipeline.kind == PipelineKind::Staged {
                println!("Artifacts: {}", config.pipeline.output_dir.display());
            }
            Ok(())
        }
        Err(e) if !e.is_fatal() => {
            println!("{} {}", "WARNING:".yellow().bold(), e);
            print_state(e.last_state());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "FAILED:".red().bold(), e);
            print_state(e.last_state());
            Err(e.into())
        }
    }
}

fn print_history(history: &[GateRecord]) {
    for record in history {
        println!(
            "  [{}] coverage {}  verdict {}  -> {}",
            record.iteration, record.coverage, record.verdict, record.decision
        );
    }
}

fn print_state(state: &SessionState) {
    let verdict = state.verdict.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
    println!("Coverage: {}", state.coverage);
    println!("Verdict:  {}", verdict);
    if let (Some(generation), Some(evaluation)) = (&state.generation_stage_id, &state.evaluation_stage_id) {
        println!("Stages:   generation {} / evaluation {}", generation, evaluation);
    }
    if !state.feedback.trim().is_empty() {
        println!("Feedback:\n{}", state.feedback);
    }
}

/// Print the execution log of a run
async fn cmd_stages(config: &Config, run: Option<&str>) -> Result<()> {
    let lines = match config.pipeline.kind {
        PipelineKind::Command => {
            let (pipeline, _) = pipeline::create_pipeline(config, None)?;
            pipeline.execution_log().await?
        }
        PipelineKind::Staged => {
            let store = RunStore::new(&config.storage.dir);
            let id = match run {
                Some(id) => id.to_string(),
                None => match store.latest_id().await? {
                    Some(id) => id,
                    None => {
                        println!("No runs recorded in {}", config.storage.dir.display());
                        return Ok(());
                    }
                },
            };
            store.log(&id).await?
        }
    };

    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

/// Replay a single stage by id
async fn cmd_replay(config: &Config, stage_id: &str, feedback: Option<String>, definition: Option<&str>) -> Result<()> {
    let (pipeline, _) = pipeline::create_pipeline(config, definition)?;
    let inputs = feedback.map(PipelineInputs::with_feedback);

    match pipeline.replay_stage(&StageId::new(stage_id), inputs.as_ref()).await? {
        StageOutput::Artifact(text) => println!("{}", text),
        StageOutput::Evaluation(report) => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

/// List the pipeline definitions
fn cmd_pipelines(config: &Config) -> Result<()> {
    let loader = PipelineLoader::new(&config.pipeline)?;
    let position = |def: &pipeline::PipelineDefinition, role| {
        def.position_of(role).map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
    };

    for def in loader.definitions() {
        let marker = if def.name == config.pipeline.definition { "*" } else { " " };
        println!(
            "{} {:<12} {} stages  generation=#{}  evaluation=#{}  {}",
            marker,
            def.name,
            def.stages.len(),
            position(def, StageRole::Generation),
            position(def, StageRole::Evaluation),
            def.description
        );
    }
    if config.pipeline.kind == PipelineKind::Command {
        println!("(pipeline.kind is 'command'; definitions are unused)");
    }
    Ok(())
}
