//! testloop configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::r#loop::LoopConfig;

/// Main testloop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Control loop limits and gate threshold
    pub session: LoopConfig,

    /// Which pipeline to drive and how
    pub pipeline: PipelineConfig,

    /// Log markers for the legacy stage resolver
    pub resolver: ResolverConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load the first readable config file
    ///
    /// An explicit path must load. Otherwise `./.testloop.yml` then
    /// `<config_dir>/testloop/testloop.yml` are tried; a broken candidate is
    /// logged and skipped, and defaults apply when none loads.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "Config::load: called");
        if let Some(path) = config_path {
            return Self::load_from_file(path).with_context(|| format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidates().into_iter().filter(|p| p.exists()) {
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(path = %candidate.display(), error = %e, "Skipping unreadable config"),
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialised
    ///
    /// Errors are swallowed; the full load reports them once logging is up.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(p) => p.clone(),
            None => Self::candidates().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        serde_yaml::from_str::<Self>(&content).ok()?.log_level
    }

    /// Implicit config locations, most specific first
    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".testloop.yml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("testloop").join("testloop.yml"));
        }
        paths
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name ("anthropic" or "openai")
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    /// Read the API key from the configured environment variable
    pub fn get_api_key(&self) -> Option<String> {
        debug!(api_key_env = %self.api_key_env, "LlmConfig::get_api_key: called");
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Which pipeline implementation backs the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// In-process LLM stages loaded from a pipeline definition
    #[default]
    Staged,
    /// External commands (legacy; stage ids come from log scraping)
    Command,
}

/// Search-path entry standing for the definitions compiled into the binary
const BUILTIN_PATH: &str = "builtin";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub kind: PipelineKind,

    /// Name of the pipeline definition to run
    pub definition: String,

    /// Paths to search for pipeline definitions (searched in order)
    pub paths: Vec<String>,

    /// Directory that receives stage output files
    #[serde(rename = "output-dir")]
    pub output_dir: PathBuf,

    /// How long a run stays replayable, in seconds
    #[serde(rename = "run-ttl-secs")]
    pub run_ttl_secs: Option<u64>,

    /// External commands for the legacy command pipeline
    pub command: CommandConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            kind: PipelineKind::Staged,
            definition: "jest".to_string(),
            paths: vec![
                BUILTIN_PATH.to_string(),
                "~/.config/testloop/pipelines".to_string(),
                ".testloop/pipelines".to_string(),
            ],
            output_dir: PathBuf::from("testloop_out"),
            run_ttl_secs: Some(86_400),
            command: CommandConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Definition directories, with `~/` resolved and `builtin` left out
    pub fn expanded_paths(&self) -> Vec<PathBuf> {
        self.paths
            .iter()
            .filter(|p| p.as_str() != BUILTIN_PATH)
            .filter_map(|p| match p.strip_prefix("~/") {
                Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
                None => Some(PathBuf::from(p)),
            })
            .collect()
    }

    /// Whether the bundled `jest` and `jest-lite` definitions are searched
    pub fn use_builtin(&self) -> bool {
        self.paths.iter().any(|p| p == BUILTIN_PATH)
    }
}

/// Shell commands for the legacy command pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Runs the whole pipeline, prints the result JSON
    pub run: String,

    /// Prints the execution log of the latest run
    pub log: String,

    /// Replays one stage ($TESTLOOP_STAGE_ID), prints its output
    pub replay: String,

    /// Working directory for all commands
    #[serde(rename = "working-dir")]
    pub working_dir: Option<PathBuf>,

    /// Timeout per command in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            run: String::new(),
            log: String::new(),
            replay: String::new(),
            working_dir: None,
            timeout_ms: 600_000,
        }
    }
}

/// Markers the legacy resolver looks for in the execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    #[serde(rename = "generation-marker")]
    pub generation_marker: String,

    #[serde(rename = "evaluation-marker")]
    pub evaluation_marker: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            generation_marker: "Task 4:".to_string(),
            evaluation_marker: "Task 5:".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for run records and execution logs
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_dir().map_or_else(|| PathBuf::from(".testloop"), |d| d.join("testloop")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r#loop::Linkage;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.session.max_iterations, 5);
        assert_eq!(config.session.coverage_threshold, 90);
        assert_eq!(config.pipeline.kind, PipelineKind::Staged);
        assert_eq!(config.pipeline.definition, "jest");
        assert_eq!(config.resolver.generation_marker, "Task 4:");
        assert_eq!(config.resolver.evaluation_marker, "Task 5:");
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: DEBUG

llm:
  provider: openai
  model: gpt-4o-mini
  api-key-env: OPENAI_API_KEY
  base-url: https://api.openai.com
  max-tokens: 8192
  timeout-ms: 60000

session:
  max-iterations: 3
  coverage-threshold: 85
  call-timeout-ms: 120000
  budget-ms: 900000
  linkage: log

pipeline:
  kind: command
  output-dir: out
  command:
    run: "crew run"
    log: "crew log-tasks-outputs"
    replay: "crew replay"
    timeout-ms: 30000

resolver:
  generation-marker: "Task 3:"
  evaluation-marker: "Task 4:"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("DEBUG"));
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.max_tokens, 8192);
        assert_eq!(config.session.max_iterations, 3);
        assert_eq!(config.session.coverage_threshold, 85);
        assert_eq!(config.session.budget_ms, Some(900_000));
        assert_eq!(config.session.linkage, Linkage::Log);
        assert_eq!(config.pipeline.kind, PipelineKind::Command);
        assert_eq!(config.pipeline.command.log, "crew log-tasks-outputs");
        assert_eq!(config.pipeline.command.timeout_ms, 30_000);
        assert_eq!(config.resolver.generation_marker, "Task 3:");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
llm:
  model: claude-haiku
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.model, "claude-haiku");
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.session.max_iterations, 5);
        assert_eq!(config.pipeline.definition, "jest");
    }

    #[test]
    fn test_expanded_paths_skip_builtin() {
        let config = PipelineConfig {
            paths: vec!["builtin".to_string(), "/etc/testloop".to_string()],
            ..Default::default()
        };

        assert!(config.use_builtin());
        assert_eq!(config.expanded_paths(), vec![PathBuf::from("/etc/testloop")]);
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("testloop.yml");
        fs::write(&path, "session:\n  max-iterations: 9\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.session.max_iterations, 9);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/testloop.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
