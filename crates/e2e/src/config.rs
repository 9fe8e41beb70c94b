//! Harness configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::playwright::PlaywrightConfig;

/// Environment variable overriding [`HarnessConfig::base_url`]
pub const ENV_BASE_URL: &str = "FASTCALC_E2E_BASE_URL";

/// Environment variable overriding [`HarnessConfig::max_parallel`]
pub const ENV_MAX_PARALLEL: &str = "FASTCALC_E2E_MAX_PARALLEL";

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base URL of the system under test
    pub base_url: String,

    /// Bound on a single HTTP request
    pub request_timeout_ms: u64,

    /// Bound on a single step (requests may override it)
    pub step_timeout_ms: u64,

    /// Maximum number of scenarios running at once
    pub max_parallel: usize,

    /// Directory scanned for YAML scenarios
    pub specs_dir: PathBuf,

    /// Output directory for results
    pub output_dir: PathBuf,

    /// Domain used for generated emails
    pub email_domain: String,

    /// Ephemeral backend to spawn for the run (None = use base_url as is)
    pub backend: Option<BackendConfig>,

    /// Browser automation settings
    pub playwright: PlaywrightConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_ms: 10_000,
            step_timeout_ms: 30_000,
            max_parallel: 4,
            specs_dir: PathBuf::from("specs"),
            output_dir: PathBuf::from("test-results"),
            email_domain: "example.com".to_string(),
            backend: None,
            playwright: PlaywrightConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Parse a configuration from a TOML string
    pub fn from_toml(content: &str) -> E2eResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            E2eError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Apply `FASTCALC_E2E_*` environment overrides
    pub fn apply_env(&mut self) -> E2eResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> E2eResult<()> {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(raw) = lookup(ENV_MAX_PARALLEL) {
            self.max_parallel = raw.parse().map_err(|_| {
                E2eError::Config(format!("{} must be a positive integer, got '{}'", ENV_MAX_PARALLEL, raw))
            })?;
        }
        self.validate()
    }

    /// Reject values the runner cannot work with
    pub fn validate(&self) -> E2eResult<()> {
        if self.max_parallel == 0 {
            return Err(E2eError::Config("max_parallel must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 || self.step_timeout_ms == 0 {
            return Err(E2eError::Config("timeouts must be non-zero".into()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| E2eError::Config(format!("invalid base_url '{}': {}", self.base_url, e)))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// How to launch a fresh backend instance for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Program to execute
    pub program: PathBuf,

    /// Arguments; `{port}` is replaced with the chosen port
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment; values may also contain `{port}`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Port to listen on (None = find free port)
    #[serde(default)]
    pub port: Option<u16>,

    /// Path polled until the backend answers
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Timeout for backend startup
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

fn default_health_path() -> String {
    "/openapi.json".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

impl BackendConfig {
    /// Launch `program` with the default health path and startup timeout
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            working_dir: None,
            port: None,
            health_path: default_health_path(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}
