//! Error types for E2E testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Network error: {url} unreachable: {reason}")]
    Network { url: String, reason: String },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Authentication rejected ({status}): {detail}")]
    Auth { status: u16, detail: String },

    #[error("Validation rejected ({status}): {detail}")]
    Validation { status: u16, detail: String },

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Unbound context variable: ${{{0}}}")]
    UnboundVariable(String),

    #[error("Invalid scenario '{scenario}': {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Test spec parse error: {0}")]
    SpecParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl E2eError {
    /// Errors that mean the harness itself is misconfigured. These abort a
    /// whole run instead of failing a single scenario.
    pub fn is_harness_defect(&self) -> bool {
        matches!(
            self,
            E2eError::InvalidScenario { .. }
                | E2eError::InvalidStateTransition { .. }
                | E2eError::SpecParse(_)
                | E2eError::Config(_)
                | E2eError::Yaml(_)
                | E2eError::Toml(_)
        )
    }

    /// Short machine-friendly name for the report
    pub fn kind(&self) -> &'static str {
        match self {
            E2eError::Network { .. } => "network",
            E2eError::Timeout(_) => "timeout",
            E2eError::AssertionFailed(_) => "assertion",
            E2eError::Auth { .. } => "auth",
            E2eError::Validation { .. } => "validation",
            E2eError::StepFailed { .. } => "step",
            E2eError::UnboundVariable(_) => "unbound_variable",
            E2eError::InvalidScenario { .. } => "invalid_scenario",
            E2eError::InvalidStateTransition { .. } => "state_transition",
            E2eError::ServerStartup(_) | E2eError::ServerHealthCheck(_) => "server",
            E2eError::PlaywrightNotFound | E2eError::Playwright(_) => "playwright",
            E2eError::SpecParse(_) | E2eError::Yaml(_) => "spec",
            E2eError::Config(_) | E2eError::Toml(_) => "config",
            E2eError::Io(_) => "io",
            E2eError::Json(_) => "json",
            E2eError::Http(_) | E2eError::Url(_) => "http",
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
