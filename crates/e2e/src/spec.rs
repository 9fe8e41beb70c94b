//! Scenario model and declarative YAML specs

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::placeholder_keys;
use crate::error::{E2eError, E2eResult};
use crate::http::HttpMethod;

/// Email input on the registration page
const REGISTER_EMAIL_FIELD: &str = "#email";

/// Submit button on the registration page
const REGISTER_BUTTON: &str = "#registerBtn";

/// A named end-to-end flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering
    #[serde(default)]
    pub tags: Vec<String>,

    /// Whether this scenario may run alongside others
    #[serde(default)]
    pub isolation: Isolation,

    /// Steps to execute in order
    pub steps: Vec<TestStep>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// No shared mutable state with siblings
    #[default]
    Parallel,
    /// Touches state other scenarios may also touch; never overlaps with another scenario
    Serial,
}

/// A single step in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Store a fresh unique email under `key`
    GenerateIdentity {
        #[serde(default = "default_identity_key")]
        key: String,
        #[serde(default = "default_identity_prefix")]
        prefix: String,
    },

    /// Store a literal value
    Set {
        key: String,
        value: Value,
    },

    /// Call the API
    Request {
        method: HttpMethod,
        path: String,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// Context key holding a bearer token
        #[serde(default)]
        bearer: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        /// Without an expected status any non-2xx answer fails the step
        #[serde(default)]
        expect: Option<Expect>,
        /// Context key -> body path to store once expectations hold
        #[serde(default)]
        save: BTreeMap<String, String>,
    },

    /// Navigate the browser (relative to the base URL)
    Open {
        url: String,
    },

    /// Fill an input field
    Fill {
        selector: String,
        value: String,
    },

    /// Click an element
    Click {
        selector: String,
    },

    /// Wait until an element's text matches a regex
    WaitForText {
        selector: String,
        pattern: String,
        timeout_ms: u64,
    },

    /// Check a context value
    AssertContext {
        key: String,
        #[serde(default)]
        equals: Option<Value>,
        #[serde(default)]
        matches: Option<String>,
    },

    /// Log a message (for debugging)
    Log {
        message: String,
    },
}

fn default_identity_key() -> String {
    "email".to_string()
}

fn default_identity_prefix() -> String {
    "user".to_string()
}

/// Expectations on a response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expect {
    #[serde(default)]
    pub status: Option<u16>,

    /// Body path -> expected value (placeholders allowed)
    #[serde(default)]
    pub equals: BTreeMap<String, Value>,

    /// Body path -> regex
    #[serde(default)]
    pub matches: BTreeMap<String, String>,

    /// Body paths that must be present and non-null
    #[serde(default)]
    pub defined: Vec<String>,
}

impl Expect {
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn equals(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(path.into(), value.into());
        self
    }

    pub fn matches(mut self, path: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.matches.insert(path.into(), pattern.into());
        self
    }

    pub fn defined(mut self, path: impl Into<String>) -> Self {
        self.defined.push(path.into());
        self
    }
}

impl TestStep {
    /// Short identity used in logs and verdicts
    pub fn name(&self) -> String {
        match self {
            TestStep::GenerateIdentity { key, .. } => format!("generate_identity:{}", key),
            TestStep::Set { key, .. } => format!("set:{}", key),
            TestStep::Request { method, path, .. } => format!("{} {}", method.as_str(), path),
            TestStep::Open { url } => format!("open:{}", url),
            TestStep::Fill { selector, .. } => format!("fill:{}", selector),
            TestStep::Click { selector } => format!("click:{}", selector),
            TestStep::WaitForText { selector, .. } => format!("wait_for_text:{}", selector),
            TestStep::AssertContext { key, .. } => format!("assert_context:{}", key),
            TestStep::Log { message } => {
                format!("log:{}", message.chars().take(30).collect::<String>())
            }
        }
    }

    pub fn is_ui(&self) -> bool {
        matches!(
            self,
            TestStep::Open { .. } | TestStep::Fill { .. } | TestStep::Click { .. } | TestStep::WaitForText { .. }
        )
    }

    fn validate(&self) -> Result<(), String> {
        let non_empty = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(format!("{}: {} must not be empty", self.name(), field))
            } else {
                Ok(())
            }
        };
        let regex = |pattern: &str| {
            Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("{}: invalid pattern /{}/: {}", self.name(), pattern, e))
        };

        match self {
            TestStep::GenerateIdentity { key, .. } | TestStep::Set { key, .. } => non_empty("key", key),
            TestStep::Request { path, bearer, expect, save, .. } => {
                non_empty("path", path)?;
                if let Some(bearer) = bearer {
                    non_empty("bearer", bearer)?;
                }
                for key in save.keys() {
                    non_empty("save key", key)?;
                }
                if let Some(expect) = expect {
                    for pattern in expect.matches.values() {
                        regex(pattern)?;
                    }
                }
                Ok(())
            }
            TestStep::Open { url } => non_empty("url", url),
            TestStep::Fill { selector, .. } | TestStep::Click { selector } => non_empty("selector", selector),
            TestStep::WaitForText { selector, pattern, timeout_ms } => {
                non_empty("selector", selector)?;
                regex(pattern)?;
                if *timeout_ms == 0 {
                    return Err(format!("{}: timeout_ms must be positive", self.name()));
                }
                Ok(())
            }
            TestStep::AssertContext { key, equals, matches } => {
                non_empty("key", key)?;
                if let Some(pattern) = matches {
                    regex(pattern)?;
                }
                if equals.is_none() && matches.is_none() {
                    return Err(format!("{}: needs `equals` or `matches`", self.name()));
                }
                Ok(())
            }
            TestStep::Log { .. } => Ok(()),
        }
    }
}

impl Scenario {
    /// Check the definition is runnable. Failures here are harness defects.
    pub fn validate(&self) -> E2eResult<()> {
        let invalid = |reason: String| E2eError::InvalidScenario {
            scenario: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("scenario has no steps".into()));
        }
        for step in &self.steps {
            step.validate().map_err(invalid)?;
        }
        Ok(())
    }

    /// Registers an account under an email that is not freshly generated,
    /// through the API or through the registration page. Such scenarios
    /// collide with earlier runs and with each other.
    ///
    /// An email counts as fresh only when every placeholder in it refers to
    /// a key bound by an earlier `generate_identity` step.
    pub fn uses_fixed_identity(&self) -> bool {
        let mut generated: HashSet<&str> = HashSet::new();
        let mut page_email: Option<&str> = None;
        let fresh = |generated: &HashSet<&str>, value: &str| {
            let keys = placeholder_keys(value);
            !keys.is_empty() && keys.iter().all(|key| generated.contains(key))
        };

        for step in &self.steps {
            match step {
                TestStep::GenerateIdentity { key, .. } => {
                    generated.insert(key.as_str());
                }
                TestStep::Set { key, value } => {
                    if value.as_str().is_some_and(|v| fresh(&generated, v)) {
                        generated.insert(key.as_str());
                    } else {
                        generated.remove(key.as_str());
                    }
                }
                TestStep::Request { path, body: Some(body), .. } if path.trim_end_matches('/') == "/register" => {
                    if let Some(email) = body.get("email").and_then(Value::as_str) {
                        if !fresh(&generated, email) {
                            return true;
                        }
                    }
                }
                TestStep::Open { .. } => page_email = None,
                TestStep::Fill { selector, value } if selector == REGISTER_EMAIL_FIELD => {
                    page_email = Some(value.as_str());
                }
                TestStep::Click { selector } if selector == REGISTER_BUTTON => {
                    if page_email.is_some_and(|email| !fresh(&generated, email)) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    pub fn needs_ui(&self) -> bool {
        self.steps.iter().any(TestStep::is_ui)
    }

    /// Parse a scenario from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml).map_err(|e| E2eError::SpecParse(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| match e {
                E2eError::SpecParse(reason) => E2eError::SpecParse(format!("{}: {}", path.display(), reason)),
                other => other,
            })
    }

    /// Load all scenarios from a directory, sorted by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        let scenarios = paths
            .iter()
            .map(|path| Self::from_file(path))
            .collect::<E2eResult<Vec<_>>>()?;
        ensure_unique_names(&scenarios)?;
        Ok(scenarios)
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }
}

/// Duplicate names would make a report ambiguous
pub fn ensure_unique_names(scenarios: &[Scenario]) -> E2eResult<()> {
    let mut seen = HashSet::new();
    for scenario in scenarios {
        if !seen.insert(scenario.name.as_str()) {
            return Err(E2eError::InvalidScenario {
                scenario: scenario.name.clone(),
                reason: "duplicate scenario name".into(),
            });
        }
    }
    Ok(())
}
