//! Per-scenario state and identity generation

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{E2eError, E2eResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern"));

/// Key/value state threaded through the steps of one scenario run.
///
/// Owned by exactly one run and dropped with it. Values only change through
/// [`ScenarioContext::set`].
#[derive(Debug, Clone, Default)]
pub struct ScenarioContext {
    values: BTreeMap<String, Value>,
}

impl ScenarioContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn require(&self, key: &str) -> E2eResult<&Value> {
        self.get(key)
            .ok_or_else(|| E2eError::UnboundVariable(key.to_string()))
    }

    /// Value rendered as text (strings without quotes)
    pub fn require_str(&self, key: &str) -> E2eResult<String> {
        Ok(as_text(self.require(key)?))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Replace every `${key}` in `template`
    pub fn render(&self, template: &str) -> E2eResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            out.push_str(&as_text(self.require(key.as_str())?));
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Render placeholders inside a JSON value. A string that is exactly one
    /// placeholder takes the stored value as is, so numbers stay numbers.
    pub fn render_value(&self, value: &Value) -> E2eResult<Value> {
        match value {
            Value::String(s) => {
                if let Some(key) = sole_placeholder(s) {
                    return self.require(key).cloned();
                }
                Ok(Value::String(self.render(s)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<E2eResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render_value(v)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Whether `s` contains any `${key}` reference
pub fn has_placeholder(s: &str) -> bool {
    PLACEHOLDER.is_match(s)
}

/// Keys referenced by `${key}` placeholders in `s`, in order of appearance
pub fn placeholder_keys(s: &str) -> Vec<&str> {
    PLACEHOLDER
        .captures_iter(s)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

pub(crate) fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Source of identities that never collide with earlier runs or with
/// sibling scenarios in the same run.
pub trait IdentityGenerator: Send + Sync {
    /// A fresh email address starting with `prefix`
    fn email(&self, prefix: &str) -> String;
}

/// Default generator: `<prefix><millis>-<run>-<n>@<domain>`
#[derive(Debug)]
pub struct UniqueIdentities {
    namespace: String,
    domain: String,
    counter: AtomicU64,
}

impl UniqueIdentities {
    /// Namespace derived from the run start time and process id
    pub fn new(domain: impl Into<String>) -> Self {
        let namespace = format!(
            "{:x}{:x}",
            chrono::Utc::now().timestamp_millis(),
            std::process::id()
        );
        Self::with_namespace(namespace, domain)
    }

    pub fn with_namespace(namespace: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            domain: domain.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl IdentityGenerator for UniqueIdentities {
    fn email(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = chrono::Utc::now().timestamp_millis();
        format!("{}{}-{}-{}@{}", prefix, millis, self.namespace, n, self.domain)
    }
}
