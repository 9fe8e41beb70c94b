//! Assertion engine
//!
//! Assertions are pure functions from observed values to a [`Verdict`].
//! They never touch the scenario context and never do I/O.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::as_text;

/// Outcome of one check, with enough detail to diagnose a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    /// Step or check identity, e.g. `POST /login: status`
    pub context: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub message: String,
}

impl Verdict {
    pub fn pass(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            passed: true,
            context: context.into(),
            expected: None,
            actual: None,
            message: message.into(),
        }
    }

    pub fn fail(
        context: impl Into<String>,
        expected: Option<String>,
        actual: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            passed: false,
            context: context.into(),
            expected,
            actual,
            message: message.into(),
        }
    }

    /// One-line description used in logs and scenario errors
    pub fn describe(&self) -> String {
        match (&self.expected, &self.actual) {
            (Some(expected), Some(actual)) => format!(
                "{}: {} (expected {}, got {})",
                self.context, self.message, expected, actual
            ),
            (None, Some(actual)) => format!("{}: {} (got {})", self.context, self.message, actual),
            _ => format!("{}: {}", self.context, self.message),
        }
    }
}

/// Append-only record of verdicts for one scenario
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerdictLog {
    entries: Vec<Verdict>,
}

impl VerdictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, verdict: Verdict) {
        self.entries.push(verdict);
    }

    pub fn extend(&mut self, verdicts: impl IntoIterator<Item = Verdict>) {
        self.entries.extend(verdicts);
    }

    pub fn entries(&self) -> &[Verdict] {
        &self.entries
    }

    pub fn failures(&self) -> impl Iterator<Item = &Verdict> {
        self.entries.iter().filter(|v| !v.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.entries.iter().all(|v| v.passed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Equality with numeric tolerance for int/float representations (15 == 15.0)
pub fn assert_equals(actual: Option<&Value>, expected: &Value, context: &str) -> Verdict {
    let Some(actual) = actual else {
        return Verdict::fail(context, Some(expected.to_string()), None, "value is missing");
    };
    if values_equal(actual, expected) {
        Verdict::pass(context, format!("equals {}", expected))
    } else {
        Verdict::fail(
            context,
            Some(expected.to_string()),
            Some(actual.to_string()),
            "values differ",
        )
    }
}

/// Textual match against a regex. Non-string values are matched on their JSON text.
pub fn assert_matches(actual: Option<&Value>, pattern: &Regex, context: &str) -> Verdict {
    let expected = format!("/{}/", pattern.as_str());
    let Some(actual) = actual.filter(|v| !v.is_null()) else {
        return Verdict::fail(context, Some(expected), None, "value is missing");
    };
    let text = as_text(actual);
    if pattern.is_match(&text) {
        Verdict::pass(context, format!("matches {}", expected))
    } else {
        Verdict::fail(context, Some(expected), Some(text), "pattern not found")
    }
}

/// Present and not null
pub fn assert_defined(actual: Option<&Value>, context: &str) -> Verdict {
    match actual {
        Some(v) if !v.is_null() => Verdict::pass(context, "is defined"),
        Some(_) => Verdict::fail(context, Some("non-null".into()), Some("null".into()), "value is null"),
        None => Verdict::fail(context, Some("non-null".into()), None, "value is missing"),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-9,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => actual == expected,
    }
}

/// Look up a dotted path (`detail.0.msg`). Numeric segments index arrays;
/// the empty path is the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
