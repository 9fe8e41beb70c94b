//! Flow builder and step execution

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::assertion::{assert_defined, assert_equals, assert_matches, lookup, Verdict};
use crate::context::{IdentityGenerator, ScenarioContext};
use crate::error::{E2eError, E2eResult};
use crate::http::{bearer, HttpClient, HttpMethod, Response};
use crate::spec::{Expect, Isolation, Scenario, TestStep};
use crate::ui::{UiDriver, UiSession};

/// Define a scenario from a name and its steps
pub fn define(name: impl Into<String>, steps: Vec<TestStep>) -> E2eResult<Scenario> {
    let scenario = Scenario {
        name: name.into(),
        description: String::new(),
        tags: Vec::new(),
        isolation: Isolation::Parallel,
        steps,
    };
    scenario.validate()?;
    Ok(scenario)
}

/// Fluent construction of a [`Scenario`]
#[derive(Debug, Clone)]
pub struct ScenarioBuilder {
    scenario: Scenario,
}

impl ScenarioBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            scenario: Scenario {
                name: name.into(),
                description: String::new(),
                tags: Vec::new(),
                isolation: Isolation::Parallel,
                steps: Vec::new(),
            },
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.scenario.description = description.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.scenario.tags.push(tag.into());
        self
    }

    pub fn serial(mut self) -> Self {
        self.scenario.isolation = Isolation::Serial;
        self
    }

    pub fn step(mut self, step: TestStep) -> Self {
        self.scenario.steps.push(step);
        self
    }

    pub fn generate_identity(self, key: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.step(TestStep::GenerateIdentity {
            key: key.into(),
            prefix: prefix.into(),
        })
    }

    pub fn set(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.step(TestStep::Set {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn request(self, request: RequestStep) -> Self {
        self.step(request.into_step())
    }

    pub fn post(self, path: impl Into<String>, body: Value, configure: impl FnOnce(RequestStep) -> RequestStep) -> Self {
        self.request(configure(RequestStep::new(HttpMethod::Post, path).body(body)))
    }

    pub fn put(self, path: impl Into<String>, body: Value, configure: impl FnOnce(RequestStep) -> RequestStep) -> Self {
        self.request(configure(RequestStep::new(HttpMethod::Put, path).body(body)))
    }

    pub fn open(self, url: impl Into<String>) -> Self {
        self.step(TestStep::Open { url: url.into() })
    }

    pub fn fill(self, selector: impl Into<String>, value: impl Into<String>) -> Self {
        self.step(TestStep::Fill {
            selector: selector.into(),
            value: value.into(),
        })
    }

    pub fn click(self, selector: impl Into<String>) -> Self {
        self.step(TestStep::Click { selector: selector.into() })
    }

    pub fn wait_for_text(self, selector: impl Into<String>, pattern: impl Into<String>, timeout: Duration) -> Self {
        self.step(TestStep::WaitForText {
            selector: selector.into(),
            pattern: pattern.into(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    pub fn assert_context(self, key: impl Into<String>, equals: Option<Value>, matches: Option<String>) -> Self {
        self.step(TestStep::AssertContext {
            key: key.into(),
            equals,
            matches,
        })
    }

    pub fn log(self, message: impl Into<String>) -> Self {
        self.step(TestStep::Log { message: message.into() })
    }

    /// Validate and return the scenario
    pub fn build(self) -> E2eResult<Scenario> {
        self.scenario.validate()?;
        Ok(self.scenario)
    }
}

/// Builder for a `request` step
#[derive(Debug, Clone)]
pub struct RequestStep {
    method: HttpMethod,
    path: String,
    body: Option<Value>,
    headers: BTreeMap<String, String>,
    bearer: Option<String>,
    timeout_ms: Option<u64>,
    expect: Option<Expect>,
    save: BTreeMap<String, String>,
}

impl RequestStep {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
            bearer: None,
            timeout_ms: None,
            expect: None,
            save: BTreeMap::new(),
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Authenticate with the token stored under `key`
    pub fn bearer(mut self, key: impl Into<String>) -> Self {
        self.bearer = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect = Some(expect);
        self
    }

    pub fn save(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.save.insert(key.into(), path.into());
        self
    }

    pub fn into_step(self) -> TestStep {
        TestStep::Request {
            method: self.method,
            path: self.path,
            body: self.body,
            headers: self.headers,
            bearer: self.bearer,
            timeout_ms: self.timeout_ms,
            expect: self.expect,
            save: self.save,
        }
    }
}

/// Everything a step needs besides the scenario's own state
#[derive(Clone)]
pub struct StepExecutor {
    http: HttpClient,
    ui: Arc<dyn UiDriver>,
    identities: Arc<dyn IdentityGenerator>,
}

/// Per-run mutable state: the context and the lazily opened browser session
pub struct ScenarioState {
    pub context: ScenarioContext,
    session: Option<Box<dyn UiSession>>,
}

impl ScenarioState {
    pub fn new() -> Self {
        Self {
            context: ScenarioContext::new(),
            session: None,
        }
    }

    /// Close the browser session if one was opened
    pub async fn finish(&mut self) -> E2eResult<()> {
        match self.session.take() {
            Some(mut session) => session.close().await,
            None => Ok(()),
        }
    }
}

impl Default for ScenarioState {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExecutor {
    pub fn new(http: HttpClient, ui: Arc<dyn UiDriver>, identities: Arc<dyn IdentityGenerator>) -> Self {
        Self { http, ui, identities }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Upper bound for a step, falling back to `default`
    pub fn step_bound(&self, step: &TestStep, default: Duration) -> Duration {
        // steps carrying their own bound get a grace period so their own
        // timeout error wins over the generic one
        match step {
            TestStep::Request { timeout_ms: Some(ms), .. } => Duration::from_millis(*ms) + Duration::from_secs(1),
            TestStep::WaitForText { timeout_ms, .. } => {
                Duration::from_millis(*timeout_ms).max(default) + Duration::from_secs(1)
            }
            _ => default,
        }
    }

    /// Run one step. Returned verdicts are all recorded; a failed verdict
    /// stops the scenario.
    pub async fn execute(&self, step: &TestStep, state: &mut ScenarioState) -> E2eResult<Vec<Verdict>> {
        let name = step.name();
        debug!("Executing step: {}", name);

        match step {
            TestStep::GenerateIdentity { key, prefix } => {
                let email = self.identities.email(prefix);
                debug!("{} = {}", key, email);
                state.context.set(key.clone(), email);
                Ok(Vec::new())
            }
            TestStep::Set { key, value } => {
                let value = state.context.render_value(value)?;
                state.context.set(key.clone(), value);
                Ok(Vec::new())
            }
            TestStep::Request {
                method,
                path,
                body,
                headers,
                bearer: bearer_key,
                timeout_ms,
                expect,
                save,
            } => {
                let ctx = &state.context;
                let path = ctx.render(path)?;
                let body = body.as_ref().map(|b| ctx.render_value(b)).transpose()?;
                let mut rendered_headers = BTreeMap::new();
                for (name, value) in headers {
                    rendered_headers.insert(name.clone(), ctx.render(value)?);
                }
                if let Some(key) = bearer_key {
                    rendered_headers.insert("Authorization".to_string(), bearer(&ctx.require_str(key)?));
                }

                let response = match timeout_ms {
                    Some(ms) => {
                        self.http
                            .send_with_timeout(*method, &path, body.as_ref(), &rendered_headers, Duration::from_millis(*ms))
                            .await?
                    }
                    None => self.http.send(*method, &path, body.as_ref(), &rendered_headers).await?,
                };

                let verdicts = match expect {
                    Some(expect) => evaluate(&name, expect, &response, ctx)?,
                    None => Vec::new(),
                };
                if expect.as_ref().and_then(|e| e.status).is_none() {
                    response.error_for_status(&name)?;
                }
                if verdicts.iter().all(|v| v.passed) {
                    for (key, body_path) in save {
                        let value = lookup(&response.body, body_path).ok_or_else(|| E2eError::StepFailed {
                            step: name.clone(),
                            reason: format!("response has no '{}' to save as '{}'", body_path, key),
                        })?;
                        state.context.set(key.clone(), value.clone());
                    }
                }
                Ok(verdicts)
            }
            TestStep::Open { url } => {
                let url = self.http.resolve(&state.context.render(url)?)?;
                self.session(state).await?.open(url.as_str()).await?;
                Ok(Vec::new())
            }
            TestStep::Fill { selector, value } => {
                let value = state.context.render(value)?;
                self.session(state).await?.fill(selector, &value).await?;
                Ok(Vec::new())
            }
            TestStep::Click { selector } => {
                self.session(state).await?.click(selector).await?;
                Ok(Vec::new())
            }
            TestStep::WaitForText { selector, pattern, timeout_ms } => {
                let regex = compile(&name, pattern)?;
                let observation = self
                    .session(state)
                    .await?
                    .wait_for_text(selector, &regex, Duration::from_millis(*timeout_ms))
                    .await?;
                Ok(vec![Verdict::pass(
                    name,
                    format!("{} shows {:?}", observation.selector, observation.text),
                )])
            }
            TestStep::AssertContext { key, equals, matches } => {
                let ctx = &state.context;
                let actual = ctx.get(key);
                let check = format!("{}: context.{}", name, key);
                let mut verdicts = Vec::new();
                if let Some(expected) = equals {
                    verdicts.push(assert_equals(actual, &ctx.render_value(expected)?, &check));
                }
                if let Some(pattern) = matches {
                    verdicts.push(assert_matches(actual, &compile(&name, pattern)?, &check));
                }
                Ok(verdicts)
            }
            TestStep::Log { message } => {
                info!("[TEST LOG] {}", state.context.render(message)?);
                Ok(Vec::new())
            }
        }
    }

    async fn session<'s>(&self, state: &'s mut ScenarioState) -> E2eResult<&'s mut Box<dyn UiSession>> {
        if state.session.is_none() {
            state.session = Some(self.ui.new_session().await?);
        }
        state
            .session
            .as_mut()
            .ok_or_else(|| E2eError::Playwright("browser session unavailable".into()))
    }
}

/// Evaluate every expectation against a response, in a stable order:
/// status, equals, matches, defined.
pub fn evaluate(step: &str, expect: &Expect, response: &Response, ctx: &ScenarioContext) -> E2eResult<Vec<Verdict>> {
    let mut verdicts = Vec::new();

    if let Some(status) = expect.status {
        verdicts.push(assert_equals(
            Some(&Value::from(response.status)),
            &Value::from(status),
            &format!("{}: status", step),
        ));
    }
    for (path, expected) in &expect.equals {
        let expected = ctx.render_value(expected)?;
        verdicts.push(assert_equals(
            lookup(&response.body, path),
            &expected,
            &format!("{}: body.{}", step, path),
        ));
    }
    for (path, pattern) in &expect.matches {
        verdicts.push(assert_matches(
            lookup(&response.body, path),
            &compile(step, pattern)?,
            &format!("{}: body.{}", step, path),
        ));
    }
    for path in &expect.defined {
        verdicts.push(assert_defined(
            lookup(&response.body, path),
            &format!("{}: body.{}", step, path),
        ));
    }

    Ok(verdicts)
}

fn compile(step: &str, pattern: &str) -> E2eResult<Regex> {
    Regex::new(pattern).map_err(|e| E2eError::InvalidScenario {
        scenario: step.to_string(),
        reason: format!("invalid pattern /{}/: {}", pattern, e),
    })
}
