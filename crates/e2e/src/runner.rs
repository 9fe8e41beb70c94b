//! Scenario runner: scheduling, failure isolation, and reporting

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::assertion::{Verdict, VerdictLog};
use crate::config::HarnessConfig;
use crate::context::{IdentityGenerator, UniqueIdentities};
use crate::error::{E2eError, E2eResult};
use crate::flow::{ScenarioState, StepExecutor};
use crate::http::HttpClient;
use crate::playwright::PlaywrightDriver;
use crate::server::BackendHandle;
use crate::spec::{ensure_unique_names, Isolation, Scenario};
use crate::ui::UiDriver;

/// Lifecycle of one scenario within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl ScenarioStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioStatus::Passed | ScenarioStatus::Failed)
    }

    /// PENDING -> RUNNING -> {PASSED, FAILED}; terminal states are final
    pub fn transition(self, to: ScenarioStatus) -> E2eResult<ScenarioStatus> {
        use ScenarioStatus::*;
        match (self, to) {
            (Pending, Running) | (Running, Passed) | (Running, Failed) => Ok(to),
            _ => Err(E2eError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioStatus::Pending => "PENDING",
            ScenarioStatus::Running => "RUNNING",
            ScenarioStatus::Passed => "PASSED",
            ScenarioStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Result of executing a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub step_name: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub status: ScenarioStatus,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub verdicts: VerdictLog,
    pub error: Option<String>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    /// Step that stopped the scenario, if any
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| !s.success)
    }
}

/// Result of running all scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioResult>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn result(&self, name: &str) -> Option<&ScenarioResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.iter().filter(|r| !r.passed())
    }
}

/// Main E2E test runner
pub struct TestRunner {
    config: HarnessConfig,
    executor: StepExecutor,
    ui: Arc<dyn UiDriver>,
    identities: Arc<dyn IdentityGenerator>,
    backend: Option<BackendHandle>,
}

impl TestRunner {
    /// Runner with the Playwright driver and the default identity generator
    pub fn new(config: HarnessConfig) -> E2eResult<Self> {
        let ui: Arc<dyn UiDriver> = Arc::new(PlaywrightDriver::new(config.playwright.clone()));
        let identities: Arc<dyn IdentityGenerator> = Arc::new(UniqueIdentities::new(config.email_domain.clone()));
        Self::with_parts(config, ui, identities)
    }

    /// Runner with injected UI driver and identity source
    pub fn with_parts(
        config: HarnessConfig,
        ui: Arc<dyn UiDriver>,
        identities: Arc<dyn IdentityGenerator>,
    ) -> E2eResult<Self> {
        config.validate()?;
        let http = HttpClient::new(&config.base_url, config.request_timeout())?;
        Ok(Self {
            executor: StepExecutor::new(http, ui.clone(), identities.clone()),
            config,
            ui,
            identities,
            backend: None,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn http(&self) -> &HttpClient {
        self.executor.http()
    }

    /// Spawn a fresh backend if one is configured and point the runner at it
    pub async fn start_backend(&mut self) -> E2eResult<()> {
        if self.backend.is_some() {
            return Ok(()); // Already running
        }
        let Some(backend_config) = self.config.backend.clone() else {
            return Ok(());
        };

        let backend = BackendHandle::spawn(backend_config).await?;
        let http = self.executor.http().with_base_url(backend.base_url())?;
        self.config.base_url = backend.base_url().to_string();
        self.executor = StepExecutor::new(http, self.ui.clone(), self.identities.clone());
        self.backend = Some(backend);
        Ok(())
    }

    pub async fn stop_backend(&mut self) -> E2eResult<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown().await?;
        }
        Ok(())
    }

    /// YAML scenarios from the configured specs directory
    pub fn discover(&self) -> E2eResult<Vec<Scenario>> {
        if !self.config.specs_dir.exists() {
            warn!("Specs directory {} does not exist", self.config.specs_dir.display());
            return Ok(Vec::new());
        }
        Scenario::load_all(&self.config.specs_dir)
    }

    /// Run scenarios and aggregate a report.
    ///
    /// Fails only for harness defects (malformed or duplicate scenarios);
    /// anything going wrong inside a scenario is recorded in its result.
    pub async fn run(&self, scenarios: &[Scenario]) -> E2eResult<Report> {
        for scenario in scenarios {
            scenario.validate()?;
        }
        ensure_unique_names(scenarios)?;

        let started_at = Utc::now();
        let start = Instant::now();
        info!("Running {} scenario(s)...", scenarios.len());

        let mut parallel = Vec::new();
        let mut serial = Vec::new();
        for (index, scenario) in scenarios.iter().enumerate() {
            if scenario.isolation == Isolation::Serial {
                serial.push(index);
            } else if scenario.uses_fixed_identity() {
                warn!(
                    "Scenario '{}' registers a fixed email; it can collide with earlier runs, running it serially",
                    scenario.name
                );
                serial.push(index);
            } else {
                parallel.push(index);
            }
        }

        let mut results: Vec<Option<ScenarioResult>> = vec![None; scenarios.len()];

        let permits = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut handles: Vec<(usize, JoinHandle<ScenarioResult>)> = Vec::with_capacity(parallel.len());
        for index in parallel {
            let scenario = scenarios[index].clone();
            let executor = self.executor.clone();
            let step_timeout = self.config.step_timeout();
            let permits = permits.clone();
            handles.push((
                index,
                tokio::spawn(async move {
                    // the semaphore is never closed
                    let _permit = permits.acquire_owned().await.ok();
                    run_scenario(&executor, &scenario, step_timeout).await
                }),
            ));
        }
        for (index, handle) in handles {
            results[index] = Some(join_result(&scenarios[index].name, handle).await);
        }

        for index in serial {
            let scenario = scenarios[index].clone();
            let executor = self.executor.clone();
            let step_timeout = self.config.step_timeout();
            let handle = tokio::spawn(async move { run_scenario(&executor, &scenario, step_timeout).await });
            results[index] = Some(join_result(&scenarios[index].name, handle).await);
        }

        let results: Vec<ScenarioResult> = results.into_iter().flatten().collect();
        let passed = results.iter().filter(|r| r.passed()).count();
        let failed = results.len() - passed;
        let duration_ms = start.elapsed().as_millis() as u64;

        for result in &results {
            if result.passed() {
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
            }
        }
        info!("Test Results: {} passed, {} failed ({} ms)", passed, failed, duration_ms);

        Ok(Report {
            started_at,
            total: results.len(),
            passed,
            failed,
            duration_ms,
            results,
        })
    }

    /// Run scenarios carrying `tag`
    pub async fn run_tagged(&self, scenarios: &[Scenario], tag: &str) -> E2eResult<Report> {
        let filtered: Vec<Scenario> = Scenario::filter_by_tag(scenarios, tag).into_iter().cloned().collect();
        self.run(&filtered).await
    }

    /// Run a single scenario by name
    pub async fn run_named(&self, scenarios: &[Scenario], name: &str) -> E2eResult<Report> {
        let scenario = scenarios
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| E2eError::SpecParse(format!("Scenario not found: {}", name)))?;
        self.run(std::slice::from_ref(&scenario)).await
    }

    /// Write the report to `<output_dir>/test-results.json`
    pub fn write_results(&self, report: &Report) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

async fn join_result(name: &str, handle: JoinHandle<ScenarioResult>) -> ScenarioResult {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            let reason = if e.is_panic() {
                "scenario panicked".to_string()
            } else {
                format!("scenario task aborted: {}", e)
            };
            ScenarioResult {
                name: name.to_string(),
                status: ScenarioStatus::Failed,
                duration_ms: 0,
                steps: Vec::new(),
                verdicts: VerdictLog::new(),
                error: Some(reason),
            }
        }
    }
}

/// Run one scenario with a fresh context and browser session
pub async fn run_scenario(executor: &StepExecutor, scenario: &Scenario, step_timeout: Duration) -> ScenarioResult {
    let start = Instant::now();
    let mut status = ScenarioStatus::Pending;
    let mut steps = Vec::with_capacity(scenario.steps.len());
    let mut verdicts = VerdictLog::new();
    let mut failure: Option<String> = None;
    let mut state = ScenarioState::new();

    match status.transition(ScenarioStatus::Running) {
        Ok(next) => status = next,
        Err(e) => failure = Some(e.to_string()),
    }
    debug!("Running scenario: {}", scenario.name);

    for step in &scenario.steps {
        if failure.is_some() {
            break;
        }
        let step_name = step.name();
        let step_start = Instant::now();
        let bound = executor.step_bound(step, step_timeout);

        let outcome = match tokio::time::timeout(bound, executor.execute(step, &mut state)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(E2eError::Timeout(format!("step '{}' exceeded {} ms", step_name, bound.as_millis()))),
        };
        let duration_ms = step_start.elapsed().as_millis() as u64;

        let (error, error_kind) = match outcome {
            Ok(step_verdicts) => {
                let first_failure = step_verdicts.iter().find(|v| !v.passed).map(Verdict::describe);
                verdicts.extend(step_verdicts);
                (first_failure, None)
            }
            Err(e) => {
                let kind = e.kind().to_string();
                (Some(e.to_string()), Some(kind))
            }
        };

        let error_kind = match (&error, error_kind) {
            (Some(_), None) => Some("assertion".to_string()),
            (_, kind) => kind,
        };
        if let Some(reason) = &error {
            failure = Some(format!("{}: {}", step_name, reason));
        }
        steps.push(StepResult {
            success: error.is_none(),
            step_name,
            duration_ms,
            error,
            error_kind,
        });
    }

    if let Err(e) = state.finish().await {
        warn!("Closing browser session for '{}' failed: {}", scenario.name, e);
    }

    let target = if failure.is_none() {
        ScenarioStatus::Passed
    } else {
        ScenarioStatus::Failed
    };
    status = status.transition(target).unwrap_or(ScenarioStatus::Failed);

    ScenarioResult {
        name: scenario.name.clone(),
        status,
        duration_ms: start.elapsed().as_millis() as u64,
        steps,
        verdicts,
        error: failure,
    }
}
