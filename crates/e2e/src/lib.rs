//! FastCalc contract test harness
//!
//! This crate verifies the FastCalc service from the outside:
//! - Talks to the JSON API through a thin reqwest adapter
//! - Drives `register.html` / `login.html` through Playwright
//! - Composes user flows into scenarios, from Rust or from YAML specs
//! - Runs scenarios concurrently with per-scenario failure isolation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    E2E Test Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── start_backend() -> BackendHandle                     │
//! │    ├── run(scenarios) -> Report                             │
//! │    └── run_scenario(scenario) -> ScenarioResult             │
//! │          └── StepExecutor                                   │
//! │                ├── HttpClient   (request steps)             │
//! │                ├── UiSession    (open/fill/click/wait)      │
//! │                └── assertions -> Verdict                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scenario (Rust builder or YAML)                            │
//! │    ├── name, description, tags, isolation                   │
//! │    └── steps: [TestStep]                                    │
//! │          ├── generate_identity { key, prefix }              │
//! │          ├── request { method, path, body, expect, save }   │
//! │          ├── open / fill / click                            │
//! │          └── wait_for_text { selector, pattern, timeout }   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod assertion;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod http;
pub mod playwright;
pub mod runner;
pub mod server;
pub mod spec;
pub mod suites;
pub mod ui;

pub use api::{FastCalcApi, Operation};
pub use assertion::{Verdict, VerdictLog};
pub use config::HarnessConfig;
pub use context::{IdentityGenerator, ScenarioContext, UniqueIdentities};
pub use error::{E2eError, E2eResult};
pub use flow::{define, RequestStep, ScenarioBuilder};
pub use http::{HttpClient, HttpMethod, Response};
pub use runner::{Report, ScenarioResult, ScenarioStatus, TestRunner};
pub use spec::{Expect, Isolation, Scenario, TestStep};
pub use ui::{UiDriver, UiObservation, UiSession};
