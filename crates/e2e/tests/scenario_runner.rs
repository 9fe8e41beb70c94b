//! Scenario runner against the stub backend

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fastcalc_e2e::flow::RequestStep;
use fastcalc_e2e::http::HttpMethod;
use fastcalc_e2e::{
    suites, E2eError, Expect, Scenario, ScenarioBuilder, ScenarioStatus, TestRunner, UniqueIdentities,
};
use serde_json::json;

use support::{FormDriver, PanickingDriver, StubBackend};

fn runner(stub: &StubBackend) -> TestRunner {
    runner_with(stub, stub.config())
}

fn runner_with(stub: &StubBackend, config: fastcalc_e2e::HarnessConfig) -> TestRunner {
    TestRunner::with_parts(
        config,
        Arc::new(FormDriver::new(&stub.base_url)),
        Arc::new(UniqueIdentities::new("example.com")),
    )
    .unwrap()
}

#[tokio::test]
async fn builtin_suite_passes_against_conforming_backend() {
    let stub = StubBackend::start().await;
    let scenarios = suites::builtin().unwrap();

    let report = runner(&stub).run(&scenarios).await.unwrap();

    for result in report.failures() {
        panic!("{} failed: {:?}", result.name, result.error);
    }
    assert_eq!(report.total, scenarios.len());
    assert_eq!(report.passed, scenarios.len());
    assert!(report.is_success());

    // report keeps definition order regardless of scheduling
    let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
    let expected: Vec<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn calculation_add_records_verdicts() {
    let stub = StubBackend::start().await;
    let report = runner(&stub).run(&[suites::calculation_add().unwrap()]).await.unwrap();

    let result = report.result("calculation-add").unwrap();
    assert_eq!(result.status, ScenarioStatus::Passed);
    let contexts: Vec<&str> = result.verdicts.entries().iter().map(|v| v.context.as_str()).collect();
    assert!(contexts.contains(&"POST /calculations: body.result"));
    assert!(contexts.contains(&"POST /calculations: body.type"));
    assert!(result.verdicts.all_passed());
}

#[tokio::test]
async fn failing_scenario_does_not_abort_siblings() {
    let stub = StubBackend::start().await;
    let wrong = ScenarioBuilder::new("expects-wrong-result")
        .generate_identity("email", "calcuser")
        .post(
            "/register",
            json!({"email": "${email}", "username": "${email}", "password": "testpass123"}),
            |r| r.expect(Expect::status(200)).save("token", "access_token"),
        )
        .post("/calculations", json!({"a": 10, "b": 5, "type": "add"}), |r| {
            r.bearer("token").expect(Expect::status(200).equals("result", 16))
        })
        .log("never reached")
        .build()
        .unwrap();
    let scenarios = vec![
        suites::register_and_login().unwrap(),
        wrong,
        suites::calculation_without_token().unwrap(),
    ];

    let report = runner(&stub).run(&scenarios).await.unwrap();

    assert_eq!(report.passed, 2);
    assert_eq!(report.failed, 1);
    let failed = report.result("expects-wrong-result").unwrap();
    assert_eq!(failed.status, ScenarioStatus::Failed);

    let step = failed.failed_step().unwrap();
    assert_eq!(step.step_name, "POST /calculations");
    assert_eq!(step.error_kind.as_deref(), Some("assertion"));
    // the log step after the failure never ran
    assert_eq!(failed.steps.len(), 3);

    let verdict = failed.verdicts.failures().next().unwrap();
    assert_eq!(verdict.expected.as_deref(), Some("16"));
    assert_eq!(verdict.actual.as_deref(), Some("15.0"));
    assert!(failed.error.as_deref().unwrap().contains("expected 16"));
}

#[tokio::test]
async fn unexpected_status_without_expectation_is_auth_error() {
    let stub = StubBackend::start().await;
    let scenario = ScenarioBuilder::new("implicit-success")
        .post("/calculations", json!({"a": 1, "b": 2, "type": "add"}), |r| r)
        .build()
        .unwrap();

    let report = runner(&stub).run(&[scenario]).await.unwrap();
    let result = &report.results[0];
    assert_eq!(result.status, ScenarioStatus::Failed);
    assert_eq!(result.steps[0].error_kind.as_deref(), Some("auth"));
}

#[tokio::test]
async fn context_threads_between_steps() {
    let stub = StubBackend::start().await;
    let scenario = ScenarioBuilder::new("context-threading")
        .generate_identity("email", "user")
        .set("password", "testpass123")
        .post(
            "/register",
            json!({"email": "${email}", "username": "${email}", "password": "${password}"}),
            |r| r.expect(Expect::status(200)).save("token", "access_token"),
        )
        .assert_context("token", None, Some("^tok-".to_string()))
        .post("/calculations", json!({"a": 2, "b": 3, "type": "multiply"}), |r| {
            r.bearer("token").expect(Expect::status(200)).save("calc_id", "id")
        })
        .request(
            RequestStep::new(HttpMethod::Get, "/calculations/${calc_id}")
                .expect(Expect::status(200).equals("id", "${calc_id}").equals("result", 6)),
        )
        .build()
        .unwrap();

    let report = runner(&stub).run(&[scenario]).await.unwrap();
    assert!(report.is_success(), "{:?}", report.results[0].error);
}

#[tokio::test]
async fn unbound_variable_fails_the_scenario() {
    let stub = StubBackend::start().await;
    let scenario = ScenarioBuilder::new("missing-token")
        .post("/calculations", json!({"a": 1, "b": 2, "type": "add"}), |r| {
            r.bearer("token").expect(Expect::status(200))
        })
        .build()
        .unwrap();

    let report = runner(&stub).run(&[scenario]).await.unwrap();
    let step = report.results[0].failed_step().unwrap();
    assert_eq!(step.error_kind.as_deref(), Some("unbound_variable"));
}

#[tokio::test]
async fn unreachable_endpoint_fails_without_retry() {
    let stub = StubBackend::start().await;
    let port = fastcalc_e2e::server::find_free_port().unwrap();
    let mut config = stub.config();
    config.base_url = format!("http://127.0.0.1:{}", port);

    let report = runner_with(&stub, config)
        .run(&[suites::calculation_without_token().unwrap()])
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.status, ScenarioStatus::Failed);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].error_kind.as_deref(), Some("network"));
}

#[tokio::test]
async fn step_timeout_cancels_only_that_scenario() {
    let stub = StubBackend::start().await;
    let mut config = stub.config();
    config.step_timeout_ms = 300;

    let slow = ScenarioBuilder::new("slow-endpoint")
        .request(RequestStep::new(HttpMethod::Get, "/slow").expect(Expect::status(200)))
        .build()
        .unwrap();
    let overridden = ScenarioBuilder::new("slow-endpoint-request-timeout")
        .request(
            RequestStep::new(HttpMethod::Get, "/slow")
                .timeout(Duration::from_millis(200))
                .expect(Expect::status(200)),
        )
        .build()
        .unwrap();
    let scenarios = vec![slow, overridden, suites::calculation_without_token().unwrap()];

    let report = runner_with(&stub, config).run(&scenarios).await.unwrap();

    let slow = report.result("slow-endpoint").unwrap();
    assert_eq!(slow.steps[0].error_kind.as_deref(), Some("timeout"));
    let overridden = report.result("slow-endpoint-request-timeout").unwrap();
    assert_eq!(overridden.steps[0].error_kind.as_deref(), Some("network"));
    assert!(report.result("calculation-without-token").unwrap().passed());
}

fn holds_connection(name: &str) -> ScenarioBuilder {
    ScenarioBuilder::new(name).request(
        RequestStep::new(HttpMethod::Get, format!("/inflight?caller={}", name)).expect(Expect::status(200)),
    )
}

#[tokio::test]
async fn parallel_scenarios_respect_max_parallel() {
    let stub = StubBackend::start().await;
    let mut config = stub.config();
    config.max_parallel = 2;

    let scenarios: Vec<Scenario> = (0..6)
        .map(|i| holds_connection(&format!("parallel-{}", i)).build().unwrap())
        .collect();
    let report = runner_with(&stub, config).run(&scenarios).await.unwrap();
    assert!(report.is_success());

    let log = stub.overlap_log();
    assert_eq!(log.len(), 6);
    let peak = log.iter().map(|(_, overlap)| *overlap).max().unwrap();
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn serial_scenarios_never_overlap() {
    let stub = StubBackend::start().await;
    let mut config = stub.config();
    config.max_parallel = 4;

    let mut scenarios = Vec::new();
    for i in 0..4 {
        scenarios.push(holds_connection(&format!("parallel-{}", i)).build().unwrap());
        if i % 2 == 0 {
            scenarios.push(holds_connection(&format!("serial-{}", i)).serial().build().unwrap());
        }
    }
    let report = runner_with(&stub, config).run(&scenarios).await.unwrap();
    assert!(report.is_success());

    let log = stub.overlap_log();
    assert_eq!(log.len(), 6);
    for (caller, overlap) in &log {
        if caller.starts_with("serial-") {
            assert_eq!(*overlap, 1, "{} overlapped with another scenario", caller);
        } else {
            assert!(*overlap <= 4);
        }
    }
    // the report still follows definition order
    assert_eq!(report.results[1].name, "serial-0");
}

#[tokio::test]
async fn panicking_scenario_is_isolated() {
    let stub = StubBackend::start().await;
    let runner = TestRunner::with_parts(
        stub.config(),
        Arc::new(PanickingDriver),
        Arc::new(UniqueIdentities::new("example.com")),
    )
    .unwrap();
    let scenarios = vec![
        suites::ui_register_short_password().unwrap(),
        suites::register_and_login().unwrap(),
    ];

    let report = runner.run(&scenarios).await.unwrap();

    let crashed = report.result("ui-register-short-password").unwrap();
    assert_eq!(crashed.status, ScenarioStatus::Failed);
    assert_eq!(crashed.error.as_deref(), Some("scenario panicked"));
    assert!(report.result("register-and-login").unwrap().passed());
}

#[tokio::test]
async fn duplicate_scenarios_abort_the_run() {
    let stub = StubBackend::start().await;
    let scenarios = vec![
        suites::register_and_login().unwrap(),
        suites::register_and_login().unwrap(),
    ];

    let err = runner(&stub).run(&scenarios).await.unwrap_err();
    assert!(err.is_harness_defect());
    assert!(matches!(err, E2eError::InvalidScenario { .. }));
    assert_eq!(stub.register_calls(), 0);
}

#[tokio::test]
async fn fixed_identity_scenarios_run_but_collide_on_rerun() {
    let stub = StubBackend::start().await;
    let fixed = Scenario::from_yaml(
        r#"
name: fixed-identity
steps:
  - action: request
    method: POST
    path: /register
    body: { email: calcuser@example.com, username: calcuser@example.com, password: testpass123 }
    expect:
      status: 200
"#,
    )
    .unwrap();
    assert!(fixed.uses_fixed_identity());

    let runner = runner(&stub);
    assert!(runner.run(std::slice::from_ref(&fixed)).await.unwrap().is_success());
    // a second run hits the account left behind by the first
    let rerun = runner.run(std::slice::from_ref(&fixed)).await.unwrap();
    assert_eq!(rerun.failed, 1);
}

#[tokio::test]
async fn yaml_specs_match_builtin_behaviour() {
    let stub = StubBackend::start().await;
    let mut config = stub.config();
    config.specs_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs");
    let runner = runner_with(&stub, config);

    let scenarios = runner.discover().unwrap();
    assert!(scenarios.len() >= 6);

    let report = runner.run(&scenarios).await.unwrap();
    for result in report.failures() {
        panic!("{} failed: {:?}", result.name, result.error);
    }

    let api_only = runner.run_tagged(&scenarios, "calc").await.unwrap();
    assert!(api_only.total >= 3);
    assert!(api_only.is_success());
}

#[tokio::test]
async fn run_named_and_write_results() {
    let stub = StubBackend::start().await;
    let output = tempfile::tempdir().unwrap();
    let mut config = stub.config();
    config.output_dir = output.path().to_path_buf();
    let runner = runner_with(&stub, config);

    let scenarios = suites::builtin().unwrap();
    let report = runner.run_named(&scenarios, "change-password").await.unwrap();
    assert_eq!(report.total, 1);
    assert!(report.is_success());

    let path = runner.write_results(&report).unwrap();
    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(written["passed"], 1);
    assert_eq!(written["results"][0]["status"], "passed");

    let err = runner.run_named(&scenarios, "no-such-scenario").await.unwrap_err();
    assert!(matches!(err, E2eError::SpecParse(_)));
}
