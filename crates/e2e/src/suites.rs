//! Built-in FastCalc scenarios
//!
//! Every scenario that registers an account generates its own identity.

use std::time::Duration;
use serde_json::json;

use crate::api::Operation;
use crate::error::E2eResult;
use crate::flow::ScenarioBuilder;
use crate::spec::{Expect, Scenario};

pub const VALID_PASSWORD: &str = "testpass123";
pub const WRONG_PASSWORD: &str = "wrongpass456";
pub const NEW_PASSWORD: &str = "newpass456";
pub const SHORT_PASSWORD: &str = "123";

/// Bound for page messages to appear
pub const UI_TIMEOUT: Duration = Duration::from_secs(5);

/// All built-in scenarios
pub fn builtin() -> E2eResult<Vec<Scenario>> {
    let mut scenarios = vec![
        register_and_login()?,
        login_wrong_password()?,
        change_password()?,
        calculation_add()?,
        calculation_without_token()?,
        calculation_invalid_type()?,
        ui_register_success()?,
        ui_register_short_password()?,
        ui_login_success()?,
        ui_login_invalid_credentials()?,
    ];
    for op in [Operation::Subtract, Operation::Multiply, Operation::Divide] {
        scenarios.push(calculation_operation(op, 10.0, 5.0)?);
    }
    Ok(scenarios)
}

/// Fresh identity, registered, with its token saved as `token`
fn registered(name: &str, prefix: &str) -> ScenarioBuilder {
    ScenarioBuilder::new(name)
        .generate_identity("email", prefix)
        .set("password", VALID_PASSWORD)
        .post(
            "/register",
            json!({"email": "${email}", "username": "${email}", "password": "${password}"}),
            |r| r.expect(Expect::status(200).defined("access_token")).save("token", "access_token"),
        )
}

fn login(builder: ScenarioBuilder, password_key: &str, expect: Expect) -> ScenarioBuilder {
    builder.post(
        "/login",
        json!({"username": "${email}", "password": format!("${{{}}}", password_key)}),
        |r| r.expect(expect),
    )
}

pub fn register_and_login() -> E2eResult<Scenario> {
    let builder = registered("register-and-login", "user")
        .describe("Register and login with valid data")
        .tag("auth")
        .tag("api");
    login(builder, "password", Expect::status(200).defined("access_token")).build()
}

pub fn login_wrong_password() -> E2eResult<Scenario> {
    let builder = registered("login-wrong-password", "user")
        .describe("Login with a wrong password is rejected")
        .tag("auth")
        .tag("api")
        .set("wrong_password", WRONG_PASSWORD);
    login(
        builder,
        "wrong_password",
        Expect::status(401).equals("detail", "Invalid credentials"),
    )
    .build()
}

/// Old password stops working and the new one starts working, in that order
pub fn change_password() -> E2eResult<Scenario> {
    let builder = registered("change-password", "user")
        .describe("Change password, then only the new password logs in")
        .tag("auth")
        .tag("api")
        .set("new_password", NEW_PASSWORD)
        .put(
            "/me/password",
            json!({"old_password": "${password}", "new_password": "${new_password}"}),
            |r| {
                r.bearer("token")
                    .expect(Expect::status(200).equals("message", "Password updated successfully"))
            },
        );
    let builder = login(builder, "password", Expect::status(401));
    login(builder, "new_password", Expect::status(200).defined("access_token")).build()
}

pub fn calculation_add() -> E2eResult<Scenario> {
    registered("calculation-add", "calcuser")
        .describe("Create a calculation with valid data")
        .tag("calc")
        .tag("api")
        .post("/calculations", json!({"a": 10, "b": 5, "type": "add"}), |r| {
            r.bearer("token").expect(
                Expect::status(200)
                    .defined("id")
                    .equals("result", 15)
                    .equals("type", "ADD"),
            )
        })
        .build()
}

pub fn calculation_without_token() -> E2eResult<Scenario> {
    ScenarioBuilder::new("calculation-without-token")
        .describe("Create a calculation without a token")
        .tag("calc")
        .tag("api")
        .post("/calculations", json!({"a": 10, "b": 5, "type": "add"}), |r| {
            r.expect(Expect::status(401).equals("detail", "Not authenticated"))
        })
        .build()
}

pub fn calculation_invalid_type() -> E2eResult<Scenario> {
    let builder = registered("calculation-invalid-type", "calcuser")
        .describe("Create a calculation with an unsupported type")
        .tag("calc")
        .tag("api");
    login(builder, "password", Expect::status(200).defined("access_token"))
        .post("/calculations", json!({"a": 5, "b": 3, "type": "invalid_op"}), |r| {
            r.bearer("token").expect(
                Expect::status(422)
                    .defined("detail")
                    .matches("detail.0.msg", "(?i)Unsupported operation"),
            )
        })
        .build()
}

/// One supported operation end to end; expected result computed locally
pub fn calculation_operation(op: Operation, a: f64, b: f64) -> E2eResult<Scenario> {
    let name = format!("calculation-{}", op.as_str().to_lowercase());
    let mut expect = Expect::status(200).defined("id").equals("type", op.as_str());
    if let Some(result) = op.apply(a, b) {
        expect = expect.equals("result", result);
    }
    registered(&name, "calcuser")
        .describe(format!("Create a {} calculation", op))
        .tag("calc")
        .tag("api")
        .post(
            "/calculations",
            json!({"a": a, "b": b, "type": op.as_str().to_lowercase()}),
            move |r| r.bearer("token").expect(expect),
        )
        .build()
}

pub fn ui_register_success() -> E2eResult<Scenario> {
    ScenarioBuilder::new("ui-register-success")
        .describe("Register through the page")
        .tag("ui")
        .tag("auth")
        .generate_identity("email", "uiuser")
        .open("/register.html")
        .fill("#email", "${email}")
        .fill("#password", VALID_PASSWORD)
        .click("#registerBtn")
        .wait_for_text("#message", "(?i)Registration successful!", UI_TIMEOUT)
        .build()
}

pub fn ui_register_short_password() -> E2eResult<Scenario> {
    ScenarioBuilder::new("ui-register-short-password")
        .describe("Registration page rejects a short password")
        .tag("ui")
        .tag("auth")
        .generate_identity("email", "uiuser")
        .open("/register.html")
        .fill("#email", "${email}")
        .fill("#password", SHORT_PASSWORD)
        .click("#registerBtn")
        .wait_for_text("#message", "(?i)Password too short!", UI_TIMEOUT)
        .build()
}

pub fn ui_login_success() -> E2eResult<Scenario> {
    ScenarioBuilder::new("ui-login-success")
        .describe("Register through the page, then log in")
        .tag("ui")
        .tag("auth")
        .generate_identity("email", "uiuser")
        .open("/register.html")
        .fill("#email", "${email}")
        .fill("#password", VALID_PASSWORD)
        .click("#registerBtn")
        .wait_for_text("#message", "(?i)Registration successful!", UI_TIMEOUT)
        .open("/login.html")
        .fill("#email", "${email}")
        .fill("#password", VALID_PASSWORD)
        .click("#loginBtn")
        .wait_for_text("#message", "(?i)Login successful", Duration::from_secs(10))
        .build()
}

pub fn ui_login_invalid_credentials() -> E2eResult<Scenario> {
    ScenarioBuilder::new("ui-login-invalid-credentials")
        .describe("Login page reports invalid credentials")
        .tag("ui")
        .tag("auth")
        .generate_identity("email", "uiuser")
        .open("/login.html")
        .fill("#email", "${email}")
        .fill("#password", WRONG_PASSWORD)
        .click("#loginBtn")
        .wait_for_text("#message", "(?i)Invalid credentials", Duration::from_secs(10))
        .build()
}
