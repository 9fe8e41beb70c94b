//! Typed client for the FastCalc HTTP surface
//!
//! Each call is one request through [`HttpClient`]; non-2xx answers come
//! back as [`E2eError::Auth`], [`E2eError::Validation`] or
//! [`E2eError::StepFailed`] so callers can `?` through a flow.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{E2eError, E2eResult};
use crate::http::{bearer, HttpClient, HttpMethod, Response};

/// Calculation kinds accepted by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Divide,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Subtract => "SUBTRACT",
            Operation::Multiply => "MULTIPLY",
            Operation::Divide => "DIVIDE",
        }
    }

    /// Expected result, or None where the service must reject the input
    pub fn apply(&self, a: f64, b: f64) -> Option<f64> {
        match self {
            Operation::Add => Some(a + b),
            Operation::Subtract => Some(a - b),
            Operation::Multiply => Some(a * b),
            Operation::Divide if b == 0.0 => None,
            Operation::Divide => Some(a / b),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| E2eError::Validation {
                status: 422,
                detail: format!("Unsupported operation: {}", s),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    pub id: i64,
    #[serde(default)]
    pub a: Option<f64>,
    #[serde(default)]
    pub b: Option<f64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub result: f64,
    #[serde(default)]
    pub user_id: Option<i64>,
}

/// FastCalc API on top of the raw adapter
#[derive(Debug, Clone)]
pub struct FastCalcApi {
    http: HttpClient,
}

impl FastCalcApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// POST /register. FastCalc clients send the email as username.
    pub async fn register(&self, email: &str, username: &str, password: &str) -> E2eResult<TokenResponse> {
        let body = json!({ "email": email, "username": username, "password": password });
        self.call(HttpMethod::Post, "/register", Some(body), None, "register").await
    }

    /// POST /login
    pub async fn login(&self, username: &str, password: &str) -> E2eResult<TokenResponse> {
        let body = json!({ "username": username, "password": password });
        self.call(HttpMethod::Post, "/login", Some(body), None, "login").await
    }

    /// PUT /me/password
    pub async fn change_password(&self, token: &str, old_password: &str, new_password: &str) -> E2eResult<MessageResponse> {
        let body = json!({ "old_password": old_password, "new_password": new_password });
        self.call(HttpMethod::Put, "/me/password", Some(body), Some(token), "change_password").await
    }

    /// POST /calculations. `kind` is sent verbatim so unsupported values can be exercised.
    pub async fn create_calculation(&self, token: Option<&str>, a: f64, b: f64, kind: &str) -> E2eResult<Calculation> {
        let body = json!({ "a": a, "b": b, "type": kind });
        self.call(HttpMethod::Post, "/calculations", Some(body), token, "create_calculation").await
    }

    /// GET /calculations with pagination
    pub async fn list_calculations(&self, token: Option<&str>, skip: u32, limit: u32) -> E2eResult<Vec<Calculation>> {
        let path = format!("/calculations?skip={}&limit={}", skip, limit);
        self.call(HttpMethod::Get, &path, None, token, "list_calculations").await
    }

    /// GET /calculations/{id}
    pub async fn get_calculation(&self, token: Option<&str>, id: i64) -> E2eResult<Calculation> {
        let path = format!("/calculations/{}", id);
        self.call(HttpMethod::Get, &path, None, token, "get_calculation").await
    }

    /// GET /calculations/user/{user_id}
    pub async fn user_calculations(&self, token: Option<&str>, user_id: i64) -> E2eResult<Vec<Calculation>> {
        let path = format!("/calculations/user/{}", user_id);
        self.call(HttpMethod::Get, &path, None, token, "user_calculations").await
    }

    /// DELETE /calculations/{id}
    pub async fn delete_calculation(&self, token: Option<&str>, id: i64) -> E2eResult<()> {
        let path = format!("/calculations/{}", id);
        let response = self.raw(HttpMethod::Delete, &path, None, token).await?;
        response.error_for_status("delete_calculation")
    }

    /// Send without interpreting the status
    pub async fn raw(&self, method: HttpMethod, path: &str, body: Option<Value>, token: Option<&str>) -> E2eResult<Response> {
        let mut headers = BTreeMap::new();
        if let Some(token) = token {
            headers.insert("Authorization".to_string(), bearer(token));
        }
        self.http.send(method, path, body.as_ref(), &headers).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
        step: &str,
    ) -> E2eResult<T> {
        let response = self.raw(method, path, body, token).await?;
        response.error_for_status(step)?;
        serde_json::from_value(response.body).map_err(|e| E2eError::StepFailed {
            step: step.to_string(),
            reason: format!("unexpected response shape: {}", e),
        })
    }
}
