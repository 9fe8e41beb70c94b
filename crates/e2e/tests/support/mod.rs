//! In-process stand-ins for the FastCalc backend and its pages

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use fastcalc_e2e::config::HarnessConfig;
use fastcalc_e2e::{E2eError, E2eResult, UiDriver, UiSession};

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone)]
struct User {
    id: i64,
    email: String,
    password: String,
}

#[derive(Default)]
pub struct StubState {
    users: HashMap<String, User>,
    tokens: HashMap<String, String>,
    calculations: BTreeMap<i64, Value>,
    next_user_id: i64,
    next_calc_id: i64,
    next_token: u64,
    pub register_calls: usize,
    next_inflight_id: u64,
    in_flight: HashMap<u64, (String, usize)>,
    /// Caller and the highest number of overlapping `/inflight` requests seen while it ran
    pub overlap_log: Vec<(String, usize)>,
}

type Shared = Arc<Mutex<StubState>>;

/// Axum server answering like the FastCalc service
pub struct StubBackend {
    pub base_url: String,
    pub state: Shared,
    task: tokio::task::JoinHandle<()>,
}

impl StubBackend {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(StubState::default()));
        let app = Router::new()
            .route("/openapi.json", get(|| async { Json(json!({"openapi": "3.1.0"})) }))
            .route("/register", post(register))
            .route("/login", post(login))
            .route("/me/password", put(change_password))
            .route("/calculations", post(create_calculation).get(list_calculations))
            .route("/calculations/user/:user_id", get(user_calculations))
            .route("/calculations/:id", get(get_calculation).delete(delete_calculation))
            .route("/slow", get(slow))
            .route("/inflight", get(inflight))
            .route("/register.html", get(|| async { Html(REGISTER_PAGE) }))
            .route("/login.html", get(|| async { Html(LOGIN_PAGE) }))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            task,
        }
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().unwrap().register_calls
    }

    /// Peak overlap recorded for each finished `/inflight` request
    pub fn overlap_log(&self) -> Vec<(String, usize)> {
        self.state.lock().unwrap().overlap_log.clone()
    }

    /// Harness config pointed at this stub with short timeouts
    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            base_url: self.base_url.clone(),
            request_timeout_ms: 5_000,
            step_timeout_ms: 10_000,
            ..Default::default()
        }
    }
}

impl Drop for StubBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn authenticated(state: &StubState, headers: &HeaderMap) -> Option<User> {
    let token = headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    let username = state.tokens.get(token)?;
    state.users.get(username).cloned()
}

fn issue_token(state: &mut StubState, username: &str) -> String {
    state.next_token += 1;
    let token = format!("tok-{}-{}", state.next_token, username.len());
    state.tokens.insert(token.clone(), username.to_string());
    token
}

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    username: String,
    password: String,
}

async fn register(State(state): State<Shared>, Json(req): Json<RegisterRequest>) -> Response {
    let mut state = state.lock().unwrap();
    state.register_calls += 1;
    if state.users.contains_key(&req.username) || state.users.values().any(|u| u.email == req.email) {
        return reply(StatusCode::BAD_REQUEST, json!({"detail": "Username or email already registered"}));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return reply(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({"detail": [{"loc": ["body", "password"], "msg": "Password too short"}]}),
        );
    }
    state.next_user_id += 1;
    let user = User {
        id: state.next_user_id,
        email: req.email,
        password: req.password,
    };
    state.users.insert(req.username.clone(), user);
    let token = issue_token(&mut state, &req.username);
    reply(StatusCode::OK, json!({"access_token": token, "token_type": "bearer"}))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<Shared>, Json(req): Json<LoginRequest>) -> Response {
    let mut state = state.lock().unwrap();
    let valid = state
        .users
        .get(&req.username)
        .is_some_and(|u| u.password == req.password);
    if !valid {
        return reply(StatusCode::UNAUTHORIZED, json!({"detail": "Invalid credentials"}));
    }
    let token = issue_token(&mut state, &req.username);
    reply(StatusCode::OK, json!({"access_token": token, "token_type": "bearer"}))
}

#[derive(Deserialize)]
struct PasswordChange {
    old_password: String,
    new_password: String,
}

async fn change_password(State(state): State<Shared>, headers: HeaderMap, Json(req): Json<PasswordChange>) -> Response {
    let mut state = state.lock().unwrap();
    let Some(user) = authenticated(&state, &headers) else {
        return reply(StatusCode::UNAUTHORIZED, json!({"detail": "Not authenticated"}));
    };
    if user.password != req.old_password {
        return reply(StatusCode::BAD_REQUEST, json!({"detail": "Incorrect old password"}));
    }
    if let Some(stored) = state.users.values_mut().find(|u| u.id == user.id) {
        stored.password = req.new_password;
    }
    reply(StatusCode::OK, json!({"message": "Password updated successfully"}))
}

#[derive(Deserialize)]
struct CalculationRequest {
    a: f64,
    b: f64,
    #[serde(rename = "type")]
    kind: String,
}

async fn create_calculation(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(req): Json<CalculationRequest>,
) -> Response {
    let mut state = state.lock().unwrap();
    let Some(user) = authenticated(&state, &headers) else {
        return reply(StatusCode::UNAUTHORIZED, json!({"detail": "Not authenticated"}));
    };
    let kind = req.kind.to_uppercase();
    let result = match kind.as_str() {
        "ADD" => req.a + req.b,
        "SUBTRACT" => req.a - req.b,
        "MULTIPLY" => req.a * req.b,
        "DIVIDE" if req.b == 0.0 => {
            return reply(StatusCode::BAD_REQUEST, json!({"detail": "Cannot divide by zero"}));
        }
        "DIVIDE" => req.a / req.b,
        _ => {
            return reply(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({"detail": [{
                    "loc": ["body", "type"],
                    "msg": format!("Value error, Unsupported operation: {}. Supported operations: ADD, SUBTRACT, MULTIPLY, DIVIDE", kind),
                }]}),
            );
        }
    };
    state.next_calc_id += 1;
    let id = state.next_calc_id;
    let calc = json!({"id": id, "a": req.a, "b": req.b, "type": kind, "result": result, "user_id": user.id});
    state.calculations.insert(id, calc.clone());
    reply(StatusCode::OK, calc)
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_calculations(State(state): State<Shared>, Query(page): Query<Page>) -> Response {
    let state = state.lock().unwrap();
    let items: Vec<Value> = state
        .calculations
        .values()
        .skip(page.skip)
        .take(page.limit)
        .cloned()
        .collect();
    reply(StatusCode::OK, Value::Array(items))
}

async fn get_calculation(State(state): State<Shared>, Path(id): Path<i64>) -> Response {
    let state = state.lock().unwrap();
    match state.calculations.get(&id) {
        Some(calc) => reply(StatusCode::OK, calc.clone()),
        None => reply(StatusCode::NOT_FOUND, json!({"detail": "Calculation not found"})),
    }
}

async fn user_calculations(State(state): State<Shared>, Path(user_id): Path<i64>) -> Response {
    let state = state.lock().unwrap();
    if !state.users.values().any(|u| u.id == user_id) {
        return reply(StatusCode::NOT_FOUND, json!({"detail": "User not found"}));
    }
    let items: Vec<Value> = state
        .calculations
        .values()
        .filter(|c| c["user_id"] == json!(user_id))
        .cloned()
        .collect();
    reply(StatusCode::OK, Value::Array(items))
}

async fn delete_calculation(State(state): State<Shared>, Path(id): Path<i64>) -> Response {
    let mut state = state.lock().unwrap();
    match state.calculations.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => reply(StatusCode::NOT_FOUND, json!({"detail": "Calculation not found"})),
    }
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(3)).await;
    reply(StatusCode::OK, json!({"slow": true}))
}

/// Holds the request open for a while and records how many other
/// `/inflight` requests overlapped with it.
async fn inflight(State(state): State<Shared>, Query(query): Query<HashMap<String, String>>) -> Response {
    let caller = query.get("caller").cloned().unwrap_or_default();
    let id = {
        let mut state = state.lock().unwrap();
        state.next_inflight_id += 1;
        let id = state.next_inflight_id;
        let now = state.in_flight.len() + 1;
        for (_, peak) in state.in_flight.values_mut() {
            *peak = (*peak).max(now);
        }
        state.in_flight.insert(id, (caller, now));
        id
    };

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut state = state.lock().unwrap();
    if let Some(entry) = state.in_flight.remove(&id) {
        state.overlap_log.push(entry);
    }
    reply(StatusCode::OK, json!({"ok": true}))
}

const REGISTER_PAGE: &str = r#"<!doctype html>
<input id="email"><input id="password" type="password">
<button id="registerBtn">Register</button><div id="message"></div>"#;

const LOGIN_PAGE: &str = r#"<!doctype html>
<input id="email"><input id="password" type="password">
<button id="loginBtn">Login</button><div id="message"></div>"#;

/// Emulates the two pages: form fields, the button scripts, and a
/// `#message` that appears shortly after the click.
pub struct FormDriver {
    base_url: String,
    client: reqwest::Client,
    pub sessions_opened: Arc<AtomicUsize>,
    pub sessions_closed: Arc<AtomicUsize>,
}

impl FormDriver {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            client: reqwest::Client::new(),
            sessions_opened: Arc::new(AtomicUsize::new(0)),
            sessions_closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl UiDriver for FormDriver {
    async fn new_session(&self) -> E2eResult<Box<dyn UiSession>> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FormSession {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            page: None,
            fields: HashMap::new(),
            message: None,
            closed: self.sessions_closed.clone(),
        }))
    }
}

struct FormSession {
    base_url: String,
    client: reqwest::Client,
    page: Option<String>,
    fields: HashMap<String, String>,
    message: Option<(String, Instant)>,
    closed: Arc<AtomicUsize>,
}

impl FormSession {
    fn field(&self, selector: &str) -> String {
        self.fields.get(selector).cloned().unwrap_or_default()
    }

    async fn post(&self, path: &str, body: Value) -> E2eResult<(u16, Value)> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok((status, response.json().await.unwrap_or(Value::Null)))
    }

    fn show(&mut self, text: impl Into<String>) {
        self.message = Some((text.into(), Instant::now() + Duration::from_millis(150)));
    }
}

#[async_trait]
impl UiSession for FormSession {
    async fn open(&mut self, url: &str) -> E2eResult<()> {
        let page = url.rsplit('/').next().unwrap_or_default().to_string();
        if page != "register.html" && page != "login.html" {
            return Err(E2eError::Playwright(format!("net::ERR_HTTP_RESPONSE_CODE_FAILURE at {}", url)));
        }
        self.page = Some(page);
        self.fields.clear();
        self.message = None;
        Ok(())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> E2eResult<()> {
        if self.page.is_none() {
            return Err(E2eError::Timeout(format!("fill {}: no page loaded", selector)));
        }
        self.fields.insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> E2eResult<()> {
        let email = self.field("#email");
        let password = self.field("#password");
        match (self.page.as_deref(), selector) {
            (Some("register.html"), "#registerBtn") => {
                if password.len() < MIN_PASSWORD_LEN {
                    self.show("Password too short!");
                    return Ok(());
                }
                let (status, body) = self
                    .post("/register", json!({"email": email, "username": email, "password": password}))
                    .await?;
                if status == 200 {
                    self.show("Registration successful!");
                } else {
                    self.show(format!("Registration failed: {}", body["detail"]));
                }
            }
            (Some("login.html"), "#loginBtn") => {
                let (status, _) = self
                    .post("/login", json!({"username": email, "password": password}))
                    .await?;
                if status == 200 {
                    self.show("Login successful");
                } else {
                    self.show("Invalid credentials");
                }
            }
            _ => {
                return Err(E2eError::Timeout(format!("click {}: element not found", selector)));
            }
        }
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> E2eResult<Option<String>> {
        if self.page.is_none() || selector != "#message" {
            return Ok(None);
        }
        Ok(Some(match &self.message {
            Some((text, visible_at)) if Instant::now() >= *visible_at => text.clone(),
            _ => String::new(),
        }))
    }

    async fn close(&mut self) -> E2eResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Driver whose sessions always panic; used to check isolation
pub struct PanickingDriver;

#[async_trait]
impl UiDriver for PanickingDriver {
    async fn new_session(&self) -> E2eResult<Box<dyn UiSession>> {
        panic!("browser crashed");
    }
}
