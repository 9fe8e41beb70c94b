//! HTTP client adapter for the API under test

use std::collections::BTreeMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A response as observed by a step. Never mutated after it is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    /// Parsed JSON body; non-JSON bodies are kept as a string, empty bodies as null
    pub body: Value,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The backend's `detail` field rendered as text
    pub fn detail(&self) -> String {
        match self.body.get("detail") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => self.body.to_string(),
        }
    }

    /// Turn a non-2xx response into the matching error kind
    pub fn error_for_status(&self, step: &str) -> E2eResult<()> {
        match self.status {
            200..=299 => Ok(()),
            401 | 403 => Err(E2eError::Auth {
                status: self.status,
                detail: self.detail(),
            }),
            422 => Err(E2eError::Validation {
                status: self.status,
                detail: self.detail(),
            }),
            status => Err(E2eError::StepFailed {
                step: step.to_string(),
                reason: format!("unexpected status {}: {}", status, self.detail()),
            }),
        }
    }
}

/// Thin wrapper over reqwest. Every call goes to the network: no retries,
/// no caching, no deduplication.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: parse_base(base_url)?,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Same client pointed at another base URL
    pub fn with_base_url(&self, base_url: &str) -> E2eResult<Self> {
        Ok(Self {
            client: self.client.clone(),
            base_url: parse_base(base_url)?,
            timeout: self.timeout,
        })
    }

    /// Resolve a path against the base URL, keeping any path prefix of the
    /// base (`http://host/api` + `/login` is `http://host/api/login`).
    /// Absolute URLs pass through.
    pub fn resolve(&self, path: &str) -> E2eResult<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Issue a single request
    pub async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
        headers: &BTreeMap<String, String>,
    ) -> E2eResult<Response> {
        self.send_with_timeout(method, path, body, headers, self.timeout).await
    }

    pub async fn send_with_timeout(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> E2eResult<Response> {
        let url = self.resolve(path)?;
        debug!("{} {}", method.as_str(), url);

        let mut request = self
            .client
            .request(method.to_reqwest(), url.clone())
            .timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| classify(&url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let raw = response.text().await.map_err(|e| classify(&url, e))?;
        let body = parse_body(&raw);

        debug!("{} {} -> {}", method.as_str(), url, status);
        Ok(Response { status, body, headers })
    }
}

/// Base URLs always end in `/` so joins append to their path
fn parse_base(base_url: &str) -> E2eResult<Url> {
    let mut url = Url::parse(base_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn classify(url: &Url, err: reqwest::Error) -> E2eError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        E2eError::Network {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        E2eError::Http(err)
    }
}

fn parse_body(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `Authorization` header value for a bearer token
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}
