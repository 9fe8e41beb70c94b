//! UI driver abstraction
//!
//! A driver hands out isolated sessions; one session belongs to one
//! scenario run and is closed when the run ends.

use std::time::{Duration, Instant};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Poll interval for [`UiSession::wait_for_text`]
pub const TEXT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Text of a UI element observed after an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiObservation {
    pub selector: String,
    pub text: String,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait UiDriver: Send + Sync {
    /// A fresh browser session sharing nothing with earlier sessions
    async fn new_session(&self) -> E2eResult<Box<dyn UiSession>>;
}

#[async_trait]
pub trait UiSession: Send {
    /// Navigate to an absolute URL
    async fn open(&mut self, url: &str) -> E2eResult<()>;

    async fn fill(&mut self, selector: &str, value: &str) -> E2eResult<()>;

    async fn click(&mut self, selector: &str) -> E2eResult<()>;

    /// Current text of the element, None when it is not in the page
    async fn read_text(&mut self, selector: &str) -> E2eResult<Option<String>>;

    /// Release the session
    async fn close(&mut self) -> E2eResult<()>;

    /// Poll the element until its text matches `pattern`. The bound is
    /// always chosen by the caller.
    async fn wait_for_text(
        &mut self,
        selector: &str,
        pattern: &Regex,
        timeout: Duration,
    ) -> E2eResult<UiObservation> {
        let start = Instant::now();
        let mut last_seen: Option<String> = None;

        loop {
            if let Some(text) = self.read_text(selector).await? {
                if pattern.is_match(&text) {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    debug!("{} matched /{}/ after {} ms", selector, pattern.as_str(), elapsed_ms);
                    return Ok(UiObservation {
                        selector: selector.to_string(),
                        text,
                        elapsed_ms,
                    });
                }
                last_seen = Some(text);
            }

            if start.elapsed() >= timeout {
                return Err(E2eError::Timeout(format!(
                    "{} to match /{}/ within {} ms (last text: {})",
                    selector,
                    pattern.as_str(),
                    timeout.as_millis(),
                    last_seen.as_deref().map_or("<absent>".to_string(), |t| format!("{:?}", t)),
                )));
            }

            tokio::time::sleep(TEXT_POLL_INTERVAL).await;
        }
    }
}
