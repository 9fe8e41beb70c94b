//! Playwright browser automation
//!
//! Each session spawns one `node` process running a small bridge script.
//! The bridge owns one browser context and answers newline-delimited JSON
//! commands on stdin/stdout:
//!
//! ```text
//! -> {"id":1,"op":"open","url":"http://127.0.0.1:8000/register.html"}
//! <- {"id":1,"ok":true,"text":null}
//! -> {"id":2,"op":"text","selector":"#message"}
//! <- {"id":2,"ok":true,"text":"Registration successful!"}
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::ui::{UiDriver, UiSession};

const BRIDGE_SCRIPT: &str = r#"
const readline = require('readline');
const pw = require(require.resolve('playwright', { paths: [process.cwd()] }));
const cfg = JSON.parse(process.env.FASTCALC_BRIDGE_CONFIG);

(async () => {
  const browser = await pw[cfg.browser].launch({ headless: cfg.headless });
  const context = await browser.newContext({
    viewport: { width: cfg.viewport_width, height: cfg.viewport_height }
  });
  const page = await context.newPage();
  page.setDefaultTimeout(cfg.action_timeout_ms);
  console.log(JSON.stringify({ ready: true }));

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    if (!line.trim()) continue;
    const cmd = JSON.parse(line);
    try {
      let text = null;
      switch (cmd.op) {
        case 'open':
          await page.goto(cmd.url);
          break;
        case 'fill':
          await page.fill(cmd.selector, cmd.value);
          break;
        case 'click':
          await page.click(cmd.selector);
          break;
        case 'text': {
          const el = await page.$(cmd.selector);
          text = el ? await el.textContent() : null;
          break;
        }
        case 'close':
          await browser.close();
          console.log(JSON.stringify({ id: cmd.id, ok: true, text: null }));
          process.exit(0);
        default:
          throw new Error('unknown op ' + cmd.op);
      }
      console.log(JSON.stringify({ id: cmd.id, ok: true, text }));
    } catch (error) {
      console.log(JSON.stringify({
        id: cmd.id, ok: false, error: error.message,
        timeout: error.name === 'TimeoutError'
      }));
    }
  }
  await browser.close();
})().catch((error) => {
  console.error(error.stack || String(error));
  process.exit(1);
});
"#;

/// Extra time granted on top of Playwright's own timeout before the
/// harness gives up on the bridge
const BRIDGE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "chromium" => Some(Browser::Chromium),
            "firefox" => Some(Browser::Firefox),
            "webkit" => Some(Browser::Webkit),
            _ => None,
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Directory whose node_modules provides `playwright`
    pub project_dir: PathBuf,
    /// Bound on fill/click/open inside the browser
    pub action_timeout_ms: u64,
    /// Bound on browser launch
    pub launch_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            project_dir: PathBuf::from("."),
            action_timeout_ms: 5_000,
            launch_timeout_ms: 30_000,
        }
    }
}

/// Spawns one bridge process per session
#[derive(Debug, Clone)]
pub struct PlaywrightDriver {
    config: PlaywrightConfig,
}

impl PlaywrightDriver {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Check if Playwright is installed. `npx` may stall offering to
    /// install the package, so the check is bounded by the launch timeout.
    pub async fn check_installed(&self) -> E2eResult<()> {
        self.check_installed_with("npx", &["playwright", "--version"]).await
    }

    async fn check_installed_with(&self, program: &str, args: &[&str]) -> E2eResult<()> {
        let bound = Duration::from_millis(self.config.launch_timeout_ms);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.config.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(bound, cmd.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(_) => Err(E2eError::PlaywrightNotFound),
            Err(_) => {
                warn!("{} did not answer within {} ms", program, bound.as_millis());
                Err(E2eError::PlaywrightNotFound)
            }
        }
    }

    fn bridge_config(&self) -> Value {
        json!({
            "browser": self.config.browser.as_str(),
            "headless": self.config.headless,
            "viewport_width": self.config.viewport_width,
            "viewport_height": self.config.viewport_height,
            "action_timeout_ms": self.config.action_timeout_ms,
        })
    }
}

#[async_trait]
impl UiDriver for PlaywrightDriver {
    async fn new_session(&self) -> E2eResult<Box<dyn UiSession>> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        debug!("Starting Playwright bridge: {}", script_path.display());

        let mut child = Command::new("node")
            .arg(&script_path)
            .current_dir(&self.config.project_dir)
            .env("FASTCALC_BRIDGE_CONFIG", self.bridge_config().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Playwright(format!("failed to spawn node: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdout unavailable".into()))?;

        let mut session = PlaywrightSession {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            action_timeout: Duration::from_millis(self.config.action_timeout_ms),
            closed: false,
            _script_dir: script_dir,
        };

        let launch_timeout = Duration::from_millis(self.config.launch_timeout_ms);
        tokio::time::timeout(launch_timeout, session.await_ready())
            .await
            .map_err(|_| E2eError::Timeout(format!("browser launch within {} ms", launch_timeout.as_millis())))??;

        info!("Playwright session ready ({})", self.config.browser.as_str());
        Ok(Box::new(session))
    }
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: Option<u64>,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: bool,
}

/// One browser context behind one bridge process
pub struct PlaywrightSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    action_timeout: Duration,
    closed: bool,
    _script_dir: tempfile::TempDir,
}

impl PlaywrightSession {
    async fn next_reply(&mut self) -> E2eResult<BridgeReply> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| E2eError::Playwright("bridge exited unexpectedly".into()))?;
            match serde_json::from_str::<BridgeReply>(&line) {
                Ok(reply) => return Ok(reply),
                Err(_) => debug!("[bridge] {}", line),
            }
        }
    }

    async fn await_ready(&mut self) -> E2eResult<()> {
        loop {
            if self.next_reply().await?.ready {
                return Ok(());
            }
        }
    }

    async fn command(&mut self, mut payload: Value, what: &str) -> E2eResult<Option<String>> {
        if self.closed {
            return Err(E2eError::Playwright("session already closed".into()));
        }
        self.next_id += 1;
        let id = self.next_id;
        payload["id"] = json!(id);

        let mut line = payload.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let bound = self.action_timeout + BRIDGE_GRACE;
        let reply = tokio::time::timeout(bound, async {
            loop {
                let reply = self.next_reply().await?;
                if reply.id == Some(id) {
                    return Ok::<_, E2eError>(reply);
                }
            }
        })
        .await
        .map_err(|_| E2eError::Timeout(format!("{} (no reply from browser within {} ms)", what, bound.as_millis())))??;

        if reply.ok {
            Ok(reply.text)
        } else if reply.timeout {
            Err(E2eError::Timeout(format!(
                "{}: {}",
                what,
                reply.error.unwrap_or_default()
            )))
        } else {
            Err(E2eError::Playwright(format!(
                "{}: {}",
                what,
                reply.error.unwrap_or_else(|| "unknown error".into())
            )))
        }
    }
}

#[async_trait]
impl UiSession for PlaywrightSession {
    async fn open(&mut self, url: &str) -> E2eResult<()> {
        self.command(json!({"op": "open", "url": url}), &format!("open {}", url))
            .await
            .map(|_| ())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> E2eResult<()> {
        self.command(
            json!({"op": "fill", "selector": selector, "value": value}),
            &format!("fill {}", selector),
        )
        .await
        .map(|_| ())
    }

    async fn click(&mut self, selector: &str) -> E2eResult<()> {
        self.command(json!({"op": "click", "selector": selector}), &format!("click {}", selector))
            .await
            .map(|_| ())
    }

    async fn read_text(&mut self, selector: &str) -> E2eResult<Option<String>> {
        self.command(json!({"op": "text", "selector": selector}), &format!("read {}", selector))
            .await
    }

    async fn close(&mut self) -> E2eResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.command(json!({"op": "close"}), "close").await;
        self.closed = true;
        if let Err(e) = &result {
            warn!("Browser did not close cleanly: {}", e);
            let _ = self.child.start_kill();
        }
        let _ = self.child.wait().await;
        result.map(|_| ())
    }
}
