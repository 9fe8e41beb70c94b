//! Ephemeral backend - spawning and health checking a fresh instance per run

use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::BackendConfig;
use crate::error::{E2eError, E2eResult};

/// How long a backend gets to exit after SIGTERM
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Handle to a running backend process
pub struct BackendHandle {
    child: Child,
    pub base_url: String,
    pub port: u16,
}

impl BackendHandle {
    /// Spawn the backend on its own port and wait until it answers
    pub async fn spawn(config: BackendConfig) -> E2eResult<Self> {
        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        info!("Spawning backend {} on port {}", config.program.display(), port);

        let mut cmd = Command::new(&config.program);
        cmd.args(config.args.iter().map(|arg| substitute_port(arg, port)));
        for (key, value) in &config.env {
            cmd.env(key, substitute_port(value, port));
        }
        cmd.env("PORT", port.to_string());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!(
                "Failed to spawn {}: {}",
                config.program.display(),
                e
            ))
        })?;

        let mut handle = BackendHandle {
            child,
            base_url: base_url.clone(),
            port,
        };

        if let Err(e) = handle.wait_for_healthy(&config.health_path, config.startup_timeout()).await {
            let _ = handle.shutdown().await;
            return Err(e);
        }

        info!("Backend is healthy at {}", base_url);
        Ok(handle)
    }

    /// Wait for the backend to respond to health checks
    async fn wait_for_healthy(&mut self, health_path: &str, timeout_duration: Duration) -> E2eResult<()> {
        let health_url = format!("{}{}", self.base_url, health_path);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(status) = self.child.try_wait()? {
                return Err(E2eError::ServerStartup(format!("backend exited early with {}", status)));
            }

            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for backend to start...");
                    }
                    // Connection refused is expected while the backend is starting
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    /// Get the base URL for this backend
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop the backend: SIGTERM, a grace period polled without blocking
    /// the runtime, then kill
    pub async fn shutdown(&mut self) -> E2eResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        info!("Stopping backend (pid: {})", self.child.id());

        if self.terminate() {
            let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
            while std::time::Instant::now() < deadline {
                if self.child.try_wait()?.is_some() {
                    return Ok(());
                }
                sleep(Duration::from_millis(50)).await;
            }
        }
        self.kill()
    }

    /// Stop the backend without waiting for a graceful exit
    pub fn stop(&mut self) -> E2eResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.terminate();
        self.kill()
    }

    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM).is_ok()
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }

    fn kill(&mut self) -> E2eResult<()> {
        let _ = self.child.kill();
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn substitute_port(value: &str, port: u16) -> String {
    value.replace("{port}", &port.to_string())
}

/// Find a free port to use
pub fn find_free_port() -> E2eResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| E2eError::ServerStartup(format!("Failed to bind to find free port: {}", e)))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port1 = find_free_port().unwrap();
        let port2 = find_free_port().unwrap();

        // Ports should be in valid range
        assert!(port1 > 1024);
        assert!(port2 > 1024);
    }

    #[test]
    fn test_substitute_port() {
        assert_eq!(substitute_port("--port={port}", 8123), "--port=8123");
        assert_eq!(substitute_port("main:app", 8123), "main:app");
    }

    #[tokio::test]
    async fn test_missing_program_fails_startup() {
        let config = BackendConfig::new("/nonexistent/fastcalc-backend", Vec::new());
        let err = BackendHandle::spawn(config).await.err().unwrap();
        assert!(matches!(err, E2eError::ServerStartup(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_terminates_running_backend() {
        // answers nothing, so wrap the handle around the raw child
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = BackendHandle {
            child,
            base_url: "http://127.0.0.1:1".into(),
            port: 1,
        };

        let start = std::time::Instant::now();
        handle.shutdown().await.unwrap();
        assert!(handle.child.try_wait().unwrap().is_some());
        assert!(start.elapsed() < Duration::from_secs(5));

        // already exited: a second call is a no-op
        handle.shutdown().await.unwrap();
        handle.stop().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backend_exiting_early_is_reported() {
        let mut config = BackendConfig::new("sh", vec!["-c".into(), "exit 3".into()]);
        config.startup_timeout_ms = 5_000;
        let err = BackendHandle::spawn(config).await.err().unwrap();
        assert!(matches!(err, E2eError::ServerStartup(ref msg) if msg.contains("exited early")), "{err:?}");
    }
}
