//! Portal client — one tool invocation per call.
//!
//! `run` makes sure a portal is reachable (spawning one if this client wins
//! the starting lock, otherwise waiting for the winner), sends the request,
//! and relays the captured output to the caller's own streams. When no portal
//! comes up in time and a cold fallback registry is configured, the tool runs
//! in this process instead.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PortalConfig;
use crate::endpoint::Endpoint;
use crate::error::PortalError;
use crate::protocol::{Request, Response};
use crate::tool::{capture, ToolRegistry};
use crate::transport::connect;

/// What a client can observe about a portal without talking to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalStatus {
    /// No endpoint and no starting lock
    Absent,
    /// A client holds the starting lock; the endpoint is not published yet
    Starting,
    /// Endpoint published and accepting connections
    Running,
    /// Endpoint published but nothing accepts on it
    Stale,
}

pub struct PortalClient {
    endpoint: Endpoint,
    launch: Vec<String>,
    server_log: Option<PathBuf>,
    poll_interval: Duration,
    poll_retries: u32,
    cold_fallback: Option<Arc<ToolRegistry>>,
}

impl PortalClient {
    /// `launch` is the portal command; the endpoint path is appended when spawning.
    pub fn new(endpoint: Endpoint, launch: Vec<String>) -> Self {
        Self {
            endpoint,
            launch,
            server_log: None,
            poll_interval: Duration::from_millis(333),
            poll_retries: 10,
            cold_fallback: None,
        }
    }

    /// Client for `config`; `default_launch` is used when `server_command` is unset.
    pub fn from_config(config: &PortalConfig, default_launch: Vec<String>) -> Self {
        let launch = config.server_command.clone().unwrap_or(default_launch);
        let mut client = Self::new(Endpoint::from_config(config), launch)
            .with_polling(config.start_poll_interval(), config.start_poll_retries);
        client.server_log = config.server_log.clone();
        if config.cold_fallback {
            client = client.with_cold_fallback(ToolRegistry::from_config(config));
        }
        client
    }

    pub fn with_polling(mut self, interval: Duration, retries: u32) -> Self {
        self.poll_interval = interval;
        self.poll_retries = retries.max(1);
        self
    }

    pub fn with_server_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_log = Some(path.into());
        self
    }

    /// Run tools in-process from `registry` when the portal cannot be started.
    pub fn with_cold_fallback(mut self, registry: ToolRegistry) -> Self {
        self.cold_fallback = Some(Arc::new(registry));
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Invoke `request` and relay its output; returns the tool's status.
    pub async fn run<O, E>(&self, request: &Request, out: &mut O, err: &mut E) -> crate::Result<i32>
    where
        O: Write,
        E: Write,
    {
        let response = match self.exchange(request).await {
            Ok(response) => response,
            Err(e @ PortalError::StartTimeout { .. }) => match &self.cold_fallback {
                Some(registry) => {
                    tracing::warn!(
                        error = %e,
                        tool = %request.tool,
                        "portal unavailable, running cold"
                    );
                    run_cold(registry, request).await?
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };

        out.write_all(response.stdout.as_bytes())?;
        err.write_all(response.stderr.as_bytes())?;
        out.flush()?;
        err.flush()?;
        Ok(response.status)
    }

    /// Reach the portal and exchange one request, recovering once from a stale endpoint.
    async fn exchange(&self, request: &Request) -> crate::Result<Response> {
        self.ensure_running().await?;
        match self.invoke(request).await {
            Err(PortalError::Connect { source, .. }) => {
                tracing::warn!(
                    endpoint = %self.endpoint.path().display(),
                    error = %source,
                    "endpoint is stale, restarting portal"
                );
                self.endpoint.remove().await?;
                self.ensure_running().await?;
                self.invoke(request).await
            }
            other => other,
        }
    }

    /// Send one request to a published portal and read its response.
    pub async fn invoke(&self, request: &Request) -> crate::Result<Response> {
        let mut conn = connect(&self.endpoint).await?;
        request.write_to(&mut conn).await?;
        Response::read_from(&mut conn).await
    }

    /// Make sure a portal has published the endpoint, starting one if needed.
    pub async fn ensure_running(&self) -> crate::Result<()> {
        if self.endpoint.exists().await {
            return Ok(());
        }
        self.endpoint.ensure_directory().await?;

        if !self.endpoint.try_acquire_starting_lock().await? {
            tracing::debug!(
                endpoint = %self.endpoint.path().display(),
                "portal already starting, waiting"
            );
            return self.await_endpoint().await;
        }

        // A portal may have published and dropped its lock since the first check
        let result = if self.endpoint.exists().await {
            Ok(())
        } else {
            match self.spawn_portal() {
                Ok(()) => self.await_endpoint().await,
                Err(e) => Err(e),
            }
        };
        // The portal removes the lock once published; release covers spawn failures and timeouts.
        if let Err(e) = self.endpoint.release_starting_lock().await {
            tracing::warn!(error = %e, "failed to release starting lock");
        }
        result
    }

    /// Ask the running portal to shut down.
    pub async fn stop(&self) -> crate::Result<()> {
        self.endpoint.request_stop().await
    }

    pub async fn status(&self) -> PortalStatus {
        if self.endpoint.exists().await {
            match connect(&self.endpoint).await {
                // Hanging up without a request is not counted as served by the portal
                Ok(_) => PortalStatus::Running,
                Err(_) => PortalStatus::Stale,
            }
        } else if self.endpoint.starting_lock_path().exists() {
            PortalStatus::Starting
        } else {
            PortalStatus::Absent
        }
    }

    fn spawn_portal(&self) -> crate::Result<()> {
        let Some((program, args)) = self.launch.split_first() else {
            return Err(PortalError::InvalidConfig(
                "portal".to_string(),
                "no server command to launch".to_string(),
            ));
        };
        let spawn_err = |source| PortalError::Spawn {
            command: program.clone(),
            source,
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).arg(self.endpoint.path()).stdin(Stdio::null());
        if let Some(log) = &self.server_log {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .map_err(spawn_err)?;
            let file_err = file.try_clone().map_err(spawn_err)?;
            cmd.stdout(file).stderr(file_err);
        }
        // Keep the portal out of the client's process group so terminal
        // interrupts aimed at the client leave it running.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(spawn_err)?;
        tracing::info!(
            command = %program,
            pid = ?child.id(),
            endpoint = %self.endpoint.path().display(),
            "starting portal"
        );
        // Dropping the handle does not kill the portal
        drop(child);
        Ok(())
    }

    async fn await_endpoint(&self) -> crate::Result<()> {
        for _ in 0..self.poll_retries {
            if self.endpoint.exists().await {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        if self.endpoint.exists().await {
            return Ok(());
        }
        Err(PortalError::StartTimeout {
            endpoint: self.endpoint.path().to_path_buf(),
            attempts: self.poll_retries,
        })
    }
}

/// Run the tool in this process, bypassing the portal.
async fn run_cold(registry: &Arc<ToolRegistry>, request: &Request) -> crate::Result<Response> {
    let tool = registry
        .find(&request.tool)
        .ok_or_else(|| PortalError::ToolNotFound(request.tool.clone()))?;
    let args = request.args.clone();
    let name = request.tool.clone();
    tokio::task::spawn_blocking(move || capture(tool.as_ref(), &args))
        .await
        .map_err(|e| PortalError::ToolFailed {
            tool: name,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::server::{PortalServer, PortalState};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            |args: &[String], out: &mut dyn Write, _err: &mut dyn Write| {
                let _ = writeln!(out, "{}", args.join(" "));
                0
            },
        );
        registry
    }

    fn endpoint_in(dir: &TempDir) -> Endpoint {
        Endpoint::new(dir.path().join("server.port"), TransportKind::Tcp)
    }

    /// Launch command that never publishes anything.
    fn inert_launch() -> Vec<String> {
        vec!["true".to_string()]
    }

    async fn start_server(endpoint: &Endpoint) -> (JoinHandle<()>, CancellationToken) {
        let server = PortalServer::new(endpoint.clone(), echo_registry());
        let cancel = server.cancel_token();
        let mut state = server.state();
        let handle = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        state
            .wait_for(|s| *s == PortalState::Listening)
            .await
            .unwrap();
        (handle, cancel)
    }

    #[tokio::test]
    async fn test_run_relays_output_and_status() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        let (handle, cancel) = start_server(&endpoint).await;

        let client = PortalClient::new(endpoint.clone(), inert_launch());
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = client
            .run(&Request::new("echo", vec!["hello".into()]), &mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(out, b"hello\n");
        assert!(err.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_portal_started_by_another_client() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        // Another client holds the lock and will "publish" shortly
        assert!(endpoint.try_acquire_starting_lock().await.unwrap());
        let publisher = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            publisher.publish("1").await.unwrap();
        });

        let client = PortalClient::new(endpoint.clone(), vec!["/nonexistent/never-spawned".into()])
            .with_polling(Duration::from_millis(20), 50);
        client.ensure_running().await.unwrap();
        // Loser never touches the winner's lock
        assert!(endpoint.starting_lock_path().exists());
    }

    #[tokio::test]
    async fn test_start_timeout_releases_lock() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        let client = PortalClient::new(endpoint.clone(), inert_launch())
            .with_polling(Duration::from_millis(10), 3);

        let result = client.ensure_running().await;
        assert!(matches!(
            result,
            Err(PortalError::StartTimeout { attempts: 3, .. })
        ));
        assert!(!endpoint.starting_lock_path().exists());
    }

    #[tokio::test]
    async fn test_stale_lock_times_out_without_spawning() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        std::fs::write(endpoint.starting_lock_path(), "").unwrap();
        let client = PortalClient::new(endpoint.clone(), vec!["/nonexistent/never-spawned".into()])
            .with_polling(Duration::from_millis(10), 3);

        assert!(matches!(
            client.ensure_running().await,
            Err(PortalError::StartTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_lock() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        let client = PortalClient::new(endpoint.clone(), vec!["/nonexistent/portal-binary".into()]);

        assert!(matches!(
            client.ensure_running().await,
            Err(PortalError::Spawn { .. })
        ));
        assert!(!endpoint.starting_lock_path().exists());
    }

    #[tokio::test]
    async fn test_cold_fallback_runs_in_process() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        let client = PortalClient::new(endpoint, inert_launch())
            .with_polling(Duration::from_millis(10), 2)
            .with_cold_fallback(echo_registry());

        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = client
            .run(&Request::new("echo", vec!["cold".into()]), &mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(out, b"cold\n");
    }

    #[tokio::test]
    async fn test_cold_fallback_unknown_tool() {
        let dir = TempDir::new().unwrap();
        let client = PortalClient::new(endpoint_in(&dir), inert_launch())
            .with_polling(Duration::from_millis(10), 2)
            .with_cold_fallback(echo_registry());

        let result = client
            .run(&Request::new("javac", vec![]), &mut Vec::new(), &mut Vec::new())
            .await;
        assert!(matches!(result, Err(PortalError::ToolNotFound(name)) if name == "javac"));
    }

    #[tokio::test]
    async fn test_stale_endpoint_is_replaced_once() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        // Port 1 on loopback: published but nothing listens there
        endpoint.publish("1").await.unwrap();
        let client = PortalClient::new(endpoint.clone(), inert_launch())
            .with_polling(Duration::from_millis(10), 2);

        assert_eq!(client.status().await, PortalStatus::Stale);
        let result = client
            .run(&Request::new("echo", vec![]), &mut Vec::new(), &mut Vec::new())
            .await;
        // The stale file was cleared and a restart attempted
        assert!(matches!(result, Err(PortalError::StartTimeout { .. })));
        assert!(!endpoint.exists().await);
    }

    #[tokio::test]
    async fn test_status_and_stop() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_in(&dir);
        let client = PortalClient::new(endpoint.clone(), inert_launch());
        assert_eq!(client.status().await, PortalStatus::Absent);

        std::fs::write(endpoint.starting_lock_path(), "").unwrap();
        assert_eq!(client.status().await, PortalStatus::Starting);
        std::fs::remove_file(endpoint.starting_lock_path()).unwrap();

        let (handle, _cancel) = start_server(&endpoint).await;
        assert_eq!(client.status().await, PortalStatus::Running);

        client.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stop request should end the portal")
            .unwrap();
        assert_eq!(client.status().await, PortalStatus::Absent);
    }
}
