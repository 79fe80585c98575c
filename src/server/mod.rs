//! The portal server: bind, publish, accept, dispatch, expire.
//!
//! Lifecycle is `Binding → Listening → Draining → Closed`, observable through
//! [`PortalServer::state`]. The accept loop waits in windows of `accept_timeout`;
//! `idle_timeouts` consecutive windows without a decoded request end it (idle
//! expiry). Connections that hang up without a request do not reset the window,
//! so liveness checks cannot keep an idle portal alive. The stop
//! sentinel watcher, signal handlers and callers holding the
//! [`PortalServer::cancel_token`] end it early by cancelling the token, which
//! the loop sees as a plain stop rather than an accept error.

pub mod handler;
pub mod stop_watcher;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PortalConfig;
use crate::endpoint::{Endpoint, EndpointGuard};
use crate::tool::ToolRegistry;
use crate::transport::Listener;

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Four-state lifecycle of a portal server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    /// Opening the listening socket and publishing the endpoint
    Binding,
    /// Accepting connections
    Listening,
    /// No longer accepting; in-flight requests finishing
    Draining,
    /// Terminal
    Closed,
}

/// Why the accept loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No connection arrived for `idle_timeouts` consecutive accept waits
    IdleTimeout,
    /// Stop sentinel, signal, or explicit cancellation
    Stopped,
}

/// Outcome of a completed [`PortalServer::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    /// Requests decoded, including ones that finished during Draining
    pub served: u64,
    pub reason: StopReason,
}

pub struct PortalServer {
    endpoint: Endpoint,
    registry: Arc<ToolRegistry>,
    accept_timeout: Duration,
    idle_timeouts: u32,
    watch_stop_sentinel: bool,
    cancel: CancellationToken,
    state_tx: watch::Sender<PortalState>,
    served: Arc<watch::Sender<u64>>,
}

impl PortalServer {
    /// Server with the default 60s accept wait and 3-timeout idle expiry.
    pub fn new(endpoint: Endpoint, registry: ToolRegistry) -> Self {
        let (state_tx, _) = watch::channel(PortalState::Binding);
        Self {
            endpoint,
            registry: Arc::new(registry),
            accept_timeout: Duration::from_secs(60),
            idle_timeouts: 3,
            watch_stop_sentinel: true,
            cancel: CancellationToken::new(),
            state_tx,
            served: Arc::new(watch::channel(0).0),
        }
    }

    pub fn from_config(config: &PortalConfig, registry: ToolRegistry) -> Self {
        Self::new(Endpoint::from_config(config), registry)
            .with_accept_timeout(config.accept_timeout())
            .with_idle_timeouts(config.idle_timeouts)
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_idle_timeouts(mut self, timeouts: u32) -> Self {
        self.idle_timeouts = timeouts.max(1);
        self
    }

    /// Disable the stop sentinel watcher (the token still stops the server).
    pub fn with_stop_sentinel(mut self, enabled: bool) -> Self {
        self.watch_stop_sentinel = enabled;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Cancelling this token moves a listening server to `Draining`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> watch::Receiver<PortalState> {
        self.state_tx.subscribe()
    }

    /// Serve until idle expiry or a stop request.
    ///
    /// Returns `PortalError::Bind` if the endpoint cannot be bound; the server
    /// is `Closed` on every return path and its endpoint artifact removed.
    pub async fn run(self) -> crate::Result<ServeSummary> {
        self.state_tx.send_replace(PortalState::Binding);
        let (listener, guard) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.state_tx.send_replace(PortalState::Closed);
                return Err(e);
            }
        };

        tracing::info!(
            endpoint = %self.endpoint.path().display(),
            address = %listener.describe(),
            tools = self.registry.len(),
            "portal listening"
        );
        self.state_tx.send_replace(PortalState::Listening);

        let watcher = self.watch_stop_sentinel.then(|| {
            tokio::spawn(stop_watcher::watch_stop_sentinel(
                self.endpoint.clone(),
                self.cancel.clone(),
            ))
        });

        let tracker = TaskTracker::new();
        let reason = self.accept_loop(&listener, &tracker).await;

        drop(listener);
        // New clients must not find a portal that no longer accepts
        drop(guard);
        self.state_tx.send_replace(PortalState::Draining);
        tracker.close();
        tracker.wait().await;

        // Ends the stop watcher too
        self.cancel.cancel();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        let served = *self.served.borrow();
        tracing::info!(served, ?reason, "portal closed after handling {} request(s)", served);
        self.state_tx.send_replace(PortalState::Closed);
        Ok(ServeSummary { served, reason })
    }

    /// Bind the listener, publish the endpoint, release the starting lock.
    async fn bind(&self) -> crate::Result<(Listener, EndpointGuard)> {
        self.endpoint.ensure_directory().await?;
        if self.watch_stop_sentinel {
            // A leftover request must not stop this fresh portal
            self.endpoint.clear_stop_request().await?;
        }

        let listener = Listener::bind(&self.endpoint).await?;
        let value = listener.discovery_value()?;
        if let Some(value) = &value {
            self.endpoint.publish(value).await?;
        }
        let guard = self.endpoint.guard(value.as_deref());
        if let Err(e) = self.endpoint.release_starting_lock().await {
            tracing::warn!(error = %e, "failed to remove starting lock");
        }
        Ok((listener, guard))
    }

    async fn accept_loop(&self, listener: &Listener, tracker: &TaskTracker) -> StopReason {
        let mut requests = self.served.subscribe();
        let mut connections: u64 = 0;
        let mut timeouts: u32 = 0;
        let idle = tokio::time::sleep(self.accept_timeout);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StopReason::Stopped,
                Ok(()) = requests.changed() => {
                    timeouts = 0;
                    idle.as_mut().reset(Instant::now() + self.accept_timeout);
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(conn) => {
                            connections += 1;
                            tracker.spawn(handler::serve_connection(
                                conn,
                                self.registry.clone(),
                                self.served.clone(),
                                connections,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                () = &mut idle => {
                    timeouts += 1;
                    tracing::debug!(
                        timeouts,
                        limit = self.idle_timeouts,
                        "accept timed out"
                    );
                    if timeouts >= self.idle_timeouts {
                        return StopReason::IdleTimeout;
                    }
                    idle.as_mut().reset(Instant::now() + self.accept_timeout);
                }
            }
        }
    }
}
