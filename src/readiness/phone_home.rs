//! Cloud-init phone-home listener.
//!
//! A minimal HTTP endpoint bound to an OS-assigned port. The guest's
//! cloud-init POSTs its hostname to `/nocloud` once networking is up;
//! the first callback whose hostname matches the expected machine name
//! satisfies the latch. Ordering matters: the listener is bound and
//! accepting before the caller renders the boot payload that names its
//! address, and before the launch command runs.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::routing::post;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ProvisionError;
use crate::readiness::ReadinessSignal;

/// Callback path the boot payload points the guest at.
pub const CALLBACK_PATH: &str = "/nocloud";

/// Host address the guest reaches the listener on. The libvirt default
/// network routes guest traffic through the host at this gateway
/// address; deployments on other networks override it.
pub const DEFAULT_CALLBACK_HOST: &str = "192.168.122.1";

struct ListenerState {
    expected_hostname: String,
    // Single-shot: the sender is taken on the first valid callback;
    // later valid callbacks find it gone and are no-ops.
    latch: Mutex<Option<oneshot::Sender<()>>>,
}

/// The bound listener plus the receive side of its latch.
pub struct PhoneHomeListener {
    machine: String,
    callback_host: String,
    local_addr: SocketAddr,
    satisfied: oneshot::Receiver<()>,
    server: JoinHandle<()>,
}

impl PhoneHomeListener {
    /// Bind on an OS-assigned port and start accepting callbacks.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn bind(expected_hostname: &str, callback_host: &str) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
            .await
            .context("binding phone-home listener")?;
        let local_addr = listener
            .local_addr()
            .context("reading phone-home listener address")?;

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(ListenerState {
            expected_hostname: expected_hostname.to_string(),
            latch: Mutex::new(Some(tx)),
        });

        // Any path other than the callback path falls through to
        // axum's 404.
        let app = Router::new()
            .route(CALLBACK_PATH, post(report))
            .with_state(state);

        tracing::debug!(%local_addr, machine = expected_hostname, "phone-home listener up");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            machine: expected_hostname.to_string(),
            callback_host: callback_host.to_string(),
            local_addr,
            satisfied: rx,
            server,
        })
    }

    /// URL the boot payload directs the guest to POST to.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!(
            "http://{}:{}{CALLBACK_PATH}",
            self.callback_host,
            self.local_addr.port()
        )
    }

    /// Actual bound address (test access).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Fields of the url-encoded callback body we care about. cloud-init
/// posts more ("post all fields"); the rest is ignored.
#[derive(Deserialize)]
struct Report {
    hostname: Option<String>,
}

async fn report(State(state): State<Arc<ListenerState>>, Form(report): Form<Report>) -> StatusCode {
    match report.hostname {
        Some(ref hostname) if *hostname == state.expected_hostname => {
            let sender = state.latch.lock().ok().and_then(|mut latch| latch.take());
            if let Some(tx) = sender {
                tracing::debug!(hostname, "phone-home callback accepted");
                let _ = tx.send(());
            }
            // A repeat callback after the latch fired is a no-op.
            StatusCode::OK
        }
        _ => {
            tracing::warn!(
                expected = %state.expected_hostname,
                got = report.hostname.as_deref().unwrap_or("<missing>"),
                "rejecting phone-home callback with wrong hostname"
            );
            StatusCode::FORBIDDEN
        }
    }
}

impl ReadinessSignal for PhoneHomeListener {
    async fn wait_ready(self, deadline: Duration) -> Result<()> {
        let outcome = tokio::time::timeout(deadline, self.satisfied).await;
        // The orchestrator is done with the listener either way; the
        // serve task has no further effect once aborted.
        self.server.abort();
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => anyhow::bail!(
                "phone-home listener for '{}' stopped before any callback",
                self.machine
            ),
            Err(_) => Err(ProvisionError::ReadinessTimeout {
                name: self.machine,
                deadline,
            }
            .into()),
        }
    }
}
