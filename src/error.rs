//! Typed provisioning errors.
//!
//! All variants implement `thiserror::Error` and convert to
//! `anyhow::Error` via the `?` operator; callers that need to branch on
//! the failure class (tests, the run command) downcast back to
//! [`ProvisionError`].

use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the provisioning lifecycle.
///
/// Every variant is fatal for the current attempt. Transient SSH
/// failures are absorbed inside the retry loop and only surface as
/// [`ProvisionError::ConnectTimeout`] once the budget is exhausted.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No volume named `<distro>.qcow2` exists in the template pool.
    #[error("base image '{name}' not found in pool '{pool}'")]
    BaseImageNotFound { name: String, pool: String },

    /// The working pool rejected the overlay definition (name
    /// collision, insufficient space, ...). Never retried.
    #[error("pool '{pool}' rejected volume '{name}': {detail}")]
    Storage {
        pool: String,
        name: String,
        detail: String,
    },

    /// `virt-install` exited non-zero — the VM did not start.
    #[error("launch of '{name}' failed (exit {status}): {stderr}")]
    Launch {
        name: String,
        status: i32,
        stderr: String,
    },

    /// The VM launched but never signalled readiness within the
    /// deadline. Distinct from [`ProvisionError::Launch`] so callers
    /// can report "never came online" vs "failed to start".
    #[error("'{name}' did not become reachable within {}s", deadline.as_secs())]
    ReadinessTimeout { name: String, deadline: Duration },

    /// A non-transient SSH failure (auth, DNS, protocol). Not retried.
    #[error("ssh connection to '{host}' failed: {detail}")]
    Connect { host: String, detail: String },

    /// The SSH retry budget ran out without a successful connection.
    #[error("gave up connecting to '{host}' after {}s", budget.as_secs())]
    ConnectTimeout { host: String, budget: Duration },
}
