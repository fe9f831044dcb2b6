//! Readiness detection — the latch that says "the VM is reachable".
//!
//! Two interchangeable strategies implement [`ReadinessSignal`]: the
//! cloud-init phone-home listener and the host-side virtio channel
//! read. The command layer picks one at construction time via
//! [`ReadinessStrategy`]; the lifecycle never inspects which one it
//! got beyond matching the enum it built.

pub mod channel;
pub mod phone_home;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

pub use channel::ChannelWait;
pub use phone_home::PhoneHomeListener;

/// Wall-clock deadline for the phone-home callback. Covers a full
/// guest boot including cloud-init network configuration.
pub const PHONE_HOME_DEADLINE: Duration = Duration::from_secs(120);

/// Deadline for the one-byte channel read in direct-wait mode.
pub const CHANNEL_DEADLINE: Duration = Duration::from_secs(30);

/// A single-use readiness latch.
///
/// `wait_ready` consumes the signal, so a latch can never be awaited
/// twice; at most one successful signal is ever accepted. Timing out
/// yields [`crate::error::ProvisionError::ReadinessTimeout`] — the VM
/// launched but never became reachable, which callers treat as fatal.
#[allow(async_fn_in_trait)]
pub trait ReadinessSignal {
    async fn wait_ready(self, deadline: Duration) -> Result<()>;
}

/// Strategy selected by the command layer before launch.
pub enum ReadinessStrategy {
    /// Listener already bound (it must accept connections before its
    /// address is baked into the boot payload), user-data rendered.
    PhoneHome {
        listener: PhoneHomeListener,
        user_data: PathBuf,
    },
    /// Virtio channel bound at launch; the socket path handed to the
    /// reader is re-resolved from the domain descriptor afterwards.
    VirtioChannel { socket_path: PathBuf },
}
