//! Direct-wait readiness: one-byte read from the domain's virtio
//! channel socket.
//!
//! The guest image carries a unit that writes to the `call_home`
//! virtio port once it is online; on the host side that channel is a
//! Unix socket bound by libvirt. Reading a single byte is the whole
//! protocol. A timeout here is fatal, not a retry condition.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

use crate::error::ProvisionError;
use crate::readiness::ReadinessSignal;

pub struct ChannelWait {
    machine: String,
    socket_path: PathBuf,
}

impl ChannelWait {
    #[must_use]
    pub fn new(machine: &str, socket_path: PathBuf) -> Self {
        Self {
            machine: machine.to_string(),
            socket_path,
        }
    }
}

impl ReadinessSignal for ChannelWait {
    async fn wait_ready(self, deadline: Duration) -> Result<()> {
        tracing::debug!(
            machine = %self.machine,
            socket = %self.socket_path.display(),
            "waiting on virtio channel"
        );
        let read_one = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .with_context(|| {
                    format!("opening channel socket {}", self.socket_path.display())
                })?;
            let mut byte = [0u8; 1];
            stream
                .read_exact(&mut byte)
                .await
                .context("reading readiness byte from channel")?;
            Ok::<(), anyhow::Error>(())
        };
        match tokio::time::timeout(deadline, read_one).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::ReadinessTimeout {
                name: self.machine,
                deadline,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn one_byte_from_the_guest_satisfies_the_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call-home.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"\n").await;
            }
        });

        ChannelWait::new("vm1", path)
            .wait_ready(Duration::from_secs(5))
            .await
            .expect("byte arrives");
    }

    #[tokio::test]
    async fn silent_channel_times_out_distinctly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call-home.sock");
        let _listener = UnixListener::bind(&path).expect("bind");

        let err = ChannelWait::new("vm1", path)
            .wait_ready(Duration::from_millis(50))
            .await
            .expect_err("nothing written");
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::ReadinessTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn missing_socket_is_an_error_not_a_timeout() {
        let err = ChannelWait::new("vm1", PathBuf::from("/nonexistent/call-home.sock"))
            .wait_ready(Duration::from_secs(5))
            .await
            .expect_err("no socket");
        assert!(
            err.downcast_ref::<ProvisionError>().is_none(),
            "connect failure must not masquerade as a readiness timeout"
        );
    }
}
