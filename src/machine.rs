//! Machine lifecycle orchestration.
//!
//! One `Machine` value per provisioning attempt, owned by the command
//! layer for the duration of one invocation. `provision` composes
//! overlay creation, launch, and the readiness wait; `connect` gates
//! session establishment on reachability; `teardown` is independent and
//! idempotent from any state.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::command_runner::CommandRunner;
use crate::readiness::{
    CHANNEL_DEADLINE, ChannelWait, PHONE_HOME_DEADLINE, ReadinessSignal, ReadinessStrategy,
};
use crate::ssh::{CONNECT_BUDGET, CONNECT_POLL, RemoteSession};
use crate::virt::volume::DEFAULT_OVERLAY_GIB;
use crate::virt::{DomainOps, VolumeOps, domain, volume};

/// Where a machine stands in its lifetime. `Failed` is terminal and
/// reachable from any non-terminal state; `TornDown` is reachable from
/// everywhere because teardown is always allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Unprovisioned,
    StorageReady,
    Launched,
    AwaitingReachable,
    Reachable,
    Connected,
    TornDown,
    Failed,
}

/// One ephemeral VM, name-keyed. Name uniqueness across concurrent
/// provisioning runs is the caller's contract; nothing here arbitrates
/// collisions.
pub struct Machine<'a, H> {
    hypervisor: &'a H,
    name: String,
    distro: String,
    state: MachineState,
}

impl<'a, H: VolumeOps + DomainOps> Machine<'a, H> {
    pub fn new(hypervisor: &'a H, name: &str, distro: &str) -> Self {
        Self {
            hypervisor,
            name: name.to_string(),
            distro: distro.to_string(),
            state: MachineState::Unprovisioned,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Drive the machine from `Unprovisioned` to `Reachable`: create
    /// the overlay, launch the transient domain, and wait for the
    /// readiness signal.
    ///
    /// # Errors
    ///
    /// Any failure leaves the machine in `Failed` and is returned with
    /// machine and phase context. Storage created before the failure is
    /// left for `teardown` to reclaim.
    pub async fn provision(&mut self, strategy: ReadinessStrategy) -> Result<()> {
        match self.provision_inner(strategy).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = MachineState::Failed;
                Err(err).with_context(|| format!("provisioning machine '{}'", self.name))
            }
        }
    }

    async fn provision_inner(&mut self, strategy: ReadinessStrategy) -> Result<()> {
        tracing::info!(machine = %self.name, distro = %self.distro, "provisioning");
        volume::create_overlay(self.hypervisor, &self.name, DEFAULT_OVERLAY_GIB, &self.distro)
            .await?;
        self.state = MachineState::StorageReady;

        match strategy {
            ReadinessStrategy::PhoneHome {
                listener,
                user_data,
            } => {
                // The listener is already bound and accepting; its
                // address is baked into the user-data payload.
                let binding = domain::ReadinessBinding::CloudInit {
                    user_data: &user_data,
                };
                domain::launch(self.hypervisor, &self.name, &binding).await?;
                self.state = MachineState::Launched;

                self.state = MachineState::AwaitingReachable;
                listener.wait_ready(PHONE_HOME_DEADLINE).await?;
            }
            ReadinessStrategy::VirtioChannel { socket_path } => {
                let binding = domain::ReadinessBinding::VirtioChannel {
                    socket_path: &socket_path,
                };
                domain::launch(self.hypervisor, &self.name, &binding).await?;
                self.state = MachineState::Launched;

                // The running descriptor is authoritative for where
                // libvirt actually bound the socket.
                let resolved = domain::channel_socket_path(self.hypervisor, &self.name).await?;
                self.state = MachineState::AwaitingReachable;
                ChannelWait::new(&self.name, resolved)
                    .wait_ready(CHANNEL_DEADLINE)
                    .await?;
            }
        }

        self.state = MachineState::Reachable;
        tracing::info!(machine = %self.name, "machine reachable");
        Ok(())
    }

    /// Open the machine's remote session. Only valid once `Reachable`;
    /// at most one live session per machine.
    ///
    /// # Errors
    ///
    /// Fails if the machine is not `Reachable`, or if the connection
    /// cannot be established within the retry budget; either way the
    /// machine moves to `Failed`.
    pub async fn connect<R: CommandRunner>(
        &mut self,
        runner: R,
        key_path: &Path,
    ) -> Result<RemoteSession<R>> {
        self.connect_with(runner, key_path, CONNECT_BUDGET, CONNECT_POLL)
            .await
    }

    /// [`Machine::connect`] with explicit timing, for tests.
    pub async fn connect_with<R: CommandRunner>(
        &mut self,
        runner: R,
        key_path: &Path,
        budget: Duration,
        poll: Duration,
    ) -> Result<RemoteSession<R>> {
        if self.state != MachineState::Reachable {
            let state = self.state;
            self.state = MachineState::Failed;
            anyhow::bail!("machine '{}' is not reachable (state {state:?})", self.name);
        }
        match RemoteSession::connect_with_retry(runner, &self.name, key_path, budget, poll).await {
            Ok(session) => {
                self.state = MachineState::Connected;
                Ok(session)
            }
            Err(err) => {
                self.state = MachineState::Failed;
                Err(err).with_context(|| format!("connecting to machine '{}'", self.name))
            }
        }
    }

    /// Remove the machine: destroy the domain, then delete the overlay.
    ///
    /// Safe from any state, including after a partial provision or on a
    /// machine that was never provisioned at all; both not-found cases
    /// count as success, so calling this twice is harmless.
    ///
    /// # Errors
    ///
    /// Only real hypervisor failures (anything other than "not found")
    /// are surfaced.
    pub async fn teardown(&mut self) -> Result<()> {
        tracing::info!(machine = %self.name, "tearing down");
        domain::destroy(self.hypervisor, &self.name)
            .await
            .with_context(|| format!("tearing down machine '{}'", self.name))?;
        volume::delete_overlay(self.hypervisor, &self.name)
            .await
            .with_context(|| format!("tearing down machine '{}'", self.name))?;
        self.state = MachineState::TornDown;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::process::Output;

    use anyhow::Result;

    use super::*;
    use crate::testing::{err_output, ok_output};
    use crate::virt::domain::ReadinessBinding;

    const BASE_XML: &str = "<volume type='file'>\n\
          <name>fedora38.qcow2</name>\n\
          <target>\n\
            <path>/var/lib/libvirt/images/fedora38.qcow2</path>\n\
            <format type='qcow2'/>\n\
          </target>\n\
        </volume>";

    /// Scripted hypervisor covering both volume and domain operations.
    struct Hypervisor {
        volumes: Vec<String>,
        launch_result: Option<Output>,
        created: RefCell<Vec<String>>,
        deleted: RefCell<u32>,
        destroyed: RefCell<u32>,
    }

    impl Hypervisor {
        fn healthy() -> Self {
            Self {
                volumes: vec!["fedora38.qcow2".into()],
                launch_result: None,
                created: RefCell::new(Vec::new()),
                deleted: RefCell::new(0),
                destroyed: RefCell::new(0),
            }
        }
    }

    impl VolumeOps for Hypervisor {
        async fn list_volumes(&self, _: &str) -> Result<Vec<String>> {
            Ok(self.volumes.clone())
        }
        async fn volume_xml(&self, _: &str, _: &str) -> Result<String> {
            Ok(BASE_XML.to_string())
        }
        async fn create_volume(&self, _: &str, xml: &str) -> Result<Output> {
            self.created.borrow_mut().push(xml.to_string());
            Ok(ok_output(b""))
        }
        async fn delete_volume(&self, _: &str, _: &str) -> Result<Output> {
            *self.deleted.borrow_mut() += 1;
            Ok(err_output(
                1,
                b"error: Storage volume not found: no storage vol with matching name",
            ))
        }
    }

    impl DomainOps for Hypervisor {
        async fn launch(&self, _: &str, _: &ReadinessBinding<'_>) -> Result<Output> {
            match &self.launch_result {
                Some(out) => Ok(Output {
                    status: out.status,
                    stdout: out.stdout.clone(),
                    stderr: out.stderr.clone(),
                }),
                None => Ok(ok_output(b"")),
            }
        }
        async fn domain_xml(&self, _: &str) -> Result<String> {
            anyhow::bail!("not expected")
        }
        async fn destroy(&self, _: &str) -> Result<Output> {
            *self.destroyed.borrow_mut() += 1;
            Ok(err_output(1, b"error: Domain not found"))
        }
    }

    #[tokio::test]
    async fn failed_launch_moves_the_machine_to_failed() {
        let hypervisor = Hypervisor {
            launch_result: Some(err_output(1, b"ERROR no space left on device")),
            ..Hypervisor::healthy()
        };
        let mut machine = Machine::new(&hypervisor, "vm1", "fedora38");
        let strategy = ReadinessStrategy::VirtioChannel {
            socket_path: PathBuf::from("/tmp/virtci-vm1-call-home.sock"),
        };
        let err = machine.provision(strategy).await.expect_err("launch fails");
        assert_eq!(machine.state(), MachineState::Failed);
        assert!(err.to_string().contains("vm1"), "context names the machine");
        // The overlay was created before the launch failed; teardown
        // reclaims it.
        assert_eq!(hypervisor.created.borrow().len(), 1);
    }

    #[tokio::test]
    async fn connect_refuses_an_unprovisioned_machine() {
        let hypervisor = Hypervisor::healthy();
        let mut machine = Machine::new(&hypervisor, "vm1", "fedora38");
        let err = machine
            .connect(
                crate::command_runner::TokioCommandRunner::default(),
                Path::new("/keys/id_ed25519"),
            )
            .await
            .expect_err("not reachable");
        assert!(err.to_string().contains("not reachable"));
        assert_eq!(machine.state(), MachineState::Failed);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_from_any_state() {
        let hypervisor = Hypervisor::healthy();
        let mut machine = Machine::new(&hypervisor, "vm1", "fedora38");
        machine.teardown().await.expect("never provisioned");
        machine.teardown().await.expect("second call");
        assert_eq!(machine.state(), MachineState::TornDown);
        assert_eq!(*hypervisor.destroyed.borrow(), 2);
        assert_eq!(*hypervisor.deleted.borrow(), 2);
    }
}
