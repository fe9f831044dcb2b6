//! The cleanup stage: remove the job's VM and its storage.

use anyhow::Result;
use clap::Args;

use crate::config::{Config, JobEnv, ReadinessMode};
use crate::machine::Machine;
use crate::virt::VirshHypervisor;

use super::MachineArgs;

#[derive(Args)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub machine: MachineArgs,
}

/// # Errors
///
/// Returns an error only on a real hypervisor failure; a machine that
/// is already gone (in whole or in part) counts as cleaned up.
pub async fn run(args: &CleanupArgs) -> Result<()> {
    let config = Config::resolve(
        args.machine.machine.clone(),
        None,
        args.machine.ssh_key_file.clone(),
        ReadinessMode::default(),
        &JobEnv::from_env(),
    )?;
    let hypervisor = VirshHypervisor::default_runner();
    let distro = config.distro.as_deref().unwrap_or_default();
    let mut machine = Machine::new(&hypervisor, &config.machine, distro);
    machine.teardown().await
}
