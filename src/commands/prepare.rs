//! The prepare stage: provision the VM and verify it over SSH.

use clap::Args;

use anyhow::{Context, Result};

use crate::cloud_init;
use crate::command_runner::TokioCommandRunner;
use crate::config::{Config, JobEnv, ReadinessMode};
use crate::machine::Machine;
use crate::readiness::phone_home::{DEFAULT_CALLBACK_HOST, PhoneHomeListener};
use crate::readiness::ReadinessStrategy;
use crate::virt::domain::channel_bind_path;
use crate::virt::{DomainOps, VirshHypervisor, VolumeOps};

use super::MachineArgs;

#[derive(Args)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub machine: MachineArgs,

    /// What OS distro base image to use for provisioning
    #[arg(short, long)]
    pub distro: Option<String>,

    /// Wait on the virtio channel instead of the phone-home callback
    #[arg(long)]
    pub wait_channel: bool,

    /// Host address the guest reaches the phone-home listener on
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_CALLBACK_HOST)]
    pub callback_host: String,
}

/// # Errors
///
/// Returns an error if any provisioning phase fails; the VM and its
/// storage are left for the cleanup stage to reclaim.
pub async fn run(args: &PrepareArgs) -> Result<()> {
    let readiness = if args.wait_channel {
        ReadinessMode::VirtioChannel
    } else {
        ReadinessMode::PhoneHome
    };
    let config = Config::resolve(
        args.machine.machine.clone(),
        args.distro.clone(),
        args.machine.ssh_key_file.clone(),
        readiness,
        &JobEnv::from_env(),
    )?;
    let hypervisor = VirshHypervisor::default_runner();
    prepare(&hypervisor, &config, &args.callback_host).await
}

/// Provision `config.machine` and verify it accepts an SSH connection.
pub async fn prepare(
    hypervisor: &(impl VolumeOps + DomainOps),
    config: &Config,
    callback_host: &str,
) -> Result<()> {
    let distro = config
        .distro
        .as_deref()
        .context("no distro configured; pass --distro or set CUSTOM_ENV_DISTRO")?;
    let mut machine = Machine::new(hypervisor, &config.machine, distro);

    // In phone-home mode the user-data scratch file must outlive the
    // launch command, which reads it while defining the domain.
    let mut user_data_file = None;
    let strategy = match config.readiness {
        ReadinessMode::PhoneHome => {
            // Bound and accepting before its address is rendered into
            // the payload; otherwise the guest's callback can race
            // ahead of the listener and be lost.
            let listener = PhoneHomeListener::bind(&config.machine, callback_host).await?;
            let pubkeys = operator_public_keys()?;
            let doc = cloud_init::render(&cloud_init::user_data(
                &config.machine,
                &listener.callback_url(),
                pubkeys,
            ))?;
            let file = cloud_init::write_user_data(&config.machine, &doc)?;
            let user_data = file.path().to_path_buf();
            user_data_file = Some(file);
            ReadinessStrategy::PhoneHome {
                listener,
                user_data,
            }
        }
        ReadinessMode::VirtioChannel => ReadinessStrategy::VirtioChannel {
            socket_path: channel_bind_path(&config.machine),
        },
    };

    machine.provision(strategy).await?;
    drop(user_data_file);

    machine
        .connect(TokioCommandRunner::default(), &config.ssh_key_file)
        .await?;
    tracing::info!(machine = %config.machine, "machine provisioned and verified");
    Ok(())
}

fn operator_public_keys() -> Result<Vec<String>> {
    match dirs::home_dir() {
        Some(home) => cloud_init::collect_public_keys(&home.join(".ssh")),
        None => Ok(Vec::new()),
    }
}
