//! The run stage: execute one job script or command inside the VM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::command_runner::TokioCommandRunner;
use crate::config::{Config, JobEnv, ReadinessMode};
use crate::ssh::{CONNECT_BUDGET, CONNECT_POLL, RemoteSession};

use super::MachineArgs;

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub machine: MachineArgs,

    /// Absolute path to the executable
    pub executable: PathBuf,

    /// Arguments to be passed to the executable
    #[arg(trailing_var_arg = true)]
    pub exec_args: Vec<String>,

    /// Upload and execute a script instead of a command
    #[arg(long)]
    pub script: bool,
}

/// Connect, optionally upload the script, execute it, and hand back
/// the remote exit code. The job's output streams to stdout as it is
/// produced.
///
/// # Errors
///
/// Returns an error if the session cannot be established or the
/// transfer/execution channel breaks. A non-zero remote exit is the
/// return value, not an error.
pub async fn run(args: &RunArgs) -> Result<i32> {
    let config = Config::resolve(
        args.machine.machine.clone(),
        None,
        args.machine.ssh_key_file.clone(),
        ReadinessMode::default(),
        &JobEnv::from_env(),
    )?;

    let session = RemoteSession::connect_with_retry(
        TokioCommandRunner::default(),
        &config.machine,
        &config.ssh_key_file,
        CONNECT_BUDGET,
        CONNECT_POLL,
    )
    .await?;

    let mut stdout = tokio::io::stdout();
    if args.script {
        let stage = args
            .executable
            .file_name()
            .and_then(|n| n.to_str())
            .context("script path has no usable file name")?;
        let remote = format!("/tmp/{stage}");
        session.upload(&args.executable, &remote).await?;
        session
            .exec("/bin/bash", &[remote.as_str()], &mut stdout)
            .await
    } else {
        let executable = args
            .executable
            .to_str()
            .context("executable path is not valid UTF-8")?;
        let arg_refs: Vec<&str> = args.exec_args.iter().map(String::as_str).collect();
        session.exec(executable, &arg_refs, &mut stdout).await
    }
}
