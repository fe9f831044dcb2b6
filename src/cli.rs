//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// GitLab CI custom executor driver for libvirt VMs
#[derive(Parser)]
#[command(
    name = "virtci",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Display debugging information
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision the job's VM (GitLab prepare stage)
    Prepare(commands::prepare::PrepareArgs),

    /// Execute a job stage inside the VM (GitLab run stage)
    Run(commands::run::RunArgs),

    /// Tear the job's VM down (GitLab cleanup stage)
    Cleanup(commands::cleanup::CleanupArgs),
}

impl Cli {
    /// Execute the CLI command and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage fails; a non-zero exit code from
    /// the remote job is returned as a value instead.
    pub async fn run(self) -> Result<i32> {
        match self.command {
            Command::Prepare(args) => {
                commands::prepare::run(&args).await?;
                Ok(0)
            }
            Command::Run(args) => commands::run::run(&args).await,
            Command::Cleanup(args) => {
                commands::cleanup::run(&args).await?;
                Ok(0)
            }
        }
    }
}
