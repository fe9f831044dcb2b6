//! Stage command implementations

pub mod cleanup;
pub mod prepare;
pub mod run;

use std::path::PathBuf;

use clap::Args;

/// Options shared by every stage command.
#[derive(Args)]
pub struct MachineArgs {
    /// Machine instance to operate on
    #[arg(short, long)]
    pub machine: Option<String>,

    /// Path to the SSH private key
    #[arg(long, value_name = "PATH")]
    pub ssh_key_file: Option<PathBuf>,
}
