//! virtci - GitLab CI custom executor driver for libvirt VMs

#![cfg_attr(test, allow(clippy::expect_used))]

use clap::Parser;
use tracing_subscriber::EnvFilter;

use virtci::cli::Cli;
use virtci::config::build_failure_exit_code;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Job output goes to stdout; all diagnostics go to stderr so the
    // runner's log capture stays clean.
    let filter = if cli.debug {
        EnvFilter::new("virtci=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("virtci=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.run().await {
        Ok(0) => 0,
        Ok(code) => {
            tracing::error!(code, "job stage exited with failure");
            build_failure_exit_code()
        }
        Err(err) => {
            tracing::error!("{err:#}");
            build_failure_exit_code()
        }
    };
    std::process::exit(code);
}
