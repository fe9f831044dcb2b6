//! Invocation configuration.
//!
//! GitLab's custom executor hands job metadata to the driver through
//! `CUSTOM_ENV_*` variables. Everything is resolved here, once, into an
//! immutable [`Config`]; the rest of the crate reads its fields and
//! never touches the environment.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// How readiness is detected for a newly launched machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessMode {
    /// Cloud-init phone-home callback to a local HTTP listener.
    #[default]
    PhoneHome,
    /// One-byte read from the domain's virtio channel socket.
    VirtioChannel,
}

/// Job metadata from the custom-executor environment.
#[derive(Debug, Default)]
pub struct JobEnv {
    pub project: Option<String>,
    pub distro: Option<String>,
    pub job_id: Option<String>,
}

impl JobEnv {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            project: env_var("CUSTOM_ENV_CI_PROJECT_NAME"),
            distro: env_var("CUSTOM_ENV_DISTRO"),
            job_id: env_var("CUSTOM_ENV_CI_JOB_ID"),
        }
    }
}

/// Immutable per-invocation configuration.
#[derive(Debug)]
pub struct Config {
    /// Machine (and libvirt domain, and overlay volume) name.
    pub machine: String,
    /// Distro whose template image backs the overlay. Absent when
    /// neither `--distro` nor the job environment supplies one; only
    /// `prepare` requires it.
    pub distro: Option<String>,
    /// Private key for the provisioning account.
    pub ssh_key_file: PathBuf,
    /// Readiness strategy selected for this run.
    pub readiness: ReadinessMode,
}

impl Config {
    /// Resolve the configuration from CLI arguments and job metadata.
    ///
    /// The machine name defaults to `gitlab-<project>-<distro>-<job_id>`
    /// so concurrent jobs get distinct, collision-free names; the key
    /// path defaults to `~/.ssh/id_ed25519`.
    ///
    /// # Errors
    ///
    /// Fails if no machine name is given and the job environment is
    /// too incomplete to derive one, or if no home directory can be
    /// found for the default key path.
    pub fn resolve(
        machine: Option<String>,
        distro: Option<String>,
        ssh_key_file: Option<PathBuf>,
        readiness: ReadinessMode,
        env: &JobEnv,
    ) -> Result<Self> {
        let distro = distro.or_else(|| env.distro.clone());

        let machine = match machine {
            Some(name) => name,
            None => default_machine_name(env, distro.as_deref()).context(
                "no --machine given and the job environment is incomplete \
                 (need CUSTOM_ENV_CI_PROJECT_NAME, CUSTOM_ENV_DISTRO, CUSTOM_ENV_CI_JOB_ID)",
            )?,
        };

        let ssh_key_file = match ssh_key_file {
            Some(path) => path,
            None => dirs::home_dir()
                .context("cannot locate a home directory for the default SSH key path")?
                .join(".ssh")
                .join("id_ed25519"),
        };

        Ok(Self {
            machine,
            distro,
            ssh_key_file,
            readiness,
        })
    }
}

/// Exit code GitLab expects for a failed build. Anything else makes
/// the runner report a system failure instead of a job failure.
#[must_use]
pub fn build_failure_exit_code() -> i32 {
    env_var("BUILD_FAILURE_EXIT_CODE")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

fn default_machine_name(env: &JobEnv, distro: Option<&str>) -> Option<String> {
    let project = env.project.as_deref()?;
    let distro = distro?;
    let job_id = env.job_id.as_deref()?;
    Some(format!("gitlab-{project}-{distro}-{job_id}"))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
