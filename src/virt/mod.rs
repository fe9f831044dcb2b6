//! Hypervisor access — port traits plus the virsh/virt-install adapter.
//!
//! All libvirt interaction goes through external commands routed via a
//! [`CommandRunner`], so unit tests can script the hypervisor without a
//! running libvirtd. The connection handle (`VirshHypervisor`) is owned
//! by the command layer and passed by reference into every service —
//! there are no process-wide singletons.

pub mod domain;
pub mod volume;

use std::process::Output;

use anyhow::{Context, Result};

use crate::command_runner::{CommandRunner, LAUNCH_TIMEOUT, TokioCommandRunner};
use crate::virt::domain::ReadinessBinding;

/// Connection URI for the system libvirt daemon.
pub const LIBVIRT_URI: &str = "qemu:///system";

/// Pool holding per-machine overlay volumes.
pub const WORKING_POOL: &str = "default";

/// Read-only pool holding the distro template images. Never written to;
/// concurrent provisioning from one base is safe because bases are
/// never mutated.
pub const TEMPLATE_POOL: &str = "base_imgs";

/// Storage volume operations.
#[allow(async_fn_in_trait)]
pub trait VolumeOps {
    /// List the names of all volumes in `pool`. Enumerated fresh on
    /// every call — template sets can change between runs.
    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;

    /// Fetch the XML descriptor of one volume.
    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String>;

    /// Define a new volume in `pool` from an XML descriptor.
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<Output>;

    /// Delete a volume. The raw output is returned so callers can
    /// distinguish "not found" from real failures.
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<Output>;
}

/// Domain (VM instance) operations.
#[allow(async_fn_in_trait)]
pub trait DomainOps {
    /// Instantiate a transient domain via `virt-install`.
    async fn launch(&self, name: &str, binding: &ReadinessBinding<'_>) -> Result<Output>;

    /// Fetch the XML descriptor of a running domain.
    async fn domain_xml(&self, name: &str) -> Result<String>;

    /// Destroy a domain. Transient domains vanish from libvirt's
    /// registry on destroy; no undefine step exists or is needed.
    async fn destroy(&self, name: &str) -> Result<Output>;
}

/// Adapter routing every hypervisor call through the virsh and
/// virt-install binaries.
///
/// Generic over `R: CommandRunner` so tests can inject a scripted
/// runner without spawning real processes.
pub struct VirshHypervisor<R: CommandRunner> {
    runner: R,
    uri: String,
}

impl<R: CommandRunner> VirshHypervisor<R> {
    pub fn new(runner: R, uri: &str) -> Self {
        Self {
            runner,
            uri: uri.to_string(),
        }
    }
}

impl VirshHypervisor<TokioCommandRunner> {
    /// Convenience constructor for production use.
    #[must_use]
    pub fn default_runner() -> Self {
        Self::new(TokioCommandRunner::default(), LIBVIRT_URI)
    }
}

impl<R: CommandRunner> VolumeOps for VirshHypervisor<R> {
    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run("virsh", &["-c", &self.uri, "vol-list", "--pool", pool])
            .await
            .context("virsh vol-list")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("listing volumes in pool '{pool}' failed: {stderr}");
        }
        Ok(parse_vol_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String> {
        let output = self
            .runner
            .run(
                "virsh",
                &["-c", &self.uri, "vol-dumpxml", "--pool", pool, name],
            )
            .await
            .context("virsh vol-dumpxml")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("dumping descriptor of '{pool}/{name}' failed: {stderr}");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<Output> {
        // The descriptor is handed over on stdin so no scratch file is
        // needed for volume creation.
        self.runner
            .run_with_stdin(
                "virsh",
                &["-c", &self.uri, "vol-create", pool, "/dev/stdin"],
                xml.as_bytes(),
            )
            .await
            .context("virsh vol-create")
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<Output> {
        self.runner
            .run("virsh", &["-c", &self.uri, "vol-delete", "--pool", pool, name])
            .await
            .context("virsh vol-delete")
    }
}

impl<R: CommandRunner> DomainOps for VirshHypervisor<R> {
    async fn launch(&self, name: &str, binding: &ReadinessBinding<'_>) -> Result<Output> {
        let args = domain::launch_args(&self.uri, name, binding);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run_with_timeout("virt-install", &arg_refs, LAUNCH_TIMEOUT)
            .await
            .context("virt-install")
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        let output = self
            .runner
            .run("virsh", &["-c", &self.uri, "dumpxml", name])
            .await
            .context("virsh dumpxml")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("dumping descriptor of domain '{name}' failed: {stderr}");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn destroy(&self, name: &str) -> Result<Output> {
        self.runner
            .run("virsh", &["-c", &self.uri, "destroy", name])
            .await
            .context("virsh destroy")
    }
}

/// Parse the `virsh vol-list` table into volume names.
///
/// The output is a two-column table with a header and separator line;
/// the first whitespace-delimited token of each data row is the name.
fn parse_vol_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|l| !l.trim_start().starts_with('-'))
        .skip(1)
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// True if a failed `vol-delete` means the volume was already gone.
pub(crate) fn volume_missing(stderr: &str) -> bool {
    stderr.contains("Storage volume not found") || stderr.contains("failed to get vol")
}

/// True if a failed `destroy` means the domain was already gone.
pub(crate) fn domain_missing(stderr: &str) -> bool {
    stderr.contains("Domain not found") || stderr.contains("failed to get domain")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vol_list_table_parses_names() {
        let table = " Name             Path\n\
                     ------------------------------------------------\n\
                     fedora38.qcow2   /var/lib/libvirt/images/fedora38.qcow2\n\
                     centos9.qcow2    /var/lib/libvirt/images/centos9.qcow2\n";
        assert_eq!(
            parse_vol_list(table),
            vec!["fedora38.qcow2", "centos9.qcow2"]
        );
    }

    #[test]
    fn vol_list_empty_pool_yields_nothing() {
        let table = " Name   Path\n---------------\n\n";
        assert!(parse_vol_list(table).is_empty());
    }

    #[test]
    fn missing_volume_stderr_is_recognized() {
        assert!(volume_missing(
            "error: failed to get vol 'x'\nerror: Storage volume not found: no storage vol with matching name 'x'"
        ));
        assert!(!volume_missing("error: cannot unlink file: permission denied"));
    }

    #[test]
    fn missing_domain_stderr_is_recognized() {
        assert!(domain_missing(
            "error: failed to get domain 'x'\nerror: Domain not found: no domain with matching name 'x'"
        ));
        assert!(!domain_missing("error: Failed to destroy domain 'x'"));
    }
}
