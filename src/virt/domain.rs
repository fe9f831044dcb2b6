//! Transient domain launch and destruction (DomainLauncher).
//!
//! The instance is created by `virt-install` with a fixed vCPU/RAM
//! profile and whichever readiness-detection mechanism the caller
//! selected: an injected cloud-init payload (phone-home mode) or a
//! bound virtio channel (direct-wait mode). The launch command's exit
//! code is authoritative — non-zero means the VM did not start.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::ProvisionError;
use crate::virt::{DomainOps, WORKING_POOL, domain_missing};

const VM_VCPUS: &str = "4";
const VM_RAM_MIB: &str = "8192";
const VM_MACHINE: &str = "q35";

/// Virtio channel target name the guest's phone-home unit writes to in
/// direct-wait mode.
pub const CHANNEL_TARGET: &str = "call_home.network";

/// Readiness-detection wiring for the launch command.
pub enum ReadinessBinding<'a> {
    /// Inject a cloud-init user-data payload (phone-home mode).
    CloudInit { user_data: &'a Path },
    /// Bind a virtio serial channel to a host-side Unix socket
    /// (direct-wait mode).
    VirtioChannel { socket_path: &'a Path },
}

/// Host-side bind path for the direct-wait channel socket.
#[must_use]
pub fn channel_bind_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/virtci-{name}-call-home.sock"))
}

/// Build the full `virt-install` argument vector.
pub(crate) fn launch_args(uri: &str, name: &str, binding: &ReadinessBinding<'_>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--connect",
        uri,
        "--name",
        name,
        "--disk",
        &format!("vol={WORKING_POOL}/{name},bus=virtio"),
        "--vcpus",
        VM_VCPUS,
        "--ram",
        VM_RAM_MIB,
        "--machine",
        VM_MACHINE,
        "--network",
        "network=default,model=virtio",
        "--graphics",
        "none",
        "--sound",
        "none",
        "--transient",
        "--console",
        "pty",
        "--noautoconsole",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    match binding {
        ReadinessBinding::CloudInit { user_data } => {
            args.push("--cloud-init".to_string());
            args.push(format!("user-data={}", user_data.display()));
        }
        ReadinessBinding::VirtioChannel { socket_path } => {
            args.push("--channel".to_string());
            args.push(format!(
                "type=unix,mode=bind,path={},target.type=virtio,target.name={CHANNEL_TARGET}",
                socket_path.display()
            ));
        }
    }

    args.push("--import".to_string());
    args
}

/// Instantiate the transient domain.
///
/// # Errors
///
/// [`ProvisionError::Launch`] on a non-zero exit. Fatal: no retry and
/// no partial cleanup here — teardown reclaims whatever exists.
pub async fn launch(
    virt: &impl DomainOps,
    name: &str,
    binding: &ReadinessBinding<'_>,
) -> Result<()> {
    tracing::debug!(domain = name, "launching transient domain");
    let output = virt.launch(name, binding).await?;
    if !output.status.success() {
        return Err(ProvisionError::Launch {
            name: name.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Resolve the host-side socket path of the domain's phone-home
/// channel from its descriptor.
///
/// The launch names a bind path, but the running domain's descriptor
/// is authoritative — libvirt may relabel or relocate the socket.
pub async fn channel_socket_path(virt: &impl DomainOps, name: &str) -> Result<PathBuf> {
    let xml = virt.domain_xml(name).await?;
    parse_channel_path(&xml, CHANNEL_TARGET)
        .with_context(|| format!("resolving channel socket of domain '{name}'"))
}

/// Destroy the domain. A domain that is already gone counts as
/// success; transient domains leave no definition behind.
pub async fn destroy(virt: &impl DomainOps, name: &str) -> Result<()> {
    let output = virt.destroy(name).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if domain_missing(&stderr) {
            tracing::debug!(domain = name, "domain already absent");
            return Ok(());
        }
        anyhow::bail!("destroying domain '{name}': {}", stderr.trim());
    }
    Ok(())
}

/// Find the `<channel>` whose virtio target matches `target_name` and
/// return its `<source path=...>`.
fn parse_channel_path(xml: &str, target_name: &str) -> Result<PathBuf> {
    let doc = roxmltree::Document::parse(xml).context("invalid domain XML")?;
    let channel = doc
        .descendants()
        .filter(|n| n.has_tag_name("channel"))
        .find(|n| {
            n.children().any(|c| {
                c.has_tag_name("target") && c.attribute("name") == Some(target_name)
            })
        })
        .with_context(|| format!("domain has no channel targeting '{target_name}'"))?;
    let path = channel
        .children()
        .find(|c| c.has_tag_name("source"))
        .and_then(|c| c.attribute("path"))
        .context("channel has no <source path=...>")?;
    Ok(PathBuf::from(path))
}
