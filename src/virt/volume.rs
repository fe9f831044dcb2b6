//! Overlay volume management (VolumeStore).
//!
//! Every machine gets one copy-on-write qcow2 overlay in the working
//! pool, backed by an immutable template image resolved by distro name
//! from the template pool. The base image must be confirmed to exist
//! before any overlay is defined.

use anyhow::{Context, Result};

use crate::error::ProvisionError;
use crate::virt::{TEMPLATE_POOL, VolumeOps, WORKING_POOL, volume_missing};

/// Default overlay capacity in whole gibibytes. Not validated against
/// pool free space — insufficient space surfaces as a pool rejection
/// from the create call.
pub const DEFAULT_OVERLAY_GIB: u32 = 50;

/// A resolved template image: descriptor fields needed to point an
/// overlay's backing store at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub name: String,
    pub path: String,
    pub format: String,
}

/// Look up the template image for `distro` in the template pool.
///
/// Matches a volume literally named `<distro>.qcow2`, exact name only.
/// The pool is enumerated fresh on every call.
///
/// # Errors
///
/// [`ProvisionError::BaseImageNotFound`] if no such volume exists;
/// other errors if the pool cannot be enumerated or the descriptor is
/// malformed.
pub async fn resolve_base_image(virt: &impl VolumeOps, distro: &str) -> Result<BaseImage> {
    let image_name = format!("{distro}.qcow2");
    tracing::debug!(pool = TEMPLATE_POOL, image = %image_name, "looking up base image");

    let names = virt.list_volumes(TEMPLATE_POOL).await?;
    if !names.iter().any(|n| n == &image_name) {
        return Err(ProvisionError::BaseImageNotFound {
            name: image_name,
            pool: TEMPLATE_POOL.to_string(),
        }
        .into());
    }

    let xml = virt.volume_xml(TEMPLATE_POOL, &image_name).await?;
    let (path, format) = parse_target(&xml)
        .with_context(|| format!("parsing descriptor of base image '{image_name}'"))?;
    Ok(BaseImage {
        name: image_name,
        path,
        format,
    })
}

/// Create the overlay volume for a machine.
///
/// Resolves the base image first; no overlay is ever defined for a
/// distro whose template is missing. The overlay's backing store points
/// at the base image's path and on-disk format.
///
/// # Errors
///
/// [`ProvisionError::BaseImageNotFound`] if the template is missing,
/// [`ProvisionError::Storage`] if the pool rejects the definition
/// (name collision, insufficient space). Neither is retried.
pub async fn create_overlay(
    virt: &impl VolumeOps,
    name: &str,
    size_gib: u32,
    distro: &str,
) -> Result<()> {
    let base = resolve_base_image(virt, distro).await?;
    tracing::debug!(
        pool = WORKING_POOL,
        volume = name,
        size_gib,
        backing = %base.path,
        "creating overlay volume"
    );

    let xml = overlay_xml(name, size_gib, &base);
    let output = virt.create_volume(WORKING_POOL, &xml).await?;
    if !output.status.success() {
        return Err(ProvisionError::Storage {
            pool: WORKING_POOL.to_string(),
            name: name.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Delete a machine's overlay volume. Part of the teardown contract:
/// a volume that is already gone counts as success.
pub async fn delete_overlay(virt: &impl VolumeOps, name: &str) -> Result<()> {
    let output = virt.delete_volume(WORKING_POOL, name).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if volume_missing(&stderr) {
            tracing::debug!(volume = name, "overlay already absent");
            return Ok(());
        }
        anyhow::bail!("deleting overlay '{name}': {}", stderr.trim());
    }
    Ok(())
}

/// Build the overlay volume descriptor.
fn overlay_xml(name: &str, size_gib: u32, base: &BaseImage) -> String {
    format!(
        "<volume>\n\
         \x20 <name>{name}</name>\n\
         \x20 <capacity unit='G'>{size_gib}</capacity>\n\
         \x20 <target>\n\
         \x20   <format type='qcow2'/>\n\
         \x20 </target>\n\
         \x20 <backingStore>\n\
         \x20   <path>{path}</path>\n\
         \x20   <format type='{format}'/>\n\
         \x20 </backingStore>\n\
         </volume>\n",
        path = base.path,
        format = base.format,
    )
}

/// Extract `target/path` and `target/format@type` from a volume
/// descriptor.
fn parse_target(xml: &str) -> Result<(String, String)> {
    let doc = roxmltree::Document::parse(xml).context("invalid volume XML")?;
    let target = doc
        .descendants()
        .find(|n| n.has_tag_name("target"))
        .context("descriptor has no <target> element")?;
    let path = target
        .children()
        .find(|n| n.has_tag_name("path"))
        .and_then(|n| n.text())
        .context("descriptor has no <target>/<path>")?;
    let format = target
        .children()
        .find(|n| n.has_tag_name("format"))
        .and_then(|n| n.attribute("type"))
        .context("descriptor has no <target>/<format type=...>")?;
    Ok((path.to_string(), format.to_string()))
}
