//! Cloud-init user-data generation for phone-home mode.
//!
//! The payload creates the provisioning account with passwordless sudo
//! and the operator's public keys, randomizes the root and provisioning
//! passwords, sets the hostname, and points `phone_home` at the
//! listener. Rendered as a `#cloud-config` document — cloud-init
//! ignores the file without that header.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::ssh::SSH_USER;

#[derive(Debug, Serialize)]
pub struct UserData {
    users: Vec<User>,
    chpasswd: Chpasswd,
    fqdn: String,
    phone_home: PhoneHome,
}

#[derive(Debug, Serialize)]
struct User {
    name: String,
    sudo: String,
    ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Chpasswd {
    list: Vec<String>,
    expire: bool,
}

#[derive(Debug, Serialize)]
struct PhoneHome {
    url: String,
    post: String,
}

/// Assemble the user-data document for one machine.
#[must_use]
pub fn user_data(hostname: &str, callback_url: &str, pubkeys: Vec<String>) -> UserData {
    UserData {
        users: vec![User {
            name: SSH_USER.to_string(),
            sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
            ssh_authorized_keys: pubkeys,
        }],
        chpasswd: Chpasswd {
            list: vec![
                "root:RANDOM".to_string(),
                format!("{SSH_USER}:RANDOM"),
            ],
            expire: false,
        },
        fqdn: hostname.to_string(),
        phone_home: PhoneHome {
            url: callback_url.to_string(),
            post: "all".to_string(),
        },
    }
}

/// Render user-data as a `#cloud-config` YAML document.
///
/// # Errors
///
/// Returns an error if YAML serialization fails.
pub fn render(user_data: &UserData) -> Result<String> {
    let yaml = serde_yaml::to_string(user_data).context("serializing cloud-init user data")?;
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Gather the operator's public keys: first line of every `*.pub` file
/// in `ssh_dir`. Anything else in the directory is ignored.
///
/// # Errors
///
/// Returns an error if the directory or a `.pub` file cannot be read.
pub fn collect_public_keys(ssh_dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    if !ssh_dir.is_dir() {
        return Ok(keys);
    }
    for entry in std::fs::read_dir(ssh_dir)
        .with_context(|| format!("reading {}", ssh_dir.display()))?
    {
        let path = entry.context("reading ssh dir entry")?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pub") {
            continue;
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        if let Some(line) = contents.lines().next() {
            keys.push(line.to_string());
        }
    }
    keys.sort();
    Ok(keys)
}

/// Write the rendered document to a scratch file that must outlive the
/// launch command (virt-install reads it while defining the domain).
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_user_data(machine: &str, contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{machine}-cloud-config-"))
        .suffix(".yaml")
        .tempfile()
        .context("creating cloud-init scratch file")?;
    file.write_all(contents.as_bytes())
        .context("writing cloud-init user data")?;
    Ok(file)
}
