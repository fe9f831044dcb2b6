//! virtci - GitLab CI custom executor driver for libvirt VMs
//!
//! Each CI job gets a throwaway VM: a copy-on-write overlay on a distro
//! template image, launched as a transient libvirt domain, reported
//! ready via cloud-init phone-home (or a virtio channel), then driven
//! over SSH for the job's stages and destroyed afterwards.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cli;
pub mod cloud_init;
pub mod command_runner;
pub mod commands;
pub mod config;
pub mod error;
pub mod machine;
pub mod readiness;
pub mod ssh;
pub mod testing;
pub mod virt;
