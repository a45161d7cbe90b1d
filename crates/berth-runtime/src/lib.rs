//! Container executor backends for berth.
//!
//! This crate is the only place that touches the host: the `ContainerBackend`
//! trait abstracts the OS-level container engine, with an LXC tool backend
//! for real systems and an in-memory mock for tests. It also owns the on-disk
//! scaffolding layout, bind-mount path validation, the D-Bus proxy process
//! table and host prerequisite checks.

pub mod backend;
pub mod layout;
pub mod lxc;
pub mod mock;
pub mod mount;
pub mod prereq;
pub mod proxy;
pub mod security;

pub use backend::{
    select_backend, ContainerBackend, ContainerSpec, DeviceNode, ExecRequest, InterfaceConfig,
    NetfilterCommand, Spawned,
};
pub use layout::{ContainerLayout, CONTAINER_GATEWAY_DIR};
pub use lxc::{LxcBackend, LxcSettings};
pub use mock::{MockBackend, MockContainer, MockProxy};
pub use mount::BindMount;
pub use prereq::{check_lxc_prereqs, format_missing, MissingPrereq};
pub use proxy::{BusKind, ProxyHandle, ProxySpec};
pub use security::{canonicalize_logical, MountPolicy};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("container '{0}' does not exist")]
    NotFound(String),
    #[error("container '{0}' already exists")]
    AlreadyExists(String),
    #[error("required directory is missing: {}", .0.display())]
    MissingScaffolding(PathBuf),
    #[error("mount not allowed: {0}")]
    MountDenied(String),
    #[error("cgroup setting {key}={value} rejected: {reason}")]
    CgroupRejected {
        key: String,
        value: String,
        reason: String,
    },
    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}
