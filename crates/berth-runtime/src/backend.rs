use crate::layout::ContainerLayout;
use crate::lxc::{LxcBackend, LxcSettings};
use crate::mock::MockBackend;
use crate::mount::BindMount;
use crate::proxy::{ProxyHandle, ProxySpec};
use crate::RuntimeError;
use berth_schema::{ContainerName, ContainerOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub options: ContainerOptions,
}

/// A command to start inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Shell command line, run with `/bin/sh -c`.
    pub command: String,
    pub cwd: Option<String>,
    /// Host file receiving stdout and stderr.
    pub stdout: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// A process started by [`ContainerBackend::attach`].
///
/// `child` is the host-side handle used to reap the process; backends that do
/// not start real processes leave it empty.
#[derive(Debug)]
pub struct Spawned {
    pub pid: u32,
    pub child: Option<Child>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub path: PathBuf,
    /// `(major, minor)` when the node must be created instead of exposed.
    pub numbers: Option<(u32, u32)>,
    /// Permission bits, e.g. `0o644`.
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// One netfilter invocation, as an argv without the program name.
pub type NetfilterCommand = Vec<String>;

/// The OS-level container engine.
///
/// Every host side effect of berth goes through this trait. Methods taking a
/// `name` operate on a container previously passed to [`create`](Self::create).
pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn layout(&self) -> &ContainerLayout;

    /// Create scaffolding and start the container's supervisor.
    fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Names of all containers known to the engine, including foreign ones.
    fn list(&self) -> Result<Vec<ContainerName>, RuntimeError>;

    fn exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.list()?.iter().any(|n| n.as_str() == name))
    }

    fn bind_mount(&self, name: &str, mount: &BindMount) -> Result<(), RuntimeError>;

    fn unmount(&self, name: &str, target: &Path) -> Result<(), RuntimeError>;

    fn set_cgroup_item(&self, name: &str, key: &str, value: &str) -> Result<(), RuntimeError>;

    fn add_device(&self, name: &str, device: &DeviceNode) -> Result<(), RuntimeError>;

    fn network_up(&self, name: &str, iface: &InterfaceConfig) -> Result<(), RuntimeError>;

    fn apply_netfilter(&self, name: &str, commands: &[NetfilterCommand]) -> Result<(), RuntimeError>;

    fn spawn_bus_proxy(&self, spec: &ProxySpec) -> Result<ProxyHandle, RuntimeError>;

    fn update_bus_proxy(&self, handle: &ProxyHandle, config: &str) -> Result<(), RuntimeError>;

    fn stop_bus_proxy(&self, handle: &ProxyHandle) -> Result<(), RuntimeError>;

    fn attach(&self, name: &str, request: &ExecRequest) -> Result<Spawned, RuntimeError>;

    fn freeze(&self, name: &str) -> Result<(), RuntimeError>;

    fn unfreeze(&self, name: &str) -> Result<(), RuntimeError>;

    /// Stop every process, release mounts and remove the container. Must
    /// succeed for containers that are already gone.
    fn destroy(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError>;
}

pub fn select_backend(
    name: &str,
    layout: ContainerLayout,
    lxc: LxcSettings,
) -> Result<Box<dyn ContainerBackend>, RuntimeError> {
    match name {
        "lxc" => Ok(Box::new(LxcBackend::new(layout, lxc))),
        "mock" => Ok(Box::new(MockBackend::new(layout))),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
