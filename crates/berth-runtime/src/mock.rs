use crate::backend::{
    ContainerBackend, ContainerSpec, DeviceNode, ExecRequest, InterfaceConfig, NetfilterCommand,
    Spawned,
};
use crate::layout::ContainerLayout;
use crate::mount::BindMount;
use crate::proxy::{ProxyHandle, ProxySpec};
use crate::RuntimeError;
use berth_schema::{parse_byte_size, ContainerName, ContainerOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Everything the mock remembers about one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockContainer {
    pub options: ContainerOptions,
    /// Created through [`MockBackend::seed_container`] rather than `create`.
    pub foreign: bool,
    pub frozen: bool,
    pub mounts: BTreeMap<PathBuf, BindMount>,
    pub cgroups: BTreeMap<String, String>,
    pub devices: BTreeMap<PathBuf, DeviceNode>,
    pub interface: Option<InterfaceConfig>,
    pub netfilter: Vec<NetfilterCommand>,
    pub execs: Vec<ExecRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockProxy {
    pub spec: ProxySpec,
    /// Every rule set written to the proxy, oldest first.
    pub configs: Vec<String>,
}

#[derive(Debug)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    proxies: BTreeMap<u32, MockProxy>,
    next_pid: u32,
    memory_usage: u64,
    failing: BTreeSet<String>,
}

/// In-memory container engine.
///
/// Scaffolding directories and proxy sockets are real files under the layout
/// root so that path handling is exercised; everything else is recorded in
/// memory and can be inspected by tests.
pub struct MockBackend {
    layout: ContainerLayout,
    state: Mutex<MockState>,
}

const FIRST_PID: u32 = 10_000;

impl MockBackend {
    pub fn new(layout: ContainerLayout) -> Self {
        Self {
            layout,
            state: Mutex::new(MockState {
                containers: BTreeMap::new(),
                proxies: BTreeMap::new(),
                next_pid: FIRST_PID,
                memory_usage: 0,
                failing: BTreeSet::new(),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    /// Memory limits below this many bytes are refused, as the kernel does
    /// for limits under the current usage.
    pub fn set_memory_usage(&self, bytes: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.memory_usage = bytes;
        }
    }

    /// Make every later call of the named trait method fail.
    pub fn fail_operation(&self, operation: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(operation.to_owned());
        }
    }

    /// Register a container that was not created through this backend.
    pub fn seed_container(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.containers.insert(
                name.to_owned(),
                MockContainer {
                    foreign: true,
                    ..MockContainer::default()
                },
            );
        }
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state.lock().ok()?.containers.get(name).cloned()
    }

    pub fn proxies(&self) -> Vec<MockProxy> {
        self.state
            .lock()
            .map(|s| s.proxies.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check(state: &MockState, operation: &str) -> Result<(), RuntimeError> {
        if state.failing.contains(operation) {
            Err(RuntimeError::ExecFailed(format!("mock {operation} failure")))
        } else {
            Ok(())
        }
    }

    fn with_container<T>(
        &self,
        operation: &str,
        name: &str,
        f: impl FnOnce(&mut MockContainer, u64) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, operation)?;
        let usage = state.memory_usage;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))?;
        f(container, usage)
    }
}

fn write_output(path: &Path, request: &ExecRequest) -> Result<(), RuntimeError> {
    let mut out = String::new();
    if request.command.trim() == "env" {
        for (key, value) in &request.env {
            let _ = writeln!(out, "{key}={value}");
        }
    } else {
        let _ = writeln!(out, "mock-exec: {}", request.command);
    }
    std::fs::write(path, out)?;
    Ok(())
}

impl ContainerBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, "create")?;
        let name = spec.name.as_str();
        if state.containers.contains_key(name) {
            return Err(RuntimeError::AlreadyExists(name.to_owned()));
        }
        self.layout.create_scaffolding(name)?;
        state.containers.insert(
            name.to_owned(),
            MockContainer {
                options: spec.options,
                ..MockContainer::default()
            },
        );
        // Failing "start" leaves the container allocated, like lxc-start after lxc-create.
        Self::check(&state, "start")
    }

    fn list(&self) -> Result<Vec<ContainerName>, RuntimeError> {
        let state = self.state()?;
        Self::check(&state, "list")?;
        Ok(state.containers.keys().map(|k| ContainerName::new(k.as_str())).collect())
    }

    fn bind_mount(&self, name: &str, mount: &BindMount) -> Result<(), RuntimeError> {
        self.with_container("bind_mount", name, |c, _| {
            c.mounts.insert(mount.target.clone(), mount.clone());
            Ok(())
        })
    }

    fn unmount(&self, name: &str, target: &Path) -> Result<(), RuntimeError> {
        self.with_container("unmount", name, |c, _| {
            c.mounts.remove(target);
            Ok(())
        })
    }

    fn set_cgroup_item(&self, name: &str, key: &str, value: &str) -> Result<(), RuntimeError> {
        self.with_container("set_cgroup_item", name, |c, usage| {
            if key.starts_with("memory.") && key.ends_with("limit_in_bytes") {
                let bytes = parse_byte_size(value).map_err(|e| RuntimeError::CgroupRejected {
                    key: key.to_owned(),
                    value: value.to_owned(),
                    reason: e.to_string(),
                })?;
                if bytes < usage {
                    return Err(RuntimeError::CgroupRejected {
                        key: key.to_owned(),
                        value: value.to_owned(),
                        reason: "device or resource busy".to_owned(),
                    });
                }
            }
            c.cgroups.insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn add_device(&self, name: &str, device: &DeviceNode) -> Result<(), RuntimeError> {
        self.with_container("add_device", name, |c, _| {
            c.devices.insert(device.path.clone(), device.clone());
            Ok(())
        })
    }

    fn network_up(&self, name: &str, iface: &InterfaceConfig) -> Result<(), RuntimeError> {
        self.with_container("network_up", name, |c, _| {
            c.interface = Some(*iface);
            Ok(())
        })
    }

    fn apply_netfilter(&self, name: &str, commands: &[NetfilterCommand]) -> Result<(), RuntimeError> {
        self.with_container("apply_netfilter", name, |c, _| {
            c.netfilter.extend(commands.iter().cloned());
            Ok(())
        })
    }

    fn spawn_bus_proxy(&self, spec: &ProxySpec) -> Result<ProxyHandle, RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, "spawn_bus_proxy")?;
        std::fs::write(&spec.socket, "")?;
        let pid = state.next_pid;
        state.next_pid += 1;
        state.proxies.insert(
            pid,
            MockProxy {
                spec: spec.clone(),
                configs: vec![spec.config.clone()],
            },
        );
        Ok(ProxyHandle {
            pid,
            bus: spec.bus,
            socket: spec.socket.clone(),
        })
    }

    fn update_bus_proxy(&self, handle: &ProxyHandle, config: &str) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, "update_bus_proxy")?;
        let proxy = state
            .proxies
            .get_mut(&handle.pid)
            .ok_or_else(|| RuntimeError::ExecFailed(format!("no bus proxy with pid {}", handle.pid)))?;
        proxy.configs.push(config.to_owned());
        Ok(())
    }

    fn stop_bus_proxy(&self, handle: &ProxyHandle) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, "stop_bus_proxy")?;
        state.proxies.remove(&handle.pid);
        if handle.socket.exists() {
            std::fs::remove_file(&handle.socket)?;
        }
        Ok(())
    }

    fn attach(&self, name: &str, request: &ExecRequest) -> Result<Spawned, RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, "attach")?;
        let pid = state.next_pid;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))?;
        if container.frozen {
            return Err(RuntimeError::ExecFailed(format!("container {name} is frozen")));
        }
        if let Some(path) = &request.stdout {
            write_output(path, request)?;
        }
        container.execs.push(request.clone());
        state.next_pid += 1;
        Ok(Spawned { pid, child: None })
    }

    fn freeze(&self, name: &str) -> Result<(), RuntimeError> {
        self.with_container("freeze", name, |c, _| {
            c.frozen = true;
            Ok(())
        })
    }

    fn unfreeze(&self, name: &str) -> Result<(), RuntimeError> {
        self.with_container("unfreeze", name, |c, _| {
            c.frozen = false;
            Ok(())
        })
    }

    fn destroy(&self, name: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::check(&state, "destroy")?;
        state.containers.remove(name);
        self.layout.remove_scaffolding(name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, MockBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new(ContainerLayout::new(dir.path()));
        (dir, backend)
    }

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: ContainerName::new(name),
            options: ContainerOptions::default(),
        }
    }

    #[test]
    fn mock_lifecycle() {
        let (dir, backend) = setup();
        backend.create(&spec("SC-1")).unwrap();
        assert!(dir.path().join("SC-1/gateways").is_dir());
        assert!(backend.exists("SC-1").unwrap());
        assert!(backend.create(&spec("SC-1")).is_err());

        backend.freeze("SC-1").unwrap();
        assert!(backend.container("SC-1").unwrap().frozen);
        backend.unfreeze("SC-1").unwrap();
        assert!(!backend.container("SC-1").unwrap().frozen);

        backend.destroy("SC-1", Duration::from_secs(1)).unwrap();
        assert!(!backend.exists("SC-1").unwrap());
        assert!(!dir.path().join("SC-1").exists());
        backend.destroy("SC-1", Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn attach_dumps_environment() {
        let (dir, backend) = setup();
        backend.create(&spec("SC-1")).unwrap();
        let out = dir.path().join("out.txt");
        let mut env = BTreeMap::new();
        env.insert("X".to_owned(), "1234".to_owned());
        let spawned = backend
            .attach(
                "SC-1",
                &ExecRequest {
                    command: "env".to_owned(),
                    cwd: None,
                    stdout: Some(out.clone()),
                    env,
                },
            )
            .unwrap();
        assert!(spawned.pid >= FIRST_PID);
        assert!(spawned.child.is_none());
        assert_eq!(std::fs::read_to_string(out).unwrap(), "X=1234\n");
    }

    #[test]
    fn attach_refused_while_frozen() {
        let (_dir, backend) = setup();
        backend.create(&spec("SC-1")).unwrap();
        backend.freeze("SC-1").unwrap();
        assert!(backend.attach("SC-1", &ExecRequest::default()).is_err());
    }

    #[test]
    fn memory_limit_below_usage_rejected() {
        let (_dir, backend) = setup();
        backend.create(&spec("SC-1")).unwrap();
        backend.set_memory_usage(64 * 1024);
        assert!(matches!(
            backend.set_cgroup_item("SC-1", "memory.limit_in_bytes", "1K"),
            Err(RuntimeError::CgroupRejected { .. })
        ));
        backend
            .set_cgroup_item("SC-1", "memory.limit_in_bytes", "10M")
            .unwrap();
        assert_eq!(
            backend.container("SC-1").unwrap().cgroups["memory.limit_in_bytes"],
            "10M"
        );
    }

    #[test]
    fn injected_failures() {
        let (_dir, backend) = setup();
        backend.create(&spec("SC-1")).unwrap();
        backend.fail_operation("freeze");
        assert!(backend.freeze("SC-1").is_err());
        assert!(backend.unfreeze("SC-1").is_ok());

        backend.fail_operation("start");
        assert!(backend.create(&spec("SC-2")).is_err());
        assert!(backend.exists("SC-2").unwrap());
    }

    #[test]
    fn seeded_containers_are_listed() {
        let (_dir, backend) = setup();
        backend.seed_container("other-1");
        let names = backend.list().unwrap();
        assert_eq!(names, vec![ContainerName::new("other-1")]);
        assert!(backend.container("other-1").unwrap().foreign);
    }

    #[test]
    fn proxy_socket_lifecycle() {
        let (dir, backend) = setup();
        let socket = dir.path().join("sess_SC-1.sock");
        let handle = backend
            .spawn_bus_proxy(&ProxySpec {
                bus: crate::proxy::BusKind::Session,
                socket: socket.clone(),
                upstream: "unix:path=/run/user/0/bus".to_owned(),
                config: "[]".to_owned(),
            })
            .unwrap();
        assert!(socket.exists());
        backend.update_bus_proxy(&handle, "[{}]").unwrap();
        assert_eq!(backend.proxies()[0].configs, vec!["[]", "[{}]"]);
        backend.stop_bus_proxy(&handle).unwrap();
        assert!(!socket.exists());
        assert!(backend.proxies().is_empty());
    }
}
