//! Host-side D-Bus filtering proxies.
//!
//! One proxy process runs per container and bus. It listens on a socket in
//! the container's late-mount directory and forwards only the messages its
//! JSON rule set allows. The rule set is written to the proxy's stdin, which
//! stays open so the rules can be replaced while the proxy runs.

use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SOCKET_WAIT: Duration = Duration::from_secs(10);
const SOCKET_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BusKind::Session => "session",
            BusKind::System => "system",
        }
    }

    /// Environment variable naming the bus address, on the host and in the container.
    pub fn address_var(self) -> &'static str {
        match self {
            BusKind::Session => "DBUS_SESSION_BUS_ADDRESS",
            BusKind::System => "DBUS_SYSTEM_BUS_ADDRESS",
        }
    }

    pub fn socket_name(self, container: &str) -> String {
        match self {
            BusKind::Session => format!("sess_{container}.sock"),
            BusKind::System => format!("sys_{container}.sock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub bus: BusKind,
    /// Host path of the listening socket.
    pub socket: PathBuf,
    /// Address of the real bus the proxy forwards to.
    pub upstream: String,
    /// JSON rule set.
    pub config: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandle {
    pub pid: u32,
    pub bus: BusKind,
    pub socket: PathBuf,
}

struct RunningProxy {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Owns the proxy child processes spawned by a backend.
pub(crate) struct ProxyTable {
    program: String,
    running: Mutex<HashMap<u32, RunningProxy>>,
}

impl ProxyTable {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn spawn(&self, spec: &ProxySpec) -> Result<ProxyHandle, RuntimeError> {
        let mut child = Command::new(&self.program)
            .arg(&spec.socket)
            .arg(spec.bus.as_str())
            .env(spec.bus.address_var(), &spec.upstream)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                RuntimeError::ExecFailed(format!("{} not found or failed to start: {e}", self.program))
            })?;

        let mut stdin = child.stdin.take();
        if let Some(pipe) = stdin.as_mut() {
            if let Err(e) = write_config(pipe, &spec.config) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }

        if !wait_for_socket(&spec.socket, SOCKET_WAIT) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::ExecFailed(format!(
                "{} proxy socket never appeared: {}",
                spec.bus.as_str(),
                spec.socket.display()
            )));
        }

        let pid = child.id();
        debug!("started {} bus proxy pid {pid} on {}", spec.bus.as_str(), spec.socket.display());
        self.running
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .insert(pid, RunningProxy { child, stdin });

        Ok(ProxyHandle {
            pid,
            bus: spec.bus,
            socket: spec.socket.clone(),
        })
    }

    pub(crate) fn update(&self, handle: &ProxyHandle, config: &str) -> Result<(), RuntimeError> {
        let mut running = self
            .running
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        let proxy = running
            .get_mut(&handle.pid)
            .ok_or_else(|| RuntimeError::ExecFailed(format!("no bus proxy with pid {}", handle.pid)))?;
        let pipe = proxy
            .stdin
            .as_mut()
            .ok_or_else(|| RuntimeError::ExecFailed("bus proxy stdin is closed".to_owned()))?;
        write_config(pipe, config)
    }

    pub(crate) fn stop(&self, handle: &ProxyHandle) -> Result<(), RuntimeError> {
        let proxy = self
            .running
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .remove(&handle.pid);
        if let Some(mut proxy) = proxy {
            drop(proxy.stdin.take());
            if let Err(e) = proxy.child.kill() {
                warn!("failed to kill bus proxy {}: {e}", handle.pid);
            }
            let _ = proxy.child.wait();
        }
        if handle.socket.exists() {
            std::fs::remove_file(&handle.socket)?;
        }
        Ok(())
    }
}

fn write_config(pipe: &mut ChildStdin, config: &str) -> Result<(), RuntimeError> {
    pipe.write_all(config.as_bytes())?;
    pipe.write_all(b"\n")?;
    pipe.flush()?;
    Ok(())
}

fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        std::thread::sleep(SOCKET_POLL);
    }
    path.exists()
}
