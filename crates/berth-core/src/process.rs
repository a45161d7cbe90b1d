//! Background reaping of processes launched in containers.

use crate::container::Container;
use berth_runtime::Spawned;
use berth_schema::ContainerId;
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// A launched process started or finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessEvent {
    pub container: ContainerId,
    pub pid: u32,
    pub running: bool,
    /// Exit code, or 128 + signal number for killed processes. Zero while running.
    pub exit_code: i32,
}

pub type ProcessListener = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Announce a launched process and, if the backend handed over a child
/// handle, wait for it on a separate thread.
///
/// The container is only referenced weakly so that a destroyed container is
/// not kept alive by its reapers.
pub(crate) fn watch(
    spawned: Spawned,
    container_id: ContainerId,
    container: Weak<Mutex<Container>>,
    listener: Option<ProcessListener>,
) {
    let pid = spawned.pid;
    if let Some(listener) = &listener {
        listener(ProcessEvent {
            container: container_id,
            pid,
            running: true,
            exit_code: 0,
        });
    }

    let Some(mut child) = spawned.child else {
        return;
    };

    let reaper = std::thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("failed to wait for pid {pid} in container {container_id}: {e}");
                    -1
                }
            };
            debug!("pid {pid} in container {container_id} exited with {code}");

            if let Some(container) = container.upgrade() {
                if let Ok(mut container) = container.lock() {
                    container.processes.remove(&pid);
                }
            }
            if let Some(listener) = listener {
                listener(ProcessEvent {
                    container: container_id,
                    pid,
                    running: false,
                    exit_code: code,
                });
            }
        });
    if let Err(e) = reaper {
        warn!("could not start reaper for pid {pid}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_schema::{ContainerName, ContainerOptions};
    use std::process::Command;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    #[test]
    fn reaps_real_child_and_reports_exit() {
        let container = Arc::new(Mutex::new(Container::new(
            ContainerId(4),
            ContainerName::new("SC-4"),
            ContainerOptions::default(),
        )));
        let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let pid = child.id();
        container.lock().unwrap().processes.insert(pid);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener: ProcessListener = Arc::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        });
        watch(
            Spawned {
                pid,
                child: Some(child),
            },
            ContainerId(4),
            Arc::downgrade(&container),
            Some(listener),
        );

        let started = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.running);
        let finished = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            finished,
            ProcessEvent {
                container: ContainerId(4),
                pid,
                running: false,
                exit_code: 7,
            }
        );
        assert!(container.lock().unwrap().processes.is_empty());
    }

    #[test]
    fn mock_spawn_only_announces_start() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener: ProcessListener = Arc::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        });
        watch(
            Spawned {
                pid: 10_000,
                child: None,
            },
            ContainerId(1),
            Weak::new(),
            Some(listener),
        );
        assert!(rx.recv().unwrap().running);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
