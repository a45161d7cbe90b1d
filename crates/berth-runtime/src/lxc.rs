use crate::backend::{
    ContainerBackend, ContainerSpec, DeviceNode, ExecRequest, InterfaceConfig, NetfilterCommand,
    Spawned,
};
use crate::layout::{ContainerLayout, CONTAINER_GATEWAY_DIR};
use crate::mount::{self, shell_quote, BindMount};
use crate::proxy::{ProxyHandle, ProxySpec, ProxyTable};
use crate::RuntimeError;
use berth_schema::ContainerName;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LxcSettings {
    pub lxc_path: PathBuf,
    pub template: String,
    pub proxy_program: String,
}

impl Default for LxcSettings {
    fn default() -> Self {
        Self {
            lxc_path: PathBuf::from("/var/lib/lxc"),
            template: "none".to_owned(),
            proxy_program: "dbus-proxy".to_owned(),
        }
    }
}

/// Drives containers through the `lxc-*` command line tools.
pub struct LxcBackend {
    layout: ContainerLayout,
    settings: LxcSettings,
    proxies: ProxyTable,
    staging: AtomicU64,
}

impl LxcBackend {
    pub fn new(layout: ContainerLayout, settings: LxcSettings) -> Self {
        let proxies = ProxyTable::new(settings.proxy_program.clone());
        Self {
            layout,
            settings,
            proxies,
            staging: AtomicU64::new(0),
        }
    }

    fn lxc(&self, tool: &str, name: &str) -> Command {
        let mut cmd = Command::new(tool);
        cmd.arg("-P")
            .arg(&self.settings.lxc_path)
            .arg("-n")
            .arg(name)
            .stdin(Stdio::null());
        cmd
    }

    fn rootfs(&self, name: &str) -> PathBuf {
        self.settings.lxc_path.join(name).join("rootfs")
    }

    /// Run a command inside the container and wait for it.
    fn attach_wait(&self, name: &str, argv: &[&str]) -> Result<Output, RuntimeError> {
        let mut cmd = self.lxc("lxc-attach", name);
        cmd.arg("--").args(argv);
        run(&mut cmd, &argv.join(" "))
    }

    fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let name = spec.name.as_str();
        let mut defines = vec![format!(
            "lxc.mount.entry={} {} none rbind,create=dir 0 0",
            self.layout.gateway_dir(name).display(),
            CONTAINER_GATEWAY_DIR.trim_start_matches('/')
        )];
        if spec.options.write_buffer {
            let upper = self.layout.write_buffer_dir(name).join("upper");
            defines.push(format!(
                "lxc.rootfs.path=overlay:{}:{}",
                self.rootfs(name).display(),
                upper.display()
            ));
        }

        let mut args = Vec::new();
        for define in defines {
            args.push("-s".to_owned());
            args.push(define);
        }
        args.extend(["-d", "--", "sleep", "infinity"].map(str::to_owned));
        args
    }
}

fn run(cmd: &mut Command, what: &str) -> Result<Output, RuntimeError> {
    let output = cmd
        .output()
        .map_err(|e| RuntimeError::ExecFailed(format!("{what}: {e}")))?;
    if !output.status.success() {
        return Err(RuntimeError::CommandFailed {
            command: what.to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output)
}

fn command_line(request: &ExecRequest) -> String {
    match request.cwd.as_deref().filter(|c| !c.is_empty()) {
        Some(cwd) => format!("cd {} && exec {}", shell_quote(cwd), request.command),
        None => format!("exec {}", request.command),
    }
}

impl ContainerBackend for LxcBackend {
    fn name(&self) -> &'static str {
        "lxc"
    }

    fn available(&self) -> bool {
        Command::new("lxc-create")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let name = spec.name.as_str();
        self.layout.create_scaffolding(name)?;
        if self.exists(name)? {
            return Err(RuntimeError::AlreadyExists(name.to_owned()));
        }

        run(
            self.lxc("lxc-create", name)
                .arg("-t")
                .arg(&self.settings.template),
            "lxc-create",
        )?;

        if spec.options.write_buffer {
            let buffer = self.layout.write_buffer_dir(name);
            if spec.options.tmpfs_write_buffer {
                mount::mount_tmpfs(&buffer, spec.options.tmpfs_size)?;
            }
            std::fs::create_dir_all(buffer.join("upper"))?;
        }

        run(self.lxc("lxc-start", name).args(self.create_args(spec)), "lxc-start")?;
        run(
            self.lxc("lxc-wait", name).args(["-s", "RUNNING", "-t", "10"]),
            "lxc-wait",
        )?;
        info!("container {name} started");
        Ok(())
    }

    fn list(&self) -> Result<Vec<ContainerName>, RuntimeError> {
        let output = run(
            Command::new("lxc-ls")
                .arg("-P")
                .arg(&self.settings.lxc_path)
                .arg("-1")
                .stdin(Stdio::null()),
            "lxc-ls",
        )?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ContainerName::from)
            .collect())
    }

    fn bind_mount(&self, name: &str, mount: &BindMount) -> Result<(), RuntimeError> {
        // Mount on the host inside the shared late-mount dir, then move the
        // mount to its final place from inside the container.
        let n = self.staging.fetch_add(1, Ordering::Relaxed);
        let staging_name = format!(".mnt-{n}");
        let staging = self.layout.gateway_dir(name).join(&staging_name);
        mount::mount_bind(&mount.source, &staging, mount.read_only)?;

        let inner = ContainerLayout::in_container(&staging_name);
        let target = mount.target.to_string_lossy();
        let script = if mount.source.is_dir() {
            format!("mkdir -p {0}", shell_quote(&target))
        } else {
            format!(
                "mkdir -p \"$(dirname {0})\" && touch {0}",
                shell_quote(&target)
            )
        };
        let script = format!(
            "{script} && mount --move {} {}",
            shell_quote(&inner.to_string_lossy()),
            shell_quote(&target)
        );
        if let Err(e) = self.attach_wait(name, &["/bin/sh", "-c", &script]) {
            let _ = mount::unmount(&staging);
            return Err(e);
        }
        debug!("{name}: mounted {} at {target}", mount.source.display());
        Ok(())
    }

    fn unmount(&self, name: &str, target: &Path) -> Result<(), RuntimeError> {
        self.attach_wait(name, &["umount", "-l", &target.to_string_lossy()])?;
        Ok(())
    }

    fn set_cgroup_item(&self, name: &str, key: &str, value: &str) -> Result<(), RuntimeError> {
        let output = self
            .lxc("lxc-cgroup", name)
            .args([key, value])
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("lxc-cgroup: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::CgroupRejected {
                key: key.to_owned(),
                value: value.to_owned(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    fn add_device(&self, name: &str, device: &DeviceNode) -> Result<(), RuntimeError> {
        let path = device.path.to_string_lossy();
        // Re-applying a device only changes its mode.
        let present = self.attach_wait(name, &["test", "-e", &path]).is_ok();
        if !present {
            match device.numbers {
                Some((major, minor)) => {
                    self.attach_wait(
                        name,
                        &["mknod", &path, "c", &major.to_string(), &minor.to_string()],
                    )?;
                }
                None => {
                    run(self.lxc("lxc-device", name).args(["add", &path]), "lxc-device")?;
                }
            }
        }
        if let Some(mode) = device.mode {
            self.attach_wait(name, &["chmod", &format!("{mode:o}"), &path])?;
        }
        Ok(())
    }

    fn network_up(&self, name: &str, iface: &InterfaceConfig) -> Result<(), RuntimeError> {
        let address = format!("{}/{}", iface.address, iface.prefix_len);
        self.attach_wait(name, &["ip", "link", "set", "eth0", "up"])?;
        self.attach_wait(name, &["ip", "addr", "add", &address, "dev", "eth0"])?;
        self.attach_wait(
            name,
            &["ip", "route", "replace", "default", "via", &iface.gateway.to_string()],
        )?;
        Ok(())
    }

    fn apply_netfilter(&self, name: &str, commands: &[NetfilterCommand]) -> Result<(), RuntimeError> {
        for command in commands {
            let mut argv: Vec<&str> = vec!["iptables"];
            argv.extend(command.iter().map(String::as_str));
            self.attach_wait(name, &argv)?;
        }
        Ok(())
    }

    fn spawn_bus_proxy(&self, spec: &ProxySpec) -> Result<ProxyHandle, RuntimeError> {
        self.proxies.spawn(spec)
    }

    fn update_bus_proxy(&self, handle: &ProxyHandle, config: &str) -> Result<(), RuntimeError> {
        self.proxies.update(handle, config)
    }

    fn stop_bus_proxy(&self, handle: &ProxyHandle) -> Result<(), RuntimeError> {
        self.proxies.stop(handle)
    }

    fn attach(&self, name: &str, request: &ExecRequest) -> Result<Spawned, RuntimeError> {
        let mut cmd = self.lxc("lxc-attach", name);
        cmd.arg("--clear-env");
        for (key, value) in &request.env {
            cmd.arg("-v").arg(format!("{key}={value}"));
        }
        cmd.args(["--", "/bin/sh", "-c"]).arg(command_line(request));

        if let Some(path) = &request.stdout {
            let out = OpenOptions::new().create(true).append(true).open(path)?;
            let err = out.try_clone()?;
            cmd.stdout(out).stderr(err);
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd
            .spawn()
            .map_err(|e| RuntimeError::ExecFailed(format!("lxc-attach failed to start: {e}")))?;
        Ok(Spawned {
            pid: child.id(),
            child: Some(child),
        })
    }

    fn freeze(&self, name: &str) -> Result<(), RuntimeError> {
        run(&mut self.lxc("lxc-freeze", name), "lxc-freeze")?;
        Ok(())
    }

    fn unfreeze(&self, name: &str) -> Result<(), RuntimeError> {
        run(&mut self.lxc("lxc-unfreeze", name), "lxc-unfreeze")?;
        Ok(())
    }

    fn destroy(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError> {
        if self.exists(name)? {
            let secs = timeout.as_secs().max(1).to_string();
            if let Err(e) = run(self.lxc("lxc-stop", name).args(["-t", &secs]), "lxc-stop") {
                warn!("{name}: graceful stop failed ({e}), killing");
                run(self.lxc("lxc-stop", name).arg("-k"), "lxc-stop -k")?;
            }
            run(&mut self.lxc("lxc-destroy", name), "lxc-destroy")?;
        }

        let gateways = self.layout.gateway_dir(name);
        if let Ok(entries) = std::fs::read_dir(&gateways) {
            for entry in entries.filter_map(Result::ok) {
                mount::unmount(&entry.path())?;
            }
        }
        mount::unmount(&self.layout.write_buffer_dir(name))?;
        self.layout.remove_scaffolding(name)?;
        info!("container {name} destroyed");
        Ok(())
    }
}
