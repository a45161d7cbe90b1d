use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments, has no side effects and cannot fail.
    unsafe { libc::geteuid() }
}

const LXC_TOOLS: [&str; 9] = [
    "lxc-create",
    "lxc-start",
    "lxc-stop",
    "lxc-destroy",
    "lxc-attach",
    "lxc-freeze",
    "lxc-unfreeze",
    "lxc-cgroup",
    "lxc-ls",
];

/// Check all prerequisites for the LXC backend.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_lxc_prereqs(proxy_program: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if effective_uid() != 0 {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "creating system containers, cgroups and device nodes",
            install_hint: "run the agent as root or from a privileged system unit",
        });
    }

    if LXC_TOOLS.iter().any(|tool| !command_exists(tool)) {
        missing.push(MissingPrereq {
            name: "lxc tools",
            purpose: "container creation, attach, freeze and cgroup control",
            install_hint: "apt install lxc | dnf install lxc | zypper install lxc",
        });
    }

    if !command_exists("lxc-device") {
        missing.push(MissingPrereq {
            name: "lxc-device",
            purpose: "exposing host device nodes to containers",
            install_hint: "part of the lxc package",
        });
    }

    if !command_exists(proxy_program) {
        missing.push(MissingPrereq {
            name: "dbus-proxy",
            purpose: "filtering D-Bus access from containers",
            install_hint: "install the dbus-proxy helper and put it on PATH",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nContainers may fail to start until these are resolved.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "lxc tools",
            purpose: "containers",
            install_hint: "apt install lxc",
        };
        let s = format!("{m}");
        assert!(s.contains("lxc tools"));
        assert!(s.contains("containers"));
        assert!(s.contains("apt install lxc"));
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = vec![
            MissingPrereq {
                name: "lxc tools",
                purpose: "containers",
                install_hint: "apt install lxc",
            },
            MissingPrereq {
                name: "dbus-proxy",
                purpose: "bus filtering",
                install_hint: "build it",
            },
        ];
        let output = format_missing(&items);
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("lxc tools"));
        assert!(output.contains("dbus-proxy"));
    }

    #[test]
    fn unknown_proxy_program_is_reported() {
        let missing = check_lxc_prereqs("berth-surely-missing-proxy");
        assert!(missing.iter().any(|m| m.name == "dbus-proxy"));
    }
}
