use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A host path exposed at `target` inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// Shell-escape a string for safe interpolation into `sh -c`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
pub fn is_mounted(path: &Path) -> bool {
    let canonical = match std::fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&canonical)),
        Err(_) => false,
    }
}

fn run_mount(args: &[&str]) -> Result<(), RuntimeError> {
    let output = Command::new("mount")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| RuntimeError::ExecFailed(format!("mount not found or failed to start: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(RuntimeError::CommandFailed {
            command: format!("mount {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

/// Bind `source` onto `target` on the host, creating the target as a file or
/// directory to match the source.
pub fn mount_bind(source: &Path, target: &Path, read_only: bool) -> Result<(), RuntimeError> {
    if !target.exists() {
        if source.is_dir() {
            std::fs::create_dir_all(target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(target)?;
        }
    }

    let src = source.to_string_lossy();
    let dst = target.to_string_lossy();
    run_mount(&["--bind", &src, &dst])?;
    if read_only {
        run_mount(&["-o", "remount,bind,ro", &dst])?;
    }
    Ok(())
}

pub fn mount_tmpfs(target: &Path, size: u64) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(target)?;
    let options = format!("size={size}");
    run_mount(&["-t", "tmpfs", "-o", &options, "tmpfs", &target.to_string_lossy()])
}

/// Lazily unmount `target` if it is mounted. Unmounted paths are left alone.
pub fn unmount(target: &Path) -> Result<(), RuntimeError> {
    if !is_mounted(target) {
        return Ok(());
    }
    let output = Command::new("umount")
        .arg("-l")
        .arg(target)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| RuntimeError::ExecFailed(format!("umount failed to start: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(RuntimeError::CommandFailed {
            command: format!("umount -l {}", target.display()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}
