use crate::mount::BindMount;
use crate::RuntimeError;
use std::path::{Path, PathBuf};

/// Resolve `.` and `..` components in an absolute path without touching the filesystem.
///
/// Container paths do not exist on the host, so `std::fs::canonicalize()`
/// cannot be used for them.
pub fn canonicalize_logical(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Rules a bind mount request must satisfy before it reaches a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPolicy {
    /// Container paths that may not be mounted over, nor anything below them.
    pub denied_target_prefixes: Vec<String>,
}

impl Default for MountPolicy {
    fn default() -> Self {
        Self {
            denied_target_prefixes: vec![
                "/proc".to_owned(),
                "/sys".to_owned(),
                "/dev".to_owned(),
            ],
        }
    }
}

impl MountPolicy {
    /// Validate a host/container path pair and return the normalized mount.
    pub fn validate(
        &self,
        host_path: &str,
        container_path: &str,
        read_only: bool,
    ) -> Result<BindMount, RuntimeError> {
        if host_path.trim().is_empty() {
            return Err(RuntimeError::MountDenied("host path is empty".to_owned()));
        }
        if container_path.trim().is_empty() {
            return Err(RuntimeError::MountDenied("container path is empty".to_owned()));
        }
        if !host_path.starts_with('/') {
            return Err(RuntimeError::MountDenied(format!(
                "host path must be absolute: {host_path}"
            )));
        }
        if !container_path.starts_with('/') {
            return Err(RuntimeError::MountDenied(format!(
                "container path must be absolute: {container_path}"
            )));
        }

        let source = Path::new(host_path);
        if !source.exists() {
            return Err(RuntimeError::MountDenied(format!(
                "host path does not exist: {host_path}"
            )));
        }

        let target = canonicalize_logical(container_path);
        if target == "/" {
            return Err(RuntimeError::MountDenied(
                "cannot mount over the container root".to_owned(),
            ));
        }
        for prefix in &self.denied_target_prefixes {
            if target == *prefix || target.starts_with(&format!("{prefix}/")) {
                return Err(RuntimeError::MountDenied(format!(
                    "{container_path} is inside protected path {prefix}"
                )));
            }
        }

        Ok(BindMount {
            source: source.to_path_buf(),
            target: PathBuf::from(target),
            read_only,
        })
    }
}
