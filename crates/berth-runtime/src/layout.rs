use crate::RuntimeError;
use std::path::{Path, PathBuf};

/// Where the late-mount directory of every container appears inside it.
pub const CONTAINER_GATEWAY_DIR: &str = "/gateways";

const LOCK_FILE: &str = ".berth-agent.lock";

/// Host-side scaffolding of all containers under one root directory.
///
/// Each container gets `<root>/<name>/` with a `gateways/` late-mount
/// directory that is shared into the container at [`CONTAINER_GATEWAY_DIR`].
/// The root itself is never created by berth; it must exist beforehand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayout {
    root: PathBuf,
}

impl ContainerLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    #[inline]
    pub fn gateway_dir(&self, name: &str) -> PathBuf {
        self.root.join(name).join("gateways")
    }

    #[inline]
    pub fn write_buffer_dir(&self, name: &str) -> PathBuf {
        self.root.join(name).join("buffer")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Path inside the container of a file placed in its late-mount directory.
    pub fn in_container(file_name: &str) -> PathBuf {
        Path::new(CONTAINER_GATEWAY_DIR).join(file_name)
    }

    pub fn ensure_root(&self) -> Result<(), RuntimeError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(RuntimeError::MissingScaffolding(self.root.clone()))
        }
    }

    /// Create the per-container directories. Fails if the root is missing.
    pub fn create_scaffolding(&self, name: &str) -> Result<PathBuf, RuntimeError> {
        self.ensure_root()?;
        let gateways = self.gateway_dir(name);
        std::fs::create_dir_all(&gateways)?;
        Ok(gateways)
    }

    pub fn remove_scaffolding(&self, name: &str) -> Result<(), RuntimeError> {
        let dir = self.container_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}
