use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the temporary write buffer when none is requested.
pub const DEFAULT_TMPFS_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("container configuration is empty")]
    Empty,
    #[error("failed to parse container configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("container configuration must contain at least one object")]
    NoElements,
    #[error("temporaryFileSystemSize must be greater than zero")]
    ZeroTmpfsSize,
}

/// Immutable creation-time options of a container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Writes land in an overlay upper layer instead of the shared rootfs.
    pub write_buffer: bool,
    /// Back the overlay upper layer with a tmpfs.
    pub tmpfs_write_buffer: bool,
    pub tmpfs_size: u64,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            write_buffer: false,
            tmpfs_write_buffer: false,
            tmpfs_size: DEFAULT_TMPFS_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptions {
    #[serde(default)]
    write_buffer_enabled: bool,
    #[serde(default)]
    temporary_file_system_write_buffer_enabled: bool,
    #[serde(default = "default_tmpfs_size")]
    temporary_file_system_size: u64,
}

fn default_tmpfs_size() -> u64 {
    DEFAULT_TMPFS_SIZE
}

/// Parse the `Create` argument: a JSON array whose first object carries the
/// options. Later elements are ignored.
pub fn parse_container_options(config: &str) -> Result<ContainerOptions, OptionsError> {
    if config.trim().is_empty() {
        return Err(OptionsError::Empty);
    }
    let elements: Vec<RawOptions> = serde_json::from_str(config)?;
    let first = elements.into_iter().next().ok_or(OptionsError::NoElements)?;
    if first.temporary_file_system_size == 0 {
        return Err(OptionsError::ZeroTmpfsSize);
    }
    Ok(ContainerOptions {
        write_buffer: first.write_buffer_enabled,
        tmpfs_write_buffer: first.temporary_file_system_write_buffer_enabled,
        tmpfs_size: first.temporary_file_system_size,
    })
}
