//! Startup cleanup of containers left behind by a previous agent run.

use crate::CoreError;
use berth_runtime::ContainerBackend;
use berth_schema::ContainerName;
use std::time::Duration;
use tracing::{info, warn};

/// Destroy every backend container whose name follows the agent's naming
/// convention (`<prefix><number>`). Containers named otherwise belong to other
/// tooling and are left alone.
///
/// Returns the names that were destroyed. A container that fails to go away
/// is logged and skipped; its name stays taken, so its id is not reissued.
pub fn destroy_orphans(
    backend: &dyn ContainerBackend,
    prefix: &str,
    timeout: Duration,
) -> Result<Vec<ContainerName>, CoreError> {
    let mut destroyed = Vec::new();
    for name in backend.list()? {
        if name.id_with_prefix(prefix).is_none() {
            continue;
        }
        match backend.destroy(name.as_str(), timeout) {
            Ok(()) => {
                info!("destroyed orphaned container {name}");
                destroyed.push(name);
            }
            Err(e) => warn!("failed to destroy orphaned container {name}: {e}"),
        }
    }
    Ok(destroyed)
}
