use crate::env::EnvResetPolicy;
use crate::network::{NetworkReactivation, NetworkSettings};
use berth_runtime::ContainerBackend;
use berth_schema::{ContainerId, ContainerName};
use std::collections::BTreeMap;

/// Host values captured once at agent startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    pub session_bus: Option<String>,
    pub system_bus: Option<String>,
    pub pulse_server: Option<String>,
}

impl HostEnvironment {
    pub fn capture() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            session_bus: var("DBUS_SESSION_BUS_ADDRESS"),
            system_bus: var("DBUS_SYSTEM_BUS_ADDRESS"),
            pulse_server: var("PULSE_SERVER"),
        }
    }
}

/// Agent-wide choices that change how gateways merge configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayPolicy {
    pub env_reset: EnvResetPolicy,
    pub network_reactivation: NetworkReactivation,
    pub network: NetworkSettings,
}

/// What a gateway may touch while activating or tearing down.
pub struct GatewayContext<'a> {
    pub backend: &'a dyn ContainerBackend,
    pub id: ContainerId,
    pub name: &'a ContainerName,
    pub host: &'a HostEnvironment,
    /// Variables injected into every process launched in the container.
    pub env: &'a mut BTreeMap<String, String>,
}
