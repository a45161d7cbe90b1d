//! Gateways mediate every resource a contained application can reach.
//!
//! Each gateway accepts configuration fragments (JSON arrays of objects),
//! merges them under its own whitelisting policy and pushes the merged result
//! to the OS through a [`berth_runtime::ContainerBackend`] when activated.
//! The seven kinds form the closed [`Gateway`] enum; a container owns at most
//! one of each through a [`GatewaySet`].

pub mod cgroups;
pub mod context;
pub mod dbus;
pub mod devicenode;
pub mod env;
pub mod file;
pub mod gateway;
pub mod network;
pub mod pulseaudio;
pub mod set;

pub use context::{GatewayContext, GatewayPolicy, HostEnvironment};
pub use env::EnvResetPolicy;
pub use gateway::{Gateway, GatewayKind, GatewayState};
pub use network::{NetworkReactivation, NetworkSettings};
pub use set::GatewaySet;

use berth_runtime::RuntimeError;
use berth_schema::GatewayId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{gateway}: malformed configuration: {reason}")]
    Malformed { gateway: GatewayId, reason: String },
    #[error("{gateway}: conflicting configuration: {reason}")]
    Conflict { gateway: GatewayId, reason: String },
    #[error("{0} gateway does not accept configuration after activation")]
    NotReconfigurable(GatewayId),
    #[error("{gateway}: activation failed: {reason}")]
    Activation { gateway: GatewayId, reason: String },
    #[error("{gateway}: {source}")]
    Runtime {
        gateway: GatewayId,
        #[source]
        source: RuntimeError,
    },
}

impl GatewayError {
    pub fn gateway(&self) -> GatewayId {
        match self {
            GatewayError::Malformed { gateway, .. }
            | GatewayError::Conflict { gateway, .. }
            | GatewayError::Activation { gateway, .. }
            | GatewayError::Runtime { gateway, .. } => *gateway,
            GatewayError::NotReconfigurable(gateway) => *gateway,
        }
    }

    /// The fragments were merged but pushing them to the OS failed.
    pub fn is_activation(&self) -> bool {
        matches!(
            self,
            GatewayError::Activation { .. } | GatewayError::Runtime { .. }
        )
    }
}

pub(crate) fn malformed(gateway: GatewayId, reason: impl Into<String>) -> GatewayError {
    GatewayError::Malformed {
        gateway,
        reason: reason.into(),
    }
}

/// Deserialize one fragment element into a gateway's raw element type.
pub(crate) fn parse_element<T: serde::de::DeserializeOwned>(
    gateway: GatewayId,
    element: &serde_json::Value,
) -> Result<T, GatewayError> {
    if !element.is_object() {
        return Err(malformed(gateway, format!("element is not an object: {element}")));
    }
    serde_json::from_value(element.clone()).map_err(|e| malformed(gateway, e.to_string()))
}

pub(crate) trait RuntimeResultExt<T> {
    fn for_gateway(self, gateway: GatewayId) -> Result<T, GatewayError>;
}

impl<T> RuntimeResultExt<T> for Result<T, RuntimeError> {
    fn for_gateway(self, gateway: GatewayId) -> Result<T, GatewayError> {
        self.map_err(|source| GatewayError::Runtime { gateway, source })
    }
}
