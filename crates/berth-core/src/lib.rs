//! Container agent core for berth.
//!
//! This crate ties service manifests, gateways and container backends
//! together into the [`Agent`]: the object behind every RPC call. It owns the
//! per-container lifecycle state machine, the capability registry that turns
//! capability names into gateway fragments, the container registry with its
//! per-container locks, background process reaping, startup reconciliation
//! of orphaned containers and the agent-instance lock.

pub mod agent;
pub mod capability;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod lifecycle;
pub mod process;
pub mod reconcile;
pub mod registry;

pub use agent::Agent;
pub use capability::CapabilityRegistry;
pub use concurrency::{install_signal_handler, request_shutdown, shutdown_requested, AgentLock};
pub use config::AgentConfig;
pub use container::{Container, ContainerInfo};
pub use lifecycle::{validate_transition, ContainerState};
pub use process::{ProcessEvent, ProcessListener};
pub use reconcile::destroy_orphans;
pub use registry::ContainerRegistry;

use berth_schema::ContainerId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid container configuration: {0}")]
    Options(#[from] berth_schema::OptionsError),
    #[error("service manifest error: {0}")]
    Manifest(#[from] berth_schema::ManifestError),
    #[error("runtime error: {0}")]
    Runtime(#[from] berth_runtime::RuntimeError),
    #[error("gateway error: {0}")]
    Gateway(#[from] berth_gateway::GatewayError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),
    #[error("unknown capability: '{0}'")]
    UnknownCapability(String),
    #[error("unknown gateway id: '{0}'")]
    UnknownGateway(String),
    #[error("capability '{0}' is declared in both standard and default manifests")]
    DuplicateCapability(String),
    #[error("invalid configuration for gateway '{gateway}': {reason}")]
    InvalidGatewayConfig { gateway: String, reason: String },
    #[error("{target} is already mounted from {existing}")]
    MountConflict { target: String, existing: String },
    #[error("no free container id left")]
    IdsExhausted,
    #[error("another agent holds {0}")]
    AgentLocked(PathBuf),
    #[error("invalid agent configuration: {0}")]
    Config(String),
    #[error("failed to parse agent configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Errors after which the agent cannot keep serving safely.
    ///
    /// A missing container root means no container can ever be created; the
    /// agent shuts down instead of answering every `Create` with a failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Runtime(berth_runtime::RuntimeError::MissingScaffolding(_))
        )
    }
}

pub(crate) fn poisoned<T>(e: std::sync::PoisonError<T>) -> CoreError {
    CoreError::LockPoisoned(e.to_string())
}
