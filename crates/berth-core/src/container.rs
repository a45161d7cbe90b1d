use crate::lifecycle::ContainerState;
use berth_gateway::{
    GatewayContext, GatewayError, GatewayPolicy, GatewaySet, GatewayState, HostEnvironment,
};
use berth_runtime::{BindMount, ContainerBackend};
use berth_schema::{ContainerId, ContainerName, ContainerOptions, GatewayId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// One container and everything the agent tracks about it.
#[derive(Debug)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub state: ContainerState,
    pub options: ContainerOptions,
    pub created_at: String,
    /// Keyed by canonical container path.
    pub bind_mounts: BTreeMap<PathBuf, BindMount>,
    pub gateways: GatewaySet,
    /// Variables exported by gateways to every launched process.
    pub env: BTreeMap<String, String>,
    pub processes: BTreeSet<u32>,
    /// Default capabilities have been applied to this container.
    pub defaults_applied: bool,
}

impl Container {
    pub fn new(id: ContainerId, name: ContainerName, options: ContainerOptions) -> Self {
        Self {
            id,
            name,
            state: ContainerState::Created,
            options,
            created_at: chrono::Utc::now().to_rfc3339(),
            bind_mounts: BTreeMap::new(),
            gateways: GatewaySet::default(),
            env: BTreeMap::new(),
            processes: BTreeSet::new(),
            defaults_applied: false,
        }
    }

    /// Hand resolved fragments to this container's gateways.
    pub fn apply_fragments(
        &mut self,
        backend: &dyn ContainerBackend,
        host: &HostEnvironment,
        policy: &GatewayPolicy,
        fragments: &[(GatewayId, serde_json::Value)],
    ) -> Result<(), GatewayError> {
        let mut ctx = GatewayContext {
            backend,
            id: self.id,
            name: &self.name,
            host,
            env: &mut self.env,
        };
        self.gateways.apply(fragments, policy, &mut ctx)
    }

    pub fn teardown_gateways(
        &mut self,
        backend: &dyn ContainerBackend,
        host: &HostEnvironment,
    ) -> Vec<GatewayError> {
        let mut ctx = GatewayContext {
            backend,
            id: self.id,
            name: &self.name,
            host,
            env: &mut self.env,
        };
        self.gateways.teardown_all(&mut ctx)
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            created_at: self.created_at.clone(),
            bind_mounts: self
                .bind_mounts
                .values()
                .map(|m| (m.target.clone(), m.source.clone(), m.read_only))
                .collect(),
            gateways: self.gateways.iter().map(|g| (g.id(), g.state())).collect(),
            env: self.env.clone(),
            processes: self.processes.iter().copied().collect(),
        }
    }
}

/// Point-in-time view of a container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: ContainerName,
    pub state: ContainerState,
    pub created_at: String,
    /// `(container path, host path, read-only)`.
    pub bind_mounts: Vec<(PathBuf, PathBuf, bool)>,
    pub gateways: BTreeMap<GatewayId, GatewayState>,
    pub env: BTreeMap<String, String>,
    pub processes: Vec<u32>,
}
