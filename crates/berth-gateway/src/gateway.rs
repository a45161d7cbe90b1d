use crate::cgroups::CgroupsGateway;
use crate::context::{GatewayContext, GatewayPolicy};
use crate::dbus::DbusGateway;
use crate::devicenode::DeviceNodeGateway;
use crate::env::EnvGateway;
use crate::file::FileGateway;
use crate::network::NetworkGateway;
use crate::pulseaudio::PulseAudioGateway;
use crate::{malformed, GatewayError};
use berth_schema::GatewayId;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Created,
    Configured,
    Activated,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayState::Created => write!(f, "created"),
            GatewayState::Configured => write!(f, "configured"),
            GatewayState::Activated => write!(f, "activated"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum GatewayKind {
    Cgroups(CgroupsGateway),
    DeviceNode(DeviceNodeGateway),
    File(FileGateway),
    Network(NetworkGateway),
    Dbus(DbusGateway),
    PulseAudio(PulseAudioGateway),
    Env(EnvGateway),
}

/// One gateway instance of one container.
#[derive(Debug, Clone)]
pub struct Gateway {
    state: GatewayState,
    kind: GatewayKind,
}

impl Gateway {
    pub fn new(id: GatewayId, policy: &GatewayPolicy) -> Self {
        let kind = match id {
            GatewayId::Cgroups => GatewayKind::Cgroups(CgroupsGateway::default()),
            GatewayId::DeviceNode => GatewayKind::DeviceNode(DeviceNodeGateway::default()),
            GatewayId::File => GatewayKind::File(FileGateway::default()),
            GatewayId::Network => GatewayKind::Network(NetworkGateway::new(
                policy.network,
                policy.network_reactivation,
            )),
            GatewayId::Dbus => GatewayKind::Dbus(DbusGateway::default()),
            GatewayId::PulseAudio => GatewayKind::PulseAudio(PulseAudioGateway::default()),
            GatewayId::Env => GatewayKind::Env(EnvGateway::new(policy.env_reset)),
        };
        Self {
            state: GatewayState::Created,
            kind,
        }
    }

    pub fn id(&self) -> GatewayId {
        match &self.kind {
            GatewayKind::Cgroups(_) => GatewayId::Cgroups,
            GatewayKind::DeviceNode(_) => GatewayId::DeviceNode,
            GatewayKind::File(_) => GatewayId::File,
            GatewayKind::Network(_) => GatewayId::Network,
            GatewayKind::Dbus(_) => GatewayId::Dbus,
            GatewayKind::PulseAudio(_) => GatewayId::PulseAudio,
            GatewayKind::Env(_) => GatewayId::Env,
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn is_activated(&self) -> bool {
        self.state == GatewayState::Activated
    }

    pub fn kind(&self) -> &GatewayKind {
        &self.kind
    }

    /// Merge one fragment into the working configuration.
    pub fn configure(&mut self, fragment: &serde_json::Value) -> Result<(), GatewayError> {
        let id = self.id();
        let elements = fragment
            .as_array()
            .ok_or_else(|| malformed(id, "configuration must be a JSON array"))?;

        if self.state == GatewayState::Activated {
            if let GatewayKind::Network(network) = &self.kind {
                if !network.accepts_reconfiguration() {
                    return Err(GatewayError::NotReconfigurable(id));
                }
            }
        }

        match &mut self.kind {
            GatewayKind::Cgroups(g) => g.configure(elements)?,
            GatewayKind::DeviceNode(g) => g.configure(elements)?,
            GatewayKind::File(g) => g.configure(elements)?,
            GatewayKind::Network(g) => g.configure(elements)?,
            GatewayKind::Dbus(g) => g.configure(elements)?,
            GatewayKind::PulseAudio(g) => g.configure(elements)?,
            GatewayKind::Env(g) => g.configure(elements)?,
        }
        self.state = GatewayState::Configured;
        Ok(())
    }

    /// Push the merged configuration to the OS.
    pub fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        match &mut self.kind {
            GatewayKind::Cgroups(g) => g.activate(ctx)?,
            GatewayKind::DeviceNode(g) => g.activate(ctx)?,
            GatewayKind::File(g) => g.activate(ctx)?,
            GatewayKind::Network(g) => g.activate(ctx)?,
            GatewayKind::Dbus(g) => g.activate(ctx)?,
            GatewayKind::PulseAudio(g) => g.activate(ctx)?,
            GatewayKind::Env(g) => g.activate(ctx)?,
        }
        self.state = GatewayState::Activated;
        Ok(())
    }

    /// Release whatever activation created. A gateway that never activated
    /// has nothing to release.
    pub fn teardown(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        if self.state != GatewayState::Activated {
            return Ok(());
        }
        match &mut self.kind {
            GatewayKind::Dbus(g) => g.teardown(ctx)?,
            GatewayKind::PulseAudio(g) => g.teardown(ctx)?,
            GatewayKind::Cgroups(_)
            | GatewayKind::DeviceNode(_)
            | GatewayKind::File(_)
            | GatewayKind::Network(_)
            | GatewayKind::Env(_) => {}
        }
        self.state = GatewayState::Created;
        Ok(())
    }
}
