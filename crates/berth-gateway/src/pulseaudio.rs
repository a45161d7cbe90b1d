use crate::context::GatewayContext;
use crate::{parse_element, GatewayError, RuntimeResultExt};
use berth_runtime::{BindMount, ContainerLayout};
use berth_schema::GatewayId;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info};

const ID: GatewayId = GatewayId::PulseAudio;
const PULSE_VAR: &str = "PULSE_SERVER";

#[derive(Debug, Deserialize)]
struct RawAudio {
    audio: bool,
}

/// Access to the host's PulseAudio server socket.
#[derive(Debug, Clone, Default)]
pub struct PulseAudioGateway {
    enabled: bool,
    /// Socket path inside the container while mounted.
    mounted: Option<PathBuf>,
}

impl PulseAudioGateway {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let parsed = elements
            .iter()
            .map(|e| parse_element::<RawAudio>(ID, e))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(last) = parsed.last() {
            self.enabled = last.audio;
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        match (self.enabled, &self.mounted) {
            (true, None) => {
                let server = ctx.host.pulse_server.as_deref().ok_or(GatewayError::Activation {
                    gateway: ID,
                    reason: format!("{PULSE_VAR} is not set on the host"),
                })?;
                let source = PathBuf::from(server.strip_prefix("unix:").unwrap_or(server));
                let target = ContainerLayout::in_container(&format!("pulse-{}.sock", ctx.name));
                ctx.backend
                    .bind_mount(
                        ctx.name,
                        &BindMount {
                            source,
                            target: target.clone(),
                            read_only: false,
                        },
                    )
                    .for_gateway(ID)?;
                ctx.env
                    .insert(PULSE_VAR.to_owned(), format!("unix:{}", target.display()));
                info!("pulseaudio: audio enabled for {}", ctx.name);
                self.mounted = Some(target);
            }
            (false, Some(_)) => self.release(ctx)?,
            _ => debug!("pulseaudio: nothing to change for {}", ctx.name),
        }
        Ok(())
    }

    pub(crate) fn teardown(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        self.release(ctx)
    }

    fn release(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        if let Some(target) = self.mounted.take() {
            ctx.env.remove(PULSE_VAR);
            ctx.backend.unmount(ctx.name, &target).for_gateway(ID)?;
            info!("pulseaudio: audio disabled for {}", ctx.name);
        }
        Ok(())
    }
}
