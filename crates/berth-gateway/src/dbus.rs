//! D-Bus access through filtering proxies.
//!
//! Each configured bus gets one proxy process on the host, listening on a
//! socket in the container's late-mount directory. The proxy forwards only
//! messages matching the union of all allow-rules configured so far; an empty
//! rule set lets nothing through.

use crate::context::GatewayContext;
use crate::{malformed, parse_element, GatewayError, RuntimeResultExt};
use berth_runtime::{BusKind, ContainerLayout, ProxyHandle, ProxySpec};
use berth_schema::GatewayId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

const ID: GatewayId = GatewayId::Dbus;
const SESSION_KEY: &str = "dbus-gateway-config-session";
const SYSTEM_KEY: &str = "dbus-gateway-config-system";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DbusRule {
    pub direction: Direction,
    pub interface: String,
    pub object_path: String,
    pub method: String,
}

#[derive(Debug, Deserialize)]
struct RawElement {
    #[serde(rename = "dbus-gateway-config-session", default)]
    session: Option<Vec<serde_json::Value>>,
    #[serde(rename = "dbus-gateway-config-system", default)]
    system: Option<Vec<serde_json::Value>>,
}

fn config_key(bus: BusKind) -> &'static str {
    match bus {
        BusKind::Session => SESSION_KEY,
        BusKind::System => SYSTEM_KEY,
    }
}

fn parse_rules(bus: BusKind, rules: Vec<serde_json::Value>) -> Result<Vec<DbusRule>, GatewayError> {
    rules
        .into_iter()
        .map(|rule| {
            let rule: DbusRule = serde_json::from_value(rule)
                .map_err(|e| malformed(ID, format!("{}: {e}", config_key(bus))))?;
            if rule.interface.is_empty() || rule.object_path.is_empty() || rule.method.is_empty() {
                return Err(malformed(
                    ID,
                    format!("{}: rule fields must not be empty", config_key(bus)),
                ));
            }
            Ok(rule)
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
struct BusState {
    rules: BTreeSet<DbusRule>,
    proxy: Option<ProxyHandle>,
    /// Rule set the running proxy was last given.
    pushed: Option<String>,
}

impl BusState {
    fn proxy_config(&self, bus: BusKind) -> Result<String, GatewayError> {
        let mut config = serde_json::Map::new();
        config.insert(
            config_key(bus).to_owned(),
            serde_json::to_value(&self.rules).map_err(|e| malformed(ID, e.to_string()))?,
        );
        Ok(serde_json::Value::Object(config).to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DbusGateway {
    buses: BTreeMap<BusKind, BusState>,
}

impl DbusGateway {
    /// Merged allow-rules for a bus, or `None` if the bus was never configured.
    pub fn rules(&self, bus: BusKind) -> Option<&BTreeSet<DbusRule>> {
        self.buses.get(&bus).map(|b| &b.rules)
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let mut parsed = Vec::new();
        for element in elements {
            let raw: RawElement = parse_element(ID, element)?;
            if raw.session.is_none() && raw.system.is_none() {
                return Err(malformed(
                    ID,
                    format!("element has neither {SESSION_KEY} nor {SYSTEM_KEY}"),
                ));
            }
            if let Some(rules) = raw.session {
                parsed.push((BusKind::Session, parse_rules(BusKind::Session, rules)?));
            }
            if let Some(rules) = raw.system {
                parsed.push((BusKind::System, parse_rules(BusKind::System, rules)?));
            }
        }

        for (bus, rules) in parsed {
            self.buses.entry(bus).or_default().rules.extend(rules);
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        for (&bus, state) in &mut self.buses {
            let config = state.proxy_config(bus)?;
            match &state.proxy {
                Some(_) if state.pushed.as_deref() == Some(config.as_str()) => continue,
                Some(handle) => {
                    ctx.backend.update_bus_proxy(handle, &config).for_gateway(ID)?;
                    debug!("dbus: {} proxy of {} reconfigured", bus.as_str(), ctx.name);
                }
                None => {
                    let upstream = upstream_address(bus, ctx)?;
                    let socket_name = bus.socket_name(ctx.name.as_str());
                    let spec = ProxySpec {
                        bus,
                        socket: ctx.backend.layout().gateway_dir(ctx.name.as_str()).join(&socket_name),
                        upstream,
                        config: config.clone(),
                    };
                    let handle = ctx.backend.spawn_bus_proxy(&spec).for_gateway(ID)?;
                    ctx.env.insert(
                        bus.address_var().to_owned(),
                        format!("unix:path={}", ContainerLayout::in_container(&socket_name).display()),
                    );
                    info!("dbus: {} proxy for {} started (pid {})", bus.as_str(), ctx.name, handle.pid);
                    state.proxy = Some(handle);
                }
            }
            state.pushed = Some(config);
        }
        Ok(())
    }

    pub(crate) fn teardown(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        let mut first_error = None;
        for (&bus, state) in &mut self.buses {
            if let Some(handle) = state.proxy.take() {
                ctx.env.remove(bus.address_var());
                state.pushed = None;
                if let Err(e) = ctx.backend.stop_bus_proxy(&handle) {
                    warn!("dbus: failed to stop {} proxy of {}: {e}", bus.as_str(), ctx.name);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e).for_gateway(ID),
            None => Ok(()),
        }
    }
}

fn upstream_address(bus: BusKind, ctx: &GatewayContext<'_>) -> Result<String, GatewayError> {
    match bus {
        BusKind::Session => ctx.host.session_bus.clone().ok_or(GatewayError::Activation {
            gateway: ID,
            reason: format!("{} is not set on the host", bus.address_var()),
        }),
        BusKind::System => Ok(ctx.host.system_bus.clone().unwrap_or_else(|| {
            warn!(
                "dbus: {} not set on the host, using {DEFAULT_SYSTEM_BUS}",
                bus.address_var()
            );
            DEFAULT_SYSTEM_BUS.to_owned()
        })),
    }
}
