use crate::context::{GatewayContext, GatewayPolicy};
use crate::gateway::Gateway;
use crate::GatewayError;
use berth_schema::GatewayId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

/// The gateways of one container, at most one per [`GatewayId`].
#[derive(Debug, Clone, Default)]
pub struct GatewaySet {
    gateways: BTreeMap<GatewayId, Gateway>,
}

impl GatewaySet {
    pub fn get(&self, id: GatewayId) -> Option<&Gateway> {
        self.gateways.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.values()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Route fragments to their gateways, then activate every touched gateway.
    ///
    /// Configuration happens on copies: if any fragment is rejected, no
    /// gateway changes. Activation runs in [`GatewayId`] order and stops at the
    /// first failure; gateways activated before it stay active.
    pub fn apply(
        &mut self,
        fragments: &[(GatewayId, serde_json::Value)],
        policy: &GatewayPolicy,
        ctx: &mut GatewayContext<'_>,
    ) -> Result<(), GatewayError> {
        let mut staged: BTreeMap<GatewayId, Gateway> = BTreeMap::new();
        for (id, fragment) in fragments {
            let gateway = staged.entry(*id).or_insert_with(|| {
                self.gateways
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Gateway::new(*id, policy))
            });
            gateway.configure(fragment)?;
        }

        let touched: BTreeSet<GatewayId> = staged.keys().copied().collect();
        self.gateways.extend(staged);
        debug!("{}: configured {} gateway(s)", ctx.name, touched.len());

        for id in touched {
            let Some(gateway) = self.gateways.get_mut(&id) else {
                continue;
            };
            if let Err(e) = gateway.activate(ctx) {
                error!("{}: {e}", ctx.name);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear down every activated gateway in reverse [`GatewayId`] order.
    ///
    /// All gateways are attempted; the errors of those that failed are returned.
    pub fn teardown_all(&mut self, ctx: &mut GatewayContext<'_>) -> Vec<GatewayError> {
        let mut errors = Vec::new();
        for gateway in self.gateways.values_mut().rev() {
            if let Err(e) = gateway.teardown(ctx) {
                warn!("{}: teardown failed: {e}", ctx.name);
                errors.push(e);
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HostEnvironment;
    use crate::gateway::{GatewayKind, GatewayState};
    use berth_runtime::{
        BusKind, ContainerBackend, ContainerLayout, ContainerSpec, MockBackend,
    };
    use berth_schema::{ContainerId, ContainerName, ContainerOptions};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: MockBackend,
        name: ContainerName,
        host: HostEnvironment,
        env: BTreeMap<String, String>,
        set: GatewaySet,
        policy: GatewayPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let backend = MockBackend::new(ContainerLayout::new(dir.path()));
            let name = ContainerName::new("SC-3");
            backend
                .create(&ContainerSpec {
                    name: name.clone(),
                    options: ContainerOptions::default(),
                })
                .unwrap();
            Self {
                _dir: dir,
                backend,
                name,
                host: HostEnvironment {
                    session_bus: Some("unix:path=/run/user/1000/bus".to_owned()),
                    system_bus: None,
                    pulse_server: None,
                },
                env: BTreeMap::new(),
                set: GatewaySet::default(),
                policy: GatewayPolicy::default(),
            }
        }

        fn apply(&mut self, fragments: &[(GatewayId, serde_json::Value)]) -> Result<(), GatewayError> {
            let mut ctx = GatewayContext {
                backend: &self.backend,
                id: ContainerId(3),
                name: &self.name,
                host: &self.host,
                env: &mut self.env,
            };
            self.set.apply(fragments, &self.policy, &mut ctx)
        }

        fn teardown(&mut self) -> Vec<GatewayError> {
            let mut ctx = GatewayContext {
                backend: &self.backend,
                id: ContainerId(3),
                name: &self.name,
                host: &self.host,
                env: &mut self.env,
            };
            self.set.teardown_all(&mut ctx)
        }
    }

    #[test]
    fn cgroup_whitelisting_reaches_the_backend() {
        let mut fx = Fixture::new();
        fx.apply(&[
            (
                GatewayId::Cgroups,
                json!([{"setting": "memory.limit_in_bytes", "value": "1M"}]),
            ),
            (
                GatewayId::Cgroups,
                json!([{"setting": "memory.limit_in_bytes", "value": "10M"}]),
            ),
        ])
        .unwrap();
        let container = fx.backend.container("SC-3").unwrap();
        assert_eq!(container.cgroups["memory.limit_in_bytes"], "10M");
        assert!(fx.set.get(GatewayId::Cgroups).unwrap().is_activated());
    }

    #[test]
    fn rejected_cgroup_value_does_not_block_later_settings() {
        let mut fx = Fixture::new();
        let memory = |v: &str| json!([{"setting": "memory.limit_in_bytes", "value": v}]);
        fx.backend.set_memory_usage(2 * 1024 * 1024);
        assert!(matches!(
            fx.apply(&[(GatewayId::Cgroups, memory("1M"))]),
            Err(GatewayError::Runtime { gateway: GatewayId::Cgroups, .. })
        ));

        fx.apply(&[(
            GatewayId::Cgroups,
            json!([{"setting": "cpu.shares", "value": 512}]),
        )])
        .unwrap();
        fx.apply(&[(GatewayId::Cgroups, memory("4M"))]).unwrap();
        let container = fx.backend.container("SC-3").unwrap();
        assert_eq!(container.cgroups["cpu.shares"], "512");
        assert_eq!(container.cgroups["memory.limit_in_bytes"], "4M");
    }

    #[test]
    fn rejected_cgroup_value_restores_last_accepted() {
        let mut fx = Fixture::new();
        let memory = |v: &str| json!([{"setting": "memory.limit_in_bytes", "value": v}]);
        fx.apply(&[(GatewayId::Cgroups, memory("10M"))]).unwrap();
        fx.backend.set_memory_usage(20 * 1024 * 1024);
        assert!(fx.apply(&[(GatewayId::Cgroups, memory("12M"))]).is_err());

        let GatewayKind::Cgroups(cgroups) = fx.set.get(GatewayId::Cgroups).unwrap().kind() else {
            panic!("not a cgroups gateway");
        };
        assert_eq!(cgroups.value("memory.limit_in_bytes"), Some("10M"));
        fx.apply(&[(GatewayId::Cgroups, memory("1M"))]).unwrap();
        assert_eq!(
            fx.backend.container("SC-3").unwrap().cgroups["memory.limit_in_bytes"],
            "10M"
        );
    }

    #[test]
    fn env_and_dbus_populate_the_environment() {
        let mut fx = Fixture::new();
        fx.apply(&[
            (GatewayId::Env, json!([{"name": "X", "value": "1234"}])),
            (
                GatewayId::Dbus,
                json!([{"dbus-gateway-config-session": [
                    {"direction": "outgoing", "interface": "*", "object-path": "/", "method": "*"}
                ]}]),
            ),
        ])
        .unwrap();
        assert_eq!(fx.env["X"], "1234");
        assert_eq!(
            fx.env["DBUS_SESSION_BUS_ADDRESS"],
            "unix:path=/gateways/sess_SC-3.sock"
        );
        let proxies = fx.backend.proxies();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].spec.bus, BusKind::Session);
        assert_eq!(proxies[0].spec.upstream, "unix:path=/run/user/1000/bus");
    }

    #[test]
    fn dbus_reconfiguration_updates_running_proxy() {
        let mut fx = Fixture::new();
        let rule = |m: &str| {
            json!([{"dbus-gateway-config-system": [
                {"direction": "incoming", "interface": "org.x", "object-path": "/", "method": m}
            ]}])
        };
        fx.apply(&[(GatewayId::Dbus, rule("A"))]).unwrap();
        fx.apply(&[(GatewayId::Dbus, rule("B"))]).unwrap();
        let proxies = fx.backend.proxies();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].configs.len(), 2);
        assert!(proxies[0].configs[1].contains("\"A\""));
        assert!(proxies[0].configs[1].contains("\"B\""));

        assert!(fx.teardown().is_empty());
        assert!(fx.backend.proxies().is_empty());
        assert!(!fx.env.contains_key("DBUS_SYSTEM_BUS_ADDRESS"));
        assert_eq!(
            fx.set.get(GatewayId::Dbus).unwrap().state(),
            GatewayState::Created
        );
    }

    #[test]
    fn malformed_fragment_changes_nothing() {
        let mut fx = Fixture::new();
        let err = fx
            .apply(&[
                (GatewayId::Env, json!([{"name": "A", "value": "1"}])),
                (GatewayId::Cgroups, json!([{"setting": "cpu.shares"}])),
            ])
            .unwrap_err();
        assert_eq!(err.gateway(), GatewayId::Cgroups);
        assert!(fx.set.is_empty());
        assert!(fx.env.is_empty());
    }

    #[test]
    fn failed_activation_keeps_earlier_gateways() {
        let mut fx = Fixture::new();
        fx.backend.set_memory_usage(1024 * 1024);
        let err = fx
            .apply(&[
                (GatewayId::Env, json!([{"name": "A", "value": "1"}])),
                (
                    GatewayId::Cgroups,
                    json!([{"setting": "memory.limit_in_bytes", "value": "1K"}]),
                ),
            ])
            .unwrap_err();
        assert!(matches!(err, GatewayError::Runtime { gateway: GatewayId::Cgroups, .. }));
        // Env activates after cgroups and was never reached.
        assert!(!fx.env.contains_key("A"));
        assert_eq!(
            fx.set.get(GatewayId::Cgroups).unwrap().state(),
            GatewayState::Configured
        );

        fx.apply(&[(GatewayId::Env, json!([{"name": "B", "value": "2"}]))])
            .unwrap();
        assert_eq!(fx.env["B"], "2");
    }

    #[test]
    fn network_activation_brings_interface_up_once() {
        let mut fx = Fixture::new();
        let allow = |host: &str| json!([{"direction": "OUTGOING", "allow": [{"host": host}]}]);
        fx.apply(&[(GatewayId::Network, allow("a.example"))]).unwrap();
        fx.apply(&[(GatewayId::Network, allow("b.example"))]).unwrap();

        let container = fx.backend.container("SC-3").unwrap();
        let iface = container.interface.unwrap();
        assert_eq!(iface.address.to_string(), "10.0.3.5");
        let GatewayKind::Network(network) = fx.set.get(GatewayId::Network).unwrap().kind() else {
            panic!("not a network gateway");
        };
        assert_eq!(network.commands().len(), 6);
        // Two activations, each a full rewrite.
        assert_eq!(container.netfilter.len(), 5 + 6);
    }

    #[test]
    fn rejected_network_reactivation() {
        let mut fx = Fixture::new();
        fx.policy.network_reactivation = crate::NetworkReactivation::Reject;
        let allow = json!([{"direction": "INCOMING", "allow": [{"host": "*"}]}]);
        fx.apply(&[(GatewayId::Network, allow.clone())]).unwrap();
        assert!(matches!(
            fx.apply(&[(GatewayId::Network, allow)]),
            Err(GatewayError::NotReconfigurable(GatewayId::Network))
        ));
    }

    #[test]
    fn pulseaudio_without_host_server_fails() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.apply(&[(GatewayId::PulseAudio, json!([{"audio": true}]))]),
            Err(GatewayError::Activation { gateway: GatewayId::PulseAudio, .. })
        ));
        fx.host.pulse_server = Some("unix:/run/user/1000/pulse/native".to_owned());
        fx.apply(&[(GatewayId::PulseAudio, json!([{"audio": true}]))])
            .unwrap();
        assert_eq!(fx.env["PULSE_SERVER"], "unix:/gateways/pulse-SC-3.sock");
        let container = fx.backend.container("SC-3").unwrap();
        assert!(container
            .mounts
            .contains_key(std::path::Path::new("/gateways/pulse-SC-3.sock")));
    }
}
