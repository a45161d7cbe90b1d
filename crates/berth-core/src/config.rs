use crate::CoreError;
use berth_gateway::{EnvResetPolicy, GatewayPolicy, NetworkReactivation, NetworkSettings};
use berth_runtime::{ContainerLayout, LxcSettings};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent settings, read from an optional TOML file.
///
/// Every key has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub container_root: PathBuf,
    pub lxc_path: PathBuf,
    pub lxc_template: String,
    pub container_prefix: String,
    pub service_manifest_dir: PathBuf,
    pub default_service_manifest_dir: PathBuf,
    pub backend: String,
    pub dbus_proxy: String,
    pub shutdown_timeout_secs: u64,
    pub keep_containers_alive: bool,
    pub use_session_bus: bool,
    pub env_reset_policy: EnvResetPolicy,
    pub network_reactivation: NetworkReactivation,
    pub bridge_gateway: Ipv4Addr,
    pub bridge_netmask_bits: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let network = NetworkSettings::default();
        Self {
            container_root: PathBuf::from("/tmp/container"),
            lxc_path: PathBuf::from("/var/lib/lxc"),
            lxc_template: "none".to_owned(),
            container_prefix: "SC-".to_owned(),
            service_manifest_dir: PathBuf::from("/usr/local/etc/berth/service-manifest.d"),
            default_service_manifest_dir: PathBuf::from(
                "/usr/local/etc/berth/service-manifest.default.d",
            ),
            backend: "lxc".to_owned(),
            dbus_proxy: "dbus-proxy".to_owned(),
            shutdown_timeout_secs: 2,
            keep_containers_alive: false,
            use_session_bus: false,
            env_reset_policy: EnvResetPolicy::default(),
            network_reactivation: NetworkReactivation::default(),
            bridge_gateway: network.gateway,
            bridge_netmask_bits: network.prefix_len,
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.container_prefix.is_empty() {
            return Err(CoreError::Config("container_prefix must not be empty".to_owned()));
        }
        if self.container_prefix.contains('/') {
            return Err(CoreError::Config(format!(
                "container_prefix must not contain '/': {}",
                self.container_prefix
            )));
        }
        if !(1..=30).contains(&self.bridge_netmask_bits) {
            return Err(CoreError::Config(format!(
                "bridge_netmask_bits must be between 1 and 30, got {}",
                self.bridge_netmask_bits
            )));
        }
        if self.service_manifest_dir == Path::new("/")
            || self.default_service_manifest_dir == Path::new("/")
        {
            return Err(CoreError::Config(
                "service manifest directories must not be '/'".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> ContainerLayout {
        ContainerLayout::new(&self.container_root)
    }

    pub fn lxc_settings(&self) -> LxcSettings {
        LxcSettings {
            lxc_path: self.lxc_path.clone(),
            template: self.lxc_template.clone(),
            proxy_program: self.dbus_proxy.clone(),
        }
    }

    pub fn gateway_policy(&self) -> GatewayPolicy {
        GatewayPolicy {
            env_reset: self.env_reset_policy,
            network_reactivation: self.network_reactivation,
            network: NetworkSettings {
                gateway: self.bridge_gateway,
                prefix_len: self.bridge_netmask_bits,
            },
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.container_root, PathBuf::from("/tmp/container"));
        assert_eq!(config.container_prefix, "SC-");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(config.gateway_policy(), GatewayPolicy::default());
    }

    #[test]
    fn parses_overrides() {
        let config = AgentConfig::from_toml_str(
            r#"
container_root = "/run/berth"
backend = "mock"
keep_containers_alive = true
env_reset_policy = "reject"
network_reactivation = "reject"
bridge_gateway = "192.168.50.1"
bridge_netmask_bits = 24
"#,
        )
        .unwrap();
        assert_eq!(config.layout().root(), Path::new("/run/berth"));
        assert_eq!(config.backend, "mock");
        assert!(config.keep_containers_alive);
        let policy = config.gateway_policy();
        assert_eq!(policy.env_reset, EnvResetPolicy::Reject);
        assert_eq!(policy.network_reactivation, NetworkReactivation::Reject);
        assert_eq!(policy.network.gateway, Ipv4Addr::new(192, 168, 50, 1));
        assert_eq!(policy.network.prefix_len, 24);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            AgentConfig::from_toml_str("container_rot = \"/x\""),
            Err(CoreError::ConfigParse(_))
        ));
        assert!(matches!(
            AgentConfig::from_toml_str("env_reset_policy = \"sometimes\""),
            Err(CoreError::ConfigParse(_))
        ));
        assert!(matches!(
            AgentConfig::from_toml_str("container_prefix = \"\""),
            Err(CoreError::Config(_))
        ));
        assert!(matches!(
            AgentConfig::from_toml_str("bridge_netmask_bits = 31"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.toml");
        std::fs::write(&path, "use_session_bus = true\n").unwrap();
        assert!(AgentConfig::load(&path).unwrap().use_session_bus);
        assert!(matches!(
            AgentConfig::load(&dir.path().join("missing.toml")),
            Err(CoreError::Io(_))
        ));
    }
}
