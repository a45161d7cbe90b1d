use crate::context::GatewayContext;
use crate::{malformed, parse_element, GatewayError, RuntimeResultExt};
use berth_runtime::{canonicalize_logical, MountPolicy};
use berth_schema::GatewayId;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const ID: GatewayId = GatewayId::File;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawFile {
    path_host: String,
    path_container: String,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    env_var_name: Option<String>,
    #[serde(default)]
    env_var_prefix: Option<String>,
    #[serde(default)]
    env_var_suffix: Option<String>,
}

/// Environment variable announcing where a file was mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EnvBinding {
    name: String,
    prefix: String,
    suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSetting {
    host: PathBuf,
    container: PathBuf,
    read_only: bool,
    env: Option<EnvBinding>,
    /// Read-only flag the current mount was made with.
    mounted: Option<bool>,
}

fn parse(element: &serde_json::Value) -> Result<FileSetting, GatewayError> {
    let raw: RawFile = parse_element(ID, element)?;
    if raw.path_host.is_empty() {
        return Err(malformed(ID, "path-host must not be empty"));
    }
    if raw.path_container.is_empty() {
        return Err(malformed(ID, "path-container must not be empty"));
    }
    if !raw.path_host.starts_with('/') || !raw.path_container.starts_with('/') {
        return Err(malformed(ID, "paths must be absolute"));
    }

    let env = match raw.env_var_name.filter(|n| !n.is_empty()) {
        Some(name) => Some(EnvBinding {
            name,
            prefix: raw.env_var_prefix.unwrap_or_default(),
            suffix: raw.env_var_suffix.unwrap_or_default(),
        }),
        None if raw.env_var_prefix.is_some() || raw.env_var_suffix.is_some() => {
            return Err(malformed(
                ID,
                "env-var-prefix and env-var-suffix require env-var-name",
            ));
        }
        None => None,
    };

    Ok(FileSetting {
        host: PathBuf::from(raw.path_host),
        container: PathBuf::from(canonicalize_logical(&raw.path_container)),
        read_only: raw.read_only,
        env,
        mounted: None,
    })
}

/// Bind mounts of individual host files or directories, keyed by container path.
#[derive(Debug, Clone, Default)]
pub struct FileGateway {
    files: BTreeMap<PathBuf, FileSetting>,
}

impl FileGateway {
    pub fn is_read_only(&self, container_path: &str) -> Option<bool> {
        self.files.get(Path::new(container_path)).map(|f| f.read_only)
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let parsed = elements.iter().map(parse).collect::<Result<Vec<_>, _>>()?;
        for file in parsed {
            match self.files.get_mut(&file.container) {
                Some(existing) => {
                    if existing.host != file.host {
                        return Err(GatewayError::Conflict {
                            gateway: ID,
                            reason: format!(
                                "{} is already mapped to {}",
                                file.container.display(),
                                existing.host.display()
                            ),
                        });
                    }
                    // Writable wins.
                    existing.read_only &= file.read_only;
                    if file.env.is_some() {
                        existing.env = file.env;
                    }
                }
                None => {
                    self.files.insert(file.container.clone(), file);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        let policy = MountPolicy::default();
        for file in self.files.values_mut() {
            if file.mounted != Some(file.read_only) {
                let mount = policy
                    .validate(
                        &file.host.to_string_lossy(),
                        &file.container.to_string_lossy(),
                        file.read_only,
                    )
                    .for_gateway(ID)?;
                if file.mounted.is_some() {
                    ctx.backend.unmount(ctx.name, &file.container).for_gateway(ID)?;
                }
                ctx.backend.bind_mount(ctx.name, &mount).for_gateway(ID)?;
                file.mounted = Some(file.read_only);
                debug!(
                    "file: {} -> {} in {} (read-only: {})",
                    file.host.display(),
                    file.container.display(),
                    ctx.name,
                    file.read_only
                );
            }
            if let Some(binding) = &file.env {
                ctx.env.insert(
                    binding.name.clone(),
                    format!(
                        "{}{}{}",
                        binding.prefix,
                        file.container.display(),
                        binding.suffix
                    ),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configure(gw: &mut FileGateway, config: serde_json::Value) -> Result<(), GatewayError> {
        gw.configure(config.as_array().unwrap())
    }

    #[test]
    fn same_pair_merges_read_only_towards_writable() {
        let mut gw = FileGateway::default();
        configure(
            &mut gw,
            json!([{"path-host": "/etc/app.conf", "path-container": "/app/app.conf", "read-only": true}]),
        )
        .unwrap();
        assert_eq!(gw.is_read_only("/app/app.conf"), Some(true));
        configure(
            &mut gw,
            json!([{"path-host": "/etc/app.conf", "path-container": "/app/./app.conf", "read-only": false}]),
        )
        .unwrap();
        assert_eq!(gw.is_read_only("/app/app.conf"), Some(false));
    }

    #[test]
    fn different_host_for_same_target_conflicts() {
        let mut gw = FileGateway::default();
        configure(&mut gw, json!([{"path-host": "/a", "path-container": "/x"}])).unwrap();
        assert!(matches!(
            configure(&mut gw, json!([{"path-host": "/b", "path-container": "/x"}])),
            Err(GatewayError::Conflict { .. })
        ));
    }

    #[test]
    fn rejects_malformed_settings() {
        for bad in [
            json!([{"path-host": "", "path-container": "/x"}]),
            json!([{"path-host": "/a", "path-container": ""}]),
            json!([{"path-host": "a", "path-container": "/x"}]),
            json!([{"path-host": "/a"}]),
            json!([{"path-host": "/a", "path-container": "/x", "env-var-prefix": "p"}]),
            json!([{"path-host": "/a", "path-container": "/x", "env-var-suffix": "s"}]),
        ] {
            let mut gw = FileGateway::default();
            assert!(configure(&mut gw, bad.clone()).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn env_binding_requires_name() {
        let file = parse(&json!({
            "path-host": "/a",
            "path-container": "/x",
            "env-var-name": "X_PATH",
            "env-var-prefix": "file://",
            "env-var-suffix": "/"
        }))
        .unwrap();
        let binding = file.env.unwrap();
        assert_eq!(binding.name, "X_PATH");
        assert_eq!(binding.prefix, "file://");
        assert_eq!(binding.suffix, "/");
    }
}
