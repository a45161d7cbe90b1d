use crate::context::GatewayContext;
use crate::{malformed, parse_element, GatewayError, RuntimeResultExt};
use berth_runtime::DeviceNode;
use berth_schema::GatewayId;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

const ID: GatewayId = GatewayId::DeviceNode;

#[derive(Debug, Deserialize)]
struct RawDevice {
    name: String,
    #[serde(default)]
    major: Option<u32>,
    #[serde(default)]
    minor: Option<u32>,
    #[serde(default)]
    mode: Option<u32>,
}

/// Interpret a mode written with octal digits, e.g. `644`, as permission bits.
fn octal_mode(written: u32) -> Result<u32, GatewayError> {
    let digits = written.to_string();
    if digits.len() > 4 {
        return Err(malformed(ID, format!("mode {written} has too many digits")));
    }
    u32::from_str_radix(&digits, 8)
        .map_err(|_| malformed(ID, format!("mode {written} is not octal")))
}

fn parse(element: &serde_json::Value) -> Result<DeviceNode, GatewayError> {
    let raw: RawDevice = parse_element(ID, element)?;
    if raw.name.is_empty() {
        return Err(malformed(ID, "device name must not be empty"));
    }
    if !raw.name.starts_with('/') {
        return Err(malformed(ID, format!("device name must be an absolute path: {}", raw.name)));
    }

    let numbers = match (raw.major, raw.minor) {
        (Some(major), Some(minor)) => Some((major, minor)),
        (None, None) => None,
        _ => {
            return Err(malformed(
                ID,
                format!("{}: major and minor must be given together", raw.name),
            ))
        }
    };
    if numbers.is_some() && raw.mode.is_none() {
        return Err(malformed(
            ID,
            format!("{}: a mode is required when creating a node", raw.name),
        ));
    }

    Ok(DeviceNode {
        path: PathBuf::from(raw.name),
        numbers,
        mode: raw.mode.map(octal_mode).transpose()?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Device {
    node: DeviceNode,
    applied: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceNodeGateway {
    devices: BTreeMap<PathBuf, Device>,
}

impl DeviceNodeGateway {
    pub fn device(&self, path: &str) -> Option<&DeviceNode> {
        self.devices.get(&PathBuf::from(path)).map(|d| &d.node)
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let parsed = elements.iter().map(parse).collect::<Result<Vec<_>, _>>()?;
        for node in parsed {
            match self.devices.get_mut(&node.path) {
                Some(existing) => {
                    if node.numbers.is_some() && node.numbers != existing.node.numbers {
                        return Err(GatewayError::Conflict {
                            gateway: ID,
                            reason: format!(
                                "{} already configured with other device numbers",
                                node.path.display()
                            ),
                        });
                    }
                    if node.mode.is_some() && node.mode != existing.node.mode {
                        existing.node.mode = node.mode;
                        existing.applied = false;
                    }
                }
                None => {
                    self.devices.insert(
                        node.path.clone(),
                        Device {
                            node,
                            applied: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        for device in self.devices.values_mut().filter(|d| !d.applied) {
            ctx.backend.add_device(ctx.name, &device.node).for_gateway(ID)?;
            device.applied = true;
            debug!("devicenode: {} exposed to {}", device.node.path.display(), ctx.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configure(gw: &mut DeviceNodeGateway, config: serde_json::Value) -> Result<(), GatewayError> {
        gw.configure(config.as_array().unwrap())
    }

    #[test]
    fn parses_created_and_exposed_devices() {
        let mut gw = DeviceNodeGateway::default();
        configure(
            &mut gw,
            json!([
                {"name": "/dev/tty0", "major": 4, "minor": 0, "mode": 644},
                {"name": "/dev/dri/card0"}
            ]),
        )
        .unwrap();
        let tty = gw.device("/dev/tty0").unwrap();
        assert_eq!(tty.numbers, Some((4, 0)));
        assert_eq!(tty.mode, Some(0o644));
        let card = gw.device("/dev/dri/card0").unwrap();
        assert_eq!(card.numbers, None);
        assert_eq!(card.mode, None);
    }

    #[test]
    fn last_mode_wins() {
        let mut gw = DeviceNodeGateway::default();
        configure(&mut gw, json!([{"name": "/dev/input", "mode": 644}])).unwrap();
        configure(&mut gw, json!([{"name": "/dev/input", "mode": 600}])).unwrap();
        assert_eq!(gw.device("/dev/input").unwrap().mode, Some(0o600));
        configure(&mut gw, json!([{"name": "/dev/input"}])).unwrap();
        assert_eq!(gw.device("/dev/input").unwrap().mode, Some(0o600));
    }

    #[test]
    fn changing_device_numbers_conflicts() {
        let mut gw = DeviceNodeGateway::default();
        configure(&mut gw, json!([{"name": "/dev/x", "major": 1, "minor": 3, "mode": 666}])).unwrap();
        assert!(matches!(
            configure(&mut gw, json!([{"name": "/dev/x", "major": 1, "minor": 5, "mode": 666}])),
            Err(GatewayError::Conflict { .. })
        ));
    }

    #[test]
    fn rejects_malformed_devices() {
        for bad in [
            json!([{"name": "/dev/x", "major": 1}]),
            json!([{"name": "/dev/x", "minor": 1, "mode": 644}]),
            json!([{"name": "/dev/x", "major": 1, "minor": 1}]),
            json!([{"name": "/dev/x", "mode": 648}]),
            json!([{"name": "/dev/x", "mode": 77777}]),
            json!([{"name": "dev/x"}]),
            json!([{"name": ""}]),
            json!([{"major": 1, "minor": 1, "mode": 644}]),
        ] {
            let mut gw = DeviceNodeGateway::default();
            assert!(configure(&mut gw, bad.clone()).is_err(), "accepted {bad}");
        }
    }
}
