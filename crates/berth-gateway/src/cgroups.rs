//! Cgroup resource limits.
//!
//! Fragments are whitelisted per setting: when several fragments name the
//! same setting, the most permissive value is kept. For memory limits and
//! cpu shares larger is more permissive; other settings keep the last value.

use crate::context::GatewayContext;
use crate::{malformed, parse_element, GatewayError, RuntimeResultExt};
use berth_schema::{parse_byte_size, GatewayId};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

const ID: GatewayId = GatewayId::Cgroups;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawSetting {
    setting: String,
    value: RawValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ordering {
    Bytes,
    Count,
    LastWins,
}

fn ordering_for(setting: &str) -> Ordering {
    match setting {
        "memory.limit_in_bytes"
        | "memory.memsw.limit_in_bytes"
        | "memory.soft_limit_in_bytes"
        | "memory.max"
        | "memory.high" => Ordering::Bytes,
        "cpu.shares" | "cpu.weight" | "pids.max" => Ordering::Count,
        _ => Ordering::LastWins,
    }
}

/// Numeric rank of a value, or `None` for settings without an ordering.
fn rank(setting: &str, value: &str) -> Result<Option<u64>, GatewayError> {
    match ordering_for(setting) {
        Ordering::LastWins => Ok(None),
        _ if value == "max" => Ok(Some(u64::MAX)),
        Ordering::Bytes => parse_byte_size(value)
            .map(Some)
            .map_err(|e| malformed(ID, format!("{setting}: {e}"))),
        Ordering::Count => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| malformed(ID, format!("{setting}: '{value}' is not a number"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Setting {
    value: String,
    rank: Option<u64>,
    written: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CgroupsGateway {
    settings: BTreeMap<String, Setting>,
    /// Last value the backend accepted for each setting.
    applied: BTreeMap<String, Setting>,
}

impl CgroupsGateway {
    /// Effective value of a setting after whitelisting.
    pub fn value(&self, setting: &str) -> Option<&str> {
        self.settings.get(setting).map(|s| s.value.as_str())
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let mut parsed = Vec::with_capacity(elements.len());
        for element in elements {
            let raw: RawSetting = parse_element(ID, element)?;
            let setting = raw.setting.trim().to_owned();
            if setting.is_empty() {
                return Err(malformed(ID, "setting name must not be empty"));
            }
            let value = match raw.value {
                RawValue::Number(n) => n.to_string(),
                RawValue::Text(s) => s.trim().to_owned(),
            };
            if value.is_empty() {
                return Err(malformed(ID, format!("{setting}: value must not be empty")));
            }
            let rank = rank(&setting, &value)?;
            parsed.push((setting, Setting { value, rank, written: false }));
        }

        for (name, new) in parsed {
            match self.settings.get(&name) {
                Some(current) if more_permissive(current, &new) => {
                    debug!("cgroups: {name} keeps more permissive '{}'", current.value);
                }
                Some(current) if current.value == new.value => {}
                _ => {
                    self.settings.insert(name, new);
                }
            }
        }
        Ok(())
    }

    /// Write every pending setting. A value the backend rejects is rolled
    /// back to the last accepted one so later activations do not retry it.
    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        let pending: Vec<String> = self
            .settings
            .iter()
            .filter(|(_, s)| !s.written)
            .map(|(name, _)| name.clone())
            .collect();
        for name in pending {
            let Some(value) = self.settings.get(&name).map(|s| s.value.clone()) else {
                continue;
            };
            if let Err(e) = ctx
                .backend
                .set_cgroup_item(ctx.name, &name, &value)
                .for_gateway(ID)
            {
                self.roll_back(&name);
                return Err(e);
            }
            if let Some(setting) = self.settings.get_mut(&name) {
                setting.written = true;
                self.applied.insert(name.clone(), setting.clone());
            }
            debug!("cgroups: {} {name}={value}", ctx.name);
        }
        Ok(())
    }

    fn roll_back(&mut self, name: &str) {
        match self.applied.get(name) {
            Some(last) => {
                debug!("cgroups: {name} restored to '{}'", last.value);
                self.settings.insert(name.to_owned(), last.clone());
            }
            None => {
                self.settings.remove(name);
            }
        }
    }
}

/// Whether `current` should survive a merge with `new`.
fn more_permissive(current: &Setting, new: &Setting) -> bool {
    match (current.rank, new.rank) {
        (Some(a), Some(b)) => a >= b,
        _ => false,
    }
}
