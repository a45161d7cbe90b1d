//! Environment variables for processes launched in the container.

use crate::context::GatewayContext;
use crate::{malformed, parse_element, GatewayError};
use berth_schema::GatewayId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const ID: GatewayId = GatewayId::Env;

/// What a second plain `set` of an already defined variable does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvResetPolicy {
    /// The first value stays; the new one is ignored.
    #[default]
    KeepFirst,
    /// The configuration is rejected.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EnvMode {
    Set,
    Append,
    Prepend,
}

#[derive(Debug, Deserialize)]
struct RawVariable {
    name: String,
    value: String,
    #[serde(default)]
    mode: Option<EnvMode>,
    #[serde(default)]
    separator: Option<String>,
    /// Older spelling of `"mode": "append"`.
    #[serde(default)]
    append: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Variable {
    name: String,
    value: String,
    mode: EnvMode,
    separator: String,
}

fn parse(element: &serde_json::Value) -> Result<Variable, GatewayError> {
    let raw: RawVariable = parse_element(ID, element)?;
    if raw.name.is_empty() {
        return Err(malformed(ID, "variable name must not be empty"));
    }
    if raw.name.contains('=') || raw.name.contains('\0') {
        return Err(malformed(ID, format!("invalid variable name '{}'", raw.name)));
    }
    if raw.value.is_empty() {
        return Err(malformed(ID, format!("value of '{}' must not be empty", raw.name)));
    }

    let mode = match (raw.mode, raw.append) {
        (Some(mode), None | Some(false)) => mode,
        (Some(EnvMode::Append) | None, Some(true)) => EnvMode::Append,
        (None, None | Some(false)) => EnvMode::Set,
        (Some(mode), Some(true)) => {
            return Err(malformed(
                ID,
                format!("'{}': append flag contradicts mode {mode:?}", raw.name),
            ))
        }
    };

    Ok(Variable {
        name: raw.name,
        value: raw.value,
        mode,
        separator: raw.separator.unwrap_or_default(),
    })
}

#[derive(Debug, Clone)]
pub struct EnvGateway {
    policy: EnvResetPolicy,
    vars: BTreeMap<String, String>,
}

impl EnvGateway {
    pub fn new(policy: EnvResetPolicy) -> Self {
        Self {
            policy,
            vars: BTreeMap::new(),
        }
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let parsed = elements.iter().map(parse).collect::<Result<Vec<_>, _>>()?;
        for var in parsed {
            self.merge(var)?;
        }
        Ok(())
    }

    fn merge(&mut self, var: Variable) -> Result<(), GatewayError> {
        let Variable {
            name,
            value,
            mode,
            separator,
        } = var;

        match (mode, self.vars.get_mut(&name)) {
            (EnvMode::Set, None) => {
                self.vars.insert(name, value);
            }
            (EnvMode::Set, Some(existing)) => match self.policy {
                EnvResetPolicy::KeepFirst => {
                    if *existing != value {
                        warn!("env: {name} already set, keeping '{existing}' over '{value}'");
                    }
                }
                EnvResetPolicy::Reject => {
                    return Err(GatewayError::Conflict {
                        gateway: ID,
                        reason: format!("variable {name} is already set"),
                    });
                }
            },
            (EnvMode::Append, Some(existing)) => {
                existing.push_str(&separator);
                existing.push_str(&value);
            }
            (EnvMode::Prepend, Some(existing)) => {
                *existing = format!("{value}{separator}{existing}");
            }
            (EnvMode::Append | EnvMode::Prepend, None) => {
                debug!("env: {name} not set yet, defining it");
                self.vars.insert(name, value);
            }
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        for (name, value) in &self.vars {
            ctx.env.insert(name.clone(), value.clone());
        }
        debug!("env: {} variables exported to {}", self.vars.len(), ctx.name);
        Ok(())
    }
}
