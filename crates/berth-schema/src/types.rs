//! Identifier types shared by every berth crate.
//!
//! String newtypes serialize as plain strings; [`ContainerId`] is numeric and
//! renders as its decimal value on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a capability as declared in a service manifest.
    CapabilityName
);

string_newtype!(
    /// OS-level resource name of a container: the configured prefix followed
    /// by the numeric id, e.g. `SC-7`.
    ContainerName
);

impl ContainerName {
    pub fn for_id(prefix: &str, id: ContainerId) -> Self {
        Self(format!("{prefix}{id}"))
    }

    /// Parse the numeric id back out of a name, if it follows `prefix`.
    pub fn id_with_prefix(&self, prefix: &str) -> Option<ContainerId> {
        let rest = self.0.strip_prefix(prefix)?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok().map(ContainerId)
    }
}

/// External handle of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub u32);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(ContainerId)
            .map_err(|_| IdParseError::Container(s.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid container id: '{0}'")]
    Container(String),
    #[error("unknown gateway id: '{0}'")]
    Gateway(String),
}

/// The closed set of gateway kinds.
///
/// Declaration order is activation order; teardown runs in reverse so that
/// mediating state (proxies, sockets) is released before resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayId {
    Cgroups,
    DeviceNode,
    File,
    Network,
    Dbus,
    PulseAudio,
    Env,
}

impl GatewayId {
    pub const ALL: [GatewayId; 7] = [
        GatewayId::Cgroups,
        GatewayId::DeviceNode,
        GatewayId::File,
        GatewayId::Network,
        GatewayId::Dbus,
        GatewayId::PulseAudio,
        GatewayId::Env,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GatewayId::Cgroups => "cgroups",
            GatewayId::DeviceNode => "devicenode",
            GatewayId::File => "file",
            GatewayId::Network => "network",
            GatewayId::Dbus => "dbus",
            GatewayId::PulseAudio => "pulseaudio",
            GatewayId::Env => "env",
        }
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GatewayId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| IdParseError::Gateway(s.to_owned()))
    }
}
