//! Network access control.
//!
//! The container's interface sits behind a bridge on the host. Both netfilter
//! chains default to `DROP`; each configured rule appends an `ACCEPT` entry.
//! Every activation rewrites the chains from the full merged rule set, so the
//! result does not depend on how rules were split across fragments.

use crate::context::GatewayContext;
use crate::{malformed, parse_element, GatewayError, RuntimeResultExt};
use berth_runtime::{InterfaceConfig, NetfilterCommand};
use berth_schema::{ContainerId, GatewayId};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, info};

const ID: GatewayId = GatewayId::Network;

/// What happens when the gateway is configured again after activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkReactivation {
    /// New rules join the existing set and the chains are rewritten.
    #[default]
    Merge,
    /// Further configuration fails.
    Reject,
}

/// The host bridge the container's interface is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSettings {
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            gateway: Ipv4Addr::new(10, 0, 3, 1),
            prefix_len: 16,
        }
    }
}

impl NetworkSettings {
    /// Address of a container: gateway + 1 + id, which must stay inside the
    /// bridge network. Every container address lies above the gateway's.
    pub fn address_for(&self, id: ContainerId) -> Result<Ipv4Addr, GatewayError> {
        if !(1..=32).contains(&self.prefix_len) {
            return Err(GatewayError::Activation {
                gateway: ID,
                reason: format!("unusable prefix length /{}", self.prefix_len),
            });
        }
        let host_bits = 32 - u32::from(self.prefix_len);
        let size = 1u64 << host_bits;
        let gateway = u32::from(self.gateway);
        let base = gateway & (u32::MAX << host_bits);
        let offset = u64::from(gateway - base) + 1 + u64::from(id.0);
        if offset >= size {
            return Err(GatewayError::Activation {
                gateway: ID,
                reason: format!(
                    "no address left for container id {id} behind {}/{}",
                    self.gateway, self.prefix_len
                ),
            });
        }
        Ok(Ipv4Addr::from(base + offset as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Chain {
    Input,
    Output,
}

impl Chain {
    fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
        }
    }

    fn host_flag(self) -> &'static str {
        match self {
            Chain::Input => "-s",
            Chain::Output => "-d",
        }
    }

    fn port_flag(self, multiport: bool) -> &'static str {
        match (self, multiport) {
            (Chain::Input, false) => "--sport",
            (Chain::Input, true) => "--sports",
            (Chain::Output, false) => "--dport",
            (Chain::Output, true) => "--dports",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// Specific hosts order before the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Host {
    Specific(String),
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Ports {
    Single(u16),
    Range(u16, u16),
    List(Vec<u16>),
}

impl Ports {
    fn multiport(&self) -> bool {
        !matches!(self, Ports::Single(_))
    }

    fn render(&self) -> String {
        match self {
            Ports::Single(p) => p.to_string(),
            Ports::Range(a, b) => format!("{a}:{b}"),
            Ports::List(list) => list
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawProtocols {
    One(Protocol),
    Many(Vec<Protocol>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPorts {
    Single(u16),
    Range(String),
    List(Vec<u16>),
}

#[derive(Debug, Deserialize)]
struct RawRule {
    host: String,
    #[serde(default)]
    protocols: Option<RawProtocols>,
    #[serde(default)]
    ports: Option<RawPorts>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    direction: String,
    allow: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Rule {
    chain: Chain,
    host: Host,
    protocols: Vec<Protocol>,
    ports: Option<Ports>,
}

fn parse_range(text: &str) -> Result<Ports, GatewayError> {
    let (a, b) = text
        .split_once(':')
        .or_else(|| text.split_once('-'))
        .ok_or_else(|| malformed(ID, format!("port range '{text}' must look like 'from:to'")))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .map_err(|_| malformed(ID, format!("invalid port in range '{text}'")))
    };
    let (from, to) = (parse(a)?, parse(b)?);
    if from == 0 || from > to {
        return Err(malformed(ID, format!("invalid port range '{text}'")));
    }
    Ok(Ports::Range(from, to))
}

fn parse_ports(raw: RawPorts) -> Result<Ports, GatewayError> {
    let ports = match raw {
        RawPorts::Single(p) => Ports::Single(p),
        RawPorts::Range(text) => return parse_range(&text),
        RawPorts::List(list) if list.is_empty() => {
            return Err(malformed(ID, "port list must not be empty"))
        }
        RawPorts::List(mut list) => {
            list.sort_unstable();
            list.dedup();
            match list.as_slice() {
                [single] => Ports::Single(*single),
                _ => Ports::List(list),
            }
        }
    };
    let has_zero = match &ports {
        Ports::Single(p) => *p == 0,
        Ports::List(list) => list.contains(&0),
        Ports::Range(..) => false,
    };
    if has_zero {
        return Err(malformed(ID, "port 0 is not allowed"));
    }
    Ok(ports)
}

fn parse_entry(element: &serde_json::Value) -> Result<Vec<Rule>, GatewayError> {
    let raw: RawEntry = parse_element(ID, element)?;
    let chain = match raw.direction.as_str() {
        "INCOMING" => Chain::Input,
        "OUTGOING" => Chain::Output,
        other => {
            return Err(malformed(
                ID,
                format!("direction must be INCOMING or OUTGOING, got '{other}'"),
            ))
        }
    };

    raw.allow
        .iter()
        .map(|rule| {
            let rule: RawRule = parse_element(ID, rule)?;
            let host = match rule.host.trim() {
                "" => return Err(malformed(ID, "host must not be empty")),
                "*" => Host::Any,
                h => Host::Specific(h.to_owned()),
            };
            let mut protocols = match rule.protocols {
                None => Vec::new(),
                Some(RawProtocols::One(p)) => vec![p],
                Some(RawProtocols::Many(list)) if list.is_empty() => {
                    return Err(malformed(ID, "protocol list must not be empty"))
                }
                Some(RawProtocols::Many(list)) => list,
            };
            protocols.sort_unstable();
            protocols.dedup();
            Ok(Rule {
                chain,
                host,
                protocols,
                ports: rule.ports.map(parse_ports).transpose()?,
            })
        })
        .collect()
}

fn command(rule: &Rule, protocol: Option<Protocol>) -> NetfilterCommand {
    let mut argv = vec!["-A".to_owned(), rule.chain.as_str().to_owned()];
    if let Host::Specific(host) = &rule.host {
        argv.push(rule.chain.host_flag().to_owned());
        argv.push(host.clone());
    }
    if let Some(protocol) = protocol {
        argv.push("-p".to_owned());
        argv.push(protocol.as_str().to_owned());
        match &rule.ports {
            Some(ports) if protocol != Protocol::Icmp => {
                if ports.multiport() {
                    argv.push("--match".to_owned());
                    argv.push("multiport".to_owned());
                }
                argv.push(rule.chain.port_flag(ports.multiport()).to_owned());
                argv.push(ports.render());
            }
            _ => {}
        }
    }
    argv.push("-j".to_owned());
    argv.push("ACCEPT".to_owned());
    argv
}

fn rule_commands(rule: &Rule) -> Vec<NetfilterCommand> {
    match (rule.protocols.as_slice(), &rule.ports) {
        ([], None) => vec![command(rule, None)],
        // Ports need a protocol for netfilter to match on.
        ([], Some(_)) => [Protocol::Tcp, Protocol::Udp]
            .into_iter()
            .map(|p| command(rule, Some(p)))
            .collect(),
        (protocols, _) => protocols.iter().map(|p| command(rule, Some(*p))).collect(),
    }
}

#[derive(Debug, Clone)]
pub struct NetworkGateway {
    settings: NetworkSettings,
    reactivation: NetworkReactivation,
    rules: BTreeSet<Rule>,
    interface: Option<InterfaceConfig>,
}

impl NetworkGateway {
    pub fn new(settings: NetworkSettings, reactivation: NetworkReactivation) -> Self {
        Self {
            settings,
            reactivation,
            rules: BTreeSet::new(),
            interface: None,
        }
    }

    pub fn accepts_reconfiguration(&self) -> bool {
        self.reactivation == NetworkReactivation::Merge
    }

    pub fn interface(&self) -> Option<&InterfaceConfig> {
        self.interface.as_ref()
    }

    /// The full netfilter program for the merged rule set.
    pub fn commands(&self) -> Vec<NetfilterCommand> {
        let fixed: [&[&str]; 4] = [
            &["-F", "INPUT"],
            &["-F", "OUTPUT"],
            &["-P", "INPUT", "DROP"],
            &["-P", "OUTPUT", "DROP"],
        ];
        let mut commands: Vec<NetfilterCommand> = fixed
            .iter()
            .map(|argv| argv.iter().map(|s| (*s).to_owned()).collect())
            .collect();
        commands.extend(self.rules.iter().flat_map(rule_commands));
        commands
    }

    pub(crate) fn configure(&mut self, elements: &[serde_json::Value]) -> Result<(), GatewayError> {
        let mut parsed = Vec::new();
        for element in elements {
            parsed.extend(parse_entry(element)?);
        }
        self.rules.extend(parsed);
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &mut GatewayContext<'_>) -> Result<(), GatewayError> {
        if self.interface.is_none() {
            let iface = InterfaceConfig {
                address: self.settings.address_for(ctx.id)?,
                prefix_len: self.settings.prefix_len,
                gateway: self.settings.gateway,
            };
            ctx.backend.network_up(ctx.name, &iface).for_gateway(ID)?;
            info!(
                "network: {} up at {}/{} via {}",
                ctx.name, iface.address, iface.prefix_len, iface.gateway
            );
            self.interface = Some(iface);
        }

        let commands = self.commands();
        debug!("network: {} netfilter commands for {}", commands.len(), ctx.name);
        ctx.backend.apply_netfilter(ctx.name, &commands).for_gateway(ID)
    }
}
