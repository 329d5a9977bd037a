//! Condition catalog
//!
//! Match predicates used to build filter specifications. All conditions of a
//! filter must match for the filter to apply. "One of several ranges" is a
//! single set-valued condition (`InAny`), never two conditions on one field.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => f.write_str("tcp"),
            TransportProtocol::Udp => f.write_str("udp"),
        }
    }
}

impl std::str::FromStr for TransportProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportProtocol::Tcp),
            "udp" => Ok(TransportProtocol::Udp),
            other => Err(format!("unknown transport protocol '{}'", other)),
        }
    }
}

/// Packet attribute a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionField {
    LocalAddress,
    RemoteAddress,
    LocalPort,
    RemotePort,
    Protocol,
    Interface,
    Loopback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    Equal,
    NotEqual,
    /// Address inside a single network
    InRange,
    /// Address inside any of several networks
    InAny,
    /// Address outside every listed network
    NotInAny,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionValue {
    Network(IpNetwork),
    Networks(Vec<IpNetwork>),
    Port(u16),
    Protocol(TransportProtocol),
    Interface(String),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub match_type: MatchType,
    pub value: ConditionValue,
}

/// Attributes of a packet, as seen by [`Condition::matches`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub direction: Direction,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: TransportProtocol,
    pub interface: String,
}

impl PacketMeta {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.remote)
    }
}

impl Condition {
    fn new(field: ConditionField, match_type: MatchType, value: ConditionValue) -> Self {
        Self { field, match_type, value }
    }

    pub fn local_network(network: IpNetwork) -> Self {
        let value = ConditionValue::Network(network);
        Self::new(ConditionField::LocalAddress, MatchType::InRange, value)
    }

    pub fn remote_network(network: IpNetwork) -> Self {
        let value = ConditionValue::Network(network);
        Self::new(ConditionField::RemoteAddress, MatchType::InRange, value)
    }

    /// Remote address equal to a single host
    pub fn remote_host(addr: IpAddr) -> Self {
        let network = IpNetwork::from(addr);
        Self::new(ConditionField::RemoteAddress, MatchType::Equal, ConditionValue::Network(network))
    }

    pub fn local_in_any(networks: Vec<IpNetwork>) -> Self {
        let value = ConditionValue::Networks(networks);
        Self::new(ConditionField::LocalAddress, MatchType::InAny, value)
    }

    pub fn remote_in_any(networks: Vec<IpNetwork>) -> Self {
        let value = ConditionValue::Networks(networks);
        Self::new(ConditionField::RemoteAddress, MatchType::InAny, value)
    }

    pub fn remote_not_in_any(networks: Vec<IpNetwork>) -> Self {
        let value = ConditionValue::Networks(networks);
        Self::new(ConditionField::RemoteAddress, MatchType::NotInAny, value)
    }

    pub fn local_port(port: u16) -> Self {
        Self::new(ConditionField::LocalPort, MatchType::Equal, ConditionValue::Port(port))
    }

    pub fn remote_port(port: u16) -> Self {
        Self::new(ConditionField::RemotePort, MatchType::Equal, ConditionValue::Port(port))
    }

    pub fn protocol(protocol: TransportProtocol) -> Self {
        Self::new(ConditionField::Protocol, MatchType::Equal, ConditionValue::Protocol(protocol))
    }

    pub fn interface(alias: &str) -> Self {
        let value = ConditionValue::Interface(alias.to_string());
        Self::new(ConditionField::Interface, MatchType::Equal, value)
    }

    pub fn not_interface(alias: &str) -> Self {
        let value = ConditionValue::Interface(alias.to_string());
        Self::new(ConditionField::Interface, MatchType::NotEqual, value)
    }

    pub fn loopback() -> Self {
        Self::new(ConditionField::Loopback, MatchType::Equal, ConditionValue::Flag(true))
    }

    /// Evaluate against a packet. A value that does not fit the field never matches.
    pub fn matches(&self, packet: &PacketMeta) -> bool {
        match (self.field, &self.value) {
            (ConditionField::LocalAddress, value) => {
                match_address(self.match_type, value, packet.local)
            }
            (ConditionField::RemoteAddress, value) => {
                match_address(self.match_type, value, packet.remote)
            }
            (ConditionField::LocalPort, ConditionValue::Port(port)) => {
                match_eq(self.match_type, packet.local_port == *port)
            }
            (ConditionField::RemotePort, ConditionValue::Port(port)) => {
                match_eq(self.match_type, packet.remote_port == *port)
            }
            (ConditionField::Protocol, ConditionValue::Protocol(protocol)) => {
                match_eq(self.match_type, packet.protocol == *protocol)
            }
            (ConditionField::Interface, ConditionValue::Interface(alias)) => {
                match_eq(self.match_type, packet.interface == *alias)
            }
            (ConditionField::Loopback, ConditionValue::Flag(flag)) => {
                let is_loopback = packet.local.is_loopback() || packet.remote.is_loopback();
                match_eq(self.match_type, is_loopback == *flag)
            }
            _ => false,
        }
    }
}

fn match_eq(match_type: MatchType, equal: bool) -> bool {
    match match_type {
        MatchType::Equal => equal,
        MatchType::NotEqual => !equal,
        _ => false,
    }
}

fn match_address(match_type: MatchType, value: &ConditionValue, addr: IpAddr) -> bool {
    match (match_type, value) {
        (MatchType::Equal | MatchType::InRange, ConditionValue::Network(net)) => net.contains(addr),
        (MatchType::NotEqual, ConditionValue::Network(net)) => !net.contains(addr),
        (MatchType::InAny, ConditionValue::Networks(nets)) => {
            nets.iter().any(|net| net.contains(addr))
        }
        (MatchType::NotInAny, ConditionValue::Networks(nets)) => {
            !nets.iter().any(|net| net.contains(addr))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn packet(remote: IpAddr, remote_port: u16) -> PacketMeta {
        PacketMeta {
            direction: Direction::Outbound,
            local: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            remote,
            local_port: 50000,
            remote_port,
            protocol: TransportProtocol::Udp,
            interface: "eth0".to_string(),
        }
    }

    #[test]
    fn test_network_conditions() {
        let lan: IpNetwork = "192.168.0.0/16".parse().unwrap();
        let pkt = packet(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 1)), 80);

        assert!(Condition::local_network(lan).matches(&pkt));
        assert!(Condition::remote_network(lan).matches(&pkt));
        assert!(!Condition::remote_network("10.0.0.0/8".parse().unwrap()).matches(&pkt));
    }

    #[test]
    fn test_set_conditions() {
        let resolvers = vec!["9.9.9.9/32".parse().unwrap(), "1.1.1.1/32".parse().unwrap()];
        let allowed = packet(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
        let other = packet(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

        assert!(Condition::remote_in_any(resolvers.clone()).matches(&allowed));
        assert!(!Condition::remote_not_in_any(resolvers.clone()).matches(&allowed));
        assert!(Condition::remote_not_in_any(resolvers).matches(&other));
    }

    #[test]
    fn test_host_condition() {
        let host = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert!(Condition::remote_host(host).matches(&packet(host, 1194)));
        let other = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5));
        assert!(!Condition::remote_host(host).matches(&packet(other, 1194)));
    }

    #[test]
    fn test_port_protocol_interface() {
        let pkt = packet(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
        assert!(Condition::remote_port(53).matches(&pkt));
        assert!(!Condition::local_port(53).matches(&pkt));
        assert!(Condition::protocol(TransportProtocol::Udp).matches(&pkt));
        assert!(!Condition::protocol(TransportProtocol::Tcp).matches(&pkt));
        assert!(Condition::interface("eth0").matches(&pkt));
        assert!(Condition::not_interface("wg0").matches(&pkt));
    }

    #[test]
    fn test_loopback_condition() {
        let mut pkt = packet(IpAddr::V6(Ipv6Addr::LOCALHOST), 8080);
        assert!(Condition::loopback().matches(&pkt));
        pkt.remote = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert!(!Condition::loopback().matches(&pkt));
    }

    #[test]
    fn test_mismatched_value_never_matches() {
        let bogus = Condition {
            field: ConditionField::RemotePort,
            match_type: MatchType::Equal,
            value: ConditionValue::Interface("eth0".to_string()),
        };
        assert!(!bogus.matches(&packet(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)));
    }
}
