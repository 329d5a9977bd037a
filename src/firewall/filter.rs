//! Filter, sublayer and provider descriptions handed to the engine

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::conditions::{AddressFamily, Condition, Direction, PacketMeta};
use super::guids::{DnsVariant, Role};

/// Weight of the deny sublayer
pub const DENY_SUBLAYER_WEIGHT: u16 = 0x0100;
/// Weight of the exception sublayer; always above the deny sublayer
pub const EXCEPTION_SUBLAYER_WEIGHT: u16 = 0x0200;

/// Filter weights inside a sublayer. Higher wins.
pub const WEIGHT_BLOCK_ALL: u8 = 0;
pub const WEIGHT_PERMIT: u8 = 10;
pub const WEIGHT_RESTRICT_DNS: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Permit,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SublayerKind {
    Deny,
    Exception,
}

impl SublayerKind {
    pub fn role(self) -> Role {
        match self {
            SublayerKind::Deny => Role::SublayerDeny,
            SublayerKind::Exception => Role::SublayerException,
        }
    }

    pub fn weight(self) -> u16 {
        match self {
            SublayerKind::Deny => DENY_SUBLAYER_WEIGHT,
            SublayerKind::Exception => EXCEPTION_SUBLAYER_WEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: Uuid,
    pub name: String,
}

impl ProviderSpec {
    pub fn fwctl() -> Self {
        Self {
            id: Role::Provider.id(),
            name: Role::Provider.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SublayerSpec {
    pub id: Uuid,
    pub name: String,
    pub weight: u16,
    pub provider: Uuid,
}

impl SublayerSpec {
    pub fn for_kind(kind: SublayerKind) -> Self {
        Self {
            id: kind.role().id(),
            name: kind.role().description().to_string(),
            weight: kind.weight(),
            provider: Role::Provider.id(),
        }
    }
}

/// One filter as installed in the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSpec {
    pub id: Uuid,
    pub role: Role,
    pub name: String,
    pub sublayer: Uuid,
    pub direction: Direction,
    pub family: AddressFamily,
    pub conditions: Vec<Condition>,
    pub action: Action,
    pub weight: u8,
    pub provider: Uuid,
}

impl FilterSpec {
    /// Start a filter for `role`; identifier and display name come from the registry.
    pub fn new(
        role: Role,
        sublayer: SublayerKind,
        direction: Direction,
        family: AddressFamily,
    ) -> Self {
        Self {
            id: role.id(),
            role,
            name: role.description().to_string(),
            sublayer: sublayer.role().id(),
            direction,
            family,
            conditions: Vec::new(),
            action: Action::Block,
            weight: WEIGHT_BLOCK_ALL,
            provider: Role::Provider.id(),
        }
    }

    pub fn permit(mut self) -> Self {
        self.action = Action::Permit;
        self.weight = WEIGHT_PERMIT;
        self
    }

    pub fn block(mut self, weight: u8) -> Self {
        self.action = Action::Block;
        self.weight = weight;
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Whether every condition holds for the packet
    pub fn matches(&self, packet: &PacketMeta) -> bool {
        self.direction == packet.direction
            && self.family == packet.family()
            && self.conditions.iter().all(|c| c.matches(packet))
    }
}

/// The complete set of exception-tier filters for one state, in build order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSetSpec {
    pub filters: Vec<FilterSpec>,
}

impl FilterSetSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: FilterSpec) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn roles(&self) -> BTreeSet<Role> {
        self.filters.iter().map(|f| f.role).collect()
    }

    pub fn contains(&self, role: Role) -> bool {
        self.filters.iter().any(|f| f.role == role)
    }

    /// Filters keyed by identifier
    pub fn by_id(&self) -> BTreeMap<Uuid, &FilterSpec> {
        self.filters.iter().map(|f| (f.id, f)).collect()
    }

    /// DNS restriction variants present in this set
    pub fn dns_variants(&self) -> BTreeSet<DnsVariant> {
        self.filters.iter().filter_map(|f| f.role.dns_variant()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_sublayer_weight_ordering() {
        assert!(SublayerKind::Exception.weight() > SublayerKind::Deny.weight());
        let spec = SublayerSpec::for_kind(SublayerKind::Exception);
        assert_eq!(spec.id, Role::SublayerException.id());
        assert_eq!(spec.provider, Role::Provider.id());
    }

    #[test]
    fn test_filter_builder() {
        let filter = FilterSpec::new(
            Role::PermitVpnRelay,
            SublayerKind::Exception,
            Direction::Outbound,
            AddressFamily::Ipv4,
        )
        .permit()
        .condition(Condition::remote_host(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));

        assert_eq!(filter.id, Role::PermitVpnRelay.id());
        assert_eq!(filter.action, Action::Permit);
        assert_eq!(filter.weight, WEIGHT_PERMIT);
        assert_eq!(filter.conditions.len(), 1);
        assert_eq!(filter.name, "Permit outbound connections to the VPN relay");
    }

    #[test]
    fn test_filter_matches_family_and_direction() {
        let filter = FilterSpec::new(
            Role::BlockAllInboundIpv4,
            SublayerKind::Deny,
            Direction::Inbound,
            AddressFamily::Ipv4,
        );
        let mut packet = PacketMeta {
            direction: Direction::Inbound,
            local: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            remote: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            local_port: 443,
            remote_port: 40000,
            protocol: super::super::conditions::TransportProtocol::Tcp,
            interface: "eth0".to_string(),
        };
        assert!(filter.matches(&packet));
        packet.direction = Direction::Outbound;
        assert!(!filter.matches(&packet));
    }
}
