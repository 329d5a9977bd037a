//! Identity registry
//!
//! Every object fwctl installs in the filtering engine is keyed by a semantic
//! role. Each role maps to a fixed identifier from the literal table below, so
//! re-applying a role always addresses the same engine object, across process
//! restarts and upgrades alike.
//!
//! The table is versioned. Identifiers must never be regenerated between
//! releases; a changed identifier orphans the objects installed by the
//! previous version.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{FirewallError, FirewallResult};

/// Version of the role table below. Bump only together with a migration.
pub const REGISTRY_VERSION: u32 = 1;

/// Semantic role of a provider, sublayer or filter.
///
/// Discriminants index [`ROLE_TABLE`] and must stay in sync with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Role {
    Provider = 0,
    SublayerDeny,
    SublayerException,

    BlockAllOutboundIpv4,
    BlockAllOutboundIpv6,
    BlockAllInboundIpv4,
    BlockAllInboundIpv6,

    PermitLoopbackOutboundIpv4,
    PermitLoopbackOutboundIpv6,
    PermitLoopbackInboundIpv4,
    PermitLoopbackInboundIpv6,

    PermitLan10_8,
    PermitLan172_16_12,
    PermitLan192_168_16,
    PermitLan169_254_16,
    PermitLanMulticast,
    PermitLanIpv6Fe80_10,
    PermitLanIpv6Multicast,

    PermitLanService10_8,
    PermitLanService172_16_12,
    PermitLanService192_168_16,
    PermitLanService169_254_16,
    PermitLanServiceIpv6Fe80_10,

    PermitDhcpV4OutboundRequest,
    PermitDhcpV6OutboundRequest,
    PermitDhcpV4InboundResponse,
    PermitDhcpV6InboundResponse,

    PermitVpnRelay,

    PermitVpnTunnelOutboundIpv4,
    PermitVpnTunnelOutboundIpv6,
    PermitVpnTunnelInboundIpv4,
    PermitVpnTunnelInboundIpv6,

    RestrictDnsOutboundIpv4,
    RestrictDnsOutboundIpv6,
    RestrictDnsOutboundTunnelIpv4,
    RestrictDnsOutboundTunnelIpv6,

    PermitDnsOutboundIpv4,
    PermitDnsOutboundIpv6,
}

/// The two mutually exclusive ways DNS is restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnsVariant {
    /// Port 53 only to the configured resolvers, outside the tunnel
    PreTunnel,
    /// Port 53 only through the tunnel interface
    TunnelScoped,
}

/// One row of the identity registry
#[derive(Debug)]
pub struct RoleEntry {
    pub role: Role,
    pub name: &'static str,
    pub id: Uuid,
    pub description: &'static str,
}

const fn entry(role: Role, name: &'static str, id: u128, description: &'static str) -> RoleEntry {
    RoleEntry {
        role,
        name,
        id: Uuid::from_u128(id),
        description,
    }
}

/// Role table, version [`REGISTRY_VERSION`].
pub static ROLE_TABLE: [RoleEntry; 38] = [
    entry(
        Role::Provider,
        "provider",
        0x131bad83d3b3401381486490491fadcf,
        "fwctl filtering provider",
    ),
    entry(
        Role::SublayerDeny,
        "sublayer-deny",
        0xf00fea556613402798db3b9418142890,
        "Unconditional block rules",
    ),
    entry(
        Role::SublayerException,
        "sublayer-exception",
        0xc29b29cd90804eafa4b3aeac7316a6e3,
        "Permits and DNS restrictions overriding the deny tier",
    ),
    // Deny tier
    entry(
        Role::BlockAllOutboundIpv4,
        "block-all-outbound-ipv4",
        0x473a2342c1a74d30b7cb06ca4693c566,
        "Block all outbound IPv4 traffic",
    ),
    entry(
        Role::BlockAllOutboundIpv6,
        "block-all-outbound-ipv6",
        0x98669e00a3874affb860f7030adaf942,
        "Block all outbound IPv6 traffic",
    ),
    entry(
        Role::BlockAllInboundIpv4,
        "block-all-inbound-ipv4",
        0x7a37f6f1ba894235a39d74a47564e7f6,
        "Block all inbound IPv4 traffic",
    ),
    entry(
        Role::BlockAllInboundIpv6,
        "block-all-inbound-ipv6",
        0x0102e2b3a5e243a1af903a5db356f974,
        "Block all inbound IPv6 traffic",
    ),
    // Loopback
    entry(
        Role::PermitLoopbackOutboundIpv4,
        "permit-loopback-outbound-ipv4",
        0x008bc4ce34be42a7a0b16fee7413e98f,
        "Permit outbound IPv4 loopback traffic",
    ),
    entry(
        Role::PermitLoopbackOutboundIpv6,
        "permit-loopback-outbound-ipv6",
        0x9eacddfa4e504a42be2bd0171b4bf36e,
        "Permit outbound IPv6 loopback traffic",
    ),
    entry(
        Role::PermitLoopbackInboundIpv4,
        "permit-loopback-inbound-ipv4",
        0xaa9b37036ddb4df6aa6e38951c85fb7d,
        "Permit inbound IPv4 loopback traffic",
    ),
    entry(
        Role::PermitLoopbackInboundIpv6,
        "permit-loopback-inbound-ipv6",
        0x13ded330866443b0b19b78a73cd1ba88,
        "Permit inbound IPv6 loopback traffic",
    ),
    // LAN, locally initiated
    entry(
        Role::PermitLan10_8,
        "permit-lan-10-8",
        0x8bc06caf6cc14e77a7d5b1e8c3964a92,
        "Permit locally-initiated traffic on 10/8",
    ),
    entry(
        Role::PermitLan172_16_12,
        "permit-lan-172-16-12",
        0x34a35be925ed4470b66ec1a9ef1cf6f1,
        "Permit locally-initiated traffic on 172.16/12",
    ),
    entry(
        Role::PermitLan192_168_16,
        "permit-lan-192-168-16",
        0xd8deb53d528c4212956cac67df5f6f95,
        "Permit locally-initiated traffic on 192.168/16",
    ),
    entry(
        Role::PermitLan169_254_16,
        "permit-lan-169-254-16",
        0x718f64a11b274222b30378d6bad21c90,
        "Permit locally-initiated traffic on 169.254/16",
    ),
    entry(
        Role::PermitLanMulticast,
        "permit-lan-multicast",
        0x1f7123ba121045289fe6877ff3127f22,
        "Permit locally-initiated multicast traffic",
    ),
    entry(
        Role::PermitLanIpv6Fe80_10,
        "permit-lan-ipv6-fe80-10",
        0xc7c5968912c2452eb979c4065ddb8247,
        "Permit locally-initiated traffic on fe80::/10",
    ),
    entry(
        Role::PermitLanIpv6Multicast,
        "permit-lan-ipv6-multicast",
        0x1419574293984f3ea257cbcc6779d545,
        "Permit locally-initiated IPv6 multicast traffic",
    ),
    // LAN services
    entry(
        Role::PermitLanService10_8,
        "permit-lan-service-10-8",
        0xeddc0eae198947068324dd566faaaa87,
        "Permit incoming requests on 10/8",
    ),
    entry(
        Role::PermitLanService172_16_12,
        "permit-lan-service-172-16-12",
        0x0ccc41ce4a2c4647a701975348c1fb6d,
        "Permit incoming requests on 172.16/12",
    ),
    entry(
        Role::PermitLanService192_168_16,
        "permit-lan-service-192-168-16",
        0xf317b5cc8c3149c9a6fec163b1d170e6,
        "Permit incoming requests on 192.168/16",
    ),
    entry(
        Role::PermitLanService169_254_16,
        "permit-lan-service-169-254-16",
        0xbf77d11fc9214a32b9cee70bcda3d8a5,
        "Permit incoming requests on 169.254/16",
    ),
    entry(
        Role::PermitLanServiceIpv6Fe80_10,
        "permit-lan-service-ipv6-fe80-10",
        0x11f872bbb3e24f6f8d54194640beac50,
        "Permit incoming requests on fe80::/10",
    ),
    // DHCP
    entry(
        Role::PermitDhcpV4OutboundRequest,
        "permit-dhcpv4-outbound-request",
        0x3418a14dd5264586915556e2de43ac20,
        "Permit outbound DHCPv4 requests",
    ),
    entry(
        Role::PermitDhcpV6OutboundRequest,
        "permit-dhcpv6-outbound-request",
        0xfb8e715facf8444fb427ccf355229c7e,
        "Permit outbound DHCPv6 requests",
    ),
    entry(
        Role::PermitDhcpV4InboundResponse,
        "permit-dhcpv4-inbound-response",
        0x7d342ff05696423db380052103ec84be,
        "Permit inbound DHCPv4 responses",
    ),
    entry(
        Role::PermitDhcpV6InboundResponse,
        "permit-dhcpv6-inbound-response",
        0x08524fffd65e4f8c9d30583dc5bee446,
        "Permit inbound DHCPv6 responses",
    ),
    // Relay and tunnel
    entry(
        Role::PermitVpnRelay,
        "permit-vpn-relay",
        0x6f6501d801f3428eb4c9310a8d0d61e0,
        "Permit outbound connections to the VPN relay",
    ),
    entry(
        Role::PermitVpnTunnelOutboundIpv4,
        "permit-vpn-tunnel-outbound-ipv4",
        0x9023ee88c9a94ce69a569be57e8a67d4,
        "Permit outbound IPv4 traffic on the tunnel interface",
    ),
    entry(
        Role::PermitVpnTunnelOutboundIpv6,
        "permit-vpn-tunnel-outbound-ipv6",
        0xbda3d888259b4115a795f93be0a25e08,
        "Permit outbound IPv6 traffic on the tunnel interface",
    ),
    entry(
        Role::PermitVpnTunnelInboundIpv4,
        "permit-vpn-tunnel-inbound-ipv4",
        0xb3d92f3599014c0b87398b5307227835,
        "Permit inbound IPv4 traffic on the tunnel interface",
    ),
    entry(
        Role::PermitVpnTunnelInboundIpv6,
        "permit-vpn-tunnel-inbound-ipv6",
        0x2095a6becd7f4c839e915f546303ed83,
        "Permit inbound IPv6 traffic on the tunnel interface",
    ),
    // DNS
    entry(
        Role::RestrictDnsOutboundIpv4,
        "restrict-dns-outbound-ipv4",
        0x9c378cb39a8e43c892180d453bdfe6f3,
        "Block IPv4 DNS to anything but the configured resolvers",
    ),
    entry(
        Role::RestrictDnsOutboundIpv6,
        "restrict-dns-outbound-ipv6",
        0x182bba35a5b4447cb8cc3afddd5d7203,
        "Block IPv6 DNS to anything but the configured resolvers",
    ),
    entry(
        Role::RestrictDnsOutboundTunnelIpv4,
        "restrict-dns-outbound-tunnel-ipv4",
        0x4faa5fa1833a47db88a5fb16c4fd8afa,
        "Block IPv4 DNS outside the tunnel interface",
    ),
    entry(
        Role::RestrictDnsOutboundTunnelIpv6,
        "restrict-dns-outbound-tunnel-ipv6",
        0xc1af432f1755475b9678007a555e52fa,
        "Block IPv6 DNS outside the tunnel interface",
    ),
    entry(
        Role::PermitDnsOutboundIpv4,
        "permit-dns-outbound-ipv4",
        0x58e31aace1b849eeb46d477f9f573372,
        "Permit IPv4 DNS to the configured resolvers",
    ),
    entry(
        Role::PermitDnsOutboundIpv6,
        "permit-dns-outbound-ipv6",
        0xe34ed7c4c0c54049a67500729702a1b8,
        "Permit IPv6 DNS to the configured resolvers",
    ),
];

impl Role {
    /// All roles, in table order
    pub fn all() -> impl Iterator<Item = Role> {
        ROLE_TABLE.iter().map(|entry| entry.role)
    }

    fn entry(self) -> &'static RoleEntry {
        &ROLE_TABLE[self as usize]
    }

    /// Stable identifier of this role
    pub fn id(self) -> Uuid {
        self.entry().id
    }

    /// Kebab-case role name
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    /// Human-readable display name attached to the engine object
    pub fn description(self) -> &'static str {
        self.entry().description
    }

    /// Look a role up by its name
    pub fn from_name(name: &str) -> FirewallResult<Role> {
        ROLE_TABLE
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.role)
            .ok_or_else(|| FirewallError::UnknownRole(name.to_string()))
    }

    /// Look a role up by its identifier
    pub fn from_id(id: Uuid) -> Option<Role> {
        ROLE_TABLE.iter().find(|entry| entry.id == id).map(|entry| entry.role)
    }

    /// Roles installed once into the deny sublayer
    pub fn deny_roles() -> [Role; 4] {
        [
            Role::BlockAllOutboundIpv4,
            Role::BlockAllOutboundIpv6,
            Role::BlockAllInboundIpv4,
            Role::BlockAllInboundIpv6,
        ]
    }

    /// Which DNS restriction this role belongs to, if any
    pub fn dns_variant(self) -> Option<DnsVariant> {
        match self {
            Role::RestrictDnsOutboundIpv4 | Role::RestrictDnsOutboundIpv6 => {
                Some(DnsVariant::PreTunnel)
            }
            Role::RestrictDnsOutboundTunnelIpv4 | Role::RestrictDnsOutboundTunnelIpv6 => {
                Some(DnsVariant::TunnelScoped)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Role> for &'static str {
    fn from(role: Role) -> Self {
        role.name()
    }
}

impl TryFrom<String> for Role {
    type Error = FirewallError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Role::from_name(&name)
    }
}

/// Check the table for duplicate identifiers or names and for rows out of
/// step with the enum.
pub fn check_registry() -> FirewallResult<()> {
    for (index, entry) in ROLE_TABLE.iter().enumerate() {
        let problem = if entry.role as usize != index || entry.id.is_nil() {
            "invalid"
        } else if ROLE_TABLE[..index].iter().any(|e| e.id == entry.id || e.name == entry.name) {
            "a duplicate"
        } else {
            continue;
        };
        return Err(FirewallError::Config(format!(
            "identity registry row {} is {}",
            entry.name, problem
        )));
    }
    Ok(())
}

/// Identifier for a role name; fails with `UnknownRole` outside the table.
pub fn identifier_for(name: &str) -> FirewallResult<Uuid> {
    Role::from_name(name).map(Role::id)
}
