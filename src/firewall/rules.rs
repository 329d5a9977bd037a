//! Filter set builder
//!
//! Pure mapping from a requested [`VpnState`] and its [`PolicyParams`] to the
//! complete list of exception-tier filters for that state:
//!
//! | State | Exception filters |
//! |---|---|
//! | blocked, disconnected | none |
//! | connecting | loopback, LAN, DHCP, relay, pre-tunnel DNS |
//! | connected | loopback, LAN, DHCP, tunnel, tunnel-scoped DNS |
//!
//! Exactly one DNS restriction variant is present whenever any permit is.
//! A state missing a parameter it needs is rejected; it never degrades to a
//! wider filter set.

use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

use super::conditions::{AddressFamily, Condition, Direction, TransportProtocol};
use super::filter::{FilterSetSpec, FilterSpec, SublayerKind, WEIGHT_RESTRICT_DNS};
use super::guids::Role;
use super::state::{PolicyParams, RelayEndpoint, VpnState};
use crate::error::{FirewallError, FirewallResult};
use crate::validation::{
    validate_dns_servers, validate_endpoint_address, validate_interface_name, validate_port,
    validate_prefix_len,
};

const DNS_PORT: u16 = 53;
const DHCPV4_CLIENT_PORT: u16 = 68;
const DHCPV4_SERVER_PORT: u16 = 67;
const DHCPV6_CLIENT_PORT: u16 = 546;
const DHCPV6_SERVER_PORT: u16 = 547;

/// Build the exception-tier filter set for `state`.
pub fn build_filter_set(state: VpnState, params: &PolicyParams) -> FirewallResult<FilterSetSpec> {
    let mut set = FilterSetSpec::new();

    match state {
        VpnState::Uninitialized | VpnState::Blocked | VpnState::Disconnected => {}
        VpnState::Connecting => {
            let relay = params.relay.as_ref().ok_or_else(|| {
                FirewallError::InvalidParams("connecting requires a relay endpoint".to_string())
            })?;
            validate_relay(relay)?;
            validate_dns_servers(&params.dns_servers)?;

            permit_base(&mut set, params)?;
            permit_relay(&mut set, relay);
            restrict_dns_pre_tunnel(&mut set, &params.dns_servers)?;
        }
        VpnState::Connected => {
            let alias = params.tunnel_interface.as_deref().ok_or_else(|| {
                FirewallError::InvalidParams("connected requires a tunnel interface".to_string())
            })?;
            validate_interface_name(alias)?;

            permit_base(&mut set, params)?;
            permit_tunnel(&mut set, alias);
            restrict_dns_tunnel(&mut set, alias)?;
        }
    }

    debug!("Built {} exception filters for state {}", set.len(), state);
    Ok(set)
}

fn validate_relay(relay: &RelayEndpoint) -> FirewallResult<()> {
    validate_endpoint_address(&relay.address)?;
    if let Some(port) = relay.port {
        validate_port(port)?;
    }
    Ok(())
}

fn network(addr: impl Into<IpAddr>, prefix: u8) -> FirewallResult<IpNetwork> {
    let addr = addr.into();
    validate_prefix_len(prefix, addr.is_ipv6())?;
    Ok(IpNetwork::new(addr, prefix)?)
}

fn host_networks(servers: &[IpAddr], family: AddressFamily) -> Vec<IpNetwork> {
    servers
        .iter()
        .filter(|addr| AddressFamily::of(addr) == family)
        .map(|addr| IpNetwork::from(*addr))
        .collect()
}

fn loopback_network(family: AddressFamily) -> FirewallResult<IpNetwork> {
    match family {
        AddressFamily::Ipv4 => network(Ipv4Addr::new(127, 0, 0, 0), 8),
        AddressFamily::Ipv6 => network(Ipv6Addr::LOCALHOST, 128),
    }
}

/// Permits shared by `Connecting` and `Connected`
fn permit_base(set: &mut FilterSetSpec, params: &PolicyParams) -> FirewallResult<()> {
    permit_loopback(set);
    if params.allow_lan {
        permit_lan(set)?;
        permit_lan_service(set)?;
    }
    permit_dhcp(set)?;
    Ok(())
}

fn permit(role: Role, direction: Direction, family: AddressFamily) -> FilterSpec {
    FilterSpec::new(role, SublayerKind::Exception, direction, family).permit()
}

fn permit_loopback(set: &mut FilterSetSpec) {
    for (role, direction, family) in [
        (Role::PermitLoopbackOutboundIpv4, Direction::Outbound, AddressFamily::Ipv4),
        (Role::PermitLoopbackOutboundIpv6, Direction::Outbound, AddressFamily::Ipv6),
        (Role::PermitLoopbackInboundIpv4, Direction::Inbound, AddressFamily::Ipv4),
        (Role::PermitLoopbackInboundIpv6, Direction::Inbound, AddressFamily::Ipv6),
    ] {
        set.push(permit(role, direction, family).condition(Condition::loopback()));
    }
}

fn lan_ranges_v4() -> FirewallResult<[(IpNetwork, Role, Role); 4]> {
    Ok([
        (network(Ipv4Addr::new(10, 0, 0, 0), 8)?, Role::PermitLan10_8, Role::PermitLanService10_8),
        (
            network(Ipv4Addr::new(172, 16, 0, 0), 12)?,
            Role::PermitLan172_16_12,
            Role::PermitLanService172_16_12,
        ),
        (
            network(Ipv4Addr::new(192, 168, 0, 0), 16)?,
            Role::PermitLan192_168_16,
            Role::PermitLanService192_168_16,
        ),
        (
            network(Ipv4Addr::new(169, 254, 0, 0), 16)?,
            Role::PermitLan169_254_16,
            Role::PermitLanService169_254_16,
        ),
    ])
}

fn link_local_v6() -> FirewallResult<IpNetwork> {
    network(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10)
}

/// Locally-initiated traffic within the private ranges, plus LAN multicast
fn permit_lan(set: &mut FilterSetSpec) -> FirewallResult<()> {
    let ranges = lan_ranges_v4()?;
    for (net, role, _) in &ranges {
        set.push(
            permit(*role, Direction::Outbound, AddressFamily::Ipv4)
                .condition(Condition::local_network(*net))
                .condition(Condition::remote_network(*net)),
        );
    }

    let multicast = vec![
        network(Ipv4Addr::new(224, 0, 0, 0), 24)?,
        // SSDP
        network(Ipv4Addr::new(239, 255, 255, 250), 32)?,
    ];
    set.push(
        permit(Role::PermitLanMulticast, Direction::Outbound, AddressFamily::Ipv4)
            .condition(Condition::local_in_any(ranges.iter().map(|(net, _, _)| *net).collect()))
            .condition(Condition::remote_in_any(multicast)),
    );

    let fe80 = link_local_v6()?;
    set.push(
        permit(Role::PermitLanIpv6Fe80_10, Direction::Outbound, AddressFamily::Ipv6)
            .condition(Condition::local_network(fe80))
            .condition(Condition::remote_network(fe80)),
    );
    set.push(
        permit(Role::PermitLanIpv6Multicast, Direction::Outbound, AddressFamily::Ipv6)
            .condition(Condition::local_network(fe80))
            .condition(Condition::remote_network(network(
                Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0),
                16,
            )?)),
    );
    Ok(())
}

/// Incoming requests from the private ranges, for services hosted on the LAN
fn permit_lan_service(set: &mut FilterSetSpec) -> FirewallResult<()> {
    for (net, _, role) in lan_ranges_v4()? {
        set.push(
            permit(role, Direction::Inbound, AddressFamily::Ipv4)
                .condition(Condition::local_network(net))
                .condition(Condition::remote_network(net)),
        );
    }

    let fe80 = link_local_v6()?;
    set.push(
        permit(Role::PermitLanServiceIpv6Fe80_10, Direction::Inbound, AddressFamily::Ipv6)
            .condition(Condition::local_network(fe80))
            .condition(Condition::remote_network(fe80)),
    );
    Ok(())
}

fn permit_dhcp(set: &mut FilterSetSpec) -> FirewallResult<()> {
    set.push(
        permit(Role::PermitDhcpV4OutboundRequest, Direction::Outbound, AddressFamily::Ipv4)
            .condition(Condition::protocol(TransportProtocol::Udp))
            .condition(Condition::local_port(DHCPV4_CLIENT_PORT))
            .condition(Condition::remote_network(network(Ipv4Addr::BROADCAST, 32)?))
            .condition(Condition::remote_port(DHCPV4_SERVER_PORT)),
    );
    set.push(
        permit(Role::PermitDhcpV4InboundResponse, Direction::Inbound, AddressFamily::Ipv4)
            .condition(Condition::protocol(TransportProtocol::Udp))
            .condition(Condition::local_port(DHCPV4_CLIENT_PORT))
            .condition(Condition::remote_port(DHCPV4_SERVER_PORT)),
    );

    // All_DHCP_Relay_Agents_and_Servers and All_DHCP_Servers
    let dhcpv6_servers = vec![
        network(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2), 128)?,
        network(Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 1, 3), 128)?,
    ];
    set.push(
        permit(Role::PermitDhcpV6OutboundRequest, Direction::Outbound, AddressFamily::Ipv6)
            .condition(Condition::protocol(TransportProtocol::Udp))
            .condition(Condition::local_network(link_local_v6()?))
            .condition(Condition::local_port(DHCPV6_CLIENT_PORT))
            .condition(Condition::remote_in_any(dhcpv6_servers))
            .condition(Condition::remote_port(DHCPV6_SERVER_PORT)),
    );
    set.push(
        permit(Role::PermitDhcpV6InboundResponse, Direction::Inbound, AddressFamily::Ipv6)
            .condition(Condition::protocol(TransportProtocol::Udp))
            .condition(Condition::local_network(link_local_v6()?))
            .condition(Condition::local_port(DHCPV6_CLIENT_PORT))
            .condition(Condition::remote_network(link_local_v6()?))
            .condition(Condition::remote_port(DHCPV6_SERVER_PORT)),
    );
    Ok(())
}

fn permit_relay(set: &mut FilterSetSpec, relay: &RelayEndpoint) {
    let family = AddressFamily::of(&relay.address);
    let mut filter = permit(Role::PermitVpnRelay, Direction::Outbound, family)
        .condition(Condition::remote_host(relay.address));
    if let Some(port) = relay.port {
        filter = filter.condition(Condition::remote_port(port));
    }
    if let Some(protocol) = relay.protocol {
        filter = filter.condition(Condition::protocol(protocol));
    }
    set.push(filter);
}

fn permit_tunnel(set: &mut FilterSetSpec, alias: &str) {
    for (role, direction, family) in [
        (Role::PermitVpnTunnelOutboundIpv4, Direction::Outbound, AddressFamily::Ipv4),
        (Role::PermitVpnTunnelOutboundIpv6, Direction::Outbound, AddressFamily::Ipv6),
        (Role::PermitVpnTunnelInboundIpv4, Direction::Inbound, AddressFamily::Ipv4),
        (Role::PermitVpnTunnelInboundIpv6, Direction::Inbound, AddressFamily::Ipv6),
    ] {
        set.push(permit(role, direction, family).condition(Condition::interface(alias)));
    }
}

fn restrict_dns(role: Role, family: AddressFamily) -> FilterSpec {
    FilterSpec::new(role, SublayerKind::Exception, Direction::Outbound, family)
        .block(WEIGHT_RESTRICT_DNS)
        .condition(Condition::remote_port(DNS_PORT))
}

/// Port 53 only to the configured resolvers (and loopback stubs)
fn restrict_dns_pre_tunnel(set: &mut FilterSetSpec, servers: &[IpAddr]) -> FirewallResult<()> {
    for (restrict_role, permit_role, family) in [
        (Role::RestrictDnsOutboundIpv4, Role::PermitDnsOutboundIpv4, AddressFamily::Ipv4),
        (Role::RestrictDnsOutboundIpv6, Role::PermitDnsOutboundIpv6, AddressFamily::Ipv6),
    ] {
        let resolvers = host_networks(servers, family);

        let mut exempt = resolvers.clone();
        exempt.push(loopback_network(family)?);
        set.push(
            restrict_dns(restrict_role, family).condition(Condition::remote_not_in_any(exempt)),
        );

        if !resolvers.is_empty() {
            set.push(
                permit(permit_role, Direction::Outbound, family)
                    .condition(Condition::remote_port(DNS_PORT))
                    .condition(Condition::remote_in_any(resolvers)),
            );
        }
    }
    Ok(())
}

/// Port 53 only through the tunnel interface (and loopback stubs)
fn restrict_dns_tunnel(set: &mut FilterSetSpec, alias: &str) -> FirewallResult<()> {
    for (role, family) in [
        (Role::RestrictDnsOutboundTunnelIpv4, AddressFamily::Ipv4),
        (Role::RestrictDnsOutboundTunnelIpv6, AddressFamily::Ipv6),
    ] {
        set.push(
            restrict_dns(role, family)
                .condition(Condition::not_interface(alias))
                .condition(Condition::remote_not_in_any(vec![loopback_network(family)?])),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::filter::{Action, WEIGHT_PERMIT};
    use crate::firewall::guids::DnsVariant;
    use std::collections::BTreeSet;

    fn relay() -> RelayEndpoint {
        RelayEndpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
    }

    fn connecting() -> PolicyParams {
        PolicyParams::new().with_relay(relay())
    }

    fn connected() -> PolicyParams {
        PolicyParams::new().with_tunnel("wg0")
    }

    #[test]
    fn test_blocking_states_are_empty() {
        for state in [VpnState::Uninitialized, VpnState::Blocked, VpnState::Disconnected] {
            assert!(build_filter_set(state, &PolicyParams::new()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_connecting_roles() {
        let set = build_filter_set(VpnState::Connecting, &connecting()).unwrap();
        for role in [
            Role::PermitLoopbackOutboundIpv4,
            Role::PermitLoopbackInboundIpv6,
            Role::PermitLan192_168_16,
            Role::PermitLanMulticast,
            Role::PermitLanIpv6Multicast,
            Role::PermitLanService10_8,
            Role::PermitDhcpV4OutboundRequest,
            Role::PermitDhcpV6InboundResponse,
            Role::PermitVpnRelay,
            Role::RestrictDnsOutboundIpv4,
            Role::RestrictDnsOutboundIpv6,
        ] {
            assert!(set.contains(role), "missing {}", role);
        }
        assert!(!set.contains(Role::PermitVpnTunnelOutboundIpv4));
        assert!(!set.contains(Role::PermitDnsOutboundIpv4));
        assert_eq!(set.dns_variants(), BTreeSet::from([DnsVariant::PreTunnel]));
    }

    #[test]
    fn test_connected_replaces_relay_and_dns() {
        let connecting = build_filter_set(VpnState::Connecting, &connecting()).unwrap().roles();
        let connected = build_filter_set(VpnState::Connected, &connected()).unwrap().roles();

        let removed: BTreeSet<Role> = connecting.difference(&connected).copied().collect();
        let added: BTreeSet<Role> = connected.difference(&connecting).copied().collect();

        assert_eq!(
            removed,
            BTreeSet::from([
                Role::PermitVpnRelay,
                Role::RestrictDnsOutboundIpv4,
                Role::RestrictDnsOutboundIpv6,
            ])
        );
        assert_eq!(
            added,
            BTreeSet::from([
                Role::PermitVpnTunnelOutboundIpv4,
                Role::PermitVpnTunnelOutboundIpv6,
                Role::PermitVpnTunnelInboundIpv4,
                Role::PermitVpnTunnelInboundIpv6,
                Role::RestrictDnsOutboundTunnelIpv4,
                Role::RestrictDnsOutboundTunnelIpv6,
            ])
        );
    }

    #[test]
    fn test_missing_params_rejected() {
        let err = build_filter_set(VpnState::Connecting, &PolicyParams::new()).unwrap_err();
        assert!(matches!(err, FirewallError::InvalidParams(_)));

        let err = build_filter_set(VpnState::Connected, &PolicyParams::new()).unwrap_err();
        assert!(matches!(err, FirewallError::InvalidParams(_)));

        // A relay does not stand in for the tunnel
        let err = build_filter_set(VpnState::Connected, &connecting()).unwrap_err();
        assert!(matches!(err, FirewallError::InvalidParams(_)));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let unspecified = RelayEndpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let params = PolicyParams::new().with_relay(unspecified);
        assert!(build_filter_set(VpnState::Connecting, &params).is_err());

        let params = PolicyParams::new().with_relay(relay().with_port(0));
        assert!(build_filter_set(VpnState::Connecting, &params).is_err());

        let params = PolicyParams::new().with_tunnel("wg0; reboot");
        assert!(build_filter_set(VpnState::Connected, &params).is_err());
    }

    #[test]
    fn test_allow_lan_off() {
        let params = connecting().with_allow_lan(false);
        let set = build_filter_set(VpnState::Connecting, &params).unwrap();
        assert!(!set.contains(Role::PermitLan10_8));
        assert!(!set.contains(Role::PermitLanServiceIpv6Fe80_10));
        assert!(set.contains(Role::PermitDhcpV4OutboundRequest));
        assert!(set.contains(Role::RestrictDnsOutboundIpv4));
    }

    #[test]
    fn test_dns_override_adds_resolver_permit() {
        let params = connecting().with_dns_servers(vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]);
        let set = build_filter_set(VpnState::Connecting, &params).unwrap();
        assert!(set.contains(Role::PermitDnsOutboundIpv4));
        // No IPv6 resolver configured: IPv6 DNS stays fully restricted
        assert!(!set.contains(Role::PermitDnsOutboundIpv6));
        assert!(set.contains(Role::RestrictDnsOutboundIpv6));
    }

    #[test]
    fn test_relay_port_and_protocol() {
        let relay = relay().with_port(51820).with_protocol(TransportProtocol::Udp);
        let params = PolicyParams::new().with_relay(relay);
        let set = build_filter_set(VpnState::Connecting, &params).unwrap();
        let filter = set.filters.iter().find(|f| f.role == Role::PermitVpnRelay).unwrap();
        assert_eq!(filter.conditions.len(), 3);
        assert_eq!(filter.family, AddressFamily::Ipv4);
    }

    #[test]
    fn test_ipv6_relay_family() {
        let relay = RelayEndpoint::new("2001:db8::7".parse().unwrap());
        let params = PolicyParams::new().with_relay(relay);
        let set = build_filter_set(VpnState::Connecting, &params).unwrap();
        let filter = set.filters.iter().find(|f| f.role == Role::PermitVpnRelay).unwrap();
        assert_eq!(filter.family, AddressFamily::Ipv6);
    }

    #[test]
    fn test_weights_and_sublayer() {
        let set = build_filter_set(VpnState::Connected, &connected()).unwrap();
        for filter in &set.filters {
            assert_eq!(filter.sublayer, Role::SublayerException.id());
            if filter.role.dns_variant().is_some() {
                assert_eq!(filter.action, Action::Block);
                assert_eq!(filter.weight, WEIGHT_RESTRICT_DNS);
            } else {
                assert_eq!(filter.action, Action::Permit);
                assert_eq!(filter.weight, WEIGHT_PERMIT);
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build_filter_set(VpnState::Connected, &connected()).unwrap();
        let b = build_filter_set(VpnState::Connected, &connected()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.by_id().len(), a.len());
    }
}
