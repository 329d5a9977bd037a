//! Input validation for policy parameters
//!
//! Everything here runs before a transaction is opened, so a rejected
//! parameter never reaches the filtering engine.

use crate::error::{FirewallError, FirewallResult};
use std::net::IpAddr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum number of DNS resolvers accepted in one policy
const MAX_DNS_SERVERS: usize = 16;

/// Validate a tunnel interface name
///
/// Interface names must be alphanumeric with optional dashes, dots and
/// underscores, and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> FirewallResult<()> {
    if name.is_empty() {
        return Err(FirewallError::InvalidParams(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(FirewallError::InvalidParams(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(FirewallError::InvalidParams(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(FirewallError::InvalidParams(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate a remote endpoint address
///
/// Unspecified, loopback and multicast addresses would widen a host permit
/// into something else entirely.
pub fn validate_endpoint_address(addr: &IpAddr) -> FirewallResult<()> {
    if addr.is_unspecified() {
        return Err(FirewallError::InvalidParams(
            format!("Endpoint address {} is unspecified", addr)
        ));
    }
    if addr.is_loopback() || addr.is_multicast() {
        return Err(FirewallError::InvalidParams(
            format!("Endpoint address {} is not a unicast remote address", addr)
        ));
    }
    Ok(())
}

/// Validate a port number
pub fn validate_port(port: u16) -> FirewallResult<()> {
    if port == 0 {
        return Err(FirewallError::InvalidParams("Port 0 is not a valid endpoint port".to_string()));
    }
    Ok(())
}

/// Validate a DNS resolver list
pub fn validate_dns_servers(servers: &[IpAddr]) -> FirewallResult<()> {
    if servers.len() > MAX_DNS_SERVERS {
        return Err(FirewallError::InvalidParams(
            format!("Too many DNS servers ({}, max {})", servers.len(), MAX_DNS_SERVERS)
        ));
    }
    for server in servers {
        if server.is_unspecified() || server.is_multicast() {
            return Err(FirewallError::InvalidParams(
                format!("Invalid DNS server address: {}", server)
            ));
        }
    }
    Ok(())
}

/// Validate prefix length for IPv4 or IPv6
pub fn validate_prefix_len(prefix: u8, is_ipv6: bool) -> FirewallResult<()> {
    let max = if is_ipv6 { 128 } else { 32 };
    if prefix > max {
        return Err(FirewallError::InvalidParams(
            format!("Prefix length {} exceeds maximum {}", prefix, max)
        ));
    }
    Ok(())
}
