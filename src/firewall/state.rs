//! VPN lifecycle states and the parameters a state may require

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use super::conditions::TransportProtocol;

/// VPN lifecycle state the firewall is programmed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VpnState {
    /// Nothing applied yet; the controller starts here
    Uninitialized,
    /// Everything blocked
    Blocked,
    /// No tunnel; filter-wise identical to `Blocked`
    Disconnected,
    /// Negotiating with a relay
    Connecting,
    /// Tunnel up
    Connected,
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VpnState::Uninitialized => "uninitialized",
            VpnState::Blocked => "blocked",
            VpnState::Disconnected => "disconnected",
            VpnState::Connecting => "connecting",
            VpnState::Connected => "connected",
        };
        f.write_str(name)
    }
}

impl FromStr for VpnState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uninitialized" => Ok(VpnState::Uninitialized),
            "blocked" => Ok(VpnState::Blocked),
            "disconnected" => Ok(VpnState::Disconnected),
            "connecting" => Ok(VpnState::Connecting),
            "connected" => Ok(VpnState::Connected),
            other => Err(format!("unknown state '{}'", other)),
        }
    }
}

/// Relay the client negotiates with while connecting
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub address: IpAddr,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<TransportProtocol>,
}

impl RelayEndpoint {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: None,
            protocol: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

impl From<IpAddr> for RelayEndpoint {
    fn from(address: IpAddr) -> Self {
        Self::new(address)
    }
}

impl From<SocketAddr> for RelayEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip()).with_port(addr.port())
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}", SocketAddr::new(self.address, port))?,
            None => write!(f, "{}", self.address)?,
        }
        if let Some(protocol) = self.protocol {
            write!(f, "/{}", protocol)?;
        }
        Ok(())
    }
}

/// Parameters accompanying a transition request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParams {
    /// Relay endpoint, required by `Connecting`
    pub relay: Option<RelayEndpoint>,
    /// Tunnel interface alias, required by `Connected`
    pub tunnel_interface: Option<String>,
    /// Resolvers reachable outside the tunnel while connecting
    pub dns_servers: Vec<IpAddr>,
    /// Permit traffic to and from private networks
    pub allow_lan: bool,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            relay: None,
            tunnel_interface: None,
            dns_servers: Vec::new(),
            allow_lan: true,
        }
    }
}

impl PolicyParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(mut self, relay: impl Into<RelayEndpoint>) -> Self {
        self.relay = Some(relay.into());
        self
    }

    pub fn with_tunnel(mut self, alias: &str) -> Self {
        self.tunnel_interface = Some(alias.to_string());
        self
    }

    pub fn with_dns_servers(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_allow_lan(mut self, allow_lan: bool) -> Self {
        self.allow_lan = allow_lan;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_state_parse_and_display() {
        for state in [
            VpnState::Uninitialized,
            VpnState::Blocked,
            VpnState::Disconnected,
            VpnState::Connecting,
            VpnState::Connected,
        ] {
            assert_eq!(state.to_string().parse::<VpnState>().unwrap(), state);
        }
        assert!("online".parse::<VpnState>().is_err());
    }

    #[test]
    fn test_relay_display() {
        let addr = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let relay =
            RelayEndpoint::from(SocketAddr::new(addr, 1194)).with_protocol(TransportProtocol::Udp);
        assert_eq!(relay.to_string(), "1.2.3.4:1194/udp");
        assert_eq!(RelayEndpoint::new(addr).to_string(), "1.2.3.4");
    }

    #[test]
    fn test_params_default_allows_lan() {
        let params: PolicyParams = serde_json::from_str("{}").unwrap();
        assert!(params.allow_lan);
        assert_eq!(params, PolicyParams::new());
    }
}
