use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// IPv4 endpoint of a netfs server.
///
/// Servers are keyed by this value in the server manager, so it has to be
/// `Hash + Eq` and cheap to copy.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAddress {
    /// Host-order IPv4 address.
    pub ip: u32,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// Same host, different port. Used to reach the side channels of a server.
    pub fn with_port(&self, port: u16) -> Self {
        Self { ip: self.ip, port }
    }

    /// Convert a socket address. IPv6 addresses are rejected.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::new(u32::from(*v4.ip()), v4.port())),
            SocketAddr::V6(v6) => v6
                .ip()
                .to_ipv4_mapped()
                .map(|ip| Self::new(u32::from(ip), v6.port())),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ipv4(), self.port))
    }
}

impl From<SocketAddrV4> for NetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(u32::from(*addr.ip()), addr.port())
    }
}

impl From<NetAddress> for SocketAddr {
    fn from(addr: NetAddress) -> Self {
        addr.to_socket_addr()
    }
}

impl fmt::Debug for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl FromStr for NetAddress {
    type Err = AddressParseError;

    /// Parse `"a.b.c.d:port"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ip_str, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        let ip: Ipv4Addr = ip_str.parse().map_err(|_| AddressParseError::InvalidIp)?;
        Ok(Self::new(u32::from(ip), port))
    }
}

/// Errors when parsing a `NetAddress` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
    #[error("invalid IPv4 address")]
    InvalidIp,
}
