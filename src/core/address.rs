//! Connection endpoint addresses used as routing keys

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::{NetworkError, Result};

/// IPv4 endpoint of a connection
///
/// For inbound messages this is the origin, for outbound messages the
/// destination. [`Address::BROADCAST`] is a routing directive and never the
/// address of a real peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
}

impl Address {
    /// Sentinel destination meaning "every registered client" (`0.0.0.0:0`)
    pub const BROADCAST: Address = Address {
        ip: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    /// Create an address from an IPv4 value and a port
    #[must_use]
    pub fn new(ip: impl Into<Ipv4Addr>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// IP part of the address
    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// The four IP octets, most significant first
    #[must_use]
    pub fn octets(&self) -> [u8; 4] {
        self.ip.octets()
    }

    /// Port part of the address
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check whether this is the broadcast sentinel
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddrV4 = s
            .parse()
            .map_err(|e| NetworkError::invalid_address(format!("{}: {}", s, e)))?;
        Ok(addr.into())
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = NetworkError;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => v6
                .ip()
                .to_ipv4_mapped()
                .map(|ip| Self::new(ip, v6.port()))
                .ok_or_else(|| {
                    NetworkError::invalid_address(format!("{} is not an IPv4 endpoint", addr))
                }),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::V4(SocketAddrV4::new(addr.ip, addr.port))
    }
}
