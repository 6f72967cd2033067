use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport a storage-node endpoint is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    TCP,
    LOCAL,
    UNIX,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::TCP => write!(f, "TCP"),
            AddressType::LOCAL => write!(f, "LOCAL"),
            AddressType::UNIX => write!(f, "UNIX"),
        }
    }
}

/// Endpoint address: IPv4 (network byte order), port and transport type.
///
/// Two stubs pointing at the same `Address` refer to the same remote
/// interface, which is how duplicate storage registrations are detected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IPv4 address in network byte order (big-endian).
    pub ip: u32,
    pub port: u16,
    pub addr_type: AddressType,
}

impl Address {
    pub fn new(ip: u32, port: u16, addr_type: AddressType) -> Self {
        Self {
            ip,
            port,
            addr_type,
        }
    }

    /// Create an address from four octets, a port, and a type.
    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16, addr_type: AddressType) -> Self {
        Self::new(u32::from_be_bytes([a, b, c, d]), port, addr_type)
    }

    /// Shorthand for a loopback TCP endpoint, handy for in-process nodes.
    pub fn localhost(port: u16) -> Self {
        Self::from_octets(127, 0, 0, 1, port, AddressType::TCP)
    }

    /// Return the four IP octets.
    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}://{}.{}.{}.{}:{}", self.addr_type, a, b, c, d, self.port)
    }
}
