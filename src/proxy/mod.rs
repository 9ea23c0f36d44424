//! Proxy implementations
//!
//! Provides:
//! - SOCKS5 ingress (CONNECT only, no authentication)
//! - The destination address type shared with the tunnel wire format

mod socks5;

pub use socks5::{Reply, Socks5Conn, Socks5Server, Socks5State};

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unexpected state: {0:?}")]
    InvalidState(Socks5State),
}

/// Address types (SOCKS5 ATYP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part, suitable for resolving or dialing
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Ipv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Address::Ipv4(..) => AddressType::Ipv4,
            Address::Ipv6(..) => AddressType::Ipv6,
            Address::Domain(..) => AddressType::Domain,
        }
    }

    /// Check that the address can be dialed: non-empty host, non-zero port
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.port() == 0 {
            return Err(ProxyError::InvalidAddress(format!("{}: port 0", self)));
        }
        if let Address::Domain(domain, _) = self {
            if domain.is_empty() {
                return Err(ProxyError::InvalidAddress("empty host".to_string()));
            }
        }
        Ok(())
    }

    /// Encode as `ATYP | ADDR | PORT`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(19);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.address_type() as u8);
        match self {
            Address::Ipv4(ip, _) => buf.extend_from_slice(ip),
            Address::Ipv6(ip, _) => buf.extend_from_slice(ip),
            Address::Domain(domain, _) => {
                // Domains longer than 255 bytes cannot come from SOCKS5
                let bytes = &domain.as_bytes()[..domain.len().min(255)];
                buf.put_u8(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.put_u16(self.port());
    }

    /// Decode an `ATYP | ADDR | PORT` payload that holds nothing else
    pub fn decode(payload: &[u8]) -> Result<Self, ProxyError> {
        let (&atyp, rest) = payload
            .split_first()
            .ok_or_else(|| ProxyError::InvalidAddress("empty".to_string()))?;

        let (address, consumed) = match AddressType::try_from(atyp)? {
            AddressType::Ipv4 => {
                let (ip, port) = split_fixed::<4>(rest)?;
                (Address::Ipv4(ip, port), 6)
            }
            AddressType::Ipv6 => {
                let (ip, port) = split_fixed::<16>(rest)?;
                (Address::Ipv6(ip, port), 18)
            }
            AddressType::Domain => {
                let len = *rest
                    .first()
                    .ok_or_else(|| ProxyError::InvalidAddress("truncated domain".to_string()))?
                    as usize;
                if rest.len() < 1 + len + 2 {
                    return Err(ProxyError::InvalidAddress("truncated domain".to_string()));
                }
                let domain = std::str::from_utf8(&rest[1..1 + len])
                    .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".to_string()))?;
                let port = u16::from_be_bytes([rest[1 + len], rest[2 + len]]);
                (Address::Domain(domain.to_string(), port), 1 + len + 2)
            }
        };

        if rest.len() != consumed {
            return Err(ProxyError::InvalidAddress(format!(
                "{} trailing bytes",
                rest.len().saturating_sub(consumed)
            )));
        }
        Ok(address)
    }
}

fn split_fixed<const N: usize>(rest: &[u8]) -> Result<([u8; N], u16), ProxyError> {
    if rest.len() < N + 2 {
        return Err(ProxyError::InvalidAddress("truncated address".to_string()));
    }
    let mut ip = [0u8; N];
    ip.copy_from_slice(&rest[..N]);
    Ok((ip, u16::from_be_bytes([rest[N], rest[N + 1]])))
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
