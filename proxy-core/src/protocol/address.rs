//! The address representation shared by the SOCKS5 TCP request parser and
//! the UDP encapsulation header (RFC 1928 §5, §7): an ATYP-tagged address
//! plus a big-endian port, in any of the three address-type encodings.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub const ATYP_V4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_V6: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl Address {
    pub fn atyp(&self) -> u8 {
        match self {
            Address::V4(_) => ATYP_V4,
            Address::Domain(_) => ATYP_DOMAIN,
            Address::V6(_) => ATYP_V6,
        }
    }

    /// Reads an ATYP byte followed by the address and a big-endian port.
    pub async fn read_with_port<R>(reader: &mut R) -> Result<(Address, u16), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader
            .read_u8()
            .await
            .map_err(|_| ProtocolError::Truncated)?;
        let addr = match atyp {
            ATYP_V4 => {
                let mut buf = [0u8; 4];
                reader
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ProtocolError::Truncated)?;
                Address::V4(Ipv4Addr::from(buf))
            }
            ATYP_DOMAIN => {
                let len = reader
                    .read_u8()
                    .await
                    .map_err(|_| ProtocolError::Truncated)? as usize;
                let mut buf = vec![0u8; len];
                reader
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ProtocolError::Truncated)?;
                let name = String::from_utf8(buf).map_err(|_| ProtocolError::Truncated)?;
                Address::Domain(name)
            }
            ATYP_V6 => {
                let mut buf = [0u8; 16];
                reader
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ProtocolError::Truncated)?;
                Address::V6(Ipv6Addr::from(buf))
            }
            other => return Err(ProtocolError::UnsupportedAddressType(other)),
        };
        let port = reader
            .read_u16()
            .await
            .map_err(|_| ProtocolError::Truncated)?;
        Ok((addr, port))
    }

    /// Parses ATYP + address + port from a byte slice, for the UDP
    /// encapsulation header (RFC 1928 §7) where no `AsyncRead` is involved.
    /// Returns the decoded address, port, and number of bytes consumed.
    pub fn parse_with_port(buf: &[u8]) -> Result<(Address, u16, usize), ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::Truncated);
        }
        let atyp = buf[0];
        let rest = &buf[1..];
        let (addr, consumed) = match atyp {
            ATYP_V4 => {
                if rest.len() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&rest[..4]);
                (Address::V4(Ipv4Addr::from(octets)), 4)
            }
            ATYP_DOMAIN => {
                if rest.is_empty() {
                    return Err(ProtocolError::Truncated);
                }
                let len = rest[0] as usize;
                if rest.len() < 1 + len {
                    return Err(ProtocolError::Truncated);
                }
                let name = String::from_utf8(rest[1..1 + len].to_vec())
                    .map_err(|_| ProtocolError::Truncated)?;
                (Address::Domain(name), 1 + len)
            }
            ATYP_V6 => {
                if rest.len() < 16 {
                    return Err(ProtocolError::Truncated);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                (Address::V6(Ipv6Addr::from(octets)), 16)
            }
            other => return Err(ProtocolError::UnsupportedAddressType(other)),
        };
        if rest.len() < consumed + 2 {
            return Err(ProtocolError::Truncated);
        }
        let port = u16::from_be_bytes([rest[consumed], rest[consumed + 1]]);
        Ok((addr, port, 1 + consumed + 2))
    }

    /// Encodes ATYP + address + big-endian port into `out`.
    pub fn encode_with_port(&self, port: u16, out: &mut Vec<u8>) {
        out.push(self.atyp());
        match self {
            Address::V4(v4) => out.extend_from_slice(&v4.octets()),
            Address::V6(v6) => out.extend_from_slice(&v6.octets()),
            Address::Domain(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
        out.extend_from_slice(&port.to_be_bytes());
    }

    /// Resolves this address to a concrete [`SocketAddr`], issuing a DNS
    /// lookup for [`Address::Domain`].
    pub async fn resolve(&self, port: u16) -> std::io::Result<SocketAddr> {
        match self {
            Address::V4(v4) => Ok(SocketAddr::from((*v4, port))),
            Address::V6(v6) => Ok(SocketAddr::from((*v6, port))),
            Address::Domain(name) => tokio::net::lookup_host((name.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no address found for {name}"),
                    )
                }),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(v4) => write!(f, "{v4}"),
            Address::V6(v6) => write!(f, "{v6}"),
            Address::Domain(name) => write!(f, "{name}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::V4(*v4.ip()),
            SocketAddr::V6(v6) => Address::V6(*v6.ip()),
        }
    }
}
