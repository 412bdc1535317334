use crate::error::DecodeError;
use crate::protocol::AddressType;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address represents a network address or domain together with a port,
/// as carried in the DST/BND fields of SOCKS5 requests and replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(SocketAddrV4),
    DomainName(String, u16),
    IPv6(SocketAddrV6),
}

/// Address implementation block
impl Address {
    /// unspecified is the 0.0.0.0:0 address used in failure replies
    pub fn unspecified() -> Self {
        Address::IPv4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(..) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    /// host returns the host portion as a string (IP literal or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(addr) => addr.ip().to_string(),
            Address::DomainName(domain, _) => domain.clone(),
            Address::IPv6(addr) => addr.ip().to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(addr) => addr.port(),
            Address::DomainName(_, port) => *port,
            Address::IPv6(addr) => addr.port(),
        }
    }

    /// encoded_len is the number of bytes written by write_to, ATYP excluded
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::IPv4(_) => 4 + 2,
            Address::DomainName(domain, _) => 1 + domain.len().min(u8::MAX as usize) + 2,
            Address::IPv6(_) => 16 + 2,
        }
    }

    /// write_to appends ATYP | ADDR | PORT to buf
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.address_type() as u8);
        match self {
            Address::IPv4(addr) => {
                // Address -> 4 bytes
                buf.extend_from_slice(&addr.ip().octets());
            }
            Address::DomainName(domain, _) => {
                // Length-prefixed domain, truncated to what a single octet can describe
                let bytes = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
            Address::IPv6(addr) => {
                // Address -> 16 bytes
                buf.extend_from_slice(&addr.ip().octets());
            }
        }

        // Port in BE -> 2 bytes
        buf.extend_from_slice(&self.port().to_be_bytes());
    }

    /// resolve turns the address into candidate socket addresses. Domain
    /// names go through the system resolver; IP literals are returned as-is
    pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        match self {
            Address::IPv4(addr) => Ok(vec![SocketAddr::V4(*addr)]),
            Address::IPv6(addr) => Ok(vec![SocketAddr::V6(*addr)]),
            Address::DomainName(domain, port) => {
                let addrs: Vec<SocketAddr> =
                    tokio::net::lookup_host((domain.as_str(), *port)).await?.collect();
                if addrs.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("no IP address found for '{domain}'"),
                    ));
                }
                Ok(addrs)
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(v4),
            SocketAddr::V6(v6) => Address::IPv6(v6),
        }
    }
}

impl From<(IpAddr, u16)> for Address {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        SocketAddr::new(ip, port).into()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(addr) => write!(f, "{addr}"),
            Address::DomainName(domain, port) => write!(f, "{domain}:{port}"),
            Address::IPv6(addr) => write!(f, "{addr}"),
        }
    }
}

/// address_len returns the number of bytes the address and port occupy
/// at the start of data, or None when data is too short to tell
pub fn address_len(atyp: AddressType, data: &[u8]) -> Option<usize> {
    match atyp {
        AddressType::IPv4 => Some(4 + 2),
        AddressType::IPv6 => Some(16 + 2),
        // First octet in DomainName contains the number of octets to follow
        AddressType::DomainName => data.first().map(|len| 1 + *len as usize + 2),
    }
}

/// parse_address parses exactly one address + port of the given type
/// from the start of data and returns it with the number of bytes consumed
pub fn parse_address(atyp: AddressType, data: &[u8]) -> Result<(Address, usize), DecodeError> {
    let len = address_len(atyp, data).ok_or(DecodeError::MalformedMessage)?;
    if data.len() < len {
        return Err(DecodeError::MalformedMessage);
    }

    // Grab port -> BigEndian (network order), always the final 2 bytes
    let port = u16::from_be_bytes([data[len - 2], data[len - 1]]);

    let address = match atyp {
        AddressType::IPv4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&data[..4]);
            Address::IPv4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
        }
        AddressType::IPv6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            Address::IPv6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        }
        AddressType::DomainName => {
            let domain = &data[1..len - 2];
            if domain.is_empty() {
                return Err(DecodeError::MalformedMessage);
            }
            let domain = std::str::from_utf8(domain).map_err(|_| DecodeError::MalformedMessage)?;
            Address::DomainName(domain.to_string(), port)
        }
    };

    Ok((address, len))
}
