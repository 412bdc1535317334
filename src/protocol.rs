// Wire constants for SOCKS5 (RFC 1928) and username/password
// sub-negotiation (RFC 1929)

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Sub-negotiation version for username/password authentication
pub const USERPASS_VERSION: u8 = 0x01;

/// Method code reserved for "no acceptable methods"
pub const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// Version represents available SOCKS proxy versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthCode lists the method codes of the bundled authentication
/// backends
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCode {
    NoAuth = 0x00,
    // Gssapi = 0x01, not implemented
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
}

/// AuthStatus is the STATUS byte of the username/password reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// ReplyCode is the REP field of a server reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ReplyCode::Succeeded),
            0x01 => Some(ReplyCode::GeneralFailure),
            0x02 => Some(ReplyCode::ConnectionNotAllowed),
            0x03 => Some(ReplyCode::NetworkUnreachable),
            0x04 => Some(ReplyCode::HostUnreachable),
            0x05 => Some(ReplyCode::ConnectionRefused),
            0x06 => Some(ReplyCode::TtlExpired),
            0x07 => Some(ReplyCode::CommandNotSupported),
            0x08 => Some(ReplyCode::AddressTypeNotSupported),
            _ => None,
        }
    }

    /// from_io_error maps a failed upstream connect to the reply the
    /// client receives
    pub fn from_io_error(e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            std::io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            std::io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            std::io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            std::io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            _ => match e.raw_os_error() {
                // ENETUNREACH, ENETDOWN
                Some(101) | Some(100) => ReplyCode::NetworkUnreachable,
                // EHOSTUNREACH, EHOSTDOWN
                Some(113) | Some(112) => ReplyCode::HostUnreachable,
                Some(111) => ReplyCode::ConnectionRefused,
                _ => ReplyCode::GeneralFailure,
            },
        }
    }

    /// as_str is used as the `reason` of `request_failed` events
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general_failure",
            ReplyCode::ConnectionNotAllowed => "connection_not_allowed",
            ReplyCode::NetworkUnreachable => "network_unreachable",
            ReplyCode::HostUnreachable => "host_unreachable",
            ReplyCode::ConnectionRefused => "connection_refused",
            ReplyCode::TtlExpired => "ttl_expired",
            ReplyCode::CommandNotSupported => "command_not_supported",
            ReplyCode::AddressTypeNotSupported => "address_type_not_supported",
        }
    }
}
