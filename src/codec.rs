//! Encoding and decoding of the SOCKS5 handshake messages.
//!
//! Every decoder expects exactly one complete message. Framing is a
//! separate step ([greeting_len], [request_len]) so a caller holding a
//! partial read can keep buffering instead of failing.

use crate::address::{self, Address};
use crate::error::DecodeError;
use crate::protocol::{AddressType, Command, NO_ACCEPTABLE_METHODS, RSV, ReplyCode, Version};

/// Greeting is the client's opening message listing the authentication
/// methods it supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: u8,
    pub methods: Vec<u8>,
}

/// SocksRequest is a decoded CONNECT / BIND / UDP ASSOCIATE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: Command,
    pub address: Address,
}

impl SocksRequest {
    pub fn address_type(&self) -> AddressType {
        self.address.address_type()
    }

    pub fn target_host(&self) -> String {
        self.address.host()
    }

    pub fn target_port(&self) -> u16 {
        self.address.port()
    }
}

/// Reply is a decoded server reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyCode,
    pub bound: Address,
}

// ClientHello format
// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+

/// greeting_len returns the full length of the greeting at the start of
/// buf, or None until NMETHODS has arrived
pub fn greeting_len(buf: &[u8]) -> Option<usize> {
    match buf {
        [_, n_methods, ..] => Some(2 + *n_methods as usize),
        _ => None,
    }
}

pub fn decode_greeting(buf: &[u8]) -> Result<Greeting, DecodeError> {
    let expected = greeting_len(buf).ok_or(DecodeError::MalformedMessage)?;
    if buf.len() != expected {
        return Err(DecodeError::MalformedMessage);
    }

    // Ensure version is 0x05 -> SOCKS5
    if buf[0] != Version::SOCKS5 as u8 {
        return Err(DecodeError::MalformedMessage);
    }

    Ok(Greeting {
        version: buf[0],
        methods: buf[2..].to_vec(),
    })
}

pub fn encode_greeting(methods: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(Version::SOCKS5 as u8);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    buf
}

// ServerChoice method selection reply format
// +----+--------+
// |VER | METHOD |
// +----+--------+
// | 1  |   1    |
// +----+--------+

/// encode_method_selection builds the server's choice; None becomes
/// 0xFF, after which the connection must be closed
pub fn encode_method_selection(method: Option<u8>) -> [u8; 2] {
    [
        Version::SOCKS5 as u8,
        method.unwrap_or(NO_ACCEPTABLE_METHODS),
    ]
}

// SOCKS5 request format
// +----+-----+-------+------+----------+----------+
// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
// +----+-----+-------+------+----------+----------+
// | 1  |  1  | X'00' |  1   | Variable |    2     |
// +----+-----+-------+------+----------+----------+

/// request_len returns the full length of the request at the start of
/// buf, or None while more bytes are needed to know it. An unknown ATYP
/// makes the length undeterminable and fails immediately.
pub fn request_len(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let Some(atyp) = AddressType::from_byte(buf[3]) else {
        // Report the first bad header field, as decode_request would
        let err = decode_header(buf).err();
        return Err(err.unwrap_or(DecodeError::UnsupportedAddressType(buf[3])));
    };
    Ok(address::address_len(atyp, &buf[4..]).map(|len| 4 + len))
}

/// decode_header checks VER and RSV, then CMD, then ATYP
fn decode_header(buf: &[u8]) -> Result<(Command, AddressType), DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::MalformedMessage);
    }
    if buf[0] != Version::SOCKS5 as u8 || buf[2] != RSV {
        return Err(DecodeError::MalformedMessage);
    }

    let command = Command::from_byte(buf[1]).ok_or(DecodeError::UnsupportedCommand(buf[1]))?;
    let atyp = AddressType::from_byte(buf[3]).ok_or(DecodeError::UnsupportedAddressType(buf[3]))?;
    Ok((command, atyp))
}

pub fn decode_request(buf: &[u8]) -> Result<SocksRequest, DecodeError> {
    let (command, atyp) = decode_header(buf)?;

    let (address, used) = address::parse_address(atyp, &buf[4..])?;
    if 4 + used != buf.len() {
        return Err(DecodeError::MalformedMessage);
    }

    Ok(SocksRequest { command, address })
}

pub fn encode_request(request: &SocksRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + 1 + request.address.encoded_len());
    buf.extend_from_slice(&[Version::SOCKS5 as u8, request.command as u8, RSV]);
    request.address.write_to(&mut buf);
    buf
}

// SOCKS5 reply format
// +----+-----+-------+------+----------+----------+
// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
// +----+-----+-------+------+----------+----------+
// | 1  |  1  | X'00' |  1   | Variable |    2     |
// +----+-----+-------+------+----------+----------+

pub fn encode_reply(status: ReplyCode, bound: &Address) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + 1 + bound.encoded_len());
    buf.extend_from_slice(&[Version::SOCKS5 as u8, status as u8, RSV]);
    bound.write_to(&mut buf);
    buf
}

/// decode_reply parses a complete reply. Replies share the request
/// framing, so [request_len] also frames them.
pub fn decode_reply(buf: &[u8]) -> Result<Reply, DecodeError> {
    if buf.len() < 4 || buf[0] != Version::SOCKS5 as u8 || buf[2] != RSV {
        return Err(DecodeError::MalformedMessage);
    }
    let status = ReplyCode::from_byte(buf[1]).ok_or(DecodeError::MalformedMessage)?;
    let atyp = AddressType::from_byte(buf[3]).ok_or(DecodeError::UnsupportedAddressType(buf[3]))?;

    let (bound, used) = address::parse_address(atyp, &buf[4..])?;
    if 4 + used != buf.len() {
        return Err(DecodeError::MalformedMessage);
    }

    Ok(Reply { status, bound })
}
