use crate::protocol::ReplyCode;
use std::path::PathBuf;
use thiserror::Error;

/// DecodeError covers every way a SOCKS5 message can fail to decode
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed SOCKS5 message")]
    MalformedMessage,
    #[error("unsupported SOCKS5 command: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported SOCKS5 address type: {0:#04x}")]
    UnsupportedAddressType(u8),
}

impl DecodeError {
    /// reply_code maps a request-phase decode failure to the reply sent
    /// back to the client before closing
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            DecodeError::MalformedMessage => ReplyCode::GeneralFailure,
            DecodeError::UnsupportedCommand(_) => ReplyCode::CommandNotSupported,
            DecodeError::UnsupportedAddressType(_) => ReplyCode::AddressTypeNotSupported,
        }
    }
}

/// ConfigError is fatal at startup: the server never accepts a
/// connection while one is outstanding
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no authentication methods configured")]
    NoAuthMethodsConfigured,
    #[error("authentication method code {0:#04x} registered twice")]
    DuplicateMethodCode(u8),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
}
