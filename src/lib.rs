//! A SOCKS5 proxy server with pluggable authentication
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT over IPv4, IPv6 and domain names
//!     - No Authentication
//!     - Username/Password Authentication with multiple accounts
//!     - Pluggable authentication backends through [AuthMethod]
//!     - Per-connection state machine tolerant of fragmented and pipelined input
//!     - Half-close aware bidirectional relay
//!     - Idle timeouts during negotiation, bounded upstream connects
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use saturn::{AuthRegistry, NoAuth, Socks5Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = AuthRegistry::new();
//!     registry.register(NoAuth)?;
//!
//!     let mut server = Socks5Server::new("127.0.0.1:1080", registry)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod state;

// Re-export main types at crate root for convenience
pub use address::Address;
pub use auth::{AuthMethod, AuthRegistry, AuthResult, NoAuth, UserPass, UserPassAuth};
pub use codec::{Greeting, SocksRequest};
pub use config::{AuthConfig, Config};
pub use dispatcher::{Dispatcher, Timeouts};
pub use error::{ConfigError, DecodeError};
pub use protocol::{AddressType, Command, ReplyCode, Version};
pub use relay::{Relay, RelayStats};
pub use server::Socks5Server;
pub use state::ConnectionState;
