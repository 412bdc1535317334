//! Per-connection SOCKS5 state machine.
//!
//! A [Dispatcher] owns one client stream, buffers whatever the client
//! sends, and advances its [ConnectionState] one complete message at a
//! time. Once a CONNECT succeeds it hands both sockets to a [Relay].

use crate::address::Address;
use crate::auth::{AuthMethod, AuthRegistry, AuthResult};
use crate::codec::{self, SocksRequest};
use crate::protocol::{Command, ReplyCode, Version};
use crate::relay::{Relay, RelayStats};
use crate::state::ConnectionState;
use anyhow::Result;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

const READ_BUF_SIZE: usize = 4096;

/// Timeouts bound how long a connection may sit in a negotiation state
/// and how long an upstream connect (DNS included) may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            connect: Duration::from_secs(10),
        }
    }
}

/// Dispatcher drives one accepted client connection through the SOCKS5
/// handshake
pub struct Dispatcher<S> {
    state: ConnectionState,
    client: S,
    upstream: Option<TcpStream>,
    chosen_method: Option<Arc<dyn AuthMethod>>,
    request: Option<SocksRequest>,
    registry: Arc<AuthRegistry>,
    timeouts: Timeouts,
    buffer: Vec<u8>,
    peer: Option<SocketAddr>,
    state_entered: Instant,
}

/// Dispatcher implementation block
impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(client: S, registry: Arc<AuthRegistry>, timeouts: Timeouts) -> Self {
        Self {
            state: ConnectionState::NotAuthenticated,
            client,
            upstream: None,
            chosen_method: None,
            request: None,
            registry,
            timeouts,
            buffer: Vec::new(),
            peer: None,
            state_entered: Instant::now(),
        }
    }

    /// with_peer records the client address for log output
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn chosen_method(&self) -> Option<&Arc<dyn AuthMethod>> {
        self.chosen_method.as_ref()
    }

    /// request is set once a CONNECT succeeds and never changes afterwards
    pub fn request(&self) -> Option<&SocksRequest> {
        self.request.as_ref()
    }

    fn peer(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    /// run reads from the client until the handshake completes, then
    /// relays until either side closes. The connection always ends Closed.
    pub async fn run(&mut self) -> Result<()> {
        let (stats, result) = self.drive().await;
        self.close().await;

        info!(
            event = "connection_closed",
            peer = %self.peer(),
            from_client = stats.from_client,
            from_upstream = stats.from_upstream,
            "connection closed"
        );

        result
    }

    async fn drive(&mut self) -> (RelayStats, Result<()>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        while !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Closed
        ) {
            let deadline = self.state_entered + self.timeouts.handshake;
            let n = match timeout_at(deadline, self.client.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    debug!(peer = %self.peer(), state = %self.state, "client closed during handshake");
                    return (RelayStats::default(), Ok(()));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return (RelayStats::default(), Err(e.into())),
                Err(_) => {
                    warn!(peer = %self.peer(), state = %self.state, "idle timeout during handshake");
                    return (RelayStats::default(), Ok(()));
                }
            };

            if let Err(e) = self.handle(&buf[..n]).await {
                return (RelayStats::default(), Err(e));
            }
        }

        match self.upstream.take() {
            Some(mut upstream) if matches!(self.state, ConnectionState::Connected) => {
                let (stats, err) = Relay::new(&mut self.client, &mut upstream).run().await;
                if let Some(e) = err {
                    debug!(peer = %self.peer(), "relay error: {e}");
                }
                (stats, Ok(()))
            }
            _ => (RelayStats::default(), Ok(())),
        }
    }

    /// handle feeds newly received client bytes into the state machine.
    ///
    /// Complete messages are processed in order, each causing at most one
    /// transition; an incomplete tail stays buffered for the next call.
    /// Once Connected, bytes go straight to the upstream; once Closed,
    /// they are discarded.
    pub async fn handle(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Connected => return self.forward(data).await,
            _ => self.buffer.extend_from_slice(data),
        }

        loop {
            let before = (self.state.clone(), self.buffer.len());

            match self.state.clone() {
                ConnectionState::NotAuthenticated => self.on_greeting().await?,
                ConnectionState::WaitingAuthenticationData(method) => {
                    self.on_auth_data(method).await?
                }
                ConnectionState::Authenticated => self.on_request().await?,
                ConnectionState::Connected => {
                    // Payload pipelined behind the request
                    let pending = std::mem::take(&mut self.buffer);
                    if !pending.is_empty() {
                        self.forward(&pending).await?;
                    }
                    break;
                }
                ConnectionState::Closed => break,
            }

            if before.0 == self.state && before.1 == self.buffer.len() {
                break;
            }
        }

        Ok(())
    }

    // ================
    // GREETING
    // ================

    async fn on_greeting(&mut self) -> Result<()> {
        // Reject non-SOCKS5 clients before waiting on a bogus length
        if self.buffer.first().is_some_and(|v| *v != Version::SOCKS5 as u8) {
            debug!(peer = %self.peer(), "greeting with wrong version, closing");
            self.close().await;
            return Ok(());
        }

        let Some(len) = codec::greeting_len(&self.buffer) else {
            return Ok(());
        };
        if self.buffer.len() < len {
            return Ok(());
        }
        let message: Vec<u8> = self.buffer.drain(..len).collect();

        let greeting = match codec::decode_greeting(&message) {
            Ok(greeting) => greeting,
            Err(e) => {
                debug!(peer = %self.peer(), "malformed greeting: {e}");
                self.close().await;
                return Ok(());
            }
        };

        match self.registry.select(&greeting.methods) {
            Some(method) => {
                self.send(&codec::encode_method_selection(Some(method.code())))
                    .await?;
                debug!(peer = %self.peer(), method = method.name(), "authentication method selected");
                self.chosen_method = Some(method.clone());
                self.transition(ConnectionState::WaitingAuthenticationData(method));
            }
            None => {
                self.send(&codec::encode_method_selection(None)).await?;
                warn!(
                    event = "auth_failed",
                    peer = %self.peer(),
                    offered = ?greeting.methods,
                    "no acceptable authentication method"
                );
                self.close().await;
            }
        }

        Ok(())
    }

    // ================
    // AUTHENTICATION
    // ================

    async fn on_auth_data(&mut self, method: Arc<dyn AuthMethod>) -> Result<()> {
        let len = match method.frame_len(&self.buffer) {
            Ok(Some(len)) if self.buffer.len() >= len => len,
            Ok(_) => return Ok(()),
            Err(e) => {
                // No status reply exists for a malformed sub-negotiation
                warn!(event = "auth_failed", peer = %self.peer(), method = method.name(), "malformed authentication data: {e}");
                self.close().await;
                return Ok(());
            }
        };
        let payload: Vec<u8> = self.buffer.drain(..len).collect();

        let result = self.registry.authenticate(method.code(), &payload).await;
        if let Some(response) = method.response(&result) {
            self.send(&response).await?;
        }

        match result {
            AuthResult::Accepted => {
                debug!(peer = %self.peer(), method = method.name(), "authenticated");
                self.transition(ConnectionState::Authenticated);
            }
            AuthResult::Rejected(reason) => {
                warn!(event = "auth_failed", peer = %self.peer(), method = method.name(), "authentication rejected: {reason}");
                self.close().await;
            }
            AuthResult::NeedMoreData => {
                debug!(peer = %self.peer(), method = method.name(), "awaiting further authentication data");
            }
        }

        Ok(())
    }

    // ================
    // REQUEST
    // ================

    async fn on_request(&mut self) -> Result<()> {
        let len = match codec::request_len(&self.buffer) {
            Ok(Some(len)) if self.buffer.len() >= len => len,
            Ok(_) => return Ok(()),
            Err(e) => return self.fail_request(e.reply_code()).await,
        };
        let message: Vec<u8> = self.buffer.drain(..len).collect();

        let request = match codec::decode_request(&message) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %self.peer(), "bad request: {e}");
                return self.fail_request(e.reply_code()).await;
            }
        };

        match request.command {
            Command::Connect => self.connect(request).await,
            // BIND and UDP ASSOCIATE are not relayed
            Command::Bind | Command::UdpAssociate => {
                debug!(peer = %self.peer(), command = ?request.command, "unsupported command");
                self.fail_request(ReplyCode::CommandNotSupported).await
            }
        }
    }

    /// connect opens the upstream for a CONNECT request and replies with
    /// the outcome
    async fn connect(&mut self, request: SocksRequest) -> Result<()> {
        let target = request.address.clone();

        let outbound = match timeout(self.timeouts.connect, connect_upstream(&target)).await {
            Ok(Ok(outbound)) => outbound,
            Ok(Err(e)) => {
                debug!(peer = %self.peer(), %target, "upstream connect failed: {e}");
                return self.fail_request(ReplyCode::from_io_error(&e)).await;
            }
            Err(_) => {
                debug!(peer = %self.peer(), %target, "upstream connect timed out");
                return self.fail_request(ReplyCode::TtlExpired).await;
            }
        };

        let bound = match outbound.local_addr() {
            Ok(addr) => Address::from(addr),
            Err(_) => Address::unspecified(),
        };
        self.send(&codec::encode_reply(ReplyCode::Succeeded, &bound))
            .await?;

        info!(peer = %self.peer(), %target, "tunnel established");
        self.upstream = Some(outbound);
        self.request = Some(request);
        self.transition(ConnectionState::Connected);
        Ok(())
    }

    /// fail_request sends a failure reply and closes the connection
    async fn fail_request(&mut self, code: ReplyCode) -> Result<()> {
        warn!(event = "request_failed", peer = %self.peer(), reason = code.as_str(), "request failed");
        let reply = codec::encode_reply(code, &Address::unspecified());
        let sent = self.send(&reply).await;
        self.close().await;
        sent
    }

    // =========
    // HELPERS
    // =========

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(&next) {
            error!(from = %self.state, to = %next, "refusing backward state transition");
            return;
        }
        debug!(peer = %self.peer(), from = %self.state, to = %next, "state transition");
        self.state = next;
        self.state_entered = Instant::now();
    }

    /// close moves to Closed, drops the upstream and shuts the client
    /// write side. Calling it again is a no-op.
    async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.transition(ConnectionState::Closed);
        self.buffer.clear();
        self.upstream = None;
        let _ = self.client.shutdown().await;
    }

    /// send writes a reply to the client; a failed write closes the
    /// connection
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let written = async {
            self.client.write_all(bytes).await?;
            self.client.flush().await
        }
        .await;

        if let Err(e) = written {
            self.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// forward passes opaque payload to the upstream while Connected
    async fn forward(&mut self, data: &[u8]) -> Result<()> {
        let Some(upstream) = self.upstream.as_mut() else {
            return Ok(());
        };
        if let Err(e) = upstream.write_all(data).await {
            self.close().await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// connect_upstream resolves the target and tries each address in turn,
/// returning the last error if none accepts
async fn connect_upstream(target: &Address) -> io::Result<TcpStream> {
    let addrs = target
        .resolve()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::HostUnreachable, e))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::HostUnreachable, format!("could not resolve {target}"))
    }))
}
