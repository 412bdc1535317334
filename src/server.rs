use crate::auth::{AuthRegistry, AuthResult};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Timeouts};
use crate::error::ConfigError;
use anyhow::{Result, anyhow, bail};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Socks5Server accepts client connections and runs one Dispatcher task
/// per connection. The AuthRegistry is built once and shared read-only.
pub struct Socks5Server {
    pub listen_addr: String,
    registry: Arc<AuthRegistry>,
    timeouts: Timeouts,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new fails fast when the registry has no methods
    pub fn new(listen_addr: impl Into<String>, registry: AuthRegistry) -> Result<Self, ConfigError> {
        if registry.is_empty() {
            return Err(ConfigError::NoAuthMethodsConfigured);
        }

        Ok(Self {
            listen_addr: listen_addr.into(),
            registry: Arc::new(registry),
            timeouts: Timeouts::default(),
            listener: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let registry = config.build_registry()?;
        Ok(Self::new(config.listen.clone(), registry)?.with_timeouts(config.timeouts()))
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn registry(&self) -> &AuthRegistry {
        &self.registry
    }

    /// auth runs a complete authentication for the given method code and
    /// credential bytes, independent of any socket
    pub async fn auth(&self, method_code: u8, credentials: &[u8]) -> bool {
        matches!(
            self.registry.authenticate(method_code, credentials).await,
            AuthResult::Accepted
        )
    }

    /// bind to the listen address; may only be called once
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!(methods = ?self.registry, "SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections forever
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// run_until accepts connections until shutdown resolves. Connections
    /// already in flight keep running on their own tasks.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("listener missing after bind"))?;

        tokio::pin!(shutdown);

        // Listen for connections to proxy
        loop {
            let (inbound, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down SOCKS5 proxy");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        error!("accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            // Clone for this connection
            let registry = Arc::clone(&self.registry);
            let timeouts = self.timeouts;

            // Spawn async task
            tokio::spawn(async move {
                info!(event = "connection_opened", peer = %peer_addr, "new client");

                if let Err(e) = inbound.set_nodelay(true) {
                    debug!("failed to set TCP_NODELAY: {}", e);
                }

                let mut dispatcher =
                    Dispatcher::new(inbound, registry, timeouts).with_peer(peer_addr);
                if let Err(e) = dispatcher.run().await {
                    error!(peer = %peer_addr, "connection error: {}", e);
                }
            });
        }
    }
}
