use crate::auth::{AuthRegistry, NoAuth, UserPass, UserPassAuth};
use crate::dispatcher::Timeouts;
use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// AuthConfig is one entry of the `[[auth]]` list. The order of entries
/// is the server's method preference order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method")]
pub enum AuthConfig {
    #[serde(rename = "none")]
    NoAuth,
    #[serde(rename = "userpass")]
    UserPass { users: Vec<UserPass> },
}

/// Config holds the server's listen address, timeouts and enabled
/// authentication methods
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: String,
    /// Seconds a connection may spend in any one negotiation state
    pub handshake_timeout: u64,
    /// Seconds allowed for resolving and connecting to the target
    pub connect_timeout: u64,
    pub auth: Vec<AuthConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1080".to_string(),
            handshake_timeout: 10,
            connect_timeout: 10,
            auth: vec![AuthConfig::NoAuth],
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_secs(self.handshake_timeout),
            connect: Duration::from_secs(self.connect_timeout),
        }
    }

    /// build_registry turns the auth list into an AuthRegistry, failing
    /// when it would be empty or contain the same method twice
    pub fn build_registry(&self) -> Result<AuthRegistry, ConfigError> {
        let mut registry = AuthRegistry::new();

        for entry in &self.auth {
            match entry {
                AuthConfig::NoAuth => registry.register(NoAuth)?,
                AuthConfig::UserPass { users } => {
                    validate_users(users)?;
                    registry.register(UserPassAuth::new(users.clone()))?
                }
            }
        }

        if registry.is_empty() {
            return Err(ConfigError::NoAuthMethodsConfigured);
        }
        Ok(registry)
    }
}

/// RFC 1929 fields are 1 to 255 bytes long
fn validate_users(users: &[UserPass]) -> Result<(), ConfigError> {
    if users.is_empty() {
        return Err(ConfigError::InvalidCredentials(
            "userpass method needs at least one user".to_string(),
        ));
    }
    for user in users {
        let fits = |s: &str| (1..=255).contains(&s.len());
        if !fits(&user.username) || !fits(&user.password) {
            return Err(ConfigError::InvalidCredentials(format!(
                "username and password for '{}' must be 1 to 255 bytes",
                user.username
            )));
        }
    }
    Ok(())
}
