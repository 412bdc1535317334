use crate::error::{ConfigError, DecodeError};
use crate::protocol::{AuthCode, AuthStatus, USERPASS_VERSION};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// AuthResult is the outcome of one sub-negotiation round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Accepted,
    Rejected(String),
    /// The round completed but the method expects another message
    NeedMoreData,
}

/// AuthMethod is a pluggable authentication backend selected during
/// method negotiation.
///
/// The dispatcher frames sub-negotiation messages with `frame_len`,
/// passes each complete one to `authenticate`, and writes whatever
/// `response` returns back to the client.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// METHOD code advertised in the greeting
    fn code(&self) -> u8;

    fn name(&self) -> &str;

    /// frame_len returns the length of the sub-negotiation message at the
    /// start of buf, or None until enough bytes have arrived. Methods
    /// without a sub-negotiation return Some(0). An error means the bytes
    /// can never form a valid message.
    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError>;

    async fn authenticate(&self, payload: &[u8]) -> AuthResult;

    /// response is the status message sent to the client after a round
    fn response(&self, _result: &AuthResult) -> Option<Vec<u8>> {
        None
    }
}

impl fmt::Debug for dyn AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.code())
    }
}

// ================
// NO AUTHENTICATION
// ================

/// NoAuth accepts every client without a sub-negotiation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthMethod for NoAuth {
    fn code(&self) -> u8 {
        AuthCode::NoAuth as u8
    }

    fn name(&self) -> &str {
        "none"
    }

    fn frame_len(&self, _buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        Ok(Some(0))
    }

    async fn authenticate(&self, _payload: &[u8]) -> AuthResult {
        AuthResult::Accepted
    }
}

// ==================
// USERNAME/PASSWORD
// ==================

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// UserPassAuth implements username/password authentication (RFC 1929)
/// against a fixed set of accounts
#[derive(Debug, Clone)]
pub struct UserPassAuth {
    users: Vec<UserPass>,
}

impl UserPassAuth {
    pub fn new(users: Vec<UserPass>) -> Self {
        Self { users }
    }

    /// verify compares against every account so timing does not reveal
    /// which username exists
    fn verify(&self, creds: &UserPass) -> bool {
        self.users.iter().fold(false, |found, user| {
            let user_ok = constant_time_eq(user.username.as_bytes(), creds.username.as_bytes());
            let pass_ok = constant_time_eq(user.password.as_bytes(), creds.password.as_bytes());
            found | (user_ok & pass_ok)
        })
    }
}

#[async_trait]
impl AuthMethod for UserPassAuth {
    fn code(&self) -> u8 {
        AuthCode::UserPass as u8
    }

    fn name(&self) -> &str {
        "userpass"
    }

    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        match buf.first() {
            Some(&version) if version != USERPASS_VERSION => Err(DecodeError::MalformedMessage),
            _ => Ok(credentials_len(buf)),
        }
    }

    async fn authenticate(&self, payload: &[u8]) -> AuthResult {
        match decode_credentials(payload) {
            Ok(creds) if self.verify(&creds) => AuthResult::Accepted,
            Ok(creds) => AuthResult::Rejected(format!("invalid credentials for '{}'", creds.username)),
            Err(e) => AuthResult::Rejected(e.to_string()),
        }
    }

    fn response(&self, result: &AuthResult) -> Option<Vec<u8>> {
        // Username/Password Server response
        // +----+--------+
        // |VER | STATUS |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        let status = match result {
            AuthResult::Accepted => AuthStatus::Success,
            _ => AuthStatus::Failure,
        };
        Some(vec![USERPASS_VERSION, status as u8])
    }
}

// Client Username/Password Request
// +----+------+----------+------+----------+
// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
// +----+------+----------+------+----------+
// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
// +----+------+----------+------+----------+

/// credentials_len returns the full length of the username/password
/// request at the start of buf, or None while it is incomplete
pub fn credentials_len(buf: &[u8]) -> Option<usize> {
    let ulen = *buf.get(1)? as usize;
    let plen = *buf.get(2 + ulen)? as usize;
    Some(3 + ulen + plen)
}

pub fn decode_credentials(buf: &[u8]) -> Result<UserPass, DecodeError> {
    let len = credentials_len(buf).ok_or(DecodeError::MalformedMessage)?;
    if len != buf.len() || buf[0] != USERPASS_VERSION {
        return Err(DecodeError::MalformedMessage);
    }

    let ulen = buf[1] as usize;
    let username = std::str::from_utf8(&buf[2..2 + ulen]).map_err(|_| DecodeError::MalformedMessage)?;
    let password =
        std::str::from_utf8(&buf[3 + ulen..]).map_err(|_| DecodeError::MalformedMessage)?;

    Ok(UserPass {
        username: username.to_string(),
        password: password.to_string(),
    })
}

pub fn encode_credentials(username: &str, password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(USERPASS_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    buf
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// =============
// REGISTRY
// =============

/// AuthRegistry holds the enabled methods in preference order. It is
/// built once at startup and only read afterwards.
#[derive(Default)]
pub struct AuthRegistry {
    methods: Vec<Arc<dyn AuthMethod>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register appends a method; registration order is preference order
    pub fn register<M: AuthMethod + 'static>(&mut self, method: M) -> Result<(), ConfigError> {
        self.register_shared(Arc::new(method))
    }

    pub fn register_shared(&mut self, method: Arc<dyn AuthMethod>) -> Result<(), ConfigError> {
        if self.get(method.code()).is_some() {
            return Err(ConfigError::DuplicateMethodCode(method.code()));
        }
        self.methods.push(method);
        Ok(())
    }

    /// select returns the first registered method whose code the client
    /// offered
    pub fn select(&self, offered: &[u8]) -> Option<Arc<dyn AuthMethod>> {
        self.methods
            .iter()
            .find(|method| offered.contains(&method.code()))
            .cloned()
    }

    pub fn get(&self, code: u8) -> Option<&Arc<dyn AuthMethod>> {
        self.methods.iter().find(|method| method.code() == code)
    }

    /// authenticate runs one sub-negotiation round for the method with the
    /// given code. Unknown codes are rejected.
    pub async fn authenticate(&self, code: u8, payload: &[u8]) -> AuthResult {
        match self.get(code) {
            Some(method) => method.authenticate(payload).await,
            None => AuthResult::Rejected(format!("method {code:#04x} is not enabled")),
        }
    }

    pub fn codes(&self) -> Vec<u8> {
        self.methods.iter().map(|method| method.code()).collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Private-range method used to exercise preference ordering
    struct Dummy(u8);

    #[async_trait]
    impl AuthMethod for Dummy {
        fn code(&self) -> u8 {
            self.0
        }

        fn name(&self) -> &str {
            "dummy"
        }

        fn frame_len(&self, _buf: &[u8]) -> Result<Option<usize>, DecodeError> {
            Ok(Some(0))
        }

        async fn authenticate(&self, _payload: &[u8]) -> AuthResult {
            AuthResult::Rejected("dummy".into())
        }
    }

    fn userpass() -> UserPassAuth {
        UserPassAuth::new(vec![UserPass {
            username: "user".into(),
            password: "pass".into(),
        }])
    }

    #[test]
    fn test_register_duplicate_code() {
        let mut registry = AuthRegistry::new();
        registry.register(NoAuth).unwrap();
        assert!(matches!(
            registry.register(NoAuth),
            Err(ConfigError::DuplicateMethodCode(0x00))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_select_prefers_registration_order() {
        let mut registry = AuthRegistry::new();
        registry.register(Dummy(0x80)).unwrap();
        registry.register(userpass()).unwrap();
        registry.register(NoAuth).unwrap();

        // Client order does not matter, registry order does
        let chosen = registry.select(&[0x00, 0x02]).unwrap();
        assert_eq!(chosen.code(), 0x02);

        let chosen = registry.select(&[0x00, 0x80, 0x02]).unwrap();
        assert_eq!(chosen.code(), 0x80);

        let chosen = registry.select(&[0x00]).unwrap();
        assert_eq!(chosen.code(), 0x00);

        assert!(registry.select(&[0x01, 0x03]).is_none());
        assert!(registry.select(&[]).is_none());
    }

    #[test]
    fn test_select_exhaustive_small_sets() {
        let registered = [0x02u8, 0x00, 0x81];
        let mut registry = AuthRegistry::new();
        registry.register(userpass()).unwrap();
        registry.register(NoAuth).unwrap();
        registry.register(Dummy(0x81)).unwrap();

        let universe = [0x00u8, 0x01, 0x02, 0x81];
        for mask in 1u8..16 {
            let offered: Vec<u8> = universe
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, code)| *code)
                .collect();
            let expected = registered.iter().copied().find(|c| offered.contains(c));
            assert_eq!(registry.select(&offered).map(|m| m.code()), expected);
        }
    }

    #[test]
    fn test_credentials_len() {
        let creds = encode_credentials("user", "pass");
        // PLEN sits at index 6, so the length is known from 7 bytes on
        for cut in 0..7 {
            assert_eq!(credentials_len(&creds[..cut]), None);
        }
        for cut in 7..=creds.len() {
            assert_eq!(credentials_len(&creds[..cut]), Some(creds.len()));
        }
    }

    #[test]
    fn test_userpass_frame_len() {
        let auth = userpass();
        let creds = encode_credentials("user", "pass");
        assert_eq!(auth.frame_len(&[]), Ok(None));
        assert_eq!(auth.frame_len(&creds[..3]), Ok(None));
        assert_eq!(auth.frame_len(&creds), Ok(Some(creds.len())));

        // Wrong sub-negotiation version is rejected on the first byte
        assert_eq!(auth.frame_len(&[0x05]), Err(DecodeError::MalformedMessage));
    }

    #[test]
    fn test_decode_credentials() {
        let creds = decode_credentials(&encode_credentials("user", "pass")).unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "pass");

        let mut bad_version = encode_credentials("user", "pass");
        bad_version[0] = 0x05;
        assert_eq!(decode_credentials(&bad_version), Err(DecodeError::MalformedMessage));
        assert_eq!(decode_credentials(&[1, 4, b'u']), Err(DecodeError::MalformedMessage));
    }

    #[tokio::test]
    async fn test_userpass_authenticate() {
        let auth = userpass();
        let accepted = auth.authenticate(&encode_credentials("user", "pass")).await;
        assert_eq!(accepted, AuthResult::Accepted);
        assert_eq!(auth.response(&accepted), Some(vec![0x01, 0x00]));

        let rejected = auth.authenticate(&encode_credentials("user", "nope")).await;
        assert!(matches!(rejected, AuthResult::Rejected(_)));
        assert_eq!(auth.response(&rejected), Some(vec![0x01, 0x01]));

        let unknown = auth.authenticate(&encode_credentials("someone", "pass")).await;
        assert!(matches!(unknown, AuthResult::Rejected(_)));
    }

    #[tokio::test]
    async fn test_registry_authenticate() {
        let mut registry = AuthRegistry::new();
        registry.register(userpass()).unwrap();

        let ok = registry.authenticate(0x02, &encode_credentials("user", "pass")).await;
        assert_eq!(ok, AuthResult::Accepted);

        // Method not enabled
        let missing = registry.authenticate(0x00, &[]).await;
        assert!(matches!(missing, AuthResult::Rejected(_)));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }
}
