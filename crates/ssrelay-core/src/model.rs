//! Relay data model shared by the registry, controller, prober and CLI.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::link::RelayLink;

/// Cipher identifier every relay created by this system uses.
pub const DEFAULT_CIPHER: &str = "chacha20-ietf-poly1305";

/// Shadowsocks cipher identifier.
///
/// Relays created here always use [`Cipher::Chacha20IetfPoly1305`]; decoded
/// links keep whatever identifier they carried so they re-encode unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Cipher {
    #[default]
    Chacha20IetfPoly1305,
    Other(String),
}

impl Cipher {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chacha20IetfPoly1305 => DEFAULT_CIPHER,
            Self::Other(method) => method,
        }
    }
}

impl From<&str> for Cipher {
    fn from(method: &str) -> Self {
        if method == DEFAULT_CIPHER {
            Self::Chacha20IetfPoly1305
        } else {
            Self::Other(method.to_string())
        }
    }
}

impl From<String> for Cipher {
    fn from(method: String) -> Self {
        if method == DEFAULT_CIPHER {
            Self::Chacha20IetfPoly1305
        } else {
            Self::Other(method)
        }
    }
}

impl From<Cipher> for String {
    fn from(cipher: Cipher) -> Self {
        match cipher {
            Cipher::Chacha20IetfPoly1305 => DEFAULT_CIPHER.to_string(),
            Cipher::Other(method) => method,
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method + secret pair a client needs to talk to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredential {
    pub method: Cipher,
    pub secret: String,
}

impl RelayCredential {
    pub fn new(method: impl Into<Cipher>, secret: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            secret: secret.into(),
        }
    }

    /// Fresh credential with the default cipher and a random 16-character secret.
    pub fn generate() -> Self {
        Self::new(Cipher::default(), crate::secret::generate_secret(16))
    }
}

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Check that the endpoint can be embedded in a link and parsed back.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidInput("host must not be empty".into()));
        }
        if let Some(c) = self
            .host
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '@' | '#' | '/'))
        {
            return Err(Error::InvalidInput(format!(
                "host {:?} contains forbidden character {c:?}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(Error::InvalidInput("port must be in 1-65535".into()));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Username/password for the SOCKS5 backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAuth {
    pub user: String,
    pub pass: String,
}

/// Parse a backend address of the form `ip:port` or `ip:port:user:pass`.
///
/// Auth is only kept when both user and pass are non-empty.
pub fn parse_backend(input: &str) -> Result<(Endpoint, Option<BackendAuth>)> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.len() < 2 {
        return Err(Error::InvalidInput(format!(
            "backend {input:?} must look like IP:PORT or IP:PORT:USER:PASS"
        )));
    }
    let port: u16 = parts[1]
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            Error::InvalidInput(format!("backend port {:?} must be in 1-65535", parts[1]))
        })?;
    let endpoint = Endpoint::new(parts[0], port);
    endpoint.validate()?;

    let user = parts.get(2).copied().unwrap_or_default();
    let pass = parts.get(3).copied().unwrap_or_default();
    let auth = (!user.is_empty() && !pass.is_empty()).then(|| BackendAuth {
        user: user.to_string(),
        pass: pass.to_string(),
    });
    Ok((endpoint, auth))
}

/// Reported state of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Running,
    Expired,
    Missing,
    SoftDeleted,
}

impl LifecycleState {
    /// Apply the expiry override to a liveness-derived state.
    ///
    /// Expiry supersedes `Running`/`Stopped` but never `Missing` or
    /// `SoftDeleted`. It is a reporting override only.
    pub const fn with_expiry(self, expires_at: Option<u64>, now: u64) -> Self {
        match (self, expires_at) {
            (Self::Running | Self::Stopped, Some(at)) if at != 0 && now > at => Self::Expired,
            (state, _) => state,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Expired => "expired",
            Self::Missing => "missing",
            Self::SoftDeleted => "soft_deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the registry knows about one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub port: u16,
    pub label: String,
    pub backend: Endpoint,
    pub backend_auth: Option<BackendAuth>,
    pub credential: RelayCredential,
    pub created_at: u64,
    /// `None` means the relay never expires.
    pub expires_at: Option<u64>,
    pub lifecycle_state: LifecycleState,
    pub soft_deleted_at: Option<u64>,
}

impl RelayRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at != 0 && now > at)
    }

    /// Link a client can import, advertising `public_host` as the server.
    pub fn link(&self, public_host: &str) -> RelayLink {
        RelayLink {
            credential: self.credential.clone(),
            endpoint: Endpoint::new(public_host, self.port),
            label: self.label.clone(),
        }
    }
}

/// Returns the current time as a Unix timestamp (seconds since epoch).
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
