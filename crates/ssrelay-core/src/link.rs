//! `ss://` link codec.
//!
//! Wire format: `ss://BASE64(method:secret)@host:port[#percent-encoded-label]`.
//!
//! Decoding tolerates the variants seen in the wild: missing Base64 padding,
//! a trailing `/` before the label, and secrets containing `:` or `@`.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Endpoint, RelayCredential};

/// Scheme prefix every link starts with.
pub const SCHEME: &str = "ss://";

/// Characters escaped in labels: everything but ASCII alphanumerics and `-._~/`.
const LABEL_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// A decoded (or to-be-encoded) relay link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayLink {
    pub credential: RelayCredential,
    pub endpoint: Endpoint,
    /// Display name; empty when the link carries none.
    pub label: String,
}

impl RelayLink {
    pub fn new(credential: RelayCredential, endpoint: Endpoint, label: impl Into<String>) -> Self {
        Self {
            credential,
            endpoint,
            label: label.into(),
        }
    }

    pub fn encode(&self) -> String {
        encode(&self.credential, &self.endpoint, &self.label)
    }
}

impl fmt::Display for RelayLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for RelayLink {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Reasons a link fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link does not start with {SCHEME}")]
    MissingScheme,

    #[error("link has no '@' between credentials and server")]
    MissingSeparator,

    #[error("link has more than one '@' separator")]
    ExtraSeparator,

    #[error("credential segment is not valid Base64: {0}")]
    InvalidBase64(String),

    #[error("credential segment is not valid UTF-8")]
    InvalidUtf8,

    #[error("credential segment has no ':' between method and secret")]
    MissingMethod,

    #[error("server segment has no ':' before the port")]
    MissingPort,

    #[error("server host is empty")]
    EmptyHost,

    #[error("invalid port {0:?}: must be an integer in 1-65535")]
    InvalidPort(String),
}

impl LinkError {
    /// Short machine-classifiable reason.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingScheme => "missing_scheme",
            Self::MissingSeparator => "missing_separator",
            Self::ExtraSeparator => "extra_separator",
            Self::InvalidBase64(_) => "invalid_base64",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MissingMethod => "missing_method",
            Self::MissingPort => "missing_port",
            Self::EmptyHost => "empty_host",
            Self::InvalidPort(_) => "invalid_port",
        }
    }
}

/// Build a link from its parts. An empty label is omitted.
pub fn encode(credential: &RelayCredential, endpoint: &Endpoint, label: &str) -> String {
    let authority = format!("{}:{}", credential.method, credential.secret);
    let mut link = format!(
        "{SCHEME}{}@{}:{}",
        STANDARD.encode(authority.as_bytes()),
        endpoint.host,
        endpoint.port
    );
    if !label.is_empty() {
        link.push('#');
        link.extend(utf8_percent_encode(label, LABEL_ESCAPE));
    }
    link
}

/// Parse a link back into its parts.
pub fn decode(input: &str) -> Result<RelayLink, LinkError> {
    let rest = input.strip_prefix(SCHEME).ok_or(LinkError::MissingScheme)?;

    let (body, label) = match rest.split_once('#') {
        Some((body, raw_label)) => (
            body,
            percent_decode_str(raw_label).decode_utf8_lossy().into_owned(),
        ),
        None => (rest, String::new()),
    };
    let body = body.strip_suffix('/').unwrap_or(body);

    let (authority, server) = body.split_once('@').ok_or(LinkError::MissingSeparator)?;
    if server.contains('@') {
        return Err(LinkError::ExtraSeparator);
    }

    let decoded = decode_authority(authority)?;
    let (method, secret) = decoded.split_once(':').ok_or(LinkError::MissingMethod)?;

    let (host, port) = server.rsplit_once(':').ok_or(LinkError::MissingPort)?;
    if host.is_empty() {
        return Err(LinkError::EmptyHost);
    }
    let port = parse_port(port)?;

    Ok(RelayLink {
        credential: RelayCredential::new(method, secret),
        endpoint: Endpoint::new(host, port),
        label,
    })
}

/// Decode the Base64 authority, retrying once with padding restored.
fn decode_authority(segment: &str) -> Result<String, LinkError> {
    let bytes = match STANDARD.decode(segment) {
        Ok(bytes) => bytes,
        Err(_) => {
            let missing = (4 - segment.len() % 4) % 4;
            let padded = format!("{segment}{}", "=".repeat(missing));
            STANDARD
                .decode(padded)
                .map_err(|e| LinkError::InvalidBase64(e.to_string()))?
        }
    };
    String::from_utf8(bytes).map_err(|_| LinkError::InvalidUtf8)
}

fn parse_port(raw: &str) -> Result<u16, LinkError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LinkError::InvalidPort(raw.to_string()));
    }
    raw.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| LinkError::InvalidPort(raw.to_string()))
}
