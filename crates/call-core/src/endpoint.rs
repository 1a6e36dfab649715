//! Addressable SIP parties
//!
//! An [`Endpoint`] is the `user@host:port` triple used both for the local
//! identity and for the remote target of a call. It is immutable once built
//! and validated on construction, so every endpoint that exists can be put
//! on the wire.

use std::fmt;
use std::str::FromStr;

use rvoip_sip_core::types::address::Address;
use rvoip_sip_core::types::uri::{Scheme, Uri};
use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};

/// Default SIP port used when a URI omits one
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// A SIP endpoint: user identifier, host and port
///
/// # Examples
///
/// ```rust
/// use sipdial_call_core::Endpoint;
///
/// let target = Endpoint::new("08821670000", "100.81.118.20", 5080).unwrap();
/// assert_eq!(target.to_string(), "sip:08821670000@100.81.118.20:5080");
///
/// let parsed: Endpoint = "sip:08821670000@100.81.118.20:5080".parse().unwrap();
/// assert_eq!(parsed, target);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawEndpoint", into = "RawEndpoint")]
pub struct Endpoint {
    user: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a validated endpoint
    ///
    /// The user part may be empty (a bare `host:port` endpoint). The host
    /// must not be empty and the port must be in 1-65535.
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u32) -> CallResult<Self> {
        let user = user.into();
        let host = host.into();

        if host.trim().is_empty() {
            return Err(CallError::invalid_endpoint("host must not be empty"));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '@' || c == '<' || c == '>') {
            return Err(CallError::invalid_endpoint(format!("malformed host '{}'", host)));
        }
        if user.chars().any(|c| c.is_whitespace() || c == '@' || c == ':') {
            return Err(CallError::invalid_endpoint(format!("malformed user '{}'", user)));
        }
        let port = match u16::try_from(port) {
            Ok(port) if port != 0 => port,
            _ => {
                return Err(CallError::invalid_endpoint(format!(
                    "port {} outside 1-65535",
                    port
                )))
            }
        };

        Ok(Self { user, host, port })
    }

    /// Create an endpoint without a user part
    pub fn host_port(host: impl Into<String>, port: u32) -> CallResult<Self> {
        Self::new("", host, port)
    }

    /// User identifier (may be empty)
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Copy of this endpoint with a different user part
    pub fn with_user(&self, user: impl Into<String>) -> CallResult<Self> {
        Self::new(user, self.host.clone(), u32::from(self.port))
    }

    /// Whether two endpoints share host and port, ignoring the user part
    pub fn same_address(&self, other: &Endpoint) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }

    /// `host:port`, suitable for address resolution
    pub fn socket_string(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "sip:{}", self.socket_string())
        } else {
            write!(f, "sip:{}@{}", self.user, self.socket_string())
        }
    }
}

impl FromStr for Endpoint {
    type Err = CallError;

    /// Parse `sip:user@host:port`, tolerating angle brackets, URI parameters
    /// and a missing scheme or port.
    fn from_str(s: &str) -> CallResult<Self> {
        let trimmed = s.trim();
        let parsed = if trimmed.contains('<') {
            Address::from_str(trimmed).map(|address| address.uri)
        } else if has_sip_scheme(trimmed) {
            Uri::from_str(trimmed)
        } else {
            Uri::from_str(&format!("sip:{}", trimmed))
        };

        let uri = parsed.map_err(|e| CallError::invalid_endpoint(format!("malformed SIP URI '{}': {}", trimmed, e)))?;
        Endpoint::try_from(&uri)
    }
}

impl TryFrom<&Uri> for Endpoint {
    type Error = CallError;

    fn try_from(uri: &Uri) -> CallResult<Self> {
        if !matches!(uri.scheme, Scheme::Sip | Scheme::Sips) {
            return Err(CallError::invalid_endpoint(format!("unsupported URI scheme in '{}'", uri)));
        }
        let port = uri.port.map(u32::from).unwrap_or(u32::from(DEFAULT_SIP_PORT));
        Endpoint::new(uri.user.clone().unwrap_or_default(), uri.host.to_string(), port)
    }
}

fn has_sip_scheme(s: &str) -> bool {
    let lower = s.get(..5).unwrap_or(s).to_ascii_lowercase();
    lower.starts_with("sip:") || lower.starts_with("sips:")
}

/// Serde mirror of [`Endpoint`] so deserialised endpoints go through validation
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEndpoint {
    #[serde(default)]
    user: String,
    host: String,
    port: u32,
}

impl TryFrom<RawEndpoint> for Endpoint {
    type Error = CallError;

    fn try_from(raw: RawEndpoint) -> CallResult<Self> {
        Endpoint::new(raw.user, raw.host, raw.port)
    }
}

impl From<Endpoint> for RawEndpoint {
    fn from(endpoint: Endpoint) -> Self {
        RawEndpoint {
            user: endpoint.user,
            host: endpoint.host,
            port: u32::from(endpoint.port),
        }
    }
}
