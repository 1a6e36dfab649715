//! Configuration for an outbound call
//!
//! Everything the core needs is an explicit input. The only fallbacks are
//! the documented defaults below.
//!
//! # Defaults
//!
//! - **Call timeout**: 60 seconds ([`DEFAULT_CALL_TIMEOUT`])
//! - **Hold duration**: 30 seconds ([`DEFAULT_HOLD_DURATION`])
//! - **Abandoned INVITE linger**: 32 seconds ([`DEFAULT_CANCEL_LINGER`])
//! - **Protocol**: UDP
//! - **User agent**: `sipdial/<version>`
//!
//! # Example
//!
//! ```rust
//! use sipdial_call_core::CallConfig;
//!
//! let config = CallConfig::from_toml_str(r#"
//!     [transport]
//!     bind_host = "100.73.40.116"
//!     bind_port = 5081
//!     rewrite_contact = true
//!     external_host = "100.73.40.116"
//!     external_port = 5081
//!
//!     [call]
//!     target = { user = "08821670000", host = "100.81.118.20", port = 5080 }
//!     display_name = "Empresa XYZ"
//!     caller_id = "4833800000"
//! "#).unwrap();
//!
//! assert_eq!(config.call.timeout().as_secs(), 60);
//! assert_eq!(config.call.hold().as_secs(), 30);
//! assert_eq!(config.transport.advertised_endpoint().unwrap().to_string(), "sip:100.73.40.116:5081");
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{CallError, CallResult};
use crate::request::{CallIdentity, Header};

/// Setup timeout used when none is configured
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Hold duration used when none is configured
pub const DEFAULT_HOLD_DURATION: Duration = Duration::from_secs(30);

/// How long a cancelled INVITE stays tracked for a late final response
///
/// 64 * T1, the INVITE client transaction timeout.
pub const DEFAULT_CANCEL_LINGER: Duration = Duration::from_secs(32);

/// User agent string sent by the UDP transport
pub const DEFAULT_USER_AGENT: &str = concat!("sipdial/", env!("CARGO_PKG_VERSION"));

/// Signalling transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Udp,
}

/// Local binding and address rewriting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Address to bind the signalling socket to
    pub bind_host: String,
    /// Port to bind to; 0 lets the OS choose
    pub bind_port: u16,
    /// Write the external address into Contact and Via
    #[serde(default)]
    pub rewrite_contact: bool,
    #[serde(default)]
    pub external_host: Option<String>,
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Milliseconds a cancelled INVITE is kept to ACK and hang up a late 2xx
    #[serde(default = "default_cancel_linger_ms")]
    pub cancel_linger_ms: u64,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_cancel_linger_ms() -> u64 {
    DEFAULT_CANCEL_LINGER.as_millis() as u64
}

impl TransportConfig {
    pub fn new(bind_host: impl Into<String>, bind_port: u16) -> Self {
        Self {
            protocol: TransportProtocol::Udp,
            bind_host: bind_host.into(),
            bind_port,
            rewrite_contact: false,
            external_host: None,
            external_port: None,
            user_agent: default_user_agent(),
            cancel_linger_ms: default_cancel_linger_ms(),
        }
    }

    /// Advertise `host:port` instead of the bind address
    pub fn with_external(mut self, host: impl Into<String>, port: u16) -> Self {
        self.rewrite_contact = true;
        self.external_host = Some(host.into());
        self.external_port = Some(port);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_cancel_linger(mut self, linger: Duration) -> Self {
        self.cancel_linger_ms = linger.as_millis() as u64;
        self
    }

    pub fn cancel_linger(&self) -> Duration {
        Duration::from_millis(self.cancel_linger_ms)
    }

    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        if self.bind_host.contains(':') && !self.bind_host.starts_with('[') {
            format!("[{}]:{}", self.bind_host, self.bind_port)
        } else {
            format!("{}:{}", self.bind_host, self.bind_port)
        }
    }

    /// Endpoint written into Contact/Via and used as the From address
    ///
    /// With rewriting on, the external host/port (each falling back to the
    /// bind value); otherwise the bind address. Fails when the resulting
    /// port is 0; use the bound transport's endpoint in that case.
    pub fn advertised_endpoint(&self) -> CallResult<Endpoint> {
        self.advertised_endpoint_with_port(self.bind_port)
    }

    /// Same as [`advertised_endpoint`](Self::advertised_endpoint) with the
    /// actually bound port standing in for the configured one.
    pub fn advertised_endpoint_with_port(&self, bound_port: u16) -> CallResult<Endpoint> {
        if self.rewrite_contact {
            let host = self.external_host.as_deref().unwrap_or(&self.bind_host);
            let port = self.external_port.unwrap_or(bound_port);
            Endpoint::host_port(host, u32::from(port))
        } else {
            Endpoint::host_port(self.bind_host.as_str(), u32::from(bound_port))
        }
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.bind_host.trim().is_empty() {
            return Err(CallError::config("transport.bind_host must not be empty"));
        }
        if self.rewrite_contact {
            if let Some(host) = &self.external_host {
                if host.trim().is_empty() {
                    return Err(CallError::config("transport.external_host must not be empty"));
                }
            }
            if self.external_port == Some(0) {
                return Err(CallError::config("transport.external_port must be in 1-65535"));
            }
        }
        if self.user_agent.contains('\r') || self.user_agent.contains('\n') {
            return Err(CallError::config("transport.user_agent contains a line break"));
        }
        Ok(())
    }
}

/// What to call and who is calling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSettings {
    pub target: Endpoint,
    #[serde(default)]
    pub display_name: String,
    pub caller_id: String,
    /// Milliseconds to wait for a final response
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Milliseconds an answered call is kept up
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    #[serde(default)]
    pub headers: Vec<Header>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_millis() as u64
}

fn default_hold_ms() -> u64 {
    DEFAULT_HOLD_DURATION.as_millis() as u64
}

impl CallSettings {
    pub fn new(target: Endpoint, display_name: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            target,
            display_name: display_name.into(),
            caller_id: caller_id.into(),
            timeout_ms: default_timeout_ms(),
            hold_ms: default_hold_ms(),
            headers: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold_ms = hold.as_millis() as u64;
        self
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn identity(&self) -> CallIdentity {
        CallIdentity {
            display_name: self.display_name.clone(),
            caller_id: self.caller_id.clone(),
            extra_headers: self.headers.clone(),
        }
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.timeout_ms == 0 {
            return Err(CallError::config("call.timeout_ms must be greater than zero"));
        }
        if self.caller_id.trim().is_empty() {
            return Err(CallError::config("call.caller_id must not be empty"));
        }
        for header in &self.headers {
            Header::new(header.name.as_str(), header.value.as_str())?;
        }
        Ok(())
    }
}

/// Complete configuration for one `sipdial` run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConfig {
    pub transport: TransportConfig,
    pub call: CallSettings,
}

impl CallConfig {
    pub fn new(transport: TransportConfig, call: CallSettings) -> Self {
        Self { transport, call }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> CallResult<Self> {
        let config: CallConfig =
            toml::from_str(s).map_err(|e| CallError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> CallResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CallError::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> CallResult<()> {
        self.transport.validate()?;
        self.call.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Endpoint {
        Endpoint::new("08821670000", "100.81.118.20", 5080).unwrap()
    }

    #[test]
    fn test_defaults_are_explicit() {
        let settings = CallSettings::new(target(), "Empresa XYZ", "4833800000");
        assert_eq!(settings.timeout(), DEFAULT_CALL_TIMEOUT);
        assert_eq!(settings.hold(), DEFAULT_HOLD_DURATION);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let settings = CallSettings::new(target(), "A", "1").with_timeout(Duration::ZERO);
        assert!(matches!(settings.validate(), Err(CallError::Configuration { .. })));
    }

    #[test]
    fn test_sub_second_durations_survive() {
        let settings = CallSettings::new(target(), "A", "1")
            .with_timeout(Duration::from_millis(500))
            .with_hold(Duration::from_millis(1500));
        assert_eq!(settings.timeout(), Duration::from_millis(500));
        assert_eq!(settings.hold(), Duration::from_millis(1500));
        assert!(settings.validate().is_ok());

        let linger = TransportConfig::new("127.0.0.1", 0).with_cancel_linger(Duration::from_millis(250));
        assert_eq!(linger.cancel_linger(), Duration::from_millis(250));
    }

    #[test]
    fn test_advertised_endpoint() {
        let plain = TransportConfig::new("10.0.0.5", 5081);
        assert_eq!(plain.advertised_endpoint().unwrap().socket_string(), "10.0.0.5:5081");

        let rewritten = TransportConfig::new("0.0.0.0", 5081).with_external("203.0.113.7", 15081);
        assert_eq!(rewritten.advertised_endpoint().unwrap().socket_string(), "203.0.113.7:15081");

        let ephemeral = TransportConfig::new("127.0.0.1", 0);
        assert!(ephemeral.advertised_endpoint().is_err());
        assert_eq!(
            ephemeral.advertised_endpoint_with_port(40000).unwrap().socket_string(),
            "127.0.0.1:40000"
        );
    }

    #[test]
    fn test_toml_with_headers_and_overrides() {
        let config = CallConfig::from_toml_str(
            r#"
            [transport]
            bind_host = "127.0.0.1"
            bind_port = 5081
            user_agent = "test-agent"

            [call]
            target = { user = "bob", host = "example.com", port = 5080 }
            caller_id = "alice"
            timeout_ms = 10000
            hold_ms = 0
            headers = [{ name = "X-Campaign", value = "spring" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.user_agent, "test-agent");
        assert_eq!(config.call.timeout(), Duration::from_secs(10));
        assert_eq!(config.call.hold(), Duration::ZERO);
        assert_eq!(config.transport.cancel_linger(), DEFAULT_CANCEL_LINGER);
        assert_eq!(config.call.identity().extra_headers[0].name, "X-Campaign");
    }

    #[test]
    fn test_toml_rejects_invalid_target() {
        let result = CallConfig::from_toml_str(
            r#"
            [transport]
            bind_host = "127.0.0.1"
            bind_port = 5081

            [call]
            target = { user = "bob", host = "", port = 5080 }
            caller_id = "alice"
            "#,
        );
        assert!(matches!(result, Err(CallError::Configuration { .. })));
    }

    #[test]
    fn test_empty_header_name_rejected() {
        let mut settings = CallSettings::new(target(), "A", "1");
        settings.headers.push(Header {
            name: String::new(),
            value: "v".into(),
        });
        assert!(matches!(settings.validate(), Err(CallError::InvalidHeader { .. })));
    }
}
