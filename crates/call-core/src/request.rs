//! Outbound INVITE construction
//!
//! [`RequestBuilder`] turns a target, a local endpoint and the caller's
//! identity into an immutable [`OutboundRequest`]. Construction does no I/O:
//! the Call-ID and local tag are random tokens generated here so that every
//! in-dialog request sent later can be correlated without asking the
//! transport.
//!
//! ```text
//! INVITE sip:08821670000@100.81.118.20:5080 SIP/2.0
//! From: "Empresa XYZ" <sip:4833800000@100.73.40.116:5081>;tag=...
//! P-Asserted-Identity: <sip:4833800000@100.73.40.116>
//! <extra headers, in caller order>
//! ```

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::{CallError, CallResult};

/// Header carrying the asserted caller identity
pub const P_ASSERTED_IDENTITY: &str = "P-Asserted-Identity";

/// SIP request methods used by an outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
}

impl Method {
    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `Name: value` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    /// Create a header, rejecting names that cannot be put on the wire
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> CallResult<Self> {
        let name = name.into();
        let value = value.into();

        if name.trim().is_empty() {
            return Err(CallError::invalid_header("header name must not be empty"));
        }
        if name.chars().any(|c| c.is_whitespace() || c == ':' || c.is_control()) {
            return Err(CallError::invalid_header(format!("malformed header name '{}'", name)));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(CallError::invalid_header(format!(
                "header '{}' value contains a line break",
                name
            )));
        }

        Ok(Self { name, value })
    }

    /// Parse a `Name: value` line
    pub fn parse(line: &str) -> CallResult<Self> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CallError::invalid_header(format!("expected 'Name: value', got '{}'", line)))?;
        Self::new(name.trim(), value.trim())
    }

    /// Case-insensitive name comparison
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Structured From identity: display name plus the local endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromIdentity {
    pub display_name: String,
    pub endpoint: Endpoint,
}

impl FromIdentity {
    /// Render as a name-addr, e.g. `"Empresa XYZ" <sip:4833800000@100.73.40.116:5081>`
    pub fn name_addr(&self) -> String {
        if self.display_name.is_empty() {
            format!("<{}>", self.endpoint)
        } else {
            format!("\"{}\" <{}>", self.display_name.replace('"', "\\\""), self.endpoint)
        }
    }
}

/// Ordered identity headers plus the structured From identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHeaders {
    from: FromIdentity,
    headers: Vec<Header>,
}

impl IdentityHeaders {
    /// Structured From identity
    pub fn from(&self) -> &FromIdentity {
        &self.from
    }

    /// Headers in the order they go on the wire
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header with the given name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
    }

    /// Every value for the given name, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter().filter(move |h| h.is(name)).map(|h| h.value.as_str())
    }
}

/// Caller identity used to build a request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallIdentity {
    /// Display name placed in the From header
    pub display_name: String,
    /// Caller number asserted in From and P-Asserted-Identity
    pub caller_id: String,
    /// Extra headers appended after the identity headers
    #[serde(default)]
    pub extra_headers: Vec<Header>,
}

impl CallIdentity {
    pub fn new(display_name: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            caller_id: caller_id.into(),
            extra_headers: Vec::new(),
        }
    }

    /// Append an extra header
    pub fn with_header(mut self, header: Header) -> Self {
        self.extra_headers.push(header);
        self
    }
}

/// Dialog-initiating request, built once per call attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    method: Method,
    target: Endpoint,
    local: Endpoint,
    identity: IdentityHeaders,
    call_id: String,
    local_tag: String,
    cseq: u32,
}

impl OutboundRequest {
    pub fn method(&self) -> Method {
        self.method
    }

    /// Remote party, also the Request-URI
    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Local endpoint the call originates from
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn identity(&self) -> &IdentityHeaders {
        &self.identity
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Tag placed on the From header
    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    /// CSeq number of the INVITE
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// From header value including the local tag
    pub fn from_header(&self) -> String {
        format!("{};tag={}", self.identity.from.name_addr(), self.local_tag)
    }

    /// To header value (no tag until the remote answers)
    pub fn to_header(&self) -> String {
        format!("<{}>", self.target)
    }
}

/// Builds [`OutboundRequest`]s
///
/// # Examples
///
/// ```rust
/// use sipdial_call_core::{Endpoint, Header, RequestBuilder};
///
/// let target = Endpoint::new("08821670000", "100.81.118.20", 5080).unwrap();
/// let local = Endpoint::host_port("100.73.40.116", 5081).unwrap();
///
/// let request = RequestBuilder::build(
///     &target,
///     &local,
///     "Empresa XYZ",
///     "4833800000",
///     vec![Header::new("X-Campaign", "spring").unwrap()],
/// ).unwrap();
///
/// assert_eq!(
///     request.identity().get("P-Asserted-Identity"),
///     Some("<sip:4833800000@100.73.40.116>")
/// );
/// assert_eq!(request.identity().from().endpoint.to_string(), "sip:4833800000@100.73.40.116:5081");
/// ```
pub struct RequestBuilder;

impl RequestBuilder {
    /// Build the INVITE for one call attempt
    ///
    /// Mandatory identity headers come first, then `extra_headers` in the
    /// given order. Duplicate names are kept; the stack on the other side
    /// resolves them.
    pub fn build(
        target: &Endpoint,
        local: &Endpoint,
        display_name: &str,
        caller_id: &str,
        extra_headers: Vec<Header>,
    ) -> CallResult<OutboundRequest> {
        // Endpoints are validated on construction; re-check in case they were
        // assembled through a path that bypassed it.
        revalidate(target, "target")?;
        revalidate(local, "local")?;

        if caller_id.trim().is_empty() {
            return Err(CallError::invalid_endpoint("caller id must not be empty"));
        }

        let from_endpoint = local.with_user(caller_id)?;
        let asserted = Header::new(
            P_ASSERTED_IDENTITY,
            format!("<sip:{}@{}>", caller_id, local.host()),
        )?;

        let mut headers = Vec::with_capacity(1 + extra_headers.len());
        headers.push(asserted);
        for header in extra_headers {
            // Headers built through Header::new are valid; fields are public
            // so check again.
            headers.push(Header::new(header.name, header.value)?);
        }

        let identity = IdentityHeaders {
            from: FromIdentity {
                display_name: display_name.to_string(),
                endpoint: from_endpoint,
            },
            headers,
        };

        Ok(OutboundRequest {
            method: Method::Invite,
            target: target.clone(),
            local: local.clone(),
            identity,
            call_id: generate_call_id(local),
            local_tag: generate_tag(),
            cseq: 1,
        })
    }

    /// Build from a [`CallIdentity`]
    pub fn from_identity(
        target: &Endpoint,
        local: &Endpoint,
        identity: &CallIdentity,
    ) -> CallResult<OutboundRequest> {
        Self::build(
            target,
            local,
            &identity.display_name,
            &identity.caller_id,
            identity.extra_headers.clone(),
        )
    }
}

fn revalidate(endpoint: &Endpoint, which: &str) -> CallResult<()> {
    Endpoint::new(endpoint.user(), endpoint.host(), u32::from(endpoint.port()))
        .map(|_| ())
        .map_err(|e| CallError::invalid_endpoint(format!("{} endpoint: {}", which, e)))
}

fn generate_call_id(local: &Endpoint) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), local.host())
}

/// Random token used for tags and branches
pub(crate) fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}{:08x}", rng.gen::<u32>(), rng.gen::<u32>())
}
