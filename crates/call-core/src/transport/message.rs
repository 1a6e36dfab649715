//! SIP/2.0 messages for the UDP transport
//!
//! Requests are assembled with `rvoip-sip-core`'s request builder and
//! datagrams are parsed with its message parser. Only the handful of
//! messages an outbound caller needs: INVITE, ACK, CANCEL and BYE out,
//! responses in. Requests always carry `Content-Length: 0`; no SDP is
//! offered.

use std::fmt;
use std::str::FromStr;

use rvoip_sip_core::builder::SimpleRequestBuilder;
use rvoip_sip_core::prelude::{HeaderName, HeaderValue};
use rvoip_sip_core::types::address::Address;
use rvoip_sip_core::types::contact::Contact;
use rvoip_sip_core::types::content_length::ContentLength;
use rvoip_sip_core::types::from::From as FromHeader;
use rvoip_sip_core::types::param::Param;
use rvoip_sip_core::types::to::To;
use rvoip_sip_core::types::via::Via;
use rvoip_sip_core::{Message, Method as SipMethod, Response, TypedHeader};

use crate::dialog::DialogInfo;
use crate::endpoint::Endpoint;
use crate::request::{generate_tag, Header, Method, OutboundRequest};
use crate::response::{ResponseClass, SipResponse};

use super::{TransportError, TransportResult};

/// RFC 3261 branch prefix
pub const BRANCH_MAGIC: &str = "z9hG4bK";

/// Fresh Via branch
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, generate_tag())
}

/// Values that differ per hop rather than per dialog
#[derive(Debug, Clone)]
pub struct Hop<'a> {
    /// Address written into Via and Contact
    pub advertised: &'a Endpoint,
    pub branch: &'a str,
    pub user_agent: &'a str,
}

fn sip_method(method: Method) -> SipMethod {
    match method {
        Method::Invite => SipMethod::Invite,
        Method::Ack => SipMethod::Ack,
        Method::Cancel => SipMethod::Cancel,
        Method::Bye => SipMethod::Bye,
    }
}

fn encode_error<E: fmt::Display>(method: Method) -> impl FnOnce(E) -> TransportError {
    move |e| TransportError::Encode {
        method: method.to_string(),
        reason: e.to_string(),
    }
}

fn name_addr(method: Method, value: &str) -> TransportResult<Address> {
    Address::from_str(value).map_err(encode_error(method))
}

/// Request line, Via and Max-Forwards
fn start(method: Method, uri: &Endpoint, hop: &Hop<'_>) -> TransportResult<SimpleRequestBuilder> {
    let via = Via::new(
        "SIP",
        "2.0",
        "UDP",
        hop.advertised.host(),
        Some(hop.advertised.port()),
        vec![Param::branch(hop.branch)],
    )
    .map_err(encode_error(method))?;

    let builder = SimpleRequestBuilder::new(sip_method(method), &uri.to_string())
        .map_err(encode_error(method))?
        .header(TypedHeader::Via(via))
        .max_forwards(70);
    Ok(builder)
}

fn finish(builder: SimpleRequestBuilder, hop: &Hop<'_>) -> Vec<u8> {
    let request = builder
        .header(TypedHeader::UserAgent(vec![hop.user_agent.to_string()]))
        .header(TypedHeader::ContentLength(ContentLength::new(0)))
        .build();
    Message::Request(request).to_bytes()
}

fn extension_header(header: &Header) -> TypedHeader {
    TypedHeader::Other(
        HeaderName::Other(header.name.clone()),
        HeaderValue::text(header.value.clone()),
    )
}

/// Render the INVITE
///
/// Identity and extra headers follow the mandatory ones in their original
/// order.
pub fn render_invite(request: &OutboundRequest, hop: &Hop<'_>) -> TransportResult<Vec<u8>> {
    let from = request.identity().from();
    let contact = hop
        .advertised
        .with_user(from.endpoint.user())
        .unwrap_or_else(|_| hop.advertised.clone());
    let contact = Contact::from_str(&format!("<{}>", contact)).map_err(encode_error(Method::Invite))?;

    let mut builder = start(Method::Invite, request.target(), hop)?
        .from(&from.display_name, &from.endpoint.to_string(), Some(request.local_tag()))
        .to("", &request.target().to_string(), None)
        .call_id(request.call_id())
        .cseq(request.cseq())
        .header(TypedHeader::Contact(contact));
    for header in request.identity().headers() {
        builder = builder.header(extension_header(header));
    }
    Ok(finish(builder, hop))
}

/// Render the ACK for a final response to the INVITE
///
/// A 2xx ACK is its own transaction and gets a new branch; a non-2xx ACK
/// reuses the INVITE branch. Both carry the To header of the response so
/// the remote tag is echoed.
pub fn render_ack(request: &OutboundRequest, response: &SipResponse, hop: &Hop<'_>) -> TransportResult<Vec<u8>> {
    let to = response
        .header("To")
        .map(str::to_string)
        .unwrap_or_else(|| request.to_header());
    let uri = if response.class() == ResponseClass::Success {
        response.contact().unwrap_or_else(|| request.target().clone())
    } else {
        request.target().clone()
    };

    let builder = start(Method::Ack, &uri, hop)?
        .header(TypedHeader::From(FromHeader::new(name_addr(Method::Ack, &request.from_header())?)))
        .header(TypedHeader::To(To::new(name_addr(Method::Ack, &to)?)))
        .call_id(request.call_id())
        .cseq(request.cseq());
    Ok(finish(builder, hop))
}

/// Render a CANCEL for a pending INVITE; `hop.branch` must be the INVITE's
pub fn render_cancel(request: &OutboundRequest, hop: &Hop<'_>) -> TransportResult<Vec<u8>> {
    let builder = start(Method::Cancel, request.target(), hop)?
        .header(TypedHeader::From(FromHeader::new(name_addr(Method::Cancel, &request.from_header())?)))
        .header(TypedHeader::To(To::new(name_addr(Method::Cancel, &request.to_header())?)))
        .call_id(request.call_id())
        .cseq(request.cseq());
    Ok(finish(builder, hop))
}

/// Render the BYE for an established dialog
pub fn render_bye(dialog: &DialogInfo, hop: &Hop<'_>) -> TransportResult<Vec<u8>> {
    let builder = start(Method::Bye, &dialog.remote_target, hop)?
        .header(TypedHeader::From(FromHeader::new(name_addr(Method::Bye, &dialog.from)?)))
        .header(TypedHeader::To(To::new(name_addr(Method::Bye, &dialog.to)?)))
        .call_id(&dialog.call_id)
        .cseq(dialog.invite_cseq + 1);
    Ok(finish(builder, hop))
}

/// A datagram as seen by the receive loop
#[derive(Debug)]
pub enum Incoming {
    Response(SipResponse),
    /// Inbound request; only its method is kept
    Request(String),
}

/// Parse a datagram into a response or a bare request marker
pub fn parse_message(bytes: &[u8]) -> TransportResult<Incoming> {
    match rvoip_sip_core::parse_message(bytes) {
        Ok(Message::Response(response)) => Ok(Incoming::Response(from_wire(&response))),
        Ok(Message::Request(request)) => Ok(Incoming::Request(request.method().to_string())),
        Err(e) => Err(TransportError::Parse(e.to_string())),
    }
}

/// Parse a datagram that must be a response
pub fn parse_response(bytes: &[u8]) -> TransportResult<SipResponse> {
    match parse_message(bytes)? {
        Incoming::Response(response) => Ok(response),
        Incoming::Request(method) => Err(TransportError::Parse(format!("expected a response, got {}", method))),
    }
}

// Headers are kept in their canonical long form, in wire order
fn from_wire(response: &Response) -> SipResponse {
    let initial = SipResponse::new(response.status_code(), response.reason_phrase().to_string());
    response.headers.iter().fold(initial, |acc, header| {
        let name = header.name().to_string();
        let line = header.to_string();
        let value = line
            .strip_prefix(name.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
            .unwrap_or(line.as_str())
            .to_string();
        acc.with_header(name, value)
    })
}
