//! SIP over UDP
//!
//! One socket, one receive loop. Responses are matched to the pending INVITE
//! by Call-ID and forwarded to that INVITE's [`ResponseStream`]. Final
//! responses are ACKed here, so the dialog layer never sees an ACK.
//! Inbound requests (a remote BYE, OPTIONS pings) are logged and dropped.
//!
//! ```text
//!  send(INVITE) ──► pending[call_id] = { branch, destination, tx }
//!                                            │
//!  socket ──► receive loop ──► parse ──► Call-ID lookup ──► ACK final, tx.try_send
//! ```
//!
//! A cancelled INVITE stays in `pending` for the configured linger. A 2xx
//! that crosses the CANCEL is ACKed and hung up with a BYE right away.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::dialog::DialogInfo;
use crate::endpoint::Endpoint;
use crate::error::CallResult;
use crate::request::{Method, OutboundRequest};
use crate::response::{ResponseClass, SipResponse};

use super::message::{self, generate_branch, Hop, Incoming};
use super::{DialogTransport, ResponseStream, TransportError, TransportResult};

/// Responses buffered per INVITE before the receive loop starts dropping
const RESPONSE_CHANNEL_CAPACITY: usize = 32;

/// Largest datagram we expect to read
const MAX_DATAGRAM_SIZE: usize = 65_535;

struct PendingInvite {
    request: OutboundRequest,
    branch: String,
    destination: SocketAddr,
    /// Dropped after the final response so the stream ends
    responses: Option<mpsc::Sender<Result<SipResponse, TransportError>>>,
    /// Nobody is waiting any more; a 2xx gets ACK and BYE
    abandoned: bool,
}

/// Removes a pending INVITE unless disarmed after a successful send
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingInvite>,
    call_id: &'a str,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(self.call_id);
        }
    }
}

struct Inner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    advertised: Endpoint,
    user_agent: String,
    cancel_linger: Duration,
    pending: DashMap<String, PendingInvite>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// UDP transport for outbound calls
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

impl UdpTransport {
    /// Bind the signalling socket and start the receive loop
    ///
    /// With `bind_port = 0` the OS picks a port and the advertised endpoint
    /// uses it unless an external port is configured.
    pub async fn bind(config: &TransportConfig) -> CallResult<Self> {
        config.validate()?;

        let socket = UdpSocket::bind(config.bind_addr())
            .await
            .map_err(TransportError::from)?;
        let local_addr = socket.local_addr().map_err(TransportError::from)?;
        let advertised = config.advertised_endpoint_with_port(local_addr.port())?;

        if local_addr.ip().is_unspecified() && !config.rewrite_contact {
            warn!(
                "Bound to {} without an external address; Contact and Via will not be routable",
                local_addr
            );
        }
        info!("SIP UDP transport bound to {} (advertising {})", local_addr, advertised.socket_string());

        let inner = Arc::new(Inner {
            socket: Arc::new(socket),
            local_addr,
            advertised,
            user_agent: config.user_agent.clone(),
            cancel_linger: config.cancel_linger(),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        spawn_receive_loop(&inner);

        Ok(Self { inner })
    }

    /// Address written into Contact and Via; use it as the local endpoint
    pub fn advertised_endpoint(&self) -> &Endpoint {
        &self.inner.advertised
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// INVITEs still tracked for ACKs and CANCEL
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop the receive loop and end every open response stream
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.cancel();
            self.inner.pending.clear();
            info!("UDP transport on {} closed", self.inner.local_addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn hop<'a>(&'a self, branch: &'a str) -> Hop<'a> {
        self.inner.hop(branch)
    }

    async fn resolve(&self, endpoint: &Endpoint) -> TransportResult<SocketAddr> {
        let host = endpoint.socket_string();
        let mut addrs = lookup_host(host.clone()).await.map_err(|e| TransportError::Resolve {
            host: host.clone(),
            reason: e.to_string(),
        })?;

        let want_v4 = self.inner.local_addr.is_ipv4();
        let mut fallback = None;
        for addr in addrs.by_ref() {
            if addr.is_ipv4() == want_v4 {
                return Ok(addr);
            }
            fallback.get_or_insert(addr);
        }
        fallback.ok_or_else(|| TransportError::Resolve {
            host,
            reason: "no addresses".to_string(),
        })
    }

    // Forget a cancelled INVITE once no final response can reasonably arrive
    fn forget_later(&self, call_id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let call_id = call_id.to_string();
        let linger = self.inner.cancel_linger;

        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.pending.remove_if(&call_id, |_, entry| entry.abandoned).is_some() {
                debug!("Forgot abandoned INVITE {}", call_id);
            }
        });
    }

    async fn send_bytes(&self, method: Method, bytes: &[u8], destination: SocketAddr) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        debug!("Sending {} ({} bytes) to {}", method, bytes.len(), destination);
        self.inner
            .socket
            .send_to(bytes, destination)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send {
                method: method.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl DialogTransport for UdpTransport {
    async fn send(&self, request: &OutboundRequest) -> TransportResult<ResponseStream> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let destination = self.resolve(request.target()).await?;
        let branch = generate_branch();
        let bytes = message::render_invite(request, &self.hop(&branch))?;
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

        // Registered before the datagram leaves so a fast answer finds it
        self.inner.pending.insert(
            request.call_id().to_string(),
            PendingInvite {
                request: request.clone(),
                branch,
                destination,
                responses: Some(tx),
                abandoned: false,
            },
        );
        let guard = PendingGuard {
            pending: &self.inner.pending,
            call_id: request.call_id(),
            armed: true,
        };

        info!("Sending INVITE for {} to {}", request.call_id(), destination);
        self.send_bytes(Method::Invite, &bytes, destination).await?;
        guard.disarm();

        Ok(rx)
    }

    async fn send_in_dialog(&self, dialog: &DialogInfo, method: Method) -> TransportResult<()> {
        if method != Method::Bye {
            return Err(TransportError::Send {
                method: method.to_string(),
                reason: "only BYE is supported inside a dialog".to_string(),
            });
        }

        let destination = self.resolve(&dialog.remote_target).await?;
        let branch = generate_branch();
        let bytes = message::render_bye(dialog, &self.hop(&branch))?;

        // No more 2xx retransmissions to ACK once we hang up
        self.inner.pending.remove(&dialog.call_id);

        info!("Sending BYE for {} to {}", dialog.call_id, destination);
        self.send_bytes(Method::Bye, &bytes, destination).await
    }

    async fn cancel(&self, request: &OutboundRequest) -> TransportResult<()> {
        let target = match self.inner.pending.get_mut(request.call_id()) {
            Some(mut entry) if entry.responses.is_some() => {
                entry.abandoned = true;
                entry.responses = None;
                Some((entry.branch.clone(), entry.destination))
            }
            _ => None,
        };

        let Some((branch, destination)) = target else {
            debug!("No pending INVITE for {}; nothing to cancel", request.call_id());
            return Ok(());
        };
        self.forget_later(request.call_id());

        let bytes = message::render_cancel(request, &self.hop(&branch))?;
        info!("Sending CANCEL for {} to {}", request.call_id(), destination);
        self.send_bytes(Method::Cancel, &bytes, destination).await
    }
}

impl Inner {
    fn hop<'a>(&'a self, branch: &'a str) -> Hop<'a> {
        Hop {
            advertised: &self.advertised,
            branch,
            user_agent: &self.user_agent,
        }
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local_addr)
    }
}

// The loop holds only a weak reference so dropping the last transport handle
// shuts it down.
fn spawn_receive_loop(inner: &Arc<Inner>) {
    let socket = inner.socket.clone();
    let shutdown = inner.shutdown.clone();
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, source)) => {
                    let Some(inner) = weak.upgrade() else { break };
                    handle_datagram(&inner, &buf[..len], source).await;
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    // ICMP port-unreachable surfaces here on some platforms
                    warn!("Error receiving UDP packet: {}", e);
                }
            }
        }
        debug!("UDP receive loop terminated");
    });
}

async fn handle_datagram(inner: &Inner, bytes: &[u8], source: SocketAddr) {
    let response = match message::parse_message(bytes) {
        Ok(Incoming::Response(response)) => response,
        Ok(Incoming::Request(method)) => {
            debug!("Ignoring inbound {} from {}", method, source);
            return;
        }
        Err(e) => {
            warn!("Dropping unparseable datagram from {}: {}", source, e);
            return;
        }
    };

    trace!("Received {} from {}", response, source);

    let Some(call_id) = response.call_id().map(str::to_string) else {
        warn!("Dropping response without Call-ID from {}", source);
        return;
    };
    if let Some((_, method)) = response.cseq() {
        if !method.eq_ignore_ascii_case(Method::Invite.as_str()) {
            debug!("Ignoring {} response to {} for {}", response.status(), method, call_id);
            return;
        }
    }

    let class = response.class();

    // Decide what to do while holding the entry, act after releasing it
    let (ack, bye, sink, done) = {
        let Some(mut entry) = inner.pending.get_mut(&call_id) else {
            debug!("Discarding {} for unknown call {}", response.status(), call_id);
            return;
        };

        // The stream was dropped without a CANCEL (caller went away)
        if entry.responses.as_ref().is_some_and(|tx| tx.is_closed()) {
            entry.responses = None;
            entry.abandoned = true;
        }

        let ack = class.is_final().then(|| ack_for(inner, &entry, &response));
        let bye = (entry.abandoned && class == ResponseClass::Success).then(|| bye_for(inner, &entry, &response));
        let sink = if class.is_final() {
            entry.responses.take()
        } else {
            entry.responses.clone()
        };
        let done = class == ResponseClass::Failure || (entry.abandoned && class.is_final());
        (ack.flatten(), bye.flatten(), sink, done)
    };

    if done {
        inner.pending.remove(&call_id);
    }

    if let Some((bytes, destination)) = ack {
        if let Err(e) = inner.socket.send_to(&bytes, destination).await {
            warn!("Failed to ACK {} for {}: {}", response.status(), call_id, e);
        }
    }

    if let Some((bytes, destination)) = bye {
        warn!("{} answered after the call was abandoned; hanging up", call_id);
        if let Err(e) = inner.socket.send_to(&bytes, destination).await {
            warn!("Failed to send BYE for {}: {}", call_id, e);
        }
    }

    match sink {
        Some(tx) => {
            if let Err(e) = tx.try_send(Ok(response)) {
                debug!("Response for {} not delivered: {}", call_id, e);
            }
        }
        None => trace!("Response for {} after the caller stopped listening", call_id),
    }
}

fn contact_destination(response: &SipResponse) -> Option<SocketAddr> {
    response
        .contact()
        .and_then(|c| c.socket_string().parse::<SocketAddr>().ok())
}

fn ack_for(inner: &Inner, entry: &PendingInvite, response: &SipResponse) -> Option<(Vec<u8>, SocketAddr)> {
    let (branch, destination) = if response.class() == ResponseClass::Success {
        (
            generate_branch(),
            contact_destination(response).unwrap_or(entry.destination),
        )
    } else {
        (entry.branch.clone(), entry.destination)
    };

    match message::render_ack(&entry.request, response, &inner.hop(&branch)) {
        Ok(bytes) => Some((bytes, destination)),
        Err(e) => {
            warn!("Cannot ACK {} for {}: {}", response.status(), entry.request.call_id(), e);
            None
        }
    }
}

fn bye_for(inner: &Inner, entry: &PendingInvite, response: &SipResponse) -> Option<(Vec<u8>, SocketAddr)> {
    let dialog = DialogInfo::from_success(&entry.request, response);
    let destination = contact_destination(response).unwrap_or(entry.destination);
    let branch = generate_branch();

    match message::render_bye(&dialog, &inner.hop(&branch)) {
        Ok(bytes) => Some((bytes, destination)),
        Err(e) => {
            warn!("Cannot hang up late answer for {}: {}", dialog.call_id, e);
            None
        }
    }
}
