//! # Signaling Adapter
//!
//! Bridges a local UDP SIP transport (loopback, port 5060 by default) to
//! end-to-end encrypted `Application` messages on the overlay.
//!
//! Outbound: a datagram from the local SIP endpoint is parsed just enough
//! to find the peer it is for (the `To` URI user of a request is a
//! fingerprint; a response is matched to its caller through the engine's
//! call-id memory) and then the raw bytes are sealed to that peer's keys
//! (fetched on demand) and routed.
//!
//! Inbound: the engine hands over decrypted payloads; requests get their
//! `From` host rewritten to a local sentinel and their call-id remembered
//! so the eventual response can be routed back, then the bytes go to the
//! local endpoint.
//!
//! Invalid SIP bytes are dropped silently at this boundary; the overlay
//! never reports delivery failures to a sender.
//!
//! The parser here is intentionally small: start line plus headers,
//! enough for From/To/Call-ID handling. Full SIP semantics live in the
//! local endpoint, not in the hub.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto;
use crate::identity::PeerId;
use crate::messages::{Message, MessageCode};
use crate::router::{InboundApplication, RoutingEngine};

/// Host substituted into the `From` URI of relayed requests so the local
/// endpoint answers through us instead of dialing the original host.
pub const SENTINEL_HOST: &str = "voxmesh.invalid";

/// Maximum accepted SIP datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

// ============================================================================
// Minimal SIP parsing
// ============================================================================

/// Start line of a SIP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { code: u16, reason: String },
}

/// A parsed SIP message: start line, headers, opaque body.
#[derive(Clone, Debug)]
pub struct SipMessage {
    pub start_line: StartLine,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SipMessage {
    /// Parse a SIP datagram. Returns `None` for anything that is not
    /// plausibly SIP; the adapter drops those silently.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let split = find_header_end(bytes)?;
        let head = std::str::from_utf8(&bytes[..split.0]).ok()?;
        let body = bytes[split.1..].to_vec();

        let mut lines = head.lines();
        let first = lines.next()?.trim_end();
        let start_line = parse_start_line(first)?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Some(Self {
            start_line,
            headers,
            body,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Replace the host part of the `From` URI with `host`, keeping the
    /// user part and any display name or parameters around it.
    pub fn rewrite_from_host(&mut self, host: &str) {
        let Some(from) = self.header("From").map(str::to_string) else {
            return;
        };
        if let Some(rewritten) = rewrite_uri_host(&from, host) {
            self.set_header("From", rewritten);
        }
    }

    /// Reassemble the message with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let start = match &self.start_line {
            StartLine::Request { method, uri } => format!("{method} {uri} SIP/2.0"),
            StartLine::Response { code, reason } => format!("SIP/2.0 {code} {reason}"),
        };
        let mut out = Vec::with_capacity(start.len() + self.headers.len() * 32 + self.body.len() + 8);
        out.extend_from_slice(start.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn parse_start_line(line: &str) -> Option<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code = code.parse().ok()?;
        return Some(StartLine::Response {
            code,
            reason: reason.to_string(),
        });
    }
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();
    let version = parts.next()?;
    if !version.starts_with("SIP/") || method.is_empty() {
        return None;
    }
    Some(StartLine::Request { method, uri })
}

/// Locate the blank line separating headers from body. Returns the end of
/// the head section and the start of the body.
fn find_header_end(bytes: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = bytes.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    if let Some(pos) = bytes.windows(2).position(|w| w == b"\n\n") {
        return Some((pos, pos + 2));
    }
    // No body at all is fine for our purposes.
    Some((bytes.len(), bytes.len()))
}

/// Extract the user part of a `sip:user@host` URI, tolerating display
/// names and angle brackets around it.
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let at = rest.find('@')?;
    Some(&rest[..at])
}

fn rewrite_uri_host(value: &str, host: &str) -> Option<String> {
    let scheme = value.find("sip:")?;
    let at = value[scheme..].find('@')? + scheme;
    let tail_start = at + 1;
    let tail_len = value[tail_start..]
        .find(|c| c == '>' || c == ';' || c == ' ')
        .unwrap_or(value.len() - tail_start);
    let mut out = String::with_capacity(value.len());
    out.push_str(&value[..tail_start]);
    out.push_str(host);
    out.push_str(&value[tail_start + tail_len..]);
    Some(out)
}

// ============================================================================
// The adapter
// ============================================================================

/// Bridges the local SIP endpoint to the overlay.
pub struct SignalingAdapter {
    socket: UdpSocket,
    engine: Arc<RoutingEngine>,
    client_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl SignalingAdapter {
    /// Bind the local signaling socket.
    pub async fn bind(addr: SocketAddr, engine: Arc<RoutingEngine>) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(addr = %socket.local_addr()?, "signaling transport bound");
        Ok(Arc::new(Self {
            socket,
            engine,
            client_addr: std::sync::Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the outbound (UDP → overlay) and inbound (overlay → UDP)
    /// loops. Returns both task handles for shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<InboundApplication>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let outbound_task = {
            let adapter = self.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    match adapter.socket.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            *adapter
                                .client_addr
                                .lock()
                                .expect("client address registry poisoned") = Some(from);
                            let datagram = buf[..n].to_vec();
                            // Key retrieval can block on a remote exchange;
                            // never stall the receive loop on it.
                            let adapter = adapter.clone();
                            tokio::spawn(async move {
                                adapter.handle_outbound(datagram).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "signaling socket receive failed");
                            break;
                        }
                    }
                }
            })
        };

        let inbound_task = {
            let adapter = self.clone();
            tokio::spawn(async move {
                while let Some(delivery) = inbound.recv().await {
                    adapter.handle_inbound(delivery).await;
                }
            })
        };

        (outbound_task, inbound_task)
    }

    /// Encrypt and route one locally submitted SIP message.
    async fn handle_outbound(&self, datagram: Vec<u8>) {
        let Some(sip) = SipMessage::parse(&datagram) else {
            trace!("dropping unparsable local datagram");
            return;
        };

        let recipient = match &sip.start_line {
            StartLine::Request { .. } => {
                let Some(user) = sip.header("To").and_then(uri_user) else {
                    trace!("request has no usable To user; dropped");
                    return;
                };
                match PeerId::from_hex(user) {
                    Ok(peer) => peer,
                    Err(_) => {
                        trace!(user = %user, "To user is not a fingerprint; dropped");
                        return;
                    }
                }
            }
            StartLine::Response { .. } => {
                let Some(call_id) = sip.call_id() else {
                    trace!("response has no Call-ID; dropped");
                    return;
                };
                match self.engine.take_caller(call_id).await {
                    Some(peer) => peer,
                    None => {
                        debug!(call_id = %call_id, "no remembered caller for response; dropped");
                        return;
                    }
                }
            }
        };

        let keys = self.engine.get_entity_keys(recipient).await;
        let sealed = crypto::seal(self.engine.ring(), &keys, &datagram);
        let message = Message::new(
            recipient,
            self.engine.start_ttl(),
            MessageCode::Application,
            sealed,
        );
        self.engine.route_message(message).await;
    }

    /// Deliver one decrypted overlay payload to the local endpoint.
    async fn handle_inbound(&self, delivery: InboundApplication) {
        let Some(mut sip) = SipMessage::parse(&delivery.plaintext) else {
            trace!(sender = %delivery.sender, "dropping unparsable relayed payload");
            return;
        };

        if sip.is_request() {
            // Route the eventual response back over the overlay: remember
            // who called, then point the local endpoint at ourselves.
            let caller = sip
                .header("From")
                .and_then(uri_user)
                .and_then(|user| PeerId::from_hex(user).ok())
                .unwrap_or(delivery.sender);
            if let Some(call_id) = sip.call_id() {
                self.engine.remember_caller(call_id.to_string(), caller).await;
            }
            sip.rewrite_from_host(SENTINEL_HOST);
        }

        let target = *self
            .client_addr
            .lock()
            .expect("client address registry poisoned");
        let Some(target) = target else {
            debug!("no local signaling endpoint seen yet; payload dropped");
            return;
        };
        if let Err(e) = self.socket.send_to(&sip.to_bytes(), target).await {
            debug!(error = %e, "failed to hand payload to local endpoint");
        }
    }
}
