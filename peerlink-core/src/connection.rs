//! One live connection to a remote peer.
//!
//! A connection runs a single read loop that decodes messages, updates liveness and
//! replay state, dispatches requests through the function registry and writes replies
//! back on the same stream. Any task may send on it or disconnect it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::AtomicTimestamp;
use crate::protocol::Message;
use crate::service::ApiService;
use crate::stream::{Stream, StreamError};
use crate::topology::{Endpoint, Zone};
use crate::LOG_TARGET;

pub type ConnectionId = u64;

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialled the peer.
    Client,
    /// The peer dialled us.
    Server,
}

pub struct PeerConnection {
    id: ConnectionId,
    identity: String,
    role: ConnectionRole,
    stream: Stream,
    seen: AtomicTimestamp,
    endpoint: Option<Weak<Endpoint>>,
    disconnected: AtomicBool,
    service: Arc<ApiService>,
}

/// Where an inbound message came from, handed to RPC handlers.
#[derive(Clone)]
pub struct MessageOrigin {
    client: Arc<PeerConnection>,
    zone: Option<Arc<Zone>>,
}

impl MessageOrigin {
    pub fn new(client: Arc<PeerConnection>, zone: Option<Arc<Zone>>) -> Self {
        Self { client, zone }
    }

    pub fn client(&self) -> &Arc<PeerConnection> {
        &self.client
    }

    /// Zone the message is attributed to, if any.
    pub fn zone(&self) -> Option<&Arc<Zone>> {
        self.zone.as_ref()
    }
}

impl fmt::Debug for MessageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageOrigin")
            .field("client", &self.client.identity)
            .field("zone", &self.zone.as_ref().map(|z| z.name()))
            .finish()
    }
}

impl PeerConnection {
    /// Wrap a handshaken stream. The identity is resolved against the topology once, here;
    /// the connection is not registered or started yet (see `ApiService::add_connection`).
    pub fn new(
        service: Arc<ApiService>,
        identity: impl Into<String>,
        stream: Stream,
        role: ConnectionRole,
    ) -> Arc<Self> {
        let identity = identity.into();
        let endpoint = service
            .topology()
            .endpoint(&identity)
            .map(|ep| Arc::downgrade(&ep));
        Arc::new(Self {
            id: service.next_connection_id(),
            seen: AtomicTimestamp::new(service.clock().now()),
            identity,
            role,
            stream,
            endpoint,
            disconnected: AtomicBool::new(false),
            service,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Endpoint this identity resolved to; `None` for anonymous peers.
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_anonymous(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Last time a message other than `log::SetLogPosition` was sent or received.
    pub fn last_seen(&self) -> f64 {
        self.seen.get()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.seen.advance(self.service.clock().now());
    }

    /// Launch the read loop on its own task and return immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.process_message().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        identity = %self.identity,
                        error = %err,
                        "Error while reading JSON-RPC message for identity '{}': {}",
                        self.identity,
                        err
                    );
                    break;
                }
            }
        }
        self.disconnect().await;
    }

    /// Write one message. Serialised with every other writer on this stream.
    /// A failed write disconnects the peer.
    pub async fn send_message(&self, message: &Message) -> Result<(), StreamError> {
        match self.stream.write_message(message).await {
            Ok(()) => {
                if !message.is_log_position() {
                    self.touch();
                }
                Ok(())
            }
            Err(err) => {
                if matches!(err, StreamError::Closed) {
                    debug!(
                        target: LOG_TARGET,
                        identity = %self.identity,
                        "Dropping message for closed connection '{}'",
                        self.identity
                    );
                } else {
                    warn!(
                        target: LOG_TARGET,
                        identity = %self.identity,
                        error = %err,
                        "Error while sending JSON-RPC message for identity '{}': {}",
                        self.identity,
                        err
                    );
                }
                self.disconnect().await;
                Err(err)
            }
        }
    }

    /// Close the stream and drop out of the connection directory. Idempotent.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            target: LOG_TARGET,
            identity = %self.identity,
            "API client disconnected for identity '{}'",
            self.identity
        );
        self.service.directory().unregister(self);
        self.stream.close().await;
    }

    /// Read and handle one message. `Ok(false)` once the stream has ended.
    pub async fn process_message(self: &Arc<Self>) -> Result<bool, StreamError> {
        let Some(message) = self.stream.read_message().await? else {
            return Ok(false);
        };

        if !message.is_log_position() {
            self.touch();
        }

        let endpoint = self.endpoint();

        if let (Some(endpoint), Some(ts)) = (&endpoint, message.timestamp()) {
            if !endpoint.advance_remote_log_position(ts) {
                trace!(
                    target: LOG_TARGET,
                    identity = %self.identity,
                    ts,
                    "Ignoring already processed message"
                );
                return Ok(true);
            }
        }

        let origin = MessageOrigin::new(
            Arc::clone(self),
            self.origin_zone(endpoint.as_deref(), &message),
        );

        let method = message.method().unwrap_or_default();
        debug!(
            target: LOG_TARGET,
            identity = %self.identity,
            method,
            "Received '{}' message from '{}'",
            method,
            self.identity
        );

        let params = message.params().unwrap_or(&Value::Null);
        let outcome = self.service.registry().invoke(method, &origin, params);
        if let Err(err) = &outcome {
            debug!(
                target: LOG_TARGET,
                identity = %self.identity,
                method,
                error = %err,
                "RPC call failed"
            );
        }

        if let Some(id) = message.id() {
            let reply = Message::reply(id.clone(), outcome);
            // A failed reply has already disconnected us; the next read sees the close.
            let _ = self.send_message(&reply).await;
        }

        Ok(true)
    }

    /// A peer in a foreign zone speaks for its own zone. Peers in the local zone, and
    /// unresolved peers, relay the zone declared in the message.
    fn origin_zone(&self, endpoint: Option<&Endpoint>, message: &Message) -> Option<Arc<Zone>> {
        let topology = self.service.topology();
        if let Some(endpoint) = endpoint {
            if !topology.is_local_zone(endpoint.zone_name()) {
                return topology.zone(endpoint.zone_name());
            }
        }
        message.origin_zone().and_then(|name| topology.zone(name))
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("last_seen", &self.last_seen())
            .field("anonymous", &self.is_anonymous())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
