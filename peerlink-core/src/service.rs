//! Process-scoped connection service: topology, function registry, connection
//! directory and clock, shared by every connection and the liveness supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::connection::{ConnectionId, ConnectionRole, PeerConnection};
use crate::directory::ConnectionDirectory;
use crate::registry::RpcFunctionRegistry;
use crate::stream::Stream;
use crate::supervisor::{LivenessSupervisor, SWEEP_INTERVAL};
use crate::topology::Topology;
use crate::LOG_TARGET;

pub struct ApiService {
    topology: Arc<Topology>,
    registry: RpcFunctionRegistry,
    directory: ConnectionDirectory,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
}

impl ApiService {
    pub fn new(topology: Arc<Topology>, registry: RpcFunctionRegistry) -> Arc<Self> {
        Self::with_clock(topology, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        topology: Arc<Topology>,
        registry: RpcFunctionRegistry,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory: ConnectionDirectory::new(Arc::clone(&topology)),
            topology,
            registry,
            clock,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn registry(&self) -> &RpcFunctionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &ConnectionDirectory {
        &self.directory
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Take over a handshaken stream: create the connection, register it under its
    /// identity (or as anonymous) and start its read loop.
    pub fn add_connection(
        self: &Arc<Self>,
        identity: impl Into<String>,
        stream: Stream,
        role: ConnectionRole,
    ) -> Arc<PeerConnection> {
        let conn = PeerConnection::new(Arc::clone(self), identity, stream, role);
        info!(
            target: LOG_TARGET,
            identity = conn.identity(),
            role = ?role,
            anonymous = conn.is_anonymous(),
            "New API client for identity '{}'",
            conn.identity()
        );
        self.directory.register(&conn);
        conn.start();
        conn
    }

    /// Run the keep-alive timer (liveness sweep + log position announcements).
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        LivenessSupervisor::new(Arc::clone(self)).spawn(SWEEP_INTERVAL)
    }

    /// Disconnect every registered connection.
    pub async fn shutdown(&self) {
        for conn in self.directory.all() {
            conn.disconnect().await;
        }
    }
}

impl std::fmt::Debug for ApiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiService")
            .field("local_zone", &self.topology.local_zone().name())
            .field("registry", &self.registry)
            .field("anonymous", &self.directory.anonymous_count())
            .finish()
    }
}
