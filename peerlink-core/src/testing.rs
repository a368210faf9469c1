//! Shared fixtures for unit tests: a small two-zone topology on a manual clock.

use std::sync::Arc;

use crate::clock::{Clock, ManualClock};
use crate::connection::{ConnectionRole, PeerConnection};
use crate::registry::RpcFunctionRegistry;
use crate::service::ApiService;
use crate::stream::Stream;
use crate::topology::{Endpoint, Topology};

pub(crate) const START: f64 = 1_700_000_000.0;

pub(crate) struct Harness {
    pub service: Arc<ApiService>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(RpcFunctionRegistry::with_builtins())
    }

    /// Local zone `master` (endpoints `master1`, `master2`), child zone `sat`
    /// (`sat1` with a 30 s keep-alive, `sat2` without).
    pub fn with_registry(registry: RpcFunctionRegistry) -> Self {
        let topology = Topology::builder("master")
            .zone("master", None)
            .zone("sat", Some("master"))
            .endpoint(Endpoint::new("master1", "master"))
            .endpoint(Endpoint::new("master2", "master").with_keep_alive(30.0))
            .endpoint(Endpoint::new("sat1", "sat").with_keep_alive(30.0))
            .endpoint(Endpoint::new("sat2", "sat"))
            .build()
            .expect("fixture topology");
        let clock = Arc::new(ManualClock::new(START));
        let service = ApiService::with_clock(Arc::new(topology), registry, clock.clone());
        Self { service, clock }
    }

    /// A registered connection whose read loop is not running, plus the peer's end.
    pub fn connection(&self, identity: &str) -> (Arc<PeerConnection>, Stream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let conn = PeerConnection::new(
            self.service.clone(),
            identity,
            Stream::new(ours),
            ConnectionRole::Server,
        );
        self.service.directory().register(&conn);
        (conn, Stream::new(theirs))
    }

    pub fn endpoint(&self, name: &str) -> Arc<Endpoint> {
        self.service
            .topology()
            .endpoint(name)
            .expect("fixture endpoint")
    }

    pub fn clock_now(&self) -> f64 {
        self.clock.now()
    }
}
