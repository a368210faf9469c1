//! Who is connected: identified peers live in their endpoint's client set,
//! everyone else in the anonymous set.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnectionId, PeerConnection};
use crate::topology::Topology;

pub struct ConnectionDirectory {
    topology: Arc<Topology>,
    anonymous: Mutex<HashMap<ConnectionId, Arc<PeerConnection>>>,
}

impl ConnectionDirectory {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            anonymous: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, conn: &Arc<PeerConnection>) {
        match conn.endpoint() {
            Some(endpoint) => endpoint.add_client(Arc::clone(conn)),
            None => {
                self.anonymous.lock().insert(conn.id(), Arc::clone(conn));
            }
        }
    }

    /// Remove from whichever set holds the connection. False if it was not registered.
    pub fn unregister(&self, conn: &PeerConnection) -> bool {
        match conn.endpoint() {
            Some(endpoint) => endpoint.remove_client(conn.id()),
            None => self.anonymous.lock().remove(&conn.id()).is_some(),
        }
    }

    /// Active connections for an identity (empty for unknown identities).
    pub fn clients(&self, identity: &str) -> Vec<Arc<PeerConnection>> {
        self.topology
            .endpoint(identity)
            .map(|endpoint| endpoint.clients())
            .unwrap_or_default()
    }

    pub fn anonymous_clients(&self) -> Vec<Arc<PeerConnection>> {
        self.anonymous.lock().values().cloned().collect()
    }

    pub fn anonymous_count(&self) -> usize {
        self.anonymous.lock().len()
    }

    /// Every registered connection, identified and anonymous.
    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        let mut all = self.anonymous_clients();
        for endpoint in self.topology.endpoints() {
            all.extend(endpoint.clients());
        }
        all
    }
}
