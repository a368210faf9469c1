//! Zone hierarchy and endpoint registry.
//!
//! The topology itself is immutable once built; each `Endpoint` carries the mutable
//! replay and connection state that read loops and the liveness supervisor share.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnectionId, PeerConnection};

/// Default cluster port.
pub const DEFAULT_PORT: u16 = 5665;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    name: String,
    parent: Option<String>,
}

impl Zone {
    pub fn new(name: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            name: name.into(),
            parent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}

/// A cluster node. Identity is its name; replay positions are timestamps (seconds).
pub struct Endpoint {
    name: String,
    zone: String,
    host: Option<String>,
    port: u16,
    keep_alive: f64,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    /// How far the peer has processed our log.
    local_log_position: f64,
    /// How far we have processed the peer's messages.
    remote_log_position: f64,
    syncing: bool,
    clients: HashMap<ConnectionId, Arc<PeerConnection>>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
            host: None,
            port: DEFAULT_PORT,
            keep_alive: 0.0,
            state: Mutex::new(EndpointState::default()),
        }
    }

    /// Seconds of silence after which connections are closed. Zero or less disables it.
    pub fn with_keep_alive(mut self, secs: f64) -> Self {
        self.keep_alive = secs;
        self
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_name(&self) -> &str {
        &self.zone
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn keep_alive(&self) -> f64 {
        self.keep_alive
    }

    pub fn local_log_position(&self) -> f64 {
        self.state.lock().local_log_position
    }

    pub fn remote_log_position(&self) -> f64 {
        self.state.lock().remote_log_position
    }

    /// Raise the local log position. Returns false (and changes nothing) unless
    /// `position` is strictly greater than the current value.
    pub fn advance_local_log_position(&self, position: f64) -> bool {
        let mut state = self.state.lock();
        if position > state.local_log_position {
            state.local_log_position = position;
            true
        } else {
            false
        }
    }

    /// Accept a message stamped `ts` from this peer: false if it is older than the
    /// remote log position (stale), otherwise the position moves up to `ts`.
    pub fn advance_remote_log_position(&self, ts: f64) -> bool {
        let mut state = self.state.lock();
        if ts < state.remote_log_position {
            return false;
        }
        state.remote_log_position = ts;
        true
    }

    pub fn syncing(&self) -> bool {
        self.state.lock().syncing
    }

    /// While syncing, keep-alive timeouts are not enforced for this endpoint.
    pub fn set_syncing(&self, syncing: bool) {
        self.state.lock().syncing = syncing;
    }

    /// Snapshot of the active connections for this identity.
    pub fn clients(&self) -> Vec<Arc<PeerConnection>> {
        self.state.lock().clients.values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn is_connected(&self) -> bool {
        self.client_count() > 0
    }

    pub(crate) fn add_client(&self, client: Arc<PeerConnection>) {
        self.state.lock().clients.insert(client.id(), client);
    }

    pub(crate) fn remove_client(&self, id: ConnectionId) -> bool {
        self.state.lock().clients.remove(&id).is_some()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("zone", &self.zone)
            .field("keep_alive", &self.keep_alive)
            .field("local_log_position", &state.local_log_position)
            .field("remote_log_position", &state.remote_log_position)
            .field("syncing", &state.syncing)
            .field("clients", &state.clients.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct Topology {
    local_zone: Arc<Zone>,
    zones: HashMap<String, Arc<Zone>>,
    endpoints: HashMap<String, Arc<Endpoint>>,
}

impl Topology {
    pub fn builder(local_zone: impl Into<String>) -> TopologyBuilder {
        TopologyBuilder::new(local_zone)
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(name).cloned()
    }

    pub fn zone(&self, name: &str) -> Option<Arc<Zone>> {
        self.zones.get(name).cloned()
    }

    pub fn local_zone(&self) -> &Arc<Zone> {
        &self.local_zone
    }

    pub fn is_local_zone(&self, name: &str) -> bool {
        self.local_zone.name() == name
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.values()
    }

    pub fn zones(&self) -> impl Iterator<Item = &Arc<Zone>> {
        self.zones.values()
    }
}

/// Collects zones and endpoints, then validates names and references in `build()`.
pub struct TopologyBuilder {
    local_zone: String,
    zones: Vec<Zone>,
    endpoints: Vec<Endpoint>,
}

impl TopologyBuilder {
    pub fn new(local_zone: impl Into<String>) -> Self {
        Self {
            local_zone: local_zone.into(),
            zones: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn zone(mut self, name: impl Into<String>, parent: Option<&str>) -> Self {
        self.zones.push(Zone::new(name, parent.map(str::to_owned)));
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn has_zone(&self, name: &str) -> bool {
        self.zones.iter().any(|z| z.name() == name)
    }

    pub fn has_endpoint(&self, name: &str) -> bool {
        self.endpoints.iter().any(|e| e.name() == name)
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut zones = HashMap::with_capacity(self.zones.len());
        for zone in self.zones {
            let name = zone.name().to_owned();
            if zones.insert(name.clone(), Arc::new(zone)).is_some() {
                return Err(TopologyError::DuplicateZone(name));
            }
        }
        for zone in zones.values() {
            if let Some(parent) = zone.parent() {
                if !zones.contains_key(parent) {
                    return Err(TopologyError::UnknownParent {
                        zone: zone.name().to_owned(),
                        parent: parent.to_owned(),
                    });
                }
            }
        }
        let local_zone = zones
            .get(&self.local_zone)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownLocalZone(self.local_zone.clone()))?;

        let mut endpoints = HashMap::with_capacity(self.endpoints.len());
        for endpoint in self.endpoints {
            if !zones.contains_key(endpoint.zone_name()) {
                return Err(TopologyError::UnknownZone {
                    endpoint: endpoint.name().to_owned(),
                    zone: endpoint.zone_name().to_owned(),
                });
            }
            let name = endpoint.name().to_owned();
            if endpoints.insert(name.clone(), Arc::new(endpoint)).is_some() {
                return Err(TopologyError::DuplicateEndpoint(name));
            }
        }

        Ok(Topology {
            local_zone,
            zones,
            endpoints,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("zone '{0}' is defined more than once")]
    DuplicateZone(String),
    #[error("endpoint '{0}' is defined more than once")]
    DuplicateEndpoint(String),
    #[error("zone '{zone}' has unknown parent zone '{parent}'")]
    UnknownParent { zone: String, parent: String },
    #[error("endpoint '{endpoint}' references unknown zone '{zone}'")]
    UnknownZone { endpoint: String, zone: String },
    #[error("local zone '{0}' is not defined")]
    UnknownLocalZone(String),
}
