//! Cluster peer-connection engine.
//! One `PeerConnection` per remote node: framed JSON-RPC read loop, function dispatch,
//! replay-position tracking. A keep-alive timer closes connections that went silent.

pub mod clock;
pub mod connection;
pub mod directory;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod service;
pub mod stream;
pub mod supervisor;
pub mod topology;
pub mod wire;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionId, ConnectionRole, MessageOrigin, PeerConnection};
pub use directory::ConnectionDirectory;
pub use protocol::{Message, PROTOCOL_VERSION, SET_LOG_POSITION};
pub use registry::{RegistryError, RpcError, RpcFunctionRegistry, RpcHandler, RpcResult};
pub use service::ApiService;
pub use stream::{Stream, StreamError};
pub use supervisor::{LivenessSupervisor, ANONYMOUS_TIMEOUT, SWEEP_INTERVAL};
pub use topology::{Endpoint, Topology, TopologyBuilder, TopologyError, Zone};
pub use wire::{decode_payload, encode_frame, frame_len, FrameDecodeError, FrameEncodeError};

/// Log target for connection lifecycle and dispatch events.
pub const LOG_TARGET: &str = "peerlink::remote";
