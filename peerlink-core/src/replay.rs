//! Log replay positions.
//!
//! Each side tells the other how far it has processed the other's log by sending
//! `log::SetLogPosition` on the keep-alive timer. On reconnect, replay can then resume
//! from the stored position instead of the start of the log.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::connection::MessageOrigin;
use crate::protocol::Message;
use crate::registry::RpcResult;
use crate::service::ApiService;
use crate::LOG_TARGET;

/// Handler for `log::SetLogPosition`: raise the origin endpoint's local log position.
/// Anonymous origins and malformed params are ignored.
pub fn set_log_position(origin: &MessageOrigin, params: &Value) -> RpcResult {
    let Some(position) = params.get("log_position").and_then(Value::as_f64) else {
        return Ok(Value::Null);
    };
    let Some(endpoint) = origin.client().endpoint() else {
        return Ok(Value::Null);
    };
    if endpoint.advance_local_log_position(position) {
        trace!(
            target: LOG_TARGET,
            endpoint = endpoint.name(),
            position,
            "Updated local log position"
        );
    }
    Ok(Value::Null)
}

/// A peer that does not take an announcement within this window is disconnected.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send our remote log position to every connected endpoint that has one. Each send
/// runs on its own task so a peer that stopped reading cannot hold up the caller.
/// Returns the number of announcements started.
pub fn announce_log_positions(service: &ApiService) -> usize {
    let mut started = 0;
    for endpoint in service.topology().endpoints() {
        let position = endpoint.remote_log_position();
        if position <= 0.0 {
            continue;
        }
        trace!(
            target: LOG_TARGET,
            endpoint = endpoint.name(),
            position,
            "Announcing log position"
        );
        for client in endpoint.clients() {
            let message = Message::log_position(position);
            tokio::spawn(async move {
                if tokio::time::timeout(ANNOUNCE_TIMEOUT, client.send_message(&message))
                    .await
                    .is_err()
                {
                    debug!(
                        target: LOG_TARGET,
                        identity = client.identity(),
                        "Timed out announcing log position to '{}'",
                        client.identity()
                    );
                    client.disconnect().await;
                }
            });
            started += 1;
        }
    }
    started
}
