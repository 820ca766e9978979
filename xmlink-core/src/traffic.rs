//! Rx/Tx traffic logging.
//!
//! Every message that crosses the connection, plus the transport's own
//! lifecycle events, is reported to a [`TrafficLog`]. Lifecycle events are
//! expressed as small pseudo-messages so a single sink can record the whole
//! conversation in order.

use crate::message::Message;

/// Pseudo-message: transmit side half-closed.
pub const SOCKET_TX_CLOSE: &str = "socket-tx-close";
/// Pseudo-message: receive side closed locally.
pub const SOCKET_RX_CLOSE: &str = "socket-rx-close";
/// Pseudo-message: socket fully closed.
pub const SOCKET_CLOSE: &str = "socket-close";
/// Pseudo-message: a write found the connection reset.
pub const CONNECTION_RESET: &str = "connection-reset";
/// Pseudo-message: the peer closed the connection. Carries `pending`
/// (unparsed receive buffer) and `awaiting` (expected end tag) attributes.
pub const CONNECTION_CLOSED: &str = "connection-closed";

/// Sink for received and transmitted messages.
pub trait TrafficLog: Send + Sync {
    fn rx(&self, msg: &Message);
    fn tx(&self, msg: &Message);
}

/// Default sink: `trace`-level events on the `xmlink::rx` and `xmlink::tx`
/// targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTraffic;

impl TrafficLog for TracingTraffic {
    fn rx(&self, msg: &Message) {
        tracing::trace!(target: "xmlink::rx", "{msg}");
    }

    fn tx(&self, msg: &Message) {
        tracing::trace!(target: "xmlink::tx", "{msg}");
    }
}
