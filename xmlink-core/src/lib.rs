//! # xmlink-core
//!
//! Streaming XML command/response protocol over a single TCP connection,
//! as spoken by a remote automation peer.
//!
//! This crate contains:
//! - **Message**: `Message`, an owned XML element tree with path lookups
//! - **Codec**: `XmlCodec`, which finds complete top-level elements in a byte stream
//! - **Network**: `Transport` (half-closable socket with read timeouts),
//!   `MessageStream` (framing, liveness heartbeat, traffic log), and
//!   `connect` / `accept_one`
//! - **Commands**: `Command` and `CommandScope` builders
//! - **Processor**: `CommandProcessor`, which correlates responses by
//!   sequence id and dispatches unsolicited events to the `HandlerChain`
//! - **Error**: `LinkError`, a typed, `thiserror`-based error hierarchy

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod network;
pub mod processor;
pub mod scope;
pub mod traffic;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::XmlCodec;
pub use command::{Command, add_param};
pub use config::SessionConfig;
pub use error::LinkError;
pub use handler::{
    BuildEvents, Consumer, Disposition, Handler, HandlerChain, HandlerRef, ResponseHook,
};
pub use message::{ATTR_SEQUENCE_ID, ATTR_SUCCESS, Message, Text};
pub use network::{
    ConnectionInfo, Inbound, MessageStream, ReadOutcome, Transport, WriteOutcome, accept_one,
    connect,
};
pub use processor::{BUILD_EVENTS, CommandProcessor, SUBSCRIPTION_SCOPE};
pub use scope::CommandScope;
pub use traffic::{TracingTraffic, TrafficLog};
