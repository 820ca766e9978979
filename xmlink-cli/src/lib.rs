//! # xmlink-cli — command-line client
//!
//! Connects to (or accepts a connection from) an automation peer speaking
//! the xmlink protocol and either runs one command or prints the event
//! stream.
//!
//! ## Actions
//!
//! - **Exec**: send one command, optionally wait for and print its response.
//! - **Watch**: subscribe to event streams and print every message until
//!   the peer closes or Ctrl-C is pressed.

pub mod config;
pub mod session;
