pub mod connection;
pub mod stream;
pub mod transport;

pub use connection::{ConnectionInfo, accept_one, connect};
pub use stream::{Inbound, MessageStream};
pub use transport::{ReadOutcome, Transport, WriteOutcome};
