//! The inbound message sequence of one connection.
//!
//! [`MessageStream`] drives a [`Transport`] and the [`XmlCodec`] in a loop:
//! it drains every complete message already buffered, then performs one
//! bounded-time read. A read that times out produces [`Inbound::Idle`], so
//! callers waiting on the stream get control back regularly, and a run of
//! idle reads triggers a heartbeat. The sequence ends for good when the peer
//! closes the connection.

use std::sync::Arc;

use bytes::BytesMut;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::codec::XmlCodec;
use crate::config::SessionConfig;
use crate::error::LinkError;
use crate::message::Message;
use crate::network::transport::{ReadOutcome, Transport, WriteOutcome};
use crate::traffic::{
    CONNECTION_CLOSED, CONNECTION_RESET, SOCKET_CLOSE, SOCKET_RX_CLOSE, SOCKET_TX_CLOSE,
    TracingTraffic, TrafficLog,
};

/// One step of the inbound sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Message),
    /// Nothing arrived within the read timeout; the peer may still be alive.
    Idle,
}

impl Inbound {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Inbound::Message(msg) => Some(msg),
            Inbound::Idle => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Inbound::Message(msg) => Some(msg),
            Inbound::Idle => None,
        }
    }
}

// ── MessageStream ────────────────────────────────────────────────

/// Lazy, forward-only sequence of messages read from one connection.
pub struct MessageStream<S = TcpStream> {
    transport: Transport<S>,
    codec: XmlCodec,
    rxbuf: BytesMut,
    /// Consecutive reads that timed out with no data.
    idle_reads: u32,
    heartbeat_after: u32,
    heartbeat: Option<Message>,
    traffic: Arc<dyn TrafficLog>,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, config: &SessionConfig) -> Result<Self, LinkError> {
        config.validate()?;
        Ok(Self {
            transport: Transport::new(io, config.read_timeout(), config.read_chunk),
            codec: XmlCodec::new(),
            rxbuf: BytesMut::with_capacity(config.read_chunk),
            idle_reads: 0,
            heartbeat_after: config.heartbeat_after,
            heartbeat: config.heartbeat_message()?,
            traffic: Arc::new(TracingTraffic),
        })
    }

    /// Replace the traffic log sink.
    pub fn with_traffic_log(mut self, traffic: Arc<dyn TrafficLog>) -> Self {
        self.traffic = traffic;
        self
    }

    // ── State ────────────────────────────────────────────────────

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn tx_open(&self) -> bool {
        self.transport.tx_open()
    }

    pub fn rx_open(&self) -> bool {
        self.transport.rx_open()
    }

    pub fn idle_reads(&self) -> u32 {
        self.idle_reads
    }

    // ── Receive side ─────────────────────────────────────────────

    /// Next step of the sequence; `Ok(None)` once the peer has closed.
    ///
    /// A malformed fragment or a read error ends the sequence and is
    /// returned as the error.
    pub async fn recv(&mut self) -> Result<Option<Inbound>, LinkError> {
        loop {
            if !self.transport.rx_open() {
                return Ok(None);
            }

            match self.codec.decode(&mut self.rxbuf) {
                Ok(Some(msg)) => {
                    self.traffic.rx(&msg);
                    return Ok(Some(Inbound::Message(msg)));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("ending receive side: {e}");
                    self.transport.close_rx();
                    return Err(e);
                }
            }

            match self.transport.read(&mut self.rxbuf).await? {
                ReadOutcome::Data(_) => self.idle_reads = 0,
                ReadOutcome::TimedOut => {
                    self.idle_reads += 1;
                    if self.heartbeat_after > 0
                        && self.idle_reads >= self.heartbeat_after
                        && self.transport.tx_open()
                    {
                        self.send_heartbeat().await?;
                    }
                    return Ok(Some(Inbound::Idle));
                }
                ReadOutcome::Closed => {
                    self.rx_closed();
                    return Ok(None);
                }
            }
        }
    }

    /// Collect messages until the next idle read or the end of the stream.
    pub async fn read_available(&mut self) -> Result<Vec<Message>, LinkError> {
        let mut messages = Vec::new();
        while let Some(Inbound::Message(msg)) = self.recv().await? {
            messages.push(msg);
        }
        Ok(messages)
    }

    /// Turn the stream into a `futures::Stream` of messages, skipping idle
    /// reads. Useful for a bare listen loop.
    pub fn into_messages(self) -> impl Stream<Item = Result<Message, LinkError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            loop {
                match stream.recv().await {
                    Ok(Some(Inbound::Message(msg))) => return Some((Ok(msg), Some(stream))),
                    Ok(Some(Inbound::Idle)) => continue,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
    }

    fn rx_closed(&mut self) {
        let pending = String::from_utf8_lossy(&self.rxbuf).into_owned();
        let awaiting = self.codec.awaiting().unwrap_or_default();
        debug!(pending = %pending, awaiting = %awaiting, "peer closed the connection");
        self.traffic.rx(
            &Message::new(CONNECTION_CLOSED)
                .with_attr("pending", pending)
                .with_attr("awaiting", awaiting),
        );
    }

    /// Stop receiving. Later calls to [`recv`](Self::recv) end immediately.
    pub fn rx_close(&mut self) {
        if self.transport.rx_open() {
            self.traffic.rx(&Message::new(SOCKET_RX_CLOSE));
            self.transport.close_rx();
        }
    }

    // ── Transmit side ────────────────────────────────────────────

    /// Serialize and send `msg`. A closed transmit side makes this a no-op.
    pub async fn send(&mut self, msg: &Message) -> Result<(), LinkError> {
        if !self.transport.tx_open() {
            debug!("transmit side closed; dropping <{}>", msg.tag());
            return Ok(());
        }
        self.idle_reads = 0;
        self.traffic.tx(msg);

        let mut out = BytesMut::new();
        self.codec.encode(msg, &mut out)?;
        self.send_raw(&out).await
    }

    /// Send bytes verbatim (envelope sentinels).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if let WriteOutcome::Reset = self.transport.write_all(bytes).await? {
            self.traffic.tx(&Message::new(CONNECTION_RESET));
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<(), LinkError> {
        let Some(heartbeat) = self.heartbeat.clone() else {
            return Ok(());
        };
        debug!(
            pending = %String::from_utf8_lossy(&self.rxbuf),
            awaiting = ?self.codec.awaiting(),
            "heartbeat"
        );
        self.send(&heartbeat).await
    }

    /// Half-close: stop sending, keep receiving.
    pub async fn tx_close(&mut self) {
        if self.transport.tx_open() {
            self.traffic.tx(&Message::new(SOCKET_TX_CLOSE));
        }
        self.transport.shutdown_tx().await;
    }

    /// Close both directions and release the socket.
    pub async fn close(&mut self) {
        self.tx_close().await;
        self.rx_close();
        if !self.transport.is_closed() {
            self.traffic.tx(&Message::new(SOCKET_CLOSE));
        }
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        rx: Mutex<Vec<Message>>,
        tx: Mutex<Vec<Message>>,
    }

    impl TrafficLog for Recorder {
        fn rx(&self, msg: &Message) {
            self.rx.lock().unwrap().push(msg.clone());
        }
        fn tx(&self, msg: &Message) {
            self.tx.lock().unwrap().push(msg.clone());
        }
    }

    fn fast_config(heartbeat_after: u32) -> SessionConfig {
        SessionConfig {
            read_timeout_ms: 5,
            heartbeat_after,
            ..Default::default()
        }
    }

    fn stream(io: DuplexStream, cfg: &SessionConfig) -> MessageStream<DuplexStream> {
        MessageStream::new(io, cfg).unwrap()
    }

    #[tokio::test]
    async fn one_read_with_many_messages() {
        let (ours, mut peer) = tokio::io::duplex(256);
        let mut s = stream(ours, &fast_config(0));

        peer.write_all(b"<a/><b>x</b><c").await.unwrap();
        let first = s.recv().await.unwrap().unwrap();
        assert_eq!(first.message().map(Message::tag), Some("a"));
        let second = s.recv().await.unwrap().unwrap();
        assert_eq!(second.message().map(Message::tag), Some("b"));
        assert_eq!(s.recv().await.unwrap(), Some(Inbound::Idle));

        peer.write_all(b"/>").await.unwrap();
        let third = s.recv().await.unwrap().and_then(Inbound::into_message).unwrap();
        assert_eq!(third.tag(), "c");
    }

    #[tokio::test]
    async fn peer_close_ends_the_sequence() {
        let (ours, mut peer) = tokio::io::duplex(256);
        let log = Arc::new(Recorder::default());
        let mut s = stream(ours, &fast_config(0)).with_traffic_log(log.clone());

        peer.write_all(b"<a/><partial x='1'>").await.unwrap();
        drop(peer);

        assert!(matches!(s.recv().await.unwrap(), Some(Inbound::Message(_))));
        assert_eq!(s.recv().await.unwrap(), None);
        assert_eq!(s.recv().await.unwrap(), None);

        let rx = log.rx.lock().unwrap();
        let closed = rx.last().unwrap();
        assert_eq!(closed.tag(), CONNECTION_CLOSED);
        assert_eq!(closed.attr("pending"), Some("<partial x='1'>"));
        assert_eq!(closed.attr("awaiting"), Some("</partial>"));
    }

    #[tokio::test]
    async fn malformed_fragment_ends_the_sequence() {
        let (ours, mut peer) = tokio::io::duplex(256);
        let mut s = stream(ours, &fast_config(0));

        peer.write_all(b"<a><b></a><c/>").await.unwrap();
        assert!(matches!(s.recv().await, Err(LinkError::Malformed { .. })));
        assert_eq!(s.recv().await.unwrap(), None);
        assert!(!s.rx_open());
    }

    #[tokio::test]
    async fn heartbeat_after_threshold_idle_reads() {
        let (ours, mut peer) = tokio::io::duplex(4096);
        let mut s = stream(ours, &fast_config(3));

        for _ in 0..3 {
            assert_eq!(s.recv().await.unwrap(), Some(Inbound::Idle));
        }
        assert_eq!(s.idle_reads(), 0);
        assert_eq!(s.recv().await.unwrap(), Some(Inbound::Idle));
        assert_eq!(s.idle_reads(), 1);

        s.tx_close().await;
        let mut sent = String::new();
        peer.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent.matches("name=\"keystroke\"").count(), 1);
    }

    #[tokio::test]
    async fn no_heartbeat_once_transmit_side_is_closed() {
        let (ours, mut peer) = tokio::io::duplex(4096);
        let log = Arc::new(Recorder::default());
        let mut s = stream(ours, &fast_config(2)).with_traffic_log(log.clone());

        s.tx_close().await;
        for _ in 0..5 {
            assert_eq!(s.recv().await.unwrap(), Some(Inbound::Idle));
        }
        assert_eq!(s.idle_reads(), 5);

        let tags: Vec<_> = log.tx.lock().unwrap().iter().map(|m| m.tag().to_owned()).collect();
        assert_eq!(tags, [SOCKET_TX_CLOSE]);
        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn incoming_bytes_reset_idle_count() {
        let (ours, mut peer) = tokio::io::duplex(4096);
        let mut s = stream(ours, &fast_config(3));

        s.recv().await.unwrap();
        s.recv().await.unwrap();
        assert_eq!(s.idle_reads(), 2);

        peer.write_all(b"<pa").await.unwrap();
        assert_eq!(s.recv().await.unwrap(), Some(Inbound::Idle));
        assert_eq!(s.idle_reads(), 1);
        s.recv().await.unwrap();

        s.tx_close().await;
        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn send_after_tx_close_is_a_no_op() {
        let (ours, mut peer) = tokio::io::duplex(256);
        let log = Arc::new(Recorder::default());
        let mut s = stream(ours, &fast_config(0)).with_traffic_log(log.clone());

        s.send(&Message::new("first")).await.unwrap();
        s.tx_close().await;
        s.send(&Message::new("second")).await.unwrap();

        let mut sent = String::new();
        peer.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "<first/>");

        let tags: Vec<_> = log.tx.lock().unwrap().iter().map(|m| m.tag().to_owned()).collect();
        assert_eq!(tags, ["first", SOCKET_TX_CLOSE]);

        // In-flight traffic from the peer is still delivered.
        peer.write_all(b"<late/>").await.unwrap();
        drop(peer);
        let late = s.recv().await.unwrap().and_then(Inbound::into_message).unwrap();
        assert_eq!(late.tag(), "late");
        assert_eq!(s.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn into_messages_skips_idle_reads() {
        let (ours, mut peer) = tokio::io::duplex(256);
        let s = stream(ours, &fast_config(0));

        let writer = tokio::spawn(async move {
            peer.write_all(b"<one/>").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            peer.write_all(b"<two/>").await.unwrap();
        });

        let tags: Vec<String> = s
            .into_messages()
            .map(|m| m.unwrap().tag().to_owned())
            .collect()
            .await;
        writer.await.unwrap();
        assert_eq!(tags, ["one", "two"]);
    }
}
