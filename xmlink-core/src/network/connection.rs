//! Establishing the TCP connection to the automation peer.
//!
//! The library either dials out ([`connect`]) or waits for the peer to dial
//! in ([`accept_one`]); the latter is how a freshly launched application
//! reports back. Both yield a [`CommandProcessor`] ready for
//! [`begin`](CommandProcessor::begin).

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::LinkError;
use crate::processor::CommandProcessor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    ip: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddr> for ConnectionInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for ConnectionInfo {
    type Err = LinkError;

    /// `host:port`; the host may be a name or an address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LinkError::Config(format!("expected host:port, got {s:?}")))?;
        let port = port
            .parse()
            .map_err(|e| LinkError::Config(format!("bad port in {s:?}: {e}")))?;
        if ip.is_empty() {
            return Err(LinkError::Config(format!("missing host in {s:?}")));
        }
        Ok(Self::new(ip, port))
    }
}

/// Dial the peer.
pub async fn connect(
    info: &ConnectionInfo,
    config: &SessionConfig,
) -> Result<CommandProcessor, LinkError> {
    debug!("connecting to {info}");
    let stream = TcpStream::connect(info.to_string()).await?;
    stream.set_nodelay(true)?;
    info!("connected to {info}");
    CommandProcessor::from_io(stream, config)
}

/// Wait for exactly one incoming connection on `listener`.
///
/// `timeout` of `None` waits indefinitely.
pub async fn accept_one(
    listener: &TcpListener,
    timeout: Option<Duration>,
    config: &SessionConfig,
) -> Result<CommandProcessor, LinkError> {
    debug!("waiting for connection on {:?}", listener.local_addr().ok());
    let (stream, peer) = match timeout {
        Some(limit) => tokio::time::timeout(limit, listener.accept())
            .await
            .map_err(|_| LinkError::Timeout(limit))??,
        None => listener.accept().await?,
    };
    stream.set_nodelay(true)?;
    info!("accepted connection from {peer}");
    CommandProcessor::from_io(stream, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connection_info() {
        let info: ConnectionInfo = "localhost:54321".parse().unwrap();
        assert_eq!(info.ip(), "localhost");
        assert_eq!(info.port(), 54321);
        assert_eq!(info.to_string(), "localhost:54321");

        assert!("localhost".parse::<ConnectionInfo>().is_err());
        assert!(":80".parse::<ConnectionInfo>().is_err());
        assert!("host:http".parse::<ConnectionInfo>().is_err());
    }

    #[tokio::test]
    async fn accept_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = accept_one(
            &listener,
            Some(Duration::from_millis(20)),
            &SessionConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, LinkError::Timeout(_)));
    }

    #[tokio::test]
    async fn connect_and_accept_pair_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = ConnectionInfo::from(listener.local_addr().unwrap());
        let config = SessionConfig::default();

        let dial = tokio::spawn({
            let config = config.clone();
            async move { connect(&info, &config).await.map(|p| p.is_open()) }
        });
        let accepted = accept_one(&listener, Some(Duration::from_secs(5)), &config)
            .await
            .unwrap();
        assert!(accepted.is_open());
        assert!(dial.await.unwrap().unwrap());
    }
}
