//! One client session: open the connection, perform an action, shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{info, warn};

use xmlink_core::{
    CommandProcessor, ConnectionInfo, Disposition, HandlerRef, LinkError, Message, accept_one,
    connect,
};

use crate::config::AppConfig;

/// What to do once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send one command.
    Exec {
        name: String,
        scope: Option<String>,
        params: Vec<(String, String)>,
        /// Wait for the response and print it.
        wait: bool,
    },
    /// Subscribe to `subscribe` and print every message until the peer
    /// closes or the process is interrupted.
    Watch { subscribe: Vec<String> },
}

// ── Session ──────────────────────────────────────────────────────

pub struct Session {
    config: AppConfig,
}

impl Session {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Dial the peer, or wait for it to dial in when a listen address is
    /// configured.
    pub async fn open(&self) -> Result<CommandProcessor, LinkError> {
        let network = &self.config.network;
        match &network.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("listening on {addr}");
                let timeout = Some(Duration::from_millis(network.accept_timeout_ms))
                    .filter(|t| !t.is_zero());
                accept_one(&listener, timeout, &self.config.session).await
            }
            None => {
                let info: ConnectionInfo = network.connect.parse()?;
                connect(&info, &self.config.session).await
            }
        }
    }

    /// Open the connection, perform `action`, and close the connection
    /// in an orderly way whatever the outcome.
    pub async fn run(&self, action: &Action) -> Result<(), LinkError> {
        let mut processor = self.open().await?;
        let result = perform(&mut processor, action).await;

        match processor.close_connection().await {
            Ok(drained) => {
                for msg in drained {
                    println!("{msg}");
                }
            }
            Err(e) => warn!("error while closing the connection: {e}"),
        }
        result
    }
}

/// Send the envelope and carry out `action` on an open connection.
pub async fn perform<S>(processor: &mut CommandProcessor<S>, action: &Action) -> Result<(), LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    processor.begin().await?;
    match action {
        Action::Exec {
            name,
            scope,
            params,
            wait,
        } => {
            let mut cmd = match scope {
                Some(scope) => processor.command_in(name, scope),
                None => processor.command(name),
            };
            for (key, value) in params {
                cmd.param(key, value.as_str());
            }
            if *wait {
                let resp = processor.execute(cmd).await?;
                println!("{resp}");
            } else {
                processor.send(cmd).await?;
            }
            Ok(())
        }
        Action::Watch { subscribe } => watch(processor, subscribe).await,
    }
}

async fn watch<S>(processor: &mut CommandProcessor<S>, subscribe: &[String]) -> Result<(), LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let printer: HandlerRef = Arc::new(|msg: &Message| {
        println!("{msg}");
        Disposition::Ignored
    });
    processor.add_handler(printer.clone());

    for name in subscribe {
        let resp = processor.subscribe(name, None).await?;
        if !resp.is_success() {
            warn!("subscription to {name} refused");
        }
    }

    let stopped = tokio::select! {
        result = processor.listen() => {
            result?;
            info!("peer closed the connection");
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            true
        }
    };

    if stopped && processor.is_open() {
        for name in subscribe {
            if let Err(e) = processor.unsubscribe(name).await {
                warn!("unsubscribe {name}: {e}");
                break;
            }
        }
    }
    processor.remove_handler(&printer);
    Ok(())
}

/// Parse a `key=value` command parameter.
pub fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("missing parameter name in {s:?}"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use xmlink_core::SessionConfig;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            read_timeout_ms: 10,
            heartbeat_after: 0,
            ..Default::default()
        }
    }

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(
            parse_param("expr=a=b").unwrap(),
            ("expr".to_owned(), "a=b".to_owned())
        );
        assert_eq!(parse_param("flag=").unwrap(), ("flag".to_owned(), String::new()));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[tokio::test]
    async fn exec_without_wait_sends_enveloped_command() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let mut processor = CommandProcessor::from_io(ours, &fast_config()).unwrap();

        let action = Action::Exec {
            name: "run-project".into(),
            scope: Some("Project".into()),
            params: vec![("steps".into(), "10".into())],
            wait: false,
        };
        perform(&mut processor, &action).await.unwrap();
        processor.close_connection().await.unwrap();

        let mut sent = String::new();
        theirs.read_to_string(&mut sent).await.unwrap();
        assert_eq!(
            sent,
            "<content>\
             <command name=\"run-project\" scope=\"Project\" sequence-id=\"1\">\
             <param name=\"steps\" value=\"10\"/></command>\
             </content>"
        );
    }

    #[tokio::test]
    async fn session_dials_configured_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = AppConfig::default();
        config.network.connect = listener.local_addr().unwrap().to_string();
        config.session = fast_config();

        let peer = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 256];
            while !String::from_utf8_lossy(&seen).contains("sequence-id=\"1\"/>") {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending the command");
                seen.extend_from_slice(&buf[..n]);
            }
            sock.write_all(b"<response sequence-id='1' success='true'/>")
                .await
                .unwrap();
            sock.read_to_end(&mut seen).await.unwrap();
            String::from_utf8(seen).unwrap()
        });

        let action = Action::Exec {
            name: "get-version".into(),
            scope: None,
            params: Vec::new(),
            wait: true,
        };
        Session::new(config).run(&action).await.unwrap();

        let transcript = peer.await.unwrap();
        assert!(transcript.starts_with("<content>"));
        assert!(transcript.ends_with("</content>"));
    }
}
