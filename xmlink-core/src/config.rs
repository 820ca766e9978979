//! Protocol session settings.
//!
//! Everything the message stream and command processor need to know about
//! timing and framing conventions lives here, so no protocol behavior is
//! hidden in global state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::message::Message;

/// No-op command sent after prolonged silence to provoke traffic.
pub const DEFAULT_HEARTBEAT: &str = "<command name='keystroke' scope='PSCAD' sequence-id='0'>\
                                     <key type='typing'></key></command>";

/// Settings for one protocol session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on a single socket read, in milliseconds.
    pub read_timeout_ms: u64,
    /// Maximum bytes requested from the socket per read.
    pub read_chunk: usize,
    /// Consecutive empty reads before a heartbeat is sent (0 disables).
    pub heartbeat_after: u32,
    /// Heartbeat message template (empty disables).
    pub heartbeat: String,
    /// Tag of the envelope element wrapping the outbound conversation.
    pub envelope: String,
    /// Scope given to commands created without an explicit one.
    pub default_scope: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2000,
            read_chunk: 1024,
            heartbeat_after: 30,
            heartbeat: DEFAULT_HEARTBEAT.into(),
            envelope: "content".into(),
            default_scope: None,
        }
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Parse the heartbeat template. `None` when heartbeats are disabled.
    pub fn heartbeat_message(&self) -> Result<Option<Message>, LinkError> {
        if self.heartbeat_after == 0 || self.heartbeat.trim().is_empty() {
            return Ok(None);
        }
        Message::parse(&self.heartbeat)
            .map(Some)
            .map_err(|e| LinkError::Config(format!("heartbeat template: {e}")))
    }

    /// Opening sentinel sent right after connecting (`<content>`).
    pub fn envelope_open(&self) -> Vec<u8> {
        format!("<{}>", self.envelope).into_bytes()
    }

    /// Closing sentinel sent to begin an orderly shutdown (`</content>`).
    pub fn envelope_close(&self) -> Vec<u8> {
        format!("</{}>", self.envelope).into_bytes()
    }

    /// Reject settings the stream cannot work with.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.read_timeout_ms == 0 {
            return Err(LinkError::Config("read_timeout_ms must be non-zero".into()));
        }
        if self.read_chunk == 0 {
            return Err(LinkError::Config("read_chunk must be non-zero".into()));
        }
        if self.envelope.is_empty() || self.envelope.contains(['<', '>', ' ']) {
            return Err(LinkError::Config(format!(
                "invalid envelope tag {:?}",
                self.envelope
            )));
        }
        self.heartbeat_message().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heartbeat_parses() {
        let hb = SessionConfig::default().heartbeat_message().unwrap().unwrap();
        assert_eq!(hb.attr("name"), Some("keystroke"));
        assert_eq!(hb.correlation_id(), Some("0"));
        assert_eq!(hb.find("key").and_then(|k| k.attr("type")), Some("typing"));
    }

    #[test]
    fn heartbeat_disabled_by_threshold_or_template() {
        let cfg = SessionConfig {
            heartbeat_after: 0,
            ..Default::default()
        };
        assert!(cfg.heartbeat_message().unwrap().is_none());

        let cfg = SessionConfig {
            heartbeat: "  ".into(),
            ..Default::default()
        };
        assert!(cfg.heartbeat_message().unwrap().is_none());
    }

    #[test]
    fn bad_heartbeat_is_config_error() {
        let cfg = SessionConfig {
            heartbeat: "<oops>".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(LinkError::Config(_))));
    }

    #[test]
    fn envelope_sentinels() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.envelope_open(), b"<content>");
        assert_eq!(cfg.envelope_close(), b"</content>");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg: SessionConfig = toml::from_str("read_timeout_ms = 250").unwrap();
        assert_eq!(cfg.read_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.heartbeat_after, 30);
        assert_eq!(cfg.envelope, "content");
    }
}
