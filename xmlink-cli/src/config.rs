//! Configuration for the xmlink client.

use std::path::Path;

use serde::{Deserialize, Serialize};
use xmlink_core::SessionConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the peer is.
    pub network: NetworkConfig,
    /// Protocol session settings.
    pub session: SessionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` to dial.
    pub connect: String,
    /// `host:port` to listen on instead; the peer dials in.
    pub listen: Option<String>,
    /// How long to wait for the peer to dial in, in milliseconds (0 waits
    /// indefinitely).
    pub accept_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect: "127.0.0.1:54321".into(),
            listen: None,
            accept_timeout_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AppConfig {
    /// Read configuration from a TOML file. `Ok(None)` when there is no
    /// readable file at `path`. Nothing is logged here, so this can run
    /// before tracing is set up.
    pub fn read(path: &Path) -> Result<Option<Self>, toml::de::Error> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map(Some),
            Err(_) => Ok(None),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(text.contains("connect"));
        assert!(text.contains("heartbeat_after"));
        assert!(text.contains("level"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.accept_timeout_ms, 30_000);
        assert_eq!(parsed.session, SessionConfig::default());
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [network]
            listen = "0.0.0.0:50000"

            [session]
            heartbeat_after = 5
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.listen.as_deref(), Some("0.0.0.0:50000"));
        assert_eq!(parsed.network.connect, "127.0.0.1:54321");
        assert_eq!(parsed.session.heartbeat_after, 5);
        assert_eq!(parsed.session.read_chunk, 1024);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let read = AppConfig::read(Path::new("/nonexistent/xmlink.toml")).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn invalid_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("xmlink-invalid-{}.toml", std::process::id()));
        std::fs::write(&path, "[network]\naccept_timeout_ms = \"soon\"\n").unwrap();
        let read = AppConfig::read(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(read.is_err());
    }
}
