//! Link configuration.
//!
//! Loaded from TOML. Every section is optional and falls back to the
//! defaults the storefront ships with:
//! - `reconnect`: backoff policy
//! - `heartbeat`: liveness probing
//! - `storage`: where the chat session id is kept

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::channel::{
    ChannelBuilder, FileSessionStore, HeartbeatConfig, MemorySessionStore, ReconnectPolicy,
    SessionStore,
};
use crate::endpoint::{websocket_base, ChannelKind};
use crate::error::LinkError;
use crate::network::NetworkObserver;
use crate::transport::WebSocketConnector;

/// File holding persisted session ids inside the data directory.
pub const SESSIONS_FILE: &str = "sessions.json";

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Where channel state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Override for the data directory. Defaults to the platform data
    /// directory plus `leafline`.
    pub data_dir: Option<PathBuf>,
    /// Keep the chat session id across restarts.
    pub persist_chat_session: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            persist_chat_session: true,
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Top-level link configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// API base address (`http(s)://...`); WebSocket endpoints are derived from it.
    pub base_url: String,
    /// Upper bound on a single transport open.
    #[serde(
        rename = "connect_timeout_ms",
        with = "duration_ms",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl LinkConfig {
    /// A default configuration pointing at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: default_connect_timeout(),
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LinkError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, LinkError> {
        let config: Self =
            toml::from_str(content).map_err(|e| LinkError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, LinkError> {
        toml::to_string_pretty(self).map_err(|e| LinkError::Config(format!("cannot render TOML: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), LinkError> {
        self.endpoint_base()?;

        if self.connect_timeout.is_zero() {
            return Err(LinkError::Config(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let policy = &self.reconnect;
        if policy.base_delay.is_zero() {
            return Err(LinkError::Config(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if !policy.multiplier.is_finite() || policy.multiplier <= 1.0 {
            return Err(LinkError::Config(
                "reconnect.multiplier must be greater than 1".to_string(),
            ));
        }
        if policy.max_delay < policy.base_delay {
            return Err(LinkError::Config(
                "reconnect.max_delay_ms cannot be below base_delay_ms".to_string(),
            ));
        }
        if policy.max_attempts == Some(0) {
            return Err(LinkError::Config(
                "reconnect.max_attempts must be at least 1 (omit for unlimited)".to_string(),
            ));
        }

        if self.heartbeat.enabled {
            if self.heartbeat.interval.is_zero() {
                return Err(LinkError::Config(
                    "heartbeat.interval_ms must be greater than 0".to_string(),
                ));
            }
            if self.heartbeat.max_missed_probes == 0 {
                return Err(LinkError::Config(
                    "heartbeat.max_missed_probes must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Parsed base address.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an http(s) or ws(s) URL.
    pub fn endpoint_base(&self) -> Result<Url, LinkError> {
        if self.base_url.is_empty() {
            return Err(LinkError::Config("base_url cannot be empty".to_string()));
        }
        let url = Url::parse(&self.base_url)
            .map_err(|e| LinkError::Config(format!("invalid base_url '{}': {e}", self.base_url)))?;
        websocket_base(&url).map_err(|e| LinkError::Config(e.to_string()))?;
        Ok(url)
    }

    /// Resolved data directory, if the platform has one.
    #[must_use]
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.storage
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("leafline")))
    }

    /// Session store for a channel of `kind`.
    ///
    /// Chat sessions go to `<data_dir>/sessions.json` when persistence is
    /// enabled; everything else stays in memory.
    #[must_use]
    pub fn session_store(&self, kind: &ChannelKind) -> Arc<dyn SessionStore> {
        match (kind, self.storage.persist_chat_session, self.data_dir()) {
            (ChannelKind::Chat, true, Some(dir)) => {
                Arc::new(FileSessionStore::new(dir.join(SESSIONS_FILE)))
            }
            _ => Arc::new(MemorySessionStore::new()),
        }
    }

    /// Builder for a WebSocket channel of `kind` wired with this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base address is invalid.
    pub fn channel_builder(
        &self,
        kind: ChannelKind,
        network: Arc<NetworkObserver>,
    ) -> Result<ChannelBuilder<WebSocketConnector>, LinkError> {
        let base = self.endpoint_base()?;
        let connector = WebSocketConnector::new().with_connect_timeout(self.connect_timeout);
        let store = self.session_store(&kind);

        Ok(ChannelBuilder::new(kind, base, connector)
            .with_reconnect_policy(self.reconnect.clone())
            .with_heartbeat(self.heartbeat.clone())
            .with_network_observer(network)
            .with_session_store(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn test_parse_minimal_config() {
        let config =
            LinkConfig::from_toml(r#"base_url = "https://shop.example.com""#).expect("minimal");

        assert_eq!(config.base_url, "https://shop.example.com");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect, ReconnectPolicy::standard());
        assert!(config.heartbeat.enabled);
        assert!(config.storage.persist_chat_session);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            base_url = "http://localhost:8000"
            connect_timeout_ms = 2500

            [reconnect]
            base_delay_ms = 1000
            multiplier = 2.0
            max_delay_ms = 30000
            max_attempts = 5

            [heartbeat]
            enabled = true
            interval_ms = 15000
            max_missed_probes = 2

            [storage]
            data_dir = "/tmp/leafline"
            persist_chat_session = false
        "#;

        let config = LinkConfig::from_toml(toml).expect("full config");
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.reconnect, ReconnectPolicy::legacy_doubling());
        assert_eq!(config.heartbeat.interval, Duration::from_secs(15));
        assert_eq!(config.heartbeat.max_missed_probes, 2);
        assert_eq!(config.data_dir(), Some(PathBuf::from("/tmp/leafline")));
        assert!(!config.storage.persist_chat_session);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let toml = r#"
            base_url = "https://shop.example.com"
            [reconnect]
            base_delay_ms = 500
        "#;
        let config = LinkConfig::from_toml(toml).expect("config");
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, Some(10));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            (r#"base_url = """#, "base_url"),
            (r#"base_url = "ftp://x""#, "scheme"),
            (r#"base_url = "not a url""#, "invalid base_url"),
            (
                "base_url = \"https://x\"\nconnect_timeout_ms = 0",
                "connect_timeout_ms",
            ),
            (
                "base_url = \"https://x\"\n[reconnect]\nmultiplier = 1.0",
                "multiplier",
            ),
            (
                "base_url = \"https://x\"\n[reconnect]\nbase_delay_ms = 0",
                "base_delay_ms",
            ),
            (
                "base_url = \"https://x\"\n[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 1000",
                "max_delay_ms",
            ),
            (
                "base_url = \"https://x\"\n[reconnect]\nmax_attempts = 0",
                "max_attempts",
            ),
            (
                "base_url = \"https://x\"\n[heartbeat]\ninterval_ms = 0",
                "interval_ms",
            ),
            (
                "base_url = \"https://x\"\n[heartbeat]\nmax_missed_probes = 0",
                "max_missed_probes",
            ),
        ];

        for (toml, needle) in cases {
            let err = LinkConfig::from_toml(toml).expect_err(toml);
            assert!(
                err.to_string().contains(needle),
                "error for {toml:?} should mention {needle}: {err}"
            );
        }
    }

    #[test]
    fn test_disabled_heartbeat_skips_its_checks() {
        let toml = "base_url = \"https://x\"\n[heartbeat]\nenabled = false\ninterval_ms = 0";
        assert!(LinkConfig::from_toml(toml).is_ok());
    }

    #[test]
    fn test_invalid_toml() {
        let result = LinkConfig::from_toml("base_url = ");
        assert!(matches!(result, Err(LinkError::Config(msg)) if msg.contains("invalid TOML")));
    }

    #[test]
    fn test_from_file() {
        let file = create_temp_config(r#"base_url = "https://shop.example.com""#);
        let config = LinkConfig::from_file(file.path()).expect("should load");
        assert_eq!(config.base_url, "https://shop.example.com");
    }

    #[test]
    fn test_from_missing_file() {
        let result = LinkConfig::from_file("/nonexistent/leafline.toml");
        assert!(matches!(result, Err(LinkError::Config(msg)) if msg.contains("failed to read")));
    }

    #[test]
    fn test_to_toml_reparses() {
        let mut config = LinkConfig::new("https://shop.example.com");
        config.storage.data_dir = Some(PathBuf::from("/var/lib/leafline"));
        let rendered = config.to_toml().expect("render");
        assert!(rendered.contains("base_delay_ms = 1000"));
        assert_eq!(LinkConfig::from_toml(&rendered).expect("reparse"), config);
    }

    #[test]
    fn test_session_store_selection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = LinkConfig::new("https://shop.example.com");
        config.storage.data_dir = Some(dir.path().to_path_buf());

        let chat = config.session_store(&ChannelKind::Chat);
        chat.save("chat_session_id", "abc").expect("save");
        assert!(dir.path().join(SESSIONS_FILE).exists());

        let tracking = config.session_store(&ChannelKind::tracking("d-1"));
        tracking.save("delivery_d-1_session_id", "xyz").expect("save");
        let written = std::fs::read_to_string(dir.path().join(SESSIONS_FILE)).expect("read");
        assert!(!written.contains("xyz"));
    }

    #[test]
    fn test_session_store_memory_when_not_persisting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = LinkConfig::new("https://shop.example.com");
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.storage.persist_chat_session = false;

        config
            .session_store(&ChannelKind::Chat)
            .save("chat_session_id", "abc")
            .expect("save");
        assert!(!dir.path().join(SESSIONS_FILE).exists());
    }
}
