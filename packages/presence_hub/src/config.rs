use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backplane::BridgeConfig;
use crate::identity::default_instance_name;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [backplane]
//                    url = "redis://cache:6379"
//
//   env var:         PRESENCE_BACKPLANE__URL=redis://cache:6379   (double underscore = nesting)
//
//   (single underscore stays within field names: PRESENCE_AUTH__TOKEN_TTL_SECS)

pub const ENV_PREFIX: &str = "PRESENCE_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub instance: InstanceFileConfig,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub backplane: BackplaneFileConfig,
    #[serde(default)]
    pub store: StoreFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
}

/// Lives under `[instance]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceFileConfig {
    /// Shown to clients as the origin of events. Defaults to the hostname.
    #[serde(default = "default_instance_name")]
    pub name: String,
}

impl Default for InstanceFileConfig {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
        }
    }
}

/// Lives under `[server]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackplaneKind {
    #[default]
    Redis,
    /// In-process only; no cross-instance fanout.
    Memory,
}

/// Lives under `[backplane]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackplaneFileConfig {
    #[serde(default)]
    pub kind: BackplaneKind,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// How long startup waits for both links before serving degraded.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

impl Default for BackplaneFileConfig {
    fn default() -> Self {
        Self {
            kind: BackplaneKind::default(),
            url: default_redis_url(),
            channel: default_channel(),
            startup_timeout_secs: default_startup_timeout_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            outbound_capacity: default_outbound_capacity(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            dedup_window: default_dedup_window(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

/// Lives under `[store]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreFileConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StoreFileConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_db_path(),
        }
    }
}

/// Lives under `[auth]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Shared by every instance. Unset means a random per-process secret.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// Lives under `[websocket]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    /// Per-connection outbound queue depth.
    #[serde(default = "default_send_capacity")]
    pub send_capacity: usize,
    /// How long a broadcast waits on a full queue before evicting the
    /// connection.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            send_capacity: default_send_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3002
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_channel() -> String {
    "presence:events".to_string()
}
fn default_startup_timeout_secs() -> u64 {
    10
}
fn default_publish_timeout_ms() -> u64 {
    500
}
fn default_outbound_capacity() -> usize {
    1024
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_secs() -> u64 {
    60
}
fn default_dedup_window() -> usize {
    4096
}
fn default_db_path() -> PathBuf {
    PathBuf::from("presence.db")
}
fn default_token_ttl_secs() -> u64 {
    3600
}
fn default_send_capacity() -> usize {
    100
}
fn default_send_timeout_ms() -> u64 {
    250
}

/// Build the layered figment: defaults, then `config_path` (if any), then
/// `PRESENCE_*` environment variables.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub instance_name: String,
    pub listen_addr: SocketAddr,
    pub backplane: BackplaneConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub websocket: WebSocketConfig,
}

impl HubConfig {
    pub fn from_file(fc: &FileConfig) -> anyhow::Result<Self> {
        let listen_addr: SocketAddr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid [server] host/port: {e}"))?;
        Ok(Self {
            instance_name: fc.instance.name.clone(),
            listen_addr,
            backplane: BackplaneConfig::from_file(&fc.backplane),
            store: StoreConfig::from_file(&fc.store),
            auth: AuthConfig::from_file(&fc.auth),
            websocket: WebSocketConfig::from_file(&fc.websocket),
        })
    }
}

#[derive(Clone, Debug)]
pub struct BackplaneConfig {
    pub kind: BackplaneKind,
    pub url: String,
    pub startup_timeout: Duration,
    pub bridge: BridgeConfig,
}

impl BackplaneConfig {
    pub fn from_file(fc: &BackplaneFileConfig) -> Self {
        Self {
            kind: fc.kind,
            url: fc.url.clone(),
            startup_timeout: Duration::from_secs(fc.startup_timeout_secs),
            bridge: BridgeConfig {
                channel: fc.channel.clone(),
                publish_timeout: Duration::from_millis(fc.publish_timeout_ms),
                outbound_capacity: fc.outbound_capacity,
                reconnect_base_delay: Duration::from_millis(fc.reconnect_base_delay_ms),
                reconnect_max_delay: Duration::from_secs(fc.reconnect_max_delay_secs),
                dedup_window: fc.dedup_window,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub path: PathBuf,
}

impl StoreConfig {
    pub fn from_file(fc: &StoreFileConfig) -> Self {
        Self {
            kind: fc.kind,
            path: fc.path.clone(),
        }
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub token_ttl: Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            jwt_secret: fc.jwt_secret.clone().filter(|s| !s.is_empty()),
            token_ttl: Duration::from_secs(fc.token_ttl_secs),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    pub send_capacity: usize,
    pub send_timeout: Duration,
}

impl WebSocketConfig {
    pub fn from_file(fc: &WebSocketFileConfig) -> Self {
        Self {
            send_capacity: fc.send_capacity.max(1),
            send_timeout: Duration::from_millis(fc.send_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_backplane_file_config_defaults() {
        let d = BackplaneFileConfig::default();
        assert_eq!(d.kind, BackplaneKind::Redis);
        assert_eq!(d.channel, "presence:events");
        assert_eq!(d.startup_timeout_secs, 10);
        assert_eq!(d.reconnect_max_delay_secs, 60);
    }

    #[test]
    fn test_auth_file_config_defaults() {
        let d = AuthFileConfig::default();
        assert!(d.jwt_secret.is_none());
        assert_eq!(d.token_ttl_secs, 3600);
    }

    #[test]
    fn test_runtime_conversion() {
        let fc = FileConfig::default();
        let config = HubConfig::from_file(&fc).unwrap();
        assert_eq!(config.listen_addr.port(), 3002);
        assert_eq!(config.backplane.startup_timeout, Duration::from_secs(10));
        assert_eq!(
            config.backplane.bridge.publish_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.websocket.send_capacity, 100);
        assert_eq!(config.websocket.send_timeout, Duration::from_millis(250));
        assert_eq!(config.auth.token_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_bad_host_rejected() {
        let mut fc = FileConfig::default();
        fc.server.host = "not an address".into();
        assert!(HubConfig::from_file(&fc).is_err());
    }

    #[test]
    fn test_empty_secret_is_unset() {
        let fc = AuthFileConfig {
            jwt_secret: Some(String::new()),
            ..Default::default()
        };
        assert!(AuthConfig::from_file(&fc).jwt_secret.is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let fc = AuthFileConfig {
            jwt_secret: Some("hunter2".into()),
            ..Default::default()
        };
        let rendered = format!("{:?}", AuthConfig::from_file(&fc));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_db_url() {
        let config = StoreConfig {
            kind: StoreKind::Sqlite,
            path: PathBuf::from("/tmp/presence.db"),
        };
        assert_eq!(config.db_url(), "sqlite:///tmp/presence.db?mode=rwc");
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let fc: FileConfig = load_config(None).extract().unwrap();
        assert_eq!(fc.server.port, 3002);
        assert_eq!(fc.store.kind, StoreKind::Sqlite);
    }

    #[test]
    fn test_load_config_missing_file_is_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.backplane.channel, "presence:events");
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[backplane]\nkind = \"memory\"\nchannel = \"custom\"\n\n[instance]\nname = \"node-7\"\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.server.host, "0.0.0.0");
        assert_eq!(fc.backplane.kind, BackplaneKind::Memory);
        assert_eq!(fc.backplane.channel, "custom");
        assert_eq!(fc.instance.name, "node-7");
    }

    #[test]
    fn test_load_config_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[websocket]\nsend_capacity = 5\n")?;
            jail.set_env("PRESENCE_WEBSOCKET__SEND_CAPACITY", "7");
            jail.set_env("PRESENCE_AUTH__JWT_SECRET", "shared");
            let fc: FileConfig = load_config(Some(Path::new("config.toml"))).extract()?;
            assert_eq!(fc.websocket.send_capacity, 7);
            assert_eq!(fc.auth.jwt_secret.as_deref(), Some("shared"));
            Ok(())
        });
    }

    #[test]
    fn test_file_config_serializes_to_toml() {
        let rendered = toml::to_string_pretty(&FileConfig::default()).unwrap();
        assert!(rendered.contains("[backplane]"));
        assert!(rendered.contains("channel = \"presence:events\""));
    }
}
