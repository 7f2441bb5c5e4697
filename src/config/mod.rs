use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "thinkdevice.toml";
const ENV_PREFIX: &str = "THINKDEVICE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub platform: PlatformConfig,
    pub channel: ChannelConfig,
    pub storage: StorageConfig,
    pub link: LinkConfig,
    pub scenes: ScenesConfig,
    pub locks: LocksConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub api_url: String,
    pub socket_url: String,
    pub app_url: String,
    pub timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.thinkautomatic.io/v1/".to_string(),
            socket_url: "wss://socket.thinkautomatic.io".to_string(),
            app_url: "https://app.thinkautomatic.io".to_string(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Duplex WebSocket with server pings.
    Push,
    /// Server-sent event stream plus periodic keep-alive calls.
    Pull,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub transport: Transport,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub stream_idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub stream_url: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Push,
            min_backoff_ms: 100,
            max_backoff_ms: 15_000,
            heartbeat_timeout_ms: 30_000,
            stream_idle_timeout_secs: 20 * 60,
            keepalive_interval_secs: 15 * 60,
            stream_url: None,
        }
    }
}

impl ChannelConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub identity_path: PathBuf,
    pub scene_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from("device.json"),
            scene_path: PathBuf::from("sceneTriggerData.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfig {
    pub enabled: bool,
    pub bind_host: String,
    pub port: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_host: "0.0.0.0".to_string(),
            port: 3205,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenesConfig {
    pub dedupe_patches: bool,
    /// Mark patches that matched a scene with `"silent": true`.
    pub silent_patches: bool,
    pub room_timeout_ms: u64,
    pub history_limit: usize,
    pub sweep_interval_ms: u64,
}

impl Default for ScenesConfig {
    fn default() -> Self {
        Self {
            dedupe_patches: true,
            silent_patches: false,
            room_timeout_ms: 20_000,
            history_limit: 256,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ScenesConfig {
    pub fn room_timeout(&self) -> Duration {
        Duration::from_millis(self.room_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocksConfig {
    pub dir: Option<PathBuf>,
    pub wait_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            dir: None,
            wait_ms: 10_000,
        }
    }
}

impl LocksConfig {
    pub fn lock_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(env::temp_dir)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Properties announced to the platform on create/update.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: Option<String>,
    pub device_type_uuid: Option<String>,
    pub properties: Map<String, Value>,
}

impl DeviceConfig {
    pub fn desired_properties(&self) -> Map<String, Value> {
        let mut props = self.properties.clone();
        if let Some(name) = &self.name {
            props.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(uuid) = &self.device_type_uuid {
            props.insert("deviceTypeUuid".to_string(), Value::String(uuid.clone()));
        }
        props
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unparsable config file"
                ),
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Platform
        if let Ok(val) = env::var(format!("{}API_URL", ENV_PREFIX)) {
            self.platform.api_url = val;
        }
        if let Ok(val) = env::var(format!("{}SOCKET_URL", ENV_PREFIX)) {
            self.platform.socket_url = val;
        }
        if let Ok(val) = env::var(format!("{}APP_URL", ENV_PREFIX)) {
            self.platform.app_url = val;
        }

        // Channel
        if let Ok(val) = env::var(format!("{}TRANSPORT", ENV_PREFIX)) {
            match val.to_ascii_lowercase().as_str() {
                "push" => self.channel.transport = Transport::Push,
                "pull" => self.channel.transport = Transport::Pull,
                other => tracing::warn!(value = %other, "unknown transport override"),
            }
        }
        if let Ok(val) = env::var(format!("{}STREAM_URL", ENV_PREFIX)) {
            self.channel.stream_url = Some(val);
        }
        if let Ok(val) = env::var(format!("{}KEEPALIVE_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.channel.keepalive_interval_secs = secs;
            }
        }

        // Storage
        if let Ok(val) = env::var(format!("{}IDENTITY_PATH", ENV_PREFIX)) {
            self.storage.identity_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var(format!("{}SCENE_PATH", ENV_PREFIX)) {
            self.storage.scene_path = PathBuf::from(val);
        }

        // Link server
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.link.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}LINK_ENABLED", ENV_PREFIX)) {
            self.link.enabled = val.parse().unwrap_or(true);
        }

        // Scenes
        if let Ok(val) = env::var(format!("{}SILENT_PATCHES", ENV_PREFIX)) {
            self.scenes.silent_patches = val.parse().unwrap_or(false);
        }

        // Locks
        if let Ok(val) = env::var(format!("{}LOCK_DIR", ENV_PREFIX)) {
            self.locks.dir = Some(PathBuf::from(val));
        }

        // Device
        if let Ok(val) = env::var(format!("{}DEVICE_NAME", ENV_PREFIX)) {
            self.device.name = Some(val);
        }
        if let Ok(val) = env::var(format!("{}DEVICE_TYPE_UUID", ENV_PREFIX)) {
            self.device.device_type_uuid = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.platform.api_url.trim().is_empty() {
            return Err("platform.api_url must be set".into());
        }
        if self.platform.socket_url.trim().is_empty() {
            return Err("platform.socket_url must be set".into());
        }
        if self.platform.timeout_secs == 0 {
            return Err("platform.timeout_secs must be non-zero".into());
        }
        if self.link.port == 0 {
            return Err("link.port must be non-zero".into());
        }
        if self.channel.min_backoff_ms == 0 {
            return Err("channel.min_backoff_ms must be non-zero".into());
        }
        if self.channel.min_backoff_ms > self.channel.max_backoff_ms {
            return Err("channel.min_backoff_ms must not exceed channel.max_backoff_ms".into());
        }
        if self.channel.heartbeat_timeout_ms == 0 {
            return Err("channel.heartbeat_timeout_ms must be non-zero".into());
        }
        if self.channel.transport == Transport::Pull && self.channel.keepalive_interval_secs == 0
        {
            return Err("channel.keepalive_interval_secs must be non-zero for pull transport".into());
        }
        if self.scenes.room_timeout_ms == 0 {
            return Err("scenes.room_timeout_ms must be non-zero".into());
        }
        if self.scenes.history_limit == 0 {
            return Err("scenes.history_limit must be non-zero".into());
        }
        if self.scenes.sweep_interval_ms == 0 {
            return Err("scenes.sweep_interval_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join("thinkdevice").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.link.port, 3205);
        assert_eq!(parsed.channel.transport, Transport::Push);
    }

    #[test]
    fn validate_rejects_zero_link_port() {
        let mut cfg = Config::default();
        cfg.link.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff_bounds() {
        let mut cfg = Config::default();
        cfg.channel.min_backoff_ms = 20_000;
        cfg.channel.max_backoff_ms = 15_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_keepalive_for_pull_transport() {
        let mut cfg = Config::default();
        cfg.channel.transport = Transport::Pull;
        cfg.channel.keepalive_interval_secs = 0;
        assert!(cfg.validate().is_err());

        cfg.channel.keepalive_interval_secs = 60;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let raw = r#"
            [channel]
            transport = "pull"

            [device]
            name = "Example Widget"
            device_type_uuid = "f760179f-8206-45cc-a158-64fd9e99489d"

            [device.properties]
            volume = 3
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.channel.transport, Transport::Pull);
        assert_eq!(cfg.channel.min_backoff_ms, 100);
        assert_eq!(cfg.scenes.room_timeout_ms, 20_000);

        let props = cfg.device.desired_properties();
        assert_eq!(props["name"], "Example Widget");
        assert_eq!(props["deviceTypeUuid"], "f760179f-8206-45cc-a158-64fd9e99489d");
        assert_eq!(props["volume"], 3);
    }
}
