//! Configuration Store
//!
//! Tunnel list and engine settings, observable through `watch` channels.
//! [`TunnelStore`] keeps them in memory and, when loaded from a file,
//! writes changes back in the same format (TOML or JSON, chosen by the
//! file extension).

use crate::backend::BackendKind;
use crate::config::{TunnelConfig, TunnelId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Default ping settings
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PING_ATTEMPTS: u32 = 3;

/// Backend selection and startup behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub backend: BackendKind,
    pub is_restore_on_boot_enabled: bool,
    pub is_lockdown_enabled: bool,
    /// Rendered tunnel configs and the service status file
    pub state_dir: PathBuf,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Userspace,
            is_restore_on_boot_enabled: true,
            is_lockdown_enabled: false,
            state_dir: PathBuf::from("/var/lib/tunkeep"),
        }
    }
}

/// Reachability pinging and log monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub is_ping_enabled: bool,
    pub ping_interval_secs: u64,
    pub ping_attempts: u32,
    pub ping_timeout_secs: Option<u64>,
    pub is_local_logs_enabled: bool,
}

impl MonitoringSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Option<Duration> {
        self.ping_timeout_secs.map(Duration::from_secs)
    }

    /// The fields whose change restarts pinging
    pub fn ping_key(&self) -> (bool, u64, u32, Option<u64>) {
        (
            self.is_ping_enabled,
            self.ping_interval_secs,
            self.ping_attempts,
            self.ping_timeout_secs,
        )
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            is_ping_enabled: true,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            ping_timeout_secs: None,
            is_local_logs_enabled: false,
        }
    }
}

/// Kill switch options used in lockdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockdownSettings {
    pub bypass_lan: bool,
    pub metered: bool,
    pub dual_stack: bool,
}

/// All engine settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub monitoring: MonitoringSettings,
    pub lockdown: LockdownSettings,
}

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(StoreError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// On-disk engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl EngineConfig {
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, StoreError> {
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| StoreError::Parse(e.to_string()))?,
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| StoreError::Parse(e.to_string()))?,
        };

        let mut ids = BTreeSet::new();
        for tunnel in &config.tunnels {
            if !ids.insert(tunnel.id) {
                return Err(StoreError::DuplicateTunnel(tunnel.id));
            }
        }
        Ok(config)
    }

    pub fn render(&self, format: ConfigFormat) -> Result<String, StoreError> {
        match format {
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| StoreError::Serialize(e.to_string())),
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| StoreError::Serialize(e.to_string())),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        Self::parse(&content, format)
    }
}

/// Persistent tunnel and settings storage
#[async_trait]
pub trait ConfigStore: Send + Sync {
    fn subscribe_tunnels(&self) -> watch::Receiver<Vec<TunnelConfig>>;

    fn subscribe_settings(&self) -> watch::Receiver<Settings>;

    fn tunnels(&self) -> Vec<TunnelConfig> {
        self.subscribe_tunnels().borrow().clone()
    }

    fn tunnel(&self, id: TunnelId) -> Option<TunnelConfig> {
        self.subscribe_tunnels().borrow().iter().find(|t| t.id == id).cloned()
    }

    fn settings(&self) -> Settings {
        self.subscribe_settings().borrow().clone()
    }

    /// Mark exactly `active` as the running set
    async fn set_active(&self, active: &BTreeSet<TunnelId>) -> Result<(), StoreError>;

    async fn upsert_tunnel(&self, config: TunnelConfig) -> Result<(), StoreError>;

    async fn update_settings(&self, settings: Settings) -> Result<(), StoreError>;
}

/// In-memory store with optional write-back file
pub struct TunnelStore {
    tunnels: watch::Sender<Vec<TunnelConfig>>,
    settings: watch::Sender<Settings>,
    backing: Option<(PathBuf, ConfigFormat)>,
}

impl TunnelStore {
    pub fn new(config: EngineConfig) -> Self {
        let mut tunnels = config.tunnels;
        tunnels.sort_by_key(|t| (t.position, t.id));
        let (tunnels, _) = watch::channel(tunnels);
        let (settings, _) = watch::channel(config.settings);
        Self { tunnels, settings, backing: None }
    }

    /// Load from a `.toml` or `.json` file and write changes back to it
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let format = ConfigFormat::from_path(path)?;
        let config = EngineConfig::from_file(path)?;
        info!("Loaded {} tunnels from {}", config.tunnels.len(), path.display());

        let mut store = Self::new(config);
        store.backing = Some((path.to_path_buf(), format));
        Ok(store)
    }

    pub fn into_shared(self) -> Arc<dyn ConfigStore> {
        Arc::new(self)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some((path, format)) = &self.backing else {
            return Ok(());
        };

        let config = EngineConfig {
            settings: self.settings.borrow().clone(),
            tunnels: self.tunnels.borrow().clone(),
        };
        let content = config.render(*format)?;

        // Write-then-rename so a crash never leaves a truncated file
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await.map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| StoreError::Io(e.to_string()))?;
        debug!("Persisted engine config to {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for TunnelStore {
    fn subscribe_tunnels(&self) -> watch::Receiver<Vec<TunnelConfig>> {
        self.tunnels.subscribe()
    }

    fn subscribe_settings(&self) -> watch::Receiver<Settings> {
        self.settings.subscribe()
    }

    async fn set_active(&self, active: &BTreeSet<TunnelId>) -> Result<(), StoreError> {
        let changed = self.tunnels.send_if_modified(|tunnels| {
            let mut changed = false;
            for tunnel in tunnels.iter_mut() {
                let is_active = active.contains(&tunnel.id);
                if tunnel.is_active != is_active {
                    tunnel.is_active = is_active;
                    changed = true;
                }
            }
            changed
        });

        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn upsert_tunnel(&self, config: TunnelConfig) -> Result<(), StoreError> {
        let changed = self.tunnels.send_if_modified(|tunnels| {
            match tunnels.iter_mut().find(|t| t.id == config.id) {
                Some(existing) if *existing == config => false,
                Some(existing) => {
                    *existing = config;
                    true
                }
                None => {
                    tunnels.push(config);
                    tunnels.sort_by_key(|t| (t.position, t.id));
                    true
                }
            }
        });

        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn update_settings(&self, settings: Settings) -> Result<(), StoreError> {
        let changed = self.settings.send_if_modified(|current| {
            if *current == settings {
                return false;
            }
            *current = settings;
            true
        });

        if changed {
            self.persist().await?;
        }
        Ok(())
    }
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Tunnel {0} defined more than once")]
    DuplicateTunnel(TunnelId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.monitoring.ping_interval(), Duration::from_secs(30));
        assert_eq!(settings.monitoring.ping_attempts, 3);
        assert!(settings.monitoring.ping_timeout().is_none());
    }

    #[test]
    fn test_partial_settings_file() {
        let text = r#"
            [general]
            backend = "kernel"

            [monitoring]
            ping_interval_secs = 10
        "#;
        let settings: Settings = toml::from_str(text).unwrap();
        assert_eq!(settings.general.backend, BackendKind::Kernel);
        assert!(settings.general.is_restore_on_boot_enabled);
        assert_eq!(settings.monitoring.ping_interval_secs, 10);
        assert!(settings.monitoring.is_ping_enabled);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), Ok(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), Ok(ConfigFormat::Json));
        assert!(ConfigFormat::from_path(Path::new("a.yaml")).is_err());
    }

    #[test]
    fn test_render_and_parse_json() {
        let config = EngineConfig {
            settings: Settings::default(),
            tunnels: vec![sample_config(1, "office")],
        };
        let text = config.render(ConfigFormat::Json).unwrap();
        assert_eq!(EngineConfig::parse(&text, ConfigFormat::Json).unwrap(), config);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = EngineConfig {
            settings: Settings::default(),
            tunnels: vec![sample_config(1, "a"), sample_config(1, "b")],
        };
        let text = config.render(ConfigFormat::Json).unwrap();
        assert_eq!(
            EngineConfig::parse(&text, ConfigFormat::Json),
            Err(StoreError::DuplicateTunnel(TunnelId(1)))
        );
    }

    #[tokio::test]
    async fn test_set_active_marks_exact_set() {
        let store = TunnelStore::new(EngineConfig {
            settings: Settings::default(),
            tunnels: vec![sample_config(1, "a"), sample_config(2, "b")],
        });
        let mut rx = store.subscribe_tunnels();

        store.set_active(&BTreeSet::from([TunnelId(2)])).await.unwrap();
        assert!(rx.has_changed().unwrap());
        let tunnels = rx.borrow_and_update().clone();
        assert!(!tunnels[0].is_active);
        assert!(tunnels[1].is_active);

        // Same set again: no notification
        store.set_active(&BTreeSet::from([TunnelId(2)])).await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_write_back_to_file() {
        let dir = std::env::temp_dir().join(format!("tunkeep-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.toml");

        let config = EngineConfig {
            settings: Settings::default(),
            tunnels: vec![sample_config(7, "home")],
        };
        std::fs::write(&path, config.render(ConfigFormat::Toml).unwrap()).unwrap();

        let store = TunnelStore::open(&path).unwrap();
        store.set_active(&BTreeSet::from([TunnelId(7)])).await.unwrap();

        let reloaded = EngineConfig::from_file(&path).unwrap();
        assert!(reloaded.tunnels[0].is_active);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
