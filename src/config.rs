
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use parking_lot::RwLock;

use crate::family::ProtocolVersion;
use crate::filter::FilterMode;

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Arc<PathBuf>,
    config: Arc<RwLock<Option<Config>>>,
    broadcast: tokio::sync::broadcast::Sender<()>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let config = None;
        Self {
            config_path: Arc::new(path),
            config: Arc::new(RwLock::new(config)),
            broadcast: tokio::sync::broadcast::channel(1).0,
        }
    }

    fn notify_change(&self) {
        let _ = self.broadcast.send(());
    }

    pub async fn load(&self) -> Result<(), std::io::Error> {
        tokio::task::block_in_place(|| {
            let config = Config::from_file(self.config_path.as_ref())?;
            let result = Some(config);
            let orig = std::mem::replace(&mut *self.config.write(), result.clone());
            if orig != result {
                self.notify_change();
            }
            Ok(())
        })
    }

    pub fn get(&self) -> Option<Config> {
        self.config.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.config.read().is_some()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.broadcast.subscribe()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(file)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, std::io::Error> {
        let config: Config = toml::from_str(content).map_err(|e| std::io::Error::other(e))?;
        Ok(config)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,

    /// groups joined by the daemon itself on startup
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub address: std::net::Ipv6Addr,

    #[serde(default = "GroupConfig::default_mode")]
    pub mode: FilterMode,

    #[serde(default)]
    pub sources: Vec<std::net::Ipv6Addr>,
}

impl GroupConfig {
    fn default_mode() -> FilterMode {
        FilterMode::Exclude
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    /// compatibility mode an interface starts in
    #[serde(default = "GlobalConfig::default_mode")]
    pub default_mode: ProtocolVersion,

    /// only send Done when this host sent the last report
    #[serde(default = "GlobalConfig::default_true")]
    pub optimize_done_reports: bool,

    #[serde(default)]
    pub robustness: Option<u8>,

    #[serde(default)]
    pub query_interval_ms: Option<u64>,

    #[serde(default)]
    pub query_response_interval_ms: Option<u64>,

    #[serde(default)]
    pub unsolicited_report_interval_ms: Option<u64>,

    #[serde(default)]
    pub last_listener_query_interval_ms: Option<u64>,
}

impl GlobalConfig {
    fn default_mode() -> ProtocolVersion {
        ProtocolVersion::V2
    }

    fn default_true() -> bool {
        true
    }

    /// Protocol timers for MLD, with unset values taken from the defaults.
    pub fn mld(&self) -> ProtocolConfig {
        self.apply(ProtocolConfig::mld_default())
    }

    pub fn igmp(&self) -> ProtocolConfig {
        let mut config = self.apply(ProtocolConfig::igmp_default());
        if self.default_mode == ProtocolVersion::V2 {
            config.default_mode = ProtocolVersion::V3;
        }
        config
    }

    fn apply(&self, mut config: ProtocolConfig) -> ProtocolConfig {
        config.default_mode = self.default_mode;
        config.optimize_done_reports = self.optimize_done_reports;
        if let Some(robustness) = self.robustness {
            config.robustness = robustness.max(1);
        }
        if let Some(ms) = self.query_interval_ms {
            config.query_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.query_response_interval_ms {
            config.query_response_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.unsolicited_report_interval_ms {
            config.unsolicited_report_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.last_listener_query_interval_ms {
            config.last_listener_query_interval = Duration::from_millis(ms);
        }
        config
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_mode: Self::default_mode(),
            optimize_done_reports: true,
            robustness: None,
            query_interval_ms: None,
            query_response_interval_ms: None,
            unsolicited_report_interval_ms: None,
            last_listener_query_interval_ms: None,
        }
    }
}

/// Protocol parameters consumed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub default_mode: ProtocolVersion,
    pub optimize_done_reports: bool,

    /// robustness variable; also the number of state-change transmissions
    pub robustness: u8,
    pub query_interval: Duration,
    pub query_response_interval: Duration,
    pub unsolicited_report_interval: Duration,
    pub last_listener_query_interval: Duration,
}

impl ProtocolConfig {
    pub fn mld_default() -> Self {
        Self {
            default_mode: ProtocolVersion::V2,
            optimize_done_reports: true,
            robustness: 2,
            query_interval: Duration::from_secs(125),
            query_response_interval: Duration::from_secs(10),
            unsolicited_report_interval: Duration::from_secs(10),
            last_listener_query_interval: Duration::from_secs(1),
        }
    }

    pub fn igmp_default() -> Self {
        Self {
            default_mode: ProtocolVersion::V3,
            unsolicited_report_interval: Duration::from_secs(1),
            ..Self::mld_default()
        }
    }

    pub fn startup_query_interval(&self) -> Duration {
        self.query_interval / 4
    }

    /// Older Version Querier Present Timeout
    pub fn older_version_querier_timeout(&self) -> Duration {
        self.query_interval * self.robustness as u32 + self.query_response_interval
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::mld_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_str("[[interfaces]]\nname = \"eth0\"\n").unwrap();
        assert_eq!(config.global, GlobalConfig::default());
        assert_eq!(config.interfaces.len(), 1);
        assert!(config.interfaces[0].groups.is_empty());

        let mld = config.global.mld();
        assert_eq!(mld, ProtocolConfig::mld_default());
        assert_eq!(mld.older_version_querier_timeout(), Duration::from_secs(260));
        assert_eq!(config.global.igmp().default_mode, ProtocolVersion::V3);
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_str(r#"
[global]
default_mode = "v1"
optimize_done_reports = false
robustness = 3
unsolicited_report_interval_ms = 500

[[interfaces]]
name = "eth0"

[[interfaces.groups]]
address = "ff05::1:3"
mode = "include"
sources = ["2001:db8::1"]
"#).unwrap();

        let mld = config.global.mld();
        assert_eq!(mld.default_mode, ProtocolVersion::V1);
        assert!(!mld.optimize_done_reports);
        assert_eq!(mld.robustness, 3);
        assert_eq!(mld.unsolicited_report_interval, Duration::from_millis(500));
        assert_eq!(mld.query_interval, Duration::from_secs(125));

        let group = &config.interfaces[0].groups[0];
        assert_eq!(group.mode, FilterMode::Include);
        assert_eq!(group.sources, vec!["2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap()]);
    }

    #[test]
    fn test_config_rejects_garbage() {
        assert!(Config::from_str("global = 3").is_err());
    }
}
