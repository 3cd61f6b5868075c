//! 应用配置和持久化
//!
//! 提供设备名称、适配器、日志级别和客户端超时等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Operation;
use crate::logging::LogLevel;

/// 客户端超时配置（单位：秒）
///
/// 每类操作独立计时，连接通常比读写需要更长的时间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub discover_timeout_secs: u64,
    pub mtu_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub subscribe_timeout_secs: u64,
    /// 超时扫描周期
    pub sweep_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            discover_timeout_secs: 10,
            mtu_timeout_secs: 5,
            read_timeout_secs: 5,
            write_timeout_secs: 5,
            subscribe_timeout_secs: 5,
            sweep_interval_secs: 1,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self, operation: Operation) -> Duration {
        let secs = match operation {
            Operation::Connect => self.connect_timeout_secs,
            Operation::Discover => self.discover_timeout_secs,
            Operation::Mtu => self.mtu_timeout_secs,
            Operation::Read => self.read_timeout_secs,
            Operation::Write => self.write_timeout_secs,
            Operation::EnableNotification | Operation::DisableNotification => {
                self.subscribe_timeout_secs
            }
        };
        Duration::from_secs(secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 广播时使用的设备名称
    pub device_name: String,
    /// 使用的适配器名称（如 hci0），为空则使用默认适配器
    pub adapter: Option<String>,
    /// 日志级别
    pub log_level: LogLevel,
    /// 客户端超时
    pub client: ClientConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            adapter: None,
            log_level: LogLevel::Info,
            client: ClientConfig::default(),
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bleconn");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "bleconn".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_has_longest_budget() {
        let config = ClientConfig::default();
        for op in Operation::ALL {
            assert!(config.timeout(Operation::Connect) >= config.timeout(op));
        }
        assert_eq!(config.timeout(Operation::Read), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            device_name = "bench"
            log_level = "Debug"

            [client]
            read_timeout_secs = 2
            "#,
        )
        .unwrap();
        assert_eq!(settings.device_name, "bench");
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.client.read_timeout_secs, 2);
        assert_eq!(settings.client.connect_timeout_secs, 30);
        assert!(settings.adapter.is_none());
    }

    #[test]
    fn test_settings_roundtrip_through_toml() {
        let settings = Settings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client, settings.client);
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let config = ClientConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
