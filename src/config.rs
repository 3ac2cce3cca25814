//! 設定
//!
//! POP とデバイスクライアントの JSON 設定を定義します。
//! 設定ファイルが存在しない場合はデフォルト値で起動し、CLI 引数による
//! 上書きは呼び出し側（main）で適用されます。

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// デフォルトのハートビート間隔（秒）
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

/// デフォルトのハートビートタイムアウト（秒）
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 90;

/// デフォルトの WSS コントロールプレーンポート
pub const DEFAULT_WSS_PORT: u16 = 443;

/// デフォルトの QUIC データプレーンポート
pub const DEFAULT_QUIC_PORT: u16 = 443;

/// インバウンド設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub port: u16,
    #[serde(default)]
    pub id: String,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            kind: "socks5".to_string(),
            port: 1080,
            id: String::new(),
        }
    }
}

/// アウトバウンド設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// 上流 SOCKS5 プロキシのアドレス（type = "socks5" のとき必須）
    #[serde(default)]
    pub proxy_address: String,
    #[serde(default)]
    pub id: String,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            kind: "direct".to_string(),
            proxy_address: String::new(),
            id: String::new(),
        }
    }
}

/// プラグイン個別設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// プラグイン設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_inbound: Option<PluginConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_outbound: Option<PluginConfig>,
}

/// TLS 設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

/// アウトバウンドプール（デバイスフリート）設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wss_port")]
    pub wss_port: u16,
    #[serde(default = "default_quic_port")]
    pub quic_port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
}

impl Default for OutboundPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wss_port: DEFAULT_WSS_PORT,
            quic_port: DEFAULT_QUIC_PORT,
            tls: TlsConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

fn default_wss_port() -> u16 {
    DEFAULT_WSS_PORT
}

fn default_quic_port() -> u16 {
    DEFAULT_QUIC_PORT
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT
}

/// POP 全体の設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_pool: Option<OutboundPoolConfig>,
}

impl Config {
    /// 設定ファイルを読み込む
    ///
    /// ファイルが存在しない場合はデフォルト設定
    /// （SOCKS5 inbound :1080 / direct outbound）を返します。
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let cfg: Config = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(cfg)
    }
}

/// デバイスクライアントの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,
    #[serde(default = "default_wss_port")]
    pub wss_port: u16,
    #[serde(default = "default_quic_port")]
    pub quic_port: u16,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            proxy_host: default_proxy_host(),
            wss_port: DEFAULT_WSS_PORT,
            quic_port: DEFAULT_QUIC_PORT,
            device_id: String::new(),
            location: String::new(),
            tags: Vec::new(),
            capacity: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            tls_enabled: false,
            tls_skip_verify: false,
        }
    }
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

impl DeviceConfig {
    /// デバイス設定ファイルを読み込む
    ///
    /// ファイルが存在しない場合はデフォルト設定を返します。
    /// `device_id` の必須チェックは CLI 上書き適用後に
    /// [`DeviceConfig::validate`] で行います。
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device config file {:?}", path))?;
        let cfg: DeviceConfig = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse device config file {:?}", path))?;
        Ok(cfg)
    }

    /// 必須フィールドを検証する
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            anyhow::bail!("device_id is required");
        }
        Ok(())
    }
}
