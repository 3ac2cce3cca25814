//! プラグインフック
//!
//! 接続ライフサイクルの 4 つのフックを提供します:
//!
//! - on-inbound-connection / on-outbound-connection:
//!   接続確立前に呼ばれ、エラーを返すと接続は中断される
//! - on-data-transfer / on-connection-closed:
//!   同期・非ブロッキングの契約で、失敗しても接続は中断されない
//!
//! ディスパッチ順序は登録順。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::warn;

/// 転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// クライアント → ターゲット
    Sent,
    /// ターゲット → クライアント
    Received,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Sent => write!(f, "sent"),
            TransferDirection::Received => write!(f, "received"),
        }
    }
}

/// フロー毎の接続コンテキスト
///
/// コンポーネント間・プラグイン間で共有されるメタデータ。
/// バイトカウンターはコピーループから並行更新される。
pub struct ConnectionContext {
    pub inbound_id: String,
    /// ルーター解決後に一度だけ設定される
    outbound_id: Mutex<String>,
    pub remote_addr: String,
    pub target_address: String,
    pub start_time: SystemTime,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// プラグイン用の自由形式メタデータ
    metadata: Mutex<HashMap<String, serde_json::Value>>,
}

impl ConnectionContext {
    pub fn new(remote_addr: String, target_address: String, inbound_id: String) -> Self {
        Self {
            inbound_id,
            outbound_id: Mutex::new(String::new()),
            remote_addr,
            target_address,
            start_time: SystemTime::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    pub fn outbound_id(&self) -> String {
        self.outbound_id.lock().unwrap().clone()
    }

    pub fn set_outbound_id(&self, id: &str) {
        *self.outbound_id.lock().unwrap() = id.to_string();
    }

    pub fn add_bytes(&self, direction: TransferDirection, bytes: u64) {
        match direction {
            TransferDirection::Sent => self.bytes_sent.fetch_add(bytes, Ordering::Relaxed),
            TransferDirection::Received => {
                self.bytes_received.fetch_add(bytes, Ordering::Relaxed)
            }
        };
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn set_metadata(&self, key: &str, value: serde_json::Value) {
        self.metadata.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.lock().unwrap().get(key).cloned()
    }
}

/// 全プラグイン共通のベースインターフェース
pub trait Plugin: Send + Sync {
    /// プラグイン名
    fn name(&self) -> &str;

    /// 設定を受け取って初期化する
    fn init(&self, _config: Option<&serde_json::Value>) -> Result<()> {
        Ok(())
    }

    /// リソースを解放する
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// inbound イベントを処理するプラグイン
pub trait InboundPlugin: Plugin {
    /// 新しい inbound 接続で呼ばれる。エラーで接続は中断される。
    fn on_inbound_connection(&self, ctx: &ConnectionContext) -> Result<()>;
}

/// outbound イベントを処理するプラグイン
pub trait OutboundPlugin: Plugin {
    /// outbound 確立前に呼ばれる。エラーで接続は中断される。
    fn on_outbound_connection(&self, ctx: &ConnectionContext) -> Result<()>;
}

/// トラフィックを観測するプラグイン
pub trait TrafficPlugin: Plugin {
    /// データ転送毎に呼ばれる（同期・非ブロッキング契約）
    fn on_data_transfer(&self, ctx: &ConnectionContext, direction: TransferDirection, bytes: u64);

    /// 接続クローズ時に呼ばれる
    fn on_connection_closed(&self, ctx: &ConnectionContext);
}

/// プラグインマネージャー
///
/// 3 種のプラグインを独立に登録し、登録順にディスパッチする。
/// 登録はサーバー起動前に完了するため、実行時のロックは不要。
#[derive(Default)]
pub struct PluginManager {
    inbound_plugins: Vec<Arc<dyn InboundPlugin>>,
    outbound_plugins: Vec<Arc<dyn OutboundPlugin>>,
    traffic_plugins: Vec<Arc<dyn TrafficPlugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_inbound_plugin(&mut self, plugin: Arc<dyn InboundPlugin>) {
        self.inbound_plugins.push(plugin);
    }

    pub fn register_outbound_plugin(&mut self, plugin: Arc<dyn OutboundPlugin>) {
        self.outbound_plugins.push(plugin);
    }

    pub fn register_traffic_plugin(&mut self, plugin: Arc<dyn TrafficPlugin>) {
        self.traffic_plugins.push(plugin);
    }

    /// inbound フックを登録順に呼ぶ。最初のエラーで中断。
    pub fn on_inbound_connection(&self, ctx: &ConnectionContext) -> Result<()> {
        for plugin in &self.inbound_plugins {
            plugin
                .on_inbound_connection(ctx)
                .with_context(|| format!("plugin {} OnInboundConnection failed", plugin.name()))?;
        }
        Ok(())
    }

    /// outbound フックを登録順に呼ぶ。最初のエラーで中断。
    pub fn on_outbound_connection(&self, ctx: &ConnectionContext) -> Result<()> {
        for plugin in &self.outbound_plugins {
            plugin
                .on_outbound_connection(ctx)
                .with_context(|| format!("plugin {} OnOutboundConnection failed", plugin.name()))?;
        }
        Ok(())
    }

    /// 転送フックを登録順に呼ぶ。失敗で接続は中断されない。
    pub fn on_data_transfer(
        &self,
        ctx: &ConnectionContext,
        direction: TransferDirection,
        bytes: u64,
    ) {
        for plugin in &self.traffic_plugins {
            plugin.on_data_transfer(ctx, direction, bytes);
        }
    }

    /// クローズフックを登録順に呼ぶ。失敗で接続は中断されない。
    pub fn on_connection_closed(&self, ctx: &ConnectionContext) {
        for plugin in &self.traffic_plugins {
            plugin.on_connection_closed(ctx);
        }
    }

    /// 全プラグインを閉じる
    pub fn close(&self) {
        for plugin in &self.inbound_plugins {
            if let Err(e) = plugin.close() {
                warn!("plugin {} close failed: {:#}", plugin.name(), e);
            }
        }
        for plugin in &self.outbound_plugins {
            if let Err(e) = plugin.close() {
                warn!("plugin {} close failed: {:#}", plugin.name(), e);
            }
        }
        for plugin in &self.traffic_plugins {
            if let Err(e) = plugin.close() {
                warn!("plugin {} close failed: {:#}", plugin.name(), e);
            }
        }
    }
}
