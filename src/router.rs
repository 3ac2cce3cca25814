//! ルーター
//!
//! フロー毎のアウトバウンド選択を行います。選択結果は 3 つのモードで
//! 通知されます:
//!
//! - [`Route::Pooled`] - プールされたデバイスアウトバウンドを ID で使用
//! - [`Route::Fresh`] - 設定から新しいアウトバウンドを構築
//! - [`Route::Current`] - 呼び出し側の現行アウトバウンドをそのまま使用
//!
//! Dynamic ルーターは候補がいない場合に [`Route::Current`] へフォール
//! バックするため、デバイスが全滅してもプロキシは機能し続ける。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::config::OutboundConfig;
use crate::plugin::ConnectionContext;
use crate::registry::{Device, DeviceCriteria, Registry};

/// アウトバウンド選択の結果
#[derive(Debug, Clone)]
pub enum Route {
    /// プール内の既存アウトバウンドをこの ID で使用する
    Pooled(String),
    /// この設定から新しいアウトバウンドを構築する
    Fresh(OutboundConfig),
    /// 現行のアウトバウンドを使用する
    Current,
}

/// アウトバウンド選択インターフェース
pub trait Router: Send + Sync {
    fn select_outbound(
        &self,
        ctx: &ConnectionContext,
        target_address: &str,
        current_outbound_id: &str,
        current_outbound_config: &OutboundConfig,
    ) -> Result<Route>;
}

/// 常に現行アウトバウンドを使う静的ルーター
#[derive(Default)]
pub struct StaticRouter;

impl StaticRouter {
    pub fn new() -> Self {
        Self
    }
}

impl Router for StaticRouter {
    fn select_outbound(
        &self,
        _ctx: &ConnectionContext,
        _target_address: &str,
        _current_outbound_id: &str,
        _current_outbound_config: &OutboundConfig,
    ) -> Result<Route> {
        Ok(Route::Current)
    }
}

/// デバイスプールから選択する動的ルーター
pub struct DynamicRouter {
    registry: Arc<Registry>,
    strategy: Arc<dyn Strategy>,
}

impl DynamicRouter {
    pub fn new(registry: Arc<Registry>, strategy: Arc<dyn Strategy>) -> Self {
        Self { registry, strategy }
    }
}

impl Router for DynamicRouter {
    fn select_outbound(
        &self,
        _ctx: &ConnectionContext,
        target_address: &str,
        _current_outbound_id: &str,
        _current_outbound_config: &OutboundConfig,
    ) -> Result<Route> {
        let criteria = DeviceCriteria::new();

        match self.strategy.select(&self.registry, &criteria, target_address) {
            Some(device) if device.is_online() => Ok(Route::Pooled(device.id().to_string())),
            Some(device) => {
                // 選択とフローの間でオフラインになった場合もフォールバック
                debug!(device_id = device.id(), "selected device went offline, falling back");
                Ok(Route::Current)
            }
            None => {
                debug!(target_address, "no device candidates, falling back to static outbound");
                Ok(Route::Current)
            }
        }
    }
}

/// デバイス選択ストラテジー
///
/// デバイス一覧ではなくレジストリを直接受け取る（スケーラブルな検索を
/// ストラテジー側で実装できるようにするため）。
pub trait Strategy: Send + Sync {
    fn select(
        &self,
        registry: &Registry,
        criteria: &DeviceCriteria,
        target_address: &str,
    ) -> Option<Arc<Device>>;
}

/// Round-robin ストラテジー
///
/// カウンターは単調増加のみで、候補集合が変わってもリセットしない。
/// 一時的なデバイスの出入りで 1〜2 回選択が偏ることは許容する。
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicU64,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobinStrategy {
    fn select(
        &self,
        registry: &Registry,
        criteria: &DeviceCriteria,
        _target_address: &str,
    ) -> Option<Arc<Device>> {
        let devices = registry.list(criteria);
        if devices.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % devices.len();
        Some(devices[index].clone())
    }
}
