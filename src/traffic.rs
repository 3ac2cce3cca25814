//! トラフィックカウンタープラグイン
//!
//! inbound / outbound の ID ごとに接続数と転送バイト数を集計します。
//! 集計結果は接続クローズ時にログ出力します（表示層は持たない）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Result;
use tracing::debug;

use crate::plugin::{
    ConnectionContext, InboundPlugin, OutboundPlugin, Plugin, TrafficPlugin, TransferDirection,
};

/// ID ごとのトラフィック統計
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_activity: Option<SystemTime>,
}

/// ID をキーにしたスレッドセーフな集計ストア
#[derive(Default)]
pub struct BaseCounter {
    stats: Mutex<HashMap<String, Stats>>,
}

impl BaseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定 ID の統計のコピーを返す
    pub fn stats(&self, id: &str) -> Stats {
        self.stats.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    pub fn add_connection(&self, id: &str) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(id.to_string()).or_default();
        entry.connections += 1;
        entry.last_activity = Some(SystemTime::now());
    }

    pub fn add_bytes(&self, id: &str, sent: u64, received: u64) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(id.to_string()).or_default();
        entry.bytes_sent += sent;
        entry.bytes_received += received;
        entry.last_activity = Some(SystemTime::now());
    }

    /// すべての統計のスナップショットを返す
    pub fn all_stats(&self) -> HashMap<String, Stats> {
        self.stats.lock().unwrap().clone()
    }
}

/// inbound ID ごとのトラフィックカウンター
#[derive(Default)]
pub struct InboundCounter {
    counter: BaseCounter,
}

impl InboundCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self, id: &str) -> Stats {
        self.counter.stats(id)
    }
}

impl Plugin for InboundCounter {
    fn name(&self) -> &str {
        "traffic_inbound"
    }

    fn init(&self, _config: Option<&serde_json::Value>) -> Result<()> {
        Ok(())
    }
}

impl InboundPlugin for InboundCounter {
    fn on_inbound_connection(&self, ctx: &ConnectionContext) -> Result<()> {
        self.counter.add_connection(&ctx.inbound_id);
        Ok(())
    }
}

impl TrafficPlugin for InboundCounter {
    fn on_data_transfer(&self, ctx: &ConnectionContext, direction: TransferDirection, bytes: u64) {
        match direction {
            TransferDirection::Sent => self.counter.add_bytes(&ctx.inbound_id, bytes, 0),
            TransferDirection::Received => self.counter.add_bytes(&ctx.inbound_id, 0, bytes),
        }
    }

    fn on_connection_closed(&self, ctx: &ConnectionContext) {
        let stats = self.counter.stats(&ctx.inbound_id);
        debug!(
            inbound_id = %ctx.inbound_id,
            connections = stats.connections,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "inbound traffic summary"
        );
    }
}

/// outbound ID ごとのトラフィックカウンター
#[derive(Default)]
pub struct OutboundCounter {
    counter: BaseCounter,
}

impl OutboundCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self, id: &str) -> Stats {
        self.counter.stats(id)
    }
}

impl Plugin for OutboundCounter {
    fn name(&self) -> &str {
        "traffic_outbound"
    }

    fn init(&self, _config: Option<&serde_json::Value>) -> Result<()> {
        Ok(())
    }
}

impl OutboundPlugin for OutboundCounter {
    fn on_outbound_connection(&self, ctx: &ConnectionContext) -> Result<()> {
        self.counter.add_connection(&ctx.outbound_id());
        Ok(())
    }
}

impl TrafficPlugin for OutboundCounter {
    fn on_data_transfer(&self, ctx: &ConnectionContext, direction: TransferDirection, bytes: u64) {
        let id = ctx.outbound_id();
        match direction {
            TransferDirection::Sent => self.counter.add_bytes(&id, bytes, 0),
            TransferDirection::Received => self.counter.add_bytes(&id, 0, bytes),
        }
    }

    fn on_connection_closed(&self, ctx: &ConnectionContext) {
        let id = ctx.outbound_id();
        let stats = self.counter.stats(&id);
        debug!(
            outbound_id = %id,
            connections = stats.connections,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "outbound traffic summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> ConnectionContext {
        let ctx = ConnectionContext::new(
            "127.0.0.1:40000".to_string(),
            "example.com:443".to_string(),
            "in-1".to_string(),
        );
        ctx.set_outbound_id("out-1");
        ctx
    }

    #[test]
    fn test_inbound_counter_accumulates() {
        let counter = InboundCounter::new();
        let ctx = test_ctx();

        counter.on_inbound_connection(&ctx).unwrap();
        counter.on_inbound_connection(&ctx).unwrap();
        counter.on_data_transfer(&ctx, TransferDirection::Sent, 100);
        counter.on_data_transfer(&ctx, TransferDirection::Received, 50);

        let stats = counter.stats("in-1");
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.bytes_received, 50);
        assert!(stats.last_activity.is_some());
    }

    #[test]
    fn test_outbound_counter_keyed_by_outbound_id() {
        let counter = OutboundCounter::new();
        let ctx = test_ctx();

        counter.on_outbound_connection(&ctx).unwrap();
        counter.on_data_transfer(&ctx, TransferDirection::Sent, 10);

        assert_eq!(counter.stats("out-1").connections, 1);
        assert_eq!(counter.stats("out-1").bytes_sent, 10);
        // 別 ID は空のまま
        assert_eq!(counter.stats("other").connections, 0);
    }

    #[test]
    fn test_unknown_id_returns_empty_stats() {
        let counter = BaseCounter::new();
        let stats = counter.stats("missing");
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.bytes_sent, 0);
        assert!(stats.last_activity.is_none());
    }
}
