//! デバイスレジストリ
//!
//! 登録済みデバイスのテーブルを管理します。各デバイスは WSS コントロール
//! チャネルと QUIC データチャネルの 2 本のハンドルを持ち、両方が
//! バインドされている間だけ「オンライン」です。
//!
//! レジストリがデバイスレコードの唯一の所有者であり、他のコンポーネントは
//! lookup で得た参照（`Arc<Device>`）だけを保持します。ロックはすべて
//! 短命で、I/O をまたいで保持されることはありません。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use futures_util::stream::SplitSink;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
// tokio::time::Instant はテストの仮想時間 (time::pause) に追従する
use tokio::time::Instant;
use tracing::debug;

/// ハートビートスイーパーの動作周期
///
/// `heartbeat_interval` とは独立した固定値。タイムアウトしたデバイスは
/// 最大でこの周期ぶん遅れてオフラインになる。
const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// WSS 接続の下位トランスポート（平文 TCP または TLS）
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// POP 側の WebSocket ストリーム型
pub type WsStream = WebSocketStream<Box<dyn Transport>>;

/// WSS 書き込みハーフ
///
/// 書き込みはこの mutex で直列化される（フレーム破損防止）。
pub type ControlSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;

/// コントロールチャネルのハンドル
///
/// `cancel` を発火すると受信ループが終了し、WebSocket 接続が閉じられる。
#[derive(Clone)]
pub struct ControlHandle {
    pub sink: ControlSink,
    pub cancel: CancellationToken,
}

/// デバイスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// 登録時に供給されるメタデータ
#[derive(Debug, Clone, Default)]
pub struct RegisterMeta {
    pub location: String,
    pub capacity: u32,
    pub tags: Vec<String>,
}

/// レジストリエラー
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("device id must not be empty")]
    EmptyDeviceId,

    #[error("device {0} not found")]
    NotFound(String),

    #[error("device {0} is offline")]
    Offline(String),

    #[error("device {0} has no QUIC connection")]
    NoQuicConnection(String),
}

/// チャネルハンドルとストリーム表（可変部分）
struct DeviceState {
    wss: Option<ControlHandle>,
    quic: Option<quinn::Connection>,
    /// conn_id → フローのキャンセルトークン
    streams: HashMap<String, CancellationToken>,
    status: DeviceStatus,
    last_heartbeat: Instant,
    location: String,
    capacity: u32,
    tags: Vec<String>,
}

/// 登録済みデバイス
pub struct Device {
    id: String,
    remote_addr: String,
    registered_at: SystemTime,
    state: Mutex<DeviceState>,
    // メトリクス（LoadReport とフロー数の集計）
    active_conns: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl Device {
    fn new(id: String, remote_addr: String, meta: RegisterMeta, wss: ControlHandle) -> Self {
        Self {
            id,
            remote_addr,
            registered_at: SystemTime::now(),
            state: Mutex::new(DeviceState {
                wss: Some(wss),
                quic: None,
                streams: HashMap::new(),
                status: DeviceStatus::Online,
                last_heartbeat: Instant::now(),
                location: meta.location,
                capacity: meta.capacity,
                tags: meta.tags,
            }),
            active_conns: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock().unwrap().status
    }

    /// オンライン判定
    ///
    /// status が Online かつ両チャネルがバインドされていること。
    pub fn is_online(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.status == DeviceStatus::Online && state.wss.is_some() && state.quic.is_some()
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.state.lock().unwrap().last_heartbeat
    }

    pub fn location(&self) -> String {
        self.state.lock().unwrap().location.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.state.lock().unwrap().tags.clone()
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().unwrap().capacity
    }

    /// WSS 書き込みハーフを取得
    pub fn control_sink(&self) -> Option<ControlSink> {
        self.state.lock().unwrap().wss.as_ref().map(|h| h.sink.clone())
    }

    /// QUIC 接続を取得
    pub fn quic_conn(&self) -> Option<quinn::Connection> {
        self.state.lock().unwrap().quic.clone()
    }

    /// フローのストリームを登録
    ///
    /// ストリーム表はデータチャネルがバインドされている間だけ持てる。
    /// オフライン遷移と競合した場合は登録せずトークンを発火する。
    pub fn add_stream(&self, conn_id: &str, cancel: CancellationToken) {
        let mut state = self.state.lock().unwrap();
        if state.quic.is_none() {
            drop(state);
            cancel.cancel();
            return;
        }
        state.streams.insert(conn_id.to_string(), cancel);
    }

    /// フローのストリームを登録解除
    pub fn remove_stream(&self, conn_id: &str) {
        self.state.lock().unwrap().streams.remove(conn_id);
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().unwrap().streams.len()
    }

    /// ハートビートを更新する
    ///
    /// `last_heartbeat` は常に前進し、両チャネルがバインドされている
    /// 場合に限り Offline → Online に昇格する。
    fn touch(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_heartbeat = Instant::now();
        if state.status == DeviceStatus::Offline && state.wss.is_some() && state.quic.is_some() {
            state.status = DeviceStatus::Online;
        }
    }

    /// オフラインに遷移させる
    ///
    /// チャネルハンドルを閉じ、ストリーム表を空にする。カウンターと
    /// `registered_at` は保持される。冪等。
    fn mark_offline(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = DeviceStatus::Offline;
        if let Some(handle) = state.wss.take() {
            handle.cancel.cancel();
        }
        if let Some(conn) = state.quic.take() {
            conn.close(0u32.into(), b"device offline");
        }
        for (_, cancel) in state.streams.drain() {
            cancel.cancel();
        }
    }

    pub fn add_bytes(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn increment_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_conn(&self) {
        // 0 未満にはしない
        let _ = self
            .active_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn active_conns(&self) -> u64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    /// 検索条件に一致するか
    fn matches(&self, criteria: &DeviceCriteria) -> bool {
        let state = self.state.lock().unwrap();
        if state.status != criteria.status {
            return false;
        }
        // オンライン要求は両チャネルのバインドも含む
        if criteria.status == DeviceStatus::Online
            && (state.wss.is_none() || state.quic.is_none())
        {
            return false;
        }
        if !criteria.tags.is_empty() {
            // 要求タグはデバイスタグの部分集合でなければならない
            if !criteria.tags.iter().all(|t| state.tags.contains(t)) {
                return false;
            }
        }
        if let Some(ref location) = criteria.location {
            if &state.location != location {
                return false;
            }
        }
        true
    }
}

/// デバイス検索条件
///
/// capacity やレイテンシ等での絞り込みは将来の拡張として、セレクターの
/// インターフェースを変えずに追加できる。
#[derive(Debug, Clone)]
pub struct DeviceCriteria {
    pub status: DeviceStatus,
    pub tags: Vec<String>,
    pub location: Option<String>,
}

impl DeviceCriteria {
    pub fn new() -> Self {
        Self {
            status: DeviceStatus::Online,
            tags: Vec::new(),
            location: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl Default for DeviceCriteria {
    fn default() -> Self {
        Self::new()
    }
}

/// id → Device の表（挿入順を保持）
#[derive(Default)]
struct DeviceTable {
    map: HashMap<String, Arc<Device>>,
    order: Vec<String>,
}

type OfflineHook = Box<dyn Fn(&str) + Send + Sync>;

/// デバイスレジストリ
pub struct Registry {
    devices: RwLock<DeviceTable>,
    heartbeat_timeout: Duration,
    /// 情報提供のみ（デバイス側の送信周期。スイーパーの周期は固定）
    #[allow(dead_code)]
    heartbeat_interval: Duration,
    cancel: CancellationToken,
    /// mark_offline 時に呼ばれるフック（アウトバウンドプールの即時無効化用）
    offline_hook: RwLock<Option<OfflineHook>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

impl Registry {
    /// 新しいレジストリを作成し、バックグラウンドのスイーパーを起動する
    pub fn new(heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            devices: RwLock::new(DeviceTable::default()),
            heartbeat_timeout,
            heartbeat_interval,
            cancel: CancellationToken::new(),
            offline_hook: RwLock::new(None),
        });

        let sweeper = registry.clone();
        tokio::spawn(async move {
            sweeper.sweep_loop().await;
        });

        registry
    }

    /// mark_offline フックを登録する
    pub fn set_offline_hook<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.offline_hook.write().unwrap() = Some(Box::new(hook));
    }

    /// デバイスを登録、または既存レコードの WSS ハンドルを付け替える
    ///
    /// 再登録ではカウンターと `registered_at` は保持され、チャネルと
    /// ハートビート状態だけが更新される。メタデータは作成時のまま。
    pub fn register(
        &self,
        device_id: &str,
        remote_addr: &str,
        meta: RegisterMeta,
        wss: ControlHandle,
    ) -> Result<Arc<Device>, RegistryError> {
        if device_id.is_empty() {
            return Err(RegistryError::EmptyDeviceId);
        }

        let mut table = self.devices.write().unwrap();
        if let Some(device) = table.map.get(device_id) {
            let device = device.clone();
            drop(table);

            {
                let mut state = device.state.lock().unwrap();
                if let Some(old) = state.wss.take() {
                    // 同じ接続からの再登録なら旧ハンドルを閉じない
                    if !Arc::ptr_eq(&old.sink, &wss.sink) {
                        old.cancel.cancel();
                    }
                }
                state.wss = Some(wss);
                state.last_heartbeat = Instant::now();
                state.status = DeviceStatus::Online;
            }

            debug!(device_id, remote_addr, "device re-registered");
            return Ok(device);
        }

        let device = Arc::new(Device::new(
            device_id.to_string(),
            remote_addr.to_string(),
            meta,
            wss,
        ));
        table.map.insert(device_id.to_string(), device.clone());
        table.order.push(device_id.to_string());

        debug!(device_id, remote_addr, "device registered");
        Ok(device)
    }

    /// QUIC 接続を既存デバイスにバインドする
    ///
    /// 既存の接続があれば先に閉じる。デバイスが見つからない場合は
    /// 渡された接続を閉じてエラーを返す。
    pub fn bind_quic(
        &self,
        device_id: &str,
        conn: quinn::Connection,
    ) -> Result<(), RegistryError> {
        let device = {
            let table = self.devices.read().unwrap();
            match table.map.get(device_id) {
                Some(d) => d.clone(),
                None => {
                    conn.close(0u32.into(), b"device not found");
                    return Err(RegistryError::NotFound(device_id.to_string()));
                }
            }
        };

        {
            let mut state = device.state.lock().unwrap();
            if let Some(old) = state.quic.take() {
                old.close(0u32.into(), b"new connection");
            }
            state.quic = Some(conn);
            state.last_heartbeat = Instant::now();
            state.status = DeviceStatus::Online;
        }

        debug!(device_id, "QUIC connection bound");
        Ok(())
    }

    /// ハートビートを記録する
    pub fn heartbeat(&self, device_id: &str) -> Result<(), RegistryError> {
        let device = self.get(device_id)?;
        device.touch();
        Ok(())
    }

    /// デバイスをオフラインにする（冪等）
    pub fn mark_offline(&self, device_id: &str) {
        let device = {
            let table = self.devices.read().unwrap();
            table.map.get(device_id).cloned()
        };

        if let Some(device) = device {
            device.mark_offline();
            debug!(device_id, "device marked offline");
            if let Some(hook) = self.offline_hook.read().unwrap().as_ref() {
                hook(device_id);
            }
        }
    }

    /// ID でデバイスを取得する
    pub fn get(&self, device_id: &str) -> Result<Arc<Device>, RegistryError> {
        let table = self.devices.read().unwrap();
        table
            .map
            .get(device_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))
    }

    /// 条件に一致する任意のデバイスを返す
    ///
    /// 選択ポリシー（round-robin 等）はストラテジー側の責務で、
    /// ここでは挿入順の最初の一致を返すだけ。
    pub fn find(&self, criteria: &DeviceCriteria) -> Option<Arc<Device>> {
        let table = self.devices.read().unwrap();
        table
            .order
            .iter()
            .filter_map(|id| table.map.get(id))
            .find(|d| d.matches(criteria))
            .cloned()
    }

    /// 条件に一致するデバイスの一覧を挿入順で返す
    pub fn list(&self, criteria: &DeviceCriteria) -> Vec<Arc<Device>> {
        let table = self.devices.read().unwrap();
        table
            .order
            .iter()
            .filter_map(|id| table.map.get(id))
            .filter(|d| d.matches(criteria))
            .cloned()
            .collect()
    }

    /// オンラインのデバイス数
    pub fn online_count(&self) -> u64 {
        let table = self.devices.read().unwrap();
        table.map.values().filter(|d| d.is_online()).count() as u64
    }

    /// レジストリを停止し、全デバイスをオフラインにする
    pub fn close(&self) {
        self.cancel.cancel();

        let ids: Vec<String> = {
            let table = self.devices.read().unwrap();
            table.order.clone()
        };
        for id in ids {
            self.mark_offline(&id);
        }
    }

    /// ハートビートタイムアウトを監視するバックグラウンドループ
    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    /// タイムアウトしたオンラインデバイスをオフラインへ
    fn sweep(&self) {
        let stale: Vec<String> = {
            let table = self.devices.read().unwrap();
            table
                .map
                .values()
                .filter(|d| {
                    d.status() == DeviceStatus::Online
                        && d.last_heartbeat().elapsed() > self.heartbeat_timeout
                })
                .map(|d| d.id().to_string())
                .collect()
        };

        for id in stale {
            debug!(device_id = %id, "heartbeat timeout, marking offline");
            self.mark_offline(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// テスト用の ControlHandle を作成する
    ///
    /// in-memory duplex 上に WebSocket ストリームを構築する。
    async fn make_control_handle() -> ControlHandle {
        let (client, _server) = tokio::io::duplex(1024);
        let ws = WebSocketStream::from_raw_socket(
            Box::new(client) as Box<dyn Transport>,
            Role::Server,
            None,
        )
        .await;
        let (sink, _stream) = ws.split();
        ControlHandle {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            cancel: CancellationToken::new(),
        }
    }

    fn test_registry() -> Arc<Registry> {
        Registry::new(Duration::from_secs(30), Duration::from_secs(90))
    }

    #[tokio::test]
    async fn test_register_creates_device() {
        let registry = test_registry();
        let handle = make_control_handle().await;

        let device = registry
            .register("d1", "10.0.0.1:50000", RegisterMeta::default(), handle)
            .unwrap();
        assert_eq!(device.id(), "d1");
        assert_eq!(device.status(), DeviceStatus::Online);
        // QUIC が未バインドなのでオンラインではない
        assert!(!device.is_online());
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let registry = test_registry();
        let handle = make_control_handle().await;

        let err = registry
            .register("", "10.0.0.1:50000", RegisterMeta::default(), handle)
            .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyDeviceId));
    }

    #[tokio::test]
    async fn test_reregister_preserves_counters_and_registered_at() {
        let registry = test_registry();

        let device = registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();
        device.add_bytes(100, 200);
        let registered_at = device.registered_at();
        let old_cancel = {
            let state = device.state.lock().unwrap();
            state.wss.as_ref().unwrap().cancel.clone()
        };

        // 同じ id での再登録はハンドルを付け替えるだけ
        let rebound = registry
            .register(
                "d1",
                "10.0.0.2:50001",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();

        assert!(Arc::ptr_eq(&device, &rebound));
        assert_eq!(rebound.bytes_sent(), 100);
        assert_eq!(rebound.bytes_received(), 200);
        assert_eq!(rebound.registered_at(), registered_at);
        // 旧コントロールチャネルは閉じられる
        assert!(old_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_mark_offline_clears_streams_and_handles() {
        let registry = test_registry();
        let device = registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();
        let (_c, pop_side, _ce, _se) = crate::quic::test_util::connected_pair().await;
        registry.bind_quic("d1", pop_side).unwrap();
        assert!(device.is_online());

        let s1 = CancellationToken::new();
        let s2 = CancellationToken::new();
        device.add_stream("1", s1.clone());
        device.add_stream("2", s2.clone());
        assert_eq!(device.stream_count(), 2);

        registry.mark_offline("d1");

        assert_eq!(device.status(), DeviceStatus::Offline);
        assert_eq!(device.stream_count(), 0);
        assert!(s1.is_cancelled());
        assert!(s2.is_cancelled());
        assert!(device.control_sink().is_none());
        assert!(device.quic_conn().is_none());
        assert!(!device.is_online());

        // 冪等
        registry.mark_offline("d1");
        assert_eq!(device.status(), DeviceStatus::Offline);

        // オフライン後のストリーム登録は拒否される
        let late = CancellationToken::new();
        device.add_stream("3", late.clone());
        assert_eq!(device.stream_count(), 0);
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_promote_without_handles() {
        let registry = test_registry();
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();
        registry.mark_offline("d1");

        // ハンドルが外れた状態のハートビートでは昇格しない
        registry.heartbeat("d1").unwrap();
        assert_eq!(registry.get("d1").unwrap().status(), DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_offline_hook_fires() {
        let registry = test_registry();
        let evicted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let evicted_clone = evicted.clone();
        registry.set_offline_hook(move |id| {
            evicted_clone.lock().unwrap().push(id.to_string());
        });

        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();
        registry.mark_offline("d1");

        assert_eq!(evicted.lock().unwrap().as_slice(), &["d1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_marks_stale_devices_offline() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();

        // タイムアウト内はオンラインのまま
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.get("d1").unwrap().status(), DeviceStatus::Online);

        // ハートビートなしでタイムアウトを超えると、スイーパー周期以内に
        // オフラインへ遷移する
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(registry.get("d1").unwrap().status(), DeviceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_device_online() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            registry.heartbeat("d1").unwrap();
        }
        assert_eq!(registry.get("d1").unwrap().status(), DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_find_and_list_with_criteria() {
        let registry = test_registry();

        // 実際の QUIC 接続ペアを 2 組用意してオンラインにする
        let (_c1, s1, _ce1, _se1) = crate::quic::test_util::connected_pair().await;
        let (_c2, s2, _ce2, _se2) = crate::quic::test_util::connected_pair().await;

        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta {
                    location: "tokyo".to_string(),
                    capacity: 10,
                    tags: vec!["jp".to_string(), "home".to_string()],
                },
                make_control_handle().await,
            )
            .unwrap();
        registry.bind_quic("d1", s1).unwrap();

        registry
            .register(
                "d2",
                "10.0.0.2:50000",
                RegisterMeta {
                    location: "osaka".to_string(),
                    capacity: 5,
                    tags: vec!["jp".to_string()],
                },
                make_control_handle().await,
            )
            .unwrap();
        registry.bind_quic("d2", s2).unwrap();

        assert_eq!(registry.online_count(), 2);

        // タグは部分集合マッチ
        let criteria = DeviceCriteria::new().with_tags(["jp"]);
        assert_eq!(registry.list(&criteria).len(), 2);

        let criteria = DeviceCriteria::new().with_tags(["jp", "home"]);
        let matched = registry.list(&criteria);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), "d1");

        // ロケーションは等価マッチ
        let criteria = DeviceCriteria::new().with_location("osaka");
        assert_eq!(registry.find(&criteria).unwrap().id(), "d2");

        // 一致なし
        let criteria = DeviceCriteria::new().with_location("nagoya");
        assert!(registry.find(&criteria).is_none());

        // オフラインは候補から外れる
        registry.mark_offline("d1");
        let criteria = DeviceCriteria::new().with_tags(["jp"]);
        let matched = registry.list(&criteria);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), "d2");
    }

    #[tokio::test]
    async fn test_bind_quic_unknown_device_fails() {
        let registry = test_registry();
        let (_c, s, _ce, _se) = crate::quic::test_util::connected_pair().await;

        let err = registry.bind_quic("ghost", s).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_marks_all_offline() {
        let registry = test_registry();
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();
        registry
            .register(
                "d2",
                "10.0.0.2:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();

        registry.close();
        assert_eq!(registry.get("d1").unwrap().status(), DeviceStatus::Offline);
        assert_eq!(registry.get("d2").unwrap().status(), DeviceStatus::Offline);
    }
}
