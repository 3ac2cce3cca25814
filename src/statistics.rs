//! サーバー統計情報
//!
//! POP の稼働状況（接続数、転送量、デバイス経由フロー数など）を追跡する
//! ための構造体とメソッドを提供します。
//! Prometheus 形式でのメトリクスエクスポートに対応しています。

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// サーバー統計情報を保持する構造体
///
/// すべてのフィールドは Atomic 型で、複数タスクから安全にアクセス可能です。
pub struct ServerStatistics {
    /// サーバー開始時刻
    start_time: Instant,
    /// 累計接続数
    total_connections: AtomicU64,
    /// 現在アクティブな接続数
    active_connections: AtomicU64,
    /// 送信バイト数の累計（クライアント → ターゲット方向）
    bytes_sent: AtomicU64,
    /// 受信バイト数の累計（ターゲット → クライアント方向）
    bytes_received: AtomicU64,
    /// デバイス経由で送出されたフロー数
    device_flows: AtomicU64,
    /// 静的アウトバウンドで送出されたフロー数
    static_flows: AtomicU64,
    /// デバイス登録（再登録含む）の累計
    device_registrations: AtomicU64,
}

impl ServerStatistics {
    /// 新しい統計情報インスタンスを作成
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            device_flows: AtomicU64::new(0),
            static_flows: AtomicU64::new(0),
            device_registrations: AtomicU64::new(0),
        }
    }

    /// 新しい接続が開始されたときに呼び出す
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// 接続が終了したときに呼び出す
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// 送信バイト数を加算
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 受信バイト数を加算
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// デバイス経由フローをインクリメント
    pub fn device_flow(&self) {
        self.device_flows.fetch_add(1, Ordering::Relaxed);
    }

    /// 静的アウトバウンドフローをインクリメント
    pub fn static_flow(&self) {
        self.static_flows.fetch_add(1, Ordering::Relaxed);
    }

    /// デバイス登録をインクリメント
    pub fn device_registered(&self) {
        self.device_registrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus 形式でメトリクスを出力
    ///
    /// `devices_online` はレジストリ由来のゲージで、呼び出し側が渡す。
    pub fn to_prometheus(&self, devices_online: u64) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        let total_connections = self.total_connections.load(Ordering::Relaxed);
        let active_connections = self.active_connections.load(Ordering::Relaxed);
        let bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        let bytes_received = self.bytes_received.load(Ordering::Relaxed);
        let device_flows = self.device_flows.load(Ordering::Relaxed);
        let static_flows = self.static_flows.load(Ordering::Relaxed);
        let device_registrations = self.device_registrations.load(Ordering::Relaxed);

        let mut output = String::new();

        // uptime
        writeln!(output, "# HELP quicfleet_uptime_seconds Server uptime in seconds").unwrap();
        writeln!(output, "# TYPE quicfleet_uptime_seconds gauge").unwrap();
        writeln!(output, "quicfleet_uptime_seconds {}", uptime).unwrap();

        // connections total
        writeln!(
            output,
            "# HELP quicfleet_connections_total Total number of client connections since server start"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_connections_total counter").unwrap();
        writeln!(output, "quicfleet_connections_total {}", total_connections).unwrap();

        // connections active
        writeln!(
            output,
            "# HELP quicfleet_connections_active Current number of active client connections"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_connections_active gauge").unwrap();
        writeln!(output, "quicfleet_connections_active {}", active_connections).unwrap();

        // bytes sent
        writeln!(
            output,
            "# HELP quicfleet_bytes_sent_total Total bytes forwarded from clients to targets"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_bytes_sent_total counter").unwrap();
        writeln!(output, "quicfleet_bytes_sent_total {}", bytes_sent).unwrap();

        // bytes received
        writeln!(
            output,
            "# HELP quicfleet_bytes_received_total Total bytes forwarded from targets to clients"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_bytes_received_total counter").unwrap();
        writeln!(output, "quicfleet_bytes_received_total {}", bytes_received).unwrap();

        // device flows
        writeln!(
            output,
            "# HELP quicfleet_device_flows_total Total flows egressed through a device"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_device_flows_total counter").unwrap();
        writeln!(output, "quicfleet_device_flows_total {}", device_flows).unwrap();

        // static flows
        writeln!(
            output,
            "# HELP quicfleet_static_flows_total Total flows egressed through the static outbound"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_static_flows_total counter").unwrap();
        writeln!(output, "quicfleet_static_flows_total {}", static_flows).unwrap();

        // device registrations
        writeln!(
            output,
            "# HELP quicfleet_device_registrations_total Total device registrations (including rebinds)"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_device_registrations_total counter").unwrap();
        writeln!(
            output,
            "quicfleet_device_registrations_total {}",
            device_registrations
        )
        .unwrap();

        // devices online
        writeln!(
            output,
            "# HELP quicfleet_devices_online Current number of online devices"
        )
        .unwrap();
        writeln!(output, "# TYPE quicfleet_devices_online gauge").unwrap();
        writeln!(output, "quicfleet_devices_online {}", devices_online).unwrap();

        output
    }
}

impl Default for ServerStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ServerStatistics::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.add_bytes_sent(100);
        stats.add_bytes_received(200);
        stats.device_flow();

        let output = stats.to_prometheus(3);
        assert!(output.contains("quicfleet_connections_total 2"));
        assert!(output.contains("quicfleet_connections_active 1"));
        assert!(output.contains("quicfleet_bytes_sent_total 100"));
        assert!(output.contains("quicfleet_bytes_received_total 200"));
        assert!(output.contains("quicfleet_device_flows_total 1"));
        assert!(output.contains("quicfleet_devices_online 3"));
    }
}
