//! quicfleet - リバーストンネル型 SOCKS5 プロキシフリート
//!
//! 中央の POP (point-of-presence) が SOCKS5 クライアント接続を受け付け、
//! 各 TCP フローを、任意のネットワークからダイヤルインしてきたリモート
//! デバイス経由で外部に送出します。
//!
//! # 主要コンポーネント
//!
//! - [`server`] - POP サーバー実装（全サブシステムの組み立て）
//! - [`device`] - デバイスクライアント実装
//! - [`inbound`] - SOCKS5 インバウンドサーバー
//! - [`outbound`] - アウトバウンド実装（direct / socks5 / QUIC デバイス）
//! - [`proxy`] - 接続パイプライン（フック → ルーター → 双方向コピー）
//! - [`router`] - アウトバウンド選択（static / dynamic + round-robin）
//! - [`registry`] - デバイスレジストリ（登録、死活監視、ストリーム管理）
//! - [`control_plane`] - WSS コントロールプレーン（POP 側）
//! - [`data_plane`] - QUIC データプレーン（POP 側）
//! - [`protocol`] - 制御メッセージとストリームフレーミングの定義
//! - [`socks5`] - SOCKS5 (RFC 1928) ハンドシェイク
//! - [`plugin`] - プラグインフック（inbound / outbound / traffic）
//! - [`api`] - HTTP API サーバー（ヘルスチェック、メトリクス）
//!
//! # アーキテクチャ
//!
//! ```text
//! [SOCKS5 Client] ←TCP→ [POP] ←─ WSS (control) ─→ [Device] ←TCP→ [Target]
//!                          ↑ ←─ QUIC (data) ────→    ↑
//!                          │                          │
//!                    ルーターがフロー毎に          ターゲットへ
//!                    デバイスを選択                ローカル接続
//! ```
//!
//! コントロールプレーン (WSS) は登録・ハートビート・コマンドを運び、
//! データプレーン (QUIC) はフロー毎の双方向ストリームを運びます。
//! オンラインのデバイスが選択できない場合、フローは設定済みの静的
//! アウトバウンド (direct または上流 SOCKS5) にフォールバックします。

pub mod api;
pub mod config;
pub mod control_plane;
pub mod data_plane;
pub mod device;
pub mod inbound;
pub mod outbound;
pub mod plugin;
pub mod protocol;
pub mod proxy;
pub mod quic;
pub mod registry;
pub mod router;
pub mod server;
pub mod socks5;
pub mod statistics;
pub mod traffic;

// 便利な再エクスポート
pub use config::{Config, DeviceConfig};
pub use registry::Registry;
