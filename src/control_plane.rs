//! WSS コントロールプレーン（POP 側）
//!
//! デバイスからの WebSocket 接続を受け付け、フレーム化された制御
//! メッセージを受信ループでディスパッチします。
//!
//! - `RegisterRequest` → 登録 / 再バインドして `RegisterResponse` を返す
//! - `HeartbeatRequest` → ハートビート更新、`HeartbeatResponse` を返す
//! - `LoadReport` → デバイスのカウンター更新（レスポンスなし）
//! - `CommandResponse` → ログのみ（コマンド相関表は持たない）
//! - POP 宛てでないレスポンス型は黙って無視する
//!
//! 1 接続の書き込みは書き込み mutex で直列化され、読み取りは受信ループ
//! が単独で行う。ピアのクローズは Close フレーム / 構造化エラーで判定し、
//! エラー文字列の照合は行わない。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{CommandKind, ControlMessage, ResponseStatus};
use crate::registry::{ControlHandle, ControlSink, RegisterMeta, Registry, Transport};
use crate::statistics::ServerStatistics;

/// コントロールプレーンサーバーを起動する
pub async fn run(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    registry: Arc<Registry>,
    statistics: Arc<ServerStatistics>,
    quic_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("control plane listener")?;
    info!("WSS control plane listening on {}", local_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("WSS control plane shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let tls = tls.clone();
                        let registry = registry.clone();
                        let statistics = statistics.clone();
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(
                                stream, peer, tls, registry, statistics, quic_port, conn_cancel,
                            )
                            .await
                            {
                                debug!(%peer, "control connection ended: {:#}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept control connection: {}", e);
                    }
                }
            }
        }
    }
}

/// 1 本のコントロール接続を処理する
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    registry: Arc<Registry>,
    statistics: Arc<ServerStatistics>,
    quic_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let transport: Box<dyn Transport> = match tls {
        Some(acceptor) => Box::new(
            acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?,
        ),
        None => Box::new(stream),
    };

    let ws = tokio_tungstenite::accept_async(transport)
        .await
        .context("WebSocket handshake failed")?;
    debug!(%peer, "new control connection");

    let (sink, mut read) = ws.split();
    let sink: ControlSink = Arc::new(tokio::sync::Mutex::new(sink));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // mark_offline またはサーバー停止からの終了指示
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                debug!(%peer, "control connection closed by server");
                return Ok(());
            }
            frame = read.next() => {
                match frame {
                    None => {
                        debug!(%peer, "control connection closed by peer");
                        return Ok(());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match ControlMessage::from_frame(&data) {
                            Ok(msg) => {
                                dispatch(
                                    msg, peer, &sink, &cancel, &registry, &statistics, quic_port,
                                )
                                .await;
                            }
                            Err(e) => {
                                // 不明なメッセージは記録して続行する
                                warn!(%peer, "failed to decode control message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(%peer, "received close frame");
                        return Ok(());
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Text は無視（Pong は tungstenite が応答する）
                    }
                    Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(e).context("control connection read failed");
                    }
                }
            }
        }
    }
}

/// 受信メッセージをディスパッチする
async fn dispatch(
    msg: ControlMessage,
    peer: SocketAddr,
    sink: &ControlSink,
    cancel: &CancellationToken,
    registry: &Arc<Registry>,
    statistics: &Arc<ServerStatistics>,
    quic_port: u16,
) {
    match msg {
        ControlMessage::RegisterRequest {
            device_id,
            location,
            capacity,
            tags,
        } => {
            debug!(%peer, %device_id, "register request");

            let meta = RegisterMeta {
                location,
                capacity,
                tags,
            };
            let handle = ControlHandle {
                sink: sink.clone(),
                cancel: cancel.clone(),
            };

            let status = match registry.register(&device_id, &peer.to_string(), meta, handle) {
                Ok(_) => {
                    statistics.device_registered();
                    ResponseStatus::Ok
                }
                Err(e) => {
                    error!(%peer, %device_id, "registration failed: {}", e);
                    ResponseStatus::Error
                }
            };

            let response = ControlMessage::RegisterResponse {
                status,
                device_id,
                // データプレーンはこの POP の同一 IP + 設定済み QUIC ポート
                quic_address: format!("{}:{}", local_ip_for(peer), quic_port),
            };
            if let Err(e) = send_message(sink, &response).await {
                debug!(%peer, "failed to send register response: {}", e);
            }
        }
        ControlMessage::HeartbeatRequest {
            device_id,
            timestamp,
        } => {
            trace!(%device_id, timestamp, "heartbeat");

            let status = match registry.heartbeat(&device_id) {
                Ok(()) => ResponseStatus::Ok,
                Err(e) => {
                    warn!(%device_id, "heartbeat for unknown device: {}", e);
                    ResponseStatus::Error
                }
            };

            let response = ControlMessage::HeartbeatResponse { status };
            if let Err(e) = send_message(sink, &response).await {
                debug!(%peer, "failed to send heartbeat response: {}", e);
            }
        }
        ControlMessage::LoadReport {
            device_id,
            timestamp,
            active_conns,
            bytes_sent,
            bytes_received,
        } => {
            debug!(
                %device_id, timestamp, active_conns, bytes_sent, bytes_received,
                "load report"
            );
            match registry.get(&device_id) {
                Ok(device) => device.add_bytes(bytes_sent, bytes_received),
                Err(e) => warn!(%device_id, "load report for unknown device: {}", e),
            }
        }
        ControlMessage::CommandResponse {
            conn_id,
            success,
            error,
        } => {
            // 相関表は持たない。フローはデータプレーンのストリーム開通に
            // 依存しており、ここではログに残すだけ。
            debug!(%conn_id, success, %error, "command response");
        }
        ControlMessage::RegisterResponse { .. } | ControlMessage::HeartbeatResponse { .. } => {
            // POP が受信する種類ではない（送信専用）。黙って無視。
            trace!(%peer, "ignoring response-type message");
        }
        ControlMessage::Command { conn_id, .. } => {
            // デバイス宛てのコマンドが POP に届くことはない
            warn!(%peer, %conn_id, "unexpected command message from device");
        }
    }
}

/// 観測したピアアドレスから quic_address 用の IP 部分を得る
///
/// TODO: NAT 越しのデバイスには POP の外向きアドレスを設定から渡せる
/// ようにする（現状は Go 版と同じく観測アドレス頼み）。
fn local_ip_for(peer: SocketAddr) -> String {
    peer.ip().to_string()
}

/// メッセージを書き込み mutex 越しに送信する
pub async fn send_message(sink: &ControlSink, msg: &ControlMessage) -> Result<()> {
    let mut sink = sink.lock().await;
    sink.send(Message::Binary(msg.to_frame()))
        .await
        .context("failed to send control message")?;
    Ok(())
}

/// デバイスへコマンドを送る
///
/// 現行プロトコルでは QUIC ストリームの開通自体が open-tcp コマンドで
/// あり、この経路は将来の明示的なコマンド配送のために保持されている。
pub async fn send_command(
    registry: &Registry,
    device_id: &str,
    conn_id: &str,
    command: CommandKind,
) -> Result<()> {
    let device = registry.get(device_id)?;
    let sink = device
        .control_sink()
        .ok_or_else(|| anyhow::anyhow!("WSS connection not established for device {}", device_id))?;

    let msg = ControlMessage::Command {
        conn_id: conn_id.to_string(),
        command,
    };
    send_message(&sink, &msg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceStatus;
    use std::time::Duration;

    /// コントロールプレーンを平文 WS で立ち上げ、デバイス役のクライアント
    /// から登録とハートビートを行うエンドツーエンドテスト
    #[tokio::test]
    async fn test_register_and_heartbeat_roundtrip() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        let statistics = Arc::new(ServerStatistics::new());
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(run(
            listener,
            None,
            registry.clone(),
            statistics.clone(),
            4433,
            cancel.clone(),
        ));

        // デバイス役として接続
        let url = format!("ws://{}/", addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let register = ControlMessage::RegisterRequest {
            device_id: "d1".to_string(),
            location: "tokyo".to_string(),
            capacity: 4,
            tags: vec!["jp".to_string()],
        };
        ws.send(Message::Binary(register.to_frame())).await.unwrap();

        // RegisterResponse を受信
        let frame = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => break data,
                _ => continue,
            }
        };
        match ControlMessage::from_frame(&frame).unwrap() {
            ControlMessage::RegisterResponse {
                status,
                device_id,
                quic_address,
            } => {
                assert_eq!(status, ResponseStatus::Ok);
                assert_eq!(device_id, "d1");
                assert!(quic_address.ends_with(":4433"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // レジストリに登録されている（QUIC 未バインドなのでオンラインではない）
        let device = registry.get("d1").unwrap();
        assert_eq!(device.status(), DeviceStatus::Online);
        assert!(!device.is_online());
        assert_eq!(device.location(), "tokyo");

        // ハートビート
        let heartbeat = ControlMessage::HeartbeatRequest {
            device_id: "d1".to_string(),
            timestamp: 1_700_000_000,
        };
        ws.send(Message::Binary(heartbeat.to_frame())).await.unwrap();

        let frame = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => break data,
                _ => continue,
            }
        };
        match ControlMessage::from_frame(&frame).unwrap() {
            ControlMessage::HeartbeatResponse { status } => {
                assert_eq!(status, ResponseStatus::Ok)
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // 未知デバイスのハートビートは error ステータス
        let heartbeat = ControlMessage::HeartbeatRequest {
            device_id: "ghost".to_string(),
            timestamp: 1_700_000_000,
        };
        ws.send(Message::Binary(heartbeat.to_frame())).await.unwrap();
        let frame = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => break data,
                _ => continue,
            }
        };
        match ControlMessage::from_frame(&frame).unwrap() {
            ControlMessage::HeartbeatResponse { status } => {
                assert_eq!(status, ResponseStatus::Error)
            }
            other => panic!("unexpected message: {:?}", other),
        }

        cancel.cancel();
        server.abort();
    }

    /// 不正なフレームを受けても接続は継続する
    #[tokio::test]
    async fn test_unknown_message_does_not_kill_connection() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        let statistics = Arc::new(ServerStatistics::new());
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(run(
            listener,
            None,
            registry.clone(),
            statistics,
            4433,
            cancel.clone(),
        ));

        let url = format!("ws://{}/", addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        // ゴミフレームを送ってから正規の登録を送る
        ws.send(Message::Binary(vec![0, 0, 0, 1, 0xEE])).await.unwrap();

        let register = ControlMessage::RegisterRequest {
            device_id: "d1".to_string(),
            location: String::new(),
            capacity: 0,
            tags: vec![],
        };
        ws.send(Message::Binary(register.to_frame())).await.unwrap();

        let frame = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => break data,
                _ => continue,
            }
        };
        assert!(matches!(
            ControlMessage::from_frame(&frame).unwrap(),
            ControlMessage::RegisterResponse { status: ResponseStatus::Ok, .. }
        ));

        cancel.cancel();
        server.abort();
    }
}
