//! QUIC データプレーン（POP 側）
//!
//! デバイスからの QUIC 接続を受け付けます。接続ごとに:
//!
//! 1. 5 秒以内に最初のストリームで `device_id\n` を読み、レジストリに
//!    QUIC 接続をバインドする
//! 2. 以降のピア発ストリームをストリーム表に記録する（サーバー自身は
//!    読まない。フロー用のストリームはアウトバウンドが POP 側から開く）
//! 3. 接続のクローズを監視し、このデバイスの現行接続であれば即座に
//!    オフラインへ遷移させる（再バインド済みの接続は対象外）

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{Connection, Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol;
use crate::registry::Registry;

/// 識別ストリームの受理と device_id 読み取りのデッドライン
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// データプレーンサーバーを起動する
pub async fn run(
    endpoint: Endpoint,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = endpoint.local_addr().context("data plane endpoint")?;
    info!("QUIC data plane listening on {}", local_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("QUIC data plane shutting down");
                endpoint.close(0u32.into(), b"server shutdown");
                return Ok(());
            }
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    return Ok(());
                };
                let registry = registry.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            let remote = conn.remote_address();
                            debug!(%remote, "new QUIC connection");
                            if let Err(e) = handle_connection(conn, registry, conn_cancel).await {
                                debug!(%remote, "QUIC connection ended: {:#}", e);
                            }
                        }
                        Err(e) => {
                            debug!("failed to accept QUIC connection: {}", e);
                        }
                    }
                });
            }
        }
    }
}

/// 1 本のデバイス QUIC 接続を処理する
async fn handle_connection(
    conn: Connection,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    let remote = conn.remote_address();

    // デバイスが開く最初のストリームで device_id を受け取る
    let (_send, mut recv) = tokio::time::timeout(REGISTRATION_TIMEOUT, conn.accept_bi())
        .await
        .context("timed out waiting for identification stream")?
        .context("failed to accept identification stream")?;

    let device_id = tokio::time::timeout(
        REGISTRATION_TIMEOUT,
        protocol::read_address_line(&mut recv),
    )
    .await
    .context("timed out reading device_id")?
    .context("failed to read device_id")?;

    if device_id.is_empty() {
        conn.close(0u32.into(), b"empty device_id");
        anyhow::bail!("empty device_id from {}", remote);
    }

    debug!(%remote, %device_id, "device identified");

    if let Err(e) = registry.bind_quic(&device_id, conn.clone()) {
        // bind_quic は失敗時に接続を閉じている
        error!(%remote, %device_id, "failed to bind QUIC connection: {}", e);
        return Err(e.into());
    }

    let stable_id = conn.stable_id();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                conn.close(0u32.into(), b"server shutdown");
                return Ok(());
            }
            reason = conn.closed() => {
                debug!(%device_id, "QUIC connection closed: {}", reason);
                mark_offline_if_current(&registry, &device_id, stable_id);
                return Ok(());
            }
            stream = conn.accept_bi() => {
                match stream {
                    Ok((send, _recv)) => {
                        // デバイス発のストリーム。現行プロトコルのファスト
                        // パスでは使われないが、ストリーム表に記録する。
                        let conn_id = send.id().index().to_string();
                        debug!(%device_id, %conn_id, "peer-initiated stream recorded");
                        track_stream(&registry, &device_id, conn_id, send, cancel.child_token());
                    }
                    Err(e) => {
                        debug!(%device_id, "QUIC stream accept ended: {}", e);
                        mark_offline_if_current(&registry, &device_id, stable_id);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// デバイス発のストリームをストリーム表に記録し、終了時に登録解除する
fn track_stream(
    registry: &Arc<Registry>,
    device_id: &str,
    conn_id: String,
    mut send: quinn::SendStream,
    cancel: CancellationToken,
) {
    let Ok(device) = registry.get(device_id) else {
        return;
    };
    device.add_stream(&conn_id, cancel.clone());

    let device_id = device_id.to_string();
    tokio::spawn(async move {
        // キャンセル（オフライン遷移）かピア側の終了を待って片付ける
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = send.reset(0u32.into());
            }
            _ = send.stopped() => {}
        }
        device.remove_stream(&conn_id);
        debug!(%device_id, %conn_id, "peer-initiated stream released");
    });
}

/// この接続がまだデバイスの現行接続である場合のみオフラインへ遷移させる
///
/// 再バインド競合の防止: 古い接続のクローズ通知が、新しくバインドされた
/// 接続を巻き込んではならない。
fn mark_offline_if_current(registry: &Arc<Registry>, device_id: &str, stable_id: usize) {
    let current = registry
        .get(device_id)
        .ok()
        .and_then(|d| d.quic_conn())
        .map(|c| c.stable_id());

    if current == Some(stable_id) {
        warn!(%device_id, "data channel lost, marking device offline");
        registry.mark_offline(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::create_client_endpoint;
    use crate::registry::{ControlHandle, RegisterMeta, Transport};
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

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

    #[tokio::test]
    async fn test_identify_binds_quic_connection() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        let cancel = CancellationToken::new();

        let endpoint =
            crate::quic::create_server_endpoint("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let server_addr = endpoint.local_addr().unwrap();

        let server = tokio::spawn(run(endpoint, registry.clone(), cancel.clone()));

        // WSS 側は登録済みという前提を作る
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();

        // デバイス役: QUIC を張って識別ストリームに device_id を書く
        let client = create_client_endpoint(&server_addr, true).unwrap();
        let conn = client
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .unwrap();

        let (mut send, _recv) = conn.open_bi().await.unwrap();
        protocol::write_address_line(&mut send, "d1").await.unwrap();

        // 識別の完了を待つ
        for _ in 0..50 {
            if registry.get("d1").unwrap().is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(registry.get("d1").unwrap().is_online());

        // 接続が切れると（現行接続なので）オフラインに遷移する
        conn.close(0u32.into(), b"bye");
        for _ in 0..50 {
            if !registry.get("d1").unwrap().is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!registry.get("d1").unwrap().is_online());

        cancel.cancel();
        server.abort();
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        let cancel = CancellationToken::new();

        let endpoint =
            crate::quic::create_server_endpoint("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let server_addr = endpoint.local_addr().unwrap();

        let server = tokio::spawn(run(endpoint, registry.clone(), cancel.clone()));

        // 登録されていない device_id で識別する
        let client = create_client_endpoint(&server_addr, true).unwrap();
        let conn = client
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .unwrap();

        let (mut send, _recv) = conn.open_bi().await.unwrap();
        protocol::write_address_line(&mut send, "ghost").await.unwrap();

        // サーバー側が接続を閉じる
        let reason = conn.closed().await;
        match reason {
            quinn::ConnectionError::ApplicationClosed(_) => {}
            other => panic!("expected application close, got {:?}", other),
        }

        cancel.cancel();
        server.abort();
    }
}
