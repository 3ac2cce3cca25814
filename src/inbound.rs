//! SOCKS5 インバウンドサーバー
//!
//! クライアント接続を受け付け、接続ごとのタスクで SOCKS5 ハンドシェイク
//! を実行し、得られた `(接続, ターゲット, コンテキスト)` をパイプライン
//! に渡します。

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::plugin::ConnectionContext;
use crate::proxy::ConnectionHandler;
use crate::socks5;

/// SOCKS5 インバウンド
pub struct Socks5Inbound {
    port: u16,
    id: String,
}

impl Socks5Inbound {
    pub fn new(port: u16, id: &str) -> Self {
        Self {
            port,
            id: id.to_string(),
        }
    }

    /// リスナーを起動し、キャンセルされるまで接続を受け続ける
    pub async fn run(
        &self,
        handler: Arc<ConnectionHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind SOCKS5 listener on port {}", self.port))?;

        info!("SOCKS5 inbound listening on port {}", self.port);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("SOCKS5 inbound shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "new inbound connection");
                            let handler = handler.clone();
                            let inbound_id = self.id.clone();
                            tokio::spawn(async move {
                                handle_socks5(stream, peer.to_string(), inbound_id, handler).await;
                            });
                        }
                        Err(e) => {
                            error!("failed to accept inbound connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// 1 本のクライアント接続を処理する
async fn handle_socks5(
    mut stream: TcpStream,
    peer: String,
    inbound_id: String,
    handler: Arc<ConnectionHandler>,
) {
    // ハンドシェイク完了時点で成功リプライは送信済み
    let target = match socks5::handshake(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            debug!(%peer, "SOCKS5 handshake failed: {}", e);
            return;
        }
    };

    debug!(%peer, %target, "SOCKS5 connection established");

    let ctx = Arc::new(ConnectionContext::new(
        peer.clone(),
        target.clone(),
        inbound_id,
    ));

    match handler.handle(stream, &target, ctx).await {
        Ok(()) => debug!(%peer, %target, "connection closed"),
        Err(e) => debug!(%peer, %target, "connection closed with error: {:#}", e),
    }
}
