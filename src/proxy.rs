//! 接続パイプライン
//!
//! インバウンドから受け取った `(クライアント接続, ターゲット, コンテキスト)`
//! を、フック → ルーター → アウトバウンド解決 → 双方向コピーの順に処理
//! します。コピーループはバイト数をコンテキストへ加算し、書き込み成功の
//! たびに on-data-transfer フックを呼びます。

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::OutboundConfig;
use crate::outbound::{Outbound, OutboundPool};
use crate::plugin::{ConnectionContext, PluginManager, TransferDirection};
use crate::router::{Route, Router};
use crate::statistics::ServerStatistics;

/// コピーループのバッファサイズ
const COPY_BUFFER_SIZE: usize = 8192;

/// 接続パイプラインの共有コンテキスト
///
/// クロージャにコンフィグを閉じ込めるのではなく、依存を明示的に持つ。
pub struct ConnectionHandler {
    pub outbound: Arc<Outbound>,
    pub outbound_id: String,
    pub outbound_config: OutboundConfig,
    pub router: Arc<dyn Router>,
    pub plugins: Arc<PluginManager>,
    pub pool: Option<Arc<OutboundPool>>,
    pub statistics: Arc<ServerStatistics>,
}

impl ConnectionHandler {
    /// 1 本のクライアント接続を処理する
    ///
    /// SOCKS5 の成功リプライは送信済みの状態で呼ばれる。アウトバウンドの
    /// 接続に失敗した場合、クライアントには成功リプライ + 即時 EOF が
    /// 見える（現行プロトコルの仕様）。
    pub async fn handle(
        &self,
        client: TcpStream,
        target: &str,
        ctx: Arc<ConnectionContext>,
    ) -> Result<()> {
        self.statistics.connection_opened();

        let result = self.handle_inner(client, target, &ctx).await;

        // クローズフックは接続の結末にかかわらず必ず呼ぶ
        self.plugins.on_connection_closed(&ctx);
        self.statistics.connection_closed();

        result
    }

    async fn handle_inner(
        &self,
        client: TcpStream,
        target: &str,
        ctx: &Arc<ConnectionContext>,
    ) -> Result<()> {
        self.plugins
            .on_inbound_connection(ctx)
            .context("inbound hook rejected connection")?;

        // ルーターにアウトバウンドを選ばせる
        let route = self
            .router
            .select_outbound(ctx, target, &self.outbound_id, &self.outbound_config)
            .context("router failed to select outbound")?;

        let (outbound, outbound_id) = self.resolve_outbound(route)?;
        ctx.set_outbound_id(&outbound_id);

        self.plugins
            .on_outbound_connection(ctx)
            .context("outbound hook rejected connection")?;

        debug!(target, outbound_id = %outbound_id, "establishing outbound connection");

        let remote = outbound
            .dial(target)
            .await
            .with_context(|| format!("failed to dial {}", target))?;

        if outbound.is_device() {
            self.statistics.device_flow();
        } else {
            self.statistics.static_flow();
        }

        // 双方向コピー（各方向は独立したタスクで動く）
        let (client_read, client_write) = client.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);

        let ctx_up = ctx.clone();
        let plugins_up = self.plugins.clone();
        let statistics_up = self.statistics.clone();
        let upstream = tokio::spawn(async move {
            copy_counted(
                client_read,
                remote_write,
                ctx_up,
                plugins_up,
                statistics_up,
                TransferDirection::Sent,
            )
            .await
        });

        let ctx_down = ctx.clone();
        let plugins_down = self.plugins.clone();
        let statistics_down = self.statistics.clone();
        let downstream = tokio::spawn(async move {
            copy_counted(
                remote_read,
                client_write,
                ctx_down,
                plugins_down,
                statistics_down,
                TransferDirection::Received,
            )
            .await
        });

        // 片方向が終わると EOF が伝播し、もう片方も終わる。
        // 両方を待つことで 2 本目のドレインまで完了させる。
        let (up, down) = tokio::join!(upstream, downstream);

        match (up, down) {
            (Ok(Err(e)), _) | (_, Ok(Err(e))) => {
                debug!(target, "flow closed with error: {}", e);
            }
            _ => {
                debug!(target, "flow closed");
            }
        }

        Ok(())
    }

    /// ルーターの選択結果を具体的なアウトバウンドへ解決する
    ///
    /// プール取得に失敗した場合は現行アウトバウンドへフォールバックする
    /// （プロキシは劣化しても停止しない）。
    fn resolve_outbound(&self, route: Route) -> Result<(Arc<Outbound>, String)> {
        match route {
            Route::Pooled(device_id) => match &self.pool {
                Some(pool) => match pool.get(&device_id) {
                    Ok(outbound) => Ok((outbound, device_id)),
                    Err(e) => {
                        debug!(
                            device_id = %device_id,
                            "failed to get pooled outbound ({}), using current",
                            e
                        );
                        Ok((self.outbound.clone(), self.outbound_id.clone()))
                    }
                },
                None => {
                    debug!(device_id = %device_id, "pool not available, using current outbound");
                    Ok((self.outbound.clone(), device_id))
                }
            },
            Route::Fresh(config) => {
                let outbound = Outbound::from_config(&config)
                    .context("failed to create outbound from config")?;
                Ok((Arc::new(outbound), config.id))
            }
            Route::Current => Ok((self.outbound.clone(), self.outbound_id.clone())),
        }
    }
}

/// カウント付き単方向コピー
///
/// 書き込みが成功するたびにコンテキストと統計へバイト数を加算し、
/// on-data-transfer フックを呼ぶ。EOF で writer を shutdown して
/// 反対側へ終端を伝える。
async fn copy_counted<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: Arc<ConnectionContext>,
    plugins: Arc<PluginManager>,
    statistics: Arc<ServerStatistics>,
    direction: TransferDirection,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        total += n as u64;

        ctx.add_bytes(direction, n as u64);
        match direction {
            TransferDirection::Sent => statistics.add_bytes_sent(n as u64),
            TransferDirection::Received => statistics.add_bytes_received(n as u64),
        }
        plugins.on_data_transfer(&ctx, direction, n as u64);
    }
}
