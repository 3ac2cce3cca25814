//! デバイスクライアント
//!
//! POP の鏡像。WSS をダイヤルして登録し、QUIC をダイヤルして識別スト
//! リームを送った後は、POP が開くフロー毎のストリームを処理します:
//! ターゲット行を読み、ローカル TCP 接続を張り、双方向に中継します。
//!
//! WSS 受信ループはコマンドをディスパッチし、自分宛てのレスポンス型は
//! 無視します。ハートビートは `heartbeat_interval` 秒ごとに送信され、
//! 同じ読み取り mutex の下で応答を読みます（受信ループが先に応答を
//! 消費した場合、ここでの読み取りはタイムアウトするが無害）。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::DeviceConfig;
use crate::protocol::{self, CommandKind, ControlMessage, ResponseStatus};
use crate::quic;
use crate::server::shutdown_signal;

/// 識別ストリームを閉じる前の猶予（サーバーが読み終えるのを待つ）
const IDENTIFY_GRACE: Duration = Duration::from_millis(100);

/// ローカルターゲットへの TCP 接続タイムアウト
const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// WSS 受信ループの無害なウェイクアップ間隔
const WSS_READ_GRACE: Duration = Duration::from_secs(30);

/// ハートビート応答の読み取りタイムアウト
const HEARTBEAT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// コピーループのバッファサイズ
const COPY_BUFFER_SIZE: usize = 8192;

type DeviceWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<DeviceWs, Message>>>;
type WsStream = Arc<Mutex<SplitStream<DeviceWs>>>;

/// デバイス側の稼働統計（LoadReport の素材）
#[derive(Default)]
struct DeviceStats {
    active_conns: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl DeviceStats {
    fn conn_opened(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    fn conn_closed(&self) {
        let _ = self
            .active_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// デバイスクライアントを起動する
///
/// シャットダウンシグナル (SIGINT / SIGTERM) を受けるまで動き続ける。
pub async fn run(cfg: DeviceConfig) -> Result<()> {
    cfg.validate()?;

    let cancel = CancellationToken::new();
    let stats = Arc::new(DeviceStats::default());

    // Step 1: WSS コントロールプレーンに接続
    let scheme = if cfg.tls_enabled { "wss" } else { "ws" };
    let url = format!("{}://{}:{}/", scheme, cfg.proxy_host, cfg.wss_port);
    info!("connecting to control plane at {}", url);

    let connector = if cfg.tls_enabled && cfg.tls_skip_verify {
        Some(Connector::Rustls(Arc::new(insecure_tls_config())))
    } else {
        None
    };

    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .context("failed to connect to WSS control plane")?;

    let (sink, stream) = ws.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));
    let stream: WsStream = Arc::new(Mutex::new(stream));

    // Step 2: 登録（応答を同期的に 1 つ読む）
    let register = ControlMessage::RegisterRequest {
        device_id: cfg.device_id.clone(),
        location: cfg.location.clone(),
        capacity: cfg.capacity,
        tags: cfg.tags.clone(),
    };
    send_message(&sink, &register).await?;

    let quic_address = wait_register_response(&stream, &cfg.device_id).await?;
    info!(
        "device {} registered, quic_address: {}",
        cfg.device_id, quic_address
    );

    // Step 3: QUIC データプレーンに接続（設定のホスト + QUIC ポート）
    let server_addr = tokio::net::lookup_host((cfg.proxy_host.as_str(), cfg.quic_port))
        .await
        .context("failed to resolve proxy host")?
        .next()
        .context("proxy host resolved to no addresses")?;

    let endpoint = quic::create_client_endpoint(&server_addr, cfg.tls_skip_verify)?;
    let conn = endpoint
        .connect(server_addr, &cfg.proxy_host)
        .context("invalid QUIC connection parameters")?
        .await
        .context("failed to dial QUIC data plane")?;
    debug!("QUIC data plane connected to {}", server_addr);

    // Step 4: 識別ストリームに device_id を書く
    let (mut id_send, _id_recv) = conn
        .open_bi()
        .await
        .context("failed to open identification stream")?;
    protocol::write_address_line(&mut id_send, &cfg.device_id)
        .await
        .context("failed to send device_id")?;
    // サーバーが読み終えるまでの猶予
    tokio::time::sleep(IDENTIFY_GRACE).await;
    let _ = id_send.finish();
    debug!("identification stream sent for device {}", cfg.device_id);

    // Step 5: POP 発のストリームを処理するループ
    tokio::spawn(serve_streams(
        conn.clone(),
        stats.clone(),
        cancel.child_token(),
    ));

    // Step 6: コマンド受信ループ
    let handlers = Arc::new(CommandHandlers {
        conn: conn.clone(),
        stats: stats.clone(),
    });
    tokio::spawn(receive_loop(
        stream.clone(),
        sink.clone(),
        handlers.clone(),
        cancel.child_token(),
    ));

    // Step 7: ハートビート + 負荷報告
    if cfg.heartbeat_interval > 0 {
        tokio::spawn(heartbeat_loop(
            cfg.device_id.clone(),
            Duration::from_secs(cfg.heartbeat_interval),
            sink.clone(),
            stream.clone(),
            handlers,
            stats.clone(),
            cancel.child_token(),
        ));
    }

    info!("device client started for device {}", cfg.device_id);

    let signal = shutdown_signal().await;
    info!("received {}, shutting down device client", signal);

    cancel.cancel();
    {
        let mut sink = sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
    conn.close(0u32.into(), b"device shutdown");
    let _ = tokio::time::timeout(Duration::from_secs(5), endpoint.wait_idle()).await;

    Ok(())
}

/// 登録応答を待つ
async fn wait_register_response(stream: &WsStream, device_id: &str) -> Result<String> {
    let mut stream = stream.lock().await;
    loop {
        let frame = stream
            .next()
            .await
            .context("control connection closed before register response")?
            .context("failed to read register response")?;

        let data = match frame {
            Message::Binary(data) => data,
            Message::Close(_) => {
                anyhow::bail!("control connection closed before register response")
            }
            _ => continue,
        };

        match ControlMessage::from_frame(&data).context("invalid register response")? {
            ControlMessage::RegisterResponse {
                status: ResponseStatus::Ok,
                quic_address,
                ..
            } => return Ok(quic_address),
            ControlMessage::RegisterResponse { status, .. } => {
                anyhow::bail!("registration of {} failed: {}", device_id, status)
            }
            other => anyhow::bail!("unexpected message during registration: {:?}", other),
        }
    }
}

/// POP が開くフロー毎のストリームを処理する
async fn serve_streams(conn: quinn::Connection, stats: Arc<DeviceStats>, cancel: CancellationToken) {
    debug!("stream server started, waiting for flows");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            stream = conn.accept_bi() => {
                match stream {
                    Ok((send, recv)) => {
                        let stats = stats.clone();
                        tokio::spawn(handle_stream(send, recv, stats));
                    }
                    Err(e) => {
                        debug!("QUIC stream accept ended: {}", e);
                        return;
                    }
                }
            }
        }
    }
}

/// 1 本のフローを処理する: ターゲット行 → ローカル接続 → 中継
async fn handle_stream(
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    stats: Arc<DeviceStats>,
) {
    let conn_id = recv.id().index().to_string();

    let target = match protocol::read_address_line(&mut recv).await {
        Ok(target) if !target.is_empty() => target,
        Ok(_) => {
            debug!(%conn_id, "empty target address, dropping stream");
            return;
        }
        Err(e) => {
            error!(%conn_id, "failed to read target address: {}", e);
            return;
        }
    };

    debug!(%conn_id, %target, "connecting to local target");

    let tcp = match tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            error!(%conn_id, %target, "failed to connect: {}", e);
            return;
        }
        Err(_) => {
            error!(%conn_id, %target, "connect timed out");
            return;
        }
    };

    stats.conn_opened();
    if let Err(e) = relay_tcp_stream(&conn_id, tcp, send, recv, &stats).await {
        debug!(%conn_id, "relay ended: {}", e);
    }
    stats.conn_closed();
}

/// TCP ストリームと QUIC ストリーム間でデータを中継する
///
/// 両方向を独立したタスクで動かし、片側の EOF を反対側へ伝える。
/// EOF は成功であり、両方向の完了を待ってから戻る。
async fn relay_tcp_stream(
    conn_id: &str,
    tcp: TcpStream,
    mut quic_send: quinn::SendStream,
    mut quic_recv: quinn::RecvStream,
    stats: &Arc<DeviceStats>,
) -> Result<()> {
    debug!("[{}] starting relay", conn_id);
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    // TCP -> QUIC（ターゲットからの応答を POP へ）
    let stats_up = stats.clone();
    let tcp_to_quic = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = tcp_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            quic_send.write_all(&buf[..n]).await?;
            stats_up.add_received(n as u64);
        }
        quic_send.finish()?;
        Ok::<_, anyhow::Error>(())
    });

    // QUIC -> TCP（POP からのクライアントデータをターゲットへ）
    let stats_down = stats.clone();
    let quic_to_tcp = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            match quic_recv.read(&mut buf).await? {
                Some(n) if n > 0 => {
                    tcp_write.write_all(&buf[..n]).await?;
                    stats_down.add_sent(n as u64);
                }
                _ => break,
            }
        }
        let _ = tcp_write.shutdown().await;
        Ok::<_, anyhow::Error>(())
    });

    let (up, down) = tokio::join!(tcp_to_quic, quic_to_tcp);
    if let Ok(Err(e)) = up {
        debug!("[{}] tcp->quic ended with error: {}", conn_id, e);
    }
    if let Ok(Err(e)) = down {
        debug!("[{}] quic->tcp ended with error: {}", conn_id, e);
    }

    debug!("[{}] relay completed", conn_id);
    Ok(())
}

/// POP からのコマンドを処理するハンドラー群
struct CommandHandlers {
    conn: quinn::Connection,
    stats: Arc<DeviceStats>,
}

impl CommandHandlers {
    async fn handle(&self, conn_id: &str, command: CommandKind) -> Result<()> {
        match command {
            CommandKind::OpenTcp { target } => {
                debug!(%conn_id, %target, "open-tcp command");
                let (send, recv) = self
                    .conn
                    .open_bi()
                    .await
                    .context("failed to open QUIC stream")?;

                let stats = self.stats.clone();
                let conn_id = conn_id.to_string();
                tokio::spawn(async move {
                    let tcp = match tokio::time::timeout(
                        TCP_DIAL_TIMEOUT,
                        TcpStream::connect(&target),
                    )
                    .await
                    {
                        Ok(Ok(tcp)) => tcp,
                        Ok(Err(e)) => {
                            error!(%conn_id, %target, "failed to connect: {}", e);
                            return;
                        }
                        Err(_) => {
                            error!(%conn_id, %target, "connect timed out");
                            return;
                        }
                    };
                    stats.conn_opened();
                    let _ = relay_tcp_stream(&conn_id, tcp, send, recv, &stats).await;
                    stats.conn_closed();
                });
                Ok(())
            }
            CommandKind::OpenUdp { target } => {
                // UDP コマンドは予約のみ
                anyhow::bail!("UDP not implemented (target {})", target)
            }
            CommandKind::Close => {
                debug!(%conn_id, "close command");
                Ok(())
            }
        }
    }
}

/// WSS 受信ループ
///
/// 30 秒の読み取りタイムアウトは無害で、キャンセル確認のための
/// ウェイクアップとして機能する。
async fn receive_loop(
    stream: WsStream,
    sink: WsSink,
    handlers: Arc<CommandHandlers>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = async {
                let mut stream = stream.lock().await;
                tokio::time::timeout(WSS_READ_GRACE, stream.next()).await
            } => frame,
        };

        let frame = match frame {
            // 読み取りタイムアウトは無害。ループを続ける。
            Err(_) => continue,
            Ok(frame) => frame,
        };

        match frame {
            None => {
                info!("control connection closed");
                return;
            }
            Some(Ok(Message::Binary(data))) => match ControlMessage::from_frame(&data) {
                Ok(msg) => dispatch_message(msg, &sink, &handlers).await,
                Err(e) => warn!("failed to decode control message: {}", e),
            },
            Some(Ok(Message::Close(_))) => {
                info!("control connection closed by server");
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                info!("control connection closed");
                return;
            }
            Some(Err(e)) => {
                warn!("control connection read failed: {}", e);
                return;
            }
        }
    }
}

/// 受信メッセージをディスパッチする
///
/// コマンドはハンドラーへ。自分が送ったリクエストへの応答型は無視する
/// （ハートビート応答はハートビートループが読むか、ここで捨てられる）。
async fn dispatch_message(msg: ControlMessage, sink: &WsSink, handlers: &Arc<CommandHandlers>) {
    match msg {
        ControlMessage::Command { conn_id, command } => {
            if let Err(e) = handlers.handle(&conn_id, command).await {
                error!(%conn_id, "command failed: {:#}", e);
                let response = ControlMessage::CommandResponse {
                    conn_id,
                    success: false,
                    error: format!("{:#}", e),
                };
                if let Err(e) = send_message(sink, &response).await {
                    debug!("failed to send command response: {}", e);
                }
            }
        }
        ControlMessage::RegisterResponse { .. } | ControlMessage::HeartbeatResponse { .. } => {
            trace!("ignoring response-type message");
        }
        other => {
            debug!("ignoring unexpected control message: {:?}", other);
        }
    }
}

/// ハートビートと負荷報告を定期送信するループ
async fn heartbeat_loop(
    device_id: String,
    interval: Duration,
    sink: WsSink,
    stream: WsStream,
    handlers: Arc<CommandHandlers>,
    stats: Arc<DeviceStats>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval の最初の tick は即時発火するため読み飛ばす
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let heartbeat = ControlMessage::HeartbeatRequest {
            device_id: device_id.clone(),
            timestamp: unix_now(),
        };
        if let Err(e) = send_message(&sink, &heartbeat).await {
            // 失敗してもクライアントは落とさない。オフライン遷移は POP の
            // スイーパーの責務。
            warn!("heartbeat send failed: {}", e);
            continue;
        }

        // 応答を同じ読み取り mutex の下で読む
        let read_result = tokio::time::timeout(HEARTBEAT_READ_TIMEOUT, async {
            let mut stream = stream.lock().await;
            stream.next().await
        })
        .await;

        match read_result {
            Ok(Some(Ok(Message::Binary(data)))) => match ControlMessage::from_frame(&data) {
                Ok(ControlMessage::HeartbeatResponse { status }) => {
                    debug!(%device_id, %status, "heartbeat acknowledged");
                }
                // 競合で拾った他のメッセージも取りこぼさない
                Ok(msg) => dispatch_message(msg, &sink, &handlers).await,
                Err(e) => warn!("failed to decode heartbeat response: {}", e),
            },
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => warn!("heartbeat response read failed: {}", e),
            Ok(None) => {
                info!("control connection closed");
                return;
            }
            // 応答は受信ループ側で消費された可能性が高い
            Err(_) => debug!("heartbeat response not observed"),
        }

        // 負荷報告（応答なし）
        let report = ControlMessage::LoadReport {
            device_id: device_id.clone(),
            timestamp: unix_now(),
            active_conns: stats.active_conns.load(Ordering::Relaxed) as u32,
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
        };
        if let Err(e) = send_message(&sink, &report).await {
            debug!("load report send failed: {}", e);
        }
    }
}

/// メッセージを書き込み mutex 越しに送信する
async fn send_message(sink: &WsSink, msg: &ControlMessage) -> Result<()> {
    let mut sink = sink.lock().await;
    sink.send(Message::Binary(msg.to_frame()))
        .await
        .context("failed to send control message")?;
    Ok(())
}

/// --tls-skip-verify 用の TLS 設定
fn insecure_tls_config() -> rustls::ClientConfig {
    quic::ensure_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(crate::quic::SkipServerVerification))
        .with_no_client_auth()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
