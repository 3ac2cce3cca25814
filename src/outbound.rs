//! アウトバウンド実装
//!
//! 3 種類のアウトバウンドを提供します:
//!
//! - [`DirectOutbound`] - ターゲットへの直接 TCP 接続
//! - [`Socks5Outbound`] - 上流 SOCKS5 プロキシ経由の接続
//! - [`QuicOutbound`] - デバイスの既存 QUIC 接続上に新しいストリームを
//!   開き、`target\n` を書き込む（これが実質の open-tcp コマンド）
//!
//! いずれも [`ProxyConn`] を返し、パイプラインは種類を意識せずに
//! 双方向コピーを行える。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::OutboundConfig;
use crate::protocol::{self, ProtocolError};
use crate::registry::{Device, Registry, RegistryError};
use crate::socks5::{self, Socks5Error};

/// アウトバウンドエラー
#[derive(Error, Debug)]
pub enum OutboundError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("SOCKS5 handshake failed: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to open QUIC stream: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("proxy_address is required for SOCKS5 outbound")]
    MissingProxyAddress,

    #[error("Unsupported outbound type: {0}")]
    UnsupportedType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// アウトバウンド
#[derive(Debug)]
pub enum Outbound {
    Direct(DirectOutbound),
    Socks5(Socks5Outbound),
    Quic(QuicOutbound),
}

impl Outbound {
    /// 設定から静的アウトバウンドを構築する
    ///
    /// デバイスアウトバウンドは設定からではなくプールが構築する。
    pub fn from_config(cfg: &OutboundConfig) -> Result<Self, OutboundError> {
        match cfg.kind.as_str() {
            "direct" => Ok(Outbound::Direct(DirectOutbound::new())),
            "socks5" => {
                if cfg.proxy_address.is_empty() {
                    return Err(OutboundError::MissingProxyAddress);
                }
                Ok(Outbound::Socks5(Socks5Outbound::new(&cfg.proxy_address)))
            }
            other => Err(OutboundError::UnsupportedType(other.to_string())),
        }
    }

    /// ターゲットへの接続を確立する
    pub async fn dial(&self, target: &str) -> Result<ProxyConn, OutboundError> {
        match self {
            Outbound::Direct(o) => o.dial(target).await,
            Outbound::Socks5(o) => o.dial(target).await,
            Outbound::Quic(o) => o.dial(target).await,
        }
    }

    /// デバイス経由かどうか
    pub fn is_device(&self) -> bool {
        matches!(self, Outbound::Quic(_))
    }
}

/// 直接 TCP 接続
#[derive(Default, Debug)]
pub struct DirectOutbound;

impl DirectOutbound {
    pub fn new() -> Self {
        Self
    }

    pub async fn dial(&self, target: &str) -> Result<ProxyConn, OutboundError> {
        let stream = TcpStream::connect(target).await?;
        Ok(ProxyConn::Tcp(stream))
    }
}

/// 上流 SOCKS5 プロキシ経由の接続
#[derive(Debug)]
pub struct Socks5Outbound {
    proxy_address: String,
}

impl Socks5Outbound {
    pub fn new(proxy_address: &str) -> Self {
        Self {
            proxy_address: proxy_address.to_string(),
        }
    }

    pub async fn dial(&self, target: &str) -> Result<ProxyConn, OutboundError> {
        debug!(proxy = %self.proxy_address, target, "connecting via upstream SOCKS5");
        let mut stream = TcpStream::connect(&self.proxy_address).await?;
        socks5::connect(&mut stream, target).await?;
        Ok(ProxyConn::Tcp(stream))
    }
}

/// デバイス経由の QUIC アウトバウンド
///
/// デバイスの既存 QUIC 接続上に新しい双方向ストリームを開き、
/// ターゲットアドレス行を書き込んだ時点で接続確立とみなす。
#[derive(Debug)]
pub struct QuicOutbound {
    device_id: String,
    registry: Arc<Registry>,
}

impl QuicOutbound {
    pub fn new(device_id: &str, registry: Arc<Registry>) -> Self {
        Self {
            device_id: device_id.to_string(),
            registry,
        }
    }

    pub async fn dial(&self, target: &str) -> Result<ProxyConn, OutboundError> {
        let device = self.registry.get(&self.device_id)?;
        let conn = device
            .quic_conn()
            .ok_or_else(|| RegistryError::NoQuicConnection(self.device_id.clone()))?;

        let (mut send, recv) = conn.open_bi().await?;
        let conn_id = send.id().index().to_string();

        debug!(device_id = %self.device_id, conn_id = %conn_id, target, "opening QUIC stream");

        if let Err(e) = protocol::write_address_line(&mut send, target).await {
            // 書き込みに失敗したストリームは登録しない
            return Err(e.into());
        }

        device.add_stream(&conn_id, CancellationToken::new());

        Ok(ProxyConn::Quic(QuicStreamConn {
            send,
            recv,
            conn_id,
            device,
        }))
    }
}

/// QUIC ストリームを `AsyncRead + AsyncWrite` として扱うアダプター
///
/// ドロップ時にデバイスのストリーム表から自分を登録解除する。
#[derive(Debug)]
pub struct QuicStreamConn {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    conn_id: String,
    device: Arc<Device>,
}

impl QuicStreamConn {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }
}

impl Drop for QuicStreamConn {
    fn drop(&mut self) {
        self.device.remove_stream(&self.conn_id);
    }
}

impl AsyncRead for QuicStreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// アウトバウンドが返す統一ストリーム型
#[derive(Debug)]
pub enum ProxyConn {
    Tcp(TcpStream),
    Quic(QuicStreamConn),
}

impl AsyncRead for ProxyConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyConn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ProxyConn::Quic(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyConn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ProxyConn::Quic(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyConn::Tcp(s) => Pin::new(s).poll_flush(cx),
            ProxyConn::Quic(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyConn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ProxyConn::Quic(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// デバイス ID → アウトバウンドの遅延キャッシュ
///
/// 取得時にデバイスの存在とオンライン状態を検証し、無効なエントリは
/// 削除してエラーを返す（遅延無効化）。`mark_offline` フックからの
/// [`OutboundPool::remove`] が即時無効化を担う。
pub struct OutboundPool {
    outbounds: RwLock<HashMap<String, Arc<Outbound>>>,
    registry: Arc<Registry>,
}

impl OutboundPool {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            outbounds: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// デバイスのアウトバウンドを取得する（必要なら作成）
    pub fn get(&self, device_id: &str) -> Result<Arc<Outbound>, OutboundError> {
        let cached = {
            let outbounds = self.outbounds.read().unwrap();
            outbounds.get(device_id).cloned()
        };

        // キャッシュ済みでも毎回オンライン状態を検証する
        match self.registry.get(device_id) {
            Ok(device) if device.is_online() => {}
            Ok(_) => {
                self.remove(device_id);
                return Err(RegistryError::Offline(device_id.to_string()).into());
            }
            Err(e) => {
                self.remove(device_id);
                return Err(e.into());
            }
        }

        if let Some(outbound) = cached {
            return Ok(outbound);
        }

        let outbound = Arc::new(Outbound::Quic(QuicOutbound::new(
            device_id,
            self.registry.clone(),
        )));
        self.outbounds
            .write()
            .unwrap()
            .insert(device_id.to_string(), outbound.clone());

        debug!(device_id, "created pooled outbound");
        Ok(outbound)
    }

    /// エントリを削除する（mark_offline フックから呼ばれる）
    pub fn remove(&self, device_id: &str) {
        if self.outbounds.write().unwrap().remove(device_id).is_some() {
            debug!(device_id, "removed pooled outbound");
        }
    }

    /// プール全体をクリアする
    pub fn clear(&self) {
        self.outbounds.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.outbounds.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbounds.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ControlHandle, RegisterMeta, Transport};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
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

    /// オンラインデバイス 1 台（デバイス側の QUIC 接続も返す）
    async fn registry_with_device(
    ) -> (Arc<Registry>, quinn::Connection, Vec<quinn::Endpoint>) {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        let (device_side, pop_side, ce, se) = crate::quic::test_util::connected_pair().await;
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();
        registry.bind_quic("d1", pop_side).unwrap();
        (registry, device_side, vec![ce, se])
    }

    #[tokio::test]
    async fn test_direct_outbound_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let outbound = DirectOutbound::new();
        let mut conn = outbound.dial(&addr.to_string()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_socks5_outbound_dial() {
        // 簡易上流 SOCKS5 プロキシ: handshake 後にエコー
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let target = crate::socks5::handshake(&mut stream).await.unwrap();
            assert_eq!(target, "192.0.2.1:80");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let outbound = Socks5Outbound::new(&proxy_addr.to_string());
        let mut conn = outbound.dial("192.0.2.1:80").await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_quic_outbound_writes_target_line() {
        let (registry, device_side, _endpoints) = registry_with_device().await;

        // デバイス側: ストリームを受けてターゲット行を読み、エコー
        let device_task = tokio::spawn(async move {
            let (mut send, mut recv) = device_side.accept_bi().await.unwrap();
            let target = crate::protocol::read_address_line(&mut recv).await.unwrap();
            assert_eq!(target, "example.com:443");
            let mut buf = [0u8; 4];
            recv.read_exact(&mut buf).await.unwrap();
            send.write_all(&buf).await.unwrap();
        });

        let outbound = QuicOutbound::new("d1", registry.clone());
        let mut conn = outbound.dial("example.com:443").await.unwrap();

        // ストリーム表に登録されている
        assert_eq!(registry.get("d1").unwrap().stream_count(), 1);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        device_task.await.unwrap();

        // クローズ（ドロップ）で登録解除される
        drop(conn);
        assert_eq!(registry.get("d1").unwrap().stream_count(), 0);
    }

    #[tokio::test]
    async fn test_quic_outbound_fails_without_connection() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        registry
            .register(
                "d1",
                "10.0.0.1:50000",
                RegisterMeta::default(),
                make_control_handle().await,
            )
            .unwrap();

        let outbound = QuicOutbound::new("d1", registry);
        let err = outbound.dial("example.com:443").await.unwrap_err();
        assert!(matches!(
            err,
            OutboundError::Registry(RegistryError::NoQuicConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_creates_and_caches() {
        let (registry, _device_side, _endpoints) = registry_with_device().await;
        let pool = OutboundPool::new(registry);

        let first = pool.get("d1").unwrap();
        let second = pool.get("d1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_invalidates_offline_device() {
        let (registry, _device_side, _endpoints) = registry_with_device().await;
        let pool = OutboundPool::new(registry.clone());

        pool.get("d1").unwrap();
        registry.mark_offline("d1");

        // 遅延無効化: 取得時にオフラインを検出して削除する
        let err = pool.get("d1").unwrap_err();
        assert!(matches!(
            err,
            OutboundError::Registry(RegistryError::Offline(_))
        ));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_pool_unknown_device() {
        let registry = Registry::new(Duration::from_secs(30), Duration::from_secs(90));
        let pool = OutboundPool::new(registry);

        let err = pool.get("ghost").unwrap_err();
        assert!(matches!(
            err,
            OutboundError::Registry(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let direct = Outbound::from_config(&OutboundConfig::default()).unwrap();
        assert!(matches!(direct, Outbound::Direct(_)));

        let socks5 = Outbound::from_config(&OutboundConfig {
            kind: "socks5".to_string(),
            proxy_address: "127.0.0.1:9050".to_string(),
            id: String::new(),
        })
        .unwrap();
        assert!(matches!(socks5, Outbound::Socks5(_)));

        let err = Outbound::from_config(&OutboundConfig {
            kind: "socks5".to_string(),
            proxy_address: String::new(),
            id: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, OutboundError::MissingProxyAddress));

        let err = Outbound::from_config(&OutboundConfig {
            kind: "wireguard".to_string(),
            proxy_address: String::new(),
            id: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, OutboundError::UnsupportedType(_)));
    }
}
