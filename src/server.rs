//! POP サーバー実装
//!
//! 設定から全サブシステム（レジストリ、プール、ルーター、プラグイン、
//! アウトバウンド、インバウンド、コントロール / データプレーン、API）を
//! 組み立てて起動します。シャットダウンシグナルで 5 秒の猶予つき
//! グレースフル停止を行います。

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::config::{Config, OutboundPoolConfig, TlsConfig};
use crate::control_plane;
use crate::data_plane;
use crate::inbound::Socks5Inbound;
use crate::outbound::{Outbound, OutboundPool};
use crate::plugin::PluginManager;
use crate::proxy::ConnectionHandler;
use crate::quic;
use crate::registry::Registry;
use crate::router::{DynamicRouter, Router, RoundRobinStrategy, StaticRouter};
use crate::statistics::ServerStatistics;
use crate::traffic::{InboundCounter, OutboundCounter};

/// シャットダウン時の排水猶予
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// POP サーバーを起動し、シャットダウンシグナルまで動かす
pub async fn run(cfg: Config, api_listen: Option<SocketAddr>) -> Result<()> {
    if cfg.inbound.kind != "socks5" {
        anyhow::bail!("unsupported inbound type: {}", cfg.inbound.kind);
    }

    let cancel = CancellationToken::new();
    let statistics = Arc::new(ServerStatistics::new());
    let plugins = Arc::new(build_plugins(&cfg)?);

    // アウトバウンドプールが有効ならデバイスフリート一式を起動する
    let (router, pool, registry): (
        Arc<dyn Router>,
        Option<Arc<OutboundPool>>,
        Option<Arc<Registry>>,
    ) = match cfg.outbound_pool.as_ref().filter(|p| p.enabled) {
        Some(pool_cfg) => {
            let (router, pool, registry) =
                start_outbound_pool(pool_cfg, statistics.clone(), &cancel).await?;
            (router, Some(pool), Some(registry))
        }
        None => (Arc::new(StaticRouter::new()), None, None),
    };

    // 静的アウトバウンド（フォールバック先）
    let outbound = Arc::new(
        Outbound::from_config(&cfg.outbound).context("failed to initialize outbound")?,
    );

    let handler = Arc::new(ConnectionHandler {
        outbound,
        outbound_id: cfg.outbound.id.clone(),
        outbound_config: cfg.outbound.clone(),
        router,
        plugins: plugins.clone(),
        pool,
        statistics: statistics.clone(),
    });

    // API サーバー
    if let Some(api_addr) = api_listen {
        let state = ApiState {
            statistics: statistics.clone(),
            registry: registry.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = api::run(api_addr, state).await {
                error!("API server failed: {:#}", e);
            }
        });
    }

    // SOCKS5 インバウンド
    let inbound = Socks5Inbound::new(cfg.inbound.port, &cfg.inbound.id);
    let inbound_cancel = cancel.child_token();
    let inbound_task = tokio::spawn(async move { inbound.run(handler, inbound_cancel).await });

    let signal = shutdown_signal().await;
    info!("received {}, shutting down", signal);

    // グレースフル停止: 新規受け付けを止め、猶予内で排水する
    cancel.cancel();
    if let Some(registry) = registry {
        registry.close();
    }
    plugins.close();

    match tokio::time::timeout(SHUTDOWN_GRACE, inbound_task).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => warn!("inbound task panicked: {}", e),
        Err(_) => warn!("shutdown grace expired, forcing close"),
    }

    info!("server stopped");
    Ok(())
}

/// デバイスフリートのサブシステムを起動する
async fn start_outbound_pool(
    pool_cfg: &OutboundPoolConfig,
    statistics: Arc<ServerStatistics>,
    cancel: &CancellationToken,
) -> Result<(Arc<dyn Router>, Arc<OutboundPool>, Arc<Registry>)> {
    let registry = Registry::new(
        Duration::from_secs(pool_cfg.heartbeat_interval),
        Duration::from_secs(pool_cfg.heartbeat_timeout),
    );

    let pool = Arc::new(OutboundPool::new(registry.clone()));

    // mark_offline からプールを即時無効化する
    let pool_for_hook = pool.clone();
    registry.set_offline_hook(move |device_id| {
        pool_for_hook.remove(device_id);
    });

    let router: Arc<dyn Router> = Arc::new(DynamicRouter::new(
        registry.clone(),
        Arc::new(RoundRobinStrategy::new()),
    ));

    // WSS コントロールプレーン
    let tls_acceptor = build_tls_acceptor(&pool_cfg.tls)?;
    let wss_listener = TcpListener::bind(("0.0.0.0", pool_cfg.wss_port))
        .await
        .with_context(|| format!("failed to bind WSS listener on port {}", pool_cfg.wss_port))?;
    {
        let registry = registry.clone();
        let statistics = statistics.clone();
        let cancel = cancel.child_token();
        let quic_port = pool_cfg.quic_port;
        tokio::spawn(async move {
            if let Err(e) = control_plane::run(
                wss_listener,
                tls_acceptor,
                registry,
                statistics,
                quic_port,
                cancel,
            )
            .await
            {
                error!("WSS control plane failed: {:#}", e);
            }
        });
    }

    // QUIC データプレーン
    let cert = if pool_cfg.tls.enabled
        && !pool_cfg.tls.cert_file.is_empty()
        && !pool_cfg.tls.key_file.is_empty()
    {
        Some((
            Path::new(&pool_cfg.tls.cert_file).to_path_buf(),
            Path::new(&pool_cfg.tls.key_file).to_path_buf(),
        ))
    } else {
        None
    };
    let quic_addr: SocketAddr = format!("0.0.0.0:{}", pool_cfg.quic_port)
        .parse()
        .context("invalid QUIC bind address")?;
    let endpoint = quic::create_server_endpoint(
        quic_addr,
        cert.as_ref().map(|(c, k)| (c.as_path(), k.as_path())),
    )?;
    {
        let registry = registry.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = data_plane::run(endpoint, registry, cancel).await {
                error!("QUIC data plane failed: {:#}", e);
            }
        });
    }

    info!(
        "outbound pool enabled: WSS control plane on port {}, QUIC data plane on port {}",
        pool_cfg.wss_port, pool_cfg.quic_port
    );

    Ok((router, pool, registry))
}

/// WSS 用の TLS アクセプターを構築する
///
/// TLS 無効時は None（平文 WS、テスト用）。有効で証明書ファイルが
/// 未指定の場合は自己署名証明書を生成する。
fn build_tls_acceptor(tls: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    if !tls.enabled {
        return Ok(None);
    }

    quic::ensure_crypto_provider();

    let (certs, key) = if !tls.cert_file.is_empty() && !tls.key_file.is_empty() {
        quic::load_cert_chain(Path::new(&tls.cert_file), Path::new(&tls.key_file))?
    } else {
        warn!("TLS enabled without cert/key files, using self-signed certificate");
        quic::generate_self_signed_cert()?
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create WSS TLS config")?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// 設定からプラグインを構築する
fn build_plugins(cfg: &Config) -> Result<PluginManager> {
    use crate::plugin::Plugin;

    let mut manager = PluginManager::new();

    if let Some(plugin_cfg) = cfg.plugins.traffic_inbound.as_ref().filter(|p| p.enabled) {
        let counter = InboundCounter::new();
        counter
            .init(plugin_cfg.config.as_ref())
            .context("failed to initialize traffic_inbound plugin")?;
        manager.register_inbound_plugin(counter.clone());
        manager.register_traffic_plugin(counter);
        info!("traffic inbound plugin enabled");
    }

    if let Some(plugin_cfg) = cfg.plugins.traffic_outbound.as_ref().filter(|p| p.enabled) {
        let counter = OutboundCounter::new();
        counter
            .init(plugin_cfg.config.as_ref())
            .context("failed to initialize traffic_outbound plugin")?;
        manager.register_outbound_plugin(counter.clone());
        manager.register_traffic_plugin(counter);
        info!("traffic outbound plugin enabled");
    }

    Ok(manager)
}

/// SIGINT / SIGTERM を待つ
pub(crate) async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
