//! quicfleet CLI エントリーポイント

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use quicfleet::config::{Config, DeviceConfig};
use quicfleet::{device, server};

/// ログ出力形式
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// 人間が読みやすい形式
    #[default]
    Console,
    /// JSON 形式（構造化ログ）
    Json,
}

/// Reverse-tunnel SOCKS5 proxy fleet
#[derive(Parser, Debug)]
#[command(name = "quicfleet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, default_value = "console", env = "QUICFLEET_LOG_FORMAT")]
    log_format: LogFormat,

    /// Log output file (default: stdout)
    #[arg(long, env = "QUICFLEET_LOG_OUTPUT")]
    log_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as POP (SOCKS5 inbound + WSS/QUIC device fleet)
    ///
    /// Accepts SOCKS5 clients and egresses each flow either through the
    /// configured static outbound or through a registered device.
    Proxy {
        /// Path to configuration file
        #[arg(long, default_value = "config.json")]
        config: PathBuf,

        /// Port for SOCKS5 inbound (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Address for the HTTP API server (/healthcheck, /metrics)
        #[arg(long)]
        api_listen: Option<SocketAddr>,

        /// Enable debug logging
        #[arg(long, default_value = "false")]
        debug: bool,
    },

    /// Run as device client (dials in to a POP)
    ///
    /// Maintains a WSS control channel and a QUIC data channel to the POP
    /// and egresses flows to their targets from this machine.
    Device {
        /// Path to device configuration file
        #[arg(long, default_value = "device_config.json")]
        config: PathBuf,

        /// Proxy (POP) host
        #[arg(long)]
        proxy: Option<String>,

        /// WSS control plane port
        #[arg(long)]
        wss_port: Option<u16>,

        /// QUIC data plane port
        #[arg(long)]
        quic_port: Option<u16>,

        /// Device ID (required here or in the config file)
        #[arg(long)]
        device_id: Option<String>,

        /// Device location (e.g. "tokyo")
        #[arg(long)]
        location: Option<String>,

        /// Heartbeat interval in seconds
        #[arg(long)]
        heartbeat_interval: Option<u64>,

        /// Skip TLS certificate verification (insecure, for testing only)
        #[arg(long, default_value = "false")]
        tls_skip_verify: bool,

        /// Enable debug logging
        #[arg(long, default_value = "false")]
        debug: bool,
    },
}

/// ログ出力先の MakeWriter 実装
struct FileWriter(Arc<std::sync::Mutex<std::fs::File>>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl Clone for FileWriter {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileWriter {
    type Writer = FileWriter;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = match &cli.command {
        Commands::Proxy { debug, .. } => *debug,
        Commands::Device { debug, .. } => *debug,
    };

    // Initialize logging
    let env_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // ログ出力先を決定
    if let Some(ref log_path) = cli.log_output {
        // ファイルに出力（append モード）
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
        let writer = FileWriter(Arc::new(std::sync::Mutex::new(file)));

        match cli.log_format {
            LogFormat::Console => {
                tracing_subscriber::fmt()
                    .with_writer(writer)
                    .with_env_filter(env_filter)
                    .init();
            }
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .with_writer(writer)
                    .with_env_filter(env_filter)
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(true)
                    .init();
            }
        }
    } else {
        match cli.log_format {
            LogFormat::Console => {
                tracing_subscriber::fmt()
                    .with_writer(std::io::stdout)
                    .with_env_filter(env_filter)
                    .init();
            }
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .with_writer(std::io::stdout)
                    .with_env_filter(env_filter)
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(true)
                    .init();
            }
        }
    }

    // PID を含むルートスパンを作成（全ログに PID が含まれる）
    let pid = std::process::id();
    let _root_span = tracing::info_span!("quicfleet", pid).entered();

    match cli.command {
        Commands::Proxy {
            config,
            port,
            api_listen,
            debug: _,
        } => {
            let mut cfg = Config::load(&config)?;

            // CLI 引数による上書き
            if let Some(port) = port {
                cfg.inbound.port = port;
            }

            tracing::info!(
                "starting POP: inbound {} on port {}, outbound {}",
                cfg.inbound.kind,
                cfg.inbound.port,
                cfg.outbound.kind
            );
            server::run(cfg, api_listen).await?;
        }

        Commands::Device {
            config,
            proxy,
            wss_port,
            quic_port,
            device_id,
            location,
            heartbeat_interval,
            tls_skip_verify,
            debug: _,
        } => {
            let mut cfg = DeviceConfig::load(&config)?;

            // CLI 引数による上書き
            if let Some(proxy) = proxy {
                cfg.proxy_host = proxy;
            }
            if let Some(port) = wss_port {
                cfg.wss_port = port;
            }
            if let Some(port) = quic_port {
                cfg.quic_port = port;
            }
            if let Some(id) = device_id {
                cfg.device_id = id;
            }
            if let Some(location) = location {
                cfg.location = location;
            }
            if let Some(interval) = heartbeat_interval {
                cfg.heartbeat_interval = interval;
            }
            if tls_skip_verify {
                cfg.tls_skip_verify = true;
            }

            cfg.validate()?;

            tracing::info!(
                "starting device {}: POP {} (wss {}, quic {})",
                cfg.device_id,
                cfg.proxy_host,
                cfg.wss_port,
                cfg.quic_port
            );
            device::run(cfg).await?;
        }
    }

    Ok(())
}
