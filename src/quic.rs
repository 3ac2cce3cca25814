//! QUIC 設定モジュール
//!
//! POP・デバイス共通の QUIC エンドポイント構築を提供します。
//! TLS 証明書は設定済みの cert/key ファイルから読み込み、
//! 未指定の場合はテスト用に自己署名証明書を生成します。

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// ALPN プロトコル識別子
pub const ALPN_QUIC_PROXY: &[u8] = b"quic-proxy";

/// プロセス既定の暗号プロバイダーを確定させる
///
/// rustls 0.23 は複数のプロバイダー feature が有効な場合に
/// `builder()` が実行時パニックするため、先に ring を明示的に
/// インストールしておく。冪等。
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// PEM ファイルから証明書チェーンと秘密鍵を読み込む
pub fn load_cert_chain(
    cert_file: &Path,
    key_file: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_data = std::fs::read(cert_file)
        .with_context(|| format!("Failed to read certificate from {:?}", cert_file))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_data.as_slice())
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("Failed to parse certificate {:?}", cert_file))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", cert_file);
    }

    let key_data = std::fs::read(key_file)
        .with_context(|| format!("Failed to read private key from {:?}", key_file))?;
    let key = rustls_pemfile::private_key(&mut key_data.as_slice())
        .with_context(|| format!("Failed to parse private key {:?}", key_file))?
        .with_context(|| format!("No private key found in {:?}", key_file))?;

    Ok((certs, key))
}

/// テスト用の自己署名証明書を生成する
///
/// 証明書ファイルが設定されていない場合のフォールバック。本番環境では
/// 設定済みの証明書を使用すべきです。
pub fn generate_self_signed_cert(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "quicfleet".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(certified_key.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified_key.key_pair.serialize_der(),
    ));

    Ok((vec![cert_der], key_der))
}

/// 共通のトランスポート設定
///
/// Keep-alive: 5 秒ごとに ping を送信
/// Idle timeout: 30 秒間応答がなければ接続をクローズ
/// デバイストンネルは長寿命のため、keep-alive がフロー側のデッドライン
/// の代わりに死活を担保する。
fn transport_config() -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(5)));
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_secs(30)).unwrap(),
    ));
    transport
}

/// サーバー用の QUIC エンドポイントを作成する
///
/// `cert` が None の場合は自己署名証明書を生成します（テスト用）。
pub fn create_server_endpoint(
    bind_addr: SocketAddr,
    cert: Option<(&Path, &Path)>,
) -> Result<Endpoint> {
    ensure_crypto_provider();

    let (certs, key) = match cert {
        Some((cert_file, key_file)) => load_cert_chain(cert_file, key_file)?,
        None => generate_self_signed_cert()?,
    };

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to create server TLS config")?;

    server_crypto.alpn_protocols = vec![ALPN_QUIC_PROXY.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("Failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()));

    let endpoint = Endpoint::server(server_config, bind_addr)
        .context("Failed to create server endpoint")?;

    Ok(endpoint)
}

/// クライアント用の QUIC エンドポイントを作成する
///
/// server_addr の IP バージョンに応じて適切なバインドアドレスを選択:
/// - IPv4 サーバー: 0.0.0.0:0 にバインド
/// - IPv6 サーバー: [::]:0 にバインド
pub fn create_client_endpoint(
    server_addr: &SocketAddr,
    skip_verify: bool,
) -> Result<Endpoint> {
    ensure_crypto_provider();

    let bind_addr: SocketAddr = if server_addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };

    let mut endpoint = Endpoint::client(bind_addr).context("Failed to create client endpoint")?;

    let mut crypto = if skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
            // 読み込めないシステム証明書はスキップ
            let _ = roots.add(cert);
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    crypto.alpn_protocols = vec![ALPN_QUIC_PROXY.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .context("Failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()));

    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// 自己署名証明書を許可する証明書検証（--tls-skip-verify 用）
///
/// 注意: 本番環境では適切な証明書検証を使用すべきです。
#[derive(Debug)]
pub(crate) struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
