//! SOCKS5 (RFC 1928) ハンドシェイク
//!
//! サポート範囲は CONNECT コマンドと no-auth (0x00) のみ。
//! ATYP は IPv4 (0x01) / ドメイン名 (0x03) / IPv6 (0x04) に対応します。
//!
//! サーバー側（インバウンド）とクライアント側（上流 SOCKS5 アウトバウンド）
//! 両方のハンドシェイクを提供します。固定長フィールドの読み取りはすべて
//! `read_exact`（要求バイト数まで読み切る）で行います。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS プロトコルバージョン
pub const SOCKS_VERSION: u8 = 0x05;

/// 認証方式: no-auth
const METHOD_NO_AUTH: u8 = 0x00;

/// 認証方式: 受け入れ可能な方式なし
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// コマンド: CONNECT
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 エラー
#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("Unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("No authentication methods offered")]
    NoMethods,

    #[error("Authentication required (not supported)")]
    AuthRequired,

    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Invalid domain length: {0}")]
    InvalidDomainLength(u8),

    #[error("Invalid target address: {0}")]
    InvalidAddress(String),

    #[error("Connect failed: reply code {0:#04x}")]
    ConnectFailed(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// リプライコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// アドレスタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Socks5Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(Socks5Error::UnsupportedAddressType(value)),
        }
    }
}

/// リプライを構築する
///
/// BND.ADDR / BND.PORT はゼロ埋め（IPv4 0.0.0.0:0）で返します。
pub fn build_reply(reply: Reply) -> [u8; 10] {
    [
        SOCKS_VERSION,
        reply as u8,
        0x00, // RSV
        AddressType::Ipv4 as u8,
        0, 0, 0, 0, // BND.ADDR
        0, 0, // BND.PORT
    ]
}

/// サーバー側ハンドシェイクを実行し、ターゲットアドレスを返す
///
/// greeting とリクエストを処理し、成功リプライ送信まで行います。
/// プロトコル違反の場合は（可能なら）エラーリプライを書いてから
/// エラーを返します。呼び出し側は接続を閉じるだけでよい。
pub async fn handshake<S>(stream: &mut S) -> Result<String, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Step 1: greeting [VER, NMETHODS, METHODS...]
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(Socks5Error::NoMethods);
    }

    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(Socks5Error::AuthRequired);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Step 2: リクエスト [VER, CMD, RSV, ATYP]
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;

    if request[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(request[0]));
    }

    if request[1] != CMD_CONNECT {
        stream.write_all(&build_reply(Reply::CommandNotSupported)).await?;
        return Err(Socks5Error::UnsupportedCommand(request[1]));
    }

    let target = match read_address(stream, request[3]).await {
        Ok(target) => target,
        Err(e) => {
            stream
                .write_all(&build_reply(Reply::AddressTypeNotSupported))
                .await?;
            return Err(e);
        }
    };

    // 成功リプライ（BND はゼロ埋め）
    stream.write_all(&build_reply(Reply::Succeeded)).await?;

    Ok(target)
}

/// ATYP に応じてアドレスとポートを読み取り、"host:port" 形式で返す
async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<String, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    match AddressType::try_from(atyp)? {
        AddressType::Ipv4 => {
            let mut buf = [0u8; 6]; // 4 bytes IP + 2 bytes port
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(format!("{}:{}", ip, port))
        }
        AddressType::Domain => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;
            if len == 0 {
                return Err(Socks5Error::InvalidDomainLength(0));
            }
            let mut buf = vec![0u8; len + 2]; // domain + port
            stream.read_exact(&mut buf).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            Ok(format!("{}:{}", domain, port))
        }
        AddressType::Ipv6 => {
            let mut buf = [0u8; 18]; // 16 bytes IP + 2 bytes port
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(format!("[{}]:{}", ip, port))
        }
    }
}

/// クライアント側ハンドシェイクを実行する（上流 SOCKS5 アウトバウンド用）
///
/// greeting とリクエストを送信し、成功リプライ（BND フィールド含む）を
/// 読み切った時点で、以降ストリームはターゲットとの生のバイト列になる。
pub async fn connect<S>(stream: &mut S, target: &str) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Step 1: greeting [VER, NMETHODS=1, METHOD=no-auth]
    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(response[0]));
    }
    if response[1] != METHOD_NO_AUTH {
        return Err(Socks5Error::AuthRequired);
    }

    // Step 2: CONNECT リクエスト
    let request = build_connect_request(target)?;
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(reply[0]));
    }
    if reply[1] != Reply::Succeeded as u8 {
        return Err(Socks5Error::ConnectFailed(reply[1]));
    }

    // ATYP に応じて残りの BND フィールドを読み切る
    let remaining = match AddressType::try_from(reply[3])? {
        AddressType::Ipv4 => 6,
        AddressType::Ipv6 => 18,
        AddressType::Domain => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            len_buf[0] as usize + 2
        }
    };
    let mut bnd = vec![0u8; remaining];
    stream.read_exact(&mut bnd).await?;

    Ok(())
}

/// "host:port" から CONNECT リクエストを構築する
fn build_connect_request(target: &str) -> Result<Vec<u8>, Socks5Error> {
    let (host, port) = split_host_port(target)?;
    let port_bytes = port.to_be_bytes();

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(AddressType::Ipv4 as u8);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(AddressType::Ipv6 as u8);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host_bytes = host.as_bytes();
            if host_bytes.is_empty() || host_bytes.len() > 255 {
                return Err(Socks5Error::InvalidAddress(target.to_string()));
            }
            request.push(AddressType::Domain as u8);
            request.push(host_bytes.len() as u8);
            request.extend_from_slice(host_bytes);
        }
    }

    request.extend_from_slice(&port_bytes);
    Ok(request)
}

/// "host:port" / "[ipv6]:port" を分解する
pub fn split_host_port(target: &str) -> Result<(String, u16), Socks5Error> {
    let invalid = || Socks5Error::InvalidAddress(target.to_string());

    if let Some(rest) = target.strip_prefix('[') {
        // IPv6: [addr]:port
        let (host, port_part) = rest.split_once(']').ok_or_else(invalid)?;
        let port_str = port_part.strip_prefix(':').ok_or_else(invalid)?;
        let port = port_str.parse::<u16>().map_err(|_| invalid())?;
        Ok((host.to_string(), port))
    } else {
        let (host, port_str) = target.rsplit_once(':').ok_or_else(invalid)?;
        let port = port_str.parse::<u16>().map_err(|_| invalid())?;
        Ok((host.to_string(), port))
    }
}
