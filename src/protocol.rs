//! プロトコル定義
//!
//! コントロールプレーン (WSS) の制御メッセージと、データプレーン (QUIC)
//! のストリームフレーミングを定義します。
//!
//! # WSS フレーミング
//!
//! 各メッセージは 1 つの WebSocket バイナリフレームとして送信されます:
//!
//! ```text
//! [length: u32 BE][payload]
//! payload = [type: u8][body]
//! ```
//!
//! メッセージ種別は payload 先頭の type バイトで明示的に判別します
//! （フィールドの有無による推測は行いません）。
//!
//! # QUIC ストリームフレーミング
//!
//! 新しいストリームの先頭に改行終端のアドレス行を 1 行だけ書きます:
//!
//! - デバイス識別ストリーム: `device_id\n`
//! - フロー毎のストリーム: `target_address\n` の後は双方向の生バイト列

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// プロトコルエラー
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0:#04x}")]
    InvalidMessageType(u8),

    #[error("Invalid status: {0:#04x}")]
    InvalidStatus(u8),

    #[error("Invalid command kind: {0:#04x}")]
    InvalidCommandKind(u8),

    #[error("Buffer too short")]
    BufferTooShort,

    #[error("Message too large")]
    MessageTooLarge,

    #[error("Address too long (max {MAX_ADDRESS_LEN} bytes)")]
    AddressTooLong,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// メッセージ長プレフィックスのサイズ（u32 BE）
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// 最大ペイロードサイズ (64KB)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// target address / device_id 行の最大長
pub const MAX_ADDRESS_LEN: usize = 256;

/// 制御メッセージのタイプ
///
/// 番号体系:
/// - 0x0X: 登録
/// - 0x1X: 死活監視・負荷報告
/// - 0x2X: コマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // 登録メッセージ (0x0X)
    RegisterRequest = 0x01,
    RegisterResponse = 0x02,
    // 死活監視・負荷報告メッセージ (0x1X)
    HeartbeatRequest = 0x11,
    HeartbeatResponse = 0x12,
    LoadReport = 0x13,
    // コマンドメッセージ (0x2X)
    Command = 0x21,
    CommandResponse = 0x22,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::RegisterRequest),
            0x02 => Ok(MessageType::RegisterResponse),
            0x11 => Ok(MessageType::HeartbeatRequest),
            0x12 => Ok(MessageType::HeartbeatResponse),
            0x13 => Ok(MessageType::LoadReport),
            0x21 => Ok(MessageType::Command),
            0x22 => Ok(MessageType::CommandResponse),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// レスポンスのステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 0x00,
    Error = 0x01,
}

impl TryFrom<u8> for ResponseStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(ResponseStatus::Ok),
            0x01 => Ok(ResponseStatus::Error),
            _ => Err(ProtocolError::InvalidStatus(value)),
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "ok"),
            ResponseStatus::Error => write!(f, "error"),
        }
    }
}

/// POP → デバイスのコマンド種別
///
/// 現行プロトコルでは新しい QUIC ストリームを開いて `target\n` を書く
/// こと自体が open-tcp コマンドに相当し、明示的な Command レコードは
/// 互換性のために予約されています。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    OpenTcp { target: String },
    OpenUdp { target: String },
    Close,
}

impl CommandKind {
    const KIND_OPEN_TCP: u8 = 0x01;
    const KIND_OPEN_UDP: u8 = 0x02;
    const KIND_CLOSE: u8 = 0x03;

    fn kind_byte(&self) -> u8 {
        match self {
            CommandKind::OpenTcp { .. } => Self::KIND_OPEN_TCP,
            CommandKind::OpenUdp { .. } => Self::KIND_OPEN_UDP,
            CommandKind::Close => Self::KIND_CLOSE,
        }
    }
}

/// 制御メッセージ
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// デバイス登録リクエスト (Device → POP)
    RegisterRequest {
        device_id: String,
        location: String,
        capacity: u32,
        tags: Vec<String>,
    },

    /// デバイス登録レスポンス (POP → Device)
    ///
    /// - quic_address: データプレーンの接続先 (`<observed IP>:<QUIC port>`)
    RegisterResponse {
        status: ResponseStatus,
        device_id: String,
        quic_address: String,
    },

    /// ハートビート (Device → POP)
    HeartbeatRequest { device_id: String, timestamp: i64 },

    /// ハートビートレスポンス (POP → Device)
    HeartbeatResponse { status: ResponseStatus },

    /// 負荷報告 (Device → POP、レスポンスなし)
    LoadReport {
        device_id: String,
        timestamp: i64,
        active_conns: u32,
        bytes_sent: u64,
        bytes_received: u64,
    },

    /// コマンド (POP → Device)
    Command { conn_id: String, command: CommandKind },

    /// コマンドレスポンス (Device → POP)
    CommandResponse {
        conn_id: String,
        success: bool,
        error: String,
    },
}

impl ControlMessage {
    /// メッセージをペイロード（type バイト + ボディ）にエンコード
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ControlMessage::RegisterRequest {
                device_id,
                location,
                capacity,
                tags,
            } => {
                buf.put_u8(MessageType::RegisterRequest as u8);
                put_string(&mut buf, device_id);
                put_string(&mut buf, location);
                buf.put_u32(*capacity);
                buf.put_u8(tags.len() as u8);
                for tag in tags {
                    put_string(&mut buf, tag);
                }
            }
            ControlMessage::RegisterResponse {
                status,
                device_id,
                quic_address,
            } => {
                buf.put_u8(MessageType::RegisterResponse as u8);
                buf.put_u8(*status as u8);
                put_string(&mut buf, device_id);
                put_string(&mut buf, quic_address);
            }
            ControlMessage::HeartbeatRequest {
                device_id,
                timestamp,
            } => {
                buf.put_u8(MessageType::HeartbeatRequest as u8);
                put_string(&mut buf, device_id);
                buf.put_i64(*timestamp);
            }
            ControlMessage::HeartbeatResponse { status } => {
                buf.put_u8(MessageType::HeartbeatResponse as u8);
                buf.put_u8(*status as u8);
            }
            ControlMessage::LoadReport {
                device_id,
                timestamp,
                active_conns,
                bytes_sent,
                bytes_received,
            } => {
                buf.put_u8(MessageType::LoadReport as u8);
                put_string(&mut buf, device_id);
                buf.put_i64(*timestamp);
                buf.put_u32(*active_conns);
                buf.put_u64(*bytes_sent);
                buf.put_u64(*bytes_received);
            }
            ControlMessage::Command { conn_id, command } => {
                buf.put_u8(MessageType::Command as u8);
                put_string(&mut buf, conn_id);
                buf.put_u8(command.kind_byte());
                match command {
                    CommandKind::OpenTcp { target } | CommandKind::OpenUdp { target } => {
                        put_string(&mut buf, target);
                    }
                    CommandKind::Close => {}
                }
            }
            ControlMessage::CommandResponse {
                conn_id,
                success,
                error,
            } => {
                buf.put_u8(MessageType::CommandResponse as u8);
                put_string(&mut buf, conn_id);
                buf.put_u8(u8::from(*success));
                put_string(&mut buf, error);
            }
        }

        buf.freeze()
    }

    /// ペイロードからメッセージをデコード
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::BufferTooShort);
        }

        let msg_type = MessageType::try_from(buf.get_u8())?;

        match msg_type {
            MessageType::RegisterRequest => {
                let device_id = get_string(&mut buf)?;
                let location = get_string(&mut buf)?;
                if buf.remaining() < 5 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let capacity = buf.get_u32();
                let tag_count = buf.get_u8() as usize;
                let mut tags = Vec::with_capacity(tag_count);
                for _ in 0..tag_count {
                    tags.push(get_string(&mut buf)?);
                }
                Ok(ControlMessage::RegisterRequest {
                    device_id,
                    location,
                    capacity,
                    tags,
                })
            }
            MessageType::RegisterResponse => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let status = ResponseStatus::try_from(buf.get_u8())?;
                let device_id = get_string(&mut buf)?;
                let quic_address = get_string(&mut buf)?;
                Ok(ControlMessage::RegisterResponse {
                    status,
                    device_id,
                    quic_address,
                })
            }
            MessageType::HeartbeatRequest => {
                let device_id = get_string(&mut buf)?;
                if buf.remaining() < 8 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let timestamp = buf.get_i64();
                Ok(ControlMessage::HeartbeatRequest {
                    device_id,
                    timestamp,
                })
            }
            MessageType::HeartbeatResponse => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let status = ResponseStatus::try_from(buf.get_u8())?;
                Ok(ControlMessage::HeartbeatResponse { status })
            }
            MessageType::LoadReport => {
                let device_id = get_string(&mut buf)?;
                if buf.remaining() < 28 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let timestamp = buf.get_i64();
                let active_conns = buf.get_u32();
                let bytes_sent = buf.get_u64();
                let bytes_received = buf.get_u64();
                Ok(ControlMessage::LoadReport {
                    device_id,
                    timestamp,
                    active_conns,
                    bytes_sent,
                    bytes_received,
                })
            }
            MessageType::Command => {
                let conn_id = get_string(&mut buf)?;
                if buf.remaining() < 1 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let kind = buf.get_u8();
                let command = match kind {
                    CommandKind::KIND_OPEN_TCP => CommandKind::OpenTcp {
                        target: get_string(&mut buf)?,
                    },
                    CommandKind::KIND_OPEN_UDP => CommandKind::OpenUdp {
                        target: get_string(&mut buf)?,
                    },
                    CommandKind::KIND_CLOSE => CommandKind::Close,
                    other => return Err(ProtocolError::InvalidCommandKind(other)),
                };
                Ok(ControlMessage::Command { conn_id, command })
            }
            MessageType::CommandResponse => {
                let conn_id = get_string(&mut buf)?;
                if buf.remaining() < 1 {
                    return Err(ProtocolError::BufferTooShort);
                }
                let success = buf.get_u8() != 0;
                let error = get_string(&mut buf)?;
                Ok(ControlMessage::CommandResponse {
                    conn_id,
                    success,
                    error,
                })
            }
        }
    }

    /// WebSocket バイナリフレームの中身（長さプレフィックス + ペイロード）に変換
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = self.encode();
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// WebSocket バイナリフレームの中身からメッセージを取り出す
    ///
    /// フレームは長さプレフィックスぶん読み取った後、残りを破棄します
    /// （フレーム全体は tungstenite が既に配送済みのため、ここでの破棄が
    /// 「フレームを完全にドレインしてから次を読む」不変条件に対応します）。
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::BufferTooShort);
        }
        let length =
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        if frame.len() < LENGTH_PREFIX_SIZE + length {
            return Err(ProtocolError::BufferTooShort);
        }
        Self::decode(&frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length])
    }
}

/// 文字列を [u16 len][bytes] でエンコード
fn put_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

/// [u16 len][bytes] 形式の文字列をデコード
fn get_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::BufferTooShort);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::BufferTooShort);
    }
    let s = String::from_utf8_lossy(&buf[..len]).to_string();
    buf.advance(len);
    Ok(s)
}

/// 改行終端のアドレス行を書き込む
///
/// デバイス識別ストリームの `device_id\n`、フロー毎ストリームの
/// `target_address\n` の両方で使用します。
pub async fn write_address_line<W>(writer: &mut W, address: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(address.len() + 1);
    line.extend_from_slice(address.as_bytes());
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

/// 改行終端のアドレス行を読み取る
///
/// 改行または EOF まで 1 バイトずつ読み、前後の空白を除いて返します。
/// [`MAX_ADDRESS_LEN`] を超えた場合はエラー。
pub async fn read_address_line<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            // EOF は行末とみなす
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_ADDRESS_LEN {
            return Err(ProtocolError::AddressTooLong);
        }
    }

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // MessageType / ResponseStatus テスト
    // ============================================================================

    #[test]
    fn test_message_type_try_from() {
        // 登録メッセージ (0x0X)
        assert_eq!(
            MessageType::try_from(0x01).unwrap(),
            MessageType::RegisterRequest
        );
        assert_eq!(
            MessageType::try_from(0x02).unwrap(),
            MessageType::RegisterResponse
        );
        // 死活監視メッセージ (0x1X)
        assert_eq!(
            MessageType::try_from(0x11).unwrap(),
            MessageType::HeartbeatRequest
        );
        assert_eq!(
            MessageType::try_from(0x12).unwrap(),
            MessageType::HeartbeatResponse
        );
        assert_eq!(MessageType::try_from(0x13).unwrap(), MessageType::LoadReport);
        // コマンドメッセージ (0x2X)
        assert_eq!(MessageType::try_from(0x21).unwrap(), MessageType::Command);
        assert_eq!(
            MessageType::try_from(0x22).unwrap(),
            MessageType::CommandResponse
        );
        // 無効な値
        assert!(MessageType::try_from(0x00).is_err());
        assert!(MessageType::try_from(0x30).is_err());
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_response_status_try_from() {
        assert_eq!(ResponseStatus::try_from(0x00).unwrap(), ResponseStatus::Ok);
        assert_eq!(
            ResponseStatus::try_from(0x01).unwrap(),
            ResponseStatus::Error
        );
        assert!(ResponseStatus::try_from(0x02).is_err());
    }

    #[test]
    fn test_response_status_display() {
        assert_eq!(format!("{}", ResponseStatus::Ok), "ok");
        assert_eq!(format!("{}", ResponseStatus::Error), "error");
    }

    // ============================================================================
    // ControlMessage エンコード/デコード テスト
    // ============================================================================

    #[test]
    fn test_register_request_encode_decode() {
        let msg = ControlMessage::RegisterRequest {
            device_id: "d1".to_string(),
            location: "us-east".to_string(),
            capacity: 100,
            tags: vec!["us".to_string(), "premium".to_string()],
        };
        let encoded = msg.encode();
        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_register_response_encode_decode() {
        let msg = ControlMessage::RegisterResponse {
            status: ResponseStatus::Ok,
            device_id: "d1".to_string(),
            quic_address: "203.0.113.7:443".to_string(),
        };
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_heartbeat_encode_decode() {
        let req = ControlMessage::HeartbeatRequest {
            device_id: "d1".to_string(),
            timestamp: 1_700_000_000,
        };
        assert_eq!(ControlMessage::decode(&req.encode()).unwrap(), req);

        let resp = ControlMessage::HeartbeatResponse {
            status: ResponseStatus::Ok,
        };
        assert_eq!(ControlMessage::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn test_load_report_encode_decode() {
        let msg = ControlMessage::LoadReport {
            device_id: "d1".to_string(),
            timestamp: 1_700_000_000,
            active_conns: 7,
            bytes_sent: 123_456,
            bytes_received: 654_321,
        };
        assert_eq!(ControlMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_command_encode_decode() {
        let open = ControlMessage::Command {
            conn_id: "42".to_string(),
            command: CommandKind::OpenTcp {
                target: "example.com:443".to_string(),
            },
        };
        assert_eq!(ControlMessage::decode(&open.encode()).unwrap(), open);

        let close = ControlMessage::Command {
            conn_id: "42".to_string(),
            command: CommandKind::Close,
        };
        assert_eq!(ControlMessage::decode(&close.encode()).unwrap(), close);
    }

    #[test]
    fn test_command_response_encode_decode() {
        let msg = ControlMessage::CommandResponse {
            conn_id: "42".to_string(),
            success: false,
            error: "connection refused".to_string(),
        };
        assert_eq!(ControlMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_empty_buffer() {
        assert!(matches!(
            ControlMessage::decode(&[]),
            Err(ProtocolError::BufferTooShort)
        ));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let msg = ControlMessage::RegisterRequest {
            device_id: "d1".to_string(),
            location: String::new(),
            capacity: 0,
            tags: vec![],
        };
        let encoded = msg.encode();
        // 途中で切り捨てたペイロードはエラーになる
        assert!(ControlMessage::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    // ============================================================================
    // フレーミング テスト
    // ============================================================================

    #[test]
    fn test_frame_roundtrip_is_bit_exact() {
        let msg = ControlMessage::RegisterRequest {
            device_id: "device-1".to_string(),
            location: "tokyo".to_string(),
            capacity: 10,
            tags: vec!["jp".to_string()],
        };
        let frame = msg.to_frame();
        let decoded = ControlMessage::from_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
        // 再エンコードでもビット単位で一致する
        assert_eq!(decoded.to_frame(), frame);
    }

    #[test]
    fn test_frame_length_prefix() {
        let msg = ControlMessage::HeartbeatResponse {
            status: ResponseStatus::Ok,
        };
        let frame = msg.to_frame();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_frame_rejects_oversized_length() {
        let mut frame = vec![0xFF, 0xFF, 0xFF, 0xFF];
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            ControlMessage::from_frame(&frame),
            Err(ProtocolError::MessageTooLarge)
        ));
    }

    #[test]
    fn test_frame_rejects_short_buffer() {
        assert!(matches!(
            ControlMessage::from_frame(&[0, 0]),
            Err(ProtocolError::BufferTooShort)
        ));
    }

    // ============================================================================
    // アドレス行 テスト
    // ============================================================================

    #[tokio::test]
    async fn test_address_line_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_address_line(&mut client, "example.com:443")
            .await
            .unwrap();
        let addr = read_address_line(&mut server).await.unwrap();
        assert_eq!(addr, "example.com:443");
    }

    #[tokio::test]
    async fn test_address_line_eof_terminates() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"10.0.0.1:80")
            .await
            .unwrap();
        drop(client); // 改行なしで EOF

        let addr = read_address_line(&mut server).await.unwrap();
        assert_eq!(addr, "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_address_line_too_long() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let long = "a".repeat(MAX_ADDRESS_LEN + 10);
        tokio::io::AsyncWriteExt::write_all(&mut client, long.as_bytes())
            .await
            .unwrap();

        let err = read_address_line(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::AddressTooLong));
    }

    #[tokio::test]
    async fn test_address_line_trims_whitespace() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"  host:22 \r\n")
            .await
            .unwrap();
        let addr = read_address_line(&mut server).await.unwrap();
        assert_eq!(addr, "host:22");
    }
}
