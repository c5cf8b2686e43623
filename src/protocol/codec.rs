//! PostgreSQL message codec (read/write).

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

use super::constants::*;
use super::messages::*;

/// Maximum message size (100MB; the protocol allows up to 1GB)
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Minimum message length (just the 4-byte length field)
pub const MIN_MESSAGE_LENGTH: u32 = 4;

async fn read_u32_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a startup-form message (no type byte: length + code + data).
///
/// SSLRequest, GSSENCRequest and CancelRequest arrive in the same framing
/// and are surfaced as their own variants.
pub async fn read_startup_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<StartupMessageType> {
    let length = read_u32_be(reader).await?;
    if length < 8 {
        return Err(ProxyError::Protocol(format!(
            "startup message too short: {length} bytes"
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(ProxyError::Protocol(format!(
            "startup message too large: {length} bytes"
        )));
    }

    let code = read_u32_be(reader).await?;

    if code == SSL_REQUEST_CODE {
        return Ok(StartupMessageType::SslRequest);
    }
    if code == GSS_ENC_REQUEST_CODE {
        return Ok(StartupMessageType::GssEncRequest);
    }
    if code == CANCEL_REQUEST_CODE {
        let process_id = read_u32_be(reader).await?;
        let secret_key = read_u32_be(reader).await?;
        return Ok(StartupMessageType::CancelRequest(CancelRequest {
            process_id,
            secret_key,
        }));
    }

    if code != PROTOCOL_VERSION_3_0 {
        return Err(ProxyError::Protocol(format!(
            "unsupported protocol version: {code} (expected {PROTOCOL_VERSION_3_0})"
        )));
    }

    let remaining = (length - 8) as usize;
    let mut buf = vec![0u8; remaining];
    reader.read_exact(&mut buf).await?;

    // Null-terminated key/value pairs, terminated by an empty key.
    let mut parameters = HashMap::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (key, key_end) = read_cstring(&buf, offset)?;
        offset = key_end;
        if key.is_empty() {
            break;
        }
        if offset >= buf.len() {
            return Err(ProxyError::Protocol("missing value for parameter".into()));
        }
        let (value, value_end) = read_cstring(&buf, offset)?;
        offset = value_end;
        parameters.insert(key, value);
    }

    Ok(StartupMessageType::Startup(StartupMessage {
        protocol_version: code,
        parameters,
    }))
}

/// Read a typed message: type byte + length + payload.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut type_buf = [0u8; 1];
    reader.read_exact(&mut type_buf).await?;
    let msg_type = type_buf[0];

    let length = read_u32_be(reader).await?;
    if length < MIN_MESSAGE_LENGTH {
        return Err(ProxyError::Protocol(format!(
            "invalid message length: {length}"
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(ProxyError::Protocol(format!(
            "message too large: {length} bytes (max: {MAX_MESSAGE_SIZE})"
        )));
    }

    let payload_len = (length - 4) as usize;
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok((msg_type, payload))
}

/// Write a typed message: type byte + length + payload, flushed.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> Result<()> {
    writer.write_all(&[msg_type]).await?;
    let length = (payload.len() + 4) as u32;
    writer.write_all(&length.to_be_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Write a startup message (no type byte).
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &StartupMessage,
) -> Result<()> {
    let mut content = Vec::new();
    content.extend_from_slice(&msg.protocol_version.to_be_bytes());
    for (key, value) in &msg.parameters {
        content.extend_from_slice(key.as_bytes());
        content.push(0);
        content.extend_from_slice(value.as_bytes());
        content.push(0);
    }
    content.push(0);

    let length = (content.len() + 4) as u32;
    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&content).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an SSLRequest packet.
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&8u32.to_be_bytes()).await?;
    writer.write_all(&SSL_REQUEST_CODE.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse an error/notice response payload.
pub fn parse_error_notice(payload: &[u8]) -> Result<ErrorNoticeResponse> {
    let mut response = ErrorNoticeResponse::new();
    let mut offset = 0;
    while offset < payload.len() {
        let field_type = payload[offset];
        offset += 1;
        if field_type == 0 {
            break;
        }
        let (value, end) = read_cstring(payload, offset)?;
        offset = end;
        response.set_field(field_type, &value);
    }
    Ok(response)
}

/// Parse a ParameterStatus payload.
pub fn parse_parameter_status(payload: &[u8]) -> Result<ParameterStatus> {
    let (name, offset) = read_cstring(payload, 0)?;
    let (value, _) = read_cstring(payload, offset)?;
    Ok(ParameterStatus { name, value })
}

/// Parse a BackendKeyData payload.
pub fn parse_backend_key_data(payload: &[u8]) -> Result<BackendKeyData> {
    if payload.len() < 8 {
        return Err(ProxyError::Protocol("BackendKeyData message too short".into()));
    }
    let process_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let secret_key = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Ok(BackendKeyData {
        process_id,
        secret_key,
    })
}

/// Build an AuthenticationOk payload.
pub fn build_auth_ok() -> Vec<u8> {
    AUTH_OK.to_be_bytes().to_vec()
}

/// Build a BackendKeyData payload.
pub fn build_backend_key_data(key_data: &BackendKeyData) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&key_data.process_id.to_be_bytes());
    payload.extend_from_slice(&key_data.secret_key.to_be_bytes());
    payload
}

/// Build a ParameterStatus payload.
pub fn build_parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + value.len() + 2);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    payload
}

/// Build a ReadyForQuery payload.
pub fn build_ready_for_query(tx_status: u8) -> Vec<u8> {
    vec![tx_status]
}

/// Build an ErrorResponse payload.
pub fn build_error_response(response: &ErrorNoticeResponse) -> Vec<u8> {
    let mut payload = Vec::new();
    for (&field_type, value) in &response.fields {
        payload.push(field_type);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    payload
}
