//! PostgreSQL message structures.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::error::{ProxyError, Result};

use super::constants::*;

/// Regular startup message with connection parameters.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub protocol_version: u32,
    pub parameters: HashMap<String, String>,
}

impl StartupMessage {
    pub fn new(parameters: HashMap<String, String>) -> Self {
        StartupMessage {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.parameters.get("user").map(String::as_str)
    }

    pub fn database(&self) -> Option<&str> {
        self.parameters.get("database").map(String::as_str)
    }
}

/// Query cancellation request (arrives instead of a startup message).
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub process_id: u32,
    pub secret_key: u32,
}

/// What arrived on a fresh connection.
#[derive(Debug)]
pub enum StartupMessageType {
    Startup(StartupMessage),
    SslRequest,
    GssEncRequest,
    CancelRequest(CancelRequest),
}

/// Server key data used by clients to issue CancelRequests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

/// One server_parameter reported during startup.
#[derive(Debug, Clone)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

/// Error or notice response as a map of field-type byte to value.
///
/// `BTreeMap` keeps field order stable for tests and logs.
#[derive(Debug, Clone, Default)]
pub struct ErrorNoticeResponse {
    pub fields: BTreeMap<u8, String>,
}

impl ErrorNoticeResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(severity: &str, code: &str, message: &str) -> Self {
        let mut response = Self::new();
        response.set_field(ERROR_FIELD_SEVERITY, severity);
        response.set_field(ERROR_FIELD_CODE, code);
        response.set_field(ERROR_FIELD_MESSAGE, message);
        response
    }

    pub fn set_field(&mut self, field_type: u8, value: &str) {
        self.fields.insert(field_type, value.to_string());
    }

    pub fn severity(&self) -> Option<&str> {
        self.fields.get(&ERROR_FIELD_SEVERITY).map(String::as_str)
    }

    pub fn code(&self) -> Option<&str> {
        self.fields.get(&ERROR_FIELD_CODE).map(String::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get(&ERROR_FIELD_MESSAGE).map(String::as_str)
    }
}

/// Frontend messages the MITM distinguishes on the client->server path.
///
/// Only `Query` and `Parse` carry SQL worth inspecting; the other known
/// types are tracked for events and forwarded untouched. Anything else is
/// `Other` and forwarded as-is.
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    Query { query: String },
    Parse { name: String, query: String },
    Bind,
    Execute,
    Describe,
    Sync,
    Close,
    Terminate,
    Other(u8),
}

/// Decode the payload of a typed frontend message. Unknown types never
/// fail: the splice forwards them blindly.
pub fn parse_frontend_message(msg_type: u8, payload: &[u8]) -> Result<FrontendMessage> {
    match msg_type {
        MSG_QUERY => {
            let (query, _) = read_cstring(payload, 0)?;
            Ok(FrontendMessage::Query { query })
        }
        MSG_PARSE => {
            let (name, offset) = read_cstring(payload, 0)?;
            let (query, _) = read_cstring(payload, offset)?;
            Ok(FrontendMessage::Parse { name, query })
        }
        MSG_BIND => Ok(FrontendMessage::Bind),
        MSG_EXECUTE => Ok(FrontendMessage::Execute),
        MSG_DESCRIBE => Ok(FrontendMessage::Describe),
        MSG_SYNC => Ok(FrontendMessage::Sync),
        MSG_CLOSE => Ok(FrontendMessage::Close),
        MSG_TERMINATE => Ok(FrontendMessage::Terminate),
        other => Ok(FrontendMessage::Other(other)),
    }
}

/// Read a null-terminated string from a buffer at the given offset.
/// Returns the string and the offset just past the null.
pub(super) fn read_cstring(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    if offset >= buf.len() {
        return Err(ProxyError::Protocol("string offset out of bounds".into()));
    }
    let end = buf[offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol("missing null terminator in string".into()))?;

    let s = std::str::from_utf8(&buf[offset..offset + end])
        .map_err(|_| ProxyError::Protocol("invalid UTF-8 in string".into()))?;

    Ok((s.to_string(), offset + end + 1))
}
