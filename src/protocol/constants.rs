//! PostgreSQL wire protocol constants.
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

/// Protocol version 3.0 (196608)
pub const PROTOCOL_VERSION_3_0: u32 = 0x0003_0000;

/// Magic code in an SSLRequest startup packet
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Magic code in a GSSENCRequest startup packet
pub const GSS_ENC_REQUEST_CODE: u32 = 80877104;

/// Magic code in a CancelRequest startup packet
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Single-byte reply refusing SSL or GSS encryption
pub const NOT_SUPPORTED_BYTE: u8 = b'N';

// Frontend (client -> server) message type bytes

pub const MSG_QUERY: u8 = b'Q';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_BIND: u8 = b'B';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_DESCRIBE: u8 = b'D';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_CLOSE: u8 = b'C';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_PASSWORD: u8 = b'p';

// Backend (server -> client) message type bytes

pub const MSG_AUTH_REQUEST: u8 = b'R';
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';
pub const MSG_PARAMETER_STATUS: u8 = b'S';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_NOTICE_RESPONSE: u8 = b'N';

// Authentication request sub-codes

pub const AUTH_OK: u32 = 0;

// ErrorResponse / NoticeResponse field type bytes

pub const ERROR_FIELD_SEVERITY: u8 = b'S';
pub const ERROR_FIELD_CODE: u8 = b'C';
pub const ERROR_FIELD_MESSAGE: u8 = b'M';

/// ReadyForQuery transaction status: idle
pub const TX_STATUS_IDLE: u8 = b'I';
