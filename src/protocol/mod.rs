//! PostgreSQL frontend/backend protocol version 3.
//!
//! The MITM plays both roles: it reads frontend messages from the tunneled
//! client and speaks as a frontend to the upstream database. Only the
//! client->server direction is parsed message-by-message; the reply path is
//! spliced as raw bytes.

pub mod codec;
pub mod constants;
pub mod messages;

pub use codec::{
    build_auth_ok, build_backend_key_data, build_error_response, build_parameter_status,
    build_ready_for_query, parse_backend_key_data, parse_error_notice, parse_parameter_status,
    read_message, read_startup_message, write_message, write_ssl_request, write_startup_message,
};
pub use messages::{
    parse_frontend_message, BackendKeyData, CancelRequest, ErrorNoticeResponse, FrontendMessage,
    ParameterStatus, StartupMessage, StartupMessageType,
};
