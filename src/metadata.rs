//! Per-connection and per-request metadata carried by notifier events.

use serde::Serialize;

use crate::sql::QueryStatement;

/// Immutable-per-scope bag of connection attributes.
///
/// One instance is created per accepted TCP connection and cloned (with a
/// fresh `request_id`) for every forwarded channel. Events snapshot it so a
/// consumer can correlate everything that happened on one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metadata {
    pub connection_id: String,
    pub request_id: String,
    pub state_id: String,
    pub remote_addr: String,
    pub database_name: String,
    pub database_username: String,
    pub query: String,
    pub query_statements: Vec<QueryStatement>,
}

impl Metadata {
    /// Snapshot for an event, without the transient query fields.
    pub fn snapshot(&self) -> Metadata {
        Metadata {
            connection_id: self.connection_id.clone(),
            request_id: self.request_id.clone(),
            state_id: self.state_id.clone(),
            remote_addr: self.remote_addr.clone(),
            database_name: self.database_name.clone(),
            database_username: self.database_username.clone(),
            query: String::new(),
            query_statements: self.query_statements.clone(),
        }
    }
}
