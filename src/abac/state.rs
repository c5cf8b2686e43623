//! Per-connection ABAC state.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::sql::QueryStatement;

/// Signal fired (never awaited) when the rule set is atomically replaced.
pub type ReloadSignal = mpsc::UnboundedSender<()>;

/// Attributes observed so far for one connection. Unset attributes never
/// satisfy a condition examining them.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub database_username: Option<String>,
    pub database_name: Option<String>,
    pub remote_ip: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub query_statements: Vec<QueryStatement>,
    pub(super) on_reload: Option<ReloadSignal>,
}

impl State {
    pub(super) fn with_reload(on_reload: Option<ReloadSignal>) -> State {
        State {
            on_reload,
            ..State::default()
        }
    }

    /// Deep copy used for per-query throwaway evaluation; the reload signal
    /// belongs to the source connection and is replaced, not shared.
    pub(super) fn copy_with_reload(&self, on_reload: Option<ReloadSignal>) -> State {
        State {
            database_username: self.database_username.clone(),
            database_name: self.database_name.clone(),
            remote_ip: self.remote_ip.clone(),
            time: self.time,
            query_statements: self.query_statements.clone(),
            on_reload,
        }
    }
}
