//! Events that mutate an ABAC state.

use chrono::{DateTime, Utc};

use crate::sql::QueryStatement;

use super::state::State;

/// A single observation applied to a state before rule evaluation.
///
/// All variants but `QueryStatements` overwrite the attribute;
/// `QueryStatements` appends.
#[derive(Debug, Clone)]
pub enum Event {
    DatabaseName(String),
    DatabaseUsername(String),
    Ip(String),
    Time(DateTime<Utc>),
    QueryStatements(Vec<QueryStatement>),
}

impl Event {
    pub(super) fn apply(self, state: &mut State) {
        match self {
            Event::DatabaseName(name) => state.database_name = Some(name),
            Event::DatabaseUsername(name) => state.database_username = Some(name),
            Event::Ip(addr) => state.remote_ip = Some(addr),
            Event::Time(time) => state.time = Some(time),
            Event::QueryStatements(mut statements) => {
                state.query_statements.append(&mut statements);
            }
        }
    }
}
