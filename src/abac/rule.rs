//! Rule and condition types: serde configuration forms plus the compiled
//! matchers evaluated against a state snapshot.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bitflags::bitflags;
use chrono::{Datelike, Timelike, Weekday};
use chrono_tz::Tz;
use ipnet::IpNet;
use regex::Regex;
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::{ProxyError, Result};
use crate::sql::StatementKind;

use super::state::State;

bitflags! {
    /// Actions a matched rule requests, accumulated by bitwise OR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Action: u8 {
        const NOT_PERMIT = 1 << 0;
        const DISCONNECT = 1 << 1;
        const NOTIFY = 1 << 2;
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ActionVisitor;

        impl<'de> Visitor<'de> for ActionVisitor {
            type Value = Action;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of actions (notify, not_permit, disconnect)")
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Action, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut actions = Action::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    actions |= match name.as_str() {
                        "notify" => Action::NOTIFY,
                        "not_permit" => Action::NOT_PERMIT,
                        "disconnect" => Action::DISCONNECT,
                        other => {
                            return Err(serde::de::Error::custom(format!(
                                "unknown action: {other}"
                            )))
                        }
                    };
                }
                Ok(actions)
            }
        }

        deserializer.deserialize_seq(ActionVisitor)
    }
}

/// One rule as it appears in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub actions: Action,
}

/// Condition variants as written in YAML; compiled by [`Condition::compile`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionConfig {
    DatabaseName(RegexpsConfig),
    DatabaseUsername(RegexpsConfig),
    Ip(IpConfig),
    Time(TimeConfig),
    Query(QueryConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegexpsConfig {
    #[serde(default)]
    pub regexps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpConfig {
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeConfig {
    #[serde(default)]
    pub year: Vec<Interval>,
    #[serde(default)]
    pub month: Vec<String>,
    #[serde(default)]
    pub day: Vec<Interval>,
    #[serde(default)]
    pub hour: Vec<Interval>,
    #[serde(default)]
    pub minute: Vec<Interval>,
    #[serde(default)]
    pub second: Vec<Interval>,
    #[serde(default)]
    pub weekday: Vec<String>,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub statement_type: Option<StatementKind>,
    #[serde(default)]
    pub table_regexps: Vec<String>,
    #[serde(default)]
    pub column_regexps: Vec<String>,
    #[serde(default)]
    pub strict: bool,
}

/// Closed interval, inclusive on both ends.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Interval {
    pub from: i64,
    pub to: i64,
}

impl Interval {
    fn validate(&self, min: i64, max: i64) -> Result<()> {
        if self.from > self.to {
            return Err(ProxyError::Config("from must not be greater than to".into()));
        }
        if self.from < min {
            return Err(ProxyError::Config(format!(
                "from must be at least {min}, got {}",
                self.from
            )));
        }
        if self.to > max {
            return Err(ProxyError::Config(format!(
                "to must be at most {max}, got {}",
                self.to
            )));
        }
        Ok(())
    }

    fn matches(&self, value: i64) -> bool {
        self.from <= value && value <= self.to
    }
}

/// Compiled rule: conditions AND-ed together, with the actions to apply.
#[derive(Debug, Clone)]
pub struct Rule {
    pub conditions: Vec<Condition>,
    pub actions: Action,
}

impl Rule {
    pub fn compile(config: &RuleConfig) -> Result<Rule> {
        let conditions = config
            .conditions
            .iter()
            .map(Condition::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Rule {
            conditions,
            actions: config.actions,
        })
    }

    /// Actions this rule requests against the given state, empty when any
    /// condition fails.
    pub fn matches(&self, state: &State) -> Action {
        if self.conditions.iter().all(|c| c.matches(state)) {
            self.actions
        } else {
            Action::empty()
        }
    }
}

/// Compiled condition with its match artifacts.
#[derive(Debug, Clone)]
pub enum Condition {
    DatabaseName { regexps: Vec<Regex> },
    DatabaseUsername { regexps: Vec<Regex> },
    Ip { subnets: Vec<IpNet> },
    Time(TimeCondition),
    Query(QueryCondition),
}

#[derive(Debug, Clone)]
pub struct TimeCondition {
    year: Vec<Interval>,
    month: Vec<u32>,
    day: Vec<Interval>,
    hour: Vec<Interval>,
    minute: Vec<Interval>,
    second: Vec<Interval>,
    weekday: Vec<Weekday>,
    location: Tz,
}

#[derive(Debug, Clone)]
pub struct QueryCondition {
    statement_kind: Option<StatementKind>,
    table_regexps: Vec<Regex>,
    column_regexps: Vec<Regex>,
    strict: bool,
}

impl Condition {
    pub fn compile(config: &ConditionConfig) -> Result<Condition> {
        match config {
            ConditionConfig::DatabaseName(c) => Ok(Condition::DatabaseName {
                regexps: compile_anchored(&c.regexps)?,
            }),
            ConditionConfig::DatabaseUsername(c) => Ok(Condition::DatabaseUsername {
                regexps: compile_anchored(&c.regexps)?,
            }),
            ConditionConfig::Ip(c) => {
                let subnets = c
                    .subnets
                    .iter()
                    .map(|s| {
                        IpNet::from_str(s)
                            .map_err(|e| ProxyError::Config(format!("subnet {s}: {e}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Condition::Ip { subnets })
            }
            ConditionConfig::Time(c) => Ok(Condition::Time(TimeCondition::compile(c)?)),
            ConditionConfig::Query(c) => Ok(Condition::Query(QueryCondition::compile(c)?)),
        }
    }

    pub fn matches(&self, state: &State) -> bool {
        match self {
            Condition::DatabaseName { regexps } => match &state.database_name {
                Some(name) => regexps.iter().any(|r| r.is_match(name)),
                None => false,
            },
            Condition::DatabaseUsername { regexps } => match &state.database_username {
                Some(name) => regexps.iter().any(|r| r.is_match(name)),
                None => false,
            },
            Condition::Ip { subnets } => match &state.remote_ip {
                Some(addr) => match parse_remote_ip(addr) {
                    Some(ip) => subnets.iter().any(|net| net.contains(&ip)),
                    None => false,
                },
                None => false,
            },
            Condition::Time(c) => match &state.time {
                Some(t) => c.matches(t),
                None => false,
            },
            Condition::Query(c) => c.matches(state),
        }
    }
}

impl TimeCondition {
    fn compile(config: &TimeConfig) -> Result<TimeCondition> {
        let location = if config.location.is_empty() {
            Tz::UTC
        } else {
            Tz::from_str(&config.location)
                .map_err(|_| ProxyError::Config(format!("unknown location: {}", config.location)))?
        };
        let month = config
            .month
            .iter()
            .map(|m| month_by_name(m))
            .collect::<Result<Vec<_>>>()?;
        let weekday = config
            .weekday
            .iter()
            .map(|w| weekday_by_name(w))
            .collect::<Result<Vec<_>>>()?;
        for interval in &config.year {
            interval.validate(0, i64::MAX)?;
        }
        for interval in &config.day {
            interval.validate(1, 31)?;
        }
        for interval in &config.hour {
            interval.validate(0, 23)?;
        }
        for interval in &config.minute {
            interval.validate(0, 59)?;
        }
        for interval in &config.second {
            interval.validate(0, 59)?;
        }
        Ok(TimeCondition {
            year: config.year.clone(),
            month,
            day: config.day.clone(),
            hour: config.hour.clone(),
            minute: config.minute.clone(),
            second: config.second.clone(),
            weekday,
            location,
        })
    }

    fn matches(&self, time: &chrono::DateTime<chrono::Utc>) -> bool {
        let t = time.with_timezone(&self.location);
        if !self.weekday.is_empty() && !self.weekday.contains(&t.weekday()) {
            return false;
        }
        if !self.month.is_empty() && !self.month.contains(&t.month()) {
            return false;
        }
        if !self.year.is_empty() && !self.year.iter().any(|i| i.matches(t.year() as i64)) {
            return false;
        }
        if !self.day.is_empty() && !self.day.iter().any(|i| i.matches(t.day() as i64)) {
            return false;
        }
        if !self.hour.is_empty() && !self.hour.iter().any(|i| i.matches(t.hour() as i64)) {
            return false;
        }
        if !self.minute.is_empty() && !self.minute.iter().any(|i| i.matches(t.minute() as i64)) {
            return false;
        }
        if !self.second.is_empty() && !self.second.iter().any(|i| i.matches(t.second() as i64)) {
            return false;
        }
        true
    }
}

impl QueryCondition {
    fn compile(config: &QueryConfig) -> Result<QueryCondition> {
        Ok(QueryCondition {
            statement_kind: config.statement_type,
            table_regexps: compile_raw(&config.table_regexps)?,
            column_regexps: compile_raw(&config.column_regexps)?,
            strict: config.strict,
        })
    }

    fn matches(&self, state: &State) -> bool {
        for statement in &state.query_statements {
            if let Some(kind) = self.statement_kind {
                if statement.kind != kind {
                    continue;
                }
            }
            let table_matches = self
                .table_regexps
                .iter()
                .any(|r| r.is_match(&statement.table));
            let column_matches = self
                .column_regexps
                .iter()
                .any(|r| r.is_match(&statement.column));
            if table_matches && column_matches {
                return true;
            }
            if self.strict && statement.column.is_empty() && !statement.table.is_empty() && table_matches
            {
                return true;
            }
        }
        false
    }
}

/// Name/username regexes match the whole value; add anchors when missing.
fn compile_anchored(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            let mut anchored = String::new();
            if !pattern.starts_with('^') {
                anchored.push('^');
            }
            anchored.push_str(pattern);
            if !pattern.ends_with('$') {
                anchored.push('$');
            }
            Regex::new(&anchored).map_err(|e| ProxyError::Config(format!("regexp {pattern}: {e}")))
        })
        .collect()
}

fn compile_raw(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| ProxyError::Config(format!("regexp {pattern}: {e}")))
        })
        .collect()
}

/// The state carries whatever the listener saw, usually `ip:port`.
fn parse_remote_ip(addr: &str) -> Option<IpAddr> {
    if let Ok(ip) = IpAddr::from_str(addr) {
        return Some(ip);
    }
    if let Ok(socket) = std::net::SocketAddr::from_str(addr) {
        return Some(socket.ip());
    }
    None
}

fn month_by_name(name: &str) -> Result<u32> {
    let month = match name {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        other => return Err(ProxyError::Config(format!("invalid month: {other}"))),
    };
    Ok(month)
}

fn weekday_by_name(name: &str) -> Result<Weekday> {
    let weekday = match name {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        "sunday" => Weekday::Sun,
        other => return Err(ProxyError::Config(format!("invalid weekday: {other}"))),
    };
    Ok(weekday)
}
