//! Attribute-based access control engine.
//!
//! Holds a compiled rule set and a map of per-connection states. Rules are
//! replaced atomically; every state with a registered reload signal is
//! notified so its connection can re-evaluate itself against the new rules.

mod event;
mod rule;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{ProxyError, Result};

pub use event::Event;
pub use rule::{
    Action, Condition, ConditionConfig, Interval, IpConfig, QueryConfig, RegexpsConfig, Rule,
    RuleConfig, TimeConfig,
};
pub use state::{ReloadSignal, State};

struct Inner {
    rules: Arc<HashMap<String, Rule>>,
    states: HashMap<Uuid, State>,
}

/// The ABAC engine. Cheap to share behind an `Arc`; all mutation is
/// serialized by one mutex, evaluation runs on snapshots outside it.
pub struct Abac {
    inner: Mutex<Inner>,
}

impl Abac {
    /// Compile `rules` and build an engine. The first compile error wins.
    pub fn new(rules: &HashMap<String, RuleConfig>) -> Result<Abac> {
        let compiled = compile_rules(rules)?;
        Ok(Abac {
            inner: Mutex::new(Inner {
                rules: Arc::new(compiled),
                states: HashMap::new(),
            }),
        })
    }

    /// Atomically recompile and replace the rule set, then fire every
    /// registered reload signal. A compile error leaves the old set intact.
    pub fn update(&self, rules: &HashMap<String, RuleConfig>) -> Result<()> {
        let compiled = compile_rules(rules)?;
        let signals: Vec<ReloadSignal> = {
            let mut inner = self.inner.lock();
            inner.rules = Arc::new(compiled);
            inner
                .states
                .values()
                .filter_map(|s| s.on_reload.clone())
                .collect()
        };
        for signal in signals {
            let _ = signal.send(());
        }
        Ok(())
    }

    /// Create a fresh empty state.
    pub fn new_state(&self, on_reload: Option<ReloadSignal>) -> Uuid {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .states
            .insert(id, State::with_reload(on_reload));
        id
    }

    /// Create a state cloned from `parent` (including accumulated query
    /// statements). A missing parent yields an empty state.
    pub fn new_state_from(&self, parent: &Uuid, on_reload: Option<ReloadSignal>) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();
        let state = match inner.states.get(parent) {
            Some(parent) => parent.copy_with_reload(on_reload),
            None => State::with_reload(on_reload),
        };
        inner.states.insert(id, state);
        id
    }

    pub fn delete_state(&self, id: &Uuid) {
        self.inner.lock().states.remove(id);
    }

    /// Apply `events` to the state, then evaluate every rule against a
    /// snapshot. Returns the OR of matched actions and the matched rule
    /// names. Fails with `UnknownState` when the state does not exist.
    pub fn observe(
        &self,
        id: &Uuid,
        events: impl IntoIterator<Item = Event>,
    ) -> Result<(Action, Vec<String>)> {
        let (snapshot, rules) = {
            let mut inner = self.inner.lock();
            let rules = Arc::clone(&inner.rules);
            let state = inner
                .states
                .get_mut(id)
                .ok_or(ProxyError::UnknownState)?;
            for event in events {
                event.apply(state);
            }
            (state.clone(), rules)
        };

        let mut actions = Action::empty();
        let mut matched = Vec::new();
        for (name, rule) in rules.iter() {
            let rule_actions = rule.matches(&snapshot);
            if !rule_actions.is_empty() {
                actions |= rule_actions;
                matched.push(name.clone());
            }
        }
        Ok((actions, matched))
    }
}

fn compile_rules(rules: &HashMap<String, RuleConfig>) -> Result<HashMap<String, Rule>> {
    rules
        .iter()
        .map(|(name, config)| {
            let rule = Rule::compile(config)
                .map_err(|e| ProxyError::Config(format!("rule {name}: {e}")))?;
            Ok((name.clone(), rule))
        })
        .collect()
}
