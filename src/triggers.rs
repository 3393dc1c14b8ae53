//! Event trigger engine.
//!
//! A durable registry of typed rules, each dispatching a script
//! invocation when its predicate matches. Triggers persist as versioned
//! records in the `triggers` namespace and are indexed by id and by type
//! at load; a record that fails to decode is logged and skipped rather
//! than failing the whole load, and one misbehaving trigger never stops
//! the others from being evaluated.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::{InvocationRequest, ScriptExecutor};
use crate::primitives::Primitives;
use crate::record;
use crate::storage::KvStore;

const NAMESPACE: &str = "triggers";

fn storage_key(trigger_id: &str) -> String {
    format!("trigger:{}", trigger_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TriggerKind {
    Schedule,
    ChainEvent,
    StorageEvent,
    External,
}

impl From<TriggerKind> for u8 {
    fn from(kind: TriggerKind) -> u8 {
        match kind {
            TriggerKind::Schedule => 0,
            TriggerKind::ChainEvent => 1,
            TriggerKind::StorageEvent => 2,
            TriggerKind::External => 3,
        }
    }
}

impl TryFrom<u8> for TriggerKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(TriggerKind::Schedule),
            1 => Ok(TriggerKind::ChainEvent),
            2 => Ok(TriggerKind::StorageEvent),
            3 => Ok(TriggerKind::External),
            other => Err(format!("unknown trigger type {}", other)),
        }
    }
}

/// One registered trigger, in its wire layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    /// Interpretation depends on `kind`: JSON field matchers for chain
    /// events, the expected event type for external events, unused for
    /// the rest.
    pub condition: String,
    pub function_id: String,
    pub user_id: String,
    pub code: String,
    pub input_json: String,
    pub gas_limit: u64,
    pub enabled: bool,
    /// Epoch seconds of the next due tick (schedule triggers only).
    pub next_execution_time: u64,
    /// Tick interval in seconds (schedule triggers only).
    pub interval_seconds: u64,
}

#[derive(Default)]
struct RegistryState {
    loaded: bool,
    by_id: BTreeMap<String, Trigger>,
    by_kind: HashMap<TriggerKind, Vec<String>>,
}

impl RegistryState {
    fn insert(&mut self, trigger: Trigger) {
        self.by_kind
            .entry(trigger.kind)
            .or_default()
            .push(trigger.id.clone());
        self.by_id.insert(trigger.id.clone(), trigger);
    }

    fn remove(&mut self, trigger_id: &str) -> Option<Trigger> {
        let trigger = self.by_id.remove(trigger_id)?;
        if let Some(ids) = self.by_kind.get_mut(&trigger.kind) {
            ids.retain(|id| id != trigger_id);
        }
        Some(trigger)
    }

    fn ids_of_kind(&self, kind: TriggerKind) -> Vec<String> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }
}

pub struct TriggerEngine {
    kv: Arc<KvStore>,
    executor: Arc<ScriptExecutor>,
    primitives: Arc<Primitives>,
    state: Mutex<RegistryState>,
}

impl TriggerEngine {
    pub fn new(kv: Arc<KvStore>, executor: Arc<ScriptExecutor>, primitives: Arc<Primitives>) -> Self {
        Self {
            kv,
            executor,
            primitives,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Load every `trigger:` record from storage. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        info!(triggers = state.by_id.len(), "trigger engine initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().loaded
    }

    fn ensure_loaded(&self, state: &mut RegistryState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }

        for key in self.kv.list(NAMESPACE)? {
            if !key.starts_with("trigger:") {
                continue;
            }
            let bytes = match self.kv.get(NAMESPACE, &key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable trigger record");
                    continue;
                }
            };
            match record::decode::<Trigger>(&bytes) {
                Ok(trigger) => state.insert(trigger),
                Err(e) => warn!(key, error = %e, "skipping undecodable trigger record"),
            }
        }

        state.loaded = true;
        Ok(())
    }

    fn persist(&self, trigger: &Trigger) -> Result<()> {
        self.kv
            .put(NAMESPACE, &storage_key(&trigger.id), &record::encode(trigger)?)
    }

    /// Register a trigger. Ids are unique; schedule triggers must carry a
    /// positive interval.
    pub fn register(&self, trigger: Trigger) -> Result<()> {
        if trigger.id.is_empty() || trigger.function_id.is_empty() || trigger.code.is_empty() {
            return Err(Error::InvalidArgument(
                "trigger id, function id and code must be non-empty".to_string(),
            ));
        }
        if trigger.kind == TriggerKind::Schedule && trigger.interval_seconds == 0 {
            return Err(Error::InvalidArgument(
                "schedule triggers need a positive interval".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        if state.by_id.contains_key(&trigger.id) {
            return Err(Error::AlreadyExists(format!("trigger {}", trigger.id)));
        }

        self.persist(&trigger)?;
        info!(trigger_id = %trigger.id, kind = ?trigger.kind, "trigger registered");
        state.insert(trigger);
        Ok(())
    }

    /// Remove a trigger; `Ok(false)` when the id is unknown.
    pub fn unregister(&self, trigger_id: &str) -> Result<bool> {
        if trigger_id.is_empty() {
            return Err(Error::InvalidArgument("empty trigger id".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        if !state.by_id.contains_key(trigger_id) {
            return Ok(false);
        }
        self.kv.del(NAMESPACE, &storage_key(trigger_id))?;
        state.remove(trigger_id);
        info!(trigger_id, "trigger unregistered");
        Ok(true)
    }

    pub fn get(&self, trigger_id: &str) -> Result<Option<Trigger>> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        Ok(state.by_id.get(trigger_id).cloned())
    }

    pub fn list(&self) -> Result<Vec<Trigger>> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        Ok(state.by_id.values().cloned().collect())
    }

    pub fn enable(&self, trigger_id: &str) -> Result<()> {
        self.set_enabled(trigger_id, true)
    }

    pub fn disable(&self, trigger_id: &str) -> Result<()> {
        self.set_enabled(trigger_id, false)
    }

    fn set_enabled(&self, trigger_id: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let trigger = state
            .by_id
            .get_mut(trigger_id)
            .ok_or_else(|| Error::NotFound(format!("trigger {}", trigger_id)))?;
        trigger.enabled = enabled;
        let snapshot = trigger.clone();
        self.persist(&snapshot)?;
        debug!(trigger_id, enabled, "trigger toggled");
        Ok(())
    }

    /// Fire every enabled schedule trigger whose tick is due at `now`
    /// (epoch seconds). Successful dispatch advances the trigger to
    /// `now + interval`; missed ticks are skipped, never caught up.
    pub fn process_scheduled(&self, now: u64) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let mut processed = 0usize;
        for id in state.ids_of_kind(TriggerKind::Schedule) {
            let Some(trigger) = state.by_id.get(&id) else { continue };
            if !trigger.enabled || now < trigger.next_execution_time {
                continue;
            }

            let fired = self.dispatch(trigger, serde_json::json!({}));
            if fired {
                processed += 1;
                if let Some(trigger) = state.by_id.get_mut(&id) {
                    trigger.next_execution_time = now + trigger.interval_seconds;
                    let snapshot = trigger.clone();
                    if let Err(e) = self.persist(&snapshot) {
                        warn!(trigger_id = %id, error = %e, "failed to persist schedule advance");
                    }
                }
            }
        }
        Ok(processed)
    }

    /// Dispatch enabled chain-event triggers whose condition matches the
    /// event. A condition field that is present must equal the
    /// corresponding event field; an empty condition matches everything.
    pub fn process_chain_event(&self, event_json: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let event: serde_json::Value = match serde_json::from_str(event_json) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unparseable chain event, nothing dispatched");
                return Ok(0);
            }
        };

        let mut processed = 0usize;
        for id in state.ids_of_kind(TriggerKind::ChainEvent) {
            let Some(trigger) = state.by_id.get(&id) else { continue };
            if !trigger.enabled {
                continue;
            }
            match chain_condition_matches(&trigger.condition, &event) {
                Ok(true) => {
                    if self.dispatch(trigger, event.clone()) {
                        processed += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(trigger_id = %id, error = %e, "unparseable trigger condition, skipped");
                }
            }
        }

        info!(processed, "chain event processed");
        Ok(processed)
    }

    /// Dispatch every enabled storage trigger for a storage mutation.
    /// Storage triggers fire unconditionally; their condition field is
    /// not consulted.
    pub fn process_storage_event(&self, key: &str, operation: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let event = serde_json::json!({ "key": key, "operation": operation });

        let mut processed = 0usize;
        for id in state.ids_of_kind(TriggerKind::StorageEvent) {
            let Some(trigger) = state.by_id.get(&id) else { continue };
            if !trigger.enabled {
                continue;
            }
            if self.dispatch(trigger, event.clone()) {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Dispatch enabled external triggers whose condition equals the
    /// event type.
    pub fn process_external_event(&self, event_type: &str, event_data: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let event: serde_json::Value = match serde_json::from_str(event_data) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unparseable external event, nothing dispatched");
                return Ok(0);
            }
        };

        let mut processed = 0usize;
        for id in state.ids_of_kind(TriggerKind::External) {
            let Some(trigger) = state.by_id.get(&id) else { continue };
            if !trigger.enabled || trigger.condition != event_type {
                continue;
            }
            if self.dispatch(trigger, event.clone()) {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Run one trigger's invocation with the event merged into its input.
    /// Returns true when the evaluator ran to completion (user-code
    /// errors included); evaluator-level failures are logged and counted
    /// as not fired.
    fn dispatch(&self, trigger: &Trigger, event: serde_json::Value) -> bool {
        let mut input: serde_json::Value = if trigger.input_json.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(&trigger.input_json) {
                Ok(input) => input,
                Err(e) => {
                    warn!(trigger_id = %trigger.id, error = %e, "unparseable trigger input");
                    return false;
                }
            }
        };

        let Some(fields) = input.as_object_mut() else {
            warn!(trigger_id = %trigger.id, "trigger input is not a JSON object");
            return false;
        };
        fields.insert("event".to_string(), event);
        fields.insert(
            "trigger".to_string(),
            serde_json::json!({
                "id": trigger.id,
                "type": u8::from(trigger.kind),
                "condition": trigger.condition,
            }),
        );
        fields.insert(
            "timestamp".to_string(),
            serde_json::Value::from(self.primitives.timestamp_ms()),
        );

        debug!(trigger_id = %trigger.id, function_id = %trigger.function_id, "executing trigger");
        let outcome = self.executor.execute(&InvocationRequest {
            code: trigger.code.clone(),
            input_json: input.to_string(),
            function_id: trigger.function_id.clone(),
            user_id: trigger.user_id.clone(),
            gas_limit: trigger.gas_limit,
        });

        if !outcome.success {
            info!(
                trigger_id = %trigger.id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "trigger execution failed"
            );
        }
        outcome.success
    }
}

/// Chain-event predicate: each recognized condition field, when present,
/// must equal the corresponding event field.
fn chain_condition_matches(condition: &str, event: &serde_json::Value) -> Result<bool> {
    if condition.trim().is_empty() {
        return Ok(true);
    }
    let condition: serde_json::Value = serde_json::from_str(condition)
        .map_err(|e| Error::Corruption(format!("condition parse: {}", e)))?;

    for (condition_field, event_field) in [
        ("event_type", "type"),
        ("contract_address", "contract"),
        ("event_name", "name"),
    ] {
        if let Some(expected) = condition.get(condition_field) {
            if event.get(event_field) != Some(expected) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
