//! Script executor.
//!
//! Runs user code inside an isolated evaluator with a bounded capability
//! surface: per invocation it starts gas accounting, snapshots the
//! owner's secrets, composes the invocation wrapper, runs the evaluator
//! against a fresh [`CapabilityBridge`] and settles the ledger. No state
//! survives the evaluator between invocations, and an invocation that
//! runs out of gas destroys its evaluator instead of resetting it.

pub mod bridge;
pub mod evaluator;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::bridge::CapabilityBridge;
use crate::executor::evaluator::{EvalError, Evaluator, EvaluatorFactory, EvaluatorLimits};
use crate::gas::{CostClass, GasGauge, GasLedger};
use crate::primitives::Primitives;
use crate::secrets::SecretVault;
use crate::storage::KvStore;

/// One script invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub code: String,
    pub input_json: String,
    pub function_id: String,
    pub user_id: String,
    pub gas_limit: u64,
}

/// What the boundary reports back for an invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub gas_used: u64,
    pub execution_time_ms: u64,
}

/// What to do with the evaluator after an invocation. Only a clean exit
/// permits reuse; gas exhaustion may leave aborted cleanup behind, so
/// the evaluator must be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorDisposition {
    Retain,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationPhase {
    Starting,
    Running,
    FinishingOk,
    FinishingErr,
    FinishingGasExceeded,
}

/// Compose the script handed to the evaluator: user code followed by the
/// wrapper that feeds `main` and serializes its result. User-code
/// exceptions become a JSON error envelope, never an evaluator failure.
fn compose_wrapper(
    code: &str,
    input_json: &str,
    secrets_json: &str,
    function_id: &str,
    user_id: &str,
) -> String {
    let function_id = serde_json::Value::String(function_id.to_string()).to_string();
    let user_id = serde_json::Value::String(user_id.to_string()).to_string();
    format!(
        "// User code\n\
         {code}\n\n\
         // Invocation wrapper\n\
         try {{\n\
         \x20   const input = {input_json};\n\
         \x20   const secrets = {secrets_json};\n\
         \x20   const functionId = {function_id};\n\
         \x20   const userId = {user_id};\n\
         \x20   const result = main(input, secrets, functionId, userId);\n\
         \x20   JSON.stringify(result);\n\
         }} catch (error) {{\n\
         \x20   JSON.stringify({{ error: error.message }});\n\
         }}\n"
    )
}

pub struct ScriptExecutor {
    kv: Arc<KvStore>,
    vault: Arc<SecretVault>,
    ledger: Arc<GasLedger>,
    primitives: Arc<Primitives>,
    factory: Arc<dyn EvaluatorFactory>,
    limits: EvaluatorLimits,
}

impl ScriptExecutor {
    pub fn new(
        kv: Arc<KvStore>,
        vault: Arc<SecretVault>,
        ledger: Arc<GasLedger>,
        primitives: Arc<Primitives>,
        factory: Arc<dyn EvaluatorFactory>,
        limits: EvaluatorLimits,
    ) -> Self {
        Self { kv, vault, ledger, primitives, factory, limits }
    }

    pub fn limits(&self) -> &EvaluatorLimits {
        &self.limits
    }

    /// Run one invocation in a fresh evaluator, destroyed at return.
    pub fn execute(&self, request: &InvocationRequest) -> ExecutionOutcome {
        let mut evaluator = match self.factory.create(&self.limits) {
            Ok(evaluator) => evaluator,
            Err(e) => {
                return ExecutionOutcome {
                    success: false,
                    result: None,
                    error: Some(e.envelope()),
                    gas_used: 0,
                    execution_time_ms: 0,
                }
            }
        };
        let (outcome, _) = self.execute_with(evaluator.as_mut(), request);
        outcome
    }

    /// Run one invocation in the caller's evaluator and report whether
    /// that evaluator may be reused.
    pub fn execute_with(
        &self,
        evaluator: &mut dyn Evaluator,
        request: &InvocationRequest,
    ) -> (ExecutionOutcome, EvaluatorDisposition) {
        let started = Instant::now();
        let mut phase = InvocationPhase::Starting;
        debug!(
            function_id = %request.function_id,
            user_id = %request.user_id,
            gas_limit = request.gas_limit,
            ?phase,
            "invocation starting"
        );

        self.ledger.start_accounting(
            &request.function_id,
            &request.user_id,
            self.primitives.timestamp_ms(),
        );

        let mut gauge = GasGauge::new(request.gas_limit);
        if let Err(e) = gauge.charge(CostClass::JsExecution, request.code.len() as u64) {
            let gas_used = gauge.used();
            self.ledger.stop_accounting(&request.function_id, &request.user_id, gas_used);
            return (
                self.finish(request, started, false, None, Some(e.envelope()), gas_used, InvocationPhase::FinishingGasExceeded),
                EvaluatorDisposition::Destroy,
            );
        }

        let secrets_json = match self.vault.snapshot_for_user(&request.user_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let gas_used = gauge.used();
                self.ledger.stop_accounting(&request.function_id, &request.user_id, gas_used);
                return (
                    self.finish(request, started, false, None, Some(e.envelope()), gas_used, InvocationPhase::FinishingErr),
                    EvaluatorDisposition::Retain,
                );
            }
        };

        let input_json = if request.input_json.trim().is_empty() {
            "{}".to_string()
        } else {
            match serde_json::from_str::<serde_json::Value>(&request.input_json) {
                Ok(_) => request.input_json.clone(),
                Err(e) => {
                    let gas_used = gauge.used();
                    self.ledger.stop_accounting(&request.function_id, &request.user_id, gas_used);
                    let err = Error::InvalidArgument(format!("input is not valid JSON: {}", e));
                    return (
                        self.finish(request, started, false, None, Some(err.envelope()), gas_used, InvocationPhase::FinishingErr),
                        EvaluatorDisposition::Retain,
                    );
                }
            }
        };

        let script = compose_wrapper(
            &request.code,
            &input_json,
            &secrets_json,
            &request.function_id,
            &request.user_id,
        );

        let mut bridge = match CapabilityBridge::new(
            gauge,
            &self.kv,
            &self.vault,
            &self.primitives,
            &request.user_id,
            &request.function_id,
        ) {
            Ok(bridge) => bridge,
            Err(e) => {
                self.ledger.stop_accounting(&request.function_id, &request.user_id, 0);
                return (
                    self.finish(request, started, false, None, Some(e.envelope()), 0, InvocationPhase::FinishingErr),
                    EvaluatorDisposition::Retain,
                );
            }
        };

        phase = InvocationPhase::Running;
        debug!(function_id = %request.function_id, ?phase, "invocation running");
        let eval_result = evaluator.eval(&script, &mut bridge);

        let gas_used = bridge.gas_used();
        drop(bridge);
        self.ledger.stop_accounting(&request.function_id, &request.user_id, gas_used);

        match eval_result {
            Ok(result) => (
                self.finish(request, started, true, Some(result), None, gas_used, InvocationPhase::FinishingOk),
                EvaluatorDisposition::Retain,
            ),
            Err(EvalError::GasExceeded) => {
                let err = Error::GasExceeded { used: gas_used, limit: request.gas_limit };
                (
                    self.finish(request, started, false, None, Some(err.envelope()), gas_used, InvocationPhase::FinishingGasExceeded),
                    EvaluatorDisposition::Destroy,
                )
            }
            Err(EvalError::Engine(message)) => {
                let err = Error::Unknown(message);
                (
                    self.finish(request, started, false, None, Some(err.envelope()), gas_used, InvocationPhase::FinishingErr),
                    EvaluatorDisposition::Retain,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request: &InvocationRequest,
        started: Instant,
        success: bool,
        result: Option<String>,
        error: Option<String>,
        gas_used: u64,
        phase: InvocationPhase,
    ) -> ExecutionOutcome {
        let execution_time_ms = started.elapsed().as_millis() as u64;
        if success {
            info!(
                function_id = %request.function_id,
                user_id = %request.user_id,
                gas_used,
                execution_time_ms,
                ?phase,
                "invocation finished"
            );
        } else {
            info!(
                function_id = %request.function_id,
                user_id = %request.user_id,
                gas_used,
                execution_time_ms,
                ?phase,
                error = error.as_deref().unwrap_or("unknown"),
                "invocation failed"
            );
        }
        ExecutionOutcome { success, result, error, gas_used, execution_time_ms }
    }
}

#[derive(Default)]
struct PoolState {
    contexts: HashMap<u64, Box<dyn Evaluator>>,
    taken: HashSet<u64>,
    lru: VecDeque<u64>,
    next_id: u64,
}

/// Bounded LRU pool of long-lived evaluator contexts, keyed by the ids
/// handed across the boundary. Contexts destroyed after gas exhaustion
/// never return to the pool.
pub struct ContextPool {
    factory: Arc<dyn EvaluatorFactory>,
    limits: EvaluatorLimits,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ContextPool {
    pub fn new(factory: Arc<dyn EvaluatorFactory>, limits: EvaluatorLimits, capacity: usize) -> Self {
        Self {
            factory,
            limits,
            capacity,
            state: Mutex::new(PoolState { next_id: 1, ..PoolState::default() }),
        }
    }

    /// Reserve a context; evicts the least-recently-used one when full.
    pub fn create(&self) -> Result<u64> {
        let evaluator = self.factory.create(&self.limits)?;
        let mut state = self.state.lock().unwrap();

        while state.contexts.len() + state.taken.len() >= self.capacity {
            let Some(oldest) = state.lru.pop_front() else { break };
            if state.contexts.remove(&oldest).is_some() {
                warn!(context_id = oldest, "evicted least-recently-used context");
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.contexts.insert(id, evaluator);
        state.lru.push_back(id);
        debug!(context_id = id, "context created");
        Ok(id)
    }

    /// Borrow a context's evaluator for one invocation. The context is
    /// unavailable until [`restore`](Self::restore) or
    /// [`discard`](Self::discard).
    pub fn take(&self, id: u64) -> Result<Box<dyn Evaluator>> {
        let mut state = self.state.lock().unwrap();
        let evaluator = state
            .contexts
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("context {}", id)))?;
        state.taken.insert(id);
        Ok(evaluator)
    }

    /// Return a borrowed evaluator after a clean invocation.
    pub fn restore(&self, id: u64, evaluator: Box<dyn Evaluator>) {
        let mut state = self.state.lock().unwrap();
        // A context destroyed while borrowed stays destroyed.
        if !state.taken.remove(&id) {
            return;
        }
        state.contexts.insert(id, evaluator);
        state.lru.retain(|entry| *entry != id);
        state.lru.push_back(id);
    }

    /// Drop a borrowed evaluator without returning it.
    pub fn discard(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.taken.remove(&id);
        state.lru.retain(|entry| *entry != id);
        debug!(context_id = id, "context discarded");
    }

    /// Tear down a context. `Ok(false)` when the id is unknown.
    pub fn destroy(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let known = state.contexts.remove(&id).is_some() || state.taken.remove(&id);
        state.lru.retain(|entry| *entry != id);
        if known {
            debug!(context_id = id, "context destroyed");
        }
        Ok(known)
    }

    pub fn active(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.contexts.len() + state.taken.len()
    }
}
