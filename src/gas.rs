//! Gas accounting.
//!
//! Two tracks: a per-invocation gauge with a hard ceiling, owned by the
//! capability bridge for the duration of one call, and a process-wide
//! ledger of per-user balances and per-function cumulative usage behind
//! a single mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

/// Atomic operation classes with their canonical costs. The figures are
/// part of the public contract and must not be re-tuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CostClass {
    FunctionCall,
    PropertyAccess,
    ArrayAccess,
    ObjectCreation,
    ArrayCreation,
    StringOp,
    MathOp,
    Comparison,
    LoopIteration,
    StorageRead,
    StorageWrite,
    CryptoOp,
    JsExecution,
    MemoryAlloc,
    NetworkOp,
    Attestation,
    Sealing,
    Unsealing,
    Unknown,
}

impl CostClass {
    /// Gas cost of one operation of this class over `size` bytes.
    pub fn cost(self, size: u64) -> u64 {
        match self {
            CostClass::FunctionCall => 100,
            CostClass::PropertyAccess => 10,
            CostClass::ArrayAccess => 20,
            CostClass::ObjectCreation => 50u64.saturating_add(size),
            CostClass::ArrayCreation => 30u64.saturating_add(size),
            CostClass::StringOp => 5 + size / 100,
            CostClass::MathOp => 5,
            CostClass::Comparison => 3,
            CostClass::LoopIteration => 10,
            CostClass::StorageRead => 100 + size / 1024,
            CostClass::StorageWrite => 200 + size / 512,
            CostClass::CryptoOp => 500 + size / 256,
            CostClass::JsExecution => 1000 + size / 100,
            CostClass::MemoryAlloc => 10 + size / 1024,
            CostClass::NetworkOp => 1000 + size / 512,
            CostClass::Attestation => 5000,
            CostClass::Sealing => 1000 + size / 256,
            CostClass::Unsealing => 500 + size / 256,
            CostClass::Unknown => 1,
        }
    }
}

/// Per-invocation gas gauge. `used` is monotonically non-decreasing and
/// never exceeds `limit`: a charge that would overflow or overrun leaves
/// the gauge saturated at the limit so every later charge also fails.
#[derive(Debug)]
pub struct GasGauge {
    used: u64,
    limit: u64,
}

impl GasGauge {
    pub fn new(limit: u64) -> Self {
        Self { used: 0, limit }
    }

    pub fn charge(&mut self, class: CostClass, size: u64) -> Result<()> {
        let amount = class.cost(size);
        match self.used.checked_add(amount) {
            Some(next) if next <= self.limit => {
                self.used = next;
                Ok(())
            }
            _ => {
                self.used = self.limit;
                Err(Error::GasExceeded { used: self.limit, limit: self.limit })
            }
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, u64>,
    cumulative: HashMap<String, u64>,
    /// Invocations currently being accounted, keyed by (function, user).
    active: HashMap<(String, String), u64>,
}

/// Process-wide gas ledger.
pub struct GasLedger {
    state: Mutex<LedgerState>,
}

impl GasLedger {
    pub fn new() -> Self {
        Self { state: Mutex::new(LedgerState::default()) }
    }

    /// Mark the start of an invocation.
    pub fn start_accounting(&self, function_id: &str, user_id: &str, timestamp_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .active
            .insert((function_id.to_string(), user_id.to_string()), timestamp_ms);
        debug!(function_id, user_id, "gas accounting started");
    }

    /// Settle an invocation: debit the user's balance by `used`
    /// (saturating at zero) and add to the function's cumulative usage.
    /// Returns the settled amount; an invocation that was never started
    /// settles as zero.
    pub fn stop_accounting(&self, function_id: &str, user_id: &str, used: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        if state
            .active
            .remove(&(function_id.to_string(), user_id.to_string()))
            .is_none()
        {
            debug!(function_id, user_id, "stop_accounting without start");
            return 0;
        }

        let balance = state.balances.entry(user_id.to_string()).or_insert(0);
        *balance = balance.saturating_sub(used);

        *state.cumulative.entry(function_id.to_string()).or_insert(0) += used;

        debug!(function_id, user_id, used, "gas accounting stopped");
        used
    }

    /// Remaining gas balance for a user; zero for unknown users.
    pub fn balance(&self, user_id: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.balances.get(user_id).copied().unwrap_or(0)
    }

    /// Credit gas to a user's balance, saturating on overflow.
    pub fn credit(&self, user_id: &str, amount: u64) {
        let mut state = self.state.lock().unwrap();
        let balance = state.balances.entry(user_id.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    /// Cumulative gas consumed by a function across invocations.
    pub fn usage(&self, function_id: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.cumulative.get(function_id).copied().unwrap_or(0)
    }
}

impl Default for GasLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_table_is_canonical() {
        assert_eq!(CostClass::FunctionCall.cost(0), 100);
        assert_eq!(CostClass::PropertyAccess.cost(0), 10);
        assert_eq!(CostClass::ArrayAccess.cost(0), 20);
        assert_eq!(CostClass::ObjectCreation.cost(8), 58);
        assert_eq!(CostClass::ArrayCreation.cost(4), 34);
        assert_eq!(CostClass::StringOp.cost(250), 7);
        assert_eq!(CostClass::MathOp.cost(0), 5);
        assert_eq!(CostClass::Comparison.cost(0), 3);
        assert_eq!(CostClass::LoopIteration.cost(0), 10);
        assert_eq!(CostClass::StorageRead.cost(2048), 102);
        assert_eq!(CostClass::StorageWrite.cost(1024), 202);
        assert_eq!(CostClass::CryptoOp.cost(512), 502);
        assert_eq!(CostClass::JsExecution.cost(500), 1005);
        assert_eq!(CostClass::MemoryAlloc.cost(4096), 14);
        assert_eq!(CostClass::NetworkOp.cost(1024), 1002);
        assert_eq!(CostClass::Attestation.cost(u64::MAX), 5000);
        assert_eq!(CostClass::Sealing.cost(256), 1001);
        assert_eq!(CostClass::Unsealing.cost(256), 501);
        assert_eq!(CostClass::Unknown.cost(u64::MAX), 1);
    }

    #[test]
    fn test_gauge_accumulates_monotonically() {
        let mut gauge = GasGauge::new(1000);
        gauge.charge(CostClass::FunctionCall, 0).unwrap();
        gauge.charge(CostClass::MathOp, 0).unwrap();
        assert_eq!(gauge.used(), 105);
        assert_eq!(gauge.remaining(), 895);
    }

    #[test]
    fn test_gauge_saturates_at_limit() {
        let mut gauge = GasGauge::new(150);
        gauge.charge(CostClass::FunctionCall, 0).unwrap();

        let err = gauge.charge(CostClass::FunctionCall, 0).unwrap_err();
        assert!(matches!(err, Error::GasExceeded { used: 150, limit: 150 }));
        assert_eq!(gauge.used(), gauge.limit());

        // Once exceeded, every later charge fails too.
        assert!(gauge.charge(CostClass::Comparison, 0).is_err());
        assert_eq!(gauge.used(), 150);
    }

    #[test]
    fn test_gauge_overflow_is_explicit_failure() {
        let mut gauge = GasGauge::new(u64::MAX);
        gauge.charge(CostClass::ObjectCreation, u64::MAX - 10).unwrap();
        assert!(gauge.charge(CostClass::Attestation, 0).is_err());
        assert_eq!(gauge.used(), gauge.limit());
    }

    #[test]
    fn test_ledger_debits_saturating() {
        let ledger = GasLedger::new();
        ledger.credit("alice", 1000);
        assert_eq!(ledger.balance("alice"), 1000);

        ledger.start_accounting("f1", "alice", 0);
        assert_eq!(ledger.stop_accounting("f1", "alice", 300), 300);
        assert_eq!(ledger.balance("alice"), 700);

        ledger.start_accounting("f1", "alice", 0);
        ledger.stop_accounting("f1", "alice", 5000);
        assert_eq!(ledger.balance("alice"), 0);

        assert_eq!(ledger.usage("f1"), 5300);
        assert_eq!(ledger.usage("unknown"), 0);
    }

    #[test]
    fn test_ledger_ignores_unmatched_stop() {
        let ledger = GasLedger::new();
        ledger.credit("alice", 100);
        assert_eq!(ledger.stop_accounting("f1", "alice", 50), 0);
        assert_eq!(ledger.balance("alice"), 100);
        assert_eq!(ledger.usage("f1"), 0);
    }
}
