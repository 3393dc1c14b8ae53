//! Script evaluator collaborator.
//!
//! The embedded engine is external to this crate; the runtime drives it
//! through [`Evaluator`] and hands it a [`CapabilityHost`] as the only
//! channel out of the sandbox. The engine is expected to meter its own
//! pure-compute work through the out-of-band [`CapabilityHost::charge`]
//! hook and to abort as soon as a host call reports gas exhaustion.

use thiserror::Error;

use crate::error::Result;
use crate::gas::CostClass;

/// Resource caps imposed on an evaluator at creation. Gas bounds
/// metered work; these bound what gas cannot see.
#[derive(Debug, Clone)]
pub struct EvaluatorLimits {
    /// Evaluator heap cap in bytes.
    pub max_memory_bytes: u64,
    /// Hard backstop against unmetered pure-compute loops.
    pub max_instructions: u64,
}

/// Evaluator-level failure. User-code exceptions are not represented
/// here: the invocation wrapper catches them and returns a JSON error
/// envelope as the script result.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A host call failed with gas exhaustion and the script was aborted.
    #[error("gas limit exceeded")]
    GasExceeded,

    /// Engine fault: out of memory, instruction backstop, broken script
    /// plumbing. The evaluator may be unusable afterwards.
    #[error("evaluator failure: {0}")]
    Engine(String),
}

impl From<crate::error::Error> for EvalError {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::GasExceeded { .. } => EvalError::GasExceeded,
            other => EvalError::Engine(other.to_string()),
        }
    }
}

/// One sandboxed evaluator instance.
impl std::fmt::Debug for dyn Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn Evaluator>")
    }
}

pub trait Evaluator: Send {
    /// Run `script` to completion and return the value of its final
    /// expression as a string. Every capability and metering call goes
    /// through `host`; a gas failure from the host must surface here as
    /// [`EvalError::GasExceeded`] without further host calls.
    fn eval(
        &mut self,
        script: &str,
        host: &mut dyn CapabilityHost,
    ) -> std::result::Result<String, EvalError>;

    /// Wipe every global binding while keeping the runtime alive, so a
    /// pooled evaluator carries no state between invocations.
    fn reset(&mut self) -> std::result::Result<(), EvalError>;
}

pub trait EvaluatorFactory: Send + Sync {
    fn create(&self, limits: &EvaluatorLimits) -> Result<Box<dyn Evaluator>>;
}

/// Host surface visible to sandboxed code. Everything charges gas before
/// doing work; storage is scoped to the invocation's namespace and
/// secrets to the invoking user.
pub trait CapabilityHost {
    /// Out-of-band metering hook for pure-compute operation classes.
    fn charge(&mut self, class: CostClass, size: u64) -> Result<()>;

    fn storage_get(&mut self, key: &str) -> Result<Option<String>>;
    fn storage_set(&mut self, key: &str, value: &str) -> Result<()>;
    fn storage_remove(&mut self, key: &str) -> Result<bool>;
    fn storage_clear(&mut self) -> Result<()>;

    fn secret_get(&mut self, name: &str) -> Result<Option<String>>;
    fn secret_set(&mut self, name: &str, value: &str) -> Result<()>;
    fn secret_remove(&mut self, name: &str) -> Result<bool>;

    fn random_bytes(&mut self, len: usize) -> Result<Vec<u8>>;
    fn hash(&mut self, data: &[u8]) -> Result<[u8; 32]>;
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn verify(&mut self, data: &[u8], signature: &[u8]) -> Result<bool>;
    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Best-effort log lines out of the enclave; never carries secret
    /// plaintext unless the caller passes it explicitly.
    fn log(&mut self, line: &str);
    fn log_error(&mut self, line: &str);

    fn attestation(&mut self) -> Result<Vec<u8>>;
    fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn timestamp_ms(&mut self) -> u64;
    fn epc_usage(&mut self) -> u64;
}
