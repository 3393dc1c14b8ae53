//! Boundary service.
//!
//! The single long-lived object a host talks to: it owns the platform
//! primitives, sealed storage, secret vault, key manager, gas ledger,
//! executor and trigger engine, and exposes the ECALL-shaped operations.
//! Subsystems hold no pointers to each other; all wiring lives here.
//! Every response either carries a success payload or a JSON
//! `{"error": "<kind>: <detail>"}` envelope; user-code failure never
//! takes the enclave down.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::EnclaveConfig;
use crate::error::{Error, Result};
use crate::executor::evaluator::{EvaluatorFactory, EvaluatorLimits};
use crate::executor::{ContextPool, EvaluatorDisposition, ExecutionOutcome, InvocationRequest, ScriptExecutor};
use crate::gas::GasLedger;
use crate::keys::{KeyManager, KeyMetadata, KeyType};
use crate::platform::{SoftwarePlatform, TeePlatform};
use crate::primitives::Primitives;
use crate::sealed::SealedBlobStore;
use crate::secrets::SecretVault;
use crate::storage::blob_io::{BlobIo, FsBlobIo};
use crate::storage::KvStore;
use crate::triggers::{Trigger, TriggerEngine};

/// Message tags of the boundary protocol. Numeric values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ExecuteJs = 1,
    StoreSecret = 2,
    GetSecret = 3,
    DeleteSecret = 4,
    ChainEvent = 5,
}

impl TryFrom<i32> for MessageKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::ExecuteJs),
            2 => Ok(MessageKind::StoreSecret),
            3 => Ok(MessageKind::GetSecret),
            4 => Ok(MessageKind::DeleteSecret),
            5 => Ok(MessageKind::ChainEvent),
            other => Err(Error::InvalidArgument(format!("unknown message type {}", other))),
        }
    }
}

/// `get_status` response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub initialized: bool,
    pub mrenclave: String,
    pub mrsigner: String,
    pub storage_initialized: bool,
    pub key_manager_initialized: bool,
    pub secret_manager_initialized: bool,
    pub gas_accounting_initialized: bool,
    pub js_engine_initialized: bool,
    pub event_trigger_initialized: bool,
    pub contexts_active: usize,
}

#[derive(Debug, Deserialize)]
struct ExecuteJsRequest {
    code: String,
    input: String,
    user_id: String,
    function_id: String,
    #[serde(default)]
    gas_limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StoreSecretRequest {
    user_id: String,
    secret_name: String,
    secret_value: String,
}

#[derive(Debug, Deserialize)]
struct SecretNameRequest {
    user_id: String,
    secret_name: String,
}

#[derive(Debug, Deserialize)]
struct ChainEventRequest {
    event_data: String,
}

pub struct EnclaveService {
    config: EnclaveConfig,
    primitives: Arc<Primitives>,
    kv: Arc<KvStore>,
    vault: Arc<SecretVault>,
    keys: Arc<KeyManager>,
    ledger: Arc<GasLedger>,
    executor: Arc<ScriptExecutor>,
    triggers: Arc<TriggerEngine>,
    pool: ContextPool,
    initialized: Mutex<bool>,
}

impl EnclaveService {
    /// Wire the subsystems over the given platform, blob I/O and
    /// evaluator factory.
    pub fn new(
        config: EnclaveConfig,
        platform: Arc<dyn TeePlatform>,
        io: Arc<dyn BlobIo>,
        factory: Arc<dyn EvaluatorFactory>,
    ) -> Result<Self> {
        let primitives = Arc::new(Primitives::new(platform)?);
        let sealed = Arc::new(SealedBlobStore::new(io, primitives.clone()));
        let kv = Arc::new(KvStore::new(sealed));
        let vault = Arc::new(SecretVault::new(kv.clone(), primitives.clone()));
        let keys = Arc::new(KeyManager::new(kv.clone(), primitives.clone()));
        let ledger = Arc::new(GasLedger::new());

        let limits = EvaluatorLimits {
            max_memory_bytes: config.evaluator_memory_mb as u64 * 1024 * 1024,
            max_instructions: config.evaluator_max_instructions,
        };
        let executor = Arc::new(ScriptExecutor::new(
            kv.clone(),
            vault.clone(),
            ledger.clone(),
            primitives.clone(),
            factory.clone(),
            limits.clone(),
        ));
        let triggers = Arc::new(TriggerEngine::new(kv.clone(), executor.clone(), primitives.clone()));
        let pool = ContextPool::new(factory, limits, config.max_contexts);

        Ok(Self {
            config,
            primitives,
            kv,
            vault,
            keys,
            ledger,
            executor,
            triggers,
            pool,
            initialized: Mutex::new(false),
        })
    }

    /// Convenience wiring for simulation mode: software platform (seeded
    /// from the config when a seed is set) over the host filesystem.
    pub fn with_software_platform(
        config: EnclaveConfig,
        factory: Arc<dyn EvaluatorFactory>,
    ) -> Result<Self> {
        let platform: Arc<dyn TeePlatform> = match config.platform_seed {
            Some(seed) => Arc::new(SoftwarePlatform::with_seed(seed)),
            None => Arc::new(SoftwarePlatform::ephemeral()),
        };
        let io = Arc::new(FsBlobIo::new(config.storage_root.clone()));
        Self::new(config, platform, io, factory)
    }

    /// Bring every subsystem up. Idempotent: a second call returns
    /// immediately and never re-runs trigger loading.
    pub fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().unwrap();
        if *initialized {
            return Ok(());
        }

        self.vault.initialize()?;
        self.keys.initialize()?;
        self.triggers.initialize()?;
        *initialized = true;

        info!(
            mrenclave = %self.primitives.mrenclave(),
            storage_root = %self.config.storage_root.display(),
            "enclave service initialized"
        );
        Ok(())
    }

    /// Subsystems auto-initialize on first use.
    fn ensure_initialized(&self) -> Result<()> {
        self.initialize()
    }

    pub fn status(&self) -> StatusReport {
        let initialized = *self.initialized.lock().unwrap();
        StatusReport {
            initialized,
            mrenclave: self.primitives.mrenclave(),
            mrsigner: self.primitives.mrsigner(),
            storage_initialized: initialized,
            key_manager_initialized: self.keys.is_initialized(),
            secret_manager_initialized: self.vault.is_initialized(),
            gas_accounting_initialized: initialized,
            js_engine_initialized: initialized,
            event_trigger_initialized: self.triggers.is_initialized(),
            contexts_active: self.pool.active(),
        }
    }

    /// Status report serialized for the wire.
    pub fn status_json(&self) -> Vec<u8> {
        match serde_json::to_vec(&self.status()) {
            Ok(bytes) => bytes,
            Err(e) => Error::Unknown(format!("status encode: {}", e)).envelope().into_bytes(),
        }
    }

    /// Buffer-shaped `get_status`; [`Error::BufferTooSmall`] carries the
    /// size to retry with.
    pub fn status_json_into(&self, out: &mut [u8]) -> Result<usize> {
        let response = self.status_json();
        if response.len() > out.len() {
            return Err(Error::BufferTooSmall { needed: response.len() });
        }
        out[..response.len()].copy_from_slice(&response);
        Ok(response.len())
    }

    /// Handle one boundary message and return the response payload.
    /// Residual failures come back as a JSON error envelope, never a
    /// panic.
    pub fn process_message(&self, message_type: i32, payload: &[u8]) -> Vec<u8> {
        match self.dispatch_message(message_type, payload) {
            Ok(response) => response.to_string().into_bytes(),
            Err(e) => e.envelope().into_bytes(),
        }
    }

    /// Buffer-shaped variant of [`process_message`] for fixed-size caller
    /// buffers; [`Error::BufferTooSmall`] carries the size to retry with.
    pub fn process_message_into(
        &self,
        message_type: i32,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        let response = self.process_message(message_type, payload);
        if response.len() > out.len() {
            return Err(Error::BufferTooSmall { needed: response.len() });
        }
        out[..response.len()].copy_from_slice(&response);
        Ok(response.len())
    }

    fn dispatch_message(&self, message_type: i32, payload: &[u8]) -> Result<serde_json::Value> {
        self.ensure_initialized()?;
        let kind = MessageKind::try_from(message_type)?;

        match kind {
            MessageKind::ExecuteJs => {
                let request: ExecuteJsRequest = parse_payload(payload)?;
                let outcome = self.execute_js(
                    &request.code,
                    &request.input,
                    &request.user_id,
                    &request.function_id,
                    request.gas_limit,
                );
                let result = match outcome.result {
                    Some(result) => result,
                    None => outcome.error.unwrap_or_else(|| {
                        Error::Unknown("no result".to_string()).envelope()
                    }),
                };
                Ok(json!({ "result": result, "gas_used": outcome.gas_used }))
            }
            MessageKind::StoreSecret => {
                let request: StoreSecretRequest = parse_payload(payload)?;
                let success = self
                    .store_secret(&request.user_id, &request.secret_name, &request.secret_value)
                    .is_ok();
                Ok(json!({ "success": success }))
            }
            MessageKind::GetSecret => {
                let request: SecretNameRequest = parse_payload(payload)?;
                // Legacy wire contract: absent and failed reads both come
                // back as an empty string.
                let secret_value = match self.get_secret(&request.user_id, &request.secret_name) {
                    Ok(Some(value)) => value,
                    Ok(None) => String::new(),
                    Err(e) => {
                        warn!(error = %e, "get_secret failed");
                        String::new()
                    }
                };
                Ok(json!({ "secret_value": secret_value }))
            }
            MessageKind::DeleteSecret => {
                let request: SecretNameRequest = parse_payload(payload)?;
                let success = matches!(
                    self.delete_secret(&request.user_id, &request.secret_name),
                    Ok(true)
                );
                Ok(json!({ "success": success }))
            }
            MessageKind::ChainEvent => {
                let request: ChainEventRequest = parse_payload(payload)?;
                let processed_count = self.triggers.process_chain_event(&request.event_data)?;
                Ok(json!({ "processed_count": processed_count }))
            }
        }
    }

    // ==================== Script execution ====================

    /// Run code in a fresh one-shot evaluator.
    pub fn execute_js(
        &self,
        code: &str,
        input_json: &str,
        user_id: &str,
        function_id: &str,
        gas_limit: Option<u64>,
    ) -> ExecutionOutcome {
        if let Err(e) = self.ensure_initialized() {
            return error_outcome(e);
        }
        self.executor.execute(&InvocationRequest {
            code: code.to_string(),
            input_json: input_json.to_string(),
            function_id: function_id.to_string(),
            user_id: user_id.to_string(),
            gas_limit: gas_limit.unwrap_or(self.config.default_gas_limit),
        })
    }

    /// Reserve a pooled evaluator context; the host pays the startup gas
    /// once and reuses the context across calls.
    pub fn create_context(&self) -> Result<u64> {
        self.ensure_initialized()?;
        self.pool.create()
    }

    /// `Ok(false)` when the context id is unknown.
    pub fn destroy_context(&self, context_id: u64) -> Result<bool> {
        self.ensure_initialized()?;
        self.pool.destroy(context_id)
    }

    pub fn contexts_active(&self) -> usize {
        self.pool.active()
    }

    /// Run code in a reserved context. The evaluator is reset (globals
    /// wiped) between invocations; after gas exhaustion it is destroyed
    /// and the context dies with it.
    pub fn execute_in_context(
        &self,
        context_id: u64,
        code: &str,
        input_json: &str,
        user_id: &str,
        function_id: &str,
        gas_limit: Option<u64>,
    ) -> Result<ExecutionOutcome> {
        self.ensure_initialized()?;
        let mut evaluator = self.pool.take(context_id)?;

        let request = InvocationRequest {
            code: code.to_string(),
            input_json: input_json.to_string(),
            function_id: function_id.to_string(),
            user_id: user_id.to_string(),
            gas_limit: gas_limit.unwrap_or(self.config.default_gas_limit),
        };
        let (outcome, disposition) = self.executor.execute_with(evaluator.as_mut(), &request);

        match disposition {
            EvaluatorDisposition::Retain => match evaluator.reset() {
                Ok(()) => self.pool.restore(context_id, evaluator),
                Err(e) => {
                    warn!(context_id, error = %e, "evaluator reset failed, destroying context");
                    self.pool.discard(context_id);
                }
            },
            EvaluatorDisposition::Destroy => {
                self.pool.discard(context_id);
            }
        }
        Ok(outcome)
    }

    // ==================== Secrets ====================

    pub fn store_secret(&self, user_id: &str, name: &str, value: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.vault.put(user_id, name, value)
    }

    pub fn get_secret(&self, user_id: &str, name: &str) -> Result<Option<String>> {
        self.ensure_initialized()?;
        self.vault.get(user_id, name)
    }

    pub fn delete_secret(&self, user_id: &str, name: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.vault.delete(user_id, name)
    }

    pub fn list_secrets(&self, user_id: &str) -> Result<Vec<String>> {
        self.ensure_initialized()?;
        self.vault.list(user_id)
    }

    // ==================== Triggers ====================

    pub fn register_trigger(&self, trigger: Trigger) -> Result<()> {
        self.ensure_initialized()?;
        self.triggers.register(trigger)
    }

    pub fn unregister_trigger(&self, trigger_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.triggers.unregister(trigger_id)
    }

    pub fn get_trigger(&self, trigger_id: &str) -> Result<Option<Trigger>> {
        self.ensure_initialized()?;
        self.triggers.get(trigger_id)
    }

    pub fn list_triggers(&self) -> Result<Vec<Trigger>> {
        self.ensure_initialized()?;
        self.triggers.list()
    }

    pub fn enable_trigger(&self, trigger_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.triggers.enable(trigger_id)
    }

    pub fn disable_trigger(&self, trigger_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.triggers.disable(trigger_id)
    }

    pub fn process_scheduled(&self, now_epoch_seconds: u64) -> Result<usize> {
        self.ensure_initialized()?;
        self.triggers.process_scheduled(now_epoch_seconds)
    }

    pub fn process_chain_event(&self, event_json: &str) -> Result<usize> {
        self.ensure_initialized()?;
        self.triggers.process_chain_event(event_json)
    }

    pub fn process_storage_event(&self, key: &str, operation: &str) -> Result<usize> {
        self.ensure_initialized()?;
        self.triggers.process_storage_event(key, operation)
    }

    pub fn process_external_event(&self, event_type: &str, event_data: &str) -> Result<usize> {
        self.ensure_initialized()?;
        self.triggers.process_external_event(event_type, event_data)
    }

    // ==================== Gas ledger ====================

    pub fn gas_balance(&self, user_id: &str) -> u64 {
        self.ledger.balance(user_id)
    }

    pub fn credit_gas(&self, user_id: &str, amount: u64) {
        self.ledger.credit(user_id, amount)
    }

    pub fn gas_usage(&self, function_id: &str) -> u64 {
        self.ledger.usage(function_id)
    }

    // ==================== Named keys ====================

    pub fn generate_key(
        &self,
        key_id: &str,
        key_type: KeyType,
        usage: u32,
        exportable: bool,
        description: &str,
    ) -> Result<KeyMetadata> {
        self.ensure_initialized()?;
        self.keys.generate(key_id, key_type, usage, exportable, description)
    }

    pub fn key_metadata(&self, key_id: &str) -> Result<KeyMetadata> {
        self.ensure_initialized()?;
        self.keys.metadata(key_id)
    }

    pub fn list_keys(&self) -> Result<Vec<KeyMetadata>> {
        self.ensure_initialized()?;
        self.keys.list()
    }

    pub fn delete_key(&self, key_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.keys.delete(key_id)
    }

    pub fn export_key(&self, key_id: &str) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        self.keys.export(key_id)
    }

    pub fn sign_with_key(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        self.keys.sign(key_id, data)
    }

    pub fn verify_with_key(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool> {
        self.ensure_initialized()?;
        self.keys.verify(key_id, data, signature)
    }

    pub fn encrypt_with_key(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        self.keys.encrypt(key_id, plaintext)
    }

    pub fn decrypt_with_key(&self, key_id: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        self.keys.decrypt(key_id, sealed)
    }

    // ==================== Raw primitives ====================

    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        self.primitives.random(len)
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.primitives.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        self.primitives.verify(data, signature)
    }

    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.primitives.seal(data)
    }

    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.primitives.unseal(sealed)
    }

    pub fn attestation(&self, report_data: &[u8]) -> Result<Vec<u8>> {
        self.primitives.attestation_quote(report_data)
    }

    /// Direct KV access for host-side maintenance.
    pub fn storage(&self) -> &KvStore {
        &self.kv
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::InvalidArgument(format!("malformed request payload: {}", e)))
}

fn error_outcome(error: Error) -> ExecutionOutcome {
    ExecutionOutcome {
        success: false,
        result: None,
        error: Some(error.envelope()),
        gas_used: 0,
        execution_time_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::evaluator::{CapabilityHost, EvalError, Evaluator};
    use crate::storage::blob_io::MemBlobIo;
    use std::path::PathBuf;

    /// Evaluator that returns a fixed string without touching the host.
    struct EchoEvaluator;

    impl Evaluator for EchoEvaluator {
        fn eval(
            &mut self,
            _script: &str,
            _host: &mut dyn CapabilityHost,
        ) -> std::result::Result<String, EvalError> {
            Ok("{\"ok\":true}".to_string())
        }

        fn reset(&mut self) -> std::result::Result<(), EvalError> {
            Ok(())
        }
    }

    struct EchoFactory;

    impl EvaluatorFactory for EchoFactory {
        fn create(&self, _limits: &EvaluatorLimits) -> Result<Box<dyn Evaluator>> {
            Ok(Box::new(EchoEvaluator))
        }
    }

    fn config() -> EnclaveConfig {
        EnclaveConfig {
            storage_root: PathBuf::from("unused"),
            default_gas_limit: 1_000_000,
            max_contexts: 4,
            evaluator_memory_mb: 64,
            evaluator_max_instructions: 1_000_000,
            platform_seed: Some([51u8; 32]),
        }
    }

    fn service() -> EnclaveService {
        EnclaveService::new(
            config(),
            Arc::new(SoftwarePlatform::with_seed([51u8; 32])),
            Arc::new(MemBlobIo::new()),
            Arc::new(EchoFactory),
        )
        .unwrap()
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let service = service();
        assert!(!service.status().initialized);
        service.initialize().unwrap();
        service.initialize().unwrap();

        let status = service.status();
        assert!(status.initialized);
        assert!(status.storage_initialized);
        assert!(status.secret_manager_initialized);
        assert!(status.key_manager_initialized);
        assert!(status.event_trigger_initialized);
        assert_eq!(status.contexts_active, 0);
        assert_eq!(status.mrenclave.len(), 64);
    }

    #[test]
    fn test_execute_js_message() {
        let service = service();
        let payload = json!({
            "code": "function main() { return {ok: true}; }",
            "input": "{}",
            "user_id": "alice",
            "function_id": "f1",
        });
        let response: serde_json::Value = serde_json::from_slice(
            &service.process_message(1, payload.to_string().as_bytes()),
        )
        .unwrap();
        assert_eq!(response["result"].as_str().unwrap(), "{\"ok\":true}");
        assert!(response["gas_used"].as_u64().unwrap() >= 1000);
    }

    #[test]
    fn test_secret_messages_round_trip() {
        let service = service();
        let store = json!({"user_id": "alice", "secret_name": "db", "secret_value": "pw1"});
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(2, store.to_string().as_bytes()))
                .unwrap();
        assert!(response["success"].as_bool().unwrap());

        let get = json!({"user_id": "alice", "secret_name": "db"});
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(3, get.to_string().as_bytes())).unwrap();
        assert_eq!(response["secret_value"].as_str().unwrap(), "pw1");

        // Absent secret flattens to an empty string on the wire.
        let get = json!({"user_id": "alice", "secret_name": "missing"});
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(3, get.to_string().as_bytes())).unwrap();
        assert_eq!(response["secret_value"].as_str().unwrap(), "");

        let delete = json!({"user_id": "alice", "secret_name": "db"});
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(4, delete.to_string().as_bytes()))
                .unwrap();
        assert!(response["success"].as_bool().unwrap());
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(4, delete.to_string().as_bytes()))
                .unwrap();
        assert!(!response["success"].as_bool().unwrap());
    }

    #[test]
    fn test_unknown_message_type_is_enveloped() {
        let service = service();
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(99, b"{}")).unwrap();
        assert!(response["error"].as_str().unwrap().starts_with("InvalidArgument"));
    }

    #[test]
    fn test_malformed_payload_is_enveloped() {
        let service = service();
        let response: serde_json::Value =
            serde_json::from_slice(&service.process_message(2, b"not json")).unwrap();
        assert!(response["error"].as_str().unwrap().starts_with("InvalidArgument"));
    }

    #[test]
    fn test_buffer_too_small_reports_needed_size() {
        let service = service();
        let get = json!({"user_id": "alice", "secret_name": "db"}).to_string();

        let mut small = [0u8; 4];
        let err = service
            .process_message_into(3, get.as_bytes(), &mut small)
            .unwrap_err();
        let needed = match err {
            Error::BufferTooSmall { needed } => needed,
            other => panic!("expected BufferTooSmall, got {:?}", other),
        };

        let mut big = vec![0u8; needed];
        let written = service.process_message_into(3, get.as_bytes(), &mut big).unwrap();
        assert_eq!(written, needed);
    }

    #[test]
    fn test_context_lifecycle() {
        let service = service();
        let id = service.create_context().unwrap();
        assert_eq!(service.contexts_active(), 1);

        let outcome = service
            .execute_in_context(id, "function main() {}", "{}", "alice", "f1", None)
            .unwrap();
        assert!(outcome.success);

        assert!(service.destroy_context(id).unwrap());
        assert!(!service.destroy_context(id).unwrap());
        let err = service
            .execute_in_context(id, "function main() {}", "{}", "alice", "f1", None)
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn test_raw_primitive_surface() {
        let service = service();
        assert_eq!(service.random_bytes(16).unwrap().len(), 16);

        let signature = service.sign(b"data").unwrap();
        assert!(service.verify(b"data", &signature).unwrap());

        let sealed = service.seal(b"state").unwrap();
        assert_eq!(service.unseal(&sealed).unwrap(), b"state");

        let quote = service.attestation(b"report").unwrap();
        let report: serde_json::Value = serde_json::from_slice(&quote).unwrap();
        assert_eq!(report["report_data"].as_str().unwrap(), hex::encode(b"report"));
    }
}
