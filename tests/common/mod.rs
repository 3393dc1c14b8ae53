//! Shared test harness: a scripted evaluator standing in for the
//! embedded engine, plus service wiring over in-memory or on-disk blob
//! stores.
//!
//! The scripted evaluator does not interpret JavaScript. It recognizes
//! the invocation wrapper the executor composes, extracts the `input`
//! and `secrets` documents from it, and runs the first registered
//! routine whose marker occurs in the script — which is exactly the
//! contract the runtime has with the real engine: script in, final
//! expression out, capabilities and metering through the host.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use enclave_runtime::config::EnclaveConfig;
use enclave_runtime::error::Result;
use enclave_runtime::executor::evaluator::{
    CapabilityHost, EvalError, Evaluator, EvaluatorFactory, EvaluatorLimits,
};
use enclave_runtime::platform::SoftwarePlatform;
use enclave_runtime::service::EnclaveService;
use enclave_runtime::storage::blob_io::{FsBlobIo, MemBlobIo};

pub type Routine = dyn Fn(
        &mut dyn CapabilityHost,
        &serde_json::Value,
        &serde_json::Value,
    ) -> std::result::Result<String, EvalError>
    + Send
    + Sync;

pub struct Rule {
    pub marker: &'static str,
    pub run: Arc<Routine>,
}

pub fn rule<F>(marker: &'static str, run: F) -> Rule
where
    F: Fn(
            &mut dyn CapabilityHost,
            &serde_json::Value,
            &serde_json::Value,
        ) -> std::result::Result<String, EvalError>
        + Send
        + Sync
        + 'static,
{
    Rule { marker, run: Arc::new(run) }
}

pub struct ScriptedEvaluator {
    rules: Arc<Vec<Rule>>,
}

impl Evaluator for ScriptedEvaluator {
    fn eval(
        &mut self,
        script: &str,
        host: &mut dyn CapabilityHost,
    ) -> std::result::Result<String, EvalError> {
        let input = extract_document(script, "const input = ");
        let secrets = extract_document(script, "const secrets = ");
        for rule in self.rules.iter() {
            if script.contains(rule.marker) {
                return (rule.run)(host, &input, &secrets);
            }
        }
        Err(EvalError::Engine("script matches no registered routine".to_string()))
    }

    fn reset(&mut self) -> std::result::Result<(), EvalError> {
        Ok(())
    }
}

/// Pull a JSON document out of the invocation wrapper.
fn extract_document(script: &str, prefix: &str) -> serde_json::Value {
    script
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(prefix))
        .and_then(|rest| rest.strip_suffix(';'))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null)
}

pub struct ScriptedFactory {
    rules: Arc<Vec<Rule>>,
}

impl ScriptedFactory {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules: Arc::new(rules) }
    }
}

impl EvaluatorFactory for ScriptedFactory {
    fn create(&self, _limits: &EvaluatorLimits) -> Result<Box<dyn Evaluator>> {
        Ok(Box::new(ScriptedEvaluator { rules: self.rules.clone() }))
    }
}

/// Initialize test logging once; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "enclave_runtime=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_config(storage_root: &Path) -> EnclaveConfig {
    EnclaveConfig {
        storage_root: storage_root.to_path_buf(),
        default_gas_limit: 1_000_000,
        max_contexts: 8,
        evaluator_memory_mb: 64,
        evaluator_max_instructions: 1_000_000,
        platform_seed: Some([77u8; 32]),
    }
}

/// Service over an in-memory blob store.
pub fn memory_service(rules: Vec<Rule>) -> EnclaveService {
    init_tracing();
    let config = test_config(Path::new("unused"));
    let seed = config.platform_seed.expect("test config carries a seed");
    EnclaveService::new(
        config,
        Arc::new(SoftwarePlatform::with_seed(seed)),
        Arc::new(MemBlobIo::new()),
        Arc::new(ScriptedFactory::new(rules)),
    )
    .expect("service wiring")
}

/// Service persisting under `root`; build it twice with the same root to
/// simulate an enclave restart.
pub fn disk_service(root: &Path, rules: Vec<Rule>) -> EnclaveService {
    init_tracing();
    let config = test_config(root);
    let seed = config.platform_seed.expect("test config carries a seed");
    EnclaveService::new(
        config,
        Arc::new(SoftwarePlatform::with_seed(seed)),
        Arc::new(FsBlobIo::new(root)),
        Arc::new(ScriptedFactory::new(rules)),
    )
    .expect("service wiring")
}

/// Routine for code shaped like `function main(i){return {ok:true}}`.
pub fn ok_rule() -> Rule {
    rule("return {ok:true}", |_, _, _| Ok("{\"ok\":true}".to_string()))
}

/// Routine echoing the secrets snapshot back as the result.
pub fn echo_secrets_rule() -> Rule {
    rule("return secrets", |_, _, secrets| Ok(secrets.to_string()))
}

/// Routine that hashes in a loop until the gas ceiling cuts it off.
pub fn hash_loop_rule() -> Rule {
    rule("crypto.hash", |host, _, _| loop {
        host.hash(b"x")?;
    })
}
