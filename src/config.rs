use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    /// Root directory for the sealed blob store (one subdirectory per
    /// namespace).
    pub storage_root: PathBuf,

    /// Gas ceiling applied to invocations that do not carry their own.
    pub default_gas_limit: u64,

    /// Maximum number of pooled evaluator contexts kept alive for
    /// `create_context` / `execute_in_context`.
    pub max_contexts: usize,

    /// Memory cap handed to each evaluator, in MiB.
    pub evaluator_memory_mb: u32,

    /// Hard instruction backstop for unmetered pure-compute loops.
    pub evaluator_max_instructions: u64,

    /// Fixed sealing seed for the software platform (hex, 32 bytes).
    /// When unset a random seed is used and sealed data does not survive
    /// a restart.
    pub platform_seed: Option<[u8; 32]>,
}

impl EnclaveConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables (with defaults):
    /// - ENCLAVE_STORAGE_ROOT: blob store root (default: enclave_data)
    /// - DEFAULT_GAS_LIMIT: default invocation gas ceiling (default: 10_000_000)
    /// - MAX_CONTEXTS: evaluator pool size (default: 16)
    /// - EVALUATOR_MEMORY_MB: evaluator memory cap (default: 64)
    /// - EVALUATOR_MAX_INSTRUCTIONS: instruction backstop (default: 10_000_000_000)
    /// - PLATFORM_SEED: hex-encoded 32-byte sealing seed for simulation mode
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let storage_root = env::var("ENCLAVE_STORAGE_ROOT")
            .unwrap_or_else(|_| "enclave_data".to_string());

        let default_gas_limit = env::var("DEFAULT_GAS_LIMIT")
            .unwrap_or_else(|_| "10000000".to_string())
            .parse::<u64>()
            .map_err(|_| Error::InvalidArgument("DEFAULT_GAS_LIMIT must be a valid number".to_string()))?;

        let max_contexts = env::var("MAX_CONTEXTS")
            .unwrap_or_else(|_| "16".to_string())
            .parse::<usize>()
            .map_err(|_| Error::InvalidArgument("MAX_CONTEXTS must be a valid number".to_string()))?;

        let evaluator_memory_mb = env::var("EVALUATOR_MEMORY_MB")
            .unwrap_or_else(|_| "64".to_string())
            .parse::<u32>()
            .map_err(|_| Error::InvalidArgument("EVALUATOR_MEMORY_MB must be a valid number".to_string()))?;

        let evaluator_max_instructions = env::var("EVALUATOR_MAX_INSTRUCTIONS")
            .unwrap_or_else(|_| "10000000000".to_string())
            .parse::<u64>()
            .map_err(|_| {
                Error::InvalidArgument("EVALUATOR_MAX_INSTRUCTIONS must be a valid number".to_string())
            })?;

        let platform_seed = match env::var("PLATFORM_SEED") {
            Ok(raw) => Some(parse_seed(&raw)?),
            Err(_) => None,
        };

        let config = Self {
            storage_root: PathBuf::from(storage_root),
            default_gas_limit,
            max_contexts,
            evaluator_memory_mb,
            evaluator_max_instructions,
            platform_seed,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("storage root cannot be empty".to_string()));
        }

        if self.default_gas_limit == 0 {
            return Err(Error::InvalidArgument("default gas limit must be positive".to_string()));
        }

        if self.max_contexts == 0 {
            return Err(Error::InvalidArgument("max contexts must be positive".to_string()));
        }

        if self.evaluator_memory_mb < 16 {
            return Err(Error::InvalidArgument(
                "evaluator memory cap must be at least 16 MB".to_string(),
            ));
        }

        if self.evaluator_max_instructions == 0 {
            return Err(Error::InvalidArgument(
                "evaluator instruction backstop must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_seed(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw)
        .map_err(|_| Error::InvalidArgument("PLATFORM_SEED must be hex".to_string()))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidArgument("PLATFORM_SEED must be 32 bytes".to_string()))?;
    Ok(seed)
}
