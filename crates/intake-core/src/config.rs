//! Configuration management
//!
//! Everything is read from the environment (a `.env` file is honoured).
//! The ingestion policy makes the behaviours that would otherwise be implicit
//! explicit: deduplication scope, retry ceiling, quarantine tolerance and
//! what happens to stalled work.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::DbConfig;

// ============================================================================
// Policy Defaults
// ============================================================================

/// Failed processing attempts tolerated per file before it is exhausted.
pub const DEFAULT_RETRY_CEILING: i32 = 3;

/// QUARANTINED files a batch may contain and still complete.
pub const DEFAULT_QUARANTINE_TOLERANCE: i64 = 0;

/// Upper bound for a single `claim_next` call.
pub const DEFAULT_CLAIM_LIMIT_MAX: i64 = 100;

/// PROCESSING files untouched for this long are considered stalled (15 minutes).
pub const DEFAULT_STALL_THRESHOLD_SECS: i64 = 900;

/// Where a content hash must already be INGESTED for a file to be skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Only files of the same import
    #[default]
    Import,
    /// Any file in the store
    Global,
}

impl FromStr for DedupScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "import" | "per-import" | "per_import" => Ok(DedupScope::Import),
            "global" => Ok(DedupScope::Global),
            other => anyhow::bail!("Invalid dedup scope: {}", other),
        }
    }
}

/// What `recover_stalled` does with stalled PROCESSING files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StallRecovery {
    /// Report only; an operator decides
    #[default]
    Manual,
    /// Fail them with a stall message, which puts them on the retry path
    Fail,
}

impl FromStr for StallRecovery {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(StallRecovery::Manual),
            "fail" => Ok(StallRecovery::Fail),
            other => anyhow::bail!("Invalid stall recovery policy: {}", other),
        }
    }
}

/// Ingestion policy shared by the services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestPolicy {
    pub dedup_scope: DedupScope,
    /// Failed attempts a file may accumulate. A FAILED file is exhausted
    /// once `attempt_count >= retry_ceiling` (reaching the ceiling, not
    /// exceeding it): `retry` is refused and the batch rolls up to FAILED.
    pub retry_ceiling: i32,
    pub quarantine_tolerance: i64,
    pub claim_limit_max: i64,
    pub stall_threshold_secs: i64,
    pub stall_recovery: StallRecovery,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            dedup_scope: DedupScope::Import,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            quarantine_tolerance: DEFAULT_QUARANTINE_TOLERANCE,
            claim_limit_max: DEFAULT_CLAIM_LIMIT_MAX,
            stall_threshold_secs: DEFAULT_STALL_THRESHOLD_SECS,
            stall_recovery: StallRecovery::Manual,
        }
    }
}

impl IngestPolicy {
    /// Load from `INTAKE_*` variables, falling back to defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            dedup_scope: env_parse("INTAKE_DEDUP_SCOPE")?.unwrap_or(defaults.dedup_scope),
            retry_ceiling: env_parse("INTAKE_RETRY_CEILING")?.unwrap_or(defaults.retry_ceiling),
            quarantine_tolerance: env_parse("INTAKE_QUARANTINE_TOLERANCE")?
                .unwrap_or(defaults.quarantine_tolerance),
            claim_limit_max: env_parse("INTAKE_CLAIM_LIMIT_MAX")?
                .unwrap_or(defaults.claim_limit_max),
            stall_threshold_secs: env_parse("INTAKE_STALL_THRESHOLD_SECS")?
                .unwrap_or(defaults.stall_threshold_secs),
            stall_recovery: env_parse("INTAKE_STALL_RECOVERY")?
                .unwrap_or(defaults.stall_recovery),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_ceiling < 1 {
            anyhow::bail!("Retry ceiling must be at least 1");
        }
        if self.quarantine_tolerance < 0 {
            anyhow::bail!("Quarantine tolerance cannot be negative");
        }
        if self.claim_limit_max < 1 {
            anyhow::bail!("Claim limit must be at least 1");
        }
        if self.stall_threshold_secs < 1 {
            anyhow::bail!("Stall threshold must be at least 1 second");
        }
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DbConfig,
    pub policy: IngestPolicy,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DbConfig::from_env()?,
            policy: IngestPolicy::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.policy.validate()
    }
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}
