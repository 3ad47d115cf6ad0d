//! Common test utilities for intake integration tests
//!
//! Most tests run against [`MemoryStore`]; the PostgreSQL helpers start a
//! throwaway container (Docker required) with migrations applied.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use intake_core::config::IngestPolicy;
use intake_core::models::{Batch, Import, ImportFile};
use intake_core::store::{IngestStore, MemoryStore, PgStore};
use intake_core::{CreateBatchCommand, CreateFileCommand, Intake};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,intake_core=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// 64-character hex digest made of one repeated byte, e.g. `aa` x 32
pub fn hash(byte: u8) -> String {
    format!("{byte:02x}").repeat(32)
}

/// Services over a fresh in-memory store
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub intake: Intake,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(IngestPolicy::default())
    }

    pub fn with_policy(policy: IngestPolicy) -> Self {
        init_test_tracing();
        let store = Arc::new(MemoryStore::new());
        let intake = Intake::new(store.clone() as Arc<dyn IngestStore>, policy);
        Self { store, intake }
    }
}

impl std::ops::Deref for Harness {
    type Target = Intake;

    fn deref(&self) -> &Intake {
        &self.intake
    }
}

pub async fn batch_with_expected(intake: &Intake, expected: Option<i64>) -> Batch {
    intake
        .batches
        .create(CreateBatchCommand {
            source_system: Some("tape-library".to_string()),
            created_by: Some("ingest-bot".to_string()),
            file_count_expected: expected,
            ..Default::default()
        })
        .await
        .expect("Failed to create batch")
}

pub async fn import_in(intake: &Intake, batch_id: Option<Uuid>) -> Import {
    intake
        .imports
        .create(batch_id)
        .await
        .expect("Failed to create import")
}

pub async fn add_file(intake: &Intake, import_id: Uuid, path: &str, sha256: &str) -> ImportFile {
    intake
        .files
        .create(CreateFileCommand {
            import_id,
            path: path.to_string(),
            size_bytes: Some(1024),
            sha256: sha256.to_string(),
        })
        .await
        .expect("Failed to create file")
}

/// Adds `count` files with distinct hashes starting at `first_byte`
pub async fn add_files(intake: &Intake, import_id: Uuid, count: u8, first_byte: u8) -> Vec<ImportFile> {
    let mut files = Vec::with_capacity(count as usize);
    for i in 0..count {
        let byte = first_byte.wrapping_add(i);
        files.push(add_file(intake, import_id, &format!("archive/part-{i:04}.tar"), &hash(byte)).await);
    }
    files
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    /// Start a PostgreSQL container with migrations applied
    pub async fn start() -> Result<Self> {
        init_test_tracing();

        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        intake_core::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn intake(&self, policy: IngestPolicy) -> Intake {
        Intake::new(Arc::new(PgStore::new(self.pool.clone())), policy)
    }
}
