//! Import registry
//!
//! Imports own files and attempts and optionally belong to a batch; the
//! batch link is what routes file counters to batch counters.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::models::Import;
use crate::store::{DeleteOutcome, IngestStore};

pub struct ImportRegistry {
    store: Arc<dyn IngestStore>,
}

impl ImportRegistry {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create(&self, batch_id: Option<Uuid>) -> IngestResult<Import> {
        let import = self.store.insert_import(batch_id).await?;
        tracing::info!(import_id = %import.id, "Import registered");
        Ok(import)
    }

    pub async fn get(&self, id: Uuid) -> IngestResult<Import> {
        self.store
            .get_import(id)
            .await?
            .ok_or_else(|| IngestError::not_found("import", id))
    }

    /// Stops further claims for the import. In-flight files finish normally.
    #[tracing::instrument(skip(self), fields(import_id = %id))]
    pub async fn cancel(&self, id: Uuid) -> IngestResult<Import> {
        let import = self
            .store
            .cancel_import(id)
            .await?
            .ok_or_else(|| IngestError::not_found("import", id))?;
        tracing::info!("Import cancelled");
        Ok(import)
    }

    /// Removes the import with its files and attempts
    #[tracing::instrument(skip(self), fields(import_id = %id))]
    pub async fn delete(&self, id: Uuid) -> IngestResult<()> {
        match self.store.delete_import(id).await? {
            DeleteOutcome::Deleted => {
                tracing::info!("Import deleted");
                Ok(())
            },
            DeleteOutcome::NotFound => Err(IngestError::not_found("import", id)),
            DeleteOutcome::Blocked(reason) => Err(IngestError::conflict(reason)),
        }
    }
}
