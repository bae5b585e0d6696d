use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::Record;
use crate::error::SyncError;
use crate::store::RecordStore;

/// Commits fetched records to the store as one bulk insert.
#[derive(Clone)]
pub struct BatchImporter {
    store: Arc<dyn RecordStore>,
}

impl BatchImporter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Returns how many rows were newly inserted; records whose identity key
    /// already exists are not counted.
    pub async fn import(&self, records: Vec<Record>) -> Result<usize, SyncError> {
        if records.is_empty() {
            debug!("nothing to import");
            return Ok(0);
        }
        let received = records.len();
        let outcome = self
            .store
            .bulk_insert(records)
            .await
            .map_err(|err| match err {
                SyncError::BatchInsert(_) => err,
                other => SyncError::BatchInsert(other.to_string()),
            })?;
        info!(
            received,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "imported batch"
        );
        Ok(outcome.inserted)
    }
}
