use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::DataSourceKey;
use crate::error::SyncError;
use crate::store::{read_json, write_json_atomic};

/// Last successful sync per data source, used to decide whether a background
/// refresh is due.
pub struct SyncLedger {
    path: Option<Utf8PathBuf>,
    entries: Mutex<BTreeMap<DataSourceKey, DateTime<Utc>>>,
}

impl SyncLedger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn open(path: &Utf8Path) -> Result<Self, SyncError> {
        let entries = if path.as_std_path().exists() {
            read_json(path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        })
    }

    pub fn last_sync(&self, source: &DataSourceKey) -> Option<DateTime<Utc>> {
        self.entries.lock().get(source).copied()
    }

    pub fn entries(&self) -> BTreeMap<DataSourceKey, DateTime<Utc>> {
        self.entries.lock().clone()
    }

    /// Due when never synced, or when `interval` has elapsed since the last
    /// sync. A clock that moved backwards counts as not due.
    pub fn is_due(&self, source: &DataSourceKey, interval: Duration, now: DateTime<Utc>) -> bool {
        match self.last_sync(source) {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= interval)
                .unwrap_or(false),
        }
    }

    /// Timestamps only move forward.
    pub fn record_success(
        &self,
        source: &DataSourceKey,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut entries = self.entries.lock();
        let updated = match entries.get(source) {
            Some(previous) if *previous >= at => return Ok(()),
            _ => {
                let mut updated = entries.clone();
                updated.insert(source.clone(), at);
                updated
            }
        };
        if let Some(path) = &self.path {
            write_json_atomic(path, &updated)?;
        }
        *entries = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn due_when_never_synced_or_stale() {
        let ledger = SyncLedger::in_memory();
        let key: DataSourceKey = "asam".parse().unwrap();
        let now = Utc::now();
        let hour = Duration::from_secs(3600);
        assert!(ledger.is_due(&key, hour, now));

        ledger.record_success(&key, now).unwrap();
        assert!(!ledger.is_due(&key, hour, now + TimeDelta::minutes(59)));
        assert!(ledger.is_due(&key, hour, now + TimeDelta::minutes(60)));
    }

    #[test]
    fn timestamps_are_monotonic_and_persisted() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("ledger.json")).unwrap();
        let key: DataSourceKey = "modu".parse().unwrap();
        let now = Utc::now();

        let ledger = SyncLedger::open(&path).unwrap();
        ledger.record_success(&key, now).unwrap();
        ledger
            .record_success(&key, now - TimeDelta::hours(1))
            .unwrap();

        let reopened = SyncLedger::open(&path).unwrap();
        assert_eq!(reopened.last_sync(&key), Some(now));
    }
}
