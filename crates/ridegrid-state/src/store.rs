//! SampleStore — redb-backed durable history of driver GPS samples.
//!
//! Written in bulk by the ingest persistence loop, read for support and
//! replay tooling. All values are JSON-serialized into redb's `&[u8]` value
//! column. Supports both on-disk and in-memory backends (the latter for
//! testing and for deployments without a configured storage path).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use ridegrid_core::{DriverId, LocationSample};

use crate::error::{StateError, StateResult};
use crate::tables::LOCATION_SAMPLES;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe sample store backed by redb.
#[derive(Clone)]
pub struct SampleStore {
    db: Arc<Database>,
}

impl SampleStore {
    /// Open (or create) a persistent sample store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "sample store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory sample store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory sample store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(LOCATION_SAMPLES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert a batch in one transaction. Re-inserting a sample with the same
    /// driver and timestamp overwrites it, so replays are harmless.
    pub fn put_samples(&self, batch: &[LocationSample]) -> StateResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCATION_SAMPLES).map_err(map_err!(Table))?;
            for sample in batch {
                let key = sample.table_key();
                let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = batch.len(), "location samples stored");
        Ok(batch.len())
    }

    /// Most recent samples for one driver, newest first.
    pub fn list_for_driver(&self, driver_id: &DriverId, limit: usize) -> StateResult<Vec<LocationSample>> {
        // ';' sorts immediately after ':', bounding the driver's key range.
        let start = format!("{driver_id}:");
        let end = format!("{driver_id};");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATION_SAMPLES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sample: LocationSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(sample);
        }
        Ok(results)
    }

    /// Total number of stored samples.
    pub fn count(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATION_SAMPLES).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }

    /// Delete every sample recorded before `cutoff`. Returns number deleted.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> StateResult<u64> {
        let cutoff_ms = cutoff.timestamp_millis().max(0);
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LOCATION_SAMPLES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    let ms: i64 = k.rsplit(':').next()?.parse().ok()?;
                    (ms < cutoff_ms).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u64;
        {
            let mut table = txn.open_table(LOCATION_SAMPLES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count, %cutoff, "pruned location samples");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ridegrid_core::GeoPoint;

    fn sample(driver_id: DriverId, secs: i64) -> LocationSample {
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        LocationSample {
            driver_id,
            point: GeoPoint::new(37.7749, -122.4194, at),
        }
    }

    #[test]
    fn put_and_list_newest_first() {
        let store = SampleStore::open_in_memory().unwrap();
        let d1 = DriverId::new();
        let d2 = DriverId::new();
        let batch: Vec<_> = (0..5).map(|i| sample(d1, i)).chain([sample(d2, 3)]).collect();

        assert_eq!(store.put_samples(&batch).unwrap(), 6);
        let listed = store.list_for_driver(&d1, 3).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0], sample(d1, 4));
        assert_eq!(listed[2], sample(d1, 2));
        assert!(listed.iter().all(|s| s.driver_id == d1));
        assert_eq!(store.list_for_driver(&d2, 10).unwrap().len(), 1);
    }

    #[test]
    fn reinsert_is_idempotent() {
        let store = SampleStore::open_in_memory().unwrap();
        let d = DriverId::new();
        store.put_samples(&[sample(d, 1)]).unwrap();
        store.put_samples(&[sample(d, 1)]).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn prune_removes_only_older_samples() {
        let store = SampleStore::open_in_memory().unwrap();
        let d = DriverId::new();
        let batch: Vec<_> = (0..10).map(|i| sample(d, i * 60)).collect();
        store.put_samples(&batch).unwrap();

        let cutoff = batch[4].point.recorded_at;
        assert_eq!(store.prune_older_than(cutoff).unwrap(), 4);
        assert_eq!(store.count().unwrap(), 6);
        let oldest = store.list_for_driver(&d, 100).unwrap().pop().unwrap();
        assert_eq!(oldest.point.recorded_at, cutoff);
        assert_eq!(store.prune_older_than(cutoff - Duration::hours(1)).unwrap(), 0);
    }

    #[test]
    fn empty_store_operations() {
        let store = SampleStore::open_in_memory().unwrap();
        assert_eq!(store.put_samples(&[]).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.list_for_driver(&DriverId::new(), 5).unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("samples.redb");
        let d = DriverId::new();

        {
            let store = SampleStore::open(&db_path).unwrap();
            store.put_samples(&[sample(d, 1), sample(d, 2)]).unwrap();
        }

        let store = SampleStore::open(&db_path).unwrap();
        assert_eq!(store.list_for_driver(&d, 10).unwrap().len(), 2);
    }
}
