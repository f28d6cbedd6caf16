//! Durable sample sink: the contract the ingest persistence loop writes to.

use std::time::Duration;

use async_trait::async_trait;

use ridegrid_core::{LocationSample, RequestContext};

use crate::error::{StateError, StateResult};
use crate::store::SampleStore;

/// Default deadline for one bulk write when the caller sets none.
pub const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Persist a batch of at most a few thousand samples. Failures are
    /// recoverable; the caller decides whether to drop or retry.
    async fn insert_location_batch(
        &self,
        ctx: &RequestContext,
        batch: &[LocationSample],
    ) -> StateResult<usize>;
}

#[async_trait]
impl SampleSink for SampleStore {
    async fn insert_location_batch(
        &self,
        ctx: &RequestContext,
        batch: &[LocationSample],
    ) -> StateResult<usize> {
        let store = self.clone();
        let owned = batch.to_vec();
        // redb commits fsync; keep them off the async workers.
        let task = tokio::task::spawn_blocking(move || store.put_samples(&owned));
        ctx.run(SINK_WRITE_TIMEOUT, task)
            .await?
            .map_err(|e| StateError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridegrid_core::{DriverId, GeoPoint};

    #[tokio::test]
    async fn sink_writes_through_to_store() {
        let store = SampleStore::open_in_memory().unwrap();
        let sink: &dyn SampleSink = &store;
        let d = DriverId::new();
        let batch = vec![LocationSample {
            driver_id: d,
            point: GeoPoint::now(1.0, 2.0),
        }];

        let written = sink
            .insert_location_batch(&RequestContext::new("t"), &batch)
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.list_for_driver(&d, 1).unwrap(), batch);
    }

    #[tokio::test]
    async fn cancelled_context_skips_write() {
        let store = SampleStore::open_in_memory().unwrap();
        let ctx = RequestContext::new("t");
        ctx.cancel();
        let err = store.insert_location_batch(&ctx, &[]).await.unwrap_err();
        assert!(matches!(err, StateError::Cancelled));
    }
}
