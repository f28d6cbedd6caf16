//! redb table definitions for the durable sample store.
//!
//! Keys are `{driver_id}:{recorded_at_ms:020}` so a prefix range scan walks
//! one driver's samples in time order. Values are JSON-serialized
//! `LocationSample`s.

use redb::TableDefinition;

/// GPS samples keyed by `{driver_id}:{recorded_at_ms:020}`.
pub const LOCATION_SAMPLES: TableDefinition<&str, &[u8]> = TableDefinition::new("location_samples");
