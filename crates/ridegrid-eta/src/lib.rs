//! ridegrid-eta — continuously updated ETAs for rides in flight.
//!
//! # Architecture
//!
//! ```text
//! EtaTracker
//!   ├── one task per ride, ticking every eta_refresh_interval
//!   │     driver location (GeoQueryService) → EtaEstimator → publish gate
//!   ├── Semaphore(worker_pool_size) bounds ticks running at once
//!   ├── tick_budget per tick; an overrun counts as a missed tick
//!   └── reaper drops records older than ride_tracking_max_age
//!
//! Publisher
//!   ├── ChannelPublisher   tokio broadcast, in-process subscribers
//!   ├── WebhookPublisher   JSON POST behind the `realtime` breaker
//!   └── LogPublisher       tracing only
//! ```

pub mod error;
pub mod publisher;
pub mod stats;
pub mod tracker;

pub use error::{EtaError, PublishError};
pub use publisher::{ChannelPublisher, LogPublisher, Publisher, REALTIME_BREAKER, WebhookPublisher};
pub use stats::{TrackerStats, TrackerStatsSnapshot};
pub use tracker::{EtaTracker, publish_due};
