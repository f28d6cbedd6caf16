//! ridegrid-geocode — the geocoding gateway.
//!
//! Requests are normalized and fingerprinted, served from the shared cache
//! when possible, and otherwise sent to the [`MapProvider`] through a
//! per-provider circuit breaker. When the provider is unavailable, reverse
//! lookups degrade to a synthesized `"lat,lon"` answer and forward lookups
//! fail with `Unavailable`.

pub mod error;
pub mod gateway;
pub mod provider;

pub use error::{GeocodeError, ProviderError};
pub use gateway::{breaker_name, GeocodingGateway};
pub use provider::{DisabledProvider, HttpMapProvider, MapProvider, ScriptedProvider};
