//! Key layout in the shared KV store.
//!
//! Every key carries the configured prefix so several environments can
//! share one Redis. Namespaces are owned by exactly one component:
//! `presence`, `history` and `geo` by ingest, `geocode` by the geocoding
//! gateway, `idem` by the idempotency gate.

use ridegrid_core::DriverId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("rg")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn presence(&self, driver_id: &DriverId) -> String {
        format!("{}:presence:{driver_id}", self.prefix)
    }

    pub fn history(&self, driver_id: &DriverId) -> String {
        format!("{}:history:{driver_id}", self.prefix)
    }

    /// Geo index of online and available drivers.
    pub fn geo_index(&self) -> String {
        format!("{}:geo:available", self.prefix)
    }

    /// Companion sorted set: member = driver id, score = last flush (epoch ms).
    pub fn geo_seen(&self) -> String {
        format!("{}:geo:seen", self.prefix)
    }

    pub fn idempotency(&self, scope_hash: &str) -> String {
        format!("{}:idem:{scope_hash}", self.prefix)
    }

    pub fn idempotency_lock(&self, scope_hash: &str) -> String {
        format!("{}:idem-lock:{scope_hash}", self.prefix)
    }

    pub fn geocode(&self, fingerprint: &str) -> String {
        format!("{}:geocode:{fingerprint}", self.prefix)
    }

    pub fn geocode_pattern(&self) -> String {
        format!("{}:geocode:*", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_and_distinct() {
        let keys = KeySpace::new("test");
        let d = DriverId::new();
        assert_eq!(keys.presence(&d), format!("test:presence:{d}"));
        assert_ne!(keys.presence(&d), keys.history(&d));
        assert_ne!(keys.idempotency("x"), keys.idempotency_lock("x"));
        assert!(keys.geocode("abc").starts_with("test:geocode:"));
        assert_eq!(keys.geocode_pattern(), "test:geocode:*");
    }
}
