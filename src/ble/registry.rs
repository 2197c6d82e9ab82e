//! Discovery registry.
//!
//! Tracks the peripherals seen while scanning, one entry per address, and
//! evicts entries that have not been re-sighted recently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::ble::advertising::{Advertisement, DeviceId};

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Stable hardware address.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm at the latest sighting.
    pub rssi: i16,
    /// Whether the latest advertisement was connectable.
    pub connectable: bool,
    /// Device identifier from manufacturer data.
    pub device_id: Option<DeviceId>,
    /// Monotonic time of the latest sighting.
    pub last_seen: Instant,
    /// Wall-clock time of the latest sighting.
    pub last_seen_at: DateTime<Utc>,
}

impl Sighting {
    /// Time elapsed between the latest sighting and `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Check if the sighting is older than `stale_after` at `now`.
    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }
}

/// Set of currently visible peripherals, ordered by first sighting.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRegistry {
    entries: Arc<RwLock<Vec<Sighting>>>,
}

impl DiscoveryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting now. See [`Self::observe_at`].
    pub fn observe(&self, advertisement: &Advertisement, device_id: Option<DeviceId>) -> Sighting {
        self.observe_at(advertisement, device_id, Instant::now())
    }

    /// Record a sighting at `now`.
    ///
    /// A known address has its rssi, connectable flag and timestamp updated in
    /// place. Identifier and name are sticky: they are filled in when missing
    /// but never cleared.
    pub fn observe_at(
        &self,
        advertisement: &Advertisement,
        device_id: Option<DeviceId>,
        now: Instant,
    ) -> Sighting {
        let mut entries = self.entries.write();

        if let Some(existing) = entries
            .iter_mut()
            .find(|s| s.address == advertisement.address)
        {
            existing.rssi = advertisement.rssi;
            existing.connectable = advertisement.connectable;
            existing.last_seen = now;
            existing.last_seen_at = Utc::now();
            if existing.device_id.is_none() {
                existing.device_id = device_id;
            }
            if existing.name.is_none() {
                existing.name = advertisement.name.clone();
            }
            return existing.clone();
        }

        let sighting = Sighting {
            address: advertisement.address.clone(),
            name: advertisement.name.clone(),
            rssi: advertisement.rssi,
            connectable: advertisement.connectable,
            device_id,
            last_seen: now,
            last_seen_at: Utc::now(),
        };
        entries.push(sighting.clone());
        sighting
    }

    /// Remove every entry older than `stale_after` at `now`, returning them.
    pub fn evict_stale(&self, now: Instant, stale_after: Duration) -> Vec<Sighting> {
        let mut entries = self.entries.write();
        let mut removed = Vec::new();

        entries.retain(|s| {
            if s.is_stale(now, stale_after) {
                removed.push(s.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Look up an entry by address.
    pub fn get(&self, address: &str) -> Option<Sighting> {
        self.entries
            .read()
            .iter()
            .find(|s| s.address == address)
            .cloned()
    }

    /// First entry carrying `device_id`.
    pub fn find_device(&self, device_id: &DeviceId) -> Option<Sighting> {
        self.entries
            .read()
            .iter()
            .find(|s| s.device_id.as_ref() == Some(device_id))
            .cloned()
    }

    /// Entry with the strongest signal.
    pub fn strongest(&self) -> Option<Sighting> {
        self.entries.read().iter().max_by_key(|s| s.rssi).cloned()
    }

    /// All entries, ordered by first sighting.
    pub fn snapshot(&self) -> Vec<Sighting> {
        self.entries.read().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn advertisement(address: &str, rssi: i16) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: None,
            rssi,
            connectable: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_observe_dedups_by_address() {
        let registry = DiscoveryRegistry::new();
        let t0 = Instant::now();

        registry.observe_at(&advertisement("A", -70), None, t0);
        let updated = registry.observe_at(&advertisement("A", -40), None, t0);

        assert_eq!(registry.len(), 1);
        assert_eq!(updated.rssi, -40);
        assert_eq!(registry.get("A").unwrap().rssi, -40);
    }

    #[test]
    fn test_identifier_is_sticky() {
        let registry = DiscoveryRegistry::new();
        let id = DeviceId::new([1, 2, 3, 4, 5, 6]);
        let t0 = Instant::now();

        registry.observe_at(&advertisement("A", -70), Some(id), t0);
        let updated = registry.observe_at(&advertisement("A", -65), None, t0);

        assert_eq!(updated.device_id, Some(id));
        assert_eq!(registry.find_device(&id).unwrap().address, "A");
    }

    #[test]
    fn test_staleness_boundary() {
        let registry = DiscoveryRegistry::new();
        let threshold = Duration::from_millis(10_000);
        let t0 = Instant::now();

        registry.observe_at(&advertisement("A", -70), None, t0);

        let removed = registry.evict_stale(t0 + Duration::from_millis(9_999), threshold);
        assert!(removed.is_empty());
        assert!(registry.get("A").is_some());

        let removed = registry.evict_stale(t0 + Duration::from_millis(10_001), threshold);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].address, "A");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_only_stale_entries() {
        let registry = DiscoveryRegistry::new();
        let threshold = Duration::from_secs(10);
        let t0 = Instant::now();

        registry.observe_at(&advertisement("old", -70), None, t0);
        registry.observe_at(&advertisement("new", -70), None, t0 + Duration::from_secs(8));

        let removed = registry.evict_stale(t0 + Duration::from_secs(12), threshold);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].address, "old");
        assert_eq!(registry.snapshot()[0].address, "new");
    }

    #[test]
    fn test_strongest_and_order() {
        let registry = DiscoveryRegistry::new();
        registry.observe(&advertisement("A", -80), None);
        registry.observe(&advertisement("B", -50), None);
        registry.observe(&advertisement("C", -65), None);

        assert_eq!(registry.strongest().unwrap().address, "B");
        let order: Vec<_> = registry.snapshot().into_iter().map(|s| s.address).collect();
        assert_eq!(order, vec!["A", "B", "C"]);

        registry.clear();
        assert!(registry.strongest().is_none());
    }
}
