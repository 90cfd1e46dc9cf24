//! Membership cache: latest known record per (service, record name).
//!
//! Cluster event sources routinely redeliver unchanged records, so [`MembershipCache::update`]
//! reports whether anything actually changed and callers skip all downstream work otherwise.

use crate::record::{Endpoint, MembershipRecord, ServiceName};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;

/// Records for one service, keyed by record name.
type RecordsByName = HashMap<String, MembershipRecord>;

/// Cache of membership records grouped by owning service.
///
/// One lock guards all state; it is held for a whole `update` call and for the lifetime of a
/// [`ServicesView`].
#[derive(Debug, Default)]
pub struct MembershipCache {
    services: Mutex<HashMap<ServiceName, RecordsByName>>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a record. Returns true if the cache changed.
    ///
    /// Removal returns true iff the record was present. Upsert returns true iff the record is
    /// new or differs structurally from the cached one. Malformed records are logged and
    /// leave the cache untouched.
    pub fn update(&self, record: &MembershipRecord, remove: bool) -> bool {
        let (service, slice) = match record.cache_keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(reason = %e, "error getting membership cache keys");
                return false;
            }
        };

        let mut services = self.services.lock();
        if remove {
            let Some(records) = services.get_mut(&service) else {
                return false;
            };
            let removed = records.remove(slice).is_some();
            if records.is_empty() {
                services.remove(&service);
            }
            return removed;
        }

        let records = services.entry(service).or_default();
        if records.get(slice) == Some(record) {
            return false;
        }
        records.insert(slice.to_string(), record.clone());
        true
    }

    /// Lock the cache and view every tracked service with its members.
    pub fn services(&self) -> ServicesView<'_> {
        ServicesView {
            guard: self.services.lock(),
        }
    }

    /// Number of cached records across all services.
    pub fn len(&self) -> usize {
        self.services.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locked view over the cache. Holds the cache lock until dropped.
pub struct ServicesView<'a> {
    guard: MutexGuard<'a, HashMap<ServiceName, RecordsByName>>,
}

impl ServicesView<'_> {
    /// Iterate services and their (lazily flattened) members.
    pub fn iter(&self) -> impl Iterator<Item = (&ServiceName, ServiceMembers<'_>)> + '_ {
        self.guard
            .iter()
            .map(|(service, records)| (service, ServiceMembers { records }))
    }
}

/// Members of one service across all of its records. Each call to `iter` re-reads the records.
#[derive(Clone, Copy)]
pub struct ServiceMembers<'a> {
    records: &'a RecordsByName,
}

impl<'a> ServiceMembers<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &'a Endpoint> + 'a {
        let records: &'a RecordsByName = self.records;
        records.values().flat_map(|record| record.endpoints.iter())
    }
}

impl<'a> IntoIterator for ServiceMembers<'a> {
    type Item = &'a Endpoint;
    type IntoIter = Box<dyn Iterator<Item = &'a Endpoint> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.records.values().flat_map(|record| record.endpoints.iter()))
    }
}
