//! Named prepared-plan cache.
//!
//! Entries are kept in an LRU guarded by a single mutex. Verification and
//! re-preparation run on a private copy outside the lock; the result replaces
//! the cached entry only if nobody swapped it in the meantime.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::PlannerConfig;
use crate::error::{PlanError, Result};
use crate::plan::Prepared;

/// How [`PreparedCache::get`] treats the entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Count the lookup as a use and refresh the entry's recency.
    pub track: bool,
    /// Re-resolve the plan against the catalog before returning it.
    pub verify: bool,
}

impl GetOptions {
    /// Tracked and verified; what an execute request uses.
    pub fn execute() -> Self {
        Self {
            track: true,
            verify: true,
        }
    }
}

struct CacheEntry {
    prepared: Arc<Prepared>,
    uses: u64,
}

/// Bounded map from prepared name to plan.
pub struct PreparedCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl PreparedCache {
    /// Cache holding at most `limit` plans; a zero limit is treated as one.
    pub fn new(limit: usize) -> Self {
        let limit = NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(limit)),
        }
    }

    /// Cache sized by [`PlannerConfig::prepared_cache_limit`].
    pub fn from_config(config: &PlannerConfig) -> Self {
        Self::new(config.prepared_cache_limit)
    }

    /// Inserts or replaces a plan under its name.
    ///
    /// Anonymous plans are named after their plan hash. The encoded plan is
    /// computed when missing.
    pub fn add(&self, mut prepared: Prepared) -> Result<Arc<Prepared>> {
        if prepared.name.is_empty() {
            prepared.name = format!("{:016x}", prepared.plan_hash);
        }
        if prepared.encoded_plan.is_empty() {
            prepared.compute_encoded_plan()?;
        }
        let prepared = Arc::new(prepared);
        self.insert(Arc::clone(&prepared));
        Ok(prepared)
    }

    /// Adds a plan shipped as an encoded string from another node.
    ///
    /// A cached plan with the same name must carry the same encoding.
    pub fn add_encoded(&self, encoded: &str) -> Result<Arc<Prepared>> {
        let prepared = Prepared::decode_encoded(encoded)?;
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(&prepared.name) {
                if entry.prepared.encoded_plan != prepared.encoded_plan {
                    warn!(name = %prepared.name, "prepared.encoded_mismatch");
                    return Err(PlanError::EncodedPlanMismatch {
                        name: prepared.name.clone(),
                    });
                }
                return Ok(Arc::clone(&entry.prepared));
            }
        }
        let prepared = Arc::new(prepared);
        self.insert(Arc::clone(&prepared));
        Ok(prepared)
    }

    fn insert(&self, prepared: Arc<Prepared>) {
        let name = prepared.name.clone();
        let evicted = self.entries.lock().push(
            name.clone(),
            CacheEntry {
                prepared,
                uses: 0,
            },
        );
        debug!(name = %name, "prepared.add");
        if let Some((old, _)) = evicted {
            if old != name {
                debug!(name = %old, "prepared.evict");
            }
        }
    }

    /// Looks up `name`.
    ///
    /// With [`GetOptions::verify`] set, a plan that no longer resolves is
    /// handed to `reprepare` once; the fresh plan must verify or the lookup
    /// fails with [`PlanError::PreparedStale`].
    pub fn get<F>(
        &self,
        name: &str,
        opts: GetOptions,
        catalog: &dyn Catalog,
        reprepare: F,
    ) -> Result<Arc<Prepared>>
    where
        F: FnOnce(&Prepared) -> Result<Prepared>,
    {
        let cached = {
            let mut entries = self.entries.lock();
            let entry = if opts.track {
                entries.get_mut(name)
            } else {
                entries.peek_mut(name)
            };
            let entry = entry.ok_or_else(|| PlanError::PreparedNotFound {
                name: name.to_string(),
            })?;
            if opts.track {
                entry.uses += 1;
            }
            Arc::clone(&entry.prepared)
        };
        if !opts.verify {
            return Ok(cached);
        }

        let mut checked = Prepared::clone(&cached);
        if checked.verify(catalog) {
            return Ok(self.replace(name, &cached, checked));
        }

        info!(name, "prepared.reprepare");
        let mut fresh = reprepare(&cached)?;
        fresh.name = name.to_string();
        if !fresh.verify(catalog) {
            warn!(name, "prepared.reprepare_failed");
            return Err(PlanError::PreparedStale {
                name: name.to_string(),
            });
        }
        fresh.compute_encoded_plan()?;
        Ok(self.replace(name, &cached, fresh))
    }

    fn replace(&self, name: &str, previous: &Arc<Prepared>, next: Prepared) -> Arc<Prepared> {
        let next = Arc::new(next);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.peek_mut(name) {
            if Arc::ptr_eq(&entry.prepared, previous) {
                entry.prepared = Arc::clone(&next);
            }
        }
        next
    }

    /// Removes `name`. Returns whether it was cached.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.entries.lock().pop(name).is_some();
        if removed {
            debug!(name, "prepared.delete");
        }
        removed
    }

    /// Cached names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of cached plans.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Tracked uses of `name`.
    pub fn uses(&self, name: &str) -> Option<u64> {
        self.entries.lock().peek(name).map(|entry| entry.uses)
    }

    /// Drops every plan referencing keyspace `path` (`namespace:keyspace`).
    /// Returns how many were removed.
    pub fn invalidate_keyspace(&self, path: &str) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.prepared.keyspaces().contains(path))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            entries.pop(name);
        }
        if !stale.is_empty() {
            debug!(keyspace = path, removed = stale.len(), "prepared.invalidate");
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, IndexUsing};
    use crate::plan::{Fetch, IndexRef, KeyspaceRef, Operator, PrimaryScan, Sequence, Stream};
    use serde_json::json;
    use std::cell::Cell;

    fn plan_on(keyspace: &str) -> Operator {
        Sequence::new(vec![
            PrimaryScan::new(
                KeyspaceRef::new("default", keyspace),
                IndexRef::named("#primary", IndexUsing::Gsi),
            )
            .into(),
            Fetch::new(KeyspaceRef::new("default", keyspace), "d").into(),
            Stream::default().into(),
        ])
        .into()
    }

    fn prepared(name: &str, keyspace: &str) -> Prepared {
        Prepared::new(plan_on(keyspace), json!({"*": "*"}))
            .with_name(name)
            .with_text(format!("select * from {keyspace}"))
    }

    fn never(_: &Prepared) -> Result<Prepared> {
        panic!("reprepare not expected")
    }

    #[test]
    fn tracked_lookups_count_uses() {
        let cache = PreparedCache::new(4);
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        cache.add(prepared("p1", "orders")).expect("add");

        let plain = GetOptions::default();
        cache.get("p1", plain, &catalog, never).expect("get");
        assert_eq!(cache.uses("p1"), Some(0));
        cache
            .get("p1", GetOptions::execute(), &catalog, never)
            .expect("get");
        assert_eq!(cache.uses("p1"), Some(1));

        match cache.get("p2", plain, &catalog, never) {
            Err(PlanError::PreparedNotFound { name }) => assert_eq!(name, "p2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn least_recent_entry_is_evicted() {
        let cache = PreparedCache::new(2);
        let catalog = InMemoryCatalog::new();
        cache.add(prepared("a", "orders")).expect("add");
        cache.add(prepared("b", "orders")).expect("add");
        let track = GetOptions {
            track: true,
            verify: false,
        };
        cache.get("a", track, &catalog, never).expect("get");
        cache.add(prepared("c", "orders")).expect("add");
        assert_eq!(cache.names(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(cache.count(), 2);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
    }

    #[test]
    fn failed_verify_reprepares_once() {
        let cache = PreparedCache::new(4);
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        cache.add(prepared("p1", "missing")).expect("add");

        let calls = Cell::new(0);
        let fresh = cache
            .get("p1", GetOptions::execute(), &catalog, |_| {
                calls.set(calls.get() + 1);
                Ok(prepared("ignored", "orders"))
            })
            .expect("reprepare");
        assert_eq!(calls.get(), 1);
        assert_eq!(fresh.name, "p1");
        assert!(fresh.keyspaces().contains("default:orders"));
        assert!(!fresh.encoded_plan.is_empty());

        let cached = cache
            .get("p1", GetOptions::default(), &catalog, never)
            .expect("get");
        assert!(Arc::ptr_eq(&cached, &fresh));
    }

    #[test]
    fn reprepare_that_still_fails_is_stale() {
        let cache = PreparedCache::new(4);
        let catalog = InMemoryCatalog::new();
        cache.add(prepared("p1", "missing")).expect("add");
        let calls = Cell::new(0);
        let result = cache.get("p1", GetOptions::execute(), &catalog, |old| {
            calls.set(calls.get() + 1);
            Ok(Prepared::clone(old))
        });
        match result {
            Err(PlanError::PreparedStale { name }) => assert_eq!(name, "p1"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn encoded_plans_must_agree_by_name() {
        let source = PreparedCache::new(4);
        let shipped = source.add(prepared("p1", "orders")).expect("add");

        let target = PreparedCache::new(4);
        let added = target.add_encoded(&shipped.encoded_plan).expect("add encoded");
        assert_eq!(added.plan_hash, shipped.plan_hash);
        target.add_encoded(&shipped.encoded_plan).expect("same encoding");

        let mut other = prepared("p1", "customers");
        let encoded = other.compute_encoded_plan().expect("encode").to_string();
        match target.add_encoded(&encoded) {
            Err(PlanError::EncodedPlanMismatch { name }) => assert_eq!(name, "p1"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dropping_a_keyspace_invalidates_its_plans() {
        let cache = PreparedCache::new(8);
        cache.add(prepared("o1", "orders")).expect("add");
        cache.add(prepared("o2", "orders")).expect("add");
        cache.add(prepared("c1", "customers")).expect("add");
        assert_eq!(cache.invalidate_keyspace("default:orders"), 2);
        assert_eq!(cache.names(), vec!["c1".to_string()]);
        assert_eq!(cache.invalidate_keyspace("default:orders"), 0);
    }

    #[test]
    fn anonymous_plans_are_named_by_hash() {
        let cache = PreparedCache::from_config(&PlannerConfig::default());
        let added = cache.add(prepared("", "orders")).expect("add");
        assert_eq!(added.name.len(), 16);
        assert_eq!(cache.names(), vec![added.name.clone()]);
    }
}
