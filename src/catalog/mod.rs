//! Catalog lookups consumed by the builder and by plan verification.
//!
//! Handles carry a `uid` that is assigned when the underlying object is
//! created. Dropping and recreating an object under the same name yields a
//! handle with a fresh `uid`, which is how verification notices that a cached
//! plan points at a stale object.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::config::DEFAULT_NAMESPACE;
use crate::error::{PlanError, Result};

/// Index service an index lives in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexUsing {
    /// Global secondary index.
    #[default]
    Gsi,
    /// View index.
    View,
    /// Full-text index.
    Fts,
}

impl IndexUsing {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            IndexUsing::Gsi => "gsi",
            IndexUsing::View => "view",
            IndexUsing::Fts => "fts",
        }
    }

    /// Parses the wire spelling.
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "gsi" | "default" | "" => Some(IndexUsing::Gsi),
            "view" => Some(IndexUsing::View),
            "fts" => Some(IndexUsing::Fts),
            _ => None,
        }
    }
}

impl fmt::Display for IndexUsing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live keyspace handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyspaceHandle {
    /// Namespace.
    pub namespace: String,
    /// Keyspace name.
    pub name: String,
    /// Identity of the underlying object.
    pub uid: u64,
}

impl KeyspaceHandle {
    /// `namespace:name`.
    pub fn path(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }
}

/// Live index handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexHandle {
    /// Namespace of the indexed keyspace.
    pub namespace: String,
    /// Indexed keyspace.
    pub keyspace: String,
    /// Index name.
    pub name: String,
    /// Service-assigned identifier, regenerated on recreate.
    pub id: String,
    /// Identity of the underlying object.
    pub uid: u64,
    /// Primary index.
    pub primary: bool,
    /// Key paths relative to the document, leading key first.
    pub keys: Vec<String>,
    /// Index service.
    pub using: IndexUsing,
}

/// Name-to-handle resolution.
pub trait Catalog: Send + Sync {
    /// Resolves a keyspace.
    fn keyspace(&self, namespace: &str, keyspace: &str) -> Result<Arc<KeyspaceHandle>>;

    /// Lists every index on a keyspace, primary included, ordered by name.
    fn indexes(&self, namespace: &str, keyspace: &str) -> Result<Vec<Arc<IndexHandle>>>;

    /// Resolves an index by name.
    fn index(&self, namespace: &str, keyspace: &str, name: &str) -> Result<Arc<IndexHandle>> {
        self.indexes(namespace, keyspace)?
            .into_iter()
            .find(|index| index.name == name)
            .ok_or_else(|| PlanError::IndexNotFound {
                keyspace: format!("{namespace}:{keyspace}"),
                index: name.to_string(),
            })
    }

    /// Primary index, if one exists.
    fn primary_index(&self, namespace: &str, keyspace: &str) -> Result<Option<Arc<IndexHandle>>> {
        Ok(self
            .indexes(namespace, keyspace)?
            .into_iter()
            .find(|index| index.primary))
    }
}

struct KeyspaceEntry {
    handle: Arc<KeyspaceHandle>,
    indexes: BTreeMap<String, Arc<IndexHandle>>,
}

/// Catalog held in memory; used by tests, tooling, and embedded hosts.
pub struct InMemoryCatalog {
    keyspaces: RwLock<FxHashMap<(String, String), KeyspaceEntry>>,
    next_uid: AtomicU64,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self {
            keyspaces: RwLock::new(FxHashMap::default()),
            next_uid: AtomicU64::new(1),
        }
    }

    fn uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a keyspace, or returns the existing one.
    pub fn create_keyspace(&self, namespace: &str, name: &str) -> Arc<KeyspaceHandle> {
        let mut keyspaces = self.keyspaces.write();
        let key = (namespace.to_string(), name.to_string());
        if let Some(entry) = keyspaces.get(&key) {
            return Arc::clone(&entry.handle);
        }
        let handle = Arc::new(KeyspaceHandle {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: self.uid(),
        });
        debug!(keyspace = %handle.path(), uid = handle.uid, "catalog.create_keyspace");
        keyspaces.insert(
            key,
            KeyspaceEntry {
                handle: Arc::clone(&handle),
                indexes: BTreeMap::new(),
            },
        );
        handle
    }

    /// Drops a keyspace and its indexes. Returns whether it existed.
    pub fn drop_keyspace(&self, namespace: &str, name: &str) -> bool {
        let removed = self
            .keyspaces
            .write()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();
        debug!(namespace, keyspace = name, removed, "catalog.drop_keyspace");
        removed
    }

    /// Creates the primary index `name` on an existing keyspace.
    pub fn create_primary_index(
        &self,
        namespace: &str,
        keyspace: &str,
        name: &str,
    ) -> Result<Arc<IndexHandle>> {
        self.insert_index(namespace, keyspace, name, true, Vec::new())
    }

    /// Creates a secondary index over `keys` on an existing keyspace.
    pub fn create_index(
        &self,
        namespace: &str,
        keyspace: &str,
        name: &str,
        keys: &[&str],
    ) -> Result<Arc<IndexHandle>> {
        let keys = keys.iter().map(|key| key.to_string()).collect();
        self.insert_index(namespace, keyspace, name, false, keys)
    }

    fn insert_index(
        &self,
        namespace: &str,
        keyspace: &str,
        name: &str,
        primary: bool,
        keys: Vec<String>,
    ) -> Result<Arc<IndexHandle>> {
        let mut keyspaces = self.keyspaces.write();
        let entry = keyspaces
            .get_mut(&(namespace.to_string(), keyspace.to_string()))
            .ok_or_else(|| PlanError::KeyspaceNotFound {
                namespace: namespace.to_string(),
                keyspace: keyspace.to_string(),
            })?;
        let uid = self.uid();
        let handle = Arc::new(IndexHandle {
            namespace: namespace.to_string(),
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            id: format!("{uid:016x}"),
            uid,
            primary,
            keys,
            using: IndexUsing::Gsi,
        });
        debug!(keyspace, index = name, primary, uid, "catalog.create_index");
        entry.indexes.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops an index. Returns whether it existed.
    pub fn drop_index(&self, namespace: &str, keyspace: &str, name: &str) -> bool {
        let mut keyspaces = self.keyspaces.write();
        keyspaces
            .get_mut(&(namespace.to_string(), keyspace.to_string()))
            .and_then(|entry| entry.indexes.remove(name))
            .is_some()
    }

    /// Adds a keyspace in the default namespace.
    pub fn with_keyspace(self, name: &str) -> Self {
        self.create_keyspace(DEFAULT_NAMESPACE, name);
        self
    }

    /// Adds a keyspace in the default namespace with a `#primary` index.
    pub fn with_primary_index(self, keyspace: &str) -> Self {
        self.create_keyspace(DEFAULT_NAMESPACE, keyspace);
        // Keyspace was created above, so the insert cannot miss.
        let _ = self.create_primary_index(DEFAULT_NAMESPACE, keyspace, "#primary");
        self
    }

    /// Adds a secondary index in the default namespace.
    pub fn with_index(self, keyspace: &str, name: &str, keys: &[&str]) -> Self {
        self.create_keyspace(DEFAULT_NAMESPACE, keyspace);
        let _ = self.create_index(DEFAULT_NAMESPACE, keyspace, name, keys);
        self
    }

    /// Builds a catalog from its TOML description.
    pub fn from_description(description: &CatalogDescription) -> Result<Self> {
        let catalog = Self::new();
        for ks in &description.keyspace {
            let namespace = ks.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
            catalog.create_keyspace(namespace, &ks.name);
            if let Some(primary) = &ks.primary_index {
                catalog.create_primary_index(namespace, &ks.name, primary)?;
            }
            for index in &ks.index {
                let keys: Vec<&str> = index.keys.iter().map(String::as_str).collect();
                catalog.create_index(namespace, &ks.name, &index.name, &keys)?;
            }
        }
        Ok(catalog)
    }
}

impl Catalog for InMemoryCatalog {
    fn keyspace(&self, namespace: &str, keyspace: &str) -> Result<Arc<KeyspaceHandle>> {
        self.keyspaces
            .read()
            .get(&(namespace.to_string(), keyspace.to_string()))
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| PlanError::KeyspaceNotFound {
                namespace: namespace.to_string(),
                keyspace: keyspace.to_string(),
            })
    }

    fn indexes(&self, namespace: &str, keyspace: &str) -> Result<Vec<Arc<IndexHandle>>> {
        self.keyspaces
            .read()
            .get(&(namespace.to_string(), keyspace.to_string()))
            .map(|entry| entry.indexes.values().cloned().collect())
            .ok_or_else(|| PlanError::KeyspaceNotFound {
                namespace: namespace.to_string(),
                keyspace: keyspace.to_string(),
            })
    }
}

/// TOML description of a catalog:
///
/// ```toml
/// [[keyspace]]
/// name = "orders"
/// primary_index = "#primary"
///
/// [[keyspace.index]]
/// name = "idx_city"
/// keys = ["city"]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct CatalogDescription {
    /// Keyspaces.
    #[serde(default)]
    pub keyspace: Vec<KeyspaceDescription>,
}

impl CatalogDescription {
    /// Parses the TOML form.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| PlanError::Config {
            reason: format!("invalid catalog description: {err}"),
        })
    }
}

/// One `[[keyspace]]` entry.
#[derive(Debug, Deserialize)]
pub struct KeyspaceDescription {
    /// Namespace; defaults to `default`.
    pub namespace: Option<String>,
    /// Keyspace name.
    pub name: String,
    /// Primary index name.
    pub primary_index: Option<String>,
    /// Secondary indexes.
    #[serde(default)]
    pub index: Vec<IndexDescription>,
}

/// One `[[keyspace.index]]` entry.
#[derive(Debug, Deserialize)]
pub struct IndexDescription {
    /// Index name.
    pub name: String,
    /// Key paths.
    pub keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recreate_assigns_new_uid() {
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        let before = catalog.keyspace("default", "orders").expect("keyspace");
        assert!(catalog.drop_keyspace("default", "orders"));
        let err = catalog.keyspace("default", "orders").expect_err("dropped");
        assert_eq!(err.code(), "KeyspaceNotFound");
        let after = catalog.create_keyspace("default", "orders");
        assert_ne!(before.uid, after.uid);
        assert!(catalog
            .primary_index("default", "orders")
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn index_lookup_by_name() {
        let catalog = InMemoryCatalog::new()
            .with_primary_index("orders")
            .with_index("orders", "idx_city", &["city"]);
        let index = catalog
            .index("default", "orders", "idx_city")
            .expect("index");
        assert_eq!(index.keys, vec!["city".to_string()]);
        assert!(!index.primary);
        let err = catalog
            .index("default", "orders", "missing")
            .expect_err("no such index");
        assert_eq!(err.code(), "IndexNotFound");
    }

    #[test]
    fn description_round_trip() {
        let description = CatalogDescription::from_toml_str(
            r##"
            [[keyspace]]
            name = "orders"
            primary_index = "#primary"

            [[keyspace.index]]
            name = "idx_city"
            keys = ["city", "zip"]

            [[keyspace]]
            namespace = "archive"
            name = "events"
            "##,
        )
        .expect("parse");
        let catalog = InMemoryCatalog::from_description(&description).expect("catalog");
        assert_eq!(catalog.indexes("default", "orders").expect("indexes").len(), 2);
        assert!(catalog.keyspace("archive", "events").is_ok());
    }
}
