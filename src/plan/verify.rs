//! Re-resolution of catalog references held by a decoded plan.
//!
//! A cached plan may outlive the objects it was built against. Verification
//! looks every keyspace and index up again by name: a recreated object
//! replaces the cached handle, a missing one fails the plan. Failure is a
//! signal to rebuild from source text, not an error.

use tracing::debug;

use crate::catalog::Catalog;

use super::{IndexRef, KeyspaceRef, Operator};

impl KeyspaceRef {
    /// Re-resolves this keyspace; false when it no longer exists.
    pub fn verify(&mut self, catalog: &dyn Catalog) -> bool {
        match catalog.keyspace(&self.namespace, &self.keyspace) {
            Ok(handle) => {
                if let Some(old) = &self.handle {
                    if old.uid != handle.uid {
                        debug!(
                            keyspace = %self.path(),
                            old_uid = old.uid,
                            new_uid = handle.uid,
                            "plan.verify.keyspace_replaced"
                        );
                    }
                }
                self.handle = Some(handle);
                true
            }
            Err(err) => {
                debug!(keyspace = %self.path(), error = %err, "plan.verify.keyspace_missing");
                false
            }
        }
    }
}

impl IndexRef {
    /// Re-resolves this index on `keyspace`; false when it no longer exists.
    pub fn verify(&mut self, keyspace: &KeyspaceRef, catalog: &dyn Catalog) -> bool {
        match catalog.index(&keyspace.namespace, &keyspace.keyspace, &self.name) {
            Ok(handle) => {
                if !self.id.is_empty() && self.id != handle.id {
                    debug!(
                        keyspace = %keyspace.path(),
                        index = %self.name,
                        old_id = %self.id,
                        new_id = %handle.id,
                        "plan.verify.index_replaced"
                    );
                }
                self.id = handle.id.clone();
                self.using = handle.using;
                self.handle = Some(handle);
                true
            }
            Err(err) => {
                debug!(
                    keyspace = %keyspace.path(),
                    index = %self.name,
                    error = %err,
                    "plan.verify.index_missing"
                );
                false
            }
        }
    }
}

fn keyspace_and_index(keyspace: &mut KeyspaceRef, index: &mut IndexRef, catalog: &dyn Catalog) -> bool {
    keyspace.verify(catalog) && index.verify(keyspace, catalog)
}

impl Operator {
    /// Re-resolves every keyspace and index in the tree, stopping at the
    /// first one that is gone.
    pub fn verify(&mut self, catalog: &dyn Catalog) -> bool {
        let own = match self {
            Operator::PrimaryScan(op) => keyspace_and_index(&mut op.keyspace, &mut op.index, catalog),
            Operator::IndexScan(op) => keyspace_and_index(&mut op.keyspace, &mut op.index, catalog),
            Operator::IndexCountScan(op) => {
                keyspace_and_index(&mut op.keyspace, &mut op.index, catalog)
            }
            Operator::IndexCountDistinctScan(op) => {
                keyspace_and_index(&mut op.keyspace, &mut op.index, catalog)
            }
            Operator::DropIndex(op) => keyspace_and_index(&mut op.keyspace, &mut op.index, catalog),
            Operator::AlterIndex(op) => keyspace_and_index(&mut op.keyspace, &mut op.index, catalog),
            Operator::CountScan(op) => op.keyspace.verify(catalog),
            Operator::Fetch(op) => op.keyspace.verify(catalog),
            Operator::Join(op) => op.keyspace.verify(catalog),
            Operator::Nest(op) => op.keyspace.verify(catalog),
            Operator::SendInsert(op) => op.keyspace.verify(catalog),
            Operator::SendUpsert(op) => op.keyspace.verify(catalog),
            Operator::SendUpdate(op) => op.keyspace.verify(catalog),
            Operator::SendDelete(op) => op.keyspace.verify(catalog),
            Operator::Merge(op) => op.keyspace.verify(catalog),
            Operator::CreatePrimaryIndex(op) => op.keyspace.verify(catalog),
            Operator::CreateIndex(op) => op.keyspace.verify(catalog),
            Operator::BuildIndexes(op) => op.keyspace.verify(catalog),
            _ => true,
        };
        own && self
            .children_mut()
            .into_iter()
            .all(|child| child.verify(catalog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{IndexUsing, InMemoryCatalog};
    use crate::plan::{Fetch, Parallel, PrimaryScan, Sequence};

    fn plan() -> Operator {
        Sequence::new(vec![
            PrimaryScan::new(
                KeyspaceRef::new("default", "orders"),
                IndexRef::named("#primary", IndexUsing::Gsi),
            )
            .into(),
            Parallel::new(
                Fetch::new(KeyspaceRef::new("default", "orders"), "o").into(),
                None,
            )
            .into(),
        ])
        .into()
    }

    fn fetch_uid(op: &Operator) -> Option<u64> {
        match op {
            Operator::Fetch(fetch) => fetch.keyspace.handle.as_ref().map(|h| h.uid),
            other => other.children().into_iter().find_map(fetch_uid),
        }
    }

    #[test]
    fn recreated_keyspace_replaces_the_handle() {
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        let mut op = plan();
        assert!(op.verify(&catalog));
        let first = fetch_uid(&op).expect("resolved");

        catalog.drop_keyspace("default", "orders");
        assert!(!op.verify(&catalog));

        catalog.create_keyspace("default", "orders");
        catalog
            .create_primary_index("default", "orders", "#primary")
            .expect("index");
        assert!(op.verify(&catalog));
        let second = fetch_uid(&op).expect("resolved");
        assert_ne!(first, second);
    }

    #[test]
    fn dropped_index_fails() {
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        let mut op = plan();
        assert!(op.verify(&catalog));
        catalog.drop_index("default", "orders", "#primary");
        assert!(!op.verify(&catalog));
    }

    #[test]
    fn index_id_follows_the_catalog() {
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        let mut index = IndexRef::named("#primary", IndexUsing::Gsi);
        index.id = "stale".into();
        let keyspace = KeyspaceRef::new("default", "orders");
        assert!(index.verify(&keyspace, &catalog));
        assert_ne!(index.id, "stale");
        assert!(index.handle.is_some());
    }
}
