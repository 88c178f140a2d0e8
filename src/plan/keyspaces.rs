//! Keyspaces referenced by a plan.

use std::collections::BTreeSet;

use super::*;

/// Collects the `namespace:keyspace` path of every keyspace a tree touches.
#[derive(Debug, Default)]
pub struct KeyspaceCollector {
    paths: BTreeSet<String>,
}

impl KeyspaceCollector {
    /// Paths referenced by `op` and its descendants.
    pub fn collect(op: &Operator) -> BTreeSet<String> {
        let mut collector = Self::default();
        collector.walk(op);
        collector.paths
    }

    fn walk(&mut self, op: &Operator) {
        op.accept(self);
        for child in op.children() {
            self.walk(child);
        }
    }

    fn add(&mut self, keyspace: &KeyspaceRef) {
        self.paths.insert(keyspace.path());
    }
}

macro_rules! records {
    ($( $visit:ident($ty:ty) ),* $(,)?) => {
        $(
            fn $visit(&mut self, op: &$ty) {
                self.add(&op.keyspace);
            }
        )*
    };
}

macro_rules! ignores {
    ($( $visit:ident($ty:ty) ),* $(,)?) => {
        $(
            fn $visit(&mut self, _op: &$ty) {}
        )*
    };
}

impl Visitor for KeyspaceCollector {
    type Output = ();

    records!(
        visit_primary_scan(PrimaryScan),
        visit_index_scan(IndexScan),
        visit_index_count_scan(IndexCountScan),
        visit_index_count_distinct_scan(IndexCountDistinctScan),
        visit_count_scan(CountScan),
        visit_fetch(Fetch),
        visit_join(Join),
        visit_nest(Nest),
        visit_send_insert(SendInsert),
        visit_send_upsert(SendUpsert),
        visit_send_update(SendUpdate),
        visit_send_delete(SendDelete),
        visit_merge(Merge),
        visit_create_primary_index(CreatePrimaryIndex),
        visit_create_index(CreateIndex),
        visit_drop_index(DropIndex),
        visit_alter_index(AlterIndex),
        visit_build_indexes(BuildIndexes),
    );

    ignores!(
        visit_distinct_scan(DistinctScan),
        visit_key_scan(KeyScan),
        visit_value_scan(ValueScan),
        visit_dummy_scan(DummyScan),
        visit_intersect_scan(IntersectScan),
        visit_ordered_intersect_scan(OrderedIntersectScan),
        visit_union_scan(UnionScan),
        visit_expression_scan(ExpressionScan),
        visit_nested_loop_join(NestedLoopJoin),
        visit_nested_loop_nest(NestedLoopNest),
        visit_hash_join(HashJoin),
        visit_hash_nest(HashNest),
        visit_unnest(Unnest),
        visit_let(Let),
        visit_with(With),
        visit_filter(Filter),
        visit_initial_group(InitialGroup),
        visit_intermediate_group(IntermediateGroup),
        visit_final_group(FinalGroup),
        visit_window_aggregate(WindowAggregate),
        visit_initial_project(InitialProject),
        visit_final_project(FinalProject),
        visit_index_count_project(IndexCountProject),
        visit_distinct(Distinct),
        visit_order(Order),
        visit_offset(Offset),
        visit_limit(Limit),
        visit_union_all(UnionAll),
        visit_intersect_all(IntersectAll),
        visit_except_all(ExceptAll),
        visit_clone(CloneDoc),
        visit_set(Set),
        visit_unset(Unset),
        visit_start_transaction(StartTransaction),
        visit_commit_transaction(CommitTransaction),
        visit_rollback_transaction(RollbackTransaction),
        visit_transaction_isolation(TransactionIsolation),
        visit_savepoint(Savepoint),
        visit_sequence(Sequence),
        visit_parallel(Parallel),
        visit_authorize(Authorize),
        visit_alias(Alias),
        visit_discard(Discard),
        visit_stream(Stream),
        visit_collect(Collect),
        visit_receive(Receive),
        visit_explain(Explain),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexUsing;
    use crate::expr::Expr;

    #[test]
    fn paths_are_gathered_from_every_level() {
        let customers = KeyspaceRef::new("default", "customers");
        let orders = KeyspaceRef::new("default", "orders");
        let plan = Operator::from(Sequence::new(vec![
            PrimaryScan::new(orders.clone(), IndexRef::named("#primary", IndexUsing::Gsi)).into(),
            Parallel::new(
                Sequence::new(vec![
                    Fetch::new(orders, "o").into(),
                    Join::new(customers, "c", Expr::path("o", &["customer"])).into(),
                ])
                .into(),
                None,
            )
            .into(),
            Stream::default().into(),
        ]));
        let paths: Vec<_> = KeyspaceCollector::collect(&plan).into_iter().collect();
        assert_eq!(paths, vec!["default:customers", "default:orders"]);
    }
}
