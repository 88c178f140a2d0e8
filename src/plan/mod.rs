//! Operator trees: the executable form of a statement.
//!
//! Every node kind is a variant of [`Operator`]. The variant list, the
//! [`Visitor`] contract, and the decode registry are generated from one table
//! below, so adding a node kind touches all three at once.

#![forbid(unsafe_code)]

mod ddl;
mod dml;
pub mod explain;
mod framework;
mod index_group;
mod join;
pub mod keyspaces;
pub mod prepared;
pub mod registry;
mod scan;
pub mod scope;
mod setop;
pub mod span;
mod transform;
mod txn;
pub mod verify;
pub(crate) mod wire;

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use crate::catalog::{IndexHandle, IndexUsing, KeyspaceHandle};
use crate::error::{PlanError, Result};

pub use ddl::*;
pub use dml::*;
pub use explain::{ExplainNode, ExplainProp};
pub use framework::*;
pub use index_group::{IndexAggregate, IndexGroupAggregates, IndexGroupKey};
pub use join::*;
pub use keyspaces::KeyspaceCollector;
pub use prepared::Prepared;
pub use registry::{is_registered, make_operator, registered_names};
pub use scan::*;
pub use scope::{ScopeContext, ScopedSubquery, VisibleNames};
pub use setop::*;
pub use span::{spans_empty, Inclusion, Range, Span};
pub use transform::{
    Distinct, FinalGroup, FinalProject, Filter, IndexCountProject, InitialGroup, InitialProject,
    IntermediateGroup, Let, Limit, Offset, Order, WindowAggregate, With,
};
pub use txn::*;
pub use wire::{Decoder, Encoder, ESTIMATES_KEY, OPERATOR_KEY};

use registry::RegistryEntry;

/// Field-level codec implemented by every operator struct.
pub(crate) trait OperatorCodec: Sized {
    /// Registry name written under `"#operator"`.
    const NAME: &'static str;

    /// Writes the variant-specific fields; the estimate is handled by [`Operator`].
    fn encode_fields(&self, enc: &mut Encoder);

    /// Reads the variant-specific fields, registering any names the operator
    /// introduces in `scope`.
    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self>;
}

fn decode_as<T>(body: &Value, scope: Option<&mut ScopeContext<'_>>) -> Result<Operator>
where
    T: OperatorCodec + Into<Operator>,
{
    let dec = Decoder::new(T::NAME, body)?;
    T::decode_fields(&dec, scope).map(Into::into)
}

macro_rules! operators {
    (
        estimated { $( $ev:ident($ety:ty) => $evisit:ident, )* }
        plain { $( $pv:ident($pty:ty) => $pvisit:ident, )* }
    ) => {
        /// One node of an executable plan.
        #[allow(missing_docs)]
        #[derive(Clone, Debug, PartialEq)]
        pub enum Operator {
            $( $ev($ety), )*
            $( $pv($pty), )*
        }

        /// Per-variant dispatch over an operator tree.
        ///
        /// The method set is closed: every [`Operator`] variant has exactly one
        /// method here.
        #[allow(missing_docs)]
        pub trait Visitor {
            /// Value produced by each visit.
            type Output;
            $( fn $evisit(&mut self, op: &$ety) -> Self::Output; )*
            $( fn $pvisit(&mut self, op: &$pty) -> Self::Output; )*
        }

        impl Operator {
            /// Registry name of this variant.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Operator::$ev(_) => <$ety as OperatorCodec>::NAME, )*
                    $( Operator::$pv(_) => <$pty as OperatorCodec>::NAME, )*
                }
            }

            /// Dispatches to the visitor method for this variant.
            pub fn accept<V: Visitor + ?Sized>(&self, visitor: &mut V) -> V::Output {
                match self {
                    $( Operator::$ev(op) => visitor.$evisit(op), )*
                    $( Operator::$pv(op) => visitor.$pvisit(op), )*
                }
            }

            /// Optimizer estimate; `None` for variants that carry none.
            pub fn estimate(&self) -> Option<&OptEstimate> {
                match self {
                    $( Operator::$ev(op) => Some(&op.est), )*
                    _ => None,
                }
            }

            /// Mutable access to the optimizer estimate.
            pub fn estimate_mut(&mut self) -> Option<&mut OptEstimate> {
                match self {
                    $( Operator::$ev(op) => Some(&mut op.est), )*
                    _ => None,
                }
            }

            fn write_fields(&self, enc: &mut Encoder) {
                match self {
                    $(
                        Operator::$ev(op) => {
                            op.encode_fields(enc);
                            enc.estimate(&op.est);
                        }
                    )*
                    $( Operator::$pv(op) => op.encode_fields(enc), )*
                }
            }
        }

        $(
            impl From<$ety> for Operator {
                fn from(op: $ety) -> Self {
                    Operator::$ev(op)
                }
            }
        )*
        $(
            impl From<$pty> for Operator {
                fn from(op: $pty) -> Self {
                    Operator::$pv(op)
                }
            }
        )*

        pub(crate) static REGISTRY: &[RegistryEntry] = &[
            $( RegistryEntry { name: <$ety as OperatorCodec>::NAME, decode: decode_as::<$ety> }, )*
            $( RegistryEntry { name: <$pty as OperatorCodec>::NAME, decode: decode_as::<$pty> }, )*
        ];
    };
}

operators! {
    estimated {
        PrimaryScan(PrimaryScan) => visit_primary_scan,
        IndexScan(IndexScan) => visit_index_scan,
        IndexCountScan(IndexCountScan) => visit_index_count_scan,
        IndexCountDistinctScan(IndexCountDistinctScan) => visit_index_count_distinct_scan,
        DistinctScan(DistinctScan) => visit_distinct_scan,
        KeyScan(KeyScan) => visit_key_scan,
        ValueScan(ValueScan) => visit_value_scan,
        DummyScan(DummyScan) => visit_dummy_scan,
        CountScan(CountScan) => visit_count_scan,
        IntersectScan(IntersectScan) => visit_intersect_scan,
        OrderedIntersectScan(OrderedIntersectScan) => visit_ordered_intersect_scan,
        UnionScan(UnionScan) => visit_union_scan,
        ExpressionScan(ExpressionScan) => visit_expression_scan,
        Fetch(Fetch) => visit_fetch,
        Join(Join) => visit_join,
        Nest(Nest) => visit_nest,
        NestedLoopJoin(NestedLoopJoin) => visit_nested_loop_join,
        NestedLoopNest(NestedLoopNest) => visit_nested_loop_nest,
        HashJoin(HashJoin) => visit_hash_join,
        HashNest(HashNest) => visit_hash_nest,
        Unnest(Unnest) => visit_unnest,
        Let(Let) => visit_let,
        Filter(Filter) => visit_filter,
        InitialGroup(InitialGroup) => visit_initial_group,
        IntermediateGroup(IntermediateGroup) => visit_intermediate_group,
        FinalGroup(FinalGroup) => visit_final_group,
        WindowAggregate(WindowAggregate) => visit_window_aggregate,
        InitialProject(InitialProject) => visit_initial_project,
        FinalProject(FinalProject) => visit_final_project,
        IndexCountProject(IndexCountProject) => visit_index_count_project,
        Distinct(Distinct) => visit_distinct,
        Order(Order) => visit_order,
        Offset(Offset) => visit_offset,
        Limit(Limit) => visit_limit,
        UnionAll(UnionAll) => visit_union_all,
        IntersectAll(IntersectAll) => visit_intersect_all,
        ExceptAll(ExceptAll) => visit_except_all,
        Sequence(Sequence) => visit_sequence,
        Alias(Alias) => visit_alias,
        Discard(Discard) => visit_discard,
        Stream(Stream) => visit_stream,
        Collect(Collect) => visit_collect,
        Receive(Receive) => visit_receive,
    }
    plain {
        With(With) => visit_with,
        SendInsert(SendInsert) => visit_send_insert,
        SendUpsert(SendUpsert) => visit_send_upsert,
        SendUpdate(SendUpdate) => visit_send_update,
        SendDelete(SendDelete) => visit_send_delete,
        Clone(CloneDoc) => visit_clone,
        Set(Set) => visit_set,
        Unset(Unset) => visit_unset,
        Merge(Merge) => visit_merge,
        CreatePrimaryIndex(CreatePrimaryIndex) => visit_create_primary_index,
        CreateIndex(CreateIndex) => visit_create_index,
        DropIndex(DropIndex) => visit_drop_index,
        AlterIndex(AlterIndex) => visit_alter_index,
        BuildIndexes(BuildIndexes) => visit_build_indexes,
        StartTransaction(StartTransaction) => visit_start_transaction,
        CommitTransaction(CommitTransaction) => visit_commit_transaction,
        RollbackTransaction(RollbackTransaction) => visit_rollback_transaction,
        TransactionIsolation(TransactionIsolation) => visit_transaction_isolation,
        Savepoint(Savepoint) => visit_savepoint,
        Parallel(Parallel) => visit_parallel,
        Authorize(Authorize) => visit_authorize,
        Explain(Explain) => visit_explain,
    }
}

impl Operator {
    /// Encodes this tree into its wire form.
    pub fn encode(&self) -> Value {
        let mut enc = Encoder::new(self.name());
        self.write_fields(&mut enc);
        enc.finish()
    }

    /// Decodes a tree, classifying identifiers in a fresh root scope.
    pub fn decode(body: &Value) -> Result<Operator> {
        let mut scope = ScopeContext::new();
        Self::decode_with(body, Some(&mut scope)).map_err(|err| {
            debug!(code = err.code(), error = %err, "plan.decode_failed");
            err
        })
    }

    /// Decodes a tree without classifying identifiers.
    pub fn decode_unscoped(body: &Value) -> Result<Operator> {
        Self::decode_with(body, None)
    }

    pub(crate) fn decode_with(body: &Value, scope: Option<&mut ScopeContext<'_>>) -> Result<Operator> {
        let name = body
            .get(OPERATOR_KEY)
            .and_then(Value::as_str)
            .ok_or(PlanError::MissingField {
                operator: "plan",
                field: OPERATOR_KEY,
            })?;
        make_operator(name, body, scope)
    }

    /// False when running this tree can change stored data.
    pub fn readonly(&self) -> bool {
        match self {
            Operator::SendInsert(_)
            | Operator::SendUpsert(_)
            | Operator::SendUpdate(_)
            | Operator::SendDelete(_)
            | Operator::Clone(_)
            | Operator::Set(_)
            | Operator::Unset(_)
            | Operator::Merge(_)
            | Operator::CreatePrimaryIndex(_)
            | Operator::CreateIndex(_)
            | Operator::DropIndex(_)
            | Operator::AlterIndex(_)
            | Operator::BuildIndexes(_)
            | Operator::StartTransaction(_)
            | Operator::CommitTransaction(_)
            | Operator::RollbackTransaction(_)
            | Operator::TransactionIsolation(_)
            | Operator::Savepoint(_) => false,
            Operator::Explain(_) => true,
            _ => self.children().into_iter().all(Operator::readonly),
        }
    }

    /// Structural children in encoding order.
    pub fn children(&self) -> Vec<&Operator> {
        match self {
            Operator::DistinctScan(op) => vec![&*op.scan],
            Operator::IntersectScan(op) => op.scans.iter().collect(),
            Operator::OrderedIntersectScan(op) => op.scans.iter().collect(),
            Operator::UnionScan(op) => op.scans.iter().collect(),
            Operator::NestedLoopJoin(op) => vec![&*op.child],
            Operator::NestedLoopNest(op) => vec![&*op.child],
            Operator::HashJoin(op) => vec![&*op.child],
            Operator::HashNest(op) => vec![&*op.child],
            Operator::With(op) => vec![&*op.child],
            Operator::UnionAll(op) => op.children.iter().collect(),
            Operator::IntersectAll(op) => vec![&*op.first, &*op.second],
            Operator::ExceptAll(op) => vec![&*op.first, &*op.second],
            Operator::Merge(op) => [&op.update, &op.delete, &op.insert]
                .into_iter()
                .filter_map(|child| child.as_deref())
                .collect(),
            Operator::Sequence(op) => op.children.iter().collect(),
            Operator::Alias(op) => vec![&*op.child],
            Operator::Parallel(op) => vec![&*op.child],
            Operator::Authorize(op) => vec![&*op.child],
            Operator::Explain(op) => vec![&*op.child],
            _ => Vec::new(),
        }
    }

    /// Mutable structural children in encoding order.
    pub fn children_mut(&mut self) -> Vec<&mut Operator> {
        match self {
            Operator::DistinctScan(op) => vec![&mut *op.scan],
            Operator::IntersectScan(op) => op.scans.iter_mut().collect(),
            Operator::OrderedIntersectScan(op) => op.scans.iter_mut().collect(),
            Operator::UnionScan(op) => op.scans.iter_mut().collect(),
            Operator::NestedLoopJoin(op) => vec![&mut *op.child],
            Operator::NestedLoopNest(op) => vec![&mut *op.child],
            Operator::HashJoin(op) => vec![&mut *op.child],
            Operator::HashNest(op) => vec![&mut *op.child],
            Operator::With(op) => vec![&mut *op.child],
            Operator::UnionAll(op) => op.children.iter_mut().collect(),
            Operator::IntersectAll(op) => vec![&mut *op.first, &mut *op.second],
            Operator::ExceptAll(op) => vec![&mut *op.first, &mut *op.second],
            Operator::Merge(op) => [&mut op.update, &mut op.delete, &mut op.insert]
                .into_iter()
                .filter_map(|child| child.as_deref_mut())
                .collect(),
            Operator::Sequence(op) => op.children.iter_mut().collect(),
            Operator::Alias(op) => vec![&mut *op.child],
            Operator::Parallel(op) => vec![&mut *op.child],
            Operator::Authorize(op) => vec![&mut *op.child],
            Operator::Explain(op) => vec![&mut *op.child],
            _ => Vec::new(),
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Operator::node_count)
            .sum::<usize>()
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.encode().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let body = Value::deserialize(deserializer)?;
        Operator::decode(&body).map_err(serde::de::Error::custom)
    }
}

/// Optimizer annotations; each figure is absent when unknown.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct OptEstimate {
    /// Total cost.
    pub cost: Option<f64>,
    /// Output rows.
    pub cardinality: Option<f64>,
    /// Cost to the first result.
    pub fr_cost: Option<f64>,
    /// Average output document size in bytes.
    pub size: Option<i64>,
}

impl OptEstimate {
    /// Builds an estimate from raw optimizer figures, where a negative value
    /// means "not available".
    pub fn from_raw(cost: f64, cardinality: f64, size: i64, fr_cost: f64) -> Self {
        let known = |v: f64| (v >= 0.0 && v.is_finite()).then_some(v);
        Self {
            cost: known(cost),
            cardinality: known(cardinality),
            fr_cost: known(fr_cost),
            size: (size >= 0).then_some(size),
        }
    }

    /// True when nothing is known.
    pub fn is_empty(&self) -> bool {
        self.cost.is_none()
            && self.cardinality.is_none()
            && self.fr_cost.is_none()
            && self.size.is_none()
    }
}

/// Keyspace an operator reads or writes.
#[derive(Clone, Debug)]
pub struct KeyspaceRef {
    /// Namespace.
    pub namespace: String,
    /// Keyspace name.
    pub keyspace: String,
    /// Live handle, present once resolved against a catalog.
    pub handle: Option<Arc<KeyspaceHandle>>,
}

impl KeyspaceRef {
    /// Unresolved reference.
    pub fn new(namespace: impl Into<String>, keyspace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            keyspace: keyspace.into(),
            handle: None,
        }
    }

    /// Reference carrying a live handle.
    pub fn resolved(handle: Arc<KeyspaceHandle>) -> Self {
        Self {
            namespace: handle.namespace.clone(),
            keyspace: handle.name.clone(),
            handle: Some(handle),
        }
    }

    /// `namespace:keyspace`.
    pub fn path(&self) -> String {
        format!("{}:{}", self.namespace, self.keyspace)
    }
}

impl PartialEq for KeyspaceRef {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.keyspace == other.keyspace
    }
}

/// Index an operator scans or alters.
#[derive(Clone, Debug)]
pub struct IndexRef {
    /// Index name.
    pub name: String,
    /// Service-assigned id at plan time; empty when unknown.
    pub id: String,
    /// Index service.
    pub using: IndexUsing,
    /// Live handle, present once resolved against a catalog.
    pub handle: Option<Arc<IndexHandle>>,
}

impl IndexRef {
    /// Unresolved reference by name.
    pub fn named(name: impl Into<String>, using: IndexUsing) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            using,
            handle: None,
        }
    }

    /// Reference carrying a live handle.
    pub fn resolved(handle: Arc<IndexHandle>) -> Self {
        Self {
            name: handle.name.clone(),
            id: handle.id.clone(),
            using: handle.using,
            handle: Some(handle),
        }
    }
}

impl PartialEq for IndexRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.id == other.id && self.using == other.using
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use serde_json::json;

    fn orders() -> KeyspaceRef {
        KeyspaceRef::new("default", "orders")
    }

    fn scan() -> Operator {
        PrimaryScan::new(orders(), IndexRef::named("#primary", IndexUsing::Gsi)).into()
    }

    #[test]
    fn readonly_is_the_conjunction_of_children() {
        let select = Operator::from(Sequence::new(vec![
            scan(),
            Parallel::new(Filter::new(Expr::constant(true)).into(), None).into(),
        ]));
        assert!(select.readonly());

        let delete = Operator::from(Sequence::new(vec![
            scan(),
            Parallel::new(SendDelete::new(orders(), "orders").into(), None).into(),
        ]));
        assert!(!delete.readonly());

        let explained = Operator::from(Explain {
            text: "delete from orders".into(),
            child: Box::new(delete),
        });
        assert!(explained.readonly());
    }

    #[test]
    fn sequence_takes_the_last_estimate() {
        let mut last = Operator::from(Stream::default());
        if let Some(est) = last.estimate_mut() {
            est.cost = Some(4.0);
            est.cardinality = Some(10.0);
        }
        let seq = Sequence::new(vec![scan(), last]);
        assert_eq!(seq.est.cost, Some(4.0));
        assert_eq!(seq.est.cardinality, Some(10.0));
    }

    #[test]
    fn negative_figures_mean_unknown() {
        let est = OptEstimate::from_raw(-1.0, 12.0, -1, 0.5);
        assert_eq!(est.cost, None);
        assert_eq!(est.cardinality, Some(12.0));
        assert_eq!(est.size, None);
        assert_eq!(est.fr_cost, Some(0.5));
        assert!(OptEstimate::from_raw(-1.0, -1.0, -1, -1.0).is_empty());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        match Operator::decode(&json!({"#operator": "Teleport"})) {
            Err(PlanError::UnknownOperator { name }) => assert_eq!(name, "Teleport"),
            other => panic!("unexpected result: {other:?}"),
        }
        match Operator::decode(&json!({"keyspace": "orders"})) {
            Err(PlanError::MissingField { field, .. }) => assert_eq!(field, OPERATOR_KEY),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn serde_goes_through_the_wire_form() {
        let op = Operator::from(Limit::new(Expr::constant(5)));
        let text = serde_json::to_string(&op).expect("serialize");
        assert_eq!(text, r##"{"#operator":"Limit","expr":"5"}"##);
        let back: Operator = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, op);
    }

    #[test]
    fn node_count_walks_every_child() {
        let plan = Operator::from(Sequence::new(vec![
            scan(),
            Parallel::new(
                Sequence::new(vec![
                    Filter::new(Expr::constant(true)).into(),
                    FinalProject::default().into(),
                ])
                .into(),
                Some(2),
            )
            .into(),
        ]));
        assert_eq!(plan.node_count(), 6);
        assert_eq!(plan.children().len(), 2);
    }
}
