//! Grouping and aggregation pushed down into an index scan.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::Result;
use crate::expr::{AggregateFunc, Expr};

use super::scope::ScopeContext;
use super::wire::Decoder;

/// Index entry positions an expression depends on.
pub type Depends = SmallVec<[usize; 4]>;

/// One group key computed by the index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexGroupKey {
    /// Position of the key in the index entry returned to the planner.
    pub id: usize,
    /// Index key position the group key maps to, or -1 when computed.
    pub key_pos: i64,
    /// Group key expression.
    pub expr: Expr,
    /// Index keys the expression reads.
    pub depends: Depends,
}

/// One aggregate computed by the index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexAggregate {
    /// Aggregate function.
    pub func: AggregateFunc,
    /// Position of the aggregate in the returned entry.
    pub id: usize,
    /// Index key position the operand maps to, or -1 when computed.
    pub key_pos: i64,
    /// Operand; `None` for `count(*)`.
    pub expr: Option<Expr>,
    /// DISTINCT aggregate.
    pub distinct: bool,
    /// Index keys the operand reads.
    pub depends: Depends,
}

/// Grouping work delegated to the index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexGroupAggregates {
    /// Label used in explain output.
    pub name: String,
    /// Group keys.
    pub group: Vec<IndexGroupKey>,
    /// Aggregates.
    pub aggregates: Vec<IndexAggregate>,
    /// Index keys referenced anywhere in the pushdown.
    pub depends: Vec<usize>,
    /// The index returns partial aggregates that still need a final group.
    pub partial: bool,
    /// Document ids are distinct per group.
    pub distinct_doc_id: bool,
}

impl IndexGroupAggregates {
    /// True when every dependency of keys and aggregates is in `available`.
    pub fn is_computable(&self, available: &[usize]) -> bool {
        let ok = |deps: &Depends| deps.iter().all(|d| available.contains(d));
        self.group.iter().all(|k| ok(&k.depends)) && self.aggregates.iter().all(|a| ok(&a.depends))
    }

    /// True when the pushdown needs no grouping stage above the scan.
    pub fn is_complete(&self) -> bool {
        !self.partial
    }

    pub(crate) fn encode(&self) -> Value {
        let raw = RawGroupAggs {
            name: self.name.clone(),
            group: self
                .group
                .iter()
                .map(|k| RawGroupKey {
                    id: k.id,
                    keypos: k.key_pos,
                    expr: k.expr.canonical(),
                    depends: k.depends.to_vec(),
                })
                .collect(),
            aggregates: self
                .aggregates
                .iter()
                .map(|a| RawAggregate {
                    aggregate: a.func.name().to_ascii_uppercase(),
                    id: a.id,
                    keypos: a.key_pos,
                    expr: a.expr.as_ref().map(Expr::canonical).unwrap_or_default(),
                    distinct: a.distinct,
                    depends: a.depends.to_vec(),
                })
                .collect(),
            depends: self.depends.clone(),
            partial: self.partial,
            distinctdocid: self.distinct_doc_id,
        };
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }

    pub(crate) fn decode(
        dec: &Decoder<'_>,
        key: &str,
        value: &Value,
        scope: Option<&ScopeContext<'_>>,
    ) -> Result<Self> {
        let raw: RawGroupAggs = serde_json::from_value(value.clone())
            .map_err(|err| dec.invalid(key, err.to_string()))?;
        let group = raw
            .group
            .into_iter()
            .map(|k| {
                Ok(IndexGroupKey {
                    id: k.id,
                    key_pos: k.keypos,
                    expr: dec.parse_expr(&k.expr, scope)?,
                    depends: k.depends.into_iter().collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let aggregates = raw
            .aggregates
            .into_iter()
            .map(|a| {
                let func = AggregateFunc::from_name(&a.aggregate)
                    .ok_or_else(|| dec.invalid(key, format!("unknown aggregate '{}'", a.aggregate)))?;
                let expr = if a.expr.is_empty() {
                    None
                } else {
                    Some(dec.parse_expr(&a.expr, scope)?)
                };
                Ok(IndexAggregate {
                    func,
                    id: a.id,
                    key_pos: a.keypos,
                    expr,
                    distinct: a.distinct,
                    depends: a.depends.into_iter().collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: raw.name,
            group,
            aggregates,
            depends: raw.depends,
            partial: raw.partial,
            distinct_doc_id: raw.distinctdocid,
        })
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

#[derive(Serialize, Deserialize)]
struct RawGroupKey {
    id: usize,
    keypos: i64,
    expr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct RawAggregate {
    aggregate: String,
    id: usize,
    keypos: i64,
    #[serde(default)]
    expr: String,
    #[serde(default, skip_serializing_if = "is_false")]
    distinct: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct RawGroupAggs {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    group: Vec<RawGroupKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    aggregates: Vec<RawAggregate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends: Vec<usize>,
    #[serde(default, skip_serializing_if = "is_false")]
    partial: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    distinctdocid: bool,
}
