//! Leaf producers: keyspace, index, key, and value scans.

use serde_json::{Map, Value};

use crate::algebra::{ResultTerm, ValuePair};
use crate::error::Result;
use crate::expr::Expr;

use super::index_group::IndexGroupAggregates;
use super::scope::ScopeContext;
use super::span::{decode_spans, encode_spans, Span};
use super::transform::{decode_terms, encode_terms};
use super::wire::{Decoder, Encoder};
use super::{IndexRef, KeyspaceRef, Operator, OperatorCodec, OptEstimate};

/// Full scan of a keyspace through its primary index.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryScan {
    /// Scanned keyspace.
    pub keyspace: KeyspaceRef,
    /// Primary index.
    pub index: IndexRef,
    /// Pushed-down LIMIT.
    pub limit: Option<Expr>,
    /// Pushed-down OFFSET.
    pub offset: Option<Expr>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl PrimaryScan {
    /// Unlimited primary scan.
    pub fn new(keyspace: KeyspaceRef, index: IndexRef) -> Self {
        Self {
            keyspace,
            index,
            limit: None,
            offset: None,
            est: OptEstimate::default(),
        }
    }
}

impl OperatorCodec for PrimaryScan {
    const NAME: &'static str = "PrimaryScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.index(&self.index);
        enc.opt_expr("limit", self.limit.as_ref());
        enc.opt_expr("offset", self.offset.as_ref());
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        Ok(Self {
            keyspace: dec.keyspace()?,
            index: dec.index()?,
            limit: dec.opt_expr("limit", scope)?,
            offset: dec.opt_expr("offset", scope)?,
            est: dec.estimate()?,
        })
    }
}

/// Index key position and direction used to satisfy ORDER BY.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IndexKeyOrder {
    /// Key position within the index.
    pub key_pos: usize,
    /// Descending.
    pub desc: bool,
}

/// Range scan over a secondary index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexScan {
    /// Scanned keyspace.
    pub keyspace: KeyspaceRef,
    /// Alias of the keyspace term.
    pub alias: String,
    /// Index used.
    pub index: IndexRef,
    /// Key spans.
    pub spans: Vec<Span>,
    /// Expressions answered from the index entry; empty when not covering.
    pub covers: Vec<Expr>,
    /// Scan must de-duplicate document keys.
    pub distinct: bool,
    /// Pushed-down LIMIT.
    pub limit: Option<Expr>,
    /// Pushed-down OFFSET.
    pub offset: Option<Expr>,
    /// ORDER BY satisfied by index order.
    pub order: Vec<IndexKeyOrder>,
    /// Grouping pushed into the index.
    pub group_aggs: Option<IndexGroupAggregates>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl IndexScan {
    /// Non-covering scan.
    pub fn new(keyspace: KeyspaceRef, alias: impl Into<String>, index: IndexRef, spans: Vec<Span>) -> Self {
        Self {
            keyspace,
            alias: alias.into(),
            index,
            spans,
            covers: Vec::new(),
            distinct: false,
            limit: None,
            offset: None,
            order: Vec::new(),
            group_aggs: None,
            est: OptEstimate::default(),
        }
    }

    /// True when no fetch is needed after the scan.
    pub fn is_covering(&self) -> bool {
        !self.covers.is_empty()
    }
}

impl OperatorCodec for IndexScan {
    const NAME: &'static str = "IndexScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("as", &self.alias);
        enc.index(&self.index);
        enc.value("spans", encode_spans(&self.spans));
        enc.exprs("covers", &self.covers);
        enc.flag("distinct", self.distinct);
        enc.opt_expr("limit", self.limit.as_ref());
        enc.opt_expr("offset", self.offset.as_ref());
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|o| {
                    let mut obj = Map::new();
                    obj.insert("keypos".into(), Value::from(o.key_pos));
                    if o.desc {
                        obj.insert("desc".into(), Value::Bool(true));
                    }
                    Value::Object(obj)
                })
                .collect();
            enc.value("index_order", Value::Array(order));
        }
        if let Some(aggs) = &self.group_aggs {
            enc.value("index_group_aggs", aggs.encode());
        }
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        let order = dec
            .array("index_order")?
            .iter()
            .map(|item| {
                let key_pos = item
                    .get("keypos")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| dec.invalid("index_order", "entry without keypos"))?;
                let key_pos = usize::try_from(key_pos)
                    .map_err(|_| dec.invalid("index_order", format!("keypos {key_pos} out of range")))?;
                Ok(IndexKeyOrder {
                    key_pos,
                    desc: item.get("desc").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let group_aggs = match dec.raw("index_group_aggs") {
            Some(value) => Some(IndexGroupAggregates::decode(dec, "index_group_aggs", value, scope)?),
            None => None,
        };
        Ok(Self {
            keyspace: dec.keyspace()?,
            alias: dec.opt_str("as")?.unwrap_or_default(),
            index: dec.index()?,
            spans: decode_spans(dec, "spans", scope)?,
            covers: dec.exprs("covers", scope)?,
            distinct: dec.flag("distinct")?,
            limit: dec.opt_expr("limit", scope)?,
            offset: dec.opt_expr("offset", scope)?,
            order,
            group_aggs,
            est: dec.estimate()?,
        })
    }
}

macro_rules! count_scan {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Scanned keyspace.
            pub keyspace: KeyspaceRef,
            /// Alias of the keyspace term.
            pub alias: String,
            /// Index used.
            pub index: IndexRef,
            /// Key spans.
            pub spans: Vec<Span>,
            /// Covered expressions.
            pub covers: Vec<Expr>,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.keyspace(&self.keyspace);
                enc.str("as", &self.alias);
                enc.index(&self.index);
                enc.value("spans", encode_spans(&self.spans));
                enc.exprs("covers", &self.covers);
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let scope = scope.as_deref();
                Ok(Self {
                    keyspace: dec.keyspace()?,
                    alias: dec.opt_str("as")?.unwrap_or_default(),
                    index: dec.index()?,
                    spans: decode_spans(dec, "spans", scope)?,
                    covers: dec.exprs("covers", scope)?,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

count_scan!(IndexCountScan, "IndexCountScan", "Counts index entries inside the spans.");
count_scan!(
    IndexCountDistinctScan,
    "IndexCountDistinctScan",
    "Counts distinct leading-key values inside the spans."
);

/// De-duplicates document keys produced by a secondary scan.
#[derive(Clone, Debug, PartialEq)]
pub struct DistinctScan {
    /// Wrapped scan.
    pub scan: Box<Operator>,
    /// Pushed-down LIMIT.
    pub limit: Option<Expr>,
    /// Pushed-down OFFSET.
    pub offset: Option<Expr>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for DistinctScan {
    const NAME: &'static str = "DistinctScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.opt_expr("limit", self.limit.as_ref());
        enc.opt_expr("offset", self.offset.as_ref());
        enc.child("~child", &self.scan);
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let limit = dec.opt_expr("limit", scope.as_deref())?;
        let offset = dec.opt_expr("offset", scope.as_deref())?;
        Ok(Self {
            scan: Box::new(dec.child("~child", scope.as_deref_mut())?),
            limit,
            offset,
            est: dec.estimate()?,
        })
    }
}

/// Produces document keys from a USE KEYS expression.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyScan {
    /// Key or array of keys.
    pub keys: Expr,
    /// De-duplicate keys.
    pub distinct: bool,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for KeyScan {
    const NAME: &'static str = "KeyScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.expr("keys", &self.keys);
        enc.flag("distinct", self.distinct);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            keys: dec.expr("keys", scope.as_deref())?,
            distinct: dec.flag("distinct")?,
            est: dec.estimate()?,
        })
    }
}

/// Produces INSERT VALUES rows.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueScan {
    /// Rows.
    pub values: Vec<ValuePair>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for ValueScan {
    const NAME: &'static str = "ValueScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        let rows = self
            .values
            .iter()
            .map(|pair| {
                let mut obj = Map::new();
                obj.insert("key".into(), Value::String(pair.key.canonical()));
                obj.insert("value".into(), Value::String(pair.value.canonical()));
                if let Some(options) = &pair.options {
                    obj.insert("options".into(), Value::String(options.canonical()));
                }
                Value::Object(obj)
            })
            .collect();
        enc.value("values", Value::Array(rows));
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        let text = |item: &Value, key: &str| -> Result<Option<Expr>> {
            match item.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(text)) => dec.parse_expr(text, scope).map(Some),
                Some(other) => Err(dec.invalid("values", format!("{key} must be text, found {other}"))),
            }
        };
        let values = dec
            .array("values")?
            .iter()
            .map(|item| {
                let key = text(item, "key")?.ok_or_else(|| dec.invalid("values", "row without key"))?;
                let value =
                    text(item, "value")?.ok_or_else(|| dec.invalid("values", "row without value"))?;
                Ok(ValuePair {
                    key,
                    value,
                    options: text(item, "options")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            values,
            est: dec.estimate()?,
        })
    }
}

/// Produces a single empty row; the input of FROM-less queries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DummyScan {
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for DummyScan {
    const NAME: &'static str = "DummyScan";

    fn encode_fields(&self, _enc: &mut Encoder) {}

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            est: dec.estimate()?,
        })
    }
}

/// Answers `SELECT COUNT(*) FROM ks` from keyspace metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct CountScan {
    /// Counted keyspace.
    pub keyspace: KeyspaceRef,
    /// Alias of the keyspace term.
    pub alias: String,
    /// Projection shaping the single output row.
    pub terms: Vec<ResultTerm>,
    /// RAW projection.
    pub raw: bool,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for CountScan {
    const NAME: &'static str = "CountScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("as", &self.alias);
        enc.value("result_terms", encode_terms(&self.terms));
        enc.flag("raw", self.raw);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            keyspace: dec.keyspace()?,
            alias: dec.opt_str("as")?.unwrap_or_default(),
            terms: decode_terms(dec, "result_terms", scope.as_deref())?,
            raw: dec.flag("raw")?,
            est: dec.estimate()?,
        })
    }
}

macro_rules! multi_scan {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Input scans.
            pub scans: Vec<Operator>,
            /// Pushed-down LIMIT.
            pub limit: Option<Expr>,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl $ty {
            /// Combines `scans` without a limit.
            pub fn new(scans: Vec<Operator>) -> Self {
                Self {
                    scans,
                    limit: None,
                    est: OptEstimate::default(),
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.opt_expr("limit", self.limit.as_ref());
                enc.children("~children", &self.scans);
            }

            fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let limit = dec.opt_expr("limit", scope.as_deref())?;
                Ok(Self {
                    scans: dec.children("~children", scope.as_deref_mut())?,
                    limit,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

multi_scan!(
    IntersectScan,
    "IntersectScan",
    "Keys produced by every input scan."
);
multi_scan!(
    OrderedIntersectScan,
    "OrderedIntersectScan",
    "Intersection that preserves the order of the first scan."
);

/// Keys produced by any input scan.
#[derive(Clone, Debug, PartialEq)]
pub struct UnionScan {
    /// Input scans.
    pub scans: Vec<Operator>,
    /// Pushed-down LIMIT.
    pub limit: Option<Expr>,
    /// Pushed-down OFFSET.
    pub offset: Option<Expr>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for UnionScan {
    const NAME: &'static str = "UnionScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.opt_expr("limit", self.limit.as_ref());
        enc.opt_expr("offset", self.offset.as_ref());
        enc.children("~children", &self.scans);
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let limit = dec.opt_expr("limit", scope.as_deref())?;
        let offset = dec.opt_expr("offset", scope.as_deref())?;
        Ok(Self {
            scans: dec.children("~children", scope.as_deref_mut())?,
            limit,
            offset,
            est: dec.estimate()?,
        })
    }
}

/// Produces one row per element of an expression used as a FROM term.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionScan {
    /// Source expression.
    pub expr: Expr,
    /// Term alias.
    pub alias: String,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for ExpressionScan {
    const NAME: &'static str = "ExpressionScan";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.expr("expr", &self.expr);
        enc.str("alias", &self.alias);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let expr = dec.expr("expr", scope.as_deref())?;
        let alias = dec.str("alias")?;
        if let Some(scope) = scope {
            scope.add_expr_term_alias(&alias);
        }
        Ok(Self {
            expr,
            alias,
            est: dec.estimate()?,
        })
    }
}
