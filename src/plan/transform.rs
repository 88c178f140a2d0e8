//! Row transforms: bindings, filtering, grouping, projection, and paging.

use serde_json::{Map, Value};

use crate::algebra::{ResultTerm, WithBinding};
use crate::error::Result;
use crate::expr::{Binding, Expr, SortTerm};

use super::scope::ScopeContext;
use super::wire::{Decoder, Encoder};
use super::{Operator, OperatorCodec, OptEstimate};

pub(crate) fn encode_terms(terms: &[ResultTerm]) -> Value {
    let list = terms
        .iter()
        .map(|term| {
            let mut obj = Map::new();
            if let Some(expr) = &term.expr {
                obj.insert("expr".into(), Value::String(expr.canonical()));
            }
            if term.star {
                obj.insert("star".into(), Value::Bool(true));
            }
            if let Some(alias) = &term.alias {
                obj.insert("as".into(), Value::String(alias.clone()));
            }
            Value::Object(obj)
        })
        .collect();
    Value::Array(list)
}

pub(crate) fn decode_terms(
    dec: &Decoder<'_>,
    key: &str,
    scope: Option<&ScopeContext<'_>>,
) -> Result<Vec<ResultTerm>> {
    dec.array(key)?
        .iter()
        .map(|item| {
            let expr = match item.get("expr") {
                None | Some(Value::Null) => None,
                Some(Value::String(text)) => Some(dec.parse_expr(text, scope)?),
                Some(other) => {
                    return Err(dec.invalid(key, format!("term expr must be text, found {other}")))
                }
            };
            let star = item.get("star").and_then(Value::as_bool).unwrap_or(false);
            if expr.is_none() && !star {
                return Err(dec.invalid(key, "term without expr"));
            }
            Ok(ResultTerm {
                expr,
                star,
                alias: item.get("as").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

fn encode_bindings(bindings: &[Binding]) -> Value {
    let list = bindings
        .iter()
        .map(|b| {
            let mut obj = Map::new();
            obj.insert("var".into(), Value::String(b.variable.clone()));
            obj.insert("expr".into(), Value::String(b.expr.canonical()));
            if let Some(name) = &b.name_variable {
                obj.insert("name_var".into(), Value::String(name.clone()));
            }
            if b.descend {
                obj.insert("desc".into(), Value::Bool(true));
            }
            if b.func_var {
                obj.insert("func".into(), Value::Bool(true));
            }
            Value::Object(obj)
        })
        .collect();
    Value::Array(list)
}

fn decode_bindings(dec: &Decoder<'_>, key: &str) -> Result<Vec<Binding>> {
    dec.array(key)?
        .iter()
        .map(|item| {
            let var = item
                .get("var")
                .and_then(Value::as_str)
                .ok_or_else(|| dec.invalid(key, "binding without var"))?;
            let text = item
                .get("expr")
                .and_then(Value::as_str)
                .ok_or_else(|| dec.invalid(key, "binding without expr"))?;
            let mut binding = Binding::new(var, dec.parse_expr(text, None)?);
            binding.name_variable = item
                .get("name_var")
                .and_then(Value::as_str)
                .map(str::to_string);
            binding.descend = item.get("desc").and_then(Value::as_bool).unwrap_or(false);
            binding.func_var = item.get("func").and_then(Value::as_bool).unwrap_or(false);
            Ok(binding)
        })
        .collect()
}

/// LET: introduces per-row variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Let {
    /// Bindings in declaration order.
    pub bindings: Vec<Binding>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for Let {
    const NAME: &'static str = "Let";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.value("bindings", encode_bindings(&self.bindings));
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let mut bindings = decode_bindings(dec, "bindings")?;
        if let Some(scope) = scope {
            scope.push_bindings(&mut bindings);
        }
        Ok(Self {
            bindings,
            est: dec.estimate()?,
        })
    }
}

/// WITH: evaluates statement-level aliases once, then runs the query.
#[derive(Clone, Debug, PartialEq)]
pub struct With {
    /// Aliases in declaration order.
    pub bindings: Vec<WithBinding>,
    /// Query using the aliases.
    pub child: Box<Operator>,
}

impl OperatorCodec for With {
    const NAME: &'static str = "With";

    fn encode_fields(&self, enc: &mut Encoder) {
        let list = self
            .bindings
            .iter()
            .map(|w| {
                let mut obj = Map::new();
                obj.insert("alias".into(), Value::String(w.alias.clone()));
                obj.insert("expr".into(), Value::String(w.expr.canonical()));
                Value::Object(obj)
            })
            .collect();
        enc.value("bindings", Value::Array(list));
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let mut bindings = dec
            .array("bindings")?
            .iter()
            .map(|item| {
                let field = |name: &str| {
                    item.get(name)
                        .and_then(Value::as_str)
                        .ok_or_else(|| dec.invalid("bindings", format!("binding without {name}")))
                };
                Ok(WithBinding {
                    alias: field("alias")?.to_string(),
                    expr: dec.parse_expr(field("expr")?, None)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(scope) = scope.as_deref_mut() {
            scope.add_withs(&mut bindings);
        }
        Ok(Self {
            bindings,
            child: Box::new(dec.child("~child", scope)?),
        })
    }
}

/// Drops rows whose condition is not true.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    /// Predicate.
    pub condition: Expr,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl Filter {
    /// Filter without an estimate.
    pub fn new(condition: Expr) -> Self {
        Self {
            condition,
            est: OptEstimate::default(),
        }
    }
}

impl OperatorCodec for Filter {
    const NAME: &'static str = "Filter";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.expr("condition", &self.condition);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            condition: dec.expr("condition", scope.as_deref())?,
            est: dec.estimate()?,
        })
    }
}

macro_rules! group_stage {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// GROUP BY keys.
            pub keys: Vec<Expr>,
            /// Aggregates computed by the stage.
            pub aggregates: Vec<Expr>,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl $ty {
            /// Stage over `keys` computing `aggregates`.
            pub fn new(keys: Vec<Expr>, aggregates: Vec<Expr>) -> Self {
                Self {
                    keys,
                    aggregates,
                    est: OptEstimate::default(),
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.value(
                    "group_keys",
                    Value::Array(self.keys.iter().map(|k| Value::String(k.canonical())).collect()),
                );
                enc.value(
                    "aggregates",
                    Value::Array(
                        self.aggregates
                            .iter()
                            .map(|a| Value::String(a.canonical()))
                            .collect(),
                    ),
                );
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let scope = scope.as_deref();
                Ok(Self {
                    keys: dec.exprs("group_keys", scope)?,
                    aggregates: dec.exprs("aggregates", scope)?,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

group_stage!(
    InitialGroup,
    "InitialGroup",
    "First grouping stage: builds partial aggregates per input lane."
);
group_stage!(
    IntermediateGroup,
    "IntermediateGroup",
    "Merges partial aggregates; runs per lane and again after the lanes join."
);
group_stage!(
    FinalGroup,
    "FinalGroup",
    "Finalizes aggregates and emits one row per group."
);

/// Computes window aggregates over rows sorted by partition and order keys.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowAggregate {
    /// Window aggregates sharing one sort order.
    pub aggregates: Vec<Expr>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for WindowAggregate {
    const NAME: &'static str = "WindowAggregate";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.exprs("aggregates", &self.aggregates);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            aggregates: dec.exprs("aggregates", scope.as_deref())?,
            est: dec.estimate()?,
        })
    }
}

macro_rules! projection {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Result terms in output order.
            pub terms: Vec<ResultTerm>,
            /// RAW projection.
            pub raw: bool,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl $ty {
            /// Projection of `terms`.
            pub fn new(terms: Vec<ResultTerm>, raw: bool) -> Self {
                Self {
                    terms,
                    raw,
                    est: OptEstimate::default(),
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.value("result_terms", encode_terms(&self.terms));
                enc.flag("raw", self.raw);
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                Ok(Self {
                    terms: decode_terms(dec, "result_terms", scope.as_deref())?,
                    raw: dec.flag("raw")?,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

projection!(
    InitialProject,
    "InitialProject",
    "Evaluates result terms; output is finished by [`FinalProject`]."
);
projection!(
    IndexCountProject,
    "IndexCountProject",
    "Projects the count produced by an index count scan."
);

macro_rules! marker_op {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, Default, PartialEq)]
        pub struct $ty {
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, _enc: &mut Encoder) {}

            fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                Ok(Self {
                    est: dec.estimate()?,
                })
            }
        }
    };
}

pub(crate) use marker_op;

marker_op!(
    FinalProject,
    "FinalProject",
    "Shapes projected values into result rows."
);
marker_op!(Distinct, "Distinct", "Removes duplicate rows.");

/// Sorts rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    /// Sort keys.
    pub terms: Vec<SortTerm>,
    /// OFFSET known to the sort, for top-N.
    pub offset: Option<Expr>,
    /// LIMIT known to the sort, for top-N.
    pub limit: Option<Expr>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl Order {
    /// Full sort on `terms`.
    pub fn new(terms: Vec<SortTerm>) -> Self {
        Self {
            terms,
            offset: None,
            limit: None,
            est: OptEstimate::default(),
        }
    }
}

impl OperatorCodec for Order {
    const NAME: &'static str = "Order";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.sort_terms("sort_terms", &self.terms);
        enc.opt_expr("offset", self.offset.as_ref());
        enc.opt_expr("limit", self.limit.as_ref());
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        Ok(Self {
            terms: dec.sort_terms("sort_terms", scope)?,
            offset: dec.opt_expr("offset", scope)?,
            limit: dec.opt_expr("limit", scope)?,
            est: dec.estimate()?,
        })
    }
}

macro_rules! paging {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Row count expression.
            pub expr: Expr,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl $ty {
            /// Paging by `expr`.
            pub fn new(expr: Expr) -> Self {
                Self {
                    expr,
                    est: OptEstimate::default(),
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.expr("expr", &self.expr);
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                Ok(Self {
                    expr: dec.expr("expr", scope.as_deref())?,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

paging!(Offset, "Offset", "Skips leading rows.");
paging!(Limit, "Limit", "Stops after a number of rows.");
