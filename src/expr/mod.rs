//! Expression trees carried by plan operators.
//!
//! Operators never serialize expressions structurally: they store the
//! canonical text produced by [`Expr`]'s `Display` implementation and re-parse
//! it with [`parse`] on decode. The printer is fully parenthesized so that the
//! text re-parses to an expression with identical canonical text.

#![forbid(unsafe_code)]

mod collate;
mod parse;
mod print;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::algebra::Select;

pub use collate::{collate, collate_bounds};
pub use parse::{parse, parse_select};
pub(crate) use print::write_ident as print_ident;

/// Classification of an identifier against the scope it occurs in.
///
/// The classification is metadata only; it never changes canonical text.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum IdentKind {
    /// Not found in any scope; resolved against the document at execution.
    #[default]
    Unresolved,
    /// Refers to a statement-level `WITH` alias.
    With,
    /// Refers to a binding variable introduced by LET, a quantifier, or a comprehension.
    Variable {
        /// Binding expression is constant.
        static_var: bool,
        /// Binding is a function parameter.
        func_var: bool,
    },
    /// Refers to a FROM-clause alias.
    Alias(AliasKind),
}

impl IdentKind {
    /// Wire name of the classification.
    pub fn as_str(self) -> &'static str {
        match self {
            IdentKind::Unresolved => "unresolved",
            IdentKind::With => "with",
            IdentKind::Variable {
                static_var: false,
                func_var: false,
            } => "variable",
            IdentKind::Variable {
                static_var: true,
                func_var: false,
            } => "static_variable",
            IdentKind::Variable {
                static_var: false,
                func_var: true,
            } => "function_variable",
            IdentKind::Variable {
                static_var: true,
                func_var: true,
            } => "static_function_variable",
            IdentKind::Alias(AliasKind::Keyspace) => "keyspace",
            IdentKind::Alias(AliasKind::Unnest) => "unnest",
            IdentKind::Alias(AliasKind::ExpressionTerm) => "expression_term",
            IdentKind::Alias(AliasKind::SubqueryTerm) => "subquery_term",
        }
    }

    /// Inverse of [`IdentKind::as_str`].
    pub fn parse(text: &str) -> Option<Self> {
        let variable = |static_var, func_var| IdentKind::Variable {
            static_var,
            func_var,
        };
        Some(match text {
            "unresolved" => IdentKind::Unresolved,
            "with" => IdentKind::With,
            "variable" => variable(false, false),
            "static_variable" => variable(true, false),
            "function_variable" => variable(false, true),
            "static_function_variable" => variable(true, true),
            "keyspace" => IdentKind::Alias(AliasKind::Keyspace),
            "unnest" => IdentKind::Alias(AliasKind::Unnest),
            "expression_term" => IdentKind::Alias(AliasKind::ExpressionTerm),
            "subquery_term" => IdentKind::Alias(AliasKind::SubqueryTerm),
            _ => return None,
        })
    }
}

/// Kind of FROM-clause alias an identifier resolved to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// Plain keyspace term.
    Keyspace,
    /// UNNEST alias.
    Unnest,
    /// Expression term in FROM.
    ExpressionTerm,
    /// Sub-query term in FROM.
    SubqueryTerm,
}

/// Identifier occurrence.
#[derive(Clone, Debug, PartialEq)]
pub struct Identifier {
    /// Identifier text.
    pub name: String,
    /// Scope classification.
    pub kind: IdentKind,
}

impl Identifier {
    /// Creates an unresolved identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IdentKind::Unresolved,
        }
    }
}

#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Like,
    NotLike,
    In,
    NotIn,
}

impl BinaryOp {
    /// Canonical operator spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "||",
            BinaryOp::Like => "like",
            BinaryOp::NotLike => "not like",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
        }
    }

    /// Operator with operands swapped, for comparisons.
    pub fn flipped(self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Eq),
            BinaryOp::Lt => Some(BinaryOp::Gt),
            BinaryOp::Le => Some(BinaryOp::Ge),
            BinaryOp::Gt => Some(BinaryOp::Lt),
            BinaryOp::Ge => Some(BinaryOp::Le),
            _ => None,
        }
    }
}

/// Postfix `IS` tests.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IsOp {
    Null,
    NotNull,
    Missing,
    NotMissing,
    Valued,
    NotValued,
}

impl IsOp {
    fn keyword(self) -> &'static str {
        match self {
            IsOp::Null => "is null",
            IsOp::NotNull => "is not null",
            IsOp::Missing => "is missing",
            IsOp::NotMissing => "is not missing",
            IsOp::Valued => "is valued",
            IsOp::NotValued => "is not valued",
        }
    }
}

/// Aggregate functions recognized by the grouping stages.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    Count,
    CountN,
    Sum,
    Avg,
    Min,
    Max,
    ArrayAgg,
}

impl AggregateFunc {
    /// Function name as printed.
    pub fn name(self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::CountN => "countn",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::ArrayAgg => "array_agg",
        }
    }

    /// Looks up an aggregate by (case-insensitive) name.
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name.to_ascii_lowercase().as_str() {
            "count" => AggregateFunc::Count,
            "countn" => AggregateFunc::CountN,
            "sum" => AggregateFunc::Sum,
            "avg" => AggregateFunc::Avg,
            "min" => AggregateFunc::Min,
            "max" => AggregateFunc::Max,
            "array_agg" => AggregateFunc::ArrayAgg,
            _ => return None,
        };
        Some(func)
    }
}

/// Sort key used by ORDER BY, window clauses, and index order pushdown.
#[derive(Clone, Debug, PartialEq)]
pub struct SortTerm {
    /// Key expression.
    pub expr: Expr,
    /// Descending order.
    pub descending: bool,
    /// `Some(true)` for NULLS FIRST, `Some(false)` for NULLS LAST.
    pub nulls_first: Option<bool>,
}

impl SortTerm {
    /// Ascending sort on `expr`.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            descending: false,
            nulls_first: None,
        }
    }

    /// Descending sort on `expr`.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            descending: true,
            nulls_first: None,
        }
    }
}

/// `OVER (...)` clause of a window aggregate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WindowSpec {
    /// PARTITION BY keys.
    pub partition_by: Vec<Expr>,
    /// ORDER BY keys.
    pub order_by: Vec<SortTerm>,
}

/// Aggregate function application.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    /// Function.
    pub func: AggregateFunc,
    /// Operand; `None` only for `count(*)`.
    pub operand: Option<Box<Expr>>,
    /// DISTINCT modifier.
    pub distinct: bool,
    /// Window clause; windowed aggregates are not grouping aggregates.
    pub window: Option<WindowSpec>,
}

/// Quantifier flavours.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QuantifierKind {
    Any,
    Every,
    AnyAndEvery,
}

/// Comprehension flavours producing an array or its first element.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ComprehensionKind {
    Array,
    First,
}

/// Variable binding introduced by quantifiers, comprehensions, and LET.
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    /// Companion variable receiving the position or attribute name.
    pub name_variable: Option<String>,
    /// Bound variable.
    pub variable: String,
    /// Source expression.
    pub expr: Expr,
    /// `WITHIN` (recursive descent) rather than `IN`.
    pub descend: bool,
    /// Source expression is constant.
    pub static_var: bool,
    /// Variable is a function parameter.
    pub func_var: bool,
}

impl Binding {
    /// Creates an `IN` binding.
    pub fn new(variable: impl Into<String>, expr: Expr) -> Self {
        let static_var = expr.is_static();
        Self {
            name_variable: None,
            variable: variable.into(),
            expr,
            descend: false,
            static_var,
            func_var: false,
        }
    }

    /// Marks the variable as a function parameter.
    pub fn function_param(mut self) -> Self {
        self.func_var = true;
        self
    }

    /// Adds a companion name variable.
    pub fn with_name_variable(mut self, name: impl Into<String>) -> Self {
        self.name_variable = Some(name.into());
        self
    }

    /// Marks the binding as `WITHIN`.
    pub fn within(mut self) -> Self {
        self.descend = true;
        self
    }
}

/// `ANY` / `EVERY` / `ANY AND EVERY`.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct Quantified {
    pub kind: QuantifierKind,
    pub bindings: Vec<Binding>,
    pub satisfies: Expr,
}

/// `ARRAY ... FOR ... END` and `FIRST ... FOR ... END`.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct Comprehension {
    pub kind: ComprehensionKind,
    pub mapping: Expr,
    pub bindings: Vec<Binding>,
    pub when: Option<Expr>,
}

/// `OBJECT name : value FOR ... END`.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectComprehension {
    pub name_mapping: Expr,
    pub value_mapping: Expr,
    pub bindings: Vec<Binding>,
    pub when: Option<Expr>,
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// JSON literal.
    Constant(Value),
    /// The MISSING literal.
    Missing,
    /// Free identifier.
    Identifier(Identifier),
    /// `base.name`.
    Field(Box<Expr>, String),
    /// `base[index]`.
    Element(Box<Expr>, Box<Expr>),
    /// `$name`.
    NamedParameter(String),
    /// `$1`.
    PositionalParameter(usize),
    /// `NOT e`.
    Not(Box<Expr>),
    /// `-e`.
    Negate(Box<Expr>),
    /// Infix operator.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Postfix IS test.
    Is(IsOp, Box<Expr>),
    /// Scalar function call.
    Function(String, Vec<Expr>),
    /// Aggregate call.
    Aggregate(Aggregate),
    /// `[a, b]`.
    ArrayConstruct(Vec<Expr>),
    /// `{"k": v}`.
    ObjectConstruct(BTreeMap<String, Expr>),
    /// Quantifier.
    Quantified(Box<Quantified>),
    /// Array or first comprehension.
    Comprehension(Box<Comprehension>),
    /// Object comprehension.
    ObjectComprehension(Box<ObjectComprehension>),
    /// Nested SELECT.
    Subquery(Box<Select>),
}

impl Expr {
    /// Unresolved identifier.
    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Identifier(Identifier::new(name))
    }

    /// Field access on `base`.
    pub fn field(base: Expr, name: impl Into<String>) -> Expr {
        Expr::Field(Box::new(base), name.into())
    }

    /// `alias.a.b.c` path.
    pub fn path(alias: &str, fields: &[&str]) -> Expr {
        fields
            .iter()
            .fold(Expr::ident(alias), |base, name| Expr::field(base, *name))
    }

    /// JSON literal.
    pub fn constant(value: impl Into<Value>) -> Expr {
        Expr::Constant(value.into())
    }

    /// Infix application.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    /// `left = right`.
    pub fn equals(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    /// `left and right`.
    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::And, left, right)
    }

    /// `count(*)`.
    pub fn count_star() -> Expr {
        Expr::Aggregate(Aggregate {
            func: AggregateFunc::Count,
            operand: None,
            distinct: false,
            window: None,
        })
    }

    /// Non-window aggregate over `operand`.
    pub fn aggregate(func: AggregateFunc, operand: Expr) -> Expr {
        Expr::Aggregate(Aggregate {
            func,
            operand: Some(Box::new(operand)),
            distinct: false,
            window: None,
        })
    }

    /// Conjunction of `terms`, or `None` when empty.
    pub fn conjunction(terms: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        terms.into_iter().reduce(Expr::and)
    }

    /// Canonical text.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// True for literal constants, including MISSING.
    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant(_) | Expr::Missing)
    }

    /// Literal value, if constant.
    pub fn constant_value(&self) -> Option<&Value> {
        match self {
            Expr::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// True when the expression references no identifiers and no sub-queries.
    pub fn is_static(&self) -> bool {
        match self {
            Expr::Identifier(_) | Expr::Subquery(_) => false,
            _ => self.children().into_iter().all(Expr::is_static),
        }
    }

    /// Immediate sub-expressions, excluding sub-query bodies.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Constant(_)
            | Expr::Missing
            | Expr::Identifier(_)
            | Expr::NamedParameter(_)
            | Expr::PositionalParameter(_)
            | Expr::Subquery(_) => Vec::new(),
            Expr::Field(base, _) => vec![base.as_ref()],
            Expr::Element(base, index) => vec![base.as_ref(), index.as_ref()],
            Expr::Not(inner) | Expr::Negate(inner) | Expr::Is(_, inner) => vec![inner.as_ref()],
            Expr::Binary(_, left, right) => vec![left.as_ref(), right.as_ref()],
            Expr::Function(_, args) | Expr::ArrayConstruct(args) => args.iter().collect(),
            Expr::Aggregate(agg) => {
                let mut out: Vec<&Expr> = agg.operand.iter().map(|op| op.as_ref()).collect();
                if let Some(window) = &agg.window {
                    out.extend(window.partition_by.iter());
                    out.extend(window.order_by.iter().map(|term| &term.expr));
                }
                out
            }
            Expr::ObjectConstruct(fields) => fields.values().collect(),
            Expr::Quantified(q) => {
                let mut out: Vec<&Expr> = q.bindings.iter().map(|b| &b.expr).collect();
                out.push(&q.satisfies);
                out
            }
            Expr::Comprehension(c) => {
                let mut out: Vec<&Expr> = c.bindings.iter().map(|b| &b.expr).collect();
                out.push(&c.mapping);
                out.extend(c.when.iter());
                out
            }
            Expr::ObjectComprehension(c) => {
                let mut out: Vec<&Expr> = c.bindings.iter().map(|b| &b.expr).collect();
                out.push(&c.name_mapping);
                out.push(&c.value_mapping);
                out.extend(c.when.iter());
                out
            }
        }
    }

    /// Calls `f` on each immediate sub-expression, excluding sub-query bodies.
    pub fn for_each_child_mut(&mut self, mut f: impl FnMut(&mut Expr)) {
        match self {
            Expr::Constant(_)
            | Expr::Missing
            | Expr::Identifier(_)
            | Expr::NamedParameter(_)
            | Expr::PositionalParameter(_)
            | Expr::Subquery(_) => {}
            Expr::Field(base, _) => f(base.as_mut()),
            Expr::Element(base, index) => {
                f(base.as_mut());
                f(index.as_mut());
            }
            Expr::Not(inner) | Expr::Negate(inner) | Expr::Is(_, inner) => f(inner.as_mut()),
            Expr::Binary(_, left, right) => {
                f(left.as_mut());
                f(right.as_mut());
            }
            Expr::Function(_, args) | Expr::ArrayConstruct(args) => args.iter_mut().for_each(f),
            Expr::Aggregate(agg) => {
                if let Some(operand) = &mut agg.operand {
                    f(operand.as_mut());
                }
                if let Some(window) = &mut agg.window {
                    window.partition_by.iter_mut().for_each(&mut f);
                    window.order_by.iter_mut().for_each(|term| f(&mut term.expr));
                }
            }
            Expr::ObjectConstruct(fields) => fields.values_mut().for_each(f),
            Expr::Quantified(q) => {
                q.bindings.iter_mut().for_each(|b| f(&mut b.expr));
                f(&mut q.satisfies);
            }
            Expr::Comprehension(c) => {
                c.bindings.iter_mut().for_each(|b| f(&mut b.expr));
                f(&mut c.mapping);
                if let Some(when) = &mut c.when {
                    f(when);
                }
            }
            Expr::ObjectComprehension(c) => {
                c.bindings.iter_mut().for_each(|b| f(&mut b.expr));
                f(&mut c.name_mapping);
                f(&mut c.value_mapping);
                if let Some(when) = &mut c.when {
                    f(when);
                }
            }
        }
    }

    /// Splits nested `and` operators into their operands.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary(BinaryOp::And, left, right) => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Names of every identifier occurring in the expression.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut BTreeSet<String>) {
        if let Expr::Identifier(ident) = self {
            out.insert(ident.name.clone());
        }
        for child in self.children() {
            child.collect_identifiers(out);
        }
    }

    /// Field path below `alias`, e.g. `t.a.b` yields `a.b` for alias `t`.
    pub fn path_below(&self, alias: &str) -> Option<String> {
        match self {
            Expr::Field(base, name) => match base.as_ref() {
                Expr::Identifier(ident) if ident.name == alias => Some(name.clone()),
                inner => inner.path_below(alias).map(|prefix| format!("{prefix}.{name}")),
            },
            _ => None,
        }
    }

    /// True for non-window aggregates.
    pub fn is_group_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate(agg) if agg.window.is_none())
    }

    /// True if a grouping aggregate occurs outside any sub-query.
    pub fn contains_aggregate(&self) -> bool {
        self.is_group_aggregate() || self.children().into_iter().any(Expr::contains_aggregate)
    }
}

/// Collects grouping aggregates reachable from `expr`, keyed by canonical text.
///
/// Does not descend into aggregate operands or sub-queries.
pub fn collect_aggregates(expr: &Expr, out: &mut BTreeMap<String, Expr>) {
    if expr.is_group_aggregate() {
        out.entry(expr.canonical()).or_insert_with(|| expr.clone());
        return;
    }
    for child in expr.children() {
        collect_aggregates(child, out);
    }
}

/// Collects window aggregates reachable from `expr`, keyed by canonical text.
pub fn collect_window_aggregates(expr: &Expr, out: &mut BTreeMap<String, Expr>) {
    if let Expr::Aggregate(agg) = expr {
        if agg.window.is_some() {
            out.entry(expr.canonical()).or_insert_with(|| expr.clone());
            return;
        }
    }
    for child in expr.children() {
        collect_window_aggregates(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_are_deduplicated_and_sorted() {
        let sum = Expr::aggregate(AggregateFunc::Sum, Expr::path("t", &["a"]));
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Add, sum.clone(), Expr::count_star()),
            sum,
        );
        let mut aggs = BTreeMap::new();
        collect_aggregates(&expr, &mut aggs);
        let keys: Vec<&str> = aggs.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["count(*)", "sum((`t`.`a`))"]);
    }

    #[test]
    fn path_below_walks_nested_fields() {
        let expr = Expr::path("t", &["address", "zip"]);
        assert_eq!(expr.path_below("t").as_deref(), Some("address.zip"));
        assert_eq!(expr.path_below("u"), None);
    }

    #[test]
    fn static_bindings_have_no_identifiers() {
        let constant = Binding::new("x", Expr::constant(serde_json::json!([1, 2])));
        assert!(constant.static_var);
        let dynamic = Binding::new("x", Expr::path("t", &["arr"]));
        assert!(!dynamic.static_var);
    }
}
