//! Normalized statement trees consumed by the builder.
//!
//! These types are produced by an upstream parser and semantic pass; the
//! planner only reads them. `Display` renders a compact SQL-like form used for
//! sub-query text and diagnostics.

#![forbid(unsafe_code)]

use std::fmt;

use serde_json::Value;

use crate::catalog::IndexUsing;
use crate::expr::print_ident;
use crate::expr::{Binding, Expr, SortTerm};

/// Top-level statement.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Upsert(Insert),
    Update(Update),
    Delete(Delete),
    Merge(Merge),
    CreatePrimaryIndex(CreatePrimaryIndex),
    CreateIndex(CreateIndex),
    DropIndex(DropIndex),
    AlterIndex(AlterIndex),
    BuildIndexes(BuildIndexes),
    StartTransaction { isolation: Option<IsolationLevel> },
    CommitTransaction,
    RollbackTransaction { savepoint: Option<String> },
    SetTransactionIsolation(IsolationLevel),
    Savepoint(String),
    Explain(Box<Statement>),
}

impl Statement {
    /// Short statement kind for logging and request typing.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Upsert(_) => "UPSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
            Statement::Merge(_) => "MERGE",
            Statement::CreatePrimaryIndex(_) => "CREATE_PRIMARY_INDEX",
            Statement::CreateIndex(_) => "CREATE_INDEX",
            Statement::DropIndex(_) => "DROP_INDEX",
            Statement::AlterIndex(_) => "ALTER_INDEX",
            Statement::BuildIndexes(_) => "BUILD_INDEX",
            Statement::StartTransaction { .. } => "START_TRANSACTION",
            Statement::CommitTransaction => "COMMIT",
            Statement::RollbackTransaction { .. } => "ROLLBACK",
            Statement::SetTransactionIsolation(_) => "SET_TRANSACTION_ISOLATION",
            Statement::Savepoint(_) => "SAVEPOINT",
            Statement::Explain(_) => "EXPLAIN",
        }
    }
}

/// Transaction isolation levels.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
}

impl IsolationLevel {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
        }
    }

    /// Parses the wire spelling.
    pub fn parse(text: &str) -> Option<Self> {
        text.eq_ignore_ascii_case("READ COMMITTED")
            .then_some(IsolationLevel::ReadCommitted)
    }
}

/// `WITH alias AS (expr)` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct WithBinding {
    /// Alias visible throughout the statement.
    pub alias: String,
    /// Bound expression, commonly a sub-query.
    pub expr: Expr,
}

/// SELECT statement with paging and ordering.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    /// WITH clause.
    pub with: Vec<WithBinding>,
    /// Query block or set operation.
    pub body: SelectBody,
    /// ORDER BY terms.
    pub order: Vec<SortTerm>,
    /// OFFSET expression.
    pub offset: Option<Expr>,
    /// LIMIT expression.
    pub limit: Option<Expr>,
}

impl Select {
    /// Wraps a single query block.
    pub fn from_subselect(sub: Subselect) -> Self {
        Self {
            with: Vec::new(),
            body: SelectBody::Subselect(Box::new(sub)),
            order: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    /// Wraps a set operation.
    pub fn from_set_op(op: SetOp) -> Self {
        Self {
            with: Vec::new(),
            body: SelectBody::SetOp(Box::new(op)),
            order: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    /// Sets ORDER BY.
    pub fn order_by(mut self, terms: Vec<SortTerm>) -> Self {
        self.order = terms;
        self
    }

    /// Sets OFFSET.
    pub fn offset(mut self, expr: Expr) -> Self {
        self.offset = Some(expr);
        self
    }

    /// Sets LIMIT.
    pub fn limit(mut self, expr: Expr) -> Self {
        self.limit = Some(expr);
        self
    }

    /// Adds a WITH binding.
    pub fn with_alias(mut self, alias: impl Into<String>, expr: Expr) -> Self {
        self.with.push(WithBinding {
            alias: alias.into(),
            expr,
        });
        self
    }

    /// Projection of the leftmost query block, which defines the result shape.
    pub fn projection(&self) -> &Projection {
        self.body.projection()
    }
}

/// Body of a SELECT.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum SelectBody {
    Subselect(Box<Subselect>),
    SetOp(Box<SetOp>),
}

impl SelectBody {
    fn projection(&self) -> &Projection {
        match self {
            SelectBody::Subselect(sub) => &sub.projection,
            SelectBody::SetOp(op) => op.first.projection(),
        }
    }
}

/// Set operator kinds.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Intersect,
    Except,
}

/// `first <op> [ALL] second`.
#[derive(Clone, Debug, PartialEq)]
pub struct SetOp {
    /// Operator.
    pub kind: SetOpKind,
    /// ALL suppresses deduplication.
    pub all: bool,
    /// Left operand.
    pub first: SelectBody,
    /// Right operand.
    pub second: SelectBody,
}

impl SetOp {
    /// Builds a set operation over two query blocks.
    pub fn new(kind: SetOpKind, all: bool, first: Subselect, second: Subselect) -> Self {
        Self {
            kind,
            all,
            first: SelectBody::Subselect(Box::new(first)),
            second: SelectBody::Subselect(Box::new(second)),
        }
    }
}

/// GROUP BY clause.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupBy {
    /// Grouping keys; empty for an implicit single group.
    pub by: Vec<Expr>,
    /// LETTING bindings.
    pub letting: Vec<Binding>,
    /// HAVING predicate.
    pub having: Option<Expr>,
}

/// One projected term.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultTerm {
    /// Projected expression; `None` with `star` means `*`.
    pub expr: Option<Expr>,
    /// `expr.*` or `*`.
    pub star: bool,
    /// AS alias.
    pub alias: Option<String>,
}

impl ResultTerm {
    /// `expr AS alias`.
    pub fn new(expr: Expr, alias: Option<&str>) -> Self {
        Self {
            expr: Some(expr),
            star: false,
            alias: alias.map(str::to_string),
        }
    }

    /// Bare `*`.
    pub fn star() -> Self {
        Self {
            expr: None,
            star: true,
            alias: None,
        }
    }

    /// `expr.*`.
    pub fn path_star(expr: Expr) -> Self {
        Self {
            expr: Some(expr),
            star: true,
            alias: None,
        }
    }

    /// Output field name: explicit alias, else the trailing identifier or field
    /// name, else `$position` (1-based).
    pub fn output_name(&self, position: usize) -> Option<String> {
        if self.star {
            return None;
        }
        if let Some(alias) = &self.alias {
            return Some(alias.clone());
        }
        match &self.expr {
            Some(Expr::Identifier(ident)) => Some(ident.name.clone()),
            Some(Expr::Field(_, name)) => Some(name.clone()),
            _ => Some(format!("${position}")),
        }
    }
}

/// SELECT list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection {
    /// SELECT DISTINCT.
    pub distinct: bool,
    /// SELECT RAW.
    pub raw: bool,
    /// Result terms.
    pub terms: Vec<ResultTerm>,
}

impl Projection {
    /// Projection of the given terms.
    pub fn terms(terms: Vec<ResultTerm>) -> Self {
        Self {
            distinct: false,
            raw: false,
            terms,
        }
    }

    /// SELECT RAW expr.
    pub fn raw(expr: Expr) -> Self {
        Self {
            distinct: false,
            raw: true,
            terms: vec![ResultTerm::new(expr, None)],
        }
    }
}

/// Single query block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subselect {
    /// FROM clause.
    pub from: Option<FromTerm>,
    /// LET bindings.
    pub let_: Vec<Binding>,
    /// WHERE predicate.
    pub where_: Option<Expr>,
    /// GROUP BY clause.
    pub group: Option<GroupBy>,
    /// SELECT list.
    pub projection: Projection,
}

impl Subselect {
    /// Query block projecting `projection` from `from`.
    pub fn new(from: Option<FromTerm>, projection: Projection) -> Self {
        Self {
            from,
            projection,
            ..Self::default()
        }
    }

    /// Sets WHERE.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_ = Some(expr);
        self
    }

    /// Sets LET.
    pub fn let_bindings(mut self, bindings: Vec<Binding>) -> Self {
        self.let_ = bindings;
        self
    }

    /// Sets GROUP BY.
    pub fn group_by(mut self, group: GroupBy) -> Self {
        self.group = Some(group);
        self
    }
}

/// Keyspace reference in FROM or a DML target.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyspaceTerm {
    /// Namespace; defaults from configuration.
    pub namespace: Option<String>,
    /// Keyspace name.
    pub keyspace: String,
    /// AS alias.
    pub alias: Option<String>,
    /// USE KEYS expression.
    pub keys: Option<Expr>,
}

impl KeyspaceTerm {
    /// Unaliased term in the default namespace.
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            namespace: None,
            keyspace: keyspace.into(),
            alias: None,
            keys: None,
        }
    }

    /// Sets the alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets USE KEYS.
    pub fn keys(mut self, keys: Expr) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Sets the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Effective alias.
    pub fn as_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.keyspace)
    }
}

/// Join algorithm hint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum JoinHint {
    /// Planner's choice.
    #[default]
    None,
    /// USE NL.
    UseNl,
    /// USE HASH(BUILD) when `build`, else USE HASH(PROBE).
    UseHash {
        /// Right side is the build side.
        build: bool,
    },
}

/// Join or nest condition.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum JoinCondition {
    /// Lookup join on document keys.
    OnKeys(Expr),
    /// ANSI join predicate.
    On { expr: Expr, hint: JoinHint },
}

/// JOIN or NEST term.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinTerm {
    /// Left input.
    pub left: FromTerm,
    /// Right keyspace.
    pub right: KeyspaceTerm,
    /// LEFT OUTER.
    pub outer: bool,
    /// Join condition.
    pub condition: JoinCondition,
}

/// UNNEST term.
#[derive(Clone, Debug, PartialEq)]
pub struct UnnestTerm {
    /// Left input.
    pub left: FromTerm,
    /// Array expression.
    pub expr: Expr,
    /// Element alias.
    pub alias: String,
    /// LEFT OUTER.
    pub outer: bool,
}

/// FROM clause term.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum FromTerm {
    Keyspace(KeyspaceTerm),
    Expression { expr: Expr, alias: String },
    Subquery { select: Box<Select>, alias: String },
    Join(Box<JoinTerm>),
    Nest(Box<JoinTerm>),
    Unnest(Box<UnnestTerm>),
}

/// `(key, value[, options])` row of INSERT VALUES.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct ValuePair {
    pub key: Expr,
    pub value: Expr,
    pub options: Option<Expr>,
}

/// INSERT / UPSERT source.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum InsertSource {
    Values(Vec<ValuePair>),
    Select {
        select: Box<Select>,
        key: Expr,
        value: Option<Expr>,
    },
}

/// INSERT or UPSERT statement.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub keyspace: KeyspaceTerm,
    pub source: InsertSource,
    pub returning: Option<Projection>,
}

/// `SET path = value`.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct SetClause {
    pub path: Expr,
    pub value: Expr,
}

/// UPDATE statement.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub keyspace: KeyspaceTerm,
    pub set: Vec<SetClause>,
    pub unset: Vec<Expr>,
    pub where_: Option<Expr>,
    pub limit: Option<Expr>,
    pub returning: Option<Projection>,
}

/// DELETE statement.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub keyspace: KeyspaceTerm,
    pub where_: Option<Expr>,
    pub limit: Option<Expr>,
    pub returning: Option<Projection>,
}

/// MERGE source: either a SELECT or a keyspace.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeSource {
    pub select: Option<Box<Select>>,
    pub from: Option<KeyspaceTerm>,
    pub alias: Option<String>,
}

impl MergeSource {
    /// Effective source alias.
    pub fn as_alias(&self) -> Option<&str> {
        self.alias
            .as_deref()
            .or_else(|| self.from.as_ref().map(KeyspaceTerm::as_alias))
    }
}

/// WHEN MATCHED THEN UPDATE.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeUpdate {
    pub set: Vec<SetClause>,
    pub unset: Vec<Expr>,
    pub where_: Option<Expr>,
}

/// WHEN MATCHED THEN DELETE.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeDelete {
    pub where_: Option<Expr>,
}

/// WHEN NOT MATCHED THEN INSERT.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct MergeInsert {
    pub value: Expr,
    pub where_: Option<Expr>,
}

/// MERGE statement.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct Merge {
    pub target: KeyspaceTerm,
    pub source: MergeSource,
    pub key: Expr,
    pub update: Option<MergeUpdate>,
    pub delete: Option<MergeDelete>,
    pub insert: Option<MergeInsert>,
    pub limit: Option<Expr>,
    pub returning: Option<Projection>,
}

/// CREATE PRIMARY INDEX.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct CreatePrimaryIndex {
    pub keyspace: KeyspaceTerm,
    pub name: Option<String>,
    pub using: IndexUsing,
    pub with: Option<Value>,
}

/// CREATE INDEX.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct CreateIndex {
    pub keyspace: KeyspaceTerm,
    pub name: String,
    pub keys: Vec<Expr>,
    pub where_: Option<Expr>,
    pub using: IndexUsing,
    pub with: Option<Value>,
}

/// DROP INDEX.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct DropIndex {
    pub keyspace: KeyspaceTerm,
    pub name: String,
    pub using: IndexUsing,
}

/// ALTER INDEX.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct AlterIndex {
    pub keyspace: KeyspaceTerm,
    pub name: String,
    pub using: IndexUsing,
    pub with: Value,
}

/// BUILD INDEX.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub struct BuildIndexes {
    pub keyspace: KeyspaceTerm,
    pub names: Vec<String>,
    pub using: IndexUsing,
}

impl fmt::Display for KeyspaceTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            print_ident(f, ns)?;
            f.write_str(":")?;
        }
        print_ident(f, &self.keyspace)?;
        if let Some(alias) = &self.alias {
            f.write_str(" as ")?;
            print_ident(f, alias)?;
        }
        if let Some(keys) = &self.keys {
            write!(f, " use keys {keys}")?;
        }
        Ok(())
    }
}

impl fmt::Display for FromTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FromTerm::Keyspace(term) => write!(f, "{term}"),
            FromTerm::Expression { expr, alias } => {
                write!(f, "{expr} as ")?;
                print_ident(f, alias)
            }
            FromTerm::Subquery { select, alias } => {
                write!(f, "({select}) as ")?;
                print_ident(f, alias)
            }
            FromTerm::Join(join) | FromTerm::Nest(join) => {
                let verb = if matches!(self, FromTerm::Join(_)) {
                    "join"
                } else {
                    "nest"
                };
                let outer = if join.outer { " left outer" } else { "" };
                write!(f, "{}{outer} {verb} {}", join.left, join.right)?;
                match &join.condition {
                    JoinCondition::OnKeys(keys) => write!(f, " on keys {keys}"),
                    JoinCondition::On { expr, .. } => write!(f, " on {expr}"),
                }
            }
            FromTerm::Unnest(unnest) => {
                let outer = if unnest.outer { " left outer" } else { "" };
                write!(f, "{}{outer} unnest {} as ", unnest.left, unnest.expr)?;
                print_ident(f, &unnest.alias)
            }
        }
    }
}

impl fmt::Display for ResultTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.expr, self.star) {
            (None, _) => f.write_str("*")?,
            (Some(expr), true) => write!(f, "{expr}.*")?,
            (Some(expr), false) => write!(f, "{expr}")?,
        }
        if let Some(alias) = &self.alias {
            f.write_str(" as ")?;
            print_ident(f, alias)?;
        }
        Ok(())
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("select ")?;
        if self.distinct {
            f.write_str("distinct ")?;
        }
        if self.raw {
            f.write_str("raw ")?;
        }
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

fn write_bindings(f: &mut fmt::Formatter<'_>, bindings: &[Binding]) -> fmt::Result {
    for (i, binding) in bindings.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        print_ident(f, &binding.variable)?;
        write!(f, " = {}", binding.expr)?;
    }
    Ok(())
}

impl fmt::Display for Subselect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.projection)?;
        if let Some(from) = &self.from {
            write!(f, " from {from}")?;
        }
        if !self.let_.is_empty() {
            f.write_str(" let ")?;
            write_bindings(f, &self.let_)?;
        }
        if let Some(cond) = &self.where_ {
            write!(f, " where {cond}")?;
        }
        if let Some(group) = &self.group {
            if !group.by.is_empty() {
                f.write_str(" group by ")?;
                for (i, key) in group.by.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}")?;
                }
            }
            if !group.letting.is_empty() {
                f.write_str(" letting ")?;
                write_bindings(f, &group.letting)?;
            }
            if let Some(having) = &group.having {
                write!(f, " having {having}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for SelectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectBody::Subselect(sub) => write!(f, "{sub}"),
            SelectBody::SetOp(op) => {
                let verb = match op.kind {
                    SetOpKind::Union => "union",
                    SetOpKind::Intersect => "intersect",
                    SetOpKind::Except => "except",
                };
                let all = if op.all { " all" } else { "" };
                write!(f, "{} {verb}{all} {}", op.first, op.second)
            }
        }
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.with.is_empty() {
            f.write_str("with ")?;
            for (i, with) in self.with.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                print_ident(f, &with.alias)?;
                write!(f, " as ({}) ", with.expr)?;
            }
        }
        write!(f, "{}", self.body)?;
        if !self.order.is_empty() {
            f.write_str(" order by ")?;
            for (i, term) in self.order.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{term}")?;
            }
        }
        if let Some(offset) = &self.offset {
            write!(f, " offset {offset}")?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;

    #[test]
    fn select_text_is_compact() {
        let sub = Subselect::new(
            Some(FromTerm::Keyspace(KeyspaceTerm::new("orders").alias("o"))),
            Projection::terms(vec![ResultTerm::new(Expr::path("o", &["id"]), None)]),
        )
        .filter(Expr::binary(
            BinaryOp::Gt,
            Expr::path("o", &["total"]),
            Expr::constant(10),
        ));
        let select = Select::from_subselect(sub).limit(Expr::constant(5));
        assert_eq!(
            select.to_string(),
            "select (`o`.`id`) from `orders` as `o` where ((`o`.`total`) > 10) limit 5"
        );
    }

    #[test]
    fn output_names_fall_back_to_position() {
        let named = ResultTerm::new(Expr::path("o", &["id"]), None);
        assert_eq!(named.output_name(1).as_deref(), Some("id"));
        let computed = ResultTerm::new(Expr::count_star(), None);
        assert_eq!(computed.output_name(2).as_deref(), Some("$2"));
        assert_eq!(ResultTerm::star().output_name(3), None);
    }
}
