//! Statement tree to operator tree.
//!
//! The builder walks a normalized [`Statement`] and emits a staged plan:
//! operators that must see rows one data source at a time go into the
//! sequential list of a [`Sequence`], per-document work goes into lanes that
//! are closed into [`Parallel`] stages. Identifier classification runs once
//! over a private copy of the statement before any operator is built.

mod ddl;
mod dml;
mod from;
mod select;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::algebra::{InsertSource, ResultTerm, Select, Statement};
use crate::auth::{AllowAll, Authorizer, Privileges};
use crate::catalog::Catalog;
use crate::config::PlannerConfig;
use crate::error::Result;
use crate::expr::Expr;
use crate::plan::{
    Authorize, Explain, Operator, OptEstimate, Parallel, Prepared, ScopeContext, Sequence, Stream,
};

/// Cost model hook consulted after a plan is built.
///
/// Returned estimates are stored on operators that carry one; a
/// [`Sequence`] then takes over the figures of its last child.
pub trait Estimator: Send + Sync {
    /// Estimate for `op`, or `None` to leave it unannotated.
    fn estimate(&self, op: &Operator) -> Option<OptEstimate>;
}

/// Builds operator trees against a catalog.
pub struct Builder {
    catalog: Arc<dyn Catalog>,
    config: PlannerConfig,
    authorizer: Arc<dyn Authorizer>,
    estimator: Option<Arc<dyn Estimator>>,
}

impl Builder {
    /// Creates a builder that grants every privilege.
    pub fn new(config: PlannerConfig, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            config,
            authorizer: Arc::new(AllowAll),
            estimator: None,
        }
    }

    /// Replaces the pre-authorization collaborator.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Installs a cost model.
    pub fn with_estimator(mut self, estimator: Arc<dyn Estimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Catalog plans are resolved against.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Builds a top-level plan: `Sequence(Authorize(plan), Stream)`.
    pub fn build(&self, stmt: &Statement) -> Result<Operator> {
        let mut stmt = stmt.clone();
        classify(&mut stmt, &ScopeContext::new());
        self.build_from_classified(&stmt)
    }

    /// Builds the plan of a correlated sub-query: no authorization wrapper,
    /// no result stream, and keyspace terms must carry `USE KEYS` unless the
    /// configuration lifts that requirement. Identifiers are classified in a
    /// child of `scope`, the scope enclosing the sub-query expression.
    pub fn build_subquery(&self, select: &Select, scope: &ScopeContext<'_>) -> Result<Operator> {
        let mut select = select.clone();
        scope.map_select(&mut select);
        self.plan_subquery(&select)
    }

    /// Builds a [`Prepared`] for `stmt`, including plans for every
    /// correlated sub-query it contains.
    pub fn prepare(&self, stmt: &Statement, text: &str) -> Result<Prepared> {
        let mut classified = stmt.clone();
        let root = ScopeContext::recording();
        classify(&mut classified, &root);
        let operator = self.build_from_classified(&classified)?;
        let mut prepared = Prepared::new(operator, signature(stmt)).with_text(text);
        for nested in root.take_recorded() {
            let key = nested.select.to_string();
            if prepared.subquery_plans.contains_key(&key) {
                continue;
            }
            let plan = self.plan_subquery(&nested.select)?;
            prepared.subquery_plans.insert(key.clone(), plan);
            if !nested.outer.is_empty() {
                prepared.subquery_scopes.insert(key, nested.outer);
            }
        }
        Ok(prepared)
    }

    fn build_from_classified(&self, stmt: &Statement) -> Result<Operator> {
        let mut op = self.build_classified(stmt)?;
        self.annotate(&mut op);
        debug!(
            kind = stmt.kind(),
            root = op.name(),
            nodes = op.node_count(),
            plan_hash = op.plan_hash(),
            "plan.built"
        );
        Ok(op)
    }

    fn plan_subquery(&self, select: &Select) -> Result<Operator> {
        let mut ctx = Context::new(self, true);
        let mut op = ctx.select(select)?;
        self.annotate(&mut op);
        Ok(op)
    }

    fn build_classified(&self, stmt: &Statement) -> Result<Operator> {
        if let Statement::Explain(inner) = stmt {
            let child = self.build_classified(inner)?;
            let text = match inner.as_ref() {
                Statement::Select(select) => select.to_string(),
                other => other.kind().to_string(),
            };
            return Ok(Explain {
                text,
                child: Box::new(child),
            }
            .into());
        }
        let mut ctx = Context::new(self, false);
        let op = ctx.statement(stmt)?;
        let authorized = Authorize::checked(ctx.privileges, op, self.authorizer.as_ref())?;
        Ok(Sequence::new(vec![authorized.into(), Stream::default().into()]).into())
    }

    fn annotate(&self, op: &mut Operator) {
        let Some(estimator) = &self.estimator else {
            return;
        };
        annotate_with(estimator.as_ref(), op);
    }
}

fn annotate_with(estimator: &dyn Estimator, op: &mut Operator) {
    for child in op.children_mut() {
        annotate_with(estimator, child);
    }
    if let Operator::Sequence(seq) = op {
        if let Some(last) = seq.children.last().and_then(Operator::estimate) {
            seq.est = *last;
        }
        return;
    }
    if !op.readonly() {
        return;
    }
    if let Some(est) = estimator.estimate(op) {
        if let Some(slot) = op.estimate_mut() {
            *slot = est;
        }
    }
}

/// Classifies every identifier of a statement in place.
fn classify(stmt: &mut Statement, root: &ScopeContext<'_>) {
    match stmt {
        Statement::Select(select) => root.map_select(select),
        Statement::Insert(ins) | Statement::Upsert(ins) => {
            let mut scope = root.child();
            scope.add_keyspace_alias(ins.keyspace.as_alias());
            match &mut ins.source {
                InsertSource::Values(pairs) => {
                    for pair in pairs {
                        scope.map_expr(&mut pair.key);
                        scope.map_expr(&mut pair.value);
                        if let Some(options) = &mut pair.options {
                            scope.map_expr(options);
                        }
                    }
                }
                InsertSource::Select { select, key, value } => {
                    scope.map_select(select);
                    scope.map_expr(key);
                    if let Some(value) = value {
                        scope.map_expr(value);
                    }
                }
            }
            map_returning(&scope, ins.returning.as_mut().map(|p| &mut p.terms));
        }
        Statement::Update(upd) => {
            let mut scope = root.child();
            if let Some(keys) = &mut upd.keyspace.keys {
                scope.map_expr(keys);
            }
            scope.add_keyspace_alias(upd.keyspace.as_alias());
            for clause in &mut upd.set {
                scope.map_expr(&mut clause.path);
                scope.map_expr(&mut clause.value);
            }
            for path in &mut upd.unset {
                scope.map_expr(path);
            }
            map_opt(&scope, upd.where_.as_mut());
            map_opt(&scope, upd.limit.as_mut());
            map_returning(&scope, upd.returning.as_mut().map(|p| &mut p.terms));
        }
        Statement::Delete(del) => {
            let mut scope = root.child();
            if let Some(keys) = &mut del.keyspace.keys {
                scope.map_expr(keys);
            }
            scope.add_keyspace_alias(del.keyspace.as_alias());
            map_opt(&scope, del.where_.as_mut());
            map_opt(&scope, del.limit.as_mut());
            map_returning(&scope, del.returning.as_mut().map(|p| &mut p.terms));
        }
        Statement::Merge(merge) => {
            let mut scope = root.child();
            if let Some(select) = &mut merge.source.select {
                scope.map_select(select);
                if let Some(alias) = &merge.source.alias {
                    scope.add_subquery_term_alias(alias);
                }
            }
            if let Some(from) = &mut merge.source.from {
                if let Some(keys) = &mut from.keys {
                    scope.map_expr(keys);
                }
                scope.add_keyspace_alias(from.as_alias());
            }
            scope.map_expr(&mut merge.key);
            scope.add_keyspace_alias(merge.target.as_alias());
            if let Some(update) = &mut merge.update {
                for clause in &mut update.set {
                    scope.map_expr(&mut clause.path);
                    scope.map_expr(&mut clause.value);
                }
                for path in &mut update.unset {
                    scope.map_expr(path);
                }
                map_opt(&scope, update.where_.as_mut());
            }
            if let Some(delete) = &mut merge.delete {
                map_opt(&scope, delete.where_.as_mut());
            }
            if let Some(insert) = &mut merge.insert {
                scope.map_expr(&mut insert.value);
                map_opt(&scope, insert.where_.as_mut());
            }
            map_opt(&scope, merge.limit.as_mut());
            map_returning(&scope, merge.returning.as_mut().map(|p| &mut p.terms));
        }
        Statement::CreateIndex(create) => {
            let mut scope = root.child();
            scope.add_keyspace_alias(create.keyspace.as_alias());
            for key in &mut create.keys {
                scope.map_expr(key);
            }
            map_opt(&scope, create.where_.as_mut());
        }
        Statement::Explain(inner) => classify(inner, root),
        _ => {}
    }
}

fn map_opt(scope: &ScopeContext<'_>, expr: Option<&mut Expr>) {
    if let Some(expr) = expr {
        scope.map_expr(expr);
    }
}

fn map_returning(scope: &ScopeContext<'_>, terms: Option<&mut Vec<ResultTerm>>) {
    for term in terms.into_iter().flatten() {
        map_opt(scope, term.expr.as_mut());
    }
}

/// Result shape of a statement: output names mapped to their types, `"*"`
/// for star terms, `"json"` for RAW selects.
pub fn signature(stmt: &Statement) -> Value {
    let projection = match stmt {
        Statement::Select(select) => Some(select.projection()),
        Statement::Insert(ins) | Statement::Upsert(ins) => ins.returning.as_ref(),
        Statement::Update(upd) => upd.returning.as_ref(),
        Statement::Delete(del) => del.returning.as_ref(),
        Statement::Merge(merge) => merge.returning.as_ref(),
        Statement::Explain(_) => return Value::String("json".into()),
        _ => None,
    };
    let Some(projection) = projection else {
        return Value::Object(Map::new());
    };
    if projection.raw {
        return Value::String("json".into());
    }
    let mut map = Map::new();
    for (pos, term) in projection.terms.iter().enumerate() {
        if term.star {
            map.insert("*".into(), Value::String("*".into()));
        } else if let Some(name) = term.output_name(pos) {
            map.insert(name, Value::String("json".into()));
        }
    }
    Value::Object(map)
}

/// Sequential list plus the lane currently being filled.
#[derive(Debug, Default)]
pub(crate) struct Stages {
    children: Vec<Operator>,
    lane: Vec<Operator>,
}

impl Stages {
    fn push(&mut self, op: impl Into<Operator>) {
        self.children.push(op.into());
    }

    fn push_lane(&mut self, op: impl Into<Operator>) {
        self.lane.push(op.into());
    }

    /// Closes the current lane into a `Parallel` stage.
    fn close_lane(&mut self, max_parallelism: Option<u32>) {
        if self.lane.is_empty() {
            return;
        }
        let lane = std::mem::take(&mut self.lane);
        self.children.push(
            Parallel::new(Sequence::new(lane).into(), max_parallelism).into(),
        );
    }

    fn finish(mut self, max_parallelism: Option<u32>) -> Operator {
        self.close_lane(max_parallelism);
        Sequence::new(self.children).into()
    }
}

/// Per-build state: the statement's privileges and the sub-query mode.
pub(crate) struct Context<'b> {
    builder: &'b Builder,
    subquery: bool,
    privileges: Privileges,
}

impl<'b> Context<'b> {
    fn new(builder: &'b Builder, subquery: bool) -> Self {
        Self {
            builder,
            subquery,
            privileges: Privileges::new(),
        }
    }

    fn config(&self) -> &PlannerConfig {
        &self.builder.config
    }

    fn catalog(&self) -> &dyn Catalog {
        self.builder.catalog.as_ref()
    }

    fn max_parallelism(&self) -> Option<u32> {
        self.builder.config.max_parallelism
    }

    fn statement(&mut self, stmt: &Statement) -> Result<Operator> {
        match stmt {
            Statement::Select(select) => self.select(select),
            Statement::Insert(ins) => self.insert(ins, false),
            Statement::Upsert(ins) => self.insert(ins, true),
            Statement::Update(upd) => self.update(upd),
            Statement::Delete(del) => self.delete(del),
            Statement::Merge(merge) => self.merge(merge),
            Statement::Explain(inner) => self.statement(inner),
            other => self.ddl(other),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{DenyAll, GrantedKinds, PrivilegeKind};
    use crate::catalog::InMemoryCatalog;
    use crate::error::PlanError;
    use crate::expr::{parse_select, AliasKind, IdentKind};
    use serde_json::json;

    pub(crate) fn catalog() -> Arc<InMemoryCatalog> {
        Arc::new(
            InMemoryCatalog::new()
                .with_primary_index("orders")
                .with_index("orders", "idx_city", &["city"])
                .with_index("orders", "idx_total", &["total"])
                .with_primary_index("customers")
                .with_keyspace("archive"),
        )
    }

    pub(crate) fn builder() -> Builder {
        Builder::new(PlannerConfig::default(), catalog())
    }

    pub(crate) fn select(text: &str) -> Statement {
        Statement::Select(parse_select(text).expect("select"))
    }

    /// Operator names in depth-first pre-order.
    pub(crate) fn names(op: &Operator) -> Vec<&'static str> {
        let mut out = vec![op.name()];
        for child in op.children() {
            out.extend(names(child));
        }
        out
    }

    #[test]
    fn top_level_plan_is_authorized_and_streamed() {
        let plan = builder()
            .build(&select("select `o`.`id` from `orders` as `o`"))
            .expect("build");
        let Operator::Sequence(root) = &plan else {
            panic!("unexpected root: {plan:?}");
        };
        assert_eq!(root.children.len(), 2);
        match &root.children[0] {
            Operator::Authorize(auth) => {
                assert!(!auth.deferred);
                assert_eq!(auth.privileges.len(), 1);
            }
            other => panic!("unexpected first stage: {other:?}"),
        }
        assert!(matches!(root.children[1], Operator::Stream(_)));
    }

    #[test]
    fn denied_privileges_fail_the_build() {
        let denied = builder().with_authorizer(Arc::new(DenyAll));
        match denied.build(&select("select * from `orders`")) {
            Err(PlanError::Unauthorized { privilege }) => {
                assert_eq!(privilege, "select on default:orders")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let readers = builder().with_authorizer(Arc::new(GrantedKinds::new([PrivilegeKind::Select])));
        assert!(readers.build(&select("select * from `orders`")).is_ok());
    }

    #[test]
    fn signature_names_projected_terms() {
        let stmt = select("select `o`.`id`, `o`.`city` as `town`, * from `orders` as `o`");
        assert_eq!(
            signature(&stmt),
            json!({"id": "json", "town": "json", "*": "*"})
        );
        assert_eq!(signature(&select("select raw 1")), json!("json"));
    }

    #[test]
    fn prepare_plans_correlated_subqueries() {
        let stmt = select(
            "select (select raw `l`.`qty` from `orders` as `l` use keys (`o`.`lines`)) as `q` from `orders` as `o`",
        );
        let prepared = builder().prepare(&stmt, "select ...").expect("prepare");
        assert_eq!(prepared.subquery_plans.len(), 1);
        let plan = prepared.subquery_plans.values().next().expect("plan");
        assert!(!names(plan).contains(&"Stream"));
        assert!(names(plan).contains(&"KeyScan"));
        assert_eq!(prepared.text, "select ...");
    }

    fn key_scan_keys(op: &Operator) -> Option<&Expr> {
        match op {
            Operator::KeyScan(scan) => Some(&scan.keys),
            other => other.children().into_iter().find_map(key_scan_keys),
        }
    }

    fn kind_of(expr: &Expr, name: &str) -> Option<IdentKind> {
        match expr {
            Expr::Identifier(ident) if ident.name == name => Some(ident.kind),
            _ => expr.children().into_iter().find_map(|c| kind_of(c, name)),
        }
    }

    #[test]
    fn correlated_subqueries_see_the_enclosing_scope() {
        let stmt = select(
            "select (select raw `l`.`qty` from `orders` as `l` use keys (`o`.`lines`)) as `q` from `orders` as `o`",
        );
        let mut prepared = builder().prepare(&stmt, "").expect("prepare");
        let (text, plan) = prepared.subquery_plans.iter().next().expect("plan");
        let keys = key_scan_keys(plan).expect("key scan");
        let outer = IdentKind::Alias(AliasKind::Keyspace);
        assert_eq!(kind_of(keys, "o"), Some(outer));
        let scope = prepared.subquery_scopes.get(text).expect("scope");
        assert_eq!(scope.get("o"), Some(&outer));

        let encoded = prepared.compute_encoded_plan().expect("encode").to_string();
        let decoded = Prepared::decode_encoded(&encoded).expect("decode");
        assert_eq!(decoded, prepared);

        let bare = parse_select("select raw `l`.`qty` from `orders` as `l` use keys (`o`.`lines`)")
            .expect("select");
        let unscoped = builder()
            .build_subquery(&bare, &ScopeContext::new())
            .expect("build");
        let keys = key_scan_keys(&unscoped).expect("key scan");
        assert_eq!(kind_of(keys, "o"), Some(IdentKind::Unresolved));
    }

    #[test]
    fn subquery_without_keys_is_rejected() {
        let stmt = select(
            "select (select raw `l`.`qty` from `orders` as `l`) as `q` from `orders` as `o`",
        );
        match builder().prepare(&stmt, "") {
            Err(PlanError::SubqueryKeysRequired { keyspace }) => {
                assert_eq!(keyspace, "default:orders")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let embedded = Builder::new(PlannerConfig::embedded(), catalog());
        assert!(embedded.prepare(&stmt, "").is_ok());
    }

    struct Flat;

    impl Estimator for Flat {
        fn estimate(&self, op: &Operator) -> Option<OptEstimate> {
            match op {
                Operator::Stream(_) => Some(OptEstimate {
                    cost: Some(42.0),
                    cardinality: Some(7.0),
                    ..OptEstimate::default()
                }),
                _ => None,
            }
        }
    }

    #[test]
    fn estimator_figures_reach_the_root() {
        let plan = builder()
            .with_estimator(Arc::new(Flat))
            .build(&select("select * from `orders`"))
            .expect("build");
        let est = plan.estimate().expect("sequence estimate");
        assert_eq!(est.cost, Some(42.0));
        assert_eq!(est.cardinality, Some(7.0));
    }

    #[test]
    fn explain_wraps_the_built_plan() {
        let inner = parse_select("select * from `orders`").expect("select");
        let plan = builder()
            .build(&Statement::Explain(Box::new(Statement::Select(inner))))
            .expect("build");
        match &plan {
            Operator::Explain(explain) => {
                assert_eq!(explain.text, "select * from `orders`");
                assert_eq!(explain.child.name(), "Sequence");
            }
            other => panic!("unexpected root: {other:?}"),
        }
    }
}
