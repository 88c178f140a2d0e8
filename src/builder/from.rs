//! FROM clause: keyspace scans, index selection, joins, nests, and unnest.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use tracing::trace;

use crate::algebra::{FromTerm, JoinCondition, JoinHint, JoinTerm, KeyspaceTerm};
use crate::auth::PrivilegeKind;
use crate::catalog::IndexHandle;
use crate::error::{PlanError, Result};
use crate::expr::{collate_bounds, BinaryOp, Expr};
use crate::plan::{
    Alias, ExpressionScan, Fetch, HashJoin, HashNest, Inclusion, IndexRef, IndexScan,
    IntersectScan, Join, KeyScan, KeyspaceRef, Nest, NestedLoopJoin, NestedLoopNest, Operator, OptEstimate,
    PrimaryScan, Range, Sequence, Span, Unnest,
};

use super::{Context, Stages};

impl Context<'_> {
    /// Resolves a keyspace term and records the privilege it needs.
    pub(super) fn keyspace(&mut self, term: &KeyspaceTerm, kind: PrivilegeKind) -> Result<KeyspaceRef> {
        let namespace = term
            .namespace
            .as_deref()
            .unwrap_or(&self.config().default_namespace);
        let handle = self.catalog().keyspace(namespace, &term.keyspace)?;
        let keyspace = KeyspaceRef::resolved(handle);
        self.privileges.add(kind, keyspace.path());
        Ok(keyspace)
    }

    pub(super) fn keyspace_for_read(&mut self, term: &KeyspaceTerm) -> Result<KeyspaceRef> {
        self.keyspace(term, PrivilegeKind::Select)
    }

    pub(super) fn from_term(
        &mut self,
        term: &FromTerm,
        filter: Option<&Expr>,
        stages: &mut Stages,
    ) -> Result<()> {
        match term {
            FromTerm::Keyspace(ks) => {
                let keyspace = self.keyspace_for_read(ks)?;
                let alias = ks.as_alias();
                let scan = match &ks.keys {
                    Some(keys) => KeyScan {
                        keys: keys.clone(),
                        distinct: false,
                        est: OptEstimate::default(),
                    }
                    .into(),
                    None if self.subquery && self.config().require_subquery_keys => {
                        return Err(PlanError::SubqueryKeysRequired {
                            keyspace: keyspace.path(),
                        });
                    }
                    None => self.select_scan(&keyspace, alias, filter)?,
                };
                stages.push(scan);
                stages.push_lane(Fetch::new(keyspace, alias));
            }
            FromTerm::Expression { expr, alias } => {
                stages.push(ExpressionScan {
                    expr: expr.clone(),
                    alias: alias.clone(),
                    est: OptEstimate::default(),
                });
            }
            FromTerm::Subquery { select, alias } => {
                let op = self.select(select)?;
                stages.push(Alias::new(alias.clone(), op));
            }
            FromTerm::Join(join) => {
                self.from_term(&join.left, filter, stages)?;
                let op = self.join(join, false)?;
                stages.push_lane(op);
            }
            FromTerm::Nest(join) => {
                self.from_term(&join.left, filter, stages)?;
                let op = self.join(join, true)?;
                stages.push_lane(op);
            }
            FromTerm::Unnest(unnest) => {
                self.from_term(&unnest.left, filter, stages)?;
                stages.push_lane(Unnest {
                    alias: unnest.alias.clone(),
                    expr: unnest.expr.clone(),
                    outer: unnest.outer,
                    filter: None,
                    est: OptEstimate::default(),
                });
            }
        }
        Ok(())
    }

    fn join(&mut self, join: &JoinTerm, nest: bool) -> Result<Operator> {
        let keyspace = self.keyspace_for_read(&join.right)?;
        let alias = join.right.as_alias().to_string();
        let (on_clause, hint) = match &join.condition {
            JoinCondition::OnKeys(keys) => {
                let op: Operator = if nest {
                    let mut op = Nest::new(keyspace, alias, keys.clone());
                    op.outer = join.outer;
                    op.into()
                } else {
                    let mut op = Join::new(keyspace, alias, keys.clone());
                    op.outer = join.outer;
                    op.into()
                };
                return Ok(op);
            }
            JoinCondition::On { expr, hint } => (expr, hint),
        };

        let right_scan = match &join.right.keys {
            Some(keys) => KeyScan {
                keys: keys.clone(),
                distinct: false,
                est: OptEstimate::default(),
            }
            .into(),
            None => self.select_scan(&keyspace, &alias, Some(on_clause))?,
        };
        let child: Operator = Sequence::new(vec![right_scan, Fetch::new(keyspace, &alias).into()]).into();

        let mut hint_error = None;
        if let JoinHint::UseHash { build } = hint {
            if !self.config().hash_join_hints {
                hint_error = Some("hash join hints are disabled".to_string());
            } else if !*build {
                hint_error = Some("hash join with the right side as probe is not supported".to_string());
            } else {
                let (build_exprs, probe_exprs) = equi_join_keys(on_clause, &alias);
                if build_exprs.is_empty() {
                    hint_error = Some("no equality predicate usable for a hash join".to_string());
                } else if nest {
                    return Ok(HashNest {
                        outer: join.outer,
                        on_clause: on_clause.clone(),
                        filter: None,
                        hint_error: None,
                        build_exprs,
                        probe_exprs,
                        build_alias: alias,
                        child: Box::new(child),
                        est: OptEstimate::default(),
                    }
                    .into());
                } else {
                    return Ok(HashJoin {
                        outer: join.outer,
                        on_clause: on_clause.clone(),
                        filter: None,
                        hint_error: None,
                        build_exprs,
                        probe_exprs,
                        build_aliases: vec![alias],
                        child: Box::new(child),
                        est: OptEstimate::default(),
                    }
                    .into());
                }
            }
        }
        if let Some(reason) = &hint_error {
            trace!(alias = %alias, reason = %reason, "plan.join.hint_not_followed");
        }

        let op: Operator = if nest {
            NestedLoopNest {
                alias,
                outer: join.outer,
                on_clause: on_clause.clone(),
                filter: None,
                hint_error,
                child: Box::new(child),
                est: OptEstimate::default(),
            }
            .into()
        } else {
            NestedLoopJoin {
                alias,
                outer: join.outer,
                on_clause: on_clause.clone(),
                filter: None,
                hint_error,
                child: Box::new(child),
                est: OptEstimate::default(),
            }
            .into()
        };
        Ok(op)
    }

    /// Picks the access path for a keyspace term without `USE KEYS`.
    ///
    /// Every secondary index whose leading key is constrained by a conjunct
    /// of `filter` contributes an `IndexScan`; several such scans are
    /// intersected. Without any, the primary index is scanned.
    pub(super) fn select_scan(&self, keyspace: &KeyspaceRef, alias: &str, filter: Option<&Expr>) -> Result<Operator> {
        let indexes = self
            .catalog()
            .indexes(&keyspace.namespace, &keyspace.keyspace)?;
        let conjuncts = filter.map(Expr::conjuncts).unwrap_or_default();
        let mut scans = Vec::new();
        for index in indexes.iter().filter(|index| !index.primary) {
            let Some(leading) = index.keys.first() else {
                continue;
            };
            let key = leading_key_spans(&conjuncts, alias, leading);
            if key.absorbed == 0 {
                continue;
            }
            let exact = !key.lossy && key.absorbed == conjuncts.len();
            let spans = key
                .ranges
                .into_iter()
                .map(|range| Span::new(range, exact))
                .collect();
            trace!(keyspace = %keyspace.path(), index = %index.name, exact, "plan.select_scan.index");
            scans.push(index_scan(keyspace, alias, index, spans));
        }
        match scans.len() {
            0 => {}
            1 => return Ok(scans.remove(0)),
            _ => return Ok(IntersectScan::new(scans).into()),
        }
        match self
            .catalog()
            .primary_index(&keyspace.namespace, &keyspace.keyspace)?
        {
            Some(primary) => Ok(PrimaryScan::new(keyspace.clone(), IndexRef::resolved(primary)).into()),
            None => Err(PlanError::NoPrimaryIndex {
                keyspace: keyspace.path(),
            }),
        }
    }
}

fn index_scan(keyspace: &KeyspaceRef, alias: &str, index: &Arc<IndexHandle>, spans: Vec<Span>) -> Operator {
    IndexScan::new(
        keyspace.clone(),
        alias,
        IndexRef::resolved(Arc::clone(index)),
        spans,
    )
    .into()
}

/// Ranges one index key takes from the conjuncts of a filter.
struct KeySpans {
    ranges: Vec<Range>,
    /// Conjuncts turned into ranges.
    absorbed: usize,
    /// Some absorbed conjunct is only approximated by `ranges`.
    lossy: bool,
}

/// Ranges on `alias.key` implied by the conjuncts. Equality and IN lists
/// intersect into a point set, which the range bounds then narrow.
fn leading_key_spans(conjuncts: &[&Expr], alias: &str, key: &str) -> KeySpans {
    let mut points: Option<Vec<Expr>> = None;
    let mut low: Option<(Expr, bool)> = None;
    let mut high: Option<(Expr, bool)> = None;
    let mut absorbed = 0;
    let mut lossy = false;
    for conjunct in conjuncts {
        let Expr::Binary(op, left, right) = conjunct else {
            continue;
        };
        let values = if *op == BinaryOp::In {
            if left.path_below(alias).as_deref() != Some(key) {
                continue;
            }
            let Expr::Constant(Value::Array(values)) = right.as_ref() else {
                continue;
            };
            values.iter().cloned().map(Expr::Constant).collect()
        } else {
            let (op, value) = if left.path_below(alias).as_deref() == Some(key) && right.is_constant() {
                (*op, right.as_ref().clone())
            } else if right.path_below(alias).as_deref() == Some(key) && left.is_constant() {
                match op.flipped() {
                    Some(flipped) => (flipped, left.as_ref().clone()),
                    None => continue,
                }
            } else {
                continue;
            };
            match op {
                BinaryOp::Eq => vec![value],
                BinaryOp::Gt | BinaryOp::Ge => {
                    lossy |= tighten(&mut low, value, op == BinaryOp::Ge, Ordering::Greater);
                    absorbed += 1;
                    continue;
                }
                BinaryOp::Lt | BinaryOp::Le => {
                    lossy |= tighten(&mut high, value, op == BinaryOp::Le, Ordering::Less);
                    absorbed += 1;
                    continue;
                }
                _ => continue,
            }
        };
        points = Some(match points {
            None => values,
            Some(prev) => {
                let (kept, unsure) = intersect_points(prev, &values);
                lossy |= unsure;
                kept
            }
        });
        absorbed += 1;
    }

    let ranges = match points {
        Some(points) => {
            let mut ranges = Vec::with_capacity(points.len());
            for point in points {
                match within(&point, low.as_ref(), high.as_ref()) {
                    Some(true) => ranges.push(Range::point(point)),
                    Some(false) => {}
                    None => {
                        lossy = true;
                        ranges.push(Range::point(point));
                    }
                }
            }
            if ranges.is_empty() {
                ranges.push(Range::empty());
            }
            ranges
        }
        None if low.is_some() || high.is_some() => vec![between(low, high)],
        None => Vec::new(),
    };
    KeySpans {
        ranges,
        absorbed,
        lossy,
    }
}

/// Keeps the tighter of the current bound and `value`. `tighter` is how a
/// narrowing bound orders against the current one on this side. Returns
/// true when the two cannot be compared; the current bound is kept then.
fn tighten(slot: &mut Option<(Expr, bool)>, value: Expr, inclusive: bool, tighter: Ordering) -> bool {
    let Some((current, current_inclusive)) = slot.as_mut() else {
        *slot = Some((value, inclusive));
        return false;
    };
    match collate_bounds(&value, current) {
        Some(Ordering::Equal) => {
            *current_inclusive &= inclusive;
            false
        }
        Some(order) if order == tighter => {
            *current = value;
            *current_inclusive = inclusive;
            false
        }
        Some(_) => false,
        None => true,
    }
}

/// Points of `prev` also present in `next`. Points that cannot be compared
/// are kept and reported.
fn intersect_points(prev: Vec<Expr>, next: &[Expr]) -> (Vec<Expr>, bool) {
    let mut unsure = false;
    let mut kept = Vec::with_capacity(prev.len());
    for point in prev {
        let mut keep = false;
        for other in next {
            match collate_bounds(&point, other) {
                Some(Ordering::Equal) => keep = true,
                Some(_) => {}
                None => {
                    unsure = true;
                    keep = true;
                }
            }
        }
        if keep {
            kept.push(point);
        }
    }
    (kept, unsure)
}

/// Whether `point` lies inside the bounds; `None` when it cannot be told.
fn within(point: &Expr, low: Option<&(Expr, bool)>, high: Option<&(Expr, bool)>) -> Option<bool> {
    if let Some((low, inclusive)) = low {
        match collate_bounds(point, low)? {
            Ordering::Less => return Some(false),
            Ordering::Equal if !inclusive => return Some(false),
            _ => {}
        }
    }
    if let Some((high, inclusive)) = high {
        match collate_bounds(point, high)? {
            Ordering::Greater => return Some(false),
            Ordering::Equal if !inclusive => return Some(false),
            _ => {}
        }
    }
    Some(true)
}

fn between(low: Option<(Expr, bool)>, high: Option<(Expr, bool)>) -> Range {
    let low_inclusive = low.as_ref().is_some_and(|(_, inclusive)| *inclusive);
    let high_inclusive = high.as_ref().is_some_and(|(_, inclusive)| *inclusive);
    let inclusion = match (low_inclusive, high_inclusive) {
        (true, true) => Inclusion::Both,
        (true, false) => Inclusion::Low,
        (false, true) => Inclusion::High,
        (false, false) => Inclusion::Neither,
    };
    Range {
        low: low.map(|(value, _)| value),
        high: high.map(|(value, _)| value),
        inclusion,
        flags: 0,
    }
}

/// Equality conjuncts of an ON clause that compare the right alias with
/// the left side: `(build side, probe side)` expression lists.
fn equi_join_keys(on_clause: &Expr, alias: &str) -> (Vec<Expr>, Vec<Expr>) {
    let mut build = Vec::new();
    let mut probe = Vec::new();
    for conjunct in on_clause.conjuncts() {
        let Expr::Binary(BinaryOp::Eq, left, right) = conjunct else {
            continue;
        };
        let only_right = |e: &Expr| {
            let ids = e.identifiers();
            !ids.is_empty() && ids.iter().all(|id| id == alias)
        };
        let no_right = |e: &Expr| !e.identifiers().contains(alias);
        if only_right(left) && no_right(right) {
            build.push(left.as_ref().clone());
            probe.push(right.as_ref().clone());
        } else if only_right(right) && no_right(left) {
            build.push(right.as_ref().clone());
            probe.push(left.as_ref().clone());
        }
    }
    (build, probe)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{builder, catalog, names, select};
    use super::super::Builder;
    use super::*;
    use crate::algebra::Statement;
    use crate::config::PlannerConfig;
    use crate::expr::parse_select;

    fn scan_of(plan: &Operator) -> Option<&Operator> {
        match plan {
            Operator::PrimaryScan(_)
            | Operator::IndexScan(_)
            | Operator::IntersectScan(_)
            | Operator::KeyScan(_) => Some(plan),
            other => other.children().into_iter().find_map(scan_of),
        }
    }

    #[test]
    fn equality_on_leading_key_uses_the_index() {
        let plan = builder()
            .build(&select("select * from `orders` as `o` where `o`.`city` = \"Oslo\""))
            .expect("build");
        match scan_of(&plan) {
            Some(Operator::IndexScan(scan)) => {
                assert_eq!(scan.index.name, "idx_city");
                assert_eq!(scan.spans.len(), 1);
                assert!(scan.spans[0].exact);
                assert_eq!(scan.alias, "o");
            }
            other => panic!("unexpected scan: {other:?}"),
        }
    }

    #[test]
    fn range_bounds_merge_into_one_span() {
        let plan = builder()
            .build(&select(
                "select * from `orders` as `o` where `o`.`total` > 10 and `o`.`total` <= 20 and `o`.`kind` = 1",
            ))
            .expect("build");
        match scan_of(&plan) {
            Some(Operator::IndexScan(scan)) => {
                let range = &scan.spans[0].ranges[0];
                assert_eq!(range.low, Some(Expr::constant(10)));
                assert_eq!(range.high, Some(Expr::constant(20)));
                assert_eq!(range.inclusion, Inclusion::High);
                assert!(!scan.spans[0].exact);
            }
            other => panic!("unexpected scan: {other:?}"),
        }
    }

    fn index_spans(where_: &str) -> Vec<Span> {
        let text = format!("select * from `orders` as `o` where {where_}");
        let plan = builder().build(&select(&text)).expect("build");
        match scan_of(&plan) {
            Some(Operator::IndexScan(scan)) => scan.spans.clone(),
            other => panic!("unexpected scan: {other:?}"),
        }
    }

    #[test]
    fn conflicting_equalities_leave_an_empty_span() {
        let spans = index_spans("`o`.`city` = \"a\" and `o`.`city` = \"b\"");
        assert!(crate::plan::spans_empty(&spans));
        assert!(spans.iter().all(|span| span.exact));

        let spans = index_spans("`o`.`city` in [\"a\", \"b\"] and `o`.`city` = \"b\"");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].ranges[0], Range::point(Expr::constant("b")));
        assert!(spans[0].exact);
    }

    #[test]
    fn points_are_checked_against_range_bounds() {
        let spans = index_spans("`o`.`city` = \"a\" and `o`.`city` > \"z\"");
        assert!(crate::plan::spans_empty(&spans));

        let spans = index_spans("`o`.`city` = \"m\" and `o`.`city` > \"a\"");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].ranges[0], Range::point(Expr::constant("m")));
        assert!(spans[0].exact);
    }

    #[test]
    fn repeated_bounds_keep_the_tighter_one() {
        let spans = index_spans("`o`.`total` > 10 and `o`.`total` > 5");
        let range = &spans[0].ranges[0];
        assert_eq!(range.low, Some(Expr::constant(10)));
        assert_eq!(range.inclusion, Inclusion::Neither);
        assert!(spans[0].exact);

        let spans = index_spans("`o`.`total` <= 20 and `o`.`total` < 20");
        let range = &spans[0].ranges[0];
        assert_eq!(range.high, Some(Expr::constant(20)));
        assert_eq!(range.inclusion, Inclusion::Neither);
    }

    #[test]
    fn unabsorbed_conjuncts_need_a_filter() {
        let spans = index_spans("`o`.`total` > 10 and `o`.`total` > `o`.`floor`");
        assert!(!spans[0].exact);
    }

    #[test]
    fn incomparable_bounds_are_reported() {
        let mut low = Some((Expr::ident("p"), true));
        assert!(tighten(&mut low, Expr::constant(3), false, Ordering::Greater));
        assert_eq!(low, Some((Expr::ident("p"), true)));
    }

    #[test]
    fn several_indexes_are_intersected() {
        let plan = builder()
            .build(&select(
                "select * from `orders` as `o` where `o`.`city` = \"Oslo\" and 5 < `o`.`total`",
            ))
            .expect("build");
        match scan_of(&plan) {
            Some(Operator::IntersectScan(scan)) => assert_eq!(scan.scans.len(), 2),
            other => panic!("unexpected scan: {other:?}"),
        }
    }

    #[test]
    fn in_list_produces_point_spans() {
        let plan = builder()
            .build(&select("select * from `orders` as `o` where `o`.`city` in [\"a\", \"b\"]"))
            .expect("build");
        match scan_of(&plan) {
            Some(Operator::IndexScan(scan)) => assert_eq!(scan.spans.len(), 2),
            other => panic!("unexpected scan: {other:?}"),
        }
    }

    #[test]
    fn missing_primary_index_is_reported() {
        match builder().build(&select("select * from `archive`")) {
            Err(PlanError::NoPrimaryIndex { keyspace }) => assert_eq!(keyspace, "default:archive"),
            other => panic!("unexpected result: {other:?}"),
        }
        let keyed = builder()
            .build(&select("select * from `archive` use keys \"k1\""))
            .expect("build");
        assert!(matches!(scan_of(&keyed), Some(Operator::KeyScan(_))));
    }

    #[test]
    fn unknown_keyspace_is_a_resolution_error() {
        match builder().build(&select("select * from `nowhere`")) {
            Err(err @ PlanError::KeyspaceNotFound { .. }) => {
                assert_eq!(err.kind(), crate::error::ErrorKind::Resolution)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn lookup_join_runs_inside_the_left_lane() {
        let plan = builder()
            .build(&select(
                "select * from `orders` as `o` join `customers` as `c` on keys `o`.`cid`",
            ))
            .expect("build");
        let order = names(&plan);
        let fetch = order.iter().position(|n| *n == "Fetch").expect("fetch");
        let join = order.iter().position(|n| *n == "Join").expect("join");
        assert_eq!(join, fetch + 1);
        assert_eq!(order.iter().filter(|n| **n == "Parallel").count(), 1);
    }

    fn hash_join_select(build: bool) -> Statement {
        let mut select = parse_select(
            "select * from `orders` as `o` join `customers` as `c` on `c`.`id` = `o`.`cid`",
        )
        .expect("select");
        if let crate::algebra::SelectBody::Subselect(sub) = &mut select.body {
            if let Some(FromTerm::Join(join)) = &mut sub.from {
                if let JoinCondition::On { hint, .. } = &mut join.condition {
                    *hint = JoinHint::UseHash { build };
                }
            }
        }
        Statement::Select(select)
    }

    fn find_join(op: &Operator) -> Option<&Operator> {
        match op {
            Operator::HashJoin(_) | Operator::NestedLoopJoin(_) => Some(op),
            other => other.children().into_iter().find_map(find_join),
        }
    }

    #[test]
    fn hash_hint_uses_equi_join_keys() {
        let plan = builder().build(&hash_join_select(true)).expect("build");
        match find_join(&plan) {
            Some(Operator::HashJoin(join)) => {
                assert_eq!(join.build_exprs[0].canonical(), Expr::path("c", &["id"]).canonical());
                assert_eq!(join.probe_exprs[0].canonical(), Expr::path("o", &["cid"]).canonical());
                assert_eq!(join.build_aliases, vec!["c".to_string()]);
            }
            other => panic!("unexpected join: {other:?}"),
        }
    }

    #[test]
    fn hash_hint_falls_back_when_disabled() {
        let config = PlannerConfig {
            hash_join_hints: false,
            ..PlannerConfig::default()
        };
        let plan = Builder::new(config, catalog())
            .build(&hash_join_select(true))
            .expect("build");
        match find_join(&plan) {
            Some(Operator::NestedLoopJoin(join)) => assert!(join.hint_error.is_some()),
            other => panic!("unexpected join: {other:?}"),
        }
    }
}
