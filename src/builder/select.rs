//! Query blocks, set operations, grouping, and paging.

use std::collections::BTreeMap;

use crate::algebra::{FromTerm, Select, SelectBody, SetOp, SetOpKind, Subselect};
use crate::error::{PlanError, Result};
use crate::expr::{collect_aggregates, collect_window_aggregates, AggregateFunc, Expr, SortTerm};
use crate::plan::{
    CountScan, Distinct, DummyScan, ExceptAll, Filter, FinalGroup, FinalProject, InitialGroup,
    InitialProject, IntermediateGroup, IntersectAll, Let, Limit, Offset, Operator, Order,
    OptEstimate, Parallel, Sequence, UnionAll, WindowAggregate, With,
};

use super::{Context, Stages};

/// Flags a query block inherits from its enclosing statement.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct BlockFlags {
    /// Rows must be unique across the whole block.
    pub distinct: bool,
    /// FinalProject runs after the enclosing ORDER BY.
    pub delay_projection: bool,
}

impl Context<'_> {
    pub(super) fn select(&mut self, select: &Select) -> Result<Operator> {
        let ordered = !select.order.is_empty();
        let (body, delayed) = match &select.body {
            SelectBody::Subselect(sub) => {
                let flags = BlockFlags {
                    distinct: false,
                    delay_projection: ordered,
                };
                (self.subselect(sub, flags, &select.order)?, ordered)
            }
            SelectBody::SetOp(op) => (self.set_op(op)?, false),
        };

        let paged = ordered || select.offset.is_some() || select.limit.is_some();
        let mut op = if paged {
            let mut children = match body {
                Operator::Sequence(seq) => seq.children,
                other => vec![other],
            };
            if ordered {
                children.push(Order::new(select.order.clone()).into());
            }
            if let Some(offset) = &select.offset {
                children.push(Offset::new(offset.clone()).into());
            }
            if let Some(limit) = &select.limit {
                children.push(Limit::new(limit.clone()).into());
            }
            if delayed {
                children.push(Parallel::new(FinalProject::default().into(), self.max_parallelism()).into());
            }
            Sequence::new(children).into()
        } else {
            body
        };

        if !select.with.is_empty() {
            op = With {
                bindings: select.with.clone(),
                child: Box::new(op),
            }
            .into();
        }
        Ok(op)
    }

    fn body(&mut self, body: &SelectBody, flags: BlockFlags) -> Result<Operator> {
        match body {
            SelectBody::Subselect(sub) => self.subselect(sub, flags, &[]),
            SelectBody::SetOp(op) => self.set_op(op),
        }
    }

    /// Both operands project locally; non-ALL forms de-duplicate each
    /// operand and the combined output.
    fn set_op(&mut self, op: &SetOp) -> Result<Operator> {
        let distinct = !op.all;
        let flags = BlockFlags {
            distinct,
            delay_projection: false,
        };
        let first = self.body(&op.first, flags)?;
        let second = self.body(&op.second, flags)?;
        let combined: Operator = match op.kind {
            SetOpKind::Union => UnionAll::new(vec![first, second]).into(),
            SetOpKind::Intersect => IntersectAll::new(first, second, distinct).into(),
            SetOpKind::Except => ExceptAll::new(first, second, distinct).into(),
        };
        if distinct {
            Ok(Sequence::new(vec![combined, Distinct::default().into()]).into())
        } else {
            Ok(combined)
        }
    }

    pub(super) fn subselect(
        &mut self,
        sub: &Subselect,
        flags: BlockFlags,
        order: &[SortTerm],
    ) -> Result<Operator> {
        if let Some(op) = self.fast_count(sub, flags)? {
            return Ok(op);
        }

        let par = self.max_parallelism();
        let mut stages = Stages::default();
        match &sub.from {
            Some(from) => self.from_term(from, sub.where_.as_ref(), &mut stages)?,
            None => stages.push(DummyScan::default()),
        }

        if !sub.let_.is_empty() {
            for binding in &sub.let_ {
                reject_aggregates(&binding.expr, "LET")?;
            }
            stages.push_lane(Let {
                bindings: sub.let_.clone(),
                est: OptEstimate::default(),
            });
        }
        if let Some(cond) = &sub.where_ {
            reject_aggregates(cond, "WHERE")?;
            stages.push_lane(Filter::new(cond.clone()));
        }

        let mut aggregates = BTreeMap::new();
        for term in &sub.projection.terms {
            if let Some(expr) = &term.expr {
                collect_aggregates(expr, &mut aggregates);
            }
        }
        if let Some(group) = &sub.group {
            for binding in &group.letting {
                collect_aggregates(&binding.expr, &mut aggregates);
            }
            if let Some(having) = &group.having {
                collect_aggregates(having, &mut aggregates);
            }
        }
        let grouped = sub.group.is_some() || !aggregates.is_empty();
        if flags.delay_projection {
            if grouped {
                for term in order {
                    collect_aggregates(&term.expr, &mut aggregates);
                }
            } else {
                for term in order {
                    reject_aggregates(&term.expr, "ORDER BY")?;
                }
            }
        }

        if grouped {
            let keys = sub.group.as_ref().map(|g| g.by.clone()).unwrap_or_default();
            let aggs: Vec<Expr> = aggregates.into_values().collect();
            stages.push_lane(InitialGroup::new(keys.clone(), aggs.clone()));
            stages.push_lane(IntermediateGroup::new(keys.clone(), aggs.clone()));
            stages.close_lane(par);
            stages.push(IntermediateGroup::new(keys.clone(), aggs.clone()));
            stages.push(FinalGroup::new(keys, aggs));
            if let Some(group) = &sub.group {
                if !group.letting.is_empty() {
                    stages.push_lane(Let {
                        bindings: group.letting.clone(),
                        est: OptEstimate::default(),
                    });
                }
                if let Some(having) = &group.having {
                    stages.push_lane(Filter::new(having.clone()));
                }
            }
        }

        let mut windows = BTreeMap::new();
        for term in &sub.projection.terms {
            if let Some(expr) = &term.expr {
                collect_window_aggregates(expr, &mut windows);
            }
        }
        if flags.delay_projection {
            for term in order {
                collect_window_aggregates(&term.expr, &mut windows);
            }
        }
        if !windows.is_empty() {
            stages.close_lane(par);
            for (sort, aggs) in window_groups(windows.into_values()) {
                if !sort.is_empty() {
                    stages.push(Order::new(sort));
                }
                stages.push(WindowAggregate {
                    aggregates: aggs,
                    est: OptEstimate::default(),
                });
            }
        }

        let distinct = sub.projection.distinct || flags.distinct;
        stages.push_lane(InitialProject::new(
            sub.projection.terms.clone(),
            sub.projection.raw,
        ));
        if distinct {
            stages.push_lane(Distinct::default());
        }
        if !flags.delay_projection {
            stages.push_lane(FinalProject::default());
        }
        stages.close_lane(par);
        if distinct {
            stages.push(Distinct::default());
        }
        Ok(stages.finish(par))
    }

    /// `SELECT COUNT(*) FROM ks` answered from keyspace metadata.
    fn fast_count(&mut self, sub: &Subselect, flags: BlockFlags) -> Result<Option<Operator>> {
        let Some(FromTerm::Keyspace(term)) = &sub.from else {
            return Ok(None);
        };
        let plain = term.keys.is_none()
            && sub.let_.is_empty()
            && sub.where_.is_none()
            && sub.group.is_none()
            && !sub.projection.distinct
            && !flags.distinct
            && !flags.delay_projection;
        let counts_rows = match sub.projection.terms.as_slice() {
            [term] => matches!(
                &term.expr,
                Some(Expr::Aggregate(agg))
                    if agg.func == AggregateFunc::Count
                        && agg.operand.is_none()
                        && !agg.distinct
                        && agg.window.is_none()
            ),
            _ => false,
        };
        if !plain || !counts_rows {
            return Ok(None);
        }
        let keyspace = self.keyspace_for_read(term)?;
        let scan = CountScan {
            keyspace,
            alias: term.as_alias().to_string(),
            terms: sub.projection.terms.clone(),
            raw: sub.projection.raw,
            est: OptEstimate::default(),
        };
        Ok(Some(Sequence::new(vec![scan.into()]).into()))
    }
}

fn reject_aggregates(expr: &Expr, clause: &'static str) -> Result<()> {
    let mut found = BTreeMap::new();
    collect_aggregates(expr, &mut found);
    match found.into_keys().next() {
        Some(aggregate) => Err(PlanError::InvalidAggregate { aggregate, clause }),
        None => Ok(()),
    }
}

/// Groups window aggregates by their sort requirement: partition keys
/// ascending, then the window's own order terms.
fn window_groups(aggs: impl Iterator<Item = Expr>) -> Vec<(Vec<SortTerm>, Vec<Expr>)> {
    let mut groups: BTreeMap<String, (Vec<SortTerm>, Vec<Expr>)> = BTreeMap::new();
    for agg in aggs {
        let Expr::Aggregate(inner) = &agg else {
            continue;
        };
        let Some(window) = &inner.window else {
            continue;
        };
        let mut sort: Vec<SortTerm> = window
            .partition_by
            .iter()
            .cloned()
            .map(SortTerm::asc)
            .collect();
        sort.extend(window.order_by.iter().cloned());
        let key = sort
            .iter()
            .map(SortTerm::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        groups
            .entry(key)
            .or_insert_with(|| (sort, Vec::new()))
            .1
            .push(agg);
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::{builder, names, select};
    use super::*;

    fn positions(names: &[&str], wanted: &str) -> Vec<usize> {
        names
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == wanted)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn group_by_stages_in_three_phases() {
        let plan = builder()
            .build(&select(
                "select `o`.`city`, count(*) from `orders` as `o` group by `o`.`city`",
            ))
            .expect("build");
        let order = names(&plan);
        let initial = positions(&order, "InitialGroup");
        let intermediate = positions(&order, "IntermediateGroup");
        let last = positions(&order, "FinalGroup");
        assert_eq!(initial.len(), 1);
        assert_eq!(intermediate.len(), 2);
        assert_eq!(last.len(), 1);
        assert!(initial[0] < intermediate[0]);
        assert!(intermediate[1] < last[0]);
    }

    #[test]
    fn grouping_stage_boundaries() {
        let plan = builder()
            .build(&select(
                "select count(*) as `n` from `orders` as `o` where `o`.`status` = \"open\" group by `o`.`city` having count(*) > 2",
            ))
            .expect("build");
        let Operator::Sequence(root) = &plan else {
            panic!("unexpected root: {plan:?}");
        };
        let Operator::Authorize(auth) = &root.children[0] else {
            panic!("unexpected stage: {:?}", root.children[0]);
        };
        let Operator::Sequence(body) = auth.child.as_ref() else {
            panic!("unexpected body: {:?}", auth.child);
        };
        let stages: Vec<_> = body.children.iter().map(Operator::name).collect();
        assert_eq!(
            stages,
            vec![
                "PrimaryScan",
                "Parallel",
                "IntermediateGroup",
                "FinalGroup",
                "Parallel"
            ]
        );
        let lane = names(&body.children[1]);
        assert_eq!(
            lane,
            vec![
                "Parallel",
                "Sequence",
                "Fetch",
                "Filter",
                "InitialGroup",
                "IntermediateGroup"
            ]
        );
        let tail = names(&body.children[4]);
        assert_eq!(
            tail,
            vec!["Parallel", "Sequence", "Filter", "InitialProject", "FinalProject"]
        );
    }

    #[test]
    fn order_by_defers_final_projection() {
        let plan = builder()
            .build(&select(
                "select `o`.`id` from `orders` as `o` order by `o`.`total` offset 5 limit 10",
            ))
            .expect("build");
        let order = names(&plan);
        let sort = positions(&order, "Order")[0];
        let offset = positions(&order, "Offset")[0];
        let limit = positions(&order, "Limit")[0];
        let project = positions(&order, "FinalProject");
        assert_eq!(project.len(), 1);
        assert!(sort < offset && offset < limit && limit < project[0]);
        assert!(positions(&order, "InitialProject")[0] < sort);
    }

    #[test]
    fn union_ends_with_sequential_distinct() {
        let union = builder()
            .build(&select("select `a` from `orders` union select `a` from `customers`"))
            .expect("build");
        let Operator::Sequence(root) = &union else {
            panic!("unexpected root: {union:?}");
        };
        let Operator::Authorize(auth) = &root.children[0] else {
            panic!("unexpected stage");
        };
        match auth.child.as_ref() {
            Operator::Sequence(seq) => {
                assert_eq!(seq.children.len(), 2);
                assert!(matches!(seq.children[0], Operator::UnionAll(_)));
                assert!(matches!(seq.children[1], Operator::Distinct(_)));
            }
            other => panic!("unexpected union plan: {other:?}"),
        }

        let all = builder()
            .build(&select(
                "select `a` from `orders` union all select `a` from `customers`",
            ))
            .expect("build");
        let Operator::Sequence(root) = &all else {
            panic!("unexpected root: {all:?}");
        };
        let Operator::Authorize(auth) = &root.children[0] else {
            panic!("unexpected stage");
        };
        assert!(matches!(auth.child.as_ref(), Operator::UnionAll(_)));
        assert!(positions(&names(&all), "Distinct").is_empty());
    }

    #[test]
    fn intersect_marks_operands_distinct() {
        let plan = builder()
            .build(&select(
                "select `a` from `orders` intersect select `a` from `customers`",
            ))
            .expect("build");
        let order = names(&plan);
        assert_eq!(positions(&order, "IntersectAll").len(), 1);
        // One per operand lane, one per operand tail, one after the combination.
        assert_eq!(positions(&order, "Distinct").len(), 5);
    }

    #[test]
    fn count_star_uses_the_fast_path() {
        let plan = builder()
            .build(&select("select count(*) from `orders`"))
            .expect("build");
        let order = names(&plan);
        assert_eq!(
            order,
            vec!["Sequence", "Authorize", "Sequence", "CountScan", "Stream"]
        );
        let filtered = builder()
            .build(&select("select count(*) from `orders` where `x` = 1"))
            .expect("build");
        assert!(!names(&filtered).contains(&"CountScan"));
    }

    #[test]
    fn aggregates_are_rejected_in_where() {
        match builder().build(&select("select 1 from `orders` where count(*) > 1")) {
            Err(PlanError::InvalidAggregate { clause, .. }) => assert_eq!(clause, "WHERE"),
            other => panic!("unexpected result: {other:?}"),
        }
        match builder().build(&select("select `a` from `orders` order by sum(`a`)")) {
            Err(PlanError::InvalidAggregate { clause, .. }) => assert_eq!(clause, "ORDER BY"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn window_aggregates_sort_before_projection() {
        let plan = builder()
            .build(&select(
                "select `o`.`id`, sum(`o`.`total`) over (partition by `o`.`city`) as `t` from `orders` as `o`",
            ))
            .expect("build");
        let order = names(&plan);
        let window = positions(&order, "WindowAggregate");
        assert_eq!(window.len(), 1);
        assert!(positions(&order, "Order")[0] < window[0]);
        assert!(window[0] < positions(&order, "InitialProject")[0]);
    }

    #[test]
    fn from_less_select_reads_a_dummy_row() {
        let plan = builder().build(&select("select 1 as `one`")).expect("build");
        assert!(names(&plan).contains(&"DummyScan"));
    }

    #[test]
    fn with_clause_wraps_the_body() {
        let plan = builder()
            .build(&select("with `lim` as (10) select `a` from `orders` limit `lim`"))
            .expect("build");
        assert!(names(&plan).contains(&"With"));
    }
}
