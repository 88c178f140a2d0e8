#![allow(missing_docs)]

use std::sync::Arc;

use docplan::algebra::{
    Delete, Insert, InsertSource, KeyspaceTerm, Projection, ResultTerm, Statement,
};
use docplan::catalog::InMemoryCatalog;
use docplan::expr::{parse, parse_select};
use docplan::plan::{Operator, OptEstimate};
use docplan::{Builder, Estimator, PlannerConfig};

fn catalog() -> Arc<InMemoryCatalog> {
    Arc::new(
        InMemoryCatalog::new()
            .with_primary_index("orders")
            .with_index("orders", "idx_total", &["total"])
            .with_primary_index("customers"),
    )
}

fn build_with(config: PlannerConfig, text: &str) -> Operator {
    let select = parse_select(text).expect("parse");
    Builder::new(config, catalog())
        .build(&Statement::Select(select))
        .expect("build")
}

fn build(text: &str) -> Operator {
    build_with(PlannerConfig::default(), text)
}

/// Stage names of the statement body under `Sequence(Authorize(..), Stream)`.
fn stages(plan: &Operator) -> Vec<&'static str> {
    let Operator::Sequence(root) = plan else {
        panic!("unexpected root: {plan:?}");
    };
    assert_eq!(root.children.len(), 2);
    assert_eq!(root.children[1].name(), "Stream");
    let Operator::Authorize(auth) = &root.children[0] else {
        panic!("unexpected stage: {:?}", root.children[0]);
    };
    let Operator::Sequence(body) = auth.child.as_ref() else {
        panic!("unexpected body: {:?}", auth.child);
    };
    body.children.iter().map(Operator::name).collect()
}

fn lane(op: &Operator) -> Vec<&'static str> {
    let Operator::Parallel(par) = op else {
        panic!("unexpected stage: {op:?}");
    };
    let Operator::Sequence(seq) = par.child.as_ref() else {
        panic!("unexpected lane: {:?}", par.child);
    };
    seq.children.iter().map(Operator::name).collect()
}

fn body_children(plan: &Operator) -> &[Operator] {
    let Operator::Sequence(root) = plan else {
        panic!("unexpected root: {plan:?}");
    };
    match &root.children[0] {
        Operator::Authorize(auth) => match auth.child.as_ref() {
            Operator::Sequence(body) => &body.children,
            other => panic!("unexpected body: {other:?}"),
        },
        other => panic!("unexpected stage: {other:?}"),
    }
}

#[test]
fn plain_scan_fetches_and_projects_in_one_lane() {
    let plan = build("select `o`.`id` from `orders` as `o`");
    assert_eq!(stages(&plan), vec!["PrimaryScan", "Parallel"]);
    assert_eq!(
        lane(&body_children(&plan)[1]),
        vec!["Fetch", "InitialProject", "FinalProject"]
    );
}

#[test]
fn grouping_merges_partials_sequentially() {
    let plan = build(
        "select `o`.`city`, sum(`o`.`total`) as `s` from `orders` as `o` group by `o`.`city`",
    );
    assert_eq!(
        stages(&plan),
        vec!["PrimaryScan", "Parallel", "IntermediateGroup", "FinalGroup", "Parallel"]
    );
    let children = body_children(&plan);
    assert_eq!(
        lane(&children[1]),
        vec!["Fetch", "InitialGroup", "IntermediateGroup"]
    );
    assert_eq!(lane(&children[4]), vec!["InitialProject", "FinalProject"]);
}

#[test]
fn ordering_defers_the_final_projection() {
    let plan = build("select `o`.`id` from `orders` as `o` order by `o`.`total` limit 5");
    let names = stages(&plan);
    let order = names.iter().position(|n| *n == "Order").expect("order");
    let limit = names.iter().position(|n| *n == "Limit").expect("limit");
    assert!(order < limit);
    let children = body_children(&plan);
    match children.last() {
        Some(Operator::Parallel(par)) => assert_eq!(par.child.name(), "FinalProject"),
        other => panic!("unexpected final stage: {other:?}"),
    }
    assert!(!lane(&children[1]).contains(&"FinalProject"));
}

#[test]
fn parallel_stages_carry_the_configured_cap() {
    fn caps(op: &Operator, out: &mut Vec<Option<u32>>) {
        if let Operator::Parallel(par) = op {
            out.push(par.max_parallelism);
        }
        for child in op.children() {
            caps(child, out);
        }
    }
    let text = "select `o`.`city`, count(*) as `n` from `orders` as `o` group by `o`.`city`";
    let mut serial = Vec::new();
    caps(&build_with(PlannerConfig::serial(), text), &mut serial);
    assert!(!serial.is_empty());
    assert!(serial.iter().all(|cap| *cap == Some(1)));

    let mut open = Vec::new();
    caps(&build(text), &mut open);
    assert!(open.iter().all(Option::is_none));
}

#[test]
fn range_predicate_uses_the_secondary_index() {
    let plan = build("select * from `orders` as `o` where `o`.`total` >= 100");
    assert_eq!(stages(&plan)[0], "IndexScan");
    let lane = lane(&body_children(&plan)[1]);
    assert_eq!(lane[0], "Fetch");
    assert!(lane.contains(&"Filter"));
}

#[test]
fn mutations_are_not_readonly() {
    let builder = Builder::new(PlannerConfig::default(), catalog());
    let insert = Statement::Upsert(Insert {
        keyspace: KeyspaceTerm::new("customers"),
        source: InsertSource::Values(vec![docplan::algebra::ValuePair {
            key: parse("\"c1\"").expect("key"),
            value: parse("{\"name\": \"Ada\"}").expect("value"),
            options: None,
        }]),
        returning: Some(Projection::terms(vec![ResultTerm::star()])),
    });
    let plan = builder.build(&insert).expect("build");
    assert!(!plan.readonly());
    assert_eq!(stages(&plan), vec!["ValueScan", "Parallel"]);
    assert_eq!(
        lane(&body_children(&plan)[1]),
        vec!["SendUpsert", "InitialProject", "FinalProject"]
    );

    let delete = Statement::Delete(Delete {
        keyspace: KeyspaceTerm::new("orders").keys(parse("[\"k1\", \"k2\"]").expect("keys")),
        where_: None,
        limit: Some(parse("1").expect("limit")),
        returning: None,
    });
    let plan = builder.build(&delete).expect("build");
    assert_eq!(stages(&plan), vec!["KeyScan", "Parallel", "Limit", "Discard"]);
    assert!(!plan.readonly());
}

struct FlatCost;

impl Estimator for FlatCost {
    fn estimate(&self, op: &Operator) -> Option<OptEstimate> {
        Some(OptEstimate {
            cost: Some(op.node_count() as f64),
            cardinality: Some(10.0),
            ..OptEstimate::default()
        })
    }
}

#[test]
fn root_reports_the_final_stage_estimate() {
    let select = parse_select("select * from `orders`").expect("parse");
    let plan = Builder::new(PlannerConfig::default(), catalog())
        .with_estimator(Arc::new(FlatCost))
        .build(&Statement::Select(select))
        .expect("build");
    let est = plan.estimate().expect("root estimate");
    assert_eq!(est.cardinality, Some(10.0));
}
