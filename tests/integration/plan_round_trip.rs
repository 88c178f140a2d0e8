#![allow(missing_docs)]

use std::sync::Arc;

use docplan::algebra::Statement;
use docplan::catalog::InMemoryCatalog;
use docplan::expr::{parse_select, Expr, IdentKind};
use docplan::plan::{is_registered, registered_names, InitialProject, Operator, Prepared};
use docplan::{Builder, PlanError, PlannerConfig};
use proptest::prelude::*;
use serde_json::json;

fn builder() -> Builder {
    let catalog = InMemoryCatalog::new()
        .with_primary_index("orders")
        .with_index("orders", "idx_city", &["city"])
        .with_primary_index("customers");
    Builder::new(PlannerConfig::default(), Arc::new(catalog))
}

fn plan(text: &str) -> Operator {
    let select = parse_select(text).expect("parse");
    builder().build(&Statement::Select(select)).expect("build")
}

const QUERIES: &[&str] = &[
    "select * from `orders`",
    "select `o`.`id`, `o`.`total` from `orders` as `o` where `o`.`city` = \"Oslo\"",
    "select `o`.`city`, count(`o`.`id`) as `n` from `orders` as `o` group by `o`.`city` having count(`o`.`id`) > 2",
    "select distinct `o`.`city` from `orders` as `o` order by `o`.`city` offset 5 limit 10",
    "select `o`.`id` from `orders` as `o` join `customers` as `c` on keys `o`.`cid`",
    "select `o`.`id` from `orders` as `o` union select `c`.`id` from `customers` as `c`",
    "select raw `o`.`id` from `orders` as `o` let `t` = `o`.`total` where `t` > 3",
    "select `x`.`a` as `a` from (select `x`.`a` as `a` from `orders` as `x`) as `s`",
    "select (select raw `l`.`qty` from `orders` as `l` use keys (`o`.`lines`)) as `q` from `orders` as `o`",
];

#[test]
fn built_plans_survive_the_wire() {
    for text in QUERIES {
        let original = plan(text);
        let body = original.encode();
        let decoded = Operator::decode(&body).unwrap_or_else(|err| panic!("{text}: {err}"));
        assert_eq!(decoded.encode(), body, "{text}");
        assert_eq!(decoded, original, "{text}");
        assert_eq!(decoded.plan_hash(), original.plan_hash(), "{text}");
        assert_eq!(decoded.readonly(), original.readonly(), "{text}");
    }
}

#[test]
fn prepared_envelope_survives_encoding() {
    for text in QUERIES {
        let select = parse_select(text).expect("parse");
        let mut prepared = builder()
            .prepare(&Statement::Select(select), text)
            .expect("prepare")
            .with_name("q");
        let encoded = prepared.compute_encoded_plan().expect("encode").to_string();
        let decoded = Prepared::decode_encoded(&encoded).expect("decode");
        assert_eq!(decoded.encode(), prepared.encode(), "{text}");
        assert_eq!(decoded, prepared, "{text}");
        assert_eq!(decoded.text, *text);
    }
}

fn kind_of(expr: &Expr, name: &str) -> Option<IdentKind> {
    match expr {
        Expr::Identifier(ident) if ident.name == name => Some(ident.kind),
        _ => expr.children().into_iter().find_map(|c| kind_of(c, name)),
    }
}

fn outer_projection(op: &Operator) -> Option<&InitialProject> {
    match op {
        Operator::InitialProject(project) => Some(project),
        Operator::Alias(_) => None,
        other => other.children().into_iter().find_map(outer_projection),
    }
}

#[test]
fn from_subquery_aliases_stay_inside() {
    let original = plan("select `x`.`a` as `a` from (select `x`.`a` as `a` from `orders` as `x`) as `s`");
    let decoded = Operator::decode(&original.encode()).expect("decode");
    assert_eq!(decoded, original);
    let project = outer_projection(&decoded).expect("outer projection");
    let term = project.terms[0].expr.as_ref().expect("term");
    assert_eq!(kind_of(term, "x"), Some(IdentKind::Unresolved));
}

#[test]
fn every_registered_name_is_known() {
    let names: Vec<&str> = registered_names().collect();
    assert!(names.contains(&"Sequence"));
    assert!(names.contains(&"IndexScan"));
    assert!(names.contains(&"Merge"));
    for name in &names {
        assert!(is_registered(name), "{name}");
    }
    assert!(!is_registered("NoSuchOperator"));
}

#[test]
fn unknown_tags_and_missing_fields_are_decode_errors() {
    match Operator::decode(&json!({"#operator": "Teleport"})) {
        Err(PlanError::UnknownOperator { name }) => assert_eq!(name, "Teleport"),
        other => panic!("unexpected result: {other:?}"),
    }
    match Operator::decode(&json!({"#operator": "Filter"})) {
        Err(err) => assert_eq!(err.kind(), docplan::ErrorKind::Decode),
        other => panic!("unexpected result: {other:?}"),
    }
}

proptest! {
    #[test]
    fn paging_values_round_trip(offset in 0i64..10_000, limit in 1i64..10_000, by_city in any::<bool>()) {
        let order = if by_city { "`o`.`city`" } else { "`o`.`total`" };
        let text = format!(
            "select `o`.`id` from `orders` as `o` order by {order} offset {offset} limit {limit}"
        );
        let original = plan(&text);
        let decoded = Operator::decode(&original.encode()).expect("decode");
        prop_assert_eq!(decoded.encode(), original.encode());
        prop_assert_eq!(decoded.plan_hash(), original.plan_hash());
    }

    #[test]
    fn point_lookups_round_trip(city in "[A-Za-z]{1,12}") {
        let text = format!("select * from `orders` as `o` where `o`.`city` = \"{city}\"");
        let original = plan(&text);
        let body = original.encode();
        prop_assert!(body.to_string().contains(&city));
        let decoded = Operator::decode(&body).expect("decode");
        prop_assert_eq!(decoded.encode(), body);
    }
}
