#![allow(missing_docs)]

use std::sync::Arc;

use docplan::algebra::Statement;
use docplan::catalog::{Catalog, InMemoryCatalog};
use docplan::config::DEFAULT_NAMESPACE;
use docplan::expr::parse_select;
use docplan::plan::{Operator, Prepared};
use docplan::{Builder, GetOptions, PlanError, PlannerConfig, PreparedCache};

const CITY_QUERY: &str = "select `o`.`id` from `orders` as `o` where `o`.`city` = \"Oslo\"";

fn catalog() -> Arc<InMemoryCatalog> {
    Arc::new(
        InMemoryCatalog::new()
            .with_primary_index("orders")
            .with_index("orders", "idx_city", &["city"]),
    )
}

fn prepare(builder: &Builder, name: &str, text: &str) -> Prepared {
    let select = parse_select(text).expect("parse");
    builder
        .prepare(&Statement::Select(select), text)
        .expect("prepare")
        .with_name(name)
}

fn index_ids(op: &Operator, out: &mut Vec<String>) {
    if let Operator::IndexScan(scan) = op {
        out.push(scan.index.id.clone());
    }
    for child in op.children() {
        index_ids(child, out);
    }
}

#[test]
fn shipped_plan_verifies_against_another_catalog() {
    let builder = Builder::new(PlannerConfig::default(), catalog());
    let mut prepared = prepare(&builder, "by_city", CITY_QUERY);
    let encoded = prepared.compute_encoded_plan().expect("encode").to_string();

    let remote = catalog();
    let mut shipped = Prepared::decode_encoded(&encoded).expect("decode");
    assert!(shipped.verify(remote.as_ref()));
    assert!(shipped.readonly());
    assert!(shipped.keyspaces().contains("default:orders"));

    let empty = InMemoryCatalog::new();
    let mut shipped = Prepared::decode_encoded(&encoded).expect("decode");
    assert!(!shipped.verify(&empty));
}

#[test]
fn recreated_index_refreshes_the_handle() {
    let catalog = catalog();
    let builder = Builder::new(PlannerConfig::default(), catalog.clone());
    let mut prepared = prepare(&builder, "by_city", CITY_QUERY);
    let mut before = Vec::new();
    index_ids(&prepared.operator, &mut before);
    assert_eq!(before.len(), 1);

    assert!(catalog.drop_index(DEFAULT_NAMESPACE, "orders", "idx_city"));
    assert!(!prepared.verify(catalog.as_ref()));

    catalog
        .create_index(DEFAULT_NAMESPACE, "orders", "idx_city", &["city"])
        .expect("recreate");
    assert!(prepared.verify(catalog.as_ref()));
    let mut after = Vec::new();
    index_ids(&prepared.operator, &mut after);
    assert_ne!(before, after);
    let current = catalog
        .index(DEFAULT_NAMESPACE, "orders", "idx_city")
        .expect("index");
    assert_eq!(after, vec![current.id.clone()]);
}

#[test]
fn cache_reprepares_from_text_after_an_index_drop() {
    let catalog = catalog();
    let builder = Builder::new(PlannerConfig::default(), catalog.clone());
    let cache = PreparedCache::from_config(builder.config());
    cache
        .add(prepare(&builder, "by_city", CITY_QUERY))
        .expect("add");

    catalog.drop_index(DEFAULT_NAMESPACE, "orders", "idx_city");
    let fresh = cache
        .get("by_city", GetOptions::execute(), catalog.as_ref(), |old| {
            let select = parse_select(&old.text)?;
            builder.prepare(&Statement::Select(select), &old.text)
        })
        .expect("reprepared");
    let mut ids = Vec::new();
    index_ids(&fresh.operator, &mut ids);
    assert!(ids.is_empty(), "falls back to the primary index");
    assert_eq!(fresh.name, "by_city");
    assert_eq!(cache.uses("by_city"), Some(1));
}

#[test]
fn dropped_keyspace_evicts_and_fails_lookup() {
    let catalog = catalog();
    let builder = Builder::new(PlannerConfig::default(), catalog.clone());
    let cache = PreparedCache::new(8);
    cache.add(prepare(&builder, "all", "select * from `orders`")).expect("add");

    catalog.drop_keyspace(DEFAULT_NAMESPACE, "orders");
    let result = cache.get("all", GetOptions::execute(), catalog.as_ref(), |old| {
        let select = parse_select(&old.text)?;
        builder.prepare(&Statement::Select(select), &old.text)
    });
    match result {
        Err(PlanError::KeyspaceNotFound { keyspace, .. }) => assert_eq!(keyspace, "orders"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(cache.invalidate_keyspace("default:orders"), 1);
    assert_eq!(cache.count(), 0);
}
