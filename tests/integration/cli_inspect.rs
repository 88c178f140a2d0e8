#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const CATALOG: &str = r##"
[[keyspace]]
name = "orders"
primary_index = "#primary"

[[keyspace.index]]
name = "idx_city"
keys = ["city"]
"##;

const QUERY: &str = "select `o`.`id` from `orders` as `o` where `o`.`city` = \"Oslo\"\n";

struct Fixture {
    _dir: TempDir,
    catalog: PathBuf,
    query: PathBuf,
    plan: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let catalog = dir.path().join("catalog.toml");
    let query = dir.path().join("query.sql");
    let plan = dir.path().join("plan.json");
    fs::write(&catalog, CATALOG).expect("write catalog");
    fs::write(&query, QUERY).expect("write query");

    let output = cargo_bin_cmd!("plan-inspect")
        .args(["--format", "json", "plan", "--name", "by_city", "--catalog"])
        .arg(&catalog)
        .arg(&query)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    fs::write(&plan, &output).expect("write plan");
    Fixture {
        _dir: dir,
        catalog,
        query,
        plan,
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

#[test]
fn plan_writes_a_named_envelope() {
    let fx = fixture();
    let body = read_json(&fx.plan);
    assert_eq!(body["name"], "by_city");
    assert_eq!(body["operator"]["#operator"], "Sequence");
    assert!(body["text"].as_str().expect("text").starts_with("select"));
    assert!(fx.query.exists());
}

#[test]
fn explain_prints_one_operator_per_line() {
    let fx = fixture();
    let output = cargo_bin_cmd!("plan-inspect")
        .arg("explain")
        .arg(&fx.plan)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let first = text.lines().next().expect("root line");
    assert!(first.starts_with("Sequence"));
    assert!(text.lines().any(|line| line.trim_start().starts_with("IndexScan")));
    assert!(text.lines().any(|line| line.trim_start().starts_with("Stream")));
}

#[test]
fn verify_reports_stale_plans_with_exit_code() {
    let fx = fixture();
    cargo_bin_cmd!("plan-inspect")
        .arg("verify")
        .arg(&fx.plan)
        .arg("--catalog")
        .arg(&fx.catalog)
        .assert()
        .success()
        .stdout("ok\n");

    let dir = TempDir::new().expect("tempdir");
    let bare = dir.path().join("bare.toml");
    fs::write(&bare, "[[keyspace]]\nname = \"orders\"\nprimary_index = \"#primary\"\n")
        .expect("write catalog");
    cargo_bin_cmd!("plan-inspect")
        .arg("verify")
        .arg(&fx.plan)
        .arg("--catalog")
        .arg(&bare)
        .assert()
        .code(2)
        .stdout("stale\n");
}

#[test]
fn encode_then_decode_restores_the_envelope() {
    let fx = fixture();
    let encoded = cargo_bin_cmd!("plan-inspect")
        .arg("encode")
        .arg(&fx.plan)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let encoded_path = fx.plan.with_extension("b64");
    fs::write(&encoded_path, &encoded).expect("write encoded");

    let decoded = cargo_bin_cmd!("plan-inspect")
        .arg("decode")
        .arg(&encoded_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let decoded: Value = serde_json::from_slice(&decoded).expect("json");
    let original = read_json(&fx.plan);
    assert_eq!(decoded["operator"], original["operator"]);
    assert_eq!(decoded["name"], "by_city");
    assert_eq!(
        decoded["encoded_plan"].as_str().expect("encoded"),
        String::from_utf8(encoded).expect("utf8").trim()
    );
}

#[test]
fn bad_input_fails_with_a_coded_error() {
    let dir = TempDir::new().expect("tempdir");
    let junk = dir.path().join("junk.b64");
    fs::write(&junk, "not an encoded plan").expect("write");
    let output = cargo_bin_cmd!("plan-inspect")
        .arg("decode")
        .arg(&junk)
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("[EncodedPlan]"), "{stderr}");
}
