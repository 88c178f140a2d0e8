//! Prepared statements: a finished plan plus what callers need to reuse it.
//!
//! The encoded plan is `base64(snappy(json))` of the envelope without the
//! encoded plan itself, so any node can rebuild an identical [`Prepared`] from
//! the string alone.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{PlanError, Result};
use crate::expr::IdentKind;

use super::keyspaces::KeyspaceCollector;
use super::scope::{ScopeContext, VisibleNames};
use super::Operator;

/// A built plan with its name, source text, and result signature.
#[derive(Clone, Debug, PartialEq)]
pub struct Prepared {
    /// Root operator.
    pub operator: Operator,
    /// Result shape, opaque to the planner.
    pub signature: Value,
    /// Name the statement is cached under; empty for anonymous statements.
    pub name: String,
    /// Statement text.
    pub text: String,
    /// Portable form of this envelope; empty until computed.
    pub encoded_plan: String,
    /// Optimizer hints reported with the plan.
    pub optimizer_hints: Option<Value>,
    /// Plans of correlated sub-queries, keyed by their text.
    pub subquery_plans: BTreeMap<String, Operator>,
    /// Outer names each correlated sub-query plan was classified against.
    pub subquery_scopes: BTreeMap<String, VisibleNames>,
    /// Hash of the root plan.
    pub plan_hash: u64,
}

impl Prepared {
    /// Wraps `operator`.
    pub fn new(operator: Operator, signature: Value) -> Self {
        let plan_hash = operator.plan_hash();
        Self {
            operator,
            signature,
            name: String::new(),
            text: String::new(),
            encoded_plan: String::new(),
            optimizer_hints: None,
            subquery_plans: BTreeMap::new(),
            subquery_scopes: BTreeMap::new(),
            plan_hash,
        }
    }

    /// Sets the cache name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the statement text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Envelope fields without `encoded_plan`.
    fn encode_body(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("name".into(), Value::String(self.name.clone()));
        map.insert("operator".into(), self.operator.encode());
        map.insert("signature".into(), self.signature.clone());
        map.insert("text".into(), Value::String(self.text.clone()));
        if let Some(hints) = &self.optimizer_hints {
            map.insert("optimizer_hints".into(), hints.clone());
        }
        if !self.subquery_plans.is_empty() {
            let plans = self
                .subquery_plans
                .iter()
                .map(|(text, plan)| (text.clone(), plan.encode()))
                .collect();
            map.insert("subqueries".into(), Value::Object(plans));
        }
        if !self.subquery_scopes.is_empty() {
            let scopes = self
                .subquery_scopes
                .iter()
                .map(|(text, names)| {
                    let names = names
                        .iter()
                        .map(|(name, kind)| (name.clone(), Value::from(kind.as_str())))
                        .collect();
                    (text.clone(), Value::Object(names))
                })
                .collect();
            map.insert("subquery_scopes".into(), Value::Object(scopes));
        }
        map
    }

    /// Full envelope.
    pub fn encode(&self) -> Value {
        let mut map = self.encode_body();
        if !self.encoded_plan.is_empty() {
            map.insert("encoded_plan".into(), Value::String(self.encoded_plan.clone()));
        }
        Value::Object(map)
    }

    /// Envelope for EXPLAIN: root cost and cardinality repeated at the top.
    pub fn encode_for_explain(&self) -> Value {
        let mut map = self.encode_body();
        if let Some(est) = self.operator.estimate() {
            if let Some(cost) = est.cost.and_then(serde_json::Number::from_f64) {
                map.insert("cost".into(), Value::Number(cost));
            }
            if let Some(card) = est.cardinality.and_then(serde_json::Number::from_f64) {
                map.insert("cardinality".into(), Value::Number(card));
            }
        }
        Value::Object(map)
    }

    /// Decodes an envelope written by [`Prepared::encode`].
    pub fn decode(body: &Value) -> Result<Prepared> {
        let text_field = |key: &'static str| -> Result<String> {
            match body.get(key) {
                None | Some(Value::Null) => Ok(String::new()),
                Some(Value::String(text)) => Ok(text.clone()),
                Some(other) => Err(PlanError::invalid_field(
                    "Prepared",
                    key,
                    format!("expected string, found {other}"),
                )),
            }
        };
        let root = body.get("operator").ok_or(PlanError::MissingField {
            operator: "Prepared",
            field: "operator",
        })?;
        let mut prepared = Prepared::new(
            Operator::decode(root)?,
            body.get("signature").cloned().unwrap_or(Value::Null),
        );
        prepared.name = text_field("name")?;
        prepared.text = text_field("text")?;
        prepared.encoded_plan = text_field("encoded_plan")?;
        prepared.optimizer_hints = body.get("optimizer_hints").filter(|v| !v.is_null()).cloned();
        prepared.subquery_scopes = decode_scopes(body.get("subquery_scopes"))?;
        match body.get("subqueries") {
            None | Some(Value::Null) => {}
            Some(Value::Object(plans)) => {
                for (text, plan) in plans {
                    let outer = prepared.subquery_scopes.get(text);
                    let seeded = outer.map(ScopeContext::seeded).unwrap_or_default();
                    let mut scope = seeded.child();
                    let plan = Operator::decode_with(plan, Some(&mut scope))?;
                    prepared.subquery_plans.insert(text.clone(), plan);
                }
            }
            Some(other) => {
                return Err(PlanError::invalid_field(
                    "Prepared",
                    "subqueries",
                    format!("expected object, found {other}"),
                ))
            }
        }
        Ok(prepared)
    }

    /// Computes and stores [`Prepared::encoded_plan`].
    pub fn compute_encoded_plan(&mut self) -> Result<&str> {
        let json = serde_json::to_vec(&Value::Object(self.encode_body())).map_err(|err| {
            PlanError::EncodedPlan {
                reason: err.to_string(),
            }
        })?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&json)
            .map_err(|err| PlanError::EncodedPlan {
                reason: err.to_string(),
            })?;
        self.encoded_plan = BASE64_ENGINE.encode(compressed);
        debug!(
            name = %self.name,
            plan_hash = self.plan_hash,
            bytes = self.encoded_plan.len(),
            "prepared.encoded"
        );
        Ok(&self.encoded_plan)
    }

    /// Rebuilds a prepared statement from its encoded plan.
    pub fn decode_encoded(encoded: &str) -> Result<Prepared> {
        let invalid = |reason: String| PlanError::EncodedPlan { reason };
        let compressed = BASE64_ENGINE
            .decode(encoded.trim())
            .map_err(|err| invalid(format!("base64: {err}")))?;
        let json = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|err| invalid(format!("snappy: {err}")))?;
        let body: Value =
            serde_json::from_slice(&json).map_err(|err| invalid(format!("json: {err}")))?;
        let mut prepared = Prepared::decode(&body)?;
        prepared.encoded_plan = encoded.trim().to_string();
        Ok(prepared)
    }

    /// Re-resolves the root plan and every sub-query plan.
    pub fn verify(&mut self, catalog: &dyn Catalog) -> bool {
        let ok = self.operator.verify(catalog)
            && self
                .subquery_plans
                .values_mut()
                .all(|plan| plan.verify(catalog));
        if !ok {
            debug!(name = %self.name, "prepared.verify_failed");
        }
        ok
    }

    /// False when executing the statement can change stored data.
    pub fn readonly(&self) -> bool {
        self.operator.readonly() && self.subquery_plans.values().all(Operator::readonly)
    }

    /// Keyspace paths referenced by any plan in the envelope.
    pub fn keyspaces(&self) -> BTreeSet<String> {
        let mut paths = KeyspaceCollector::collect(&self.operator);
        for plan in self.subquery_plans.values() {
            paths.extend(KeyspaceCollector::collect(plan));
        }
        paths
    }
}

fn decode_scopes(value: Option<&Value>) -> Result<BTreeMap<String, VisibleNames>> {
    let invalid = |reason: String| PlanError::invalid_field("Prepared", "subquery_scopes", reason);
    let scopes = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(scopes)) => scopes,
        Some(other) => return Err(invalid(format!("expected object, found {other}"))),
    };
    let mut out = BTreeMap::new();
    for (text, names) in scopes {
        let Value::Object(names) = names else {
            return Err(invalid(format!("scope of {text:?} must be an object")));
        };
        let mut visible = VisibleNames::new();
        for (name, kind) in names {
            let kind = kind
                .as_str()
                .and_then(IdentKind::parse)
                .ok_or_else(|| invalid(format!("unknown kind {kind} for {name:?}")))?;
            visible.insert(name.clone(), kind);
        }
        out.insert(text.clone(), visible);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{IndexUsing, InMemoryCatalog};
    use crate::expr::Expr;
    use crate::plan::{Fetch, IndexRef, KeyspaceRef, Limit, Parallel, PrimaryScan, Sequence, Stream};
    use serde_json::json;

    fn prepared() -> Prepared {
        let mut root = Operator::from(Sequence::new(vec![
            PrimaryScan::new(
                KeyspaceRef::new("default", "orders"),
                IndexRef::named("#primary", IndexUsing::Gsi),
            )
            .into(),
            Parallel::new(Fetch::new(KeyspaceRef::new("default", "orders"), "o").into(), None).into(),
            Limit::new(Expr::constant(10)).into(),
            Stream::default().into(),
        ]));
        if let Some(est) = root.estimate_mut() {
            est.cost = Some(12.5);
            est.cardinality = Some(10.0);
        }
        Prepared::new(root, json!({"*": "*"}))
            .with_name("p1")
            .with_text("select * from orders limit 10")
    }

    #[test]
    fn encoded_plan_rebuilds_the_envelope() {
        let mut original = prepared();
        let encoded = original.compute_encoded_plan().expect("encode").to_string();
        let decoded = Prepared::decode_encoded(&encoded).expect("decode");
        assert_eq!(decoded.operator.encode(), original.operator.encode());
        assert_eq!(decoded.name, "p1");
        assert_eq!(decoded.plan_hash, original.plan_hash);
        assert_eq!(decoded.encoded_plan, encoded);
    }

    #[test]
    fn corrupt_encoded_plan_is_rejected() {
        for input in ["not base64!", "aGVsbG8="] {
            match Prepared::decode_encoded(input) {
                Err(PlanError::EncodedPlan { .. }) => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn explain_envelope_repeats_root_figures() {
        let body = prepared().encode_for_explain();
        assert_eq!(body["cost"], json!(12.5));
        assert_eq!(body["cardinality"], json!(10.0));
        assert!(prepared().encode().get("cost").is_none());
    }

    #[test]
    fn verify_covers_subquery_plans() {
        let catalog = InMemoryCatalog::new().with_primary_index("orders");
        let mut p = prepared();
        assert!(p.verify(&catalog));
        p.subquery_plans.insert(
            "select 1 from missing".into(),
            Fetch::new(KeyspaceRef::new("default", "missing"), "m").into(),
        );
        assert!(!p.verify(&catalog));
        assert!(p.keyspaces().contains("default:missing"));
        assert!(p.readonly());
    }
}
