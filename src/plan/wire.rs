//! Field-level helpers shared by every operator codec.
//!
//! An encoded operator is a flat JSON object: `"#operator"` names the variant,
//! plain keys carry scalar and expression fields, and keys beginning with `~`
//! carry child operators. Expressions travel as canonical text.

use serde_json::{Map, Number, Value};

use crate::catalog::IndexUsing;
use crate::error::{PlanError, Result};
use crate::expr::{self, Expr, SortTerm};

use super::scope::ScopeContext;
use super::{IndexRef, KeyspaceRef, Operator, OptEstimate};

/// Discriminator key present on every encoded operator.
pub const OPERATOR_KEY: &str = "#operator";
/// Key of the optional estimate sub-object.
pub const ESTIMATES_KEY: &str = "optimizer_estimates";

/// Builds the JSON object for one operator.
pub struct Encoder {
    map: Map<String, Value>,
}

impl Encoder {
    pub(crate) fn new(name: &'static str) -> Self {
        let mut map = Map::new();
        map.insert(OPERATOR_KEY.to_string(), Value::String(name.to_string()));
        Self { map }
    }

    /// Writes a string field.
    pub fn str(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), Value::String(value.to_string()));
    }

    /// Writes a string field when present.
    pub fn opt_str(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.str(key, value);
        }
    }

    /// Writes a boolean only when it is set.
    pub fn flag(&mut self, key: &str, value: bool) {
        if value {
            self.map.insert(key.to_string(), Value::Bool(true));
        }
    }

    /// Writes an unsigned integer.
    pub fn u64(&mut self, key: &str, value: u64) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    /// Writes an arbitrary JSON value.
    pub fn value(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_string(), value);
    }

    /// Writes an expression as canonical text.
    pub fn expr(&mut self, key: &str, expr: &Expr) {
        self.str(key, &expr.canonical());
    }

    /// Writes an expression when present.
    pub fn opt_expr(&mut self, key: &str, expr: Option<&Expr>) {
        if let Some(expr) = expr {
            self.expr(key, expr);
        }
    }

    /// Writes a list of expressions; omitted when empty.
    pub fn exprs(&mut self, key: &str, exprs: &[Expr]) {
        if !exprs.is_empty() {
            let list = exprs
                .iter()
                .map(|e| Value::String(e.canonical()))
                .collect();
            self.map.insert(key.to_string(), Value::Array(list));
        }
    }

    /// Writes sort terms as `{"expr", "desc", "nulls_pos"}` objects.
    pub fn sort_terms(&mut self, key: &str, terms: &[SortTerm]) {
        let list = terms
            .iter()
            .map(|term| {
                let mut obj = Map::new();
                obj.insert("expr".into(), Value::String(term.expr.canonical()));
                if term.descending {
                    obj.insert("desc".into(), Value::Bool(true));
                }
                if let Some(first) = term.nulls_first {
                    let pos = if first { "first" } else { "last" };
                    obj.insert("nulls_pos".into(), Value::String(pos.into()));
                }
                Value::Object(obj)
            })
            .collect();
        self.map.insert(key.to_string(), Value::Array(list));
    }

    /// Writes a child operator.
    pub fn child(&mut self, key: &str, child: &Operator) {
        self.map.insert(key.to_string(), child.encode());
    }

    /// Writes a child operator when present.
    pub fn opt_child(&mut self, key: &str, child: Option<&Operator>) {
        if let Some(child) = child {
            self.child(key, child);
        }
    }

    /// Writes an ordered list of child operators.
    pub fn children(&mut self, key: &str, children: &[Operator]) {
        let list = children.iter().map(Operator::encode).collect();
        self.map.insert(key.to_string(), Value::Array(list));
    }

    /// Writes `namespace` and `keyspace`.
    pub fn keyspace(&mut self, keyspace: &KeyspaceRef) {
        self.str("namespace", &keyspace.namespace);
        self.str("keyspace", &keyspace.keyspace);
    }

    /// Writes `index`, `index_id`, and `using`.
    pub fn index(&mut self, index: &IndexRef) {
        self.str("index", &index.name);
        if !index.id.is_empty() {
            self.str("index_id", &index.id);
        }
        self.str("using", index.using.as_str());
    }

    /// Writes the estimate object; omitted entirely when nothing is known.
    pub fn estimate(&mut self, est: &OptEstimate) {
        let mut obj = Map::new();
        let mut put = |key: &str, value: Option<f64>| {
            if let Some(number) = value.and_then(Number::from_f64) {
                obj.insert(key.to_string(), Value::Number(number));
            }
        };
        put("cardinality", est.cardinality);
        put("cost", est.cost);
        put("fr_cost", est.fr_cost);
        if let Some(size) = est.size {
            obj.insert("size".into(), Value::from(size));
        }
        if !obj.is_empty() {
            self.map.insert(ESTIMATES_KEY.to_string(), Value::Object(obj));
        }
    }

    pub(crate) fn finish(self) -> Value {
        Value::Object(self.map)
    }
}

/// Typed read access to one encoded operator.
pub struct Decoder<'a> {
    op: &'static str,
    map: &'a Map<String, Value>,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(op: &'static str, body: &'a Value) -> Result<Self> {
        match body {
            Value::Object(map) => Ok(Self { op, map }),
            _ => Err(PlanError::invalid_field(op, "", "operator body must be an object")),
        }
    }

    /// Name of the operator being decoded.
    pub fn operator(&self) -> &'static str {
        self.op
    }

    /// Raw field access.
    pub fn raw(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    /// Required string field.
    pub fn str(&self, key: &'static str) -> Result<String> {
        self.opt_str(key)?.ok_or(PlanError::MissingField {
            operator: self.op,
            field: key,
        })
    }

    /// Optional string field.
    pub fn opt_str(&self, key: &str) -> Result<Option<String>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(key, format!("expected string, found {other}"))),
        }
    }

    /// Boolean field; absent means false.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.raw(key) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(self.invalid(key, format!("expected boolean, found {other}"))),
        }
    }

    /// Optional unsigned integer.
    pub fn opt_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, format!("expected unsigned integer, found {value}"))),
        }
    }

    /// Required expression field, classified against `scope` when given.
    pub fn expr(&self, key: &'static str, scope: Option<&ScopeContext<'_>>) -> Result<Expr> {
        let text = self.str(key)?;
        self.parse_expr(&text, scope)
    }

    /// Optional expression field.
    pub fn opt_expr(&self, key: &str, scope: Option<&ScopeContext<'_>>) -> Result<Option<Expr>> {
        match self.opt_str(key)? {
            Some(text) => self.parse_expr(&text, scope).map(Some),
            None => Ok(None),
        }
    }

    /// Expression list; absent means empty.
    pub fn exprs(&self, key: &str, scope: Option<&ScopeContext<'_>>) -> Result<Vec<Expr>> {
        self.array(key)?
            .iter()
            .map(|item| match item {
                Value::String(text) => self.parse_expr(text, scope),
                other => Err(self.invalid(key, format!("expected expression text, found {other}"))),
            })
            .collect()
    }

    /// Parses expression text found inside a nested field.
    pub fn parse_expr(&self, text: &str, scope: Option<&ScopeContext<'_>>) -> Result<Expr> {
        let mut expr = expr::parse(text)?;
        if let Some(scope) = scope {
            scope.map_expr(&mut expr);
        }
        Ok(expr)
    }

    /// Sort terms written by [`Encoder::sort_terms`].
    pub fn sort_terms(&self, key: &str, scope: Option<&ScopeContext<'_>>) -> Result<Vec<SortTerm>> {
        self.array(key)?
            .iter()
            .map(|item| {
                let text = item
                    .get("expr")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.invalid(key, "sort term without expr"))?;
                let nulls_first = match item.get("nulls_pos").and_then(Value::as_str) {
                    None => None,
                    Some("first") => Some(true),
                    Some("last") => Some(false),
                    Some(other) => {
                        return Err(self.invalid(key, format!("unknown nulls position '{other}'")))
                    }
                };
                Ok(SortTerm {
                    expr: self.parse_expr(text, scope)?,
                    descending: item.get("desc").and_then(Value::as_bool).unwrap_or(false),
                    nulls_first,
                })
            })
            .collect()
    }

    /// Array field; absent means empty.
    pub fn array(&self, key: &str) -> Result<&'a [Value]> {
        match self.raw(key) {
            None => Ok(&[]),
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(self.invalid(key, format!("expected array, found {other}"))),
        }
    }

    /// Required child operator.
    pub fn child(&self, key: &'static str, scope: Option<&mut ScopeContext<'_>>) -> Result<Operator> {
        let body = self.raw(key).ok_or(PlanError::MissingField {
            operator: self.op,
            field: key,
        })?;
        Operator::decode_with(body, scope)
    }

    /// Required child operator decoded in a nested scope, so the names it
    /// registers are not seen by later siblings.
    pub fn nested_child(&self, key: &'static str, scope: Option<&ScopeContext<'_>>) -> Result<Operator> {
        let body = self.raw(key).ok_or(PlanError::MissingField {
            operator: self.op,
            field: key,
        })?;
        match scope {
            Some(parent) => {
                let mut local = parent.child();
                Operator::decode_with(body, Some(&mut local))
            }
            None => Operator::decode_with(body, None),
        }
    }

    /// Optional child operator.
    pub fn opt_child(
        &self,
        key: &str,
        scope: Option<&mut ScopeContext<'_>>,
    ) -> Result<Option<Operator>> {
        match self.raw(key) {
            Some(body) => Operator::decode_with(body, scope).map(Some),
            None => Ok(None),
        }
    }

    /// Ordered child list; every child sees the registrations of the ones before it.
    pub fn children(
        &self,
        key: &'static str,
        mut scope: Option<&mut ScopeContext<'_>>,
    ) -> Result<Vec<Operator>> {
        let items = match self.raw(key) {
            Some(Value::Array(items)) => items,
            Some(other) => return Err(self.invalid(key, format!("expected array, found {other}"))),
            None => {
                return Err(PlanError::MissingField {
                    operator: self.op,
                    field: key,
                })
            }
        };
        items
            .iter()
            .map(|body| Operator::decode_with(body, scope.as_deref_mut()))
            .collect()
    }

    /// Reads `namespace` and `keyspace`.
    pub fn keyspace(&self) -> Result<KeyspaceRef> {
        Ok(KeyspaceRef::new(self.str("namespace")?, self.str("keyspace")?))
    }

    /// Reads `index`, `index_id`, and `using`.
    pub fn index(&self) -> Result<IndexRef> {
        let using = match self.opt_str("using")? {
            None => IndexUsing::default(),
            Some(text) => IndexUsing::parse(&text)
                .ok_or_else(|| self.invalid("using", format!("unknown index type '{text}'")))?,
        };
        Ok(IndexRef {
            name: self.str("index")?,
            id: self.opt_str("index_id")?.unwrap_or_default(),
            using,
            handle: None,
        })
    }

    /// Reads the estimate object; absent fields stay unknown.
    pub fn estimate(&self) -> Result<OptEstimate> {
        let obj = match self.raw(ESTIMATES_KEY) {
            None => return Ok(OptEstimate::default()),
            Some(Value::Object(obj)) => obj,
            Some(other) => {
                return Err(self.invalid(ESTIMATES_KEY, format!("expected object, found {other}")))
            }
        };
        let float = |key: &str| obj.get(key).and_then(Value::as_f64);
        Ok(OptEstimate {
            cardinality: float("cardinality"),
            cost: float("cost"),
            fr_cost: float("fr_cost"),
            size: obj.get("size").and_then(Value::as_i64),
        })
    }

    /// Builds an [`PlanError::InvalidField`] for this operator.
    pub fn invalid(&self, key: &str, reason: impl Into<String>) -> PlanError {
        PlanError::invalid_field(self.op, key, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimate_object_is_omitted_when_empty() {
        let mut enc = Encoder::new("Filter");
        enc.estimate(&OptEstimate::default());
        assert_eq!(enc.finish(), json!({"#operator": "Filter"}));

        let mut enc = Encoder::new("Filter");
        enc.estimate(&OptEstimate {
            cost: Some(2.5),
            ..OptEstimate::default()
        });
        assert_eq!(
            enc.finish(),
            json!({"#operator": "Filter", "optimizer_estimates": {"cost": 2.5}})
        );
    }

    #[test]
    fn missing_and_mistyped_fields_are_reported() {
        let body = json!({"#operator": "Filter", "condition": 3});
        let dec = Decoder::new("Filter", &body).expect("object body");
        match dec.expr("condition", None) {
            Err(PlanError::InvalidField { field, .. }) => assert_eq!(field, "condition"),
            other => panic!("unexpected result: {other:?}"),
        }
        match dec.str("absent") {
            Err(PlanError::MissingField { operator, field }) => {
                assert_eq!((operator, field), ("Filter", "absent"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(Decoder::new("Filter", &json!([1])).is_err());
    }
}
