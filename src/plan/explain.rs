//! Generic explain tree derived from the wire form.
//!
//! Structural children (`~` keys) become inputs and every other field becomes
//! a property, so no operator needs bespoke explain logic.

use std::fmt::Write as _;
use std::hash::Hasher;

use serde_json::{Map, Value};
use xxhash_rust::xxh64::Xxh64;

use super::wire::OPERATOR_KEY;
use super::Operator;

/// Operator node of an explain tree.
#[derive(Clone, Debug, PartialEq)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Non-structural fields in key order
    pub props: Vec<ExplainProp>,
    /// Structural children
    pub inputs: Vec<ExplainNode>,
}

/// Single property of an [`ExplainNode`].
#[derive(Clone, Debug, PartialEq)]
pub struct ExplainProp {
    /// Field name.
    pub key: String,
    /// Field value rendered for display.
    pub value: String,
    /// Whether the value embeds string literals from the statement.
    pub redactable: bool,
}

impl ExplainProp {
    fn from_field(key: &str, value: &Value) -> Self {
        let value = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            key: key.to_string(),
            redactable: value.contains('"'),
            value,
        }
    }
}

impl ExplainNode {
    /// Creates a node with no properties or inputs.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Builds the tree for an encoded operator.
    pub fn from_encoded(body: &Value) -> Self {
        let map = match body {
            Value::Object(map) => map,
            other => {
                let mut node = ExplainNode::new("?");
                node.props.push(ExplainProp::from_field("value", other));
                return node;
            }
        };
        let op = map
            .get(OPERATOR_KEY)
            .and_then(Value::as_str)
            .unwrap_or("?");
        let mut node = ExplainNode::new(op);
        for (key, value) in map {
            if key == OPERATOR_KEY {
                continue;
            }
            if key.starts_with('~') {
                match value {
                    Value::Array(items) => node.inputs.extend(items.iter().map(Self::from_encoded)),
                    child => node.inputs.push(Self::from_encoded(child)),
                }
            } else {
                node.props.push(ExplainProp::from_field(key, value));
            }
        }
        node
    }

    /// Indented text rendering, one operator per line.
    pub fn render(&self, redact: bool) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0, redact);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize, redact: bool) {
        let _ = write!(out, "{:indent$}{}", "", self.op, indent = depth * 2);
        for prop in &self.props {
            let value = if redact && prop.redactable {
                "<redacted>"
            } else {
                prop.value.as_str()
            };
            let _ = write!(out, " {}={}", prop.key, value);
        }
        out.push('\n');
        for input in &self.inputs {
            input.render_into(out, depth + 1, redact);
        }
    }

    /// JSON rendering: `{"op", "props", "inputs"}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("op".into(), Value::String(self.op.clone()));
        if !self.props.is_empty() {
            let props = self
                .props
                .iter()
                .map(|p| (p.key.clone(), Value::String(p.value.clone())))
                .collect();
            map.insert("props".into(), Value::Object(props));
        }
        let inputs = self.inputs.iter().map(ExplainNode::to_value).collect();
        map.insert("inputs".into(), Value::Array(inputs));
        Value::Object(map)
    }

    /// Deterministic hash of the tree.
    pub fn plan_hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into(&self, hasher: &mut Xxh64) {
        hasher.write(self.op.as_bytes());
        for prop in &self.props {
            hasher.write(prop.key.as_bytes());
            hasher.write(prop.value.as_bytes());
        }
        hasher.write_u64(self.inputs.len() as u64);
        for input in &self.inputs {
            input.hash_into(hasher);
        }
    }
}

impl Operator {
    /// Explain tree of this plan.
    pub fn explain(&self) -> ExplainNode {
        ExplainNode::from_encoded(&self.encode())
    }

    /// Deterministic hash over the encoded plan.
    pub fn plan_hash(&self) -> u64 {
        self.explain().plan_hash()
    }
}
