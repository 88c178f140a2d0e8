//! Structural operators: staging, authorization, and result delivery.

use std::num::NonZeroUsize;

use serde_json::{Map, Value};

use crate::auth::{Authorizer, PrivilegeKind, PrivilegeTarget, Privileges};
use crate::error::Result;

use super::scope::ScopeContext;
use super::transform::marker_op;
use super::wire::{Decoder, Encoder};
use super::{Operator, OperatorCodec, OptEstimate};

/// Runs children in order, each consuming the previous one's rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    /// Stages in order.
    pub children: Vec<Operator>,
    /// Optimizer estimate; copied from the last child when built.
    pub est: OptEstimate,
}

impl Sequence {
    /// Sequence whose estimate is that of its last child.
    pub fn new(children: Vec<Operator>) -> Self {
        let est = children
            .last()
            .and_then(Operator::estimate)
            .copied()
            .unwrap_or_default();
        Self { children, est }
    }
}

impl OperatorCodec for Sequence {
    const NAME: &'static str = "Sequence";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.children("~children", &self.children);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            children: dec.children("~children", scope)?,
            est: dec.estimate()?,
        })
    }
}

/// Runs copies of its child on independent lanes.
#[derive(Clone, Debug, PartialEq)]
pub struct Parallel {
    /// Replicated child.
    pub child: Box<Operator>,
    /// Lane cap; `None` lets the host decide.
    pub max_parallelism: Option<u32>,
}

impl Parallel {
    /// Parallel stage with the given cap.
    pub fn new(child: Operator, max_parallelism: Option<u32>) -> Self {
        Self {
            child: Box::new(child),
            max_parallelism,
        }
    }

    /// Number of lanes to run: the cap when set, else the available cores.
    pub fn lanes(&self) -> usize {
        match self.max_parallelism {
            Some(cap) if cap > 0 => cap as usize,
            _ => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

impl OperatorCodec for Parallel {
    const NAME: &'static str = "Parallel";

    fn encode_fields(&self, enc: &mut Encoder) {
        if let Some(cap) = self.max_parallelism {
            enc.u64("maxParallelism", u64::from(cap));
        }
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let max_parallelism = match dec.opt_u64("maxParallelism")? {
            None => None,
            Some(cap) => Some(
                u32::try_from(cap)
                    .map_err(|_| dec.invalid("maxParallelism", format!("{cap} out of range")))?,
            ),
        };
        Ok(Self {
            child: Box::new(dec.child("~child", scope)?),
            max_parallelism,
        })
    }
}

/// Checks privileges before running its child.
#[derive(Clone, Debug, PartialEq)]
pub struct Authorize {
    /// Required privileges.
    pub privileges: Privileges,
    /// Authorized plan.
    pub child: Box<Operator>,
    /// Checks run at execution time instead of plan time.
    pub deferred: bool,
}

impl Authorize {
    /// Wraps `child`.
    pub fn new(privileges: Privileges, child: Operator) -> Self {
        let deferred = privileges.is_dynamic();
        Self {
            privileges,
            child: Box::new(child),
            deferred,
        }
    }

    /// Wraps `child` after checking `privileges` now; dynamic targets are
    /// left for execution time.
    pub fn checked(privileges: Privileges, child: Operator, authorizer: &dyn Authorizer) -> Result<Self> {
        let op = Self::new(privileges, child);
        if !op.deferred {
            authorizer.authorize(&op.privileges)?;
        }
        Ok(op)
    }
}

impl OperatorCodec for Authorize {
    const NAME: &'static str = "Authorize";

    fn encode_fields(&self, enc: &mut Encoder) {
        let list = self
            .privileges
            .iter()
            .map(|p| {
                let mut obj = Map::new();
                obj.insert("priv".into(), Value::String(p.kind.as_str().into()));
                match &p.target {
                    PrivilegeTarget::Keyspace(path) => {
                        obj.insert("target".into(), Value::String(path.clone()))
                    }
                    PrivilegeTarget::Dynamic(what) => {
                        obj.insert("dynamic".into(), Value::String(what.clone()))
                    }
                };
                Value::Object(obj)
            })
            .collect();
        enc.value("privileges", Value::Array(list));
        enc.flag("deferred", self.deferred);
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let mut privileges = Privileges::new();
        for item in dec.array("privileges")? {
            let name = item.get("priv").and_then(Value::as_str).unwrap_or_default();
            let kind = PrivilegeKind::parse(name)
                .ok_or_else(|| dec.invalid("privileges", format!("unknown privilege '{name}'")))?;
            match (
                item.get("target").and_then(Value::as_str),
                item.get("dynamic").and_then(Value::as_str),
            ) {
                (Some(path), _) => privileges.add(kind, path),
                (None, Some(what)) => privileges.add_dynamic(kind, what),
                (None, None) => return Err(dec.invalid("privileges", "privilege without target")),
            }
        }
        Ok(Self {
            privileges,
            deferred: dec.flag("deferred")?,
            child: Box::new(dec.child("~child", scope)?),
        })
    }
}

/// Binds the rows of a FROM sub-query to its alias.
///
/// The sub-query plan is the child; names it registers on decode stay
/// inside it, and only the alias becomes visible to later operators.
#[derive(Clone, Debug, PartialEq)]
pub struct Alias {
    /// Sub-query term alias; empty for an anonymous MERGE source.
    pub alias: String,
    /// Sub-query plan.
    pub child: Box<Operator>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl Alias {
    /// Binds the rows of `child` to `alias`.
    pub fn new(alias: impl Into<String>, child: Operator) -> Self {
        Self {
            alias: alias.into(),
            child: Box::new(child),
            est: OptEstimate::default(),
        }
    }
}

impl OperatorCodec for Alias {
    const NAME: &'static str = "Alias";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.str("as", &self.alias);
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let alias = dec.opt_str("as")?.unwrap_or_default();
        let child = dec.nested_child("~child", scope.as_deref())?;
        if let Some(scope) = scope {
            if !alias.is_empty() {
                scope.add_subquery_term_alias(&alias);
            }
        }
        Ok(Self {
            alias,
            child: Box::new(child),
            est: dec.estimate()?,
        })
    }
}

marker_op!(Discard, "Discard", "Consumes rows without returning them.");
marker_op!(Stream, "Stream", "Delivers rows to the client.");
marker_op!(Collect, "Collect", "Gathers rows into a single array value.");
marker_op!(Receive, "Receive", "Rows arriving from another lane.");

/// EXPLAIN: returns the plan of its child instead of running it.
#[derive(Clone, Debug, PartialEq)]
pub struct Explain {
    /// Statement text.
    pub text: String,
    /// Explained plan.
    pub child: Box<Operator>,
}

impl OperatorCodec for Explain {
    const NAME: &'static str = "Explain";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.str("text", &self.text);
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            text: dec.opt_str("text")?.unwrap_or_default(),
            child: Box::new(dec.child("~child", scope)?),
        })
    }
}
