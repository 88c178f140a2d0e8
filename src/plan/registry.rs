//! Name-to-decoder lookup for encoded operators.

use std::sync::OnceLock;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;

use crate::error::{PlanError, Result};

use super::scope::ScopeContext;
use super::{Operator, REGISTRY};

pub(crate) type DecodeFn = fn(&Value, Option<&mut ScopeContext<'_>>) -> Result<Operator>;

/// One registered operator: its wire name and a decoder producing a fresh value.
pub(crate) struct RegistryEntry {
    pub(crate) name: &'static str,
    pub(crate) decode: DecodeFn,
}

fn table() -> &'static FxHashMap<&'static str, DecodeFn> {
    static TABLE: OnceLock<FxHashMap<&'static str, DecodeFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        REGISTRY
            .iter()
            .map(|entry| (entry.name, entry.decode))
            .collect()
    })
}

/// Decodes `body` as the operator registered under `name`.
///
/// Names introduced by the operator are registered in `scope` when one is
/// given, so later siblings and children resolve against them.
pub fn make_operator(
    name: &str,
    body: &Value,
    scope: Option<&mut ScopeContext<'_>>,
) -> Result<Operator> {
    let decode = table()
        .get(name)
        .ok_or_else(|| PlanError::UnknownOperator {
            name: name.to_string(),
        })?;
    trace!(operator = name, scoped = scope.is_some(), "plan.decode");
    decode(body, scope)
}

/// Every registered name, in declaration order.
pub fn registered_names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|entry| entry.name)
}

/// True when `name` is a registered operator.
pub fn is_registered(name: &str) -> bool {
    table().contains_key(name)
}
