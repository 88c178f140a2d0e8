//! Mutation operators.

use serde_json::{Map, Value};

use crate::algebra::SetClause;
use crate::error::Result;
use crate::expr::Expr;

use super::scope::ScopeContext;
use super::wire::{Decoder, Encoder};
use super::{KeyspaceRef, Operator, OperatorCodec};

macro_rules! send_write {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Target keyspace.
            pub keyspace: KeyspaceRef,
            /// Target alias.
            pub alias: String,
            /// Document key; `None` when rows carry `key`/`value` pairs.
            pub key: Option<Expr>,
            /// Document value.
            pub value: Option<Expr>,
            /// Per-document options.
            pub options: Option<Expr>,
            /// Mutation limit.
            pub limit: Option<Expr>,
        }

        impl $ty {
            /// Writer for rows that already carry key and value.
            pub fn new(keyspace: KeyspaceRef, alias: impl Into<String>) -> Self {
                Self {
                    keyspace,
                    alias: alias.into(),
                    key: None,
                    value: None,
                    options: None,
                    limit: None,
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.keyspace(&self.keyspace);
                enc.str("as", &self.alias);
                enc.opt_expr("key", self.key.as_ref());
                enc.opt_expr("value", self.value.as_ref());
                enc.opt_expr("options", self.options.as_ref());
                enc.opt_expr("limit", self.limit.as_ref());
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let scope = scope.as_deref();
                Ok(Self {
                    keyspace: dec.keyspace()?,
                    alias: dec.opt_str("as")?.unwrap_or_default(),
                    key: dec.opt_expr("key", scope)?,
                    value: dec.opt_expr("value", scope)?,
                    options: dec.opt_expr("options", scope)?,
                    limit: dec.opt_expr("limit", scope)?,
                })
            }
        }
    };
}

send_write!(SendInsert, "SendInsert", "Inserts documents; existing keys fail.");
send_write!(SendUpsert, "SendUpsert", "Inserts or replaces documents.");

macro_rules! send_keyed {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Target keyspace.
            pub keyspace: KeyspaceRef,
            /// Target alias.
            pub alias: String,
            /// Mutation limit.
            pub limit: Option<Expr>,
        }

        impl $ty {
            /// Unlimited mutation of `alias`.
            pub fn new(keyspace: KeyspaceRef, alias: impl Into<String>) -> Self {
                Self {
                    keyspace,
                    alias: alias.into(),
                    limit: None,
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.keyspace(&self.keyspace);
                enc.str("as", &self.alias);
                enc.opt_expr("limit", self.limit.as_ref());
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                Ok(Self {
                    keyspace: dec.keyspace()?,
                    alias: dec.str("as")?,
                    limit: dec.opt_expr("limit", scope.as_deref())?,
                })
            }
        }
    };
}

send_keyed!(SendUpdate, "SendUpdate", "Writes back updated documents.");
send_keyed!(SendDelete, "SendDelete", "Deletes the documents bound to the alias.");

/// Copies the current document so SET/UNSET never alias the original.
#[derive(Clone, Debug, PartialEq)]
pub struct CloneDoc {
    /// Alias whose document is copied.
    pub alias: String,
}

impl OperatorCodec for CloneDoc {
    const NAME: &'static str = "Clone";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.str("as", &self.alias);
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            alias: dec.str("as")?,
        })
    }
}

/// Applies SET clauses to the cloned document.
#[derive(Clone, Debug, PartialEq)]
pub struct Set {
    /// Assignments in order.
    pub terms: Vec<SetClause>,
}

impl OperatorCodec for Set {
    const NAME: &'static str = "Set";

    fn encode_fields(&self, enc: &mut Encoder) {
        let list = self
            .terms
            .iter()
            .map(|t| {
                let mut obj = Map::new();
                obj.insert("path".into(), Value::String(t.path.canonical()));
                obj.insert("value".into(), Value::String(t.value.canonical()));
                Value::Object(obj)
            })
            .collect();
        enc.value("set_terms", Value::Array(list));
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        let terms = dec
            .array("set_terms")?
            .iter()
            .map(|item| {
                let text = |key: &str| {
                    item.get(key)
                        .and_then(Value::as_str)
                        .ok_or_else(|| dec.invalid("set_terms", format!("term without {key}")))
                };
                Ok(SetClause {
                    path: dec.parse_expr(text("path")?, scope)?,
                    value: dec.parse_expr(text("value")?, scope)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }
}

/// Removes paths from the cloned document.
#[derive(Clone, Debug, PartialEq)]
pub struct Unset {
    /// Removed paths.
    pub terms: Vec<Expr>,
}

impl OperatorCodec for Unset {
    const NAME: &'static str = "Unset";

    fn encode_fields(&self, enc: &mut Encoder) {
        let list = self
            .terms
            .iter()
            .map(|path| {
                let mut obj = Map::new();
                obj.insert("path".into(), Value::String(path.canonical()));
                Value::Object(obj)
            })
            .collect();
        enc.value("unset_terms", Value::Array(list));
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        let terms = dec
            .array("unset_terms")?
            .iter()
            .map(|item| match item.get("path").and_then(Value::as_str) {
                Some(text) => dec.parse_expr(text, scope),
                None => Err(dec.invalid("unset_terms", "term without path")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }
}

/// MERGE: routes each source row to the update, delete, or insert action.
#[derive(Clone, Debug, PartialEq)]
pub struct Merge {
    /// Target keyspace.
    pub keyspace: KeyspaceRef,
    /// Target alias.
    pub alias: String,
    /// Target key computed from the source row.
    pub key: Expr,
    /// WHEN MATCHED THEN UPDATE.
    pub update: Option<Box<Operator>>,
    /// WHEN MATCHED THEN DELETE.
    pub delete: Option<Box<Operator>>,
    /// WHEN NOT MATCHED THEN INSERT.
    pub insert: Option<Box<Operator>>,
}

impl OperatorCodec for Merge {
    const NAME: &'static str = "Merge";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("as", &self.alias);
        enc.expr("key", &self.key);
        enc.opt_child("~update", self.update.as_deref());
        enc.opt_child("~delete", self.delete.as_deref());
        enc.opt_child("~insert", self.insert.as_deref());
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let key = dec.expr("key", scope.as_deref())?;
        let alias = dec.str("as")?;
        if let Some(scope) = scope.as_deref_mut() {
            scope.add_keyspace_alias(&alias);
        }
        Ok(Self {
            keyspace: dec.keyspace()?,
            alias,
            key,
            update: dec.opt_child("~update", scope.as_deref_mut())?.map(Box::new),
            delete: dec.opt_child("~delete", scope.as_deref_mut())?.map(Box::new),
            insert: dec.opt_child("~insert", scope.as_deref_mut())?.map(Box::new),
        })
    }
}
