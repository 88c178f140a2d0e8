//! Index definition operators.

use serde_json::Value;

use crate::catalog::IndexUsing;
use crate::error::Result;
use crate::expr::Expr;

use super::scope::ScopeContext;
use super::wire::{Decoder, Encoder};
use super::{IndexRef, KeyspaceRef, OperatorCodec};

fn decode_using(dec: &Decoder<'_>) -> Result<IndexUsing> {
    match dec.opt_str("using")? {
        None => Ok(IndexUsing::default()),
        Some(text) => IndexUsing::parse(&text)
            .ok_or_else(|| dec.invalid("using", format!("unknown index type '{text}'"))),
    }
}

fn decode_with(dec: &Decoder<'_>) -> Result<Option<Value>> {
    match dec.raw("with") {
        None => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value.clone())),
        Some(other) => Err(dec.invalid("with", format!("expected object, found {other}"))),
    }
}

/// CREATE PRIMARY INDEX.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatePrimaryIndex {
    /// Indexed keyspace.
    pub keyspace: KeyspaceRef,
    /// Index name.
    pub name: String,
    /// Index service.
    pub using: IndexUsing,
    /// WITH options.
    pub with: Option<Value>,
}

impl OperatorCodec for CreatePrimaryIndex {
    const NAME: &'static str = "CreatePrimaryIndex";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("index", &self.name);
        enc.str("using", self.using.as_str());
        if let Some(with) = &self.with {
            enc.value("with", with.clone());
        }
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            keyspace: dec.keyspace()?,
            name: dec.str("index")?,
            using: decode_using(dec)?,
            with: decode_with(dec)?,
        })
    }
}

/// CREATE INDEX.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateIndex {
    /// Indexed keyspace.
    pub keyspace: KeyspaceRef,
    /// Index name.
    pub name: String,
    /// Index keys, relative to the document.
    pub keys: Vec<Expr>,
    /// Partial-index condition.
    pub where_: Option<Expr>,
    /// Index service.
    pub using: IndexUsing,
    /// WITH options.
    pub with: Option<Value>,
}

impl OperatorCodec for CreateIndex {
    const NAME: &'static str = "CreateIndex";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("index", &self.name);
        enc.exprs("keys", &self.keys);
        enc.opt_expr("where", self.where_.as_ref());
        enc.str("using", self.using.as_str());
        if let Some(with) = &self.with {
            enc.value("with", with.clone());
        }
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let keys = dec.exprs("keys", None)?;
        if keys.is_empty() {
            return Err(dec.invalid("keys", "secondary index needs at least one key"));
        }
        Ok(Self {
            keyspace: dec.keyspace()?,
            name: dec.str("index")?,
            keys,
            where_: dec.opt_expr("where", None)?,
            using: decode_using(dec)?,
            with: decode_with(dec)?,
        })
    }
}

/// DROP INDEX.
#[derive(Clone, Debug, PartialEq)]
pub struct DropIndex {
    /// Indexed keyspace.
    pub keyspace: KeyspaceRef,
    /// Dropped index.
    pub index: IndexRef,
}

impl OperatorCodec for DropIndex {
    const NAME: &'static str = "DropIndex";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.index(&self.index);
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            keyspace: dec.keyspace()?,
            index: dec.index()?,
        })
    }
}

/// ALTER INDEX.
#[derive(Clone, Debug, PartialEq)]
pub struct AlterIndex {
    /// Indexed keyspace.
    pub keyspace: KeyspaceRef,
    /// Altered index.
    pub index: IndexRef,
    /// New options.
    pub with: Value,
}

impl OperatorCodec for AlterIndex {
    const NAME: &'static str = "AlterIndex";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.index(&self.index);
        enc.value("with", self.with.clone());
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let with = decode_with(dec)?.ok_or_else(|| dec.invalid("with", "ALTER INDEX needs options"))?;
        Ok(Self {
            keyspace: dec.keyspace()?,
            index: dec.index()?,
            with,
        })
    }
}

/// BUILD INDEX for deferred indexes.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildIndexes {
    /// Indexed keyspace.
    pub keyspace: KeyspaceRef,
    /// Index service.
    pub using: IndexUsing,
    /// Names to build.
    pub names: Vec<String>,
}

impl OperatorCodec for BuildIndexes {
    const NAME: &'static str = "BuildIndexes";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("using", self.using.as_str());
        enc.value("names", Value::from(self.names.clone()));
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let names = dec
            .array("names")?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| dec.invalid("names", "index name must be a string"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            keyspace: dec.keyspace()?,
            using: decode_using(dec)?,
            names,
        })
    }
}
