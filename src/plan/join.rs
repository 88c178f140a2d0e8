//! Document fetch, joins, nests, and unnest.

use crate::error::Result;
use crate::expr::Expr;

use super::scope::ScopeContext;
use super::wire::{Decoder, Encoder};
use super::{KeyspaceRef, Operator, OperatorCodec, OptEstimate};

/// Fetches documents for the keys produced upstream.
#[derive(Clone, Debug, PartialEq)]
pub struct Fetch {
    /// Source keyspace.
    pub keyspace: KeyspaceRef,
    /// Alias the document is bound to.
    pub alias: String,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl Fetch {
    /// Fetch into `alias`.
    pub fn new(keyspace: KeyspaceRef, alias: impl Into<String>) -> Self {
        Self {
            keyspace,
            alias: alias.into(),
            est: OptEstimate::default(),
        }
    }
}

impl OperatorCodec for Fetch {
    const NAME: &'static str = "Fetch";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.keyspace(&self.keyspace);
        enc.str("as", &self.alias);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let alias = dec.str("as")?;
        if let Some(scope) = scope {
            scope.add_keyspace_alias(&alias);
        }
        Ok(Self {
            keyspace: dec.keyspace()?,
            alias,
            est: dec.estimate()?,
        })
    }
}

macro_rules! lookup_join {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Right keyspace.
            pub keyspace: KeyspaceRef,
            /// Right alias.
            pub alias: String,
            /// LEFT OUTER.
            pub outer: bool,
            /// Right document keys computed from the left row.
            pub on_keys: Expr,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl $ty {
            /// Inner lookup of `keyspace` documents by `on_keys`.
            pub fn new(keyspace: KeyspaceRef, alias: impl Into<String>, on_keys: Expr) -> Self {
                Self {
                    keyspace,
                    alias: alias.into(),
                    outer: false,
                    on_keys,
                    est: OptEstimate::default(),
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.keyspace(&self.keyspace);
                enc.str("as", &self.alias);
                enc.flag("outer", self.outer);
                enc.expr("on_keys", &self.on_keys);
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let on_keys = dec.expr("on_keys", scope.as_deref())?;
                let alias = dec.str("as")?;
                if let Some(scope) = scope {
                    scope.add_keyspace_alias(&alias);
                }
                Ok(Self {
                    keyspace: dec.keyspace()?,
                    alias,
                    outer: dec.flag("outer")?,
                    on_keys,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

lookup_join!(Join, "Join", "Lookup join on document keys.");
lookup_join!(Nest, "Nest", "Lookup nest: right documents gathered into an array.");

macro_rules! nested_loop {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Right alias.
            pub alias: String,
            /// LEFT OUTER.
            pub outer: bool,
            /// ON clause.
            pub on_clause: Expr,
            /// Residual filter applied after the join.
            pub filter: Option<Expr>,
            /// Why a join hint was not honored.
            pub hint_error: Option<String>,
            /// Right-side plan, run per left row.
            pub child: Box<Operator>,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.str("alias", &self.alias);
                enc.flag("outer", self.outer);
                enc.expr("on_clause", &self.on_clause);
                enc.opt_expr("filter", self.filter.as_ref());
                enc.opt_str("hint_not_followed", self.hint_error.as_deref());
                enc.child("~child", &self.child);
            }

            fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let alias = dec.str("alias")?;
                if let Some(scope) = scope.as_deref_mut() {
                    scope.add_keyspace_alias(&alias);
                }
                let child = Box::new(dec.child("~child", scope.as_deref_mut())?);
                let scope = scope.as_deref();
                Ok(Self {
                    alias,
                    outer: dec.flag("outer")?,
                    on_clause: dec.expr("on_clause", scope)?,
                    filter: dec.opt_expr("filter", scope)?,
                    hint_error: dec.opt_str("hint_not_followed")?,
                    child,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

nested_loop!(
    NestedLoopJoin,
    "NestedLoopJoin",
    "ANSI join evaluated by re-running the right plan per left row."
);
nested_loop!(
    NestedLoopNest,
    "NestedLoopNest",
    "ANSI nest evaluated by re-running the right plan per left row."
);

/// ANSI join through a hash table built from one side.
#[derive(Clone, Debug, PartialEq)]
pub struct HashJoin {
    /// LEFT OUTER.
    pub outer: bool,
    /// ON clause.
    pub on_clause: Expr,
    /// Residual filter.
    pub filter: Option<Expr>,
    /// Why a join hint was not honored.
    pub hint_error: Option<String>,
    /// Hash keys evaluated on the build side.
    pub build_exprs: Vec<Expr>,
    /// Hash keys evaluated on the probe side.
    pub probe_exprs: Vec<Expr>,
    /// Aliases produced by the build side.
    pub build_aliases: Vec<String>,
    /// Build-side plan.
    pub child: Box<Operator>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for HashJoin {
    const NAME: &'static str = "HashJoin";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.flag("outer", self.outer);
        enc.expr("on_clause", &self.on_clause);
        enc.opt_expr("filter", self.filter.as_ref());
        enc.opt_str("hint_not_followed", self.hint_error.as_deref());
        enc.exprs("build_exprs", &self.build_exprs);
        enc.exprs("probe_exprs", &self.probe_exprs);
        enc.value(
            "build_aliases",
            serde_json::Value::from(self.build_aliases.clone()),
        );
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let build_aliases = dec
            .array("build_aliases")?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| dec.invalid("build_aliases", "alias must be a string"))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(scope) = scope.as_deref_mut() {
            for alias in &build_aliases {
                scope.add_keyspace_alias(alias);
            }
        }
        let child = Box::new(dec.child("~child", scope.as_deref_mut())?);
        let scope = scope.as_deref();
        Ok(Self {
            outer: dec.flag("outer")?,
            on_clause: dec.expr("on_clause", scope)?,
            filter: dec.opt_expr("filter", scope)?,
            hint_error: dec.opt_str("hint_not_followed")?,
            build_exprs: dec.exprs("build_exprs", scope)?,
            probe_exprs: dec.exprs("probe_exprs", scope)?,
            build_aliases,
            child,
            est: dec.estimate()?,
        })
    }
}

/// ANSI nest through a hash table built from the right side.
#[derive(Clone, Debug, PartialEq)]
pub struct HashNest {
    /// LEFT OUTER.
    pub outer: bool,
    /// ON clause.
    pub on_clause: Expr,
    /// Residual filter.
    pub filter: Option<Expr>,
    /// Why a join hint was not honored.
    pub hint_error: Option<String>,
    /// Hash keys evaluated on the build side.
    pub build_exprs: Vec<Expr>,
    /// Hash keys evaluated on the probe side.
    pub probe_exprs: Vec<Expr>,
    /// Alias of the nested array.
    pub build_alias: String,
    /// Build-side plan.
    pub child: Box<Operator>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for HashNest {
    const NAME: &'static str = "HashNest";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.flag("outer", self.outer);
        enc.expr("on_clause", &self.on_clause);
        enc.opt_expr("filter", self.filter.as_ref());
        enc.opt_str("hint_not_followed", self.hint_error.as_deref());
        enc.exprs("build_exprs", &self.build_exprs);
        enc.exprs("probe_exprs", &self.probe_exprs);
        enc.str("build_alias", &self.build_alias);
        enc.child("~child", &self.child);
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let build_alias = dec.str("build_alias")?;
        if let Some(scope) = scope.as_deref_mut() {
            scope.add_keyspace_alias(&build_alias);
        }
        let child = Box::new(dec.child("~child", scope.as_deref_mut())?);
        let scope = scope.as_deref();
        Ok(Self {
            outer: dec.flag("outer")?,
            on_clause: dec.expr("on_clause", scope)?,
            filter: dec.opt_expr("filter", scope)?,
            hint_error: dec.opt_str("hint_not_followed")?,
            build_exprs: dec.exprs("build_exprs", scope)?,
            probe_exprs: dec.exprs("probe_exprs", scope)?,
            build_alias,
            child,
            est: dec.estimate()?,
        })
    }
}

/// Emits one row per element of an array expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Unnest {
    /// Element alias.
    pub alias: String,
    /// Array expression.
    pub expr: Expr,
    /// LEFT OUTER.
    pub outer: bool,
    /// Filter on the unnested element.
    pub filter: Option<Expr>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl OperatorCodec for Unnest {
    const NAME: &'static str = "Unnest";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.str("as", &self.alias);
        enc.expr("expr", &self.expr);
        enc.flag("outer", self.outer);
        enc.opt_expr("filter", self.filter.as_ref());
    }

    fn decode_fields(dec: &Decoder<'_>, mut scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let expr = dec.expr("expr", scope.as_deref())?;
        let alias = dec.str("as")?;
        if let Some(scope) = scope.as_deref_mut() {
            scope.add_unnest_alias(&alias);
        }
        Ok(Self {
            filter: dec.opt_expr("filter", scope.as_deref())?,
            alias,
            expr,
            outer: dec.flag("outer")?,
            est: dec.estimate()?,
        })
    }
}
