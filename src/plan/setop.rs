//! Set operators combining independent query branches.

use serde_json::Value;

use crate::error::{PlanError, Result};

use super::scope::ScopeContext;
use super::wire::{Decoder, Encoder};
use super::{Operator, OperatorCodec, OptEstimate};

/// Decodes one branch in its own scope so branch aliases stay private.
fn decode_branch(body: &Value, scope: Option<&ScopeContext<'_>>) -> Result<Operator> {
    match scope {
        Some(parent) => {
            let mut local = parent.child();
            Operator::decode_with(body, Some(&mut local))
        }
        None => Operator::decode_with(body, None),
    }
}

fn required<'a>(dec: &Decoder<'a>, key: &'static str) -> Result<&'a Value> {
    dec.raw(key).ok_or(PlanError::MissingField {
        operator: dec.operator(),
        field: key,
    })
}

/// Concatenates the rows of every branch.
#[derive(Clone, Debug, PartialEq)]
pub struct UnionAll {
    /// Branches.
    pub children: Vec<Operator>,
    /// Optimizer estimate.
    pub est: OptEstimate,
}

impl UnionAll {
    /// Union of `children`.
    pub fn new(children: Vec<Operator>) -> Self {
        Self {
            children,
            est: OptEstimate::default(),
        }
    }
}

impl OperatorCodec for UnionAll {
    const NAME: &'static str = "UnionAll";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.children("~children", &self.children);
    }

    fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let scope = scope.as_deref();
        let children = match required(dec, "~children")? {
            Value::Array(items) => items
                .iter()
                .map(|body| decode_branch(body, scope))
                .collect::<Result<Vec<_>>>()?,
            other => return Err(dec.invalid("~children", format!("expected array, found {other}"))),
        };
        Ok(Self {
            children,
            est: dec.estimate()?,
        })
    }
}

macro_rules! binary_set_op {
    ($ty:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $ty {
            /// Left branch.
            pub first: Box<Operator>,
            /// Right branch.
            pub second: Box<Operator>,
            /// De-duplicate the output.
            pub distinct: bool,
            /// Optimizer estimate.
            pub est: OptEstimate,
        }

        impl $ty {
            /// Combines two branches.
            pub fn new(first: Operator, second: Operator, distinct: bool) -> Self {
                Self {
                    first: Box::new(first),
                    second: Box::new(second),
                    distinct,
                    est: OptEstimate::default(),
                }
            }
        }

        impl OperatorCodec for $ty {
            const NAME: &'static str = $name;

            fn encode_fields(&self, enc: &mut Encoder) {
                enc.flag("distinct", self.distinct);
                enc.child("~first", &self.first);
                enc.child("~second", &self.second);
            }

            fn decode_fields(dec: &Decoder<'_>, scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
                let scope = scope.as_deref();
                Ok(Self {
                    first: Box::new(decode_branch(required(dec, "~first")?, scope)?),
                    second: Box::new(decode_branch(required(dec, "~second")?, scope)?),
                    distinct: dec.flag("distinct")?,
                    est: dec.estimate()?,
                })
            }
        }
    };
}

binary_set_op!(
    IntersectAll,
    "IntersectAll",
    "Rows of the first branch that also occur in the second."
);
binary_set_op!(
    ExceptAll,
    "ExceptAll",
    "Rows of the first branch that do not occur in the second."
);
