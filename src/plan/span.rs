//! Index key ranges.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::expr::{collate_bounds, Expr};

use super::scope::ScopeContext;
use super::wire::Decoder;

/// Which bounds of a [`Range`] are inclusive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Inclusion {
    /// Both bounds exclusive.
    #[default]
    Neither,
    /// Low bound inclusive.
    Low,
    /// High bound inclusive.
    High,
    /// Both bounds inclusive.
    Both,
}

impl Inclusion {
    /// Wire value, 0 through 3.
    pub fn bits(self) -> u64 {
        match self {
            Inclusion::Neither => 0,
            Inclusion::Low => 1,
            Inclusion::High => 2,
            Inclusion::Both => 3,
        }
    }

    /// Inverse of [`Inclusion::bits`].
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Inclusion::Neither),
            1 => Some(Inclusion::Low),
            2 => Some(Inclusion::High),
            3 => Some(Inclusion::Both),
            _ => None,
        }
    }

    /// True when the low bound is inclusive.
    pub fn includes_low(self) -> bool {
        matches!(self, Inclusion::Low | Inclusion::Both)
    }

    /// True when the high bound is inclusive.
    pub fn includes_high(self) -> bool {
        matches!(self, Inclusion::High | Inclusion::Both)
    }
}

/// Range over one index key. A missing bound is unbounded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Range {
    /// Low bound.
    pub low: Option<Expr>,
    /// High bound.
    pub high: Option<Expr>,
    /// Bound inclusion.
    pub inclusion: Inclusion,
    /// Scan hints for the index service.
    pub flags: u32,
}

impl Range {
    /// Low bound is NULL.
    pub const FLAG_LOW_NULL: u32 = 0x01;
    /// High bound is NULL.
    pub const FLAG_HIGH_NULL: u32 = 0x02;
    /// Low bound is MISSING.
    pub const FLAG_LOW_MISSING: u32 = 0x04;
    /// Range is a point lookup.
    pub const FLAG_EQUALITY: u32 = 0x08;

    /// `key = value`.
    pub fn point(value: Expr) -> Self {
        Self {
            low: Some(value.clone()),
            high: Some(value),
            inclusion: Inclusion::Both,
            flags: Self::FLAG_EQUALITY,
        }
    }

    /// Range bounded from below.
    pub fn lower(value: Expr, inclusive: bool) -> Self {
        Self {
            low: Some(value),
            high: None,
            inclusion: if inclusive {
                Inclusion::Low
            } else {
                Inclusion::Neither
            },
            flags: 0,
        }
    }

    /// Range bounded from above.
    pub fn upper(value: Expr, inclusive: bool) -> Self {
        Self {
            low: None,
            high: Some(value),
            inclusion: if inclusive {
                Inclusion::High
            } else {
                Inclusion::Neither
            },
            flags: 0,
        }
    }

    /// Full key range, MISSING excluded.
    pub fn whole() -> Self {
        Self {
            low: Some(Expr::constant(serde_json::Value::Null)),
            high: None,
            inclusion: Inclusion::Low,
            flags: Self::FLAG_LOW_NULL,
        }
    }

    /// Range no key satisfies.
    pub fn empty() -> Self {
        let null = Expr::constant(Value::Null);
        Self {
            low: Some(null.clone()),
            high: Some(null),
            inclusion: Inclusion::Neither,
            flags: 0,
        }
    }

    /// True when no key can satisfy the range.
    ///
    /// Identical bound text without both-inclusive is empty even when the
    /// bounds need evaluation; otherwise only literal bounds are compared.
    pub fn is_empty(&self) -> bool {
        let (Some(low), Some(high)) = (&self.low, &self.high) else {
            return false;
        };
        let both = self.inclusion == Inclusion::Both;
        if !both && low.canonical() == high.canonical() {
            return true;
        }
        match collate_bounds(low, high) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => !both,
            _ => false,
        }
    }

    fn encode(&self) -> Value {
        let mut obj = Map::new();
        if let Some(low) = &self.low {
            obj.insert("low".into(), Value::String(low.canonical()));
        }
        if let Some(high) = &self.high {
            obj.insert("high".into(), Value::String(high.canonical()));
        }
        obj.insert("inclusion".into(), Value::from(self.inclusion.bits()));
        if self.flags != 0 {
            obj.insert("flags".into(), Value::from(self.flags));
        }
        Value::Object(obj)
    }

    fn decode(dec: &Decoder<'_>, key: &str, value: &Value, scope: Option<&ScopeContext<'_>>) -> Result<Self> {
        let bound = |name: &str| -> Result<Option<Expr>> {
            match value.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(text)) => dec.parse_expr(text, scope).map(Some),
                Some(other) => Err(dec.invalid(key, format!("range {name} must be text, found {other}"))),
            }
        };
        let bits = value.get("inclusion").and_then(Value::as_u64).unwrap_or(0);
        let inclusion = Inclusion::from_bits(bits)
            .ok_or_else(|| dec.invalid(key, format!("inclusion {bits} out of range")))?;
        let flags = value.get("flags").and_then(Value::as_u64).unwrap_or(0);
        Ok(Self {
            low: bound("low")?,
            high: bound("high")?,
            inclusion,
            flags: u32::try_from(flags).map_err(|_| dec.invalid(key, "range flags overflow"))?,
        })
    }
}

/// Composite key span: one [`Range`] per leading index key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Span {
    /// Point-lookup values, when the span is a pure seek.
    pub seek: Vec<Expr>,
    /// Per-key ranges.
    pub ranges: Vec<Range>,
    /// Span applies the predicate exactly; no re-filter needed.
    pub exact: bool,
}

impl Span {
    /// Single-key span.
    pub fn new(range: Range, exact: bool) -> Self {
        Self {
            seek: Vec::new(),
            ranges: vec![range],
            exact,
        }
    }

    /// True when any key range is empty.
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().any(Range::is_empty)
    }

    pub(crate) fn encode(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "range".into(),
            Value::Array(self.ranges.iter().map(Range::encode).collect()),
        );
        if !self.seek.is_empty() {
            obj.insert(
                "seek".into(),
                Value::Array(self.seek.iter().map(|e| Value::String(e.canonical())).collect()),
            );
        }
        if self.exact {
            obj.insert("exact".into(), Value::Bool(true));
        }
        Value::Object(obj)
    }
}

/// True when no span can produce a key.
pub fn spans_empty(spans: &[Span]) -> bool {
    !spans.is_empty() && spans.iter().all(Span::is_empty)
}

pub(crate) fn encode_spans(spans: &[Span]) -> Value {
    Value::Array(spans.iter().map(Span::encode).collect())
}

pub(crate) fn decode_spans(
    dec: &Decoder<'_>,
    key: &str,
    scope: Option<&ScopeContext<'_>>,
) -> Result<Vec<Span>> {
    dec.array(key)?
        .iter()
        .map(|item| {
            let ranges = match item.get("range") {
                Some(Value::Array(ranges)) => ranges
                    .iter()
                    .map(|r| Range::decode(dec, key, r, scope))
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(dec.invalid(key, "span without range list")),
            };
            let seek = match item.get("seek") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(values)) => values
                    .iter()
                    .map(|v| match v {
                        Value::String(text) => dec.parse_expr(text, scope),
                        other => Err(dec.invalid(key, format!("seek value must be text, found {other}"))),
                    })
                    .collect::<Result<Vec<_>>>()?,
                Some(other) => return Err(dec.invalid(key, format!("seek must be a list, found {other}"))),
            };
            Ok(Span {
                seek,
                ranges,
                exact: item.get("exact").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect()
}
