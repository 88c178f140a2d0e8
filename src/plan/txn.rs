//! Transaction control.

use crate::algebra::IsolationLevel;
use crate::error::Result;

use super::scope::ScopeContext;
use super::wire::{Decoder, Encoder};
use super::OperatorCodec;

fn decode_isolation(dec: &Decoder<'_>) -> Result<Option<IsolationLevel>> {
    match dec.opt_str("isolation")? {
        None => Ok(None),
        Some(text) => IsolationLevel::parse(&text)
            .map(Some)
            .ok_or_else(|| dec.invalid("isolation", format!("unknown isolation level '{text}'"))),
    }
}

/// BEGIN TRANSACTION.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StartTransaction {
    /// Requested isolation; `None` uses the service default.
    pub isolation: Option<IsolationLevel>,
}

impl OperatorCodec for StartTransaction {
    const NAME: &'static str = "StartTransaction";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.opt_str("isolation", self.isolation.map(IsolationLevel::as_str));
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            isolation: decode_isolation(dec)?,
        })
    }
}

/// COMMIT.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitTransaction;

impl OperatorCodec for CommitTransaction {
    const NAME: &'static str = "CommitTransaction";

    fn encode_fields(&self, _enc: &mut Encoder) {}

    fn decode_fields(_dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self)
    }
}

/// ROLLBACK, optionally to a savepoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollbackTransaction {
    /// Savepoint to roll back to.
    pub savepoint: Option<String>,
}

impl OperatorCodec for RollbackTransaction {
    const NAME: &'static str = "RollbackTransaction";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.opt_str("savepoint", self.savepoint.as_deref());
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            savepoint: dec.opt_str("savepoint")?,
        })
    }
}

/// SET TRANSACTION ISOLATION LEVEL.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionIsolation {
    /// Isolation level.
    pub isolation: IsolationLevel,
}

impl OperatorCodec for TransactionIsolation {
    const NAME: &'static str = "TransactionIsolation";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.str("isolation", self.isolation.as_str());
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        let isolation = decode_isolation(dec)?.ok_or(crate::error::PlanError::MissingField {
            operator: Self::NAME,
            field: "isolation",
        })?;
        Ok(Self { isolation })
    }
}

/// SAVEPOINT.
#[derive(Clone, Debug, PartialEq)]
pub struct Savepoint {
    /// Savepoint name.
    pub name: String,
}

impl OperatorCodec for Savepoint {
    const NAME: &'static str = "Savepoint";

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.str("savepoint", &self.name);
    }

    fn decode_fields(dec: &Decoder<'_>, _scope: Option<&mut ScopeContext<'_>>) -> Result<Self> {
        Ok(Self {
            name: dec.str("savepoint")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlanError;
    use crate::plan::Operator;
    use serde_json::json;

    #[test]
    fn isolation_is_optional_only_when_starting() {
        let start = Operator::decode(&json!({"#operator": "StartTransaction"})).expect("decode");
        assert_eq!(start, Operator::StartTransaction(StartTransaction::default()));
        assert!(!start.readonly());
        match Operator::decode(&json!({"#operator": "TransactionIsolation"})) {
            Err(PlanError::MissingField { field, .. }) => assert_eq!(field, "isolation"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_isolation_levels_are_rejected() {
        let body = json!({"#operator": "StartTransaction", "isolation": "SERIALIZABLE"});
        match Operator::decode(&body) {
            Err(PlanError::InvalidField { field, reason, .. }) => {
                assert_eq!(field, "isolation");
                assert!(reason.contains("SERIALIZABLE"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rollback_target_travels_as_savepoint() {
        let op = RollbackTransaction {
            savepoint: Some("s1".into()),
        };
        let body = Operator::from(op.clone()).encode();
        assert_eq!(body, json!({"#operator": "RollbackTransaction", "savepoint": "s1"}));
        match Operator::decode(&body).expect("decode") {
            Operator::RollbackTransaction(decoded) => assert_eq!(decoded, op),
            other => panic!("unexpected operator: {other:?}"),
        }
    }
}
