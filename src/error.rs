#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the planner.
pub type Result<T> = std::result::Result<T, PlanError>;

/// Coarse classification of a [`PlanError`].
///
/// Callers use the kind to decide how to react: build and decode errors are
/// surfaced to the client, resolution errors trigger re-preparation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Statement shape rejected while constructing a plan.
    Build,
    /// Encoded plan input is malformed or incomplete.
    Decode,
    /// A catalog object the plan targets is unavailable.
    Resolution,
    /// Eager pre-authorization rejected the statement.
    Authorization,
    /// Planner configuration could not be loaded.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Build => "build",
            ErrorKind::Decode => "decode",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Structured errors emitted while building, decoding, or resolving plans.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    /// Encoded discriminator does not name a registered operator.
    #[error("unknown operator '{name}'")]
    UnknownOperator { name: String },
    /// Required field absent from an encoded operator.
    #[error("{operator}: missing field '{field}'")]
    MissingField {
        operator: &'static str,
        field: &'static str,
    },
    /// Field present but of the wrong shape.
    #[error("{operator}: invalid field '{field}': {reason}")]
    InvalidField {
        operator: &'static str,
        field: String,
        reason: String,
    },
    /// Expression text failed to parse.
    #[error("cannot parse expression '{text}': {reason}")]
    ExprParse { text: String, reason: String },
    /// A sub-query FROM term must carry USE KEYS.
    #[error("FROM in subquery must use KEYS clause: keyspace '{keyspace}'")]
    SubqueryKeysRequired { keyspace: String },
    /// MERGE statement has neither a SELECT nor a keyspace source.
    #[error("MERGE requires either a SELECT source or a FROM keyspace")]
    MergeWithoutSource,
    /// Statement form is not accepted in this position.
    #[error("unsupported statement: {detail}")]
    UnsupportedStatement { detail: String },
    /// Aggregate function used where aggregation is not allowed.
    #[error("aggregate '{aggregate}' not allowed in {clause}")]
    InvalidAggregate {
        aggregate: String,
        clause: &'static str,
    },
    /// Namespace or keyspace lookup failed.
    #[error("keyspace '{namespace}:{keyspace}' not found")]
    KeyspaceNotFound { namespace: String, keyspace: String },
    /// Index lookup failed.
    #[error("index '{index}' not found on '{keyspace}'")]
    IndexNotFound { keyspace: String, index: String },
    /// Keyspace has no usable primary or secondary index.
    #[error("no index available on keyspace '{keyspace}'; create a primary index")]
    NoPrimaryIndex { keyspace: String },
    /// Pre-authorization failed.
    #[error("user lacks privilege {privilege}")]
    Unauthorized { privilege: String },
    /// Encoded plan string could not be unpacked.
    #[error("invalid encoded plan: {reason}")]
    EncodedPlan { reason: String },
    /// Encoded plan disagrees with the cached plan of the same name.
    #[error("encoded plan for prepared '{name}' does not match the cached plan")]
    EncodedPlanMismatch { name: String },
    /// Prepared name is not present in the cache.
    #[error("no such prepared statement '{name}'")]
    PreparedNotFound { name: String },
    /// Cached plan failed verification and re-preparation did not repair it.
    #[error("prepared statement '{name}' no longer matches the catalog")]
    PreparedStale { name: String },
    /// Configuration failed to load.
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl PlanError {
    /// Builds a [`PlanError::InvalidField`].
    pub fn invalid_field(
        operator: &'static str,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PlanError::InvalidField {
            operator,
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`PlanError::ExprParse`].
    pub fn expr_parse(text: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanError::ExprParse {
            text: text.into(),
            reason: reason.into(),
        }
    }

    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::UnknownOperator { .. }
            | PlanError::MissingField { .. }
            | PlanError::InvalidField { .. }
            | PlanError::ExprParse { .. }
            | PlanError::EncodedPlan { .. }
            | PlanError::EncodedPlanMismatch { .. } => ErrorKind::Decode,
            PlanError::SubqueryKeysRequired { .. }
            | PlanError::MergeWithoutSource
            | PlanError::UnsupportedStatement { .. }
            | PlanError::InvalidAggregate { .. } => ErrorKind::Build,
            PlanError::KeyspaceNotFound { .. }
            | PlanError::IndexNotFound { .. }
            | PlanError::NoPrimaryIndex { .. }
            | PlanError::PreparedNotFound { .. }
            | PlanError::PreparedStale { .. } => ErrorKind::Resolution,
            PlanError::Unauthorized { .. } => ErrorKind::Authorization,
            PlanError::Config { .. } => ErrorKind::Config,
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::UnknownOperator { .. } => "UnknownOperator",
            PlanError::MissingField { .. } => "MissingField",
            PlanError::InvalidField { .. } => "InvalidField",
            PlanError::ExprParse { .. } => "ExprParse",
            PlanError::SubqueryKeysRequired { .. } => "SubqueryKeysRequired",
            PlanError::MergeWithoutSource => "MergeWithoutSource",
            PlanError::UnsupportedStatement { .. } => "UnsupportedStatement",
            PlanError::InvalidAggregate { .. } => "InvalidAggregate",
            PlanError::KeyspaceNotFound { .. } => "KeyspaceNotFound",
            PlanError::IndexNotFound { .. } => "IndexNotFound",
            PlanError::NoPrimaryIndex { .. } => "NoPrimaryIndex",
            PlanError::Unauthorized { .. } => "Unauthorized",
            PlanError::EncodedPlan { .. } => "EncodedPlan",
            PlanError::EncodedPlanMismatch { .. } => "EncodedPlanMismatch",
            PlanError::PreparedNotFound { .. } => "PreparedNotFound",
            PlanError::PreparedStale { .. } => "PreparedStale",
            PlanError::Config { .. } => "Config",
        }
    }
}

/// Formats planner errors with their codes.
pub struct PlanErrorWithCode<'a>(pub &'a PlanError);

impl fmt::Display for PlanErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_kinds_line_up() {
        let err = PlanError::MergeWithoutSource;
        assert_eq!(err.kind(), ErrorKind::Build);
        assert_eq!(
            PlanErrorWithCode(&err).to_string(),
            "[MergeWithoutSource] MERGE requires either a SELECT source or a FROM keyspace"
        );

        let err = PlanError::KeyspaceNotFound {
            namespace: "default".into(),
            keyspace: "orders".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert_eq!(err.code(), "KeyspaceNotFound");
    }
}
