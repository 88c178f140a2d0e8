//! Privilege requirements and pre-authorization.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{PlanError, Result};

/// Kind of access a statement needs.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrivilegeKind {
    Select,
    Insert,
    Update,
    Delete,
    Upsert,
    CreateIndex,
    DropIndex,
    AlterIndex,
    BuildIndex,
    Transaction,
}

impl PrivilegeKind {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            PrivilegeKind::Select => "select",
            PrivilegeKind::Insert => "insert",
            PrivilegeKind::Update => "update",
            PrivilegeKind::Delete => "delete",
            PrivilegeKind::Upsert => "upsert",
            PrivilegeKind::CreateIndex => "create_index",
            PrivilegeKind::DropIndex => "drop_index",
            PrivilegeKind::AlterIndex => "alter_index",
            PrivilegeKind::BuildIndex => "build_index",
            PrivilegeKind::Transaction => "transaction",
        }
    }

    /// Parses the wire spelling.
    pub fn parse(text: &str) -> Option<Self> {
        let kind = match text {
            "select" => PrivilegeKind::Select,
            "insert" => PrivilegeKind::Insert,
            "update" => PrivilegeKind::Update,
            "delete" => PrivilegeKind::Delete,
            "upsert" => PrivilegeKind::Upsert,
            "create_index" => PrivilegeKind::CreateIndex,
            "drop_index" => PrivilegeKind::DropIndex,
            "alter_index" => PrivilegeKind::AlterIndex,
            "build_index" => PrivilegeKind::BuildIndex,
            "transaction" => PrivilegeKind::Transaction,
            _ => return None,
        };
        Some(kind)
    }
}

/// What a privilege applies to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrivilegeTarget {
    /// `namespace:keyspace` path known at plan time.
    Keyspace(String),
    /// Target only known at execution time.
    Dynamic(String),
}

/// One required privilege.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Privilege {
    /// Access kind.
    pub kind: PrivilegeKind,
    /// Target.
    pub target: PrivilegeTarget,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            PrivilegeTarget::Keyspace(path) => write!(f, "{} on {path}", self.kind.as_str()),
            PrivilegeTarget::Dynamic(what) => {
                write!(f, "{} on <dynamic {what}>", self.kind.as_str())
            }
        }
    }
}

/// Ordered set of required privileges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Privileges {
    entries: BTreeSet<Privilege>,
}

impl Privileges {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a keyspace privilege.
    pub fn add(&mut self, kind: PrivilegeKind, path: impl Into<String>) {
        self.entries.insert(Privilege {
            kind,
            target: PrivilegeTarget::Keyspace(path.into()),
        });
    }

    /// Adds a privilege whose target is resolved at execution time.
    pub fn add_dynamic(&mut self, kind: PrivilegeKind, what: impl Into<String>) {
        self.entries.insert(Privilege {
            kind,
            target: PrivilegeTarget::Dynamic(what.into()),
        });
    }

    /// Merges another set into this one.
    pub fn extend(&mut self, other: &Privileges) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// True when any target is dynamic.
    pub fn is_dynamic(&self) -> bool {
        self.entries
            .iter()
            .any(|p| matches!(p.target, PrivilegeTarget::Dynamic(_)))
    }

    /// Iterates in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Privilege> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pre-authorization collaborator.
pub trait Authorizer: Send + Sync {
    /// Validates every privilege; the first missing one is reported.
    fn authorize(&self, privileges: &Privileges) -> Result<()>;
}

/// Grants everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _privileges: &Privileges) -> Result<()> {
        Ok(())
    }
}

/// Refuses every non-empty privilege set.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, privileges: &Privileges) -> Result<()> {
        match privileges.iter().next() {
            Some(first) => Err(PlanError::Unauthorized {
                privilege: first.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Grants only the listed privilege kinds.
#[derive(Clone, Debug, Default)]
pub struct GrantedKinds {
    granted: BTreeSet<PrivilegeKind>,
}

impl GrantedKinds {
    /// Grants `kinds` on every target.
    pub fn new(kinds: impl IntoIterator<Item = PrivilegeKind>) -> Self {
        Self {
            granted: kinds.into_iter().collect(),
        }
    }
}

impl Authorizer for GrantedKinds {
    fn authorize(&self, privileges: &Privileges) -> Result<()> {
        match privileges.iter().find(|p| !self.granted.contains(&p.kind)) {
            Some(missing) => Err(PlanError::Unauthorized {
                privilege: missing.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granted_kinds_reports_first_missing() {
        let mut privs = Privileges::new();
        privs.add(PrivilegeKind::Select, "default:orders");
        privs.add(PrivilegeKind::Delete, "default:orders");
        let auth = GrantedKinds::new([PrivilegeKind::Select]);
        match auth.authorize(&privs) {
            Err(PlanError::Unauthorized { privilege }) => {
                assert_eq!(privilege, "delete on default:orders")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn deny_all_passes_only_empty_sets() {
        assert!(DenyAll.authorize(&Privileges::new()).is_ok());
        let mut privs = Privileges::new();
        privs.add(PrivilegeKind::Insert, "default:orders");
        assert!(DenyAll.authorize(&privs).is_err());
    }

    #[test]
    fn dynamic_targets_are_flagged() {
        let mut privs = Privileges::new();
        privs.add(PrivilegeKind::Select, "default:orders");
        assert!(!privs.is_dynamic());
        privs.add_dynamic(PrivilegeKind::Select, "$keyspace");
        assert!(privs.is_dynamic());
        assert_eq!(privs.len(), 2);
    }
}
