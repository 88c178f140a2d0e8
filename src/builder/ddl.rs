//! Index definition and transaction control.

use tracing::trace;

use crate::algebra::Statement;
use crate::auth::PrivilegeKind;
use crate::error::{PlanError, Result};
use crate::plan::{
    AlterIndex, BuildIndexes, CommitTransaction, CreateIndex, CreatePrimaryIndex, DropIndex,
    IndexRef, KeyspaceRef, Operator, RollbackTransaction, Savepoint, StartTransaction,
    TransactionIsolation,
};

use super::Context;

const PRIMARY_INDEX_NAME: &str = "#primary";

impl Context<'_> {
    pub(super) fn ddl(&mut self, stmt: &Statement) -> Result<Operator> {
        let op: Operator = match stmt {
            Statement::CreatePrimaryIndex(create) => CreatePrimaryIndex {
                keyspace: self.keyspace(&create.keyspace, PrivilegeKind::CreateIndex)?,
                name: create
                    .name
                    .clone()
                    .unwrap_or_else(|| PRIMARY_INDEX_NAME.to_string()),
                using: create.using,
                with: create.with.clone(),
            }
            .into(),
            Statement::CreateIndex(create) => CreateIndex {
                keyspace: self.keyspace(&create.keyspace, PrivilegeKind::CreateIndex)?,
                name: create.name.clone(),
                keys: create.keys.clone(),
                where_: create.where_.clone(),
                using: create.using,
                with: create.with.clone(),
            }
            .into(),
            Statement::DropIndex(drop) => {
                let keyspace = self.keyspace(&drop.keyspace, PrivilegeKind::DropIndex)?;
                let index = self.index(&keyspace, &drop.name)?;
                DropIndex { keyspace, index }.into()
            }
            Statement::AlterIndex(alter) => {
                let keyspace = self.keyspace(&alter.keyspace, PrivilegeKind::AlterIndex)?;
                let index = self.index(&keyspace, &alter.name)?;
                AlterIndex {
                    keyspace,
                    index,
                    with: alter.with.clone(),
                }
                .into()
            }
            Statement::BuildIndexes(build) => BuildIndexes {
                keyspace: self.keyspace(&build.keyspace, PrivilegeKind::BuildIndex)?,
                using: build.using,
                names: build.names.clone(),
            }
            .into(),
            Statement::StartTransaction { isolation } => StartTransaction {
                isolation: *isolation,
            }
            .into(),
            Statement::CommitTransaction => CommitTransaction.into(),
            Statement::RollbackTransaction { savepoint } => RollbackTransaction {
                savepoint: savepoint.clone(),
            }
            .into(),
            Statement::SetTransactionIsolation(isolation) => TransactionIsolation {
                isolation: *isolation,
            }
            .into(),
            Statement::Savepoint(name) => Savepoint { name: name.clone() }.into(),
            other => {
                return Err(PlanError::UnsupportedStatement {
                    detail: other.kind().to_string(),
                })
            }
        };
        trace!(op = op.name(), "plan.ddl");
        Ok(op)
    }

    fn index(&self, keyspace: &KeyspaceRef, name: &str) -> Result<IndexRef> {
        let handle = self
            .catalog()
            .index(&keyspace.namespace, &keyspace.keyspace, name)?;
        Ok(IndexRef::resolved(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{builder, names};
    use super::*;
    use crate::algebra::{
        AlterIndex as AlterStmt, CreatePrimaryIndex as CreatePrimaryStmt, DropIndex as DropStmt,
        IsolationLevel, KeyspaceTerm,
    };
    use crate::auth::GrantedKinds;
    use crate::catalog::IndexUsing;
    use serde_json::json;
    use std::sync::Arc;

    fn inner(plan: &Operator) -> &Operator {
        let Operator::Sequence(root) = plan else {
            panic!("unexpected root: {plan:?}");
        };
        match &root.children[0] {
            Operator::Authorize(auth) => auth.child.as_ref(),
            other => panic!("unexpected stage: {other:?}"),
        }
    }

    #[test]
    fn primary_index_gets_the_default_name() {
        let stmt = Statement::CreatePrimaryIndex(CreatePrimaryStmt {
            keyspace: KeyspaceTerm::new("archive"),
            name: None,
            using: IndexUsing::Gsi,
            with: None,
        });
        let plan = builder().build(&stmt).expect("build");
        match inner(&plan) {
            Operator::CreatePrimaryIndex(op) => {
                assert_eq!(op.name, "#primary");
                assert_eq!(op.keyspace.path(), "default:archive");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!plan.readonly());
    }

    #[test]
    fn drop_index_resolves_the_handle() {
        let stmt = Statement::DropIndex(DropStmt {
            keyspace: KeyspaceTerm::new("orders"),
            name: "idx_city".into(),
            using: IndexUsing::Gsi,
        });
        let plan = builder().build(&stmt).expect("build");
        match inner(&plan) {
            Operator::DropIndex(op) => {
                assert_eq!(op.index.name, "idx_city");
                assert!(op.index.handle.is_some());
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let missing = Statement::DropIndex(DropStmt {
            keyspace: KeyspaceTerm::new("orders"),
            name: "idx_nope".into(),
            using: IndexUsing::Gsi,
        });
        match builder().build(&missing) {
            Err(PlanError::IndexNotFound { index, .. }) => assert_eq!(index, "idx_nope"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn alter_index_needs_its_privilege() {
        let stmt = Statement::AlterIndex(AlterStmt {
            keyspace: KeyspaceTerm::new("orders"),
            name: "idx_total".into(),
            using: IndexUsing::Gsi,
            with: json!({"action": "move"}),
        });
        let limited =
            builder().with_authorizer(Arc::new(GrantedKinds::new([PrivilegeKind::CreateIndex])));
        match limited.build(&stmt) {
            Err(PlanError::Unauthorized { privilege }) => {
                assert_eq!(privilege, "alter_index on default:orders")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn transaction_statements_need_no_keyspace() {
        for (stmt, name) in [
            (
                Statement::StartTransaction {
                    isolation: Some(IsolationLevel::ReadCommitted),
                },
                "StartTransaction",
            ),
            (Statement::CommitTransaction, "CommitTransaction"),
            (
                Statement::RollbackTransaction {
                    savepoint: Some("s1".into()),
                },
                "RollbackTransaction",
            ),
            (
                Statement::SetTransactionIsolation(IsolationLevel::ReadCommitted),
                "TransactionIsolation",
            ),
            (Statement::Savepoint("s1".into()), "Savepoint"),
        ] {
            let plan = builder().build(&stmt).expect("build");
            assert_eq!(names(&plan), vec!["Sequence", "Authorize", name, "Stream"]);
            assert!(!plan.readonly());
        }
    }
}
