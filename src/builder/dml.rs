//! INSERT, UPSERT, UPDATE, DELETE, and MERGE.

use crate::algebra::{Delete, Insert, InsertSource, Merge as MergeStmt, Projection, Update};
use crate::auth::PrivilegeKind;
use crate::error::{PlanError, Result};
use crate::expr::Expr;
use crate::plan::{
    Alias, CloneDoc, Discard, Fetch, Filter, FinalProject, InitialProject, KeyScan, KeyspaceRef,
    Limit, Merge, Operator, OptEstimate, SendDelete, SendInsert, SendUpdate, SendUpsert, Sequence,
    Set, Unset, ValueScan,
};

use super::{Context, Stages};

impl Context<'_> {
    pub(super) fn insert(&mut self, ins: &Insert, upsert: bool) -> Result<Operator> {
        let kind = if upsert {
            PrivilegeKind::Upsert
        } else {
            PrivilegeKind::Insert
        };
        let keyspace = self.keyspace(&ins.keyspace, kind)?;
        let alias = ins.keyspace.as_alias();
        let mut stages = Stages::default();
        let (key, value, options) = match &ins.source {
            InsertSource::Values(pairs) => {
                stages.push(ValueScan {
                    values: pairs.clone(),
                    est: OptEstimate::default(),
                });
                (None, None, None)
            }
            InsertSource::Select { select, key, value } => {
                let source = self.select(select)?;
                stages.push(source);
                (Some(key.clone()), value.clone(), None)
            }
        };
        let send: Operator = if upsert {
            let mut op = SendUpsert::new(keyspace, alias);
            op.key = key;
            op.value = value;
            op.options = options;
            op.into()
        } else {
            let mut op = SendInsert::new(keyspace, alias);
            op.key = key;
            op.value = value;
            op.options = options;
            op.into()
        };
        stages.push_lane(send);
        Ok(self.finish_mutation(stages, None, ins.returning.as_ref()))
    }

    pub(super) fn update(&mut self, upd: &Update) -> Result<Operator> {
        let keyspace = self.keyspace(&upd.keyspace, PrivilegeKind::Update)?;
        let alias = upd.keyspace.as_alias();
        let mut stages = self.mutation_source(&keyspace, alias, upd.keyspace.keys.as_ref(), upd.where_.as_ref())?;
        stages.push_lane(CloneDoc {
            alias: alias.to_string(),
        });
        if !upd.set.is_empty() {
            stages.push_lane(Set {
                terms: upd.set.clone(),
            });
        }
        if !upd.unset.is_empty() {
            stages.push_lane(Unset {
                terms: upd.unset.clone(),
            });
        }
        let mut send = SendUpdate::new(keyspace, alias);
        send.limit = upd.limit.clone();
        stages.push_lane(send);
        Ok(self.finish_mutation(stages, upd.limit.as_ref(), upd.returning.as_ref()))
    }

    pub(super) fn delete(&mut self, del: &Delete) -> Result<Operator> {
        let keyspace = self.keyspace(&del.keyspace, PrivilegeKind::Delete)?;
        let alias = del.keyspace.as_alias();
        let mut stages = self.mutation_source(&keyspace, alias, del.keyspace.keys.as_ref(), del.where_.as_ref())?;
        let mut send = SendDelete::new(keyspace, alias);
        send.limit = del.limit.clone();
        stages.push_lane(send);
        Ok(self.finish_mutation(stages, del.limit.as_ref(), del.returning.as_ref()))
    }

    /// Scan, fetch, and filter of the documents an UPDATE or DELETE touches.
    fn mutation_source(
        &mut self,
        keyspace: &KeyspaceRef,
        alias: &str,
        keys: Option<&Expr>,
        filter: Option<&Expr>,
    ) -> Result<Stages> {
        let mut stages = Stages::default();
        let scan = match keys {
            Some(keys) => KeyScan {
                keys: keys.clone(),
                distinct: false,
                est: OptEstimate::default(),
            }
            .into(),
            None => self.select_scan(keyspace, alias, filter)?,
        };
        stages.push(scan);
        stages.push_lane(Fetch::new(keyspace.clone(), alias));
        if let Some(cond) = filter {
            stages.push_lane(Filter::new(cond.clone()));
        }
        Ok(stages)
    }

    /// RETURNING projection or `Discard`, with the limit after the lanes.
    fn finish_mutation(
        &self,
        mut stages: Stages,
        limit: Option<&Expr>,
        returning: Option<&Projection>,
    ) -> Operator {
        let par = self.max_parallelism();
        if let Some(projection) = returning {
            stages.push_lane(InitialProject::new(projection.terms.clone(), projection.raw));
            stages.push_lane(FinalProject::default());
        }
        stages.close_lane(par);
        if let Some(limit) = limit {
            stages.push(Limit::new(limit.clone()));
        }
        if returning.is_none() {
            stages.push(Discard::default());
        }
        stages.finish(par)
    }

    pub(super) fn merge(&mut self, merge: &MergeStmt) -> Result<Operator> {
        let mut stages = Stages::default();
        match (&merge.source.select, &merge.source.from) {
            (Some(select), _) => {
                let source = self.select(select)?;
                let alias = merge.source.alias.clone().unwrap_or_default();
                stages.push(Alias::new(alias, source));
            }
            (None, Some(term)) => {
                let keyspace = self.keyspace_for_read(term)?;
                let alias = term.as_alias();
                let scan = match &term.keys {
                    Some(keys) => KeyScan {
                        keys: keys.clone(),
                        distinct: false,
                        est: OptEstimate::default(),
                    }
                    .into(),
                    None => self.select_scan(&keyspace, alias, None)?,
                };
                stages.push(scan);
                stages.push_lane(Fetch::new(keyspace, alias));
            }
            (None, None) => return Err(PlanError::MergeWithoutSource),
        }

        let target = &merge.target;
        let alias = target.as_alias().to_string();
        let mut keyspace = None;
        for (present, kind) in [
            (merge.update.is_some(), PrivilegeKind::Update),
            (merge.delete.is_some(), PrivilegeKind::Delete),
            (merge.insert.is_some(), PrivilegeKind::Insert),
        ] {
            if present {
                keyspace = Some(self.keyspace(target, kind)?);
            }
        }
        let keyspace = match keyspace {
            Some(keyspace) => keyspace,
            None => self.keyspace(target, PrivilegeKind::Update)?,
        };

        let update = merge.update.as_ref().map(|action| {
            let mut children = Vec::new();
            if let Some(cond) = &action.where_ {
                children.push(Filter::new(cond.clone()).into());
            }
            children.push(CloneDoc { alias: alias.clone() }.into());
            if !action.set.is_empty() {
                children.push(Set {
                    terms: action.set.clone(),
                }
                .into());
            }
            if !action.unset.is_empty() {
                children.push(Unset {
                    terms: action.unset.clone(),
                }
                .into());
            }
            children.push(SendUpdate::new(keyspace.clone(), alias.clone()).into());
            Box::new(Operator::from(Sequence::new(children)))
        });
        let delete = merge.delete.as_ref().map(|action| {
            let mut children = Vec::new();
            if let Some(cond) = &action.where_ {
                children.push(Filter::new(cond.clone()).into());
            }
            children.push(SendDelete::new(keyspace.clone(), alias.clone()).into());
            Box::new(Operator::from(Sequence::new(children)))
        });
        let insert = merge.insert.as_ref().map(|action| {
            let mut children = Vec::new();
            if let Some(cond) = &action.where_ {
                children.push(Filter::new(cond.clone()).into());
            }
            let mut send = SendInsert::new(keyspace.clone(), alias.clone());
            send.key = Some(merge.key.clone());
            send.value = Some(action.value.clone());
            children.push(send.into());
            Box::new(Operator::from(Sequence::new(children)))
        });

        stages.push_lane(Merge {
            keyspace,
            alias,
            key: merge.key.clone(),
            update,
            delete,
            insert,
        });
        Ok(self.finish_mutation(stages, merge.limit.as_ref(), merge.returning.as_ref()))
    }
}
