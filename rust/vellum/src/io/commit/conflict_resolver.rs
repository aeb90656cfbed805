// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Checking a transaction against the transactions committed after its read
//! version.
//!
//! Isolation is snapshot isolation. A transaction that passes every check is
//! rebuilt on top of the latest manifest, so compatible operations only need
//! to not invalidate each other's payload. In the table below the row is the
//! transaction being committed and the column is one committed concurrently.
//! `C` is a conflict, `-` is compatible and `?` depends on the payloads.
//!
//! |                  | Append | Overwrite | Project | CreateIndex | Delete/Update | Rewrite | Merge | Restore | ReserveFragments | UpdateConfig |
//! |------------------|--------|-----------|---------|-------------|---------------|---------|-------|---------|------------------|--------------|
//! | Append           | -      | C         | ?       | -           | -             | -       | C     | C       | -                | -            |
//! | Overwrite        | C      | C         | C       | C           | C             | C       | C     | C       | C                | C            |
//! | Project          | ?      | C         | ?       | -           | -             | -       | C     | C       | -                | -            |
//! | CreateIndex      | -      | C         | ?       | ?           | -             | C       | -     | C       | -                | -            |
//! | Delete/Update    | -      | C         | -       | -           | ?             | ?       | C     | C       | -                | -            |
//! | Rewrite          | -      | C         | -       | C           | ?             | ?       | C     | C       | -                | -            |
//! | Merge            | C      | C         | C       | -           | C             | C       | C     | C       | -                | -            |
//! | Restore          | C      | C         | C       | C           | C             | C       | C     | C       | C                | C            |
//! | ReserveFragments | -      | C         | -       | -           | -             | -       | -     | C       | -                | -            |
//! | UpdateConfig     | -      | ?         | -       | -           | -             | -       | -     | C       | -                | ?            |

use std::collections::HashSet;

use snafu::location;
use vellum_core::datatypes::Schema;
use vellum_core::{Error, Result};
use vellum_table::format::Fragment;

use crate::dataset::transaction::{Operation, Transaction};

/// Whether two operations can both be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Compatible,
    Conflict,
}

impl From<bool> for Resolution {
    fn from(conflict: bool) -> Self {
        if conflict {
            Self::Conflict
        } else {
            Self::Compatible
        }
    }
}

/// Decide whether `candidate` can be applied after `prior` was committed.
pub fn resolve(candidate: &Operation, prior: &Operation) -> Resolution {
    use Operation::*;
    use Resolution::*;

    // Nothing written after a concurrent Overwrite or Restore can be trusted,
    // except a config change that does not touch the overwritten keys.
    match (candidate, prior) {
        (UpdateConfig { .. }, Overwrite { .. }) => {
            return candidate.upsert_key_conflict(prior).into()
        }
        (_, Overwrite { .. } | Restore { .. }) | (Overwrite { .. } | Restore { .. }, _) => {
            return Conflict
        }
        _ => {}
    }

    match candidate {
        Append { fragments } => match prior {
            Project { schema } => (!fragments_cover_schema(fragments, schema)).into(),
            Merge { .. } => Conflict,
            _ => Compatible,
        },
        Project { schema } => match prior {
            Append { fragments } => (!fragments_cover_schema(fragments, schema)).into(),
            Project { schema: prior_schema } => (schema != prior_schema).into(),
            Merge { .. } => Conflict,
            _ => Compatible,
        },
        CreateIndex { new_indices, .. } => match prior {
            Project { schema } => {
                let field_ids = field_ids(schema);
                new_indices
                    .iter()
                    .flat_map(|index| index.fields.iter())
                    .any(|id| !field_ids.contains(id))
                    .into()
            }
            CreateIndex {
                new_indices: prior_indices,
                ..
            } => new_indices
                .iter()
                .any(|index| prior_indices.iter().any(|p| p.name == index.name))
                .into(),
            Rewrite { .. } => Conflict,
            _ => Compatible,
        },
        Delete { .. } | Update { .. } => match prior {
            Delete { .. } | Update { .. } | Rewrite { .. } => {
                candidate.modifies_same_ids(prior).into()
            }
            Merge { .. } => Conflict,
            _ => Compatible,
        },
        Rewrite { .. } => match prior {
            Delete { .. } | Update { .. } | Rewrite { .. } => {
                candidate.modifies_same_ids(prior).into()
            }
            CreateIndex { .. } | Merge { .. } => Conflict,
            _ => Compatible,
        },
        Merge { .. } => match prior {
            CreateIndex { .. } | ReserveFragments { .. } | UpdateConfig { .. } => Compatible,
            _ => Conflict,
        },
        ReserveFragments { .. } => Compatible,
        UpdateConfig { .. } => match prior {
            UpdateConfig { .. } => candidate.upsert_key_conflict(prior).into(),
            _ => Compatible,
        },
        Overwrite { .. } | Restore { .. } => Conflict,
    }
}

fn field_ids(schema: &Schema) -> HashSet<i32> {
    schema.fields_pre_order().map(|f| f.id).collect()
}

/// Whether every fragment stores every field of `schema`.
fn fragments_cover_schema(fragments: &[Fragment], schema: &Schema) -> bool {
    let wanted = field_ids(schema);
    fragments.iter().all(|fragment| {
        let stored = fragment.field_ids().collect::<HashSet<_>>();
        wanted.is_subset(&stored)
    })
}

/// Checks one pending transaction against concurrently committed ones.
#[derive(Debug)]
pub struct ConflictResolver<'a> {
    transaction: &'a Transaction,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(transaction: &'a Transaction) -> Self {
        Self { transaction }
    }

    /// Check the transaction against `other_transaction`, which was committed
    /// as `other_version`.
    pub fn check_txn(&self, other_transaction: &Transaction, other_version: u64) -> Result<()> {
        match resolve(&self.transaction.operation, &other_transaction.operation) {
            Resolution::Compatible => Ok(()),
            Resolution::Conflict => Err(Error::IncompatibleOperation {
                version: other_version,
                conflicting_transaction: other_transaction.uuid.clone(),
                source: format!(
                    "This {} transaction is incompatible with concurrent transaction {} at version {}.",
                    self.transaction.operation, other_transaction.operation, other_version
                )
                .into(),
                location: location!(),
            }),
        }
    }
}
