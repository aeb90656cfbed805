// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Vellum: transactional commits for versioned tables.
//!
//! A dataset is a linear chain of immutable manifests stored on an object
//! store. Writers describe a change as a [`dataset::transaction::Transaction`]
//! and publish it with [`dataset::CommitBuilder`], which checks it against
//! every version committed since it was read and claims the next version
//! slot with a conditional put.
//!
//! ```no_run
//! # use vellum::dataset::transaction::{Operation, TransactionBuilder};
//! # use vellum::dataset::CommitBuilder;
//! # use vellum_core::datatypes::{Field, Schema};
//! # async fn run() -> vellum::Result<()> {
//! let schema = Schema::new(vec![Field::new("id", "int64", false)]);
//! let transaction = TransactionBuilder::new(0)
//!     .operation(Operation::Overwrite {
//!         fragments: vec![],
//!         schema,
//!         config_upsert_values: None,
//!     })
//!     .build()?;
//! let dataset = CommitBuilder::new("memory://events")
//!     .execute(transaction)
//!     .await?;
//! assert_eq!(dataset.version().version, 1);
//! # Ok(())
//! # }
//! ```

pub mod dataset;
pub mod io;
pub mod utils;

pub use dataset::Dataset;
pub use vellum_core::{Error, Result};
