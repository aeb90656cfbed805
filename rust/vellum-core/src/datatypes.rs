// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Vellum data types, [Schema] and [Field]

mod field;
mod schema;

pub use field::{Field, LogicalType};
pub use schema::Schema;
