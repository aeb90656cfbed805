// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Schema

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use snafu::location;

use super::field::Field;
use crate::{Error, Result};

/// Vellum Schema.
///
/// Fields are identified by a stable integer id. Renaming or reordering
/// fields keeps their ids, which is what lets data files written under an
/// older schema be matched against a newer one.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Top-level fields in the dataset.
    pub fields: Vec<Field>,
    /// Metadata of the schema
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// State for a pre-order DFS iterator over the fields of a schema.
struct SchemaFieldIterPreOrder<'a> {
    field_stack: Vec<&'a Field>,
}

impl<'a> SchemaFieldIterPreOrder<'a> {
    fn new(schema: &'a Schema) -> Self {
        let mut field_stack = Vec::with_capacity(schema.fields.len() * 2);
        for field in schema.fields.iter().rev() {
            field_stack.push(field);
        }
        Self { field_stack }
    }
}

/// Iterator implementation for a pre-order traversal of fields
impl<'a> Iterator for SchemaFieldIterPreOrder<'a> {
    type Item = &'a Field;

    fn next(&mut self) -> Option<Self::Item> {
        let next_field = self.field_stack.pop()?;
        for child in next_field.children.iter().rev() {
            self.field_stack.push(child);
        }
        Some(next_field)
    }
}

impl Schema {
    /// Build a schema and assign ids to every field in pre-order.
    pub fn new(fields: Vec<Field>) -> Self {
        let mut schema = Self {
            fields,
            metadata: HashMap::new(),
        };
        schema.set_field_id(None);
        schema
    }

    /// Check that the top level fields don't contain `.` in their names
    /// and that field ids are assigned and unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen_names = HashSet::new();
        for field in self.fields.iter() {
            if field.name.contains('.') {
                return Err(Error::Schema {
                    message: format!(
                        "Top level field {} cannot contain `.`. Maybe you meant to create a struct field?",
                        field.name
                    ),
                    location: location!(),
                });
            }
            if !seen_names.insert(field.name.as_str()) {
                return Err(Error::Schema {
                    message: format!("Duplicate field name \"{}\" in schema", field.name),
                    location: location!(),
                });
            }
        }

        let mut seen_ids = HashSet::new();
        for field in self.fields_pre_order() {
            if field.id < 0 {
                return Err(Error::Schema {
                    message: format!("Field {} has a negative id {}", field.name, field.id),
                    location: location!(),
                });
            }
            if !seen_ids.insert(field.id) {
                return Err(Error::Schema {
                    message: format!("Duplicate field id {} in schema {:?}", field.id, self),
                    location: location!(),
                });
            }
        }

        Ok(())
    }

    /// Iterates over the fields using a pre-order traversal
    ///
    /// This is a DFS traversal where the parent is visited
    /// before its children
    pub fn fields_pre_order(&self) -> impl Iterator<Item = &Field> {
        SchemaFieldIterPreOrder::new(self)
    }

    /// Returns a new schema that only contains the fields in `column_ids`.
    ///
    /// If `include_all_children` is true, then if a parent field id is passed,
    /// then all children of that field will be included in the projection
    /// regardless of whether their ids were passed.
    pub fn project_by_ids(&self, column_ids: &[i32], include_all_children: bool) -> Self {
        let filtered_fields = self
            .fields
            .iter()
            .filter_map(|f| f.project_by_ids(column_ids, include_all_children))
            .collect();
        Self {
            fields: filtered_fields,
            metadata: self.metadata.clone(),
        }
    }

    /// Project the schema to the named top-level or nested columns.
    pub fn project<T: AsRef<str>>(&self, columns: &[T]) -> Result<Self> {
        let mut ids = Vec::with_capacity(columns.len());
        for column in columns {
            let field = self.field(column.as_ref()).ok_or_else(|| Error::Schema {
                message: format!("Column {} does not exist", column.as_ref()),
                location: location!(),
            })?;
            ids.push(field.id);
        }
        Ok(self.project_by_ids(&ids, true))
    }

    /// Get a field by name. Return `None` if the field does not exist.
    pub fn field(&self, name: &str) -> Option<&Field> {
        let split = name.split('.').collect::<Vec<_>>();
        self.fields
            .iter()
            .find(|f| f.name == split[0])
            .and_then(|c| c.sub_field(&split[1..]))
    }

    pub fn field_id(&self, column: &str) -> Result<i32> {
        self.field(column)
            .map(|f| f.id)
            .ok_or_else(|| Error::Schema {
                message: format!("Column {} not in schema", column),
                location: location!(),
            })
    }

    // Recursively collect all the field IDs, in pre-order traversal order.
    pub fn field_ids(&self) -> Vec<i32> {
        self.fields_pre_order().map(|f| f.id).collect()
    }

    /// Get field by its id.
    pub fn field_by_id(&self, id: impl Into<i32>) -> Option<&Field> {
        let id = id.into();
        for field in self.fields.iter() {
            if field.id == id {
                return Some(field);
            }
            if let Some(grandchild) = field.field_by_id(id) {
                return Some(grandchild);
            }
        }
        None
    }

    /// Get the maximum field id in the schema.
    ///
    /// Note: When working with Datasets, you should prefer `Manifest::max_field_id()`
    /// over this method. This method does not take into account the field IDs
    /// of dropped fields.
    pub fn max_field_id(&self) -> Option<i32> {
        self.fields.iter().map(|f| f.max_id()).max()
    }

    /// Walk through the fields and assign a new field id to each field that does
    /// not have one (e.g. is set to -1)
    ///
    /// If this schema is on an existing dataset, pass the result of
    /// `Manifest::max_field_id` to `max_existing_id`. If this schema is not
    /// associated with a dataset, pass `None`.
    pub fn set_field_id(&mut self, max_existing_id: Option<i32>) {
        let schema_max_id = self.max_field_id().unwrap_or(-1);
        let max_existing_id = max_existing_id.unwrap_or(-1);
        let mut current_id = schema_max_id.max(max_existing_id) + 1;
        self.fields
            .iter_mut()
            .for_each(|f| f.set_id(-1, &mut current_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_schema() -> Schema {
        Schema::new(vec![
            Field::new("a", "int64", false),
            Field::new_struct(
                "b",
                vec![Field::new("f1", "utf8", true), Field::new("f2", "bool", true)],
                true,
            ),
            Field::new("c", "float64", false),
        ])
    }

    #[test]
    fn test_schema_field_ids() {
        let schema = nested_schema();
        assert_eq!(schema.field_ids(), vec![0, 1, 2, 3, 4]);
        assert_eq!(schema.max_field_id(), Some(4));
        assert_eq!(schema.field("b.f2").unwrap().id, 3);
        assert_eq!(schema.field_by_id(2).unwrap().name, "f1");
        assert!(schema.field_by_id(10).is_none());
        schema.validate().unwrap();
    }

    #[test]
    fn test_set_field_id_continues_after_existing() {
        let mut schema = Schema {
            fields: vec![Field::new("x", "int32", true)],
            metadata: HashMap::new(),
        };
        schema.set_field_id(Some(7));
        assert_eq!(schema.field_ids(), vec![8]);
    }

    #[test]
    fn test_project() {
        let schema = nested_schema();
        let projected = schema.project(&["c", "b.f1"]).unwrap();
        assert_eq!(projected.field_ids(), vec![1, 2, 4]);

        let by_id = schema.project_by_ids(&[1], true);
        assert_eq!(by_id.field_ids(), vec![1, 2, 3]);

        assert!(schema.project(&["nope"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_schemas() {
        let dotted = Schema::new(vec![Field::new("a.b", "int64", true)]);
        assert!(matches!(dotted.validate(), Err(Error::Schema { .. })));

        let mut duplicate = nested_schema();
        duplicate.fields[2].id = 0;
        assert!(matches!(duplicate.validate(), Err(Error::Schema { .. })));

        let unassigned = Schema {
            fields: vec![Field::new("a", "int64", true)],
            metadata: HashMap::new(),
        };
        assert!(unassigned.validate().is_err());
    }
}
