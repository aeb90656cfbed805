// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Schema field

use std::{
    cmp::max,
    collections::HashMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

/// The logical type of a field, e.g. `int64`, `string` or `struct`.
///
/// The commit protocol never interprets the type. It is carried so that a
/// schema change to the same field name is observable as a schema change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalType(pub String);

impl From<&str> for LogicalType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vellum Schema Field
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub id: i32,
    #[serde(default = "unset_id")]
    parent_id: i32,
    logical_type: LogicalType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Self>,
}

fn unset_id() -> i32 {
    -1
}

impl Field {
    /// Create a field without an id. Ids are assigned by [`super::Schema::set_field_id`].
    pub fn new(
        name: impl Into<String>,
        logical_type: impl Into<LogicalType>,
        nullable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            id: -1,
            parent_id: -1,
            logical_type: logical_type.into(),
            metadata: HashMap::new(),
            nullable,
            children: vec![],
        }
    }

    /// Create a struct field holding `children`.
    pub fn new_struct(name: impl Into<String>, children: Vec<Self>, nullable: bool) -> Self {
        Self {
            children,
            ..Self::new(name, "struct", nullable)
        }
    }

    pub fn logical_type(&self) -> &LogicalType {
        &self.logical_type
    }

    pub fn parent_id(&self) -> i32 {
        self.parent_id
    }

    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|f| f.name == name)
    }

    pub fn sub_field(&self, path_components: &[&str]) -> Option<&Self> {
        if path_components.is_empty() {
            Some(self)
        } else {
            let first = path_components[0];
            self.children
                .iter()
                .find(|c| c.name == first)
                .and_then(|c| c.sub_field(&path_components[1..]))
        }
    }

    /// Create a new field by removing all fields whose id is not in `ids`.
    ///
    /// A parent is kept whenever one of its children is kept. When
    /// `include_all_children` is set, selecting a parent keeps its whole subtree.
    pub fn project_by_ids(&self, ids: &[i32], include_all_children: bool) -> Option<Self> {
        if include_all_children && ids.contains(&self.id) {
            return Some(self.clone());
        }
        let children = self
            .children
            .iter()
            .filter_map(|c| c.project_by_ids(ids, include_all_children))
            .collect::<Vec<_>>();
        if !children.is_empty() || ids.contains(&self.id) {
            Some(Self {
                children,
                ..self.clone()
            })
        } else {
            None
        }
    }

    // Get the max field id of itself and all children.
    pub(super) fn max_id(&self) -> i32 {
        max(
            self.id,
            self.children.iter().map(|c| c.max_id()).max().unwrap_or(-1),
        )
    }

    /// Recursively set field ID and parent ID for this field and all its children.
    pub(super) fn set_id(&mut self, parent_id: i32, id_seed: &mut i32) {
        self.parent_id = parent_id;
        if self.id < 0 {
            self.id = *id_seed;
            *id_seed += 1;
        }
        self.children
            .iter_mut()
            .for_each(|f| f.set_id(self.id, id_seed));
    }

    pub fn field_by_id(&self, id: impl Into<i32>) -> Option<&Self> {
        let id = id.into();
        for child in self.children.as_slice() {
            if child.id == id {
                return Some(child);
            }
            if let Some(grandchild) = child.field_by_id(id) {
                return Some(grandchild);
            }
        }
        None
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Field(id={}, name={}, type={}",
            self.id, self.name, self.logical_type,
        )?;

        if !self.children.is_empty() {
            write!(f, ", children=[")?;
            for child in self.children.iter() {
                write!(f, "{}, ", child)?;
            }
            write!(f, "]")?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_by_ids_keeps_parent() {
        let mut id_seed = 0;
        let mut field = Field::new_struct(
            "point",
            vec![Field::new("x", "float", false), Field::new("y", "float", false)],
            true,
        );
        field.set_id(-1, &mut id_seed);
        assert_eq!(field.max_id(), 2);

        let projected = field.project_by_ids(&[2], false).unwrap();
        assert_eq!(projected.id, 0);
        assert_eq!(projected.children.len(), 1);
        assert_eq!(projected.children[0].name, "y");
        assert_eq!(projected.children[0].parent_id(), 0);

        let whole = field.project_by_ids(&[0], true).unwrap();
        assert_eq!(whole.children.len(), 2);
        assert!(field.project_by_ids(&[7], false).is_none());
    }

    #[test]
    fn test_display() {
        let field = Field::new("a", "int64", true);
        assert_eq!(field.to_string(), "Field(id=-1, name=a, type=int64)");
    }
}
