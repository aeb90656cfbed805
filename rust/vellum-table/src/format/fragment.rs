// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use serde::{Deserialize, Serialize};
use snafu::location;
use vellum_core::datatypes::Schema;
use vellum_core::{Error, Result};

use super::FileVersion;

/// Data File
///
/// A data file is one piece of file storing data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Relative path of the data file to dataset root.
    pub path: String,
    /// The ids of fields in this file.
    pub fields: Vec<i32>,
    /// The offsets of the fields listed in `fields`, empty in legacy files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_offsets: Vec<u32>,
    /// The major version of the file format used to write this file.
    #[serde(default)]
    pub file_major_version: u32,
    /// The minor version of the file format used to write this file.
    #[serde(default)]
    pub file_minor_version: u32,
}

impl DataFile {
    pub fn new(
        path: impl Into<String>,
        fields: Vec<i32>,
        column_offsets: Vec<u32>,
        file_major_version: u32,
        file_minor_version: u32,
    ) -> Self {
        Self {
            path: path.into(),
            fields,
            column_offsets,
            file_major_version,
            file_minor_version,
        }
    }

    /// A data file holding `fields`, written with `version`.
    ///
    /// Column offsets are laid out one per field.
    pub fn new_with_version(
        path: impl Into<String>,
        fields: Vec<i32>,
        version: FileVersion,
    ) -> Self {
        let (major, minor) = version.to_numbers();
        let column_offsets = if version.resolve() == FileVersion::Legacy {
            vec![]
        } else {
            (0..fields.len() as u32).collect()
        };
        Self::new(path, fields, column_offsets, major, minor)
    }

    pub fn new_legacy(path: impl Into<String>, schema: &Schema) -> Self {
        Self::new(path, schema.field_ids(), vec![], 0, 0)
    }

    pub fn file_version(&self) -> Result<FileVersion> {
        FileVersion::try_from_major_minor(self.file_major_version, self.file_minor_version)
    }

}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionFileType {
    Array,
    Bitmap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFile {
    pub read_version: u64,
    pub id: u64,
    pub file_type: DeletionFileType,
    /// Number of deleted rows in this file. If None, this is unknown.
    pub num_deleted_rows: Option<usize>,
}

/// The half-open range of stable row ids owned by a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIdMeta {
    pub start: u64,
    pub end: u64,
}

impl RowIdMeta {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Data fragment.
///
/// A fragment is a set of files which represent the different columns of the same rows.
/// If column exists in the schema, but the related file does not exist, treat this column as `nulls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Fragment ID
    pub id: u64,

    /// Files within the fragment.
    pub files: Vec<DataFile>,

    /// Optional file with deleted row ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_file: Option<DeletionFile>,

    /// Stable row ids of this fragment, present when the dataset uses them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id_meta: Option<RowIdMeta>,

    /// Original number of rows in the fragment. If this is None, then it is
    /// unknown. This is only optional for legacy reasons. All new tables should
    /// have this set.
    pub physical_rows: Option<usize>,
}

impl Fragment {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            files: vec![],
            deletion_file: None,
            row_id_meta: None,
            physical_rows: None,
        }
    }

    pub fn num_rows(&self) -> Option<usize> {
        match (self.physical_rows, &self.deletion_file) {
            // Known fragment length, no deletion file.
            (Some(len), None) => Some(len),
            // Known fragment length, but don't know deletion file size.
            (
                Some(len),
                Some(DeletionFile {
                    num_deleted_rows: Some(num_deleted_rows),
                    ..
                }),
            ) => Some(len - num_deleted_rows),
            _ => None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let fragment: Self = serde_json::from_str(json)?;
        Ok(fragment)
    }

    /// Create a `Fragment` with one DataFile
    pub fn with_file_legacy(
        id: u64,
        path: &str,
        schema: &Schema,
        physical_rows: Option<usize>,
    ) -> Self {
        Self {
            id,
            files: vec![DataFile::new_legacy(path, schema)],
            deletion_file: None,
            row_id_meta: None,
            physical_rows,
        }
    }

    /// Create a `Fragment` with one data file covering every field of `schema`.
    pub fn with_file(
        id: u64,
        path: &str,
        schema: &Schema,
        version: FileVersion,
        physical_rows: usize,
    ) -> Self {
        Self {
            id,
            files: vec![DataFile::new_with_version(path, schema.field_ids(), version)],
            deletion_file: None,
            row_id_meta: None,
            physical_rows: Some(physical_rows),
        }
    }

    /// All field ids stored by the data files of this fragment.
    pub fn field_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.files.iter().flat_map(|f| f.fields.iter().copied())
    }

    /// The file version shared by every data file of `fragments`.
    ///
    /// Returns `None` if there are no data files.
    pub fn try_infer_version(fragments: &[Self]) -> Result<Option<FileVersion>> {
        let mut versions = fragments
            .iter()
            .flat_map(|f| f.files.iter())
            .map(|file| file.file_version());
        let Some(first) = versions.next().transpose()? else {
            return Ok(None);
        };
        for version in versions {
            let version = version?;
            if version != first {
                return Err(Error::invalid_input(
                    format!(
                        "All data files must have the same version, found {} and {}",
                        first, version
                    ),
                    location!(),
                ));
            }
        }
        Ok(Some(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use vellum_core::datatypes::Field;

    fn test_schema() -> Schema {
        Schema::new(vec![
            Field::new_struct(
                "s",
                vec![
                    Field::new("si", "int32", false),
                    Field::new("sb", "binary", true),
                ],
                true,
            ),
            Field::new("bool", "boolean", true),
        ])
    }

    #[test]
    fn test_new_fragment() {
        let path = "foobar.vellum";
        let fragment = Fragment::with_file_legacy(123, path, &test_schema(), Some(10));

        assert_eq!(123, fragment.id);
        assert_eq!(
            fragment.files,
            vec![DataFile::new(path, vec![0, 1, 2, 3], vec![], 0, 0)]
        )
    }

    #[test]
    fn test_num_rows() {
        let mut fragment =
            Fragment::with_file(0, "a.vellum", &test_schema(), FileVersion::V2_0, 10);
        assert_eq!(fragment.num_rows(), Some(10));

        fragment.deletion_file = Some(DeletionFile {
            read_version: 1,
            id: 1,
            file_type: DeletionFileType::Bitmap,
            num_deleted_rows: Some(3),
        });
        assert_eq!(fragment.num_rows(), Some(7));

        fragment.deletion_file.as_mut().unwrap().num_deleted_rows = None;
        assert_eq!(fragment.num_rows(), None);
    }

    #[test]
    fn test_to_json() {
        let mut fragment = Fragment::new(123);
        let schema = Schema::new(vec![Field::new("x", "float16", true)]);
        fragment
            .files
            .push(DataFile::new_legacy("foobar.vellum", &schema));
        fragment.deletion_file = Some(DeletionFile {
            read_version: 123,
            id: 456,
            file_type: DeletionFileType::Array,
            num_deleted_rows: Some(10),
        });

        let json = serde_json::to_string(&fragment).unwrap();

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 123,
                "files":[
                    {"path": "foobar.vellum", "fields": [0], "file_major_version": 0, "file_minor_version": 0}],
                     "deletion_file": {"read_version": 123, "id": 456, "file_type": "array",
                                       "num_deleted_rows": 10},
                "physical_rows": None::<usize>}),
        );

        let frag2 = Fragment::from_json(&json).unwrap();
        assert_eq!(fragment, frag2);
    }

    #[test]
    fn test_infer_version() {
        let schema = test_schema();
        assert_eq!(Fragment::try_infer_version(&[]).unwrap(), None);
        assert_eq!(
            Fragment::try_infer_version(&[Fragment::new(0)]).unwrap(),
            None
        );

        let v2 = Fragment::with_file(0, "a.vellum", &schema, FileVersion::V2_1, 10);
        let legacy = Fragment::with_file_legacy(1, "b.vellum", &schema, Some(10));
        assert_eq!(
            Fragment::try_infer_version(&[v2.clone(), v2.clone()]).unwrap(),
            Some(FileVersion::V2_1)
        );
        assert!(matches!(
            Fragment::try_infer_version(&[v2, legacy]),
            Err(Error::InvalidInput { .. })
        ));
    }
}
