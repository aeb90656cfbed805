// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Temporary directories for tests and scratch space.
//!
//! These wrap the `tempfile` crate and expose the directory as an object
//! store path, std path, or string, which saves boilerplate when opening
//! datasets on the local file system. Windows separators are replaced with
//! `/` so that the string form is safe to use as a URI.

use object_store::path::Path as ObjPath;
use std::{ops::Deref, path::Path as StdPath};

use crate::Result;

/// A temporary directory
///
/// It is removed when the object is dropped.
#[derive(Debug)]
pub struct TempDir {
    tempdir: tempfile::TempDir,
}

impl TempDir {
    /// Create a temporary directory, exposing any potential errors.
    ///
    /// Tests should use the [`Default`] implementation instead.
    pub fn try_new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        Ok(Self { tempdir })
    }

    /// Get the path as a string
    ///
    /// This path will be safe to use as a URI on Windows
    pub fn path_str(&self) -> String {
        let path = self.tempdir.path().to_string_lossy();
        if cfg!(windows) {
            path.replace('\\', "/")
        } else {
            path.into_owned()
        }
    }

    /// Get the path as a standard library path
    pub fn std_path(&self) -> &StdPath {
        self.tempdir.path()
    }

    /// Get the path as an object store path
    pub fn obj_path(&self) -> Result<ObjPath> {
        Ok(ObjPath::parse(self.path_str())?)
    }
}

impl Default for TempDir {
    fn default() -> Self {
        Self::try_new().expect("failed to create a temporary directory")
    }
}

/// A temporary directory that is exposed as a string
pub struct TempStrDir {
    _tempdir: TempDir,
    string: String,
}

impl std::fmt::Display for TempStrDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.string.fmt(f)
    }
}

impl Default for TempStrDir {
    fn default() -> Self {
        let tempdir = TempDir::default();
        let string = tempdir.path_str();
        Self {
            _tempdir: tempdir,
            string,
        }
    }
}

impl Deref for TempStrDir {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.string
    }
}

impl AsRef<str> for TempStrDir {
    fn as_ref(&self) -> &str {
        self.string.as_ref()
    }
}

/// A temporary directory that is exposed as a standard library path
#[derive(Default)]
pub struct TempStdDir {
    tempdir: TempDir,
}

impl AsRef<StdPath> for TempStdDir {
    fn as_ref(&self) -> &StdPath {
        self.tempdir.std_path()
    }
}

impl Deref for TempStdDir {
    type Target = StdPath;

    fn deref(&self) -> &Self::Target {
        self.tempdir.std_path()
    }
}
