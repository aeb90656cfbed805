// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use snafu::{Location, Snafu};

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Allocates error on the heap and then places `e` into it.
#[inline]
pub fn box_error(e: impl std::error::Error + Send + Sync + 'static) -> BoxedError {
    Box::new(e)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid user input: {source}, {location}"))]
    InvalidInput {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Dataset already exists: {uri}, {location}"))]
    DatasetAlreadyExists { uri: String, location: Location },
    #[snafu(display("Dataset at path {path} was not found: {source}, {location}"))]
    DatasetNotFound {
        path: String,
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Encountered corrupt file {path}: {source}, {location}"))]
    CorruptFile {
        path: object_store::path::Path,
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Not supported: {source}, {location}"))]
    NotSupported {
        source: BoxedError,
        location: Location,
    },
    /// The read version of a transaction is newer than anything committed.
    #[snafu(display(
        "Invalid read version {read_version}: the latest version is {latest_version}, {location}"
    ))]
    InvalidReadVersion {
        read_version: u64,
        latest_version: u64,
        location: Location,
    },
    /// Every commit attempt lost the race for the next version.
    #[snafu(display("Retryable commit conflict for version {version}: {source}, {location}"))]
    RetryableCommitConflict {
        version: u64,
        source: BoxedError,
        location: Location,
    },
    /// A concurrent transaction made this transaction impossible to apply
    /// as written. The caller may rebuild it on top of the latest version.
    #[snafu(display(
        "Retryable commit conflict for version {version}: {source} (conflicting transaction {conflicting_transaction}), {location}"
    ))]
    IncompatibleOperation {
        version: u64,
        conflicting_transaction: String,
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Malformed operation: {message}, {location}"))]
    MalformedOperation { message: String, location: Location },
    #[snafu(display("Encountered internal error. {message}, {location}"))]
    Internal { message: String, location: Location },
    #[snafu(display("VellumError(Schema): {message}, {location}"))]
    Schema { message: String, location: Location },
    #[snafu(display("Not found: {uri}, {location}"))]
    NotFound { uri: String, location: Location },
    #[snafu(display("VellumError(IO): {source}, {location}"))]
    IO {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("VellumError(Namespace): {source}, {location}"))]
    Namespace {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Ref is invalid: {message}"))]
    InvalidRef { message: String },
    #[snafu(display("Ref conflict error: {message}"))]
    RefConflict { message: String },
    #[snafu(display("Ref not found error: {message}"))]
    RefNotFound { message: String },
    #[snafu(display("Cleanup error: {message}"))]
    Cleanup { message: String },
    #[snafu(display("Version not found error: {message}"))]
    VersionNotFound { message: String },
}

impl Error {
    pub fn corrupt_file(
        path: object_store::path::Path,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        let message: String = message.into();
        Self::CorruptFile {
            path,
            source: message.into(),
            location,
        }
    }

    pub fn invalid_input(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::InvalidInput {
            source: message.into(),
            location,
        }
    }

    pub fn io(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::IO {
            source: message.into(),
            location,
        }
    }

    pub fn not_supported(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::NotSupported {
            source: message.into(),
            location,
        }
    }

    pub fn internal(message: impl Into<String>, location: Location) -> Self {
        Self::Internal {
            message: message.into(),
            location,
        }
    }

    pub fn malformed_operation(message: impl Into<String>, location: Location) -> Self {
        Self::MalformedOperation {
            message: message.into(),
            location,
        }
    }

    pub fn dataset_not_found(
        path: impl Into<String>,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        let message: String = message.into();
        Self::DatasetNotFound {
            path: path.into(),
            source: message.into(),
            location,
        }
    }

    /// Whether retrying the same work against a newer version may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetryableCommitConflict { .. } | Self::IncompatibleOperation { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::IO {
            source: box_error(e),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<object_store::Error> for Error {
    #[track_caller]
    fn from(e: object_store::Error) -> Self {
        let location = std::panic::Location::caller().to_snafu_location();
        match e {
            object_store::Error::NotFound { path, .. } => Self::NotFound {
                uri: path,
                location,
            },
            e => Self::IO {
                source: box_error(e),
                location,
            },
        }
    }
}

impl From<object_store::path::Error> for Error {
    #[track_caller]
    fn from(e: object_store::path::Error) -> Self {
        Self::InvalidInput {
            source: box_error(e),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<url::ParseError> for Error {
    #[track_caller]
    fn from(e: url::ParseError) -> Self {
        Self::InvalidInput {
            source: box_error(e),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<serde_json::Error> for Error {
    #[track_caller]
    fn from(e: serde_json::Error) -> Self {
        use serde_json::error::Category;
        let location = std::panic::Location::caller().to_snafu_location();
        match e.classify() {
            Category::Io => Self::IO {
                source: box_error(e),
                location,
            },
            Category::Data | Category::Syntax | Category::Eof => Self::InvalidInput {
                source: box_error(e),
                location,
            },
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    #[track_caller]
    fn from(e: tokio::task::JoinError) -> Self {
        Self::IO {
            source: box_error(e),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

trait ToSnafuLocation {
    fn to_snafu_location(&'static self) -> snafu::Location;
}

impl ToSnafuLocation for std::panic::Location<'static> {
    fn to_snafu_location(&'static self) -> snafu::Location {
        snafu::Location::new(self.file(), self.line(), self.column())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snafu::location;

    #[test]
    fn test_caller_location_capture() {
        let io_error = std::io::Error::other("test");
        let err = Error::from(io_error);
        match err {
            Error::IO { location, .. } => assert_eq!(location.file, file!()),
            other => panic!("expected IO error, got {:?}", other),
        }
    }

    #[test]
    fn test_retryable_errors() {
        let conflict = Error::RetryableCommitConflict {
            version: 3,
            source: "lost the race".into(),
            location: location!(),
        };
        assert!(conflict.is_retryable());
        assert!(conflict.to_string().contains("Retryable commit conflict"));

        let incompatible = Error::IncompatibleOperation {
            version: 2,
            conflicting_transaction: "abc".to_string(),
            source: "Append is incompatible with Overwrite".into(),
            location: location!(),
        };
        assert!(incompatible.is_retryable());
        assert!(incompatible.to_string().contains("Retryable commit conflict"));
        assert!(incompatible.to_string().contains("abc"));

        let read_version = Error::InvalidReadVersion {
            read_version: 5,
            latest_version: 3,
            location: location!(),
        };
        assert!(!read_version.is_retryable());
        assert!(!Error::io("disk on fire", location!()).is_retryable());
        assert!(!Error::malformed_operation("no schema", location!()).is_retryable());
    }

    #[test]
    fn test_object_store_not_found() {
        let err: Error = object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        }
        .into();
        assert!(matches!(err, Error::NotFound { ref uri, .. } if uri == "a/b"));
    }
}
