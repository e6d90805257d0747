use std::path::PathBuf;
use thiserror::Error;

/// Malformed or incomplete configuration. Fatal for the year it belongs to.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("year {year}: mapping references unknown canonical field '{field}'")]
    UnknownCanonicalField { year: i32, field: String },

    #[error("year {year}: canonical field '{field}' is mapped more than once")]
    DuplicateField { year: i32, field: String },

    #[error("year {year}: mapping for '{field}' lists no source column")]
    NoSourceColumn { year: i32, field: String },

    #[error("year {year}: source column '{column}' (for '{field}') is absent from the extract header")]
    MissingSourceColumn {
        year: i32,
        field: String,
        column: String,
    },

    #[error("year {year}: unit_scale {scale} for '{field}' must be a finite, non-zero number")]
    InvalidScale { year: i32, field: String, scale: f64 },

    #[error("year {0} is configured more than once")]
    DuplicateYear(i32),

    #[error("year {0} is not configured")]
    UnknownYear(i32),

    #[error("{name} must be non-empty and strictly increasing")]
    InvalidEdges { name: &'static str },

    #[error("{0}")]
    Invalid(String),
}

/// Ambiguous or cyclic identity re-issue information. Fatal for the resolver step.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error(
        "cadastral id '{cadastral_id}' in {year} resolves to two canonical entities: '{first}' and '{second}'"
    )]
    Conflict {
        cadastral_id: String,
        year: i32,
        first: String,
        second: String,
    },

    #[error("re-issue mapping contains a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("identity link table {path} is unreadable: {detail}")]
    LinkTable { path: PathBuf, detail: String },
}

/// Money arithmetic past what `i128` cents can hold. Fatal for the year.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("year {year}: venal value total overflows in neighborhood '{neighborhood}'")]
    Overflow { year: i32, neighborhood: String },
}

/// Storage failure while persisting a year. Already-written years are untouched.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("manifest serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl WriteError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WriteError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attaches the offending path to raw `std::io` failures.
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, WriteError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, WriteError> {
        self.map_err(|e| WriteError::io(path, e))
    }
}
