//! Shared vocabulary of the IPTU history pipeline: the canonical property
//! record, the run configuration (per-year field mappings, buckets,
//! vocabularies) and the error kinds every stage reports.
pub mod config;
pub mod error;
pub mod record;
pub mod text;

pub use config::{
    BucketConfig, Encoding, FieldMapping, IdentityConfig, Layout, PipelineConfig, SourceFormat,
    ValidationRules, Vocabulary, YearSource, UNKNOWN_LABEL,
};
pub use error::{AggregateError, ConfigError, IdentityError, IoContext, WriteError};
pub use record::{
    cents_to_units, units_to_cents, CandidateRecord, CanonicalField, Cell, PropertyRecord,
    PropertyStatus, RawRow, RawSnapshot, ReissueEntry, MAX_VENAL_CENTS,
};

/// Writes `bytes` next to `path` and renames over it, so readers never see a
/// half-written file.
pub fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> Result<(), WriteError> {
    use std::io::Write;

    let tmp = path.with_extension("tmp");
    {
        let mut out = std::fs::File::create(&tmp).at(&tmp)?;
        out.write_all(bytes).at(&tmp)?;
        out.sync_all().at(&tmp)?;
    }
    std::fs::rename(&tmp, path).at(path)
}
