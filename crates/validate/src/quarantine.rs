use crate::QuarantinedRecord;
use arrow::array::{ArrayRef, Int32Builder, Int64Builder, RecordBatch, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter as IpcWriter;
use metadata::{IoContext, WriteError};
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const QUARANTINE_FILE: &str = "part-000000.arrow";

const BATCH_SIZE: usize = 65_536;

pub fn quarantine_schema() -> Schema {
    use DataType::*;
    Schema::new(vec![
        Field::new("year", Int32, false),
        Field::new("cadastral_id", Utf8, true),
        Field::new("source_file", Utf8, false),
        Field::new("row_number", Int64, false),
        Field::new("quarantine_reason", Utf8, false),
        Field::new("detail", Utf8, false),
    ])
}

struct QuarantineBuilders {
    schema: Arc<Schema>,
    year: Int32Builder,
    cadastral_id: StringBuilder,
    source_file: StringBuilder,
    row_number: Int64Builder,
    reason: StringBuilder,
    detail: StringBuilder,
}

impl QuarantineBuilders {
    fn new(schema: Arc<Schema>, cap: usize) -> Self {
        Self {
            schema,
            year: Int32Builder::with_capacity(cap),
            cadastral_id: StringBuilder::with_capacity(cap, cap * 12),
            source_file: StringBuilder::with_capacity(cap, cap * 32),
            row_number: Int64Builder::with_capacity(cap),
            reason: StringBuilder::with_capacity(cap, cap * 16),
            detail: StringBuilder::with_capacity(cap, cap * 16),
        }
    }

    fn push(&mut self, q: &QuarantinedRecord) {
        self.year.append_value(q.year);
        self.cadastral_id.append_option(q.cadastral_id.as_deref());
        self.source_file.append_value(&q.source_file);
        self.row_number.append_value(q.row_number as i64);
        self.reason.append_value(q.reason.as_str());
        self.detail.append_value(&q.detail);
    }

    fn finish_batch(&mut self) -> Result<RecordBatch, WriteError> {
        let cols: Vec<ArrayRef> = vec![
            Arc::new(self.year.finish()),
            Arc::new(self.cadastral_id.finish()),
            Arc::new(self.source_file.finish()),
            Arc::new(self.row_number.finish()),
            Arc::new(self.reason.finish()),
            Arc::new(self.detail.finish()),
        ];
        Ok(RecordBatch::try_new(self.schema.clone(), cols)?)
    }
}

/// Replaces the year's quarantine side table. An empty file is still
/// written so a clean rerun clears rejects left by an earlier one.
pub fn write_quarantine(
    records: &[QuarantinedRecord],
    out_dir: &Path,
) -> Result<PathBuf, WriteError> {
    create_dir_all(out_dir).at(out_dir)?;
    let out_path = out_dir.join(QUARANTINE_FILE);
    let tmp_path = out_dir.join(format!("{QUARANTINE_FILE}.tmp"));

    let schema = Arc::new(quarantine_schema());
    let file = File::create(&tmp_path).at(&tmp_path)?;
    let mut writer = IpcWriter::try_new(file, &schema)?;
    for chunk in records.chunks(BATCH_SIZE) {
        let mut b = QuarantineBuilders::new(schema.clone(), chunk.len());
        for q in chunk {
            b.push(q);
        }
        writer.write(&b.finish_batch()?)?;
    }
    writer.finish()?;
    std::fs::rename(&tmp_path, &out_path).at(&out_path)?;

    tracing::debug!(rows = records.len(), out = %out_path.display(), "quarantine written");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuarantineReason;
    use arrow::array::{Array, StringArray};
    use arrow::ipc::reader::FileReader;

    #[test]
    fn writes_readable_side_table() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            QuarantinedRecord {
                year: 2021,
                cadastral_id: Some("9".into()),
                source_file: "iptu_2021.csv".into(),
                row_number: 4,
                reason: QuarantineReason::NegativeValue,
                detail: "venal_value -100 cents".into(),
            },
            QuarantinedRecord {
                year: 2021,
                cadastral_id: None,
                source_file: "iptu_2021.csv".into(),
                row_number: 5,
                reason: QuarantineReason::MissingCadastralId,
                detail: String::new(),
            },
        ];
        let path = write_quarantine(&rows, dir.path()).unwrap();
        assert!(!dir.path().join("part-000000.arrow.tmp").exists());

        let reader = FileReader::try_new(File::open(&path).unwrap(), None).unwrap();
        let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        let reasons = batches[0]
            .column(4)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(reasons.value(0), "negative_value");
        assert!(batches[0].column(1).is_null(1));

        // rerun with no rejects leaves an empty table behind
        write_quarantine(&[], dir.path()).unwrap();
        let reader = FileReader::try_new(File::open(&path).unwrap(), None).unwrap();
        assert_eq!(reader.map(|b| b.unwrap().num_rows()).sum::<usize>(), 0);
    }
}
