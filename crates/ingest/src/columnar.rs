use crate::{clean_cell, ROW_NUMBER_COLUMN, SOURCE_FILE_COLUMN};
use anyhow::{anyhow, Context, Result};
use arrow::array::{Array, Int64Array, RecordBatch, StringArray};
use arrow::ipc::reader::FileReader as IpcReader;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use metadata::{RawRow, RawSnapshot, SourceFormat};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::Path;

/// Arrow IPC / Parquet extracts: every cell is rendered to text so the
/// normalizer treats all formats alike. Bronze lineage columns, when
/// present, are lifted back into the snapshot instead of showing up as data.
pub(crate) fn read_columnar(year: i32, path: &Path, format: &SourceFormat) -> Result<RawSnapshot> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let batches: Vec<RecordBatch> = match format {
        SourceFormat::ArrowIpc => IpcReader::try_new(f, None)?.collect::<Result<_, _>>()?,
        SourceFormat::Parquet => ParquetRecordBatchReaderBuilder::try_new(f)?
            .build()?
            .collect::<Result<_, _>>()?,
        other => return Err(anyhow!("not a columnar format: {other:?}")),
    };

    let mut snapshot = RawSnapshot {
        year,
        source_file: path.display().to_string(),
        ..Default::default()
    };
    let Some(first) = batches.first() else {
        return Ok(snapshot);
    };
    let schema = first.schema();
    let source_idx = schema.index_of(SOURCE_FILE_COLUMN).ok();
    let rownum_idx = schema.index_of(ROW_NUMBER_COLUMN).ok();
    let data_idx: Vec<usize> = (0..schema.fields().len())
        .filter(|i| Some(*i) != source_idx && Some(*i) != rownum_idx)
        .collect();
    snapshot.headers = data_idx
        .iter()
        .map(|&i| schema.field(i).name().clone())
        .collect();

    let options = FormatOptions::default();
    let mut row_number: u64 = 0;
    for batch in &batches {
        let formatters = data_idx
            .iter()
            .map(|&i| ArrayFormatter::try_new(batch.column(i).as_ref(), &options))
            .collect::<Result<Vec<_>, _>>()?;
        let lineage_rows = rownum_idx
            .and_then(|i| batch.column(i).as_any().downcast_ref::<Int64Array>());

        if let Some(src) = source_idx
            .and_then(|i| batch.column(i).as_any().downcast_ref::<StringArray>())
            .filter(|a| !a.is_empty() && !a.is_null(0))
        {
            snapshot.source_file = src.value(0).to_string();
        }

        for row in 0..batch.num_rows() {
            row_number += 1;
            let values = data_idx
                .iter()
                .zip(&formatters)
                .map(|(&i, fmt)| {
                    if batch.column(i).is_null(row) {
                        None
                    } else {
                        clean_cell(fmt.value(row).to_string())
                    }
                })
                .collect();
            let reference = match lineage_rows {
                Some(a) if !a.is_null(row) => a.value(row) as u64,
                _ => row_number,
            };
            snapshot.rows.push(RawRow {
                row_number: reference,
                values,
            });
        }
    }
    Ok(snapshot)
}
