use anyhow::{anyhow, Context, Result};
use arrow::array::{ArrayRef, Int64Builder, RecordBatch, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter;
use csv_async::{AsyncReaderBuilder, ByteRecord};
use futures::StreamExt;
use metadata::{Encoding, RawRow, RawSnapshot, SourceFormat};
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;

mod columnar;
mod json;
mod reissue;

pub use reissue::read_reissue_table;

/// Lineage columns appended to every Bronze file.
pub const SOURCE_FILE_COLUMN: &str = "source_file";
pub const ROW_NUMBER_COLUMN: &str = "row_number";

#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub rows_in: u64,
    pub bytes_in: u64,
    pub parts_written: u32,
    pub out_path: PathBuf,
}

const BATCH_SIZE: usize = 65_536;

/// Loads one year's extract into memory, whatever its format.
pub async fn read_snapshot(year: i32, source: &Path, format: &SourceFormat) -> Result<RawSnapshot> {
    if !source.exists() {
        return Err(anyhow!("source file not found: {}", source.display()));
    }
    let snapshot = match format {
        SourceFormat::Csv {
            delimiter,
            encoding,
        } => read_csv(year, source, delimiter, *encoding).await?,
        SourceFormat::Json => json::read_json(year, source).await?,
        SourceFormat::ArrowIpc | SourceFormat::Parquet => {
            let path = source.to_path_buf();
            let format = format.clone();
            tokio::task::spawn_blocking(move || columnar::read_columnar(year, &path, &format))
                .await
                .context("columnar reader task panicked")??
        }
    };
    tracing::info!(
        year,
        rows = snapshot.rows.len(),
        columns = snapshot.headers.len(),
        source = %source.display(),
        "extract loaded"
    );
    Ok(snapshot)
}

/// Only the header row, for checking a mapping without loading the year.
pub async fn read_header(source: &Path, format: &SourceFormat) -> Result<Vec<String>> {
    match format {
        SourceFormat::Csv {
            delimiter,
            encoding,
        } => {
            let f = tokio::fs::File::open(source)
                .await
                .with_context(|| format!("open {}", source.display()))?;
            let mut rdr = csv_reader(f, delimiter);
            let headers = rdr.byte_headers().await?.clone();
            Ok(Decoder::new(*encoding).headers(&headers))
        }
        _ => Ok(read_snapshot(0, source, format).await?.headers),
    }
}

fn csv_reader(
    f: tokio::fs::File,
    delimiter: &str,
) -> csv_async::AsyncReader<BufReader<tokio::fs::File>> {
    let delim = match delimiter {
        "\\t" | "tab" => b'\t',
        d => d.as_bytes().first().copied().unwrap_or(b','),
    };
    AsyncReaderBuilder::new()
        .has_headers(true)
        .delimiter(delim)
        .flexible(true)
        .create_reader(BufReader::new(f))
}

async fn read_csv(
    year: i32,
    source: &Path,
    delimiter: &str,
    encoding: Encoding,
) -> Result<RawSnapshot> {
    let f = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("open {}", source.display()))?;
    let mut rdr = csv_reader(f, delimiter);

    let header_rec = rdr.byte_headers().await?.clone();
    if header_rec.is_empty() {
        return Err(anyhow!("empty CSV header in {}", source.display()));
    }
    let mut decoder = Decoder::new(encoding);
    let headers = decoder.headers(&header_rec);
    let width = headers.len();

    let mut rows = Vec::new();
    let mut records = rdr.byte_records();
    let mut row_number: u64 = 0;
    while let Some(rec_res) = records.next().await {
        let rec = rec_res.with_context(|| format!("read {}", source.display()))?;
        row_number += 1;
        let values = (0..width)
            .map(|i| rec.get(i).and_then(|bytes| clean_cell(decoder.decode(bytes))))
            .collect();
        rows.push(RawRow { row_number, values });
    }
    if decoder.errors() > 0 {
        tracing::warn!(
            year,
            decode_errors = decoder.errors(),
            encoding = ?encoding,
            source = %source.display(),
            "fields with undecodable bytes (replaced with U+FFFD)"
        );
    }

    Ok(RawSnapshot {
        year,
        source_file: source.display().to_string(),
        headers,
        rows,
    })
}

/// Byte-to-text decoding for CSV extracts. Counts the fields that needed
/// replacement characters.
pub(crate) struct Decoder {
    encoding: &'static encoding_rs::Encoding,
    errors: u64,
}

impl Decoder {
    pub(crate) fn new(encoding: Encoding) -> Self {
        // extracts labelled Latin-1 are Windows-1252 in practice (WHATWG maps
        // the "latin1" label there too)
        let encoding = match encoding {
            Encoding::Utf8 => encoding_rs::UTF_8,
            Encoding::Latin1 => encoding_rs::WINDOWS_1252,
        };
        Self {
            encoding,
            errors: 0,
        }
    }

    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        let (text, had_errors) = self.encoding.decode_without_bom_handling(bytes);
        if had_errors {
            self.errors += 1;
        }
        text.into_owned()
    }

    fn headers(&mut self, rec: &ByteRecord) -> Vec<String> {
        rec.iter()
            .map(|h| self.decode(h).trim_start_matches('\u{feff}').trim().to_string())
            .collect()
    }

    pub(crate) fn errors(&self) -> u64 {
        self.errors
    }
}

/// Trimmed cell, `None` when blank.
pub(crate) fn clean_cell(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else if t.len() == s.len() {
        Some(s)
    } else {
        Some(t.to_string())
    }
}

/// Writes the raw snapshot as all-Utf8 Arrow IPC plus lineage, replacing any
/// previous Bronze file for the year.
pub fn stage_bronze(snapshot: &RawSnapshot, out_dir: &Path) -> Result<IngestStats> {
    create_dir_all(out_dir).with_context(|| format!("mkdir -p {}", out_dir.display()))?;
    let out_path = out_dir.join("part-000000.arrow");
    let tmp_path = out_dir.join("part-000000.arrow.tmp");

    let mut fields: Vec<Field> = snapshot
        .headers
        .iter()
        .map(|name| Field::new(name.as_str(), DataType::Utf8, true))
        .collect();
    fields.push(Field::new(SOURCE_FILE_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(ROW_NUMBER_COLUMN, DataType::Int64, false));
    let schema = Arc::new(Schema::new(fields));

    let out_file =
        File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    let mut writer = FileWriter::try_new(out_file, &schema)?;

    let mut bytes_in: u64 = 0;
    for chunk in snapshot.rows.chunks(BATCH_SIZE) {
        let mut col_builders: Vec<StringBuilder> = (0..snapshot.headers.len())
            .map(|_| StringBuilder::with_capacity(chunk.len(), chunk.len() * 8))
            .collect();
        let mut source_file_builder = StringBuilder::with_capacity(chunk.len(), chunk.len() * 32);
        let mut rownum_builder = Int64Builder::with_capacity(chunk.len());

        for row in chunk {
            for (i, bldr) in col_builders.iter_mut().enumerate() {
                match row.values.get(i).and_then(Option::as_deref) {
                    Some(v) => {
                        bytes_in += v.len() as u64;
                        bldr.append_value(v);
                    }
                    None => bldr.append_null(),
                }
            }
            source_file_builder.append_value(&snapshot.source_file);
            rownum_builder.append_value(row.row_number as i64);
        }

        let mut cols: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for b in col_builders.iter_mut() {
            cols.push(Arc::new(b.finish()) as ArrayRef);
        }
        cols.push(Arc::new(source_file_builder.finish()) as ArrayRef);
        cols.push(Arc::new(rownum_builder.finish()) as ArrayRef);
        writer.write(&RecordBatch::try_new(schema.clone(), cols)?)?;
    }
    writer.finish()?;
    std::fs::rename(&tmp_path, &out_path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), out_path.display()))?;

    tracing::debug!(year = snapshot.year, out = %out_path.display(), "bronze staged");
    Ok(IngestStats {
        rows_in: snapshot.rows.len() as u64,
        bytes_in,
        parts_written: 1,
        out_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.join(name);
        let mut f = File::create(&p).unwrap();
        f.write_all(bytes).unwrap();
        p
    }

    #[tokio::test]
    async fn reads_semicolon_csv_with_blanks_and_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(
            dir.path(),
            "iptu_2020.csv",
            "\u{feff}Número do Contribuinte;Bairro;Valor\n1; Boa Vista ;100\n2;;\n3;Derby\n"
                .as_bytes(),
        );
        let fmt = SourceFormat::Csv {
            delimiter: ";".into(),
            encoding: Encoding::Utf8,
        };
        let snap = read_snapshot(2020, &p, &fmt).await.unwrap();
        assert_eq!(snap.headers, vec!["Número do Contribuinte", "Bairro", "Valor"]);
        assert_eq!(snap.rows.len(), 3);
        assert_eq!(snap.rows[0].values[1].as_deref(), Some("Boa Vista"));
        assert_eq!(snap.rows[1].values[1], None);
        assert_eq!(snap.rows[2].values[2], None);
        assert_eq!(snap.rows[2].row_number, 3);
    }

    #[tokio::test]
    async fn latin1_extracts_decode() {
        let dir = tempfile::tempdir().unwrap();
        // "Bairro\nSão José\n" in ISO-8859-1
        let p = write_file(
            dir.path(),
            "latin.csv",
            b"Bairro\nS\xe3o Jos\xe9\n",
        );
        let fmt = SourceFormat::Csv {
            delimiter: ",".into(),
            encoding: Encoding::Latin1,
        };
        let snap = read_snapshot(2021, &p, &fmt).await.unwrap();
        assert_eq!(snap.rows[0].values[0].as_deref(), Some("São José"));
    }

    #[tokio::test]
    async fn latin1_label_reads_windows_1252_punctuation() {
        let dir = tempfile::tempdir().unwrap();
        // 0x96 and 0x93/0x94 are the en dash and curly quotes in cp1252
        let p = write_file(dir.path(), "cp1252.csv", b"Bairro\nIpsep \x96 \x93Sul\x94\n");
        let fmt = SourceFormat::Csv {
            delimiter: ",".into(),
            encoding: Encoding::Latin1,
        };
        let snap = read_snapshot(2021, &p, &fmt).await.unwrap();
        assert_eq!(snap.rows[0].values[0].as_deref(), Some("Ipsep \u{2013} \u{201c}Sul\u{201d}"));
        assert_eq!(
            encoding_rs::Encoding::for_label(b"latin1"),
            Some(encoding_rs::WINDOWS_1252)
        );
    }

    #[test]
    fn invalid_utf8_is_counted() {
        let mut d = Decoder::new(Encoding::Utf8);
        assert_eq!(d.decode(b"Boa Vista"), "Boa Vista");
        assert_eq!(d.errors(), 0);
        assert_eq!(d.decode(b"S\xe3o"), "S\u{fffd}o");
        assert_eq!(d.errors(), 1);
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let fmt = SourceFormat::Json;
        let err = read_snapshot(2020, Path::new("/nonexistent/iptu.json"), &fmt)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("source file not found"));
    }

    #[tokio::test]
    async fn bronze_round_trips_through_arrow_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let snap = RawSnapshot {
            year: 2022,
            source_file: "iptu_2022.csv".into(),
            headers: vec!["id".into(), "bairro".into()],
            rows: vec![
                RawRow {
                    row_number: 1,
                    values: vec![Some("10".into()), Some("DERBY".into())],
                },
                RawRow {
                    row_number: 2,
                    values: vec![Some("11".into()), None],
                },
            ],
        };
        let stats = stage_bronze(&snap, dir.path()).unwrap();
        assert_eq!(stats.rows_in, 2);

        let back = read_snapshot(2022, &stats.out_path, &SourceFormat::ArrowIpc)
            .await
            .unwrap();
        assert_eq!(back.headers, snap.headers);
        assert_eq!(back.rows, snap.rows);
        assert_eq!(back.source_file, "iptu_2022.csv");
    }
}
