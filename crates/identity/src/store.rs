use crate::{IdentityLink, LinkRelation};
use arrow::array::{Array, ArrayRef, Int32Array, Int32Builder, RecordBatch, StringArray, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use metadata::{IdentityError, IoContext, WriteError};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::{create_dir_all, File};
use std::path::Path;
use std::sync::Arc;

fn links_schema() -> Schema {
    Schema::new(vec![
        Field::new("cadastral_id", DataType::Utf8, false),
        Field::new("year", DataType::Int32, false),
        Field::new("entity_id", DataType::Utf8, false),
        Field::new("relation", DataType::Utf8, false),
    ])
}

/// Loads the persisted link table. A missing file means a first run.
pub fn load_links(path: &Path) -> Result<Vec<IdentityLink>, IdentityError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let unreadable = |detail: String| IdentityError::LinkTable {
        path: path.to_path_buf(),
        detail,
    };
    let f = File::open(path).map_err(|e| unreadable(e.to_string()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(f)
        .and_then(|b| b.build())
        .map_err(|e| unreadable(e.to_string()))?;

    let mut links = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| unreadable(e.to_string()))?;
        let utf8 = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| unreadable(format!("column '{name}' missing or not Utf8")))
        };
        let ids = utf8("cadastral_id")?;
        let entities = utf8("entity_id")?;
        let relations = utf8("relation")?;
        let years = batch
            .column_by_name("year")
            .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
            .ok_or_else(|| unreadable("column 'year' missing or not Int32".into()))?;

        for row in 0..batch.num_rows() {
            if ids.is_null(row) || entities.is_null(row) || years.is_null(row) {
                return Err(unreadable(format!("null key at row {row}")));
            }
            let relation = LinkRelation::parse(relations.value(row))
                .ok_or_else(|| unreadable(format!("bad relation '{}'", relations.value(row))))?;
            links.push(IdentityLink {
                cadastral_id: ids.value(row).to_string(),
                year: years.value(row),
                entity_id: entities.value(row).to_string(),
                relation,
            });
        }
    }
    tracing::debug!(links = links.len(), path = %path.display(), "identity links loaded");
    Ok(links)
}

/// Replaces the link table atomically. `links` must already be in
/// `(cadastral_id, year)` order so the file is reproducible.
pub fn save_links<'a, I>(path: &Path, links: I) -> Result<(), WriteError>
where
    I: IntoIterator<Item = &'a IdentityLink>,
{
    if let Some(dir) = path.parent() {
        create_dir_all(dir).at(dir)?;
    }
    let mut ids = StringBuilder::new();
    let mut years = Int32Builder::new();
    let mut entities = StringBuilder::new();
    let mut relations = StringBuilder::new();
    for l in links {
        ids.append_value(&l.cadastral_id);
        years.append_value(l.year);
        entities.append_value(&l.entity_id);
        relations.append_value(l.relation.as_str());
    }
    let schema = Arc::new(links_schema());
    let cols: Vec<ArrayRef> = vec![
        Arc::new(ids.finish()),
        Arc::new(years.finish()),
        Arc::new(entities.finish()),
        Arc::new(relations.finish()),
    ];
    let batch = RecordBatch::try_new(schema.clone(), cols)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
        .set_dictionary_enabled(true)
        .build();
    let tmp = path.with_extension("parquet.tmp");
    let file = File::create(&tmp).at(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    std::fs::rename(&tmp, path).at(path)?;
    tracing::debug!(links = batch.num_rows(), path = %path.display(), "identity links saved");
    Ok(())
}
