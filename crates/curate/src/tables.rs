use aggregate::NeighborhoodYearAggregate;
use arrow::array::{
    Array, ArrayRef, Decimal128Array, Decimal128Builder, Float64Builder, Int32Builder, ListBuilder,
    RecordBatch, StringArray, StringBuilder, UInt32Builder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use metadata::{IoContext, WriteError};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use trend::{NeighborhoodTotals, Totals, TrendRecord};

// full Decimal128 width; totals outgrow the per-property DECIMAL(18,2)
const MONEY_PRECISION: u8 = 38;
const MONEY_SCALE: i8 = 2;

fn money() -> DataType {
    DataType::Decimal128(MONEY_PRECISION, MONEY_SCALE)
}

/// Finishes a money column, rejecting values past its declared precision.
fn finish_money(mut b: Decimal128Builder) -> Result<Decimal128Array, ArrowError> {
    let array = b.finish();
    array.validate_decimal_precision(MONEY_PRECISION)?;
    Ok(array)
}

fn histogram() -> DataType {
    DataType::List(Arc::new(Field::new("item", DataType::UInt64, true)))
}

fn money_builder(cap: usize) -> Result<Decimal128Builder, ArrowError> {
    Decimal128Builder::with_capacity(cap).with_precision_and_scale(MONEY_PRECISION, MONEY_SCALE)
}

pub fn aggregate_schema() -> Schema {
    use DataType::*;
    Schema::new(vec![
        Field::new("year", Int32, false),
        Field::new("neighborhood_code", Utf8, false),
        Field::new("property_type", Utf8, false),
        Field::new("age_bucket", Utf8, false),
        Field::new("property_count", UInt64, false),
        Field::new("entity_count", UInt64, false),
        Field::new("total_venal_value", money(), false),
        Field::new("valued_count", UInt64, false),
        Field::new("mean_venal_value", Float64, true),
        Field::new("min_venal_value", money(), true),
        Field::new("max_venal_value", money(), true),
        Field::new("mean_age", Float64, true),
        Field::new("total_built_area", Float64, false),
        Field::new("total_land_area", Float64, false),
        Field::new("age_distribution", histogram(), false),
        Field::new("value_distribution", histogram(), false),
    ])
}

pub fn trend_schema() -> Schema {
    use DataType::*;
    Schema::new(vec![
        Field::new("neighborhood_code", Utf8, false),
        Field::new("year", Int32, false),
        Field::new("property_count", UInt64, false),
        Field::new("total_venal_value", money(), false),
        Field::new("count_growth_pct", Float64, true),
        Field::new("value_growth_pct", Float64, true),
        Field::new("cumulative_count_growth_pct", Float64, true),
        Field::new("cumulative_value_growth_pct", Float64, true),
        Field::new("rank_count", UInt32, true),
        Field::new("rank_value", UInt32, true),
    ])
}

pub fn aggregate_batch(rows: &[NeighborhoodYearAggregate]) -> Result<RecordBatch, ArrowError> {
    let n = rows.len();
    let mut year = Int32Builder::with_capacity(n);
    let mut hood = StringBuilder::with_capacity(n, n * 12);
    let mut kind = StringBuilder::with_capacity(n, n * 12);
    let mut bucket = StringBuilder::with_capacity(n, n * 6);
    let mut count = UInt64Builder::with_capacity(n);
    let mut entities = UInt64Builder::with_capacity(n);
    let mut total = money_builder(n)?;
    let mut valued = UInt64Builder::with_capacity(n);
    let mut mean_value = Float64Builder::with_capacity(n);
    let mut min_value = money_builder(n)?;
    let mut max_value = money_builder(n)?;
    let mut mean_age = Float64Builder::with_capacity(n);
    let mut built = Float64Builder::with_capacity(n);
    let mut land = Float64Builder::with_capacity(n);
    let mut age_hist = ListBuilder::new(UInt64Builder::new());
    let mut value_hist = ListBuilder::new(UInt64Builder::new());

    for r in rows {
        year.append_value(r.year);
        hood.append_value(&r.neighborhood_code);
        kind.append_value(&r.property_type);
        bucket.append_value(r.age_bucket.to_string());
        count.append_value(r.property_count);
        entities.append_value(r.entity_count);
        total.append_value(r.total_venal_value_cents);
        valued.append_value(r.valued_count);
        mean_value.append_option(r.mean_venal_value);
        min_value.append_option(r.min_venal_value_cents);
        max_value.append_option(r.max_venal_value_cents);
        mean_age.append_option(r.mean_age);
        built.append_value(r.total_built_area);
        land.append_value(r.total_land_area);
        age_hist.values().append_slice(&r.age_distribution);
        age_hist.append(true);
        value_hist.values().append_slice(&r.value_distribution);
        value_hist.append(true);
    }

    let cols: Vec<ArrayRef> = vec![
        Arc::new(year.finish()),
        Arc::new(hood.finish()),
        Arc::new(kind.finish()),
        Arc::new(bucket.finish()),
        Arc::new(count.finish()),
        Arc::new(entities.finish()),
        Arc::new(finish_money(total)?),
        Arc::new(valued.finish()),
        Arc::new(mean_value.finish()),
        Arc::new(finish_money(min_value)?),
        Arc::new(finish_money(max_value)?),
        Arc::new(mean_age.finish()),
        Arc::new(built.finish()),
        Arc::new(land.finish()),
        Arc::new(age_hist.finish()),
        Arc::new(value_hist.finish()),
    ];
    RecordBatch::try_new(Arc::new(aggregate_schema()), cols)
}

pub fn trend_batch(rows: &[TrendRecord]) -> Result<RecordBatch, ArrowError> {
    let n = rows.len();
    let mut hood = StringBuilder::with_capacity(n, n * 12);
    let mut year = Int32Builder::with_capacity(n);
    let mut count = UInt64Builder::with_capacity(n);
    let mut total = money_builder(n)?;
    let mut count_growth = Float64Builder::with_capacity(n);
    let mut value_growth = Float64Builder::with_capacity(n);
    let mut cum_count = Float64Builder::with_capacity(n);
    let mut cum_value = Float64Builder::with_capacity(n);
    let mut rank_count = UInt32Builder::with_capacity(n);
    let mut rank_value = UInt32Builder::with_capacity(n);

    for r in rows {
        hood.append_value(&r.neighborhood_code);
        year.append_value(r.year);
        count.append_value(r.property_count);
        total.append_value(r.total_venal_value_cents);
        // undefined growth is stored as null
        count_growth.append_option(r.count_growth_pct.value());
        value_growth.append_option(r.value_growth_pct.value());
        cum_count.append_option(r.cumulative_count_growth_pct.value());
        cum_value.append_option(r.cumulative_value_growth_pct.value());
        rank_count.append_option(r.rank_by_count_growth);
        rank_value.append_option(r.rank_by_value_growth);
    }

    let cols: Vec<ArrayRef> = vec![
        Arc::new(hood.finish()),
        Arc::new(year.finish()),
        Arc::new(count.finish()),
        Arc::new(finish_money(total)?),
        Arc::new(count_growth.finish()),
        Arc::new(value_growth.finish()),
        Arc::new(cum_count.finish()),
        Arc::new(cum_value.finish()),
        Arc::new(rank_count.finish()),
        Arc::new(rank_value.finish()),
    ];
    RecordBatch::try_new(Arc::new(trend_schema()), cols)
}

/// Writes one batch as a ZSTD Parquet file and returns its row count.
pub fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<u64, WriteError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
        .set_dictionary_enabled(true)
        .build();
    let file = File::create(path).at(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    let file = writer.into_inner()?;
    file.sync_all().at(path)?;
    Ok(batch.num_rows() as u64)
}

/// Sums a materialized aggregate file back into neighborhood totals.
pub fn read_totals(year: i32, path: &Path) -> Result<NeighborhoodTotals, WriteError> {
    let file = File::open(path).at(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut by_neighborhood: BTreeMap<String, Totals> = BTreeMap::new();
    for batch in reader {
        let batch = batch?;
        let column = |name: &str| {
            batch.column_by_name(name).ok_or_else(|| {
                ArrowError::SchemaError(format!("{}: missing column {name}", path.display()))
            })
        };
        let hoods = column("neighborhood_code")?;
        let counts = column("property_count")?;
        let totals = column("total_venal_value")?;
        let (Some(hoods), Some(counts), Some(totals)) = (
            hoods.as_any().downcast_ref::<StringArray>(),
            counts.as_any().downcast_ref::<UInt64Array>(),
            totals.as_any().downcast_ref::<Decimal128Array>(),
        ) else {
            return Err(ArrowError::SchemaError(format!(
                "{}: unexpected aggregate column types",
                path.display()
            ))
            .into());
        };
        for row in 0..batch.num_rows() {
            let t = by_neighborhood
                .entry(hoods.value(row).to_string())
                .or_default();
            t.count += counts.value(row);
            t.total_value_cents = t
                .total_value_cents
                .checked_add(totals.value(row))
                .ok_or_else(|| {
                    ArrowError::ComputeError(format!(
                        "{}: neighborhood total overflows",
                        path.display()
                    ))
                })?;
        }
    }
    Ok(NeighborhoodTotals {
        year,
        by_neighborhood,
    })
}
