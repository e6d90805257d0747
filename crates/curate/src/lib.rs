use aggregate::YearAggregate;
use metadata::{write_atomic, IoContext, Layout, WriteError};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, remove_dir_all};
use std::path::{Path, PathBuf};
use trend::{NeighborhoodTotals, TrendRecord};

mod tables;

pub use tables::{aggregate_schema, trend_schema};

pub const AGGREGATE_FILE: &str = "neighborhood_year_aggregate.parquet";
pub const TREND_FILE: &str = "trend.parquet";
pub const COMMIT_FILE: &str = "commit.json";
pub const YEARS_MANIFEST: &str = "years.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFile {
    pub path: String,
    pub rows: u64,
    pub blake3: String,
}

/// Content of a partition's `commit.json`. No timestamps, so an unchanged
/// rerun writes the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub dataset: String,
    pub year: i32,
    pub property_count: u64,
    pub quarantined: u64,
    pub files: Vec<CommitFile>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YearCounts {
    pub valid: u64,
    pub quarantined: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct YearEntry {
    year: i32,
    path: String,
    property_count: u64,
    aggregate_rows: u64,
    trend_rows: u64,
}

/// `years.json`: an index of the partitions, rebuilt from their commits.
#[derive(Debug, Default, Serialize, Deserialize)]
struct YearsManifest {
    dataset: String,
    years: Vec<YearEntry>,
}

/// Writes year partitions under `<root>/gold/<dataset>/year=<Y>/`.
///
/// A partition is built in a staging directory and swapped in with renames;
/// readers see either the previous partition or the new one. A partition
/// counts as materialized once its `commit.json` is in place.
#[derive(Debug, Clone)]
pub struct Materializer {
    layout: Layout,
}

impl Materializer {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn write_year(
        &self,
        agg: &YearAggregate,
        trends: &[TrendRecord],
        counts: YearCounts,
    ) -> Result<CommitInfo, WriteError> {
        let year = agg.year;
        let staging = self.fresh_staging(year)?;

        let agg_rows =
            tables::write_parquet(&staging.join(AGGREGATE_FILE), &tables::aggregate_batch(&agg.rows)?)?;
        let trend_file = write_trend(&staging, trends)?;
        let trend_rows = trend_file.rows;
        let commit = CommitInfo {
            dataset: self.layout.dataset.clone(),
            year,
            property_count: agg.property_count(),
            quarantined: counts.quarantined,
            files: vec![commit_entry(&staging, AGGREGATE_FILE, agg_rows)?, trend_file],
        };
        let final_dir = self.publish(year, &staging, &commit)?;

        tracing::info!(
            year,
            aggregate_rows = agg_rows,
            trend_rows,
            valid = counts.valid,
            quarantined = counts.quarantined,
            dir = %final_dir.display(),
            "year materialized"
        );
        Ok(commit)
    }

    /// Replaces the trend file of a materialized year and keeps its aggregate
    /// as is. `None` when the year has no partition.
    pub fn rewrite_trend(
        &self,
        year: i32,
        trends: &[TrendRecord],
    ) -> Result<Option<CommitInfo>, WriteError> {
        let Some(previous) = self.read_commit(year)? else {
            return Ok(None);
        };
        let staging = self.fresh_staging(year)?;

        let from = self.layout.gold_dir(year).join(AGGREGATE_FILE);
        std::fs::copy(&from, staging.join(AGGREGATE_FILE)).at(&from)?;
        let agg_rows = previous
            .files
            .iter()
            .find(|f| f.path == AGGREGATE_FILE)
            .map_or(0, |f| f.rows);
        let trend_file = write_trend(&staging, trends)?;
        let trend_rows = trend_file.rows;
        let commit = CommitInfo {
            files: vec![commit_entry(&staging, AGGREGATE_FILE, agg_rows)?, trend_file],
            ..previous
        };
        self.publish(year, &staging, &commit)?;

        tracing::info!(year, trend_rows, "trend refreshed");
        Ok(Some(commit))
    }

    /// Years with a committed partition on disk, ascending.
    pub fn materialized_years(&self) -> Result<Vec<i32>, WriteError> {
        let root = self.layout.gold_root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut years = Vec::new();
        for entry in std::fs::read_dir(&root).at(&root)? {
            let entry = entry.at(&root)?;
            let name = entry.file_name();
            let Some(year) = name
                .to_str()
                .and_then(|n| n.strip_prefix("year="))
                .and_then(|y| y.parse::<i32>().ok())
            else {
                continue;
            };
            if entry.path().join(COMMIT_FILE).is_file() {
                years.push(year);
            }
        }
        years.sort_unstable();
        Ok(years)
    }

    /// Rewrites `years.json` from the committed partitions and returns the
    /// years it lists.
    pub fn refresh_manifest(&self) -> Result<Vec<i32>, WriteError> {
        let mut manifest = YearsManifest {
            dataset: self.layout.dataset.clone(),
            years: Vec::new(),
        };
        for year in self.materialized_years()? {
            let Some(commit) = self.read_commit(year)? else {
                continue;
            };
            let rows = |name: &str| {
                commit
                    .files
                    .iter()
                    .find(|f| f.path == name)
                    .map_or(0, |f| f.rows)
            };
            manifest.years.push(YearEntry {
                year,
                path: format!("year={year}"),
                property_count: commit.property_count,
                aggregate_rows: rows(AGGREGATE_FILE),
                trend_rows: rows(TREND_FILE),
            });
        }

        let dir = self.layout.manifests_dir();
        create_dir_all(&dir).at(&dir)?;
        write_atomic(
            &dir.join(YEARS_MANIFEST),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;
        Ok(manifest.years.iter().map(|y| y.year).collect())
    }

    /// Neighborhood totals of a materialized year, `None` when the year has
    /// no partition on disk.
    pub fn read_neighborhood_totals(
        &self,
        year: i32,
    ) -> Result<Option<NeighborhoodTotals>, WriteError> {
        let path = self.layout.gold_dir(year).join(AGGREGATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        tables::read_totals(year, &path).map(Some)
    }

    pub fn read_commit(&self, year: i32) -> Result<Option<CommitInfo>, WriteError> {
        let path = self.layout.gold_dir(year).join(COMMIT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).at(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn fresh_staging(&self, year: i32) -> Result<PathBuf, WriteError> {
        let staging = self.layout.gold_root().join(format!(".staging-year={year}"));
        clear_dir(&staging)?;
        create_dir_all(&staging).at(&staging)?;
        Ok(staging)
    }

    /// Writes the commit into `staging` and swaps it in for the live partition.
    fn publish(&self, year: i32, staging: &Path, commit: &CommitInfo) -> Result<PathBuf, WriteError> {
        write_atomic(
            &staging.join(COMMIT_FILE),
            serde_json::to_string_pretty(commit)?.as_bytes(),
        )?;

        let final_dir = self.layout.gold_dir(year);
        let old = self.layout.gold_root().join(format!(".old-year={year}"));
        clear_dir(&old)?;
        if final_dir.exists() {
            std::fs::rename(&final_dir, &old).at(&final_dir)?;
        }
        std::fs::rename(staging, &final_dir).at(&final_dir)?;
        clear_dir(&old)?;
        Ok(final_dir)
    }
}

fn write_trend(dir: &Path, trends: &[TrendRecord]) -> Result<CommitFile, WriteError> {
    let rows = tables::write_parquet(&dir.join(TREND_FILE), &tables::trend_batch(trends)?)?;
    commit_entry(dir, TREND_FILE, rows)
}

fn commit_entry(dir: &Path, name: &str, rows: u64) -> Result<CommitFile, WriteError> {
    let path = dir.join(name);
    let bytes = std::fs::read(&path).at(&path)?;
    Ok(CommitFile {
        path: name.to_string(),
        rows,
        blake3: blake3::hash(&bytes).to_hex().to_string(),
    })
}

fn clear_dir(dir: &Path) -> Result<(), WriteError> {
    if dir.exists() {
        remove_dir_all(dir).at(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregate::{AgeBucket, NeighborhoodYearAggregate};
    use trend::Growth;

    fn agg(year: i32, count: u64, cents: i128) -> YearAggregate {
        YearAggregate {
            year,
            rows: vec![NeighborhoodYearAggregate {
                year,
                neighborhood_code: "BOA VISTA".into(),
                property_type: "residential".into(),
                age_bucket: AgeBucket::Range { lo: 0, hi: 10 },
                property_count: count,
                entity_count: count,
                total_venal_value_cents: cents,
                valued_count: count,
                mean_venal_value: Some(cents as f64 / 100.0 / count as f64),
                min_venal_value_cents: Some(100),
                max_venal_value_cents: Some(cents),
                mean_age: None,
                total_built_area: 0.0,
                total_land_area: 0.0,
                age_distribution: vec![0, 0, 0],
                value_distribution: vec![count, 0],
            }],
        }
    }

    fn trend_row(year: i32) -> TrendRecord {
        TrendRecord {
            neighborhood_code: "BOA VISTA".into(),
            year,
            property_count: 100,
            total_venal_value_cents: 100_000_000,
            count_growth_pct: Growth::Undefined,
            value_growth_pct: Growth::Undefined,
            cumulative_count_growth_pct: Growth::Undefined,
            cumulative_value_growth_pct: Growth::Undefined,
            rank_by_count_growth: None,
            rank_by_value_growth: None,
        }
    }

    #[test]
    fn rewrite_replaces_partition_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(Layout::new(dir.path(), "iptu"));
        let counts = YearCounts {
            valid: 100,
            quarantined: 2,
        };

        let first = m.write_year(&agg(2021, 100, 100_000_000), &[trend_row(2021)], counts).unwrap();
        let bytes = std::fs::read(m.layout().gold_dir(2021).join(AGGREGATE_FILE)).unwrap();
        let again = m.write_year(&agg(2021, 100, 100_000_000), &[trend_row(2021)], counts).unwrap();
        assert_eq!(first, again);
        assert_eq!(
            bytes,
            std::fs::read(m.layout().gold_dir(2021).join(AGGREGATE_FILE)).unwrap()
        );

        m.write_year(&agg(2021, 90, 5_000), &[], counts).unwrap();
        let totals = m.read_neighborhood_totals(2021).unwrap().unwrap();
        assert_eq!(totals.by_neighborhood["BOA VISTA"].count, 90);
        assert_eq!(totals.by_neighborhood["BOA VISTA"].total_value_cents, 5_000);
        assert_eq!(m.read_commit(2021).unwrap().unwrap().files[1].rows, 0);

        let leftovers: Vec<_> = std::fs::read_dir(m.layout().gold_root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["year=2021"]);
        assert!(m.read_neighborhood_totals(2019).unwrap().is_none());
    }

    #[test]
    fn years_come_from_committed_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(Layout::new(dir.path(), "iptu"));
        assert!(m.materialized_years().unwrap().is_empty());
        for y in [2022, 2020, 2021, 2022] {
            m.write_year(&agg(y, 1, 100), &[trend_row(y)], YearCounts::default())
                .unwrap();
        }
        // leftovers of an interrupted write are not partitions
        std::fs::create_dir_all(m.layout().gold_root().join(".staging-year=2023")).unwrap();
        std::fs::create_dir_all(m.layout().gold_dir(2024)).unwrap();
        assert_eq!(m.materialized_years().unwrap(), vec![2020, 2021, 2022]);

        assert_eq!(m.refresh_manifest().unwrap(), vec![2020, 2021, 2022]);
        let path = m.layout().manifests_dir().join(YEARS_MANIFEST);
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(manifest["dataset"], "iptu");
        assert_eq!(manifest["years"][2]["year"], 2022);
        assert_eq!(manifest["years"][2]["trend_rows"], 1);
    }

    #[test]
    fn trend_rewrite_keeps_the_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(Layout::new(dir.path(), "iptu"));
        assert!(m.rewrite_trend(2022, &[]).unwrap().is_none());

        let counts = YearCounts {
            valid: 120,
            quarantined: 4,
        };
        let before = m.write_year(&agg(2022, 120, 130_000_000), &[trend_row(2022)], counts).unwrap();
        let agg_path = m.layout().gold_dir(2022).join(AGGREGATE_FILE);
        let agg_bytes = std::fs::read(&agg_path).unwrap();

        let mut refreshed = trend_row(2022);
        refreshed.count_growth_pct = Growth::Defined(100.0);
        let after = m.rewrite_trend(2022, &[refreshed, trend_row(2022)]).unwrap().unwrap();
        assert_eq!(std::fs::read(&agg_path).unwrap(), agg_bytes);
        assert_eq!(after.files[0], before.files[0]);
        assert_eq!(after.files[1].rows, 2);
        assert_ne!(after.files[1].blake3, before.files[1].blake3);
        assert_eq!(after.quarantined, 4);
        assert_eq!(m.read_commit(2022).unwrap().unwrap(), after);
        assert_eq!(m.materialized_years().unwrap(), vec![2022]);
    }

    #[test]
    fn money_past_decimal_18_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(Layout::new(dir.path(), "iptu"));
        // 2e20 currency units, beyond an INT64-backed decimal
        let big: i128 = 20_000_000_000_000_000_000_000;
        m.write_year(&agg(2021, 2, big), &[], YearCounts::default()).unwrap();
        let totals = m.read_neighborhood_totals(2021).unwrap().unwrap();
        assert_eq!(totals.by_neighborhood["BOA VISTA"].total_value_cents, big);
    }

    #[test]
    fn money_past_precision_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(Layout::new(dir.path(), "iptu"));
        let too_big = 10i128.pow(38);
        let err = m
            .write_year(&agg(2021, 1, too_big), &[], YearCounts::default())
            .unwrap_err();
        assert!(matches!(err, WriteError::Arrow(_)));
        assert!(m.materialized_years().unwrap().is_empty());
    }
}
