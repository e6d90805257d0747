//! Orchestrates one run over the configured years.
//!
//! Ingest, normalization, validation and aggregation run one worker per
//! year (bounded by `max_workers`). Identity resolution is the single
//! serialization point and walks years in ascending order. Trends and
//! materialization follow in ascending order as well, so each year's trend
//! sees its predecessor; materialized years after a rerun year get their
//! trend recomputed. A failing year is reported and skipped; the other
//! years carry on.
use aggregate::{Aggregator, YearAggregate};
use anyhow::{anyhow, Context, Result};
use curate::{Materializer, YearCounts};
use identity::{load_links, save_links, ReissueTable, ResolvedYear, Resolver};
use metadata::{PipelineConfig, PropertyRecord, ReissueEntry, YearSource};
use normalize::Normalizer;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use trend::{NeighborhoodTotals, TrendCalculator};
use validate::{write_quarantine, ValidationStats, Validator};

mod report;

pub use report::{RunOutcome, RunReport, Stage, StageFailure, YearReport, YearStatus};

/// Valid records of one year, ready for identity resolution.
struct Prepared {
    year: i32,
    valid: Vec<PropertyRecord>,
    stats: ValidationStats,
}

/// Runs the whole pipeline for `only` (or every configured year).
///
/// Errors are returned only for problems with the request itself; anything
/// that goes wrong inside a year ends up in that year's report.
pub async fn run(cfg: Arc<PipelineConfig>, only: Option<&[i32]>) -> Result<RunReport> {
    let selected = select_years(&cfg, only)?;
    let mut reports: BTreeMap<i32, YearReport> = selected
        .iter()
        .map(|y| (y.year, YearReport::new(y.year)))
        .collect();
    tracing::info!(
        dataset = %cfg.dataset,
        years = ?reports.keys().collect::<Vec<_>>(),
        workers = cfg.max_workers,
        "run started"
    );

    // 1. per-year ingest, normalize, validate
    let mut prepared = Vec::with_capacity(selected.len());
    for (year, res) in prepare_all(cfg.clone(), selected).await {
        let report = reports.entry(year).or_insert_with(|| YearReport::new(year));
        match res {
            Ok(p) => {
                report.rows_in = p.stats.rows_in;
                report.valid = p.stats.valid;
                report.quarantined = p.stats.quarantined;
                report.quarantine_by_reason = p.stats.by_reason.clone();
                prepared.push(p);
            }
            Err(f) => report.fail(f),
        }
    }

    // 2. identity, ascending, one year at a time
    let resolved = resolve_all(&cfg, prepared, &mut reports).await;

    // 3. aggregation, parallel again
    let aggregates = aggregate_all(cfg.clone(), resolved, &mut reports).await;

    // 4. trends and materialization, ascending, off the async workers
    let counts: BTreeMap<i32, YearCounts> = reports
        .iter()
        .map(|(year, r)| {
            let counts = YearCounts {
                valid: r.valid,
                quarantined: r.quarantined,
            };
            (*year, counts)
        })
        .collect();
    let in_run: Vec<i32> = aggregates.iter().map(|a| a.year).collect();
    let task_cfg = cfg.clone();
    let materialized =
        tokio::task::spawn_blocking(move || materialize_all(&task_cfg, aggregates, &counts))
            .await
            .unwrap_or_else(|e| Materialized::worker_died(&in_run, e));
    let (trend_refreshed, manifest_stale) = materialized.apply(&mut reports);

    let years: Vec<YearReport> = reports
        .into_values()
        .map(|mut r| {
            r.finish();
            r
        })
        .collect();
    let mut report = RunReport::new(cfg.dataset.clone(), years);
    report.trend_refreshed = trend_refreshed;
    report.manifest_stale = manifest_stale;
    tracing::info!(outcome = ?report.outcome, "run finished");
    Ok(report)
}

fn select_years(cfg: &PipelineConfig, only: Option<&[i32]>) -> Result<Vec<YearSource>> {
    let Some(only) = only else {
        return Ok(cfg.years.clone());
    };
    let wanted: BTreeSet<i32> = only.iter().copied().collect();
    wanted
        .into_iter()
        .map(|y| cfg.year(y).cloned().map_err(anyhow::Error::from))
        .collect()
}

async fn prepare_all(
    cfg: Arc<PipelineConfig>,
    years: Vec<YearSource>,
) -> Vec<(i32, Result<Prepared, StageFailure>)> {
    let sem = Arc::new(Semaphore::new(cfg.max_workers));
    let handles: Vec<_> = years
        .into_iter()
        .map(|ys| {
            let cfg = cfg.clone();
            let sem = sem.clone();
            let year = ys.year;
            let handle = tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| StageFailure::new(Stage::Ingest, e))?;
                prepare_year(cfg, ys).await
            });
            (year, handle)
        })
        .collect();

    let mut out = Vec::with_capacity(handles.len());
    for (year, handle) in handles {
        let res = handle
            .await
            .unwrap_or_else(|e| Err(StageFailure::new(Stage::Validate, format!("worker died: {e}"))));
        out.push((year, res));
    }
    out
}

async fn prepare_year(cfg: Arc<PipelineConfig>, ys: YearSource) -> Result<Prepared, StageFailure> {
    let snapshot = ingest::read_snapshot(ys.year, &ys.source, &ys.format)
        .await
        .map_err(|e| StageFailure::new(Stage::Ingest, format!("{e:#}")))?;

    tokio::task::spawn_blocking(move || {
        let year = ys.year;
        let layout = cfg.layout();
        if cfg.stage_bronze {
            ingest::stage_bronze(&snapshot, &layout.bronze_dir(year))
                .map_err(|e| StageFailure::new(Stage::Ingest, format!("{e:#}")))?;
        }
        let normalizer = Normalizer::compile(year, &ys.fields, &snapshot.headers)
            .map_err(|e| StageFailure::new(Stage::Normalize, e))?;
        let validator = Validator::new(year, &snapshot.source_file, &cfg.vocabulary, &cfg.validation);
        let outcome = validator.validate(normalizer.normalize(&snapshot));
        write_quarantine(&outcome.quarantined, &layout.rejects_dir(year))
            .map_err(|e| StageFailure::new(Stage::Quarantine, e))?;
        Ok(Prepared {
            year,
            valid: outcome.valid,
            stats: outcome.stats,
        })
    })
    .await
    .unwrap_or_else(|e| Err(StageFailure::new(Stage::Validate, format!("worker died: {e}"))))
}

async fn reissue_entries(cfg: &PipelineConfig) -> Result<Vec<ReissueEntry>> {
    let mut entries = cfg.identity.reissue.clone();
    if let Some(path) = &cfg.identity.reissue_table {
        entries.extend(ingest::read_reissue_table(path).await?);
    }
    Ok(entries)
}

/// Builds the resolver from the re-issue table and the persisted links.
/// Failing that, no year can be resolved.
async fn open_resolver(cfg: &PipelineConfig) -> Result<Resolver> {
    let entries = reissue_entries(cfg).await.context("loading re-issue table")?;
    let table = ReissueTable::build(&entries)?;
    let links = load_links(&cfg.layout().identity_links())?;
    tracing::info!(reissue_entries = table.len(), persisted_links = links.len(), "resolver ready");
    Ok(Resolver::new(table, links))
}

async fn resolve_all(
    cfg: &PipelineConfig,
    mut prepared: Vec<Prepared>,
    reports: &mut BTreeMap<i32, YearReport>,
) -> Vec<ResolvedYear> {
    prepared.sort_by_key(|p| p.year);
    let mut resolver = match open_resolver(cfg).await {
        Ok(r) => r,
        Err(e) => {
            for p in &prepared {
                if let Some(r) = reports.get_mut(&p.year) {
                    r.fail(StageFailure::new(Stage::Identity, format!("{e:#}")));
                }
            }
            return Vec::new();
        }
    };

    let mut resolved = Vec::with_capacity(prepared.len());
    for p in prepared {
        match resolver.resolve_year(p.year, p.valid) {
            Ok(r) => {
                if let Some(rep) = reports.get_mut(&r.year) {
                    rep.identity = Some(r.stats.clone());
                    rep.entity_count = r.entity_count() as u64;
                }
                resolved.push(r);
            }
            Err(e) => {
                if let Some(rep) = reports.get_mut(&p.year) {
                    rep.fail(StageFailure::new(Stage::Identity, e));
                }
            }
        }
    }

    if let Err(e) = save_links(&cfg.layout().identity_links(), resolver.links()) {
        // unsaved links would make the next run resolve differently
        for r in &resolved {
            if let Some(rep) = reports.get_mut(&r.year) {
                rep.fail(StageFailure::new(Stage::Identity, &e));
            }
        }
        return Vec::new();
    }
    resolved
}

async fn aggregate_all(
    cfg: Arc<PipelineConfig>,
    resolved: Vec<ResolvedYear>,
    reports: &mut BTreeMap<i32, YearReport>,
) -> Vec<YearAggregate> {
    let aggregator = Arc::new(Aggregator::new(&cfg.buckets));
    let sem = Arc::new(Semaphore::new(cfg.max_workers));
    let handles: Vec<_> = resolved
        .into_iter()
        .map(|year| {
            let aggregator = aggregator.clone();
            let sem = sem.clone();
            let y = year.year;
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|e| anyhow!(e))?;
                let agg = tokio::task::spawn_blocking(move || aggregator.aggregate(&year))
                    .await
                    .map_err(|e| anyhow!("worker died: {e}"))??;
                Ok::<_, anyhow::Error>(agg)
            });
            (y, handle)
        })
        .collect();

    let mut out = Vec::with_capacity(handles.len());
    for (year, handle) in handles {
        let res = match handle.await {
            Ok(r) => r,
            Err(e) => Err(anyhow!("worker died: {e}")),
        };
        match res {
            Ok(agg) => {
                if let Some(rep) = reports.get_mut(&year) {
                    rep.aggregate_rows = agg.rows.len() as u64;
                }
                out.push(agg);
            }
            Err(e) => {
                if let Some(rep) = reports.get_mut(&year) {
                    rep.fail(StageFailure::new(Stage::Aggregate, format!("{e:#}")));
                }
            }
        }
    }
    out
}

/// What the trend and materialization step did, per year.
#[derive(Debug, Default)]
struct Materialized {
    /// In-run years written, with their trend row count.
    written: Vec<(i32, u64)>,
    /// Years not in the run whose trend was recomputed and rewritten.
    refreshed: Vec<i32>,
    failed: Vec<(i32, StageFailure)>,
    manifest_stale: bool,
}

impl Materialized {
    fn worker_died(years: &[i32], e: tokio::task::JoinError) -> Self {
        let reason = format!("worker died: {e}");
        Self {
            failed: years
                .iter()
                .map(|y| (*y, StageFailure::new(Stage::Materialize, &reason)))
                .collect(),
            ..Default::default()
        }
    }

    /// Folds the outcome into the year reports; returns the refreshed years
    /// and whether `years.json` is behind the partitions.
    fn apply(self, reports: &mut BTreeMap<i32, YearReport>) -> (Vec<i32>, bool) {
        for (year, trend_rows) in self.written {
            if let Some(rep) = reports.get_mut(&year) {
                rep.trend_rows = trend_rows;
            }
        }
        for (year, failure) in self.failed {
            reports
                .entry(year)
                .or_insert_with(|| YearReport::new(year))
                .fail(failure);
        }
        (self.refreshed, self.manifest_stale)
    }
}

/// Walks in-run and already materialized years together in ascending
/// order. Materialized years before the first in-run year only feed the
/// trend history. Later ones also get their trend recomputed and
/// rewritten. In-run years get their trend computed and are written.
/// `years.json` is rebuilt at the end.
fn materialize_all(
    cfg: &PipelineConfig,
    mut aggregates: Vec<YearAggregate>,
    counts: &BTreeMap<i32, YearCounts>,
) -> Materialized {
    let mut out = Materialized::default();
    aggregates.sort_by_key(|a| a.year);
    let Some(first) = aggregates.first().map(|a| a.year) else {
        return out;
    };
    let materializer = Materializer::new(cfg.layout());
    let in_run: BTreeSet<i32> = aggregates.iter().map(|a| a.year).collect();

    let on_disk = materializer.materialized_years().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "gold partitions unreadable; trend history starts with this run");
        Vec::new()
    });

    enum Step {
        History(i32),
        Refresh(i32),
        Current(YearAggregate),
    }
    let mut steps: Vec<(i32, Step)> = on_disk
        .into_iter()
        .filter(|y| !in_run.contains(y))
        .map(|y| {
            if y < first {
                (y, Step::History(y))
            } else {
                (y, Step::Refresh(y))
            }
        })
        .collect();
    steps.extend(aggregates.into_iter().map(|a| (a.year, Step::Current(a))));
    steps.sort_by_key(|(y, _)| *y);

    let mut calc = TrendCalculator::new();
    for (year, step) in steps {
        match step {
            Step::History(y) => match materializer.read_neighborhood_totals(y) {
                Ok(Some(totals)) => {
                    tracing::debug!(year = y, "materialized year used as trend history");
                    calc.observe(totals);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(year = y, error = %e, "materialized year unreadable; treated as a gap"),
            },
            Step::Refresh(y) => {
                let refreshed = materializer.read_neighborhood_totals(y).and_then(|totals| {
                    match totals {
                        Some(totals) => materializer.rewrite_trend(y, &calc.next(totals)),
                        None => Ok(None),
                    }
                });
                match refreshed {
                    Ok(Some(_)) => out.refreshed.push(y),
                    Ok(None) => {}
                    Err(e) => out.failed.push((
                        y,
                        StageFailure::new(Stage::Trend, format!("refreshing trend: {e}")),
                    )),
                }
            }
            Step::Current(agg) => {
                let trends = calc.next(NeighborhoodTotals::from_aggregate(&agg));
                let counts = counts.get(&year).copied().unwrap_or_default();
                match materializer.write_year(&agg, &trends, counts) {
                    Ok(_) => out.written.push((year, trends.len() as u64)),
                    Err(e) => out.failed.push((year, StageFailure::new(Stage::Materialize, e))),
                }
            }
        }
    }

    if let Err(e) = materializer.refresh_manifest() {
        tracing::error!(error = %e, "years.json not updated; partitions on disk are current");
        out.manifest_stale = true;
    }
    if !out.refreshed.is_empty() {
        tracing::info!(years = ?out.refreshed, "later years' trends refreshed");
    }
    out
}

/// Stages one year's extract as Bronze Arrow IPC.
pub async fn ingest_year(cfg: &PipelineConfig, year: i32) -> Result<ingest::IngestStats> {
    let ys = cfg.year(year)?;
    let snapshot = ingest::read_snapshot(year, &ys.source, &ys.format).await?;
    let out_dir = cfg.layout().bronze_dir(year);
    tokio::task::spawn_blocking(move || ingest::stage_bronze(&snapshot, &out_dir))
        .await
        .map_err(|e| anyhow!("worker died: {e}"))?
}

#[derive(Debug, Clone)]
pub struct YearCheck {
    pub year: i32,
    pub columns: usize,
    pub result: Result<usize, String>,
}

/// Reads each configured year's header and compiles its field mapping,
/// without touching any data rows or writing anything.
pub async fn check_config(cfg: &PipelineConfig) -> Vec<YearCheck> {
    let mut out = Vec::with_capacity(cfg.years.len());
    for ys in &cfg.years {
        let check = match ingest::read_header(&ys.source, &ys.format).await {
            Ok(headers) => YearCheck {
                year: ys.year,
                columns: headers.len(),
                result: Normalizer::compile(ys.year, &ys.fields, &headers)
                    .map(|_| ys.fields.len())
                    .map_err(|e| e.to_string()),
            },
            Err(e) => YearCheck {
                year: ys.year,
                columns: 0,
                result: Err(format!("{e:#}")),
            },
        };
        out.push(check);
    }
    out
}
