//! Neighborhood growth between adjacent yearly snapshots.
//!
//! Growth against a missing or zero base is [`Growth::Undefined`], never a
//! number. Ranks cover defined growths only: descending by growth, ties
//! broken by ascending neighborhood code.
use aggregate::YearAggregate;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Growth {
    Defined(f64),
    Undefined,
}

impl Growth {
    /// Percent change from `base` to `current`.
    pub fn between(base: i128, current: i128) -> Self {
        if base == 0 {
            return Growth::Undefined;
        }
        Growth::Defined((current - base) as f64 * 100.0 / base as f64)
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Growth::Defined(v) => Some(*v),
            Growth::Undefined => None,
        }
    }
}

impl Serialize for Growth {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Growth::Defined(v) => s.serialize_f64(*v),
            Growth::Undefined => s.serialize_str("undefined"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub count: u64,
    pub total_value_cents: i128,
}

/// Per-neighborhood totals of one year: the only part of an aggregate the
/// trend needs, and what gets read back from disk on resume.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodTotals {
    pub year: i32,
    pub by_neighborhood: BTreeMap<String, Totals>,
}

impl NeighborhoodTotals {
    /// Sums never overflow: the aggregator already bounded the year's total.
    pub fn from_aggregate(agg: &YearAggregate) -> Self {
        let mut by_neighborhood: BTreeMap<String, Totals> = BTreeMap::new();
        for row in &agg.rows {
            let t = by_neighborhood
                .entry(row.neighborhood_code.clone())
                .or_default();
            t.count += row.property_count;
            t.total_value_cents += row.total_venal_value_cents;
        }
        Self {
            year: agg.year,
            by_neighborhood,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRecord {
    pub neighborhood_code: String,
    pub year: i32,
    pub property_count: u64,
    pub total_venal_value_cents: i128,
    pub count_growth_pct: Growth,
    pub value_growth_pct: Growth,
    pub cumulative_count_growth_pct: Growth,
    pub cumulative_value_growth_pct: Growth,
    pub rank_by_count_growth: Option<u32>,
    pub rank_by_value_growth: Option<u32>,
}

/// Walks snapshots in ascending year order, remembering the previous
/// snapshot and each neighborhood's first observation.
#[derive(Debug, Default)]
pub struct TrendCalculator {
    prior: Option<NeighborhoodTotals>,
    first_seen: BTreeMap<String, Totals>,
}

impl TrendCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prior_year(&self) -> Option<i32> {
        self.prior.as_ref().map(|p| p.year)
    }

    /// Feeds a snapshot as history only (an already materialized year).
    pub fn observe(&mut self, totals: NeighborhoodTotals) {
        for (code, t) in &totals.by_neighborhood {
            self.first_seen.entry(code.clone()).or_insert(*t);
        }
        self.prior = Some(totals);
    }

    /// Trend rows for `totals`, which must be later than every snapshot fed so far.
    pub fn next(&mut self, totals: NeighborhoodTotals) -> Vec<TrendRecord> {
        let mut rows: Vec<TrendRecord> = totals
            .by_neighborhood
            .iter()
            .map(|(code, cur)| {
                // only the directly preceding year counts as a base
                let prev = self
                    .prior
                    .as_ref()
                    .filter(|p| p.year + 1 == totals.year)
                    .and_then(|p| p.by_neighborhood.get(code));
                let (count_growth_pct, value_growth_pct) = growth_pair(prev, cur);
                let (cumulative_count_growth_pct, cumulative_value_growth_pct) =
                    growth_pair(self.first_seen.get(code), cur);
                TrendRecord {
                    neighborhood_code: code.clone(),
                    year: totals.year,
                    property_count: cur.count,
                    total_venal_value_cents: cur.total_value_cents,
                    count_growth_pct,
                    value_growth_pct,
                    cumulative_count_growth_pct,
                    cumulative_value_growth_pct,
                    rank_by_count_growth: None,
                    rank_by_value_growth: None,
                }
            })
            .collect();

        for (i, rank) in ranks(&rows, |r| r.count_growth_pct) {
            rows[i].rank_by_count_growth = Some(rank);
        }
        for (i, rank) in ranks(&rows, |r| r.value_growth_pct) {
            rows[i].rank_by_value_growth = Some(rank);
        }

        let defined = rows.iter().filter(|r| r.count_growth_pct.value().is_some()).count();
        tracing::info!(
            year = totals.year,
            prior = ?self.prior_year(),
            neighborhoods = rows.len(),
            defined,
            "trend computed"
        );
        self.observe(totals);
        rows
    }
}

/// Trends for a whole series; the first snapshot only has undefined growth.
pub fn compute_series(series: Vec<NeighborhoodTotals>) -> Vec<Vec<TrendRecord>> {
    let mut calc = TrendCalculator::new();
    series.into_iter().map(|t| calc.next(t)).collect()
}

fn growth_pair(base: Option<&Totals>, cur: &Totals) -> (Growth, Growth) {
    match base {
        // no prior data for this neighborhood
        None => (Growth::Undefined, Growth::Undefined),
        // a zero base count leaves both metrics undefined
        Some(b) if b.count == 0 => (Growth::Undefined, Growth::Undefined),
        Some(b) => (
            Growth::between(i128::from(b.count), i128::from(cur.count)),
            Growth::between(b.total_value_cents, cur.total_value_cents),
        ),
    }
}

/// `(row index, 1-based rank)` for every row whose metric is defined.
fn ranks<F>(rows: &[TrendRecord], metric: F) -> Vec<(usize, u32)>
where
    F: Fn(&TrendRecord) -> Growth,
{
    let mut defined: Vec<(usize, f64)> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, r)| metric(r).value().map(|g| (i, g)))
        .collect();
    defined.sort_by(|(ia, a), (ib, b)| match b.total_cmp(a) {
        Ordering::Equal => rows[*ia].neighborhood_code.cmp(&rows[*ib].neighborhood_code),
        other => other,
    });
    defined
        .into_iter()
        .enumerate()
        .map(|(pos, (i, _))| (i, pos as u32 + 1))
        .collect()
}
