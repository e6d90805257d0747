use identity::ResolvedYear;
use metadata::{cents_to_units, AggregateError, BucketConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Property type label for records whose type is unset.
pub const UNKNOWN_TYPE: &str = "unknown";

/// Age group derived from `year - construction_year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgeBucket {
    Range { lo: u32, hi: u32 },
    OpenEnded { lo: u32 },
    Unknown,
}

impl fmt::Display for AgeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgeBucket::Range { lo, hi } => write!(f, "{lo}-{hi}"),
            AgeBucket::OpenEnded { lo } => write!(f, "{lo}+"),
            AgeBucket::Unknown => f.write_str("unknown"),
        }
    }
}

/// Inclusive upper bounds, e.g. `[10, 25, 50]` -> 0-10, 11-25, 26-50, 51+.
#[derive(Debug, Clone)]
pub struct AgeBuckets {
    bounds: Vec<u32>,
}

impl AgeBuckets {
    pub fn new(bounds: Vec<u32>) -> Self {
        Self { bounds }
    }

    pub fn bucket(&self, age: Option<u32>) -> AgeBucket {
        let Some(age) = age else {
            return AgeBucket::Unknown;
        };
        match self.bounds.iter().position(|hi| age <= *hi) {
            Some(0) => AgeBucket::Range {
                lo: 0,
                hi: self.bounds[0],
            },
            Some(i) => AgeBucket::Range {
                lo: self.bounds[i - 1] + 1,
                hi: self.bounds[i],
            },
            None => AgeBucket::OpenEnded {
                lo: self.bounds.last().map_or(0, |b| b + 1),
            },
        }
    }
}

/// Bin for `v` given `k` ascending edges: the number of edges `<= v`,
/// so there are `k + 1` bins.
pub fn bin_index<T: PartialOrd>(edges: &[T], v: &T) -> usize {
    edges.partition_point(|e| e <= v)
}

/// One row per (year, neighborhood, property type, age bucket).
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodYearAggregate {
    pub year: i32,
    pub neighborhood_code: String,
    pub property_type: String,
    pub age_bucket: AgeBucket,
    pub property_count: u64,
    /// Distinct canonical entities behind `property_count`.
    pub entity_count: u64,
    pub total_venal_value_cents: i128,
    /// Records that carried a venal value.
    pub valued_count: u64,
    pub mean_venal_value: Option<f64>,
    pub min_venal_value_cents: Option<i128>,
    pub max_venal_value_cents: Option<i128>,
    pub mean_age: Option<f64>,
    pub total_built_area: f64,
    pub total_land_area: f64,
    pub age_distribution: Vec<u64>,
    pub value_distribution: Vec<u64>,
}

/// The complete aggregate set of one year, sorted by group key.
#[derive(Debug, Clone)]
pub struct YearAggregate {
    pub year: i32,
    pub rows: Vec<NeighborhoodYearAggregate>,
}

impl YearAggregate {
    pub fn property_count(&self) -> u64 {
        self.rows.iter().map(|r| r.property_count).sum()
    }
}

type GroupKey = (String, String, AgeBucket);

#[derive(Default)]
struct Acc<'a> {
    count: u64,
    entities: BTreeSet<&'a str>,
    total_cents: i128,
    valued: u64,
    min_cents: Option<i128>,
    max_cents: Option<i128>,
    age_sum: u64,
    aged: u64,
    built_area: f64,
    land_area: f64,
    age_hist: Vec<u64>,
    value_hist: Vec<u64>,
}

pub struct Aggregator {
    buckets: AgeBuckets,
    age_edges: Vec<u32>,
    value_edges: Vec<f64>,
}

impl Aggregator {
    pub fn new(cfg: &BucketConfig) -> Self {
        Self {
            buckets: AgeBuckets::new(cfg.age_bucket_bounds.clone()),
            age_edges: cfg.age_bin_edges.clone(),
            value_edges: cfg.value_bin_edges.clone(),
        }
    }

    /// Every record lands in exactly one group; unknown ages and types get
    /// their own groups, so counts add up to the year's valid records.
    ///
    /// The year's value total is checked as well, so any per-neighborhood
    /// sum of the resulting rows fits in `i128`.
    pub fn aggregate(&self, resolved: &ResolvedYear) -> Result<YearAggregate, AggregateError> {
        let mut groups: BTreeMap<GroupKey, Acc> = BTreeMap::new();
        let mut year_total: i128 = 0;

        for r in &resolved.records {
            let rec = &r.record;
            let age = rec.age();
            let key = (
                rec.neighborhood_code.clone(),
                rec.property_type
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_TYPE.to_string()),
                self.buckets.bucket(age),
            );
            let acc = groups.entry(key).or_insert_with(|| Acc {
                age_hist: vec![0; self.age_edges.len() + 1],
                value_hist: vec![0; self.value_edges.len() + 1],
                ..Default::default()
            });

            acc.count += 1;
            acc.entities.insert(r.entity_id.as_str());
            if let Some(cents) = rec.venal_value_cents {
                let overflow = || AggregateError::Overflow {
                    year: resolved.year,
                    neighborhood: rec.neighborhood_code.clone(),
                };
                acc.total_cents = acc.total_cents.checked_add(cents).ok_or_else(overflow)?;
                year_total = year_total.checked_add(cents).ok_or_else(overflow)?;
                acc.valued += 1;
                acc.min_cents = Some(acc.min_cents.map_or(cents, |m| m.min(cents)));
                acc.max_cents = Some(acc.max_cents.map_or(cents, |m| m.max(cents)));
                acc.value_hist[bin_index(&self.value_edges, &cents_to_units(cents))] += 1;
            }
            if let Some(age) = age {
                acc.age_sum += u64::from(age);
                acc.aged += 1;
                acc.age_hist[bin_index(&self.age_edges, &age)] += 1;
            }
            acc.built_area += rec.built_area.unwrap_or(0.0);
            acc.land_area += rec.land_area.unwrap_or(0.0);
        }

        let rows: Vec<_> = groups
            .into_iter()
            .map(|((neighborhood_code, property_type, age_bucket), acc)| {
                NeighborhoodYearAggregate {
                    year: resolved.year,
                    neighborhood_code,
                    property_type,
                    age_bucket,
                    property_count: acc.count,
                    entity_count: acc.entities.len() as u64,
                    total_venal_value_cents: acc.total_cents,
                    valued_count: acc.valued,
                    mean_venal_value: (acc.valued > 0)
                        .then(|| cents_to_units(acc.total_cents) / acc.valued as f64),
                    min_venal_value_cents: acc.min_cents,
                    max_venal_value_cents: acc.max_cents,
                    mean_age: (acc.aged > 0).then(|| acc.age_sum as f64 / acc.aged as f64),
                    total_built_area: acc.built_area,
                    total_land_area: acc.land_area,
                    age_distribution: acc.age_hist,
                    value_distribution: acc.value_hist,
                }
            })
            .collect();

        let agg = YearAggregate {
            year: resolved.year,
            rows,
        };
        tracing::info!(
            year = agg.year,
            groups = agg.rows.len(),
            properties = agg.property_count(),
            "year aggregated"
        );
        Ok(agg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::{IdentityStats, ResolvedRecord};
    use metadata::{PropertyRecord, PropertyStatus};

    fn resolved(year: i32, recs: Vec<(&str, &str, Option<&str>, Option<i32>, Option<i128>)>) -> ResolvedYear {
        ResolvedYear {
            year,
            records: recs
                .into_iter()
                .map(|(id, hood, kind, built, value)| ResolvedRecord {
                    entity_id: id.to_string(),
                    record: PropertyRecord {
                        cadastral_id: id.into(),
                        year,
                        neighborhood_code: hood.into(),
                        property_type: kind.map(String::from),
                        construction_year: built,
                        built_area: Some(50.0),
                        land_area: None,
                        venal_value_cents: value,
                        status: PropertyStatus::Active,
                        row_number: 1,
                    },
                })
                .collect(),
            stats: IdentityStats::default(),
        }
    }

    #[test]
    fn age_bucket_boundaries() {
        let b = AgeBuckets::new(vec![10, 25, 50]);
        let labels: Vec<String> = [Some(0), Some(10), Some(11), Some(25), Some(26), Some(50), Some(51), None]
            .into_iter()
            .map(|a| b.bucket(a).to_string())
            .collect();
        assert_eq!(
            labels,
            ["0-10", "0-10", "11-25", "11-25", "26-50", "26-50", "51+", "unknown"]
        );
    }

    #[test]
    fn bins_count_edges_at_or_below() {
        let edges = [5u32, 10, 20];
        assert_eq!(bin_index(&edges, &0), 0);
        assert_eq!(bin_index(&edges, &5), 1);
        assert_eq!(bin_index(&edges, &19), 2);
        assert_eq!(bin_index(&edges, &200), 3);
    }

    #[test]
    fn counts_reconcile_to_record_total() {
        let year = resolved(
            2021,
            vec![
                ("1", "BOA VISTA", Some("residential"), Some(2015), Some(10_000_000)),
                ("2", "BOA VISTA", Some("residential"), Some(2018), Some(30_000_000)),
                ("3", "BOA VISTA", None, None, None),
                ("4", "DERBY", Some("commercial"), Some(1950), Some(50_000_000)),
                ("5", "UNKNOWN", Some("land"), None, Some(0)),
            ],
        );
        let agg = Aggregator::new(&BucketConfig::default()).aggregate(&year).unwrap();
        assert_eq!(agg.property_count(), 5);
        assert_eq!(agg.rows.len(), 4);

        let first = &agg.rows[0];
        assert_eq!(
            (first.neighborhood_code.as_str(), first.property_type.as_str()),
            ("BOA VISTA", "residential")
        );
        assert_eq!(first.age_bucket.to_string(), "0-10");
        assert_eq!(first.property_count, 2);
        assert_eq!(first.entity_count, 2);
        assert_eq!(first.total_venal_value_cents, 40_000_000);
        assert_eq!(first.mean_venal_value, Some(200_000.0));
        assert_eq!(first.min_venal_value_cents, Some(10_000_000));
        assert_eq!(first.mean_age, Some(4.5));
        assert_eq!(first.total_built_area, 100.0);
        assert_eq!(first.age_distribution.iter().sum::<u64>(), 2);
        assert_eq!(first.value_distribution.len(), 9);

        let untyped = &agg.rows[1];
        assert_eq!(untyped.property_type, UNKNOWN_TYPE);
        assert_eq!(untyped.age_bucket, AgeBucket::Unknown);
        assert_eq!(untyped.valued_count, 0);
        assert_eq!(untyped.mean_venal_value, None);
        assert_eq!(untyped.mean_age, None);
        assert_eq!(untyped.age_distribution.iter().sum::<u64>(), 0);
    }

    #[test]
    fn value_total_overflow_fails_the_year() {
        let half = i128::MAX / 2 + 1;
        let year = resolved(
            2021,
            vec![
                ("1", "BOA VISTA", Some("residential"), None, Some(half)),
                ("2", "BOA VISTA", Some("residential"), None, Some(half)),
            ],
        );
        let err = Aggregator::new(&BucketConfig::default()).aggregate(&year).unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Overflow { year: 2021, ref neighborhood } if neighborhood == "BOA VISTA"
        ));

        // separate groups can each fit while the year total does not
        let year = resolved(
            2021,
            vec![
                ("1", "BOA VISTA", Some("residential"), None, Some(half)),
                ("2", "DERBY", Some("residential"), None, Some(half)),
            ],
        );
        assert!(Aggregator::new(&BucketConfig::default()).aggregate(&year).is_err());
    }
}
