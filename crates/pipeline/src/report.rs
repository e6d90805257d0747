use identity::IdentityStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use validate::QuarantineReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Normalize,
    Validate,
    Quarantine,
    Identity,
    Aggregate,
    Trend,
    Materialize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Ingest => "ingest",
            Stage::Normalize => "normalize",
            Stage::Validate => "validate",
            Stage::Quarantine => "quarantine",
            Stage::Identity => "identity",
            Stage::Aggregate => "aggregate",
            Stage::Trend => "trend",
            Stage::Materialize => "materialize",
        };
        f.write_str(s)
    }
}

/// A stage error, reduced to what the run report carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage: Stage,
    pub reason: String,
}

impl StageFailure {
    pub fn new(stage: Stage, reason: impl fmt::Display) -> Self {
        Self {
            stage,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum YearStatus {
    Completed,
    Quarantined { count: u64 },
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct YearReport {
    pub year: i32,
    pub status: YearStatus,
    pub rows_in: u64,
    pub valid: u64,
    pub quarantined: u64,
    pub quarantine_by_reason: BTreeMap<QuarantineReason, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityStats>,
    pub entity_count: u64,
    pub aggregate_rows: u64,
    pub trend_rows: u64,
}

impl YearReport {
    pub(crate) fn new(year: i32) -> Self {
        Self {
            year,
            status: YearStatus::Completed,
            rows_in: 0,
            valid: 0,
            quarantined: 0,
            quarantine_by_reason: BTreeMap::new(),
            identity: None,
            entity_count: 0,
            aggregate_rows: 0,
            trend_rows: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, YearStatus::Failed { .. })
    }

    pub(crate) fn fail(&mut self, failure: StageFailure) {
        tracing::error!(
            year = self.year,
            stage = %failure.stage,
            reason = %failure.reason,
            "year failed"
        );
        self.status = YearStatus::Failed {
            stage: failure.stage,
            reason: failure.reason,
        };
    }

    /// Completed or quarantined-N, once every stage went through.
    pub(crate) fn finish(&mut self) {
        if !self.is_failed() {
            self.status = match self.quarantined {
                0 => YearStatus::Completed,
                count => YearStatus::Quarantined { count },
            };
        }
    }
}

/// Completion signal handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialSuccess { quarantined: u64 },
    Failed { year: i32, stage: Stage },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dataset: String,
    pub outcome: RunOutcome,
    pub years: Vec<YearReport>,
    /// Materialized years outside the run whose trend was rewritten.
    pub trend_refreshed: Vec<i32>,
    /// `years.json` could not be rebuilt; the partitions themselves are written.
    pub manifest_stale: bool,
}

impl RunReport {
    pub(crate) fn new(dataset: String, years: Vec<YearReport>) -> Self {
        let failed = years.iter().find_map(|y| match &y.status {
            YearStatus::Failed { stage, .. } => Some((y.year, *stage)),
            _ => None,
        });
        let quarantined: u64 = years.iter().map(|y| y.quarantined).sum();
        let outcome = match failed {
            Some((year, stage)) => RunOutcome::Failed { year, stage },
            None if quarantined > 0 => RunOutcome::PartialSuccess { quarantined },
            None => RunOutcome::Success,
        };
        Self {
            dataset,
            outcome,
            years,
            trend_refreshed: Vec::new(),
            manifest_stale: false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Success => 0,
            RunOutcome::PartialSuccess { .. } => 2,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_names_first_failed_year() {
        let mut a = YearReport::new(2020);
        a.quarantined = 3;
        a.finish();
        let mut b = YearReport::new(2021);
        b.fail(StageFailure::new(Stage::Normalize, "bad mapping"));
        let mut c = YearReport::new(2022);
        c.fail(StageFailure::new(Stage::Materialize, "disk full"));

        let r = RunReport::new("iptu".into(), vec![a.clone(), b, c]);
        assert_eq!(
            r.outcome,
            RunOutcome::Failed {
                year: 2021,
                stage: Stage::Normalize
            }
        );
        assert_eq!(r.exit_code(), 1);

        let r = RunReport::new("iptu".into(), vec![a]);
        assert_eq!(r.outcome, RunOutcome::PartialSuccess { quarantined: 3 });
        assert_eq!(r.exit_code(), 2);
        assert_eq!(r.years[0].status, YearStatus::Quarantined { count: 3 });

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["outcome"]["outcome"], "partial_success");
        assert_eq!(json["years"][0]["status"]["status"], "quarantined");
        assert_eq!(json["years"][0]["status"]["count"], 3);
    }
}
