use metadata::{
    units_to_cents, CandidateRecord, Cell, PropertyRecord, PropertyStatus, ValidationRules,
    Vocabulary, MAX_VENAL_CENTS,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

mod quarantine;

pub use quarantine::{quarantine_schema, write_quarantine, QUARANTINE_FILE};

/// Why a record was routed to quarantine. Declaration order is check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    MissingCadastralId,
    MissingYear,
    MissingNeighborhood,
    MalformedValue,
    YearMismatch,
    NegativeValue,
    ValueOutOfRange,
    NegativeArea,
    ConstructionAfterSnapshot,
    UnknownNeighborhood,
    UnknownPropertyType,
    DuplicateId,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::MissingCadastralId => "missing_cadastral_id",
            QuarantineReason::MissingYear => "missing_year",
            QuarantineReason::MissingNeighborhood => "missing_neighborhood",
            QuarantineReason::MalformedValue => "malformed_value",
            QuarantineReason::YearMismatch => "year_mismatch",
            QuarantineReason::NegativeValue => "negative_value",
            QuarantineReason::ValueOutOfRange => "value_out_of_range",
            QuarantineReason::NegativeArea => "negative_area",
            QuarantineReason::ConstructionAfterSnapshot => "construction_after_snapshot",
            QuarantineReason::UnknownNeighborhood => "unknown_neighborhood",
            QuarantineReason::UnknownPropertyType => "unknown_property_type",
            QuarantineReason::DuplicateId => "duplicate_id",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rejected row, with enough lineage to find it in the source extract.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedRecord {
    pub year: i32,
    pub cadastral_id: Option<String>,
    pub source_file: String,
    pub row_number: u64,
    pub reason: QuarantineReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationStats {
    pub rows_in: u64,
    pub valid: u64,
    pub quarantined: u64,
    pub by_reason: BTreeMap<QuarantineReason, u64>,
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub valid: Vec<PropertyRecord>,
    pub quarantined: Vec<QuarantinedRecord>,
    pub stats: ValidationStats,
}

pub struct Validator<'a> {
    year: i32,
    source_file: &'a str,
    vocabulary: &'a Vocabulary,
    max_value_cents: i128,
}

impl<'a> Validator<'a> {
    pub fn new(
        year: i32,
        source_file: &'a str,
        vocabulary: &'a Vocabulary,
        rules: &ValidationRules,
    ) -> Self {
        Self {
            year,
            source_file,
            vocabulary,
            // a configured bound is capped at the per-property limit
            max_value_cents: rules
                .max_venal_value
                .map(units_to_cents)
                .map_or(MAX_VENAL_CENTS, |max| max.min(MAX_VENAL_CENTS)),
        }
    }

    /// Splits one year's candidates into valid records and quarantined rows.
    /// The first occurrence of a cadastral id wins; later ones are duplicates.
    pub fn validate<I>(&self, candidates: I) -> ValidationOutcome
    where
        I: IntoIterator<Item = CandidateRecord>,
    {
        let mut out = ValidationOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for cand in candidates {
            out.stats.rows_in += 1;
            let checked = self
                .check(&cand)
                .and_then(|rec| match seen.insert(rec.cadastral_id.clone()) {
                    true => Ok(rec),
                    false => Err((
                        QuarantineReason::DuplicateId,
                        format!("cadastral id '{}' already seen this year", rec.cadastral_id),
                    )),
                });
            match checked {
                Ok(rec) => out.valid.push(rec),
                Err((reason, detail)) => {
                    *out.stats.by_reason.entry(reason).or_default() += 1;
                    out.quarantined.push(QuarantinedRecord {
                        year: self.year,
                        cadastral_id: cand.cadastral_id,
                        source_file: self.source_file.to_string(),
                        row_number: cand.row_number,
                        reason,
                        detail,
                    });
                }
            }
        }
        out.stats.valid = out.valid.len() as u64;
        out.stats.quarantined = out.quarantined.len() as u64;

        tracing::info!(
            year = self.year,
            valid = out.stats.valid,
            quarantined = out.stats.quarantined,
            "validation done"
        );
        for (reason, n) in &out.stats.by_reason {
            tracing::info!(year = self.year, reason = reason.as_str(), count = n, "quarantined");
        }
        out
    }

    fn check(&self, c: &CandidateRecord) -> Result<PropertyRecord, (QuarantineReason, String)> {
        use QuarantineReason::*;

        let Some(cadastral_id) = c.cadastral_id.clone() else {
            return Err((MissingCadastralId, String::new()));
        };
        if c.year.is_unset() {
            return Err((MissingYear, String::new()));
        }
        let Some(neighborhood) = c.neighborhood_code.clone() else {
            return Err((MissingNeighborhood, String::new()));
        };
        if let Some((field, raw)) = first_malformed(c) {
            return Err((MalformedValue, format!("{field}: '{raw}'")));
        }

        let year = c.year.value().unwrap_or(self.year);
        if year != self.year {
            return Err((YearMismatch, format!("record year {year}, snapshot {}", self.year)));
        }
        let value = c.venal_value.value();
        if let Some(v) = value.filter(|v| *v < 0) {
            return Err((NegativeValue, format!("venal_value {v} cents")));
        }
        if let Some(v) = value.filter(|v| *v > self.max_value_cents) {
            return Err((
                ValueOutOfRange,
                format!("venal_value {v} cents > {}", self.max_value_cents),
            ));
        }
        let built = c.built_area.value();
        let land = c.land_area.value();
        for (field, area) in [("built_area", built), ("land_area", land)] {
            if let Some(a) = area.filter(|a| *a < 0.0) {
                return Err((NegativeArea, format!("{field} {a}")));
            }
        }
        let construction = c.construction_year.value();
        if let Some(built_in) = construction.filter(|b| *b > year) {
            return Err((ConstructionAfterSnapshot, format!("construction_year {built_in}")));
        }
        if !self.vocabulary.knows_neighborhood(&neighborhood) {
            return Err((UnknownNeighborhood, neighborhood));
        }
        if let Some(kind) = c.property_type.as_deref() {
            if !self.vocabulary.knows_property_type(kind) {
                return Err((UnknownPropertyType, kind.to_string()));
            }
        }

        Ok(PropertyRecord {
            cadastral_id,
            year,
            neighborhood_code: neighborhood,
            property_type: c.property_type.clone(),
            construction_year: construction,
            built_area: built,
            land_area: land,
            venal_value_cents: value,
            status: c
                .status
                .as_deref()
                .map(PropertyStatus::from_label)
                .unwrap_or_default(),
            row_number: c.row_number,
        })
    }
}

fn first_malformed(c: &CandidateRecord) -> Option<(&'static str, &str)> {
    fn raw<T>(cell: &Cell<T>) -> Option<&str> {
        match cell {
            Cell::Malformed(s) => Some(s.as_str()),
            _ => None,
        }
    }
    [
        ("year", raw(&c.year)),
        ("construction_year", raw(&c.construction_year)),
        ("built_area", raw(&c.built_area)),
        ("land_area", raw(&c.land_area)),
        ("venal_value", raw(&c.venal_value)),
    ]
    .into_iter()
    .find_map(|(field, r)| r.map(|r| (field, r)))
}
