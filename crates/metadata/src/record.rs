use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One year's extract exactly as delivered: header plus text cells.
/// Dropped once the year is normalized.
#[derive(Debug, Clone, Default)]
pub struct RawSnapshot {
    pub year: i32,
    pub source_file: String,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based position in the source file (lineage for quarantine review).
    pub row_number: u64,
    pub values: Vec<Option<String>>,
}

impl RawSnapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fields of the canonical property-record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    CadastralId,
    Year,
    NeighborhoodCode,
    PropertyType,
    ConstructionYear,
    BuiltArea,
    LandArea,
    VenalValue,
    Status,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 9] = [
        CanonicalField::CadastralId,
        CanonicalField::Year,
        CanonicalField::NeighborhoodCode,
        CanonicalField::PropertyType,
        CanonicalField::ConstructionYear,
        CanonicalField::BuiltArea,
        CanonicalField::LandArea,
        CanonicalField::VenalValue,
        CanonicalField::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::CadastralId => "cadastral_id",
            CanonicalField::Year => "year",
            CanonicalField::NeighborhoodCode => "neighborhood_code",
            CanonicalField::PropertyType => "property_type",
            CanonicalField::ConstructionYear => "construction_year",
            CanonicalField::BuiltArea => "built_area",
            CanonicalField::LandArea => "land_area",
            CanonicalField::VenalValue => "venal_value",
            CanonicalField::Status => "status",
        }
    }

    /// Measured quantities, the only fields `unit_scale` applies to.
    pub fn is_scaled(&self) -> bool {
        matches!(
            self,
            CanonicalField::BuiltArea | CanonicalField::LandArea | CanonicalField::VenalValue
        )
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        CanonicalField::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| wanted.to_string())
    }
}

/// A normalized cell: absent from the mapping / empty, parsed, or present but unparseable.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell<T> {
    #[default]
    Unset,
    Value(T),
    Malformed(String),
}

impl<T: Copy> Cell<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Cell::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T> Cell<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Cell::Unset)
    }
}

/// Normalizer output: a property observation whose values are not yet checked.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateRecord {
    pub row_number: u64,
    pub cadastral_id: Option<String>,
    pub year: Cell<i32>,
    pub neighborhood_code: Option<String>,
    pub property_type: Option<String>,
    pub construction_year: Cell<i32>,
    pub built_area: Cell<f64>,
    pub land_area: Cell<f64>,
    /// Assessed value in cents.
    pub venal_value: Cell<i128>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl PropertyStatus {
    /// Accepts the canonical labels plus the Portuguese ones seen in the extracts.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "active" | "ativo" | "ativa" => PropertyStatus::Active,
            "inactive" | "inativo" | "inativa" | "demolished" | "demolido" => {
                PropertyStatus::Inactive
            }
            _ => PropertyStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyStatus::Active => "active",
            PropertyStatus::Inactive => "inactive",
            PropertyStatus::Unknown => "unknown",
        }
    }
}

/// Canonical, validated property observation for one year.
/// `(cadastral_id, year)` is unique within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRecord {
    pub cadastral_id: String,
    pub year: i32,
    pub neighborhood_code: String,
    pub property_type: Option<String>,
    pub construction_year: Option<i32>,
    pub built_area: Option<f64>,
    pub land_area: Option<f64>,
    pub venal_value_cents: Option<i128>,
    pub status: PropertyStatus,
    pub row_number: u64,
}

impl PropertyRecord {
    pub fn age(&self) -> Option<u32> {
        self.construction_year
            .and_then(|built| u32::try_from(self.year - built).ok())
    }
}

/// External reconciliation entry: `(cadastral_id, year) -> canonical entity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReissueEntry {
    #[serde(alias = "old_cadastral_id")]
    pub cadastral_id: String,
    pub year: i32,
    #[serde(alias = "canonical_entity_id")]
    pub entity_id: String,
}

/// Largest single venal value accepted, in cents (the top of DECIMAL(18,2)).
/// Aggregated totals are stored wider.
pub const MAX_VENAL_CENTS: i128 = 999_999_999_999_999_999;

/// Cents -> currency units, for statistics and display.
pub fn cents_to_units(cents: i128) -> f64 {
    cents as f64 / 100.0
}

/// Currency units -> cents, rounded half away from zero. Values past the
/// `i128` range clamp to its ends; validation rejects anything above
/// [`MAX_VENAL_CENTS`] long before that, so a clamped value never reaches
/// the aggregates.
pub fn units_to_cents(units: f64) -> i128 {
    let cents = (units * 100.0).round();
    if cents.is_nan() {
        0
    } else if cents >= i128::MAX as f64 {
        i128::MAX
    } else if cents <= i128::MIN as f64 {
        i128::MIN
    } else {
        cents as i128
    }
}
