//! Schema normalization: one year's raw columns -> canonical candidate records.
//!
//! The field mapping is compiled against the year's actual header once, up
//! front. A mapping that names an unknown canonical field or a column the
//! extract does not have fails the whole year before any row is produced.
use metadata::text::{fold_header, fold_label, parse_number, parse_whole};
use metadata::{
    units_to_cents, CandidateRecord, CanonicalField, Cell, ConfigError, FieldMapping, RawRow,
    RawSnapshot,
};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct FieldPlan {
    field: CanonicalField,
    /// Header positions, tried in order.
    columns: Vec<usize>,
    scale: f64,
    /// Folded source label -> replacement.
    remap: HashMap<String, String>,
}

/// A field mapping bound to one year's header.
#[derive(Debug, Clone)]
pub struct Normalizer {
    year: i32,
    plans: Vec<FieldPlan>,
    year_mapped: bool,
}

impl Normalizer {
    pub fn compile(
        year: i32,
        mappings: &[FieldMapping],
        headers: &[String],
    ) -> Result<Self, ConfigError> {
        let mut by_name: HashMap<String, usize> = HashMap::with_capacity(headers.len());
        for (i, h) in headers.iter().enumerate() {
            by_name.entry(fold_header(h)).or_insert(i);
        }

        let mut seen = BTreeSet::new();
        let mut plans = Vec::with_capacity(mappings.len());
        for m in mappings {
            let field: CanonicalField =
                m.canonical_field
                    .parse()
                    .map_err(|field| ConfigError::UnknownCanonicalField { year, field })?;
            if !seen.insert(field) {
                return Err(ConfigError::DuplicateField {
                    year,
                    field: field.to_string(),
                });
            }
            if m.source_column.is_empty() {
                return Err(ConfigError::NoSourceColumn {
                    year,
                    field: field.to_string(),
                });
            }
            let columns = m
                .source_column
                .iter()
                .map(|col| {
                    by_name
                        .get(&fold_header(col))
                        .copied()
                        .ok_or_else(|| ConfigError::MissingSourceColumn {
                            year,
                            field: field.to_string(),
                            column: col.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let scale_ok = m.unit_scale.is_finite() && m.unit_scale != 0.0;
            if !scale_ok || (!field.is_scaled() && m.unit_scale != 1.0) {
                return Err(ConfigError::InvalidScale {
                    year,
                    field: field.to_string(),
                    scale: m.unit_scale,
                });
            }
            let remap = m
                .value_remap_table
                .iter()
                .filter_map(|(from, to)| fold_label(from).map(|k| (k, to.trim().to_string())))
                .collect();
            plans.push(FieldPlan {
                field,
                columns,
                scale: m.unit_scale,
                remap,
            });
        }

        let unmapped: Vec<&str> = CanonicalField::ALL
            .iter()
            .filter(|f| !seen.contains(*f))
            .map(|f| f.as_str())
            .collect();
        let used: BTreeSet<usize> = plans.iter().flat_map(|p| p.columns.iter().copied()).collect();
        tracing::debug!(
            year,
            mapped = plans.len(),
            ?unmapped,
            ignored_columns = headers.len().saturating_sub(used.len()),
            "field mapping compiled"
        );

        Ok(Self {
            year,
            year_mapped: seen.contains(&CanonicalField::Year),
            plans,
        })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn maps(&self, field: CanonicalField) -> bool {
        self.plans.iter().any(|p| p.field == field)
    }

    /// Lazily normalizes the snapshot, one candidate per row, in input order.
    pub fn normalize<'a>(
        &'a self,
        snapshot: &'a RawSnapshot,
    ) -> impl Iterator<Item = CandidateRecord> + 'a {
        snapshot.rows.iter().map(move |row| self.normalize_row(row))
    }

    pub fn normalize_row(&self, row: &RawRow) -> CandidateRecord {
        let mut rec = CandidateRecord {
            row_number: row.row_number,
            ..Default::default()
        };
        // The snapshot's reference year comes from configuration, so an
        // unmapped year column still yields a year.
        if !self.year_mapped {
            rec.year = Cell::Value(self.year);
        }

        for plan in &self.plans {
            let Some(raw) = plan.pick(row) else {
                continue;
            };
            match plan.field {
                CanonicalField::CadastralId => rec.cadastral_id = Some(clean_id(&raw)),
                CanonicalField::Year => rec.year = whole_cell(&raw),
                CanonicalField::NeighborhoodCode => rec.neighborhood_code = fold_label(&raw),
                CanonicalField::PropertyType => {
                    rec.property_type = fold_label(&raw).map(|s| s.to_ascii_lowercase())
                }
                CanonicalField::ConstructionYear => rec.construction_year = whole_cell(&raw),
                CanonicalField::BuiltArea => rec.built_area = scaled_cell(&raw, plan.scale),
                CanonicalField::LandArea => rec.land_area = scaled_cell(&raw, plan.scale),
                CanonicalField::VenalValue => {
                    rec.venal_value = match scaled_cell(&raw, plan.scale) {
                        Cell::Value(v) => Cell::Value(units_to_cents(v)),
                        Cell::Malformed(s) => Cell::Malformed(s),
                        Cell::Unset => Cell::Unset,
                    }
                }
                CanonicalField::Status => rec.status = fold_label(&raw),
            }
        }
        rec
    }
}

impl FieldPlan {
    /// First non-blank source cell, after the remap table. A remap to an
    /// empty string unsets the value.
    fn pick(&self, row: &RawRow) -> Option<String> {
        let raw = self
            .columns
            .iter()
            .filter_map(|&i| row.values.get(i).and_then(Option::as_deref))
            .map(str::trim)
            .find(|v| !v.is_empty())?;
        let replaced = match fold_label(raw).and_then(|k| self.remap.get(&k)) {
            Some(to) => to.as_str(),
            None => raw,
        };
        if replaced.is_empty() {
            None
        } else {
            Some(replaced.to_string())
        }
    }
}

/// Identifiers that went through a spreadsheet come back as `"123.0"`.
fn clean_id(raw: &str) -> String {
    let t = raw.trim();
    match t.strip_suffix(".0") {
        Some(stem) if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) => {
            stem.to_string()
        }
        _ => t.to_string(),
    }
}

fn whole_cell(raw: &str) -> Cell<i32> {
    match parse_whole(raw).and_then(|v| i32::try_from(v).ok()) {
        Some(v) => Cell::Value(v),
        None => Cell::Malformed(raw.to_string()),
    }
}

fn scaled_cell(raw: &str, scale: f64) -> Cell<f64> {
    match parse_number(raw) {
        Some(v) => Cell::Value(v * scale),
        None => Cell::Malformed(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn mapping(field: &str, cols: &[&str]) -> FieldMapping {
        FieldMapping {
            canonical_field: field.to_string(),
            source_column: cols.iter().map(|c| c.to_string()).collect(),
            unit_scale: 1.0,
            value_remap_table: BTreeMap::new(),
        }
    }

    fn snapshot(headers: &[&str], rows: &[&[Option<&str>]]) -> RawSnapshot {
        RawSnapshot {
            year: 2021,
            source_file: "iptu_2021.csv".into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .enumerate()
                .map(|(i, r)| RawRow {
                    row_number: i as u64 + 1,
                    values: r.iter().map(|v| v.map(str::to_string)).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn unknown_canonical_field_is_a_config_error() {
        let headers = vec!["id".to_string()];
        let err = Normalizer::compile(2021, &[mapping("valor_venal", &["id"])], &headers)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownCanonicalField { year: 2021, ref field } if field == "valor_venal"
        ));
    }

    #[test]
    fn column_missing_from_header_is_a_config_error() {
        let headers = vec!["id".to_string()];
        let err = Normalizer::compile(2021, &[mapping("neighborhood_code", &["bairro"])], &headers)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSourceColumn { ref column, .. } if column == "bairro"));
    }

    #[test]
    fn duplicate_field_and_bad_scale_rejected() {
        let headers = vec!["id".to_string(), "ano".to_string()];
        let dup = [mapping("cadastral_id", &["id"]), mapping("cadastral_id", &["ano"])];
        assert!(matches!(
            Normalizer::compile(2021, &dup, &headers),
            Err(ConfigError::DuplicateField { .. })
        ));

        let mut scaled_year = mapping("year", &["ano"]);
        scaled_year.unit_scale = 10.0;
        assert!(matches!(
            Normalizer::compile(2021, &[scaled_year], &headers),
            Err(ConfigError::InvalidScale { .. })
        ));
    }

    #[test]
    fn maps_folded_headers_and_leaves_unmapped_fields_unset() {
        let snap = snapshot(
            &["Número do Contribuinte", "Bairro", "Ignored"],
            &[&[Some("123.0"), Some("  boa  vista"), Some("x")]],
        );
        let n = Normalizer::compile(
            2021,
            &[
                mapping("cadastral_id", &["numero_do_contribuinte"]),
                mapping("neighborhood_code", &["bairro"]),
            ],
            &snap.headers,
        )
        .unwrap();
        let recs: Vec<_> = n.normalize(&snap).collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].cadastral_id.as_deref(), Some("123"));
        assert_eq!(recs[0].neighborhood_code.as_deref(), Some("BOA VISTA"));
        assert_eq!(recs[0].year, Cell::Value(2021));
        assert!(recs[0].venal_value.is_unset());
        assert!(recs[0].construction_year.is_unset());
        assert_eq!(recs[0].property_type, None);
    }

    #[test]
    fn scale_remap_and_fallback_columns() {
        let snap = snapshot(
            &["id", "valor_iptu", "valor_cobrado", "uso", "area_m2", "ano_constr"],
            &[
                &[Some("1"), None, Some("1.500,25"), Some("Residencial"), Some("10"), Some("0")],
                &[Some("2"), Some("abc"), None, Some("-"), None, Some("1980")],
            ],
        );
        let mut value = mapping("venal_value", &["valor_iptu", "valor_cobrado"]);
        value.unit_scale = 1000.0;
        let mut kind = mapping("property_type", &["uso"]);
        kind.value_remap_table = BTreeMap::from([
            ("RESIDENCIAL".to_string(), "residential".to_string()),
            ("-".to_string(), String::new()),
        ]);
        let mut area = mapping("built_area", &["area_m2"]);
        area.unit_scale = 0.5;
        let mut built = mapping("construction_year", &["ano_constr"]);
        built.value_remap_table = BTreeMap::from([("0".to_string(), String::new())]);

        let n = Normalizer::compile(
            2021,
            &[mapping("cadastral_id", &["id"]), value, kind, area, built],
            &snap.headers,
        )
        .unwrap();
        let recs: Vec<_> = n.normalize(&snap).collect();

        assert_eq!(recs[0].venal_value, Cell::Value(150_025_000));
        assert_eq!(recs[0].property_type.as_deref(), Some("residential"));
        assert_eq!(recs[0].built_area, Cell::Value(5.0));
        assert!(recs[0].construction_year.is_unset());

        assert_eq!(recs[1].venal_value, Cell::Malformed("abc".into()));
        assert_eq!(recs[1].property_type, None);
        assert_eq!(recs[1].construction_year, Cell::Value(1980));
        assert_eq!(recs[1].row_number, 2);
    }

    #[test]
    fn mapped_year_column_overrides_reference_year() {
        let snap = snapshot(&["id", "ano"], &[&[Some("1"), Some("2020")], &[Some("2"), None]]);
        let n = Normalizer::compile(
            2021,
            &[mapping("cadastral_id", &["id"]), mapping("year", &["ano"])],
            &snap.headers,
        )
        .unwrap();
        let recs: Vec<_> = n.normalize(&snap).collect();
        assert_eq!(recs[0].year, Cell::Value(2020));
        assert!(recs[1].year.is_unset());
    }
}
