use crate::error::ConfigError;
use crate::record::ReissueEntry;
use crate::text::fold_label;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Label every vocabulary accepts; remap tables use it to route blanks and
/// placeholders into an explicit "unknown" neighborhood bucket.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

/// A whole run: where data lives, shared bucketing, vocabularies and one
/// source per year.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_workers")]
    pub max_workers: usize,
    /// Keep an all-Utf8 Arrow IPC copy of every extract under `bronze/`.
    #[serde(default)]
    pub stage_bronze: bool,
    #[serde(default)]
    pub buckets: BucketConfig,
    #[serde(default)]
    pub vocabulary: Vocabulary,
    #[serde(default)]
    pub validation: ValidationRules,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub years: Vec<YearSource>,
}

fn default_dataset() -> String {
    "iptu".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YearSource {
    pub year: i32,
    pub source: PathBuf,
    #[serde(default)]
    pub format: SourceFormat,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFormat {
    Csv {
        #[serde(default = "default_delim")]
        delimiter: String,
        #[serde(default)]
        encoding: Encoding,
    },
    Json,
    ArrowIpc,
    Parquet,
}

impl Default for SourceFormat {
    fn default() -> Self {
        SourceFormat::Csv {
            delimiter: default_delim(),
            encoding: Encoding::default(),
        }
    }
}

fn default_delim() -> String {
    ",".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    #[serde(alias = "latin-1", alias = "iso-8859-1")]
    Latin1,
}

/// `canonical_field <- source_column(s)` for one year.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMapping {
    pub canonical_field: String,
    /// First non-empty column wins, in listed order.
    #[serde(deserialize_with = "one_or_many")]
    pub source_column: Vec<String>,
    #[serde(default = "default_scale")]
    pub unit_scale: f64,
    #[serde(default)]
    pub value_remap_table: BTreeMap<String, String>,
}

fn default_scale() -> f64 {
    1.0
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Bucket and histogram boundaries, shared by every year so aggregates stay comparable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    /// Inclusive upper bounds of the age buckets: `[10, 25, 50]` gives
    /// `0-10`, `11-25`, `26-50`, `51+`.
    #[serde(default = "default_age_bounds")]
    pub age_bucket_bounds: Vec<u32>,
    #[serde(default = "default_age_edges")]
    pub age_bin_edges: Vec<u32>,
    /// Currency units.
    #[serde(default = "default_value_edges")]
    pub value_bin_edges: Vec<f64>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            age_bucket_bounds: default_age_bounds(),
            age_bin_edges: default_age_edges(),
            value_bin_edges: default_value_edges(),
        }
    }
}

fn default_age_bounds() -> Vec<u32> {
    vec![10, 25, 50]
}
fn default_age_edges() -> Vec<u32> {
    vec![5, 10, 20, 30, 40, 50, 75, 100]
}
fn default_value_edges() -> Vec<f64> {
    vec![
        50_000.0,
        100_000.0,
        200_000.0,
        350_000.0,
        500_000.0,
        1_000_000.0,
        2_000_000.0,
        5_000_000.0,
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Vocabulary {
    /// Empty means "accept any non-blank code".
    #[serde(default)]
    pub neighborhoods: BTreeSet<String>,
    #[serde(default = "default_property_types")]
    pub property_types: BTreeSet<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            neighborhoods: BTreeSet::new(),
            property_types: default_property_types(),
        }
    }
}

fn default_property_types() -> BTreeSet<String> {
    ["residential", "commercial", "land", "mixed", "other"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Vocabulary {
    /// Folds entries the same way record values are folded.
    fn fold(&mut self) {
        self.neighborhoods = self
            .neighborhoods
            .iter()
            .filter_map(|n| fold_label(n))
            .collect();
        self.property_types = self
            .property_types
            .iter()
            .filter_map(|t| fold_label(t).map(|s| s.to_ascii_lowercase()))
            .collect();
    }

    pub fn knows_neighborhood(&self, code: &str) -> bool {
        code == UNKNOWN_LABEL || self.neighborhoods.is_empty() || self.neighborhoods.contains(code)
    }

    pub fn knows_property_type(&self, kind: &str) -> bool {
        self.property_types.contains(kind)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRules {
    /// Upper plausibility bound for venal values, in currency units.
    #[serde(default)]
    pub max_venal_value: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default)]
    pub reissue: Vec<ReissueEntry>,
    /// CSV with `old_cadastral_id,year,canonical_entity_id`.
    #[serde(default)]
    pub reissue_table: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&txt, base).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses and checks a config; relative paths resolve against `base_dir`.
    pub fn from_toml_str(txt: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut cfg: PipelineConfig = toml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        cfg.resolve_paths(base_dir);
        cfg.vocabulary.fold();
        cfg.check()?;
        cfg.years.sort_by_key(|y| y.year);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.storage_root);
        for y in &mut self.years {
            resolve(&mut y.source);
        }
        if let Some(p) = self.identity.reissue_table.as_mut() {
            resolve(p);
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for y in &self.years {
            if !seen.insert(y.year) {
                return Err(ConfigError::DuplicateYear(y.year));
            }
        }
        if !strictly_increasing(&self.buckets.age_bucket_bounds) {
            return Err(ConfigError::InvalidEdges {
                name: "buckets.age_bucket_bounds",
            });
        }
        if !strictly_increasing(&self.buckets.age_bin_edges) {
            return Err(ConfigError::InvalidEdges {
                name: "buckets.age_bin_edges",
            });
        }
        if self.buckets.value_bin_edges.iter().any(|e| !e.is_finite())
            || !strictly_increasing(&self.buckets.value_bin_edges)
        {
            return Err(ConfigError::InvalidEdges {
                name: "buckets.value_bin_edges",
            });
        }
        if let Some(max) = self.validation.max_venal_value {
            if !max.is_finite() || max <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "validation.max_venal_value must be a positive number, got {max}"
                )));
            }
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::Invalid("dataset must not be empty".into()));
        }
        Ok(())
    }

    pub fn year(&self, year: i32) -> Result<&YearSource, ConfigError> {
        self.years
            .iter()
            .find(|y| y.year == year)
            .ok_or(ConfigError::UnknownYear(year))
    }

    pub fn layout(&self) -> Layout {
        Layout {
            root: self.storage_root.clone(),
            dataset: self.dataset.clone(),
        }
    }
}

fn strictly_increasing<T: PartialOrd>(v: &[T]) -> bool {
    !v.is_empty() && v.windows(2).all(|w| w[0] < w[1])
}

/// On-disk layout under `storage_root`, hive-style `year=` partitions.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub dataset: String,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, dataset: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dataset: dataset.into(),
        }
    }

    fn partition(&self, area: &str, year: i32) -> PathBuf {
        self.root
            .join(area)
            .join(&self.dataset)
            .join(format!("year={year}"))
    }

    pub fn bronze_dir(&self, year: i32) -> PathBuf {
        self.partition("bronze", year)
    }

    pub fn rejects_dir(&self, year: i32) -> PathBuf {
        self.partition("rejects", year)
    }

    pub fn gold_root(&self) -> PathBuf {
        self.root.join("gold").join(&self.dataset)
    }

    pub fn gold_dir(&self, year: i32) -> PathBuf {
        self.partition("gold", year)
    }

    pub fn identity_links(&self) -> PathBuf {
        self.root
            .join("identity")
            .join(&self.dataset)
            .join("links.parquet")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests").join(&self.dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
dataset = "iptu"
storage_root = "out"

[buckets]
age_bucket_bounds = [10, 25, 50]
value_bin_edges = [100000.0, 500000.0]

[vocabulary]
neighborhoods = ["Boa Vista", "São José"]

[[identity.reissue]]
old_cadastral_id = "123"
year = 2021
canonical_entity_id = "123"

[[years]]
year = 2021
source = "raw/iptu_2021.json"
format = { kind = "json" }

[[years.fields]]
canonical_field = "cadastral_id"
source_column = "numero_contribuinte"

[[years]]
year = 2020
source = "raw/iptu_2020.csv"
format = { kind = "csv", delimiter = ";", encoding = "latin1" }

[[years.fields]]
canonical_field = "venal_value"
source_column = ["valor_total_imovel", "valor_total_do_imovel_estimado"]
unit_scale = 1.0

[[years.fields]]
canonical_field = "property_type"
source_column = "tipo_de_uso_do_imovel"
value_remap_table = { "Residencial" = "residential" }
"#;

    #[test]
    fn parses_sample_and_sorts_years() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE, Path::new("/etc/iptu")).unwrap();
        assert_eq!(cfg.years[0].year, 2020);
        assert_eq!(cfg.years[1].year, 2021);
        assert_eq!(cfg.storage_root, PathBuf::from("/etc/iptu/out"));
        assert_eq!(
            cfg.years[0].format,
            SourceFormat::Csv {
                delimiter: ";".into(),
                encoding: Encoding::Latin1
            }
        );
        assert_eq!(cfg.years[1].format, SourceFormat::Json);
        assert_eq!(cfg.years[0].fields[0].source_column.len(), 2);
        assert_eq!(cfg.years[1].fields[0].source_column, vec!["numero_contribuinte"]);
        assert_eq!(cfg.identity.reissue[0].entity_id, "123");
    }

    #[test]
    fn vocabulary_is_folded() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE, Path::new(".")).unwrap();
        assert!(cfg.vocabulary.knows_neighborhood("SAO JOSE"));
        assert!(cfg.vocabulary.knows_neighborhood(UNKNOWN_LABEL));
        assert!(!cfg.vocabulary.knows_neighborhood("Boa Vista"));
        assert!(cfg.vocabulary.knows_property_type("residential"));
    }

    #[test]
    fn rejects_duplicate_years_and_bad_edges() {
        let dup = r#"
[[years]]
year = 2020
source = "a.csv"
[[years]]
year = 2020
source = "b.csv"
"#;
        assert!(matches!(
            PipelineConfig::from_toml_str(dup, Path::new(".")),
            Err(ConfigError::DuplicateYear(2020))
        ));

        let edges = "[buckets]\nvalue_bin_edges = [10.0, 5.0]\n";
        assert!(matches!(
            PipelineConfig::from_toml_str(edges, Path::new(".")),
            Err(ConfigError::InvalidEdges { .. })
        ));

        let max = "[validation]\nmax_venal_value = -5.0\n";
        assert!(matches!(
            PipelineConfig::from_toml_str(max, Path::new(".")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn layout_partitions_by_year() {
        let layout = Layout::new("/data", "iptu");
        assert_eq!(
            layout.gold_dir(2023),
            PathBuf::from("/data/gold/iptu/year=2023")
        );
        assert_eq!(
            layout.rejects_dir(2020),
            PathBuf::from("/data/rejects/iptu/year=2020")
        );
    }
}
