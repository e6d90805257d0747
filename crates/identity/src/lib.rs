//! Cross-year identity: links every `(cadastral_id, year)` observation to a
//! canonical property entity.
//!
//! Years are resolved one at a time in ascending order, ids ascending within
//! a year, so the assignment only depends on the records and the supplied
//! re-issue table. For an observation the resolver tries, in order:
//! a link persisted by an earlier run, an explicit re-issue mapping, the
//! entity the same id had in its latest earlier year, and finally a new
//! entity. There is no heuristic matching.
use metadata::{IdentityError, PropertyRecord};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

mod reissue;
mod store;

pub use reissue::ReissueTable;
pub use store::{load_links, save_links};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRelation {
    /// First observation of a new entity.
    New,
    /// Same id as the entity's previous year.
    Stable,
    /// Linked through the re-issue table.
    Reissued,
    /// A second id observed for an entity already seen this year.
    Merged,
}

impl LinkRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRelation::New => "new",
            LinkRelation::Stable => "stable",
            LinkRelation::Reissued => "reissued",
            LinkRelation::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "new" => LinkRelation::New,
            "stable" => LinkRelation::Stable,
            "reissued" => LinkRelation::Reissued,
            "merged" => LinkRelation::Merged,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityLink {
    pub cadastral_id: String,
    pub year: i32,
    pub entity_id: String,
    pub relation: LinkRelation,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub record: PropertyRecord,
    pub entity_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityStats {
    pub new_entities: u64,
    pub stable: u64,
    pub reissued: u64,
    pub merged: u64,
    /// Links taken as-is from an earlier run.
    pub carried: u64,
}

#[derive(Debug, Clone)]
pub struct ResolvedYear {
    pub year: i32,
    /// Sorted by cadastral id.
    pub records: Vec<ResolvedRecord>,
    pub stats: IdentityStats,
}

impl ResolvedYear {
    pub fn entity_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.entity_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

type LinkKey = (String, i32);

pub struct Resolver {
    reissue: ReissueTable,
    links: BTreeMap<LinkKey, IdentityLink>,
}

impl Resolver {
    pub fn new(reissue: ReissueTable, persisted: Vec<IdentityLink>) -> Self {
        let links = persisted
            .into_iter()
            .map(|l| ((l.cadastral_id.clone(), l.year), l))
            .collect();
        Self { reissue, links }
    }

    /// All links, ordered by `(cadastral_id, year)`.
    pub fn links(&self) -> impl Iterator<Item = &IdentityLink> {
        self.links.values()
    }

    /// Resolves one year. On error nothing is committed, so later years can
    /// still resolve against the links that existed before.
    pub fn resolve_year(
        &mut self,
        year: i32,
        mut records: Vec<PropertyRecord>,
    ) -> Result<ResolvedYear, IdentityError> {
        records.sort_by(|a, b| a.cadastral_id.cmp(&b.cadastral_id));

        let present: HashSet<&str> = records.iter().map(|r| r.cadastral_id.as_str()).collect();
        let mut taken: HashSet<String> = self
            .links
            .values()
            .filter(|l| l.year != year || present.contains(l.cadastral_id.as_str()))
            .map(|l| l.entity_id.clone())
            .collect();

        let mut stats = IdentityStats::default();
        let mut seen_this_year: HashSet<String> = HashSet::new();
        let mut staged: Vec<IdentityLink> = Vec::with_capacity(records.len());

        for rec in &records {
            let id = rec.cadastral_id.as_str();
            let mapped = self.reissue.target(id, year);
            let persisted = self.links.get(&(id.to_string(), year));

            let (entity_id, relation) = match (persisted, mapped) {
                (Some(link), Some(target)) if link.entity_id != target => {
                    return Err(IdentityError::Conflict {
                        cadastral_id: id.to_string(),
                        year,
                        first: link.entity_id.clone(),
                        second: target.to_string(),
                    });
                }
                (Some(link), _) => {
                    stats.carried += 1;
                    (link.entity_id.clone(), link.relation)
                }
                (None, Some(target)) => {
                    if taken.insert(target.to_string()) {
                        stats.new_entities += 1;
                    }
                    let relation = if seen_this_year.contains(target) {
                        LinkRelation::Merged
                    } else {
                        LinkRelation::Reissued
                    };
                    (target.to_string(), relation)
                }
                (None, None) => match self.previous_entity(id, year) {
                    Some(prev) => {
                        let relation = if seen_this_year.contains(prev) {
                            LinkRelation::Merged
                        } else {
                            LinkRelation::Stable
                        };
                        (prev.to_string(), relation)
                    }
                    None => {
                        let fresh = fresh_entity_id(id, year, &taken);
                        taken.insert(fresh.clone());
                        stats.new_entities += 1;
                        (fresh, LinkRelation::New)
                    }
                },
            };
            match relation {
                LinkRelation::Stable => stats.stable += 1,
                LinkRelation::Reissued => stats.reissued += 1,
                LinkRelation::Merged => stats.merged += 1,
                LinkRelation::New => {}
            }
            seen_this_year.insert(entity_id.clone());
            staged.push(IdentityLink {
                cadastral_id: id.to_string(),
                year,
                entity_id,
                relation,
            });
        }

        // commit: this year's links are replaced wholesale
        self.links.retain(|(_, y), _| *y != year);
        let entity_ids: Vec<String> = staged.iter().map(|l| l.entity_id.clone()).collect();
        for link in staged {
            self.links.insert((link.cadastral_id.clone(), year), link);
        }
        let records = records
            .into_iter()
            .zip(entity_ids)
            .map(|(record, entity_id)| ResolvedRecord { record, entity_id })
            .collect();

        tracing::info!(
            year,
            new = stats.new_entities,
            stable = stats.stable,
            reissued = stats.reissued,
            merged = stats.merged,
            carried = stats.carried,
            "identities resolved"
        );
        Ok(ResolvedYear {
            year,
            records,
            stats,
        })
    }

    /// Entity of `id` in the latest year before `year`.
    fn previous_entity(&self, id: &str, year: i32) -> Option<&str> {
        self.links
            .range((id.to_string(), i32::MIN)..(id.to_string(), year))
            .next_back()
            .map(|(_, l)| l.entity_id.as_str())
    }
}

/// `id`, else `id@year`, else `id@year#2`, `#3`, ...
fn fresh_entity_id(id: &str, year: i32, taken: &HashSet<String>) -> String {
    if !taken.contains(id) {
        return id.to_string();
    }
    let base = format!("{id}@{year}");
    if !taken.contains(&base) {
        return base;
    }
    (2u32..)
        .map(|n| format!("{base}#{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata::{PropertyStatus, ReissueEntry};

    fn rec(id: &str, year: i32) -> PropertyRecord {
        PropertyRecord {
            cadastral_id: id.into(),
            year,
            neighborhood_code: "BOA VISTA".into(),
            property_type: None,
            construction_year: None,
            built_area: None,
            land_area: None,
            venal_value_cents: Some(100),
            status: PropertyStatus::Active,
            row_number: 1,
        }
    }

    fn table(entries: &[(&str, i32, &str)]) -> ReissueTable {
        let entries: Vec<_> = entries
            .iter()
            .map(|(id, y, e)| ReissueEntry {
                cadastral_id: id.to_string(),
                year: *y,
                entity_id: e.to_string(),
            })
            .collect();
        ReissueTable::build(&entries).unwrap()
    }

    #[test]
    fn reissue_to_existing_entity_creates_nothing_new() {
        let mut r = Resolver::new(table(&[("123", 2022, "123")]), vec![]);
        let y1 = r.resolve_year(2021, vec![rec("123", 2021)]).unwrap();
        let y2 = r.resolve_year(2022, vec![rec("123", 2022)]).unwrap();
        assert_eq!(y1.records[0].entity_id, "123");
        assert_eq!(y2.records[0].entity_id, "123");
        assert_eq!(y1.stats.new_entities, 1);
        assert_eq!(y2.stats.new_entities, 0);
        assert_eq!(y2.stats.reissued, 1);

        let entities: HashSet<_> = r.links().map(|l| l.entity_id.as_str()).collect();
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn renumbered_id_follows_mapping_and_merge_is_flagged() {
        let mut r = Resolver::new(
            table(&[("900", 2022, "100"), ("901", 2022, "100")]),
            vec![],
        );
        r.resolve_year(2021, vec![rec("100", 2021)]).unwrap();
        let y2 = r
            .resolve_year(2022, vec![rec("901", 2022), rec("900", 2022)])
            .unwrap();
        let got: Vec<_> = y2
            .records
            .iter()
            .map(|x| (x.record.cadastral_id.as_str(), x.entity_id.as_str()))
            .collect();
        assert_eq!(got, vec![("900", "100"), ("901", "100")]);
        assert_eq!(y2.stats.reissued, 1);
        assert_eq!(y2.stats.merged, 1);
        assert_eq!(y2.entity_count(), 1);
    }

    #[test]
    fn taken_ids_get_year_suffix() {
        // "7" is re-issued to entity "50"; a later brand-new "50" must not collide
        let mut r = Resolver::new(table(&[("7", 2021, "50")]), vec![]);
        r.resolve_year(2021, vec![rec("7", 2021)]).unwrap();
        let y2 = r.resolve_year(2022, vec![rec("50", 2022)]).unwrap();
        // "50" has no earlier observation of its own, so it is a new property
        assert_eq!(y2.records[0].entity_id, "50@2022");
    }

    #[test]
    fn persisted_links_are_reused_and_conflicts_name_both_entities() {
        let persisted = vec![IdentityLink {
            cadastral_id: "5".into(),
            year: 2022,
            entity_id: "OLD".into(),
            relation: LinkRelation::Reissued,
        }];
        let mut r = Resolver::new(ReissueTable::default(), persisted.clone());
        let y = r.resolve_year(2022, vec![rec("5", 2022)]).unwrap();
        assert_eq!(y.records[0].entity_id, "OLD");
        assert_eq!(y.stats.carried, 1);

        let mut r = Resolver::new(table(&[("5", 2022, "NEW")]), persisted);
        let err = r.resolve_year(2022, vec![rec("5", 2022)]).unwrap_err();
        match err {
            IdentityError::Conflict { first, second, .. } => {
                assert_eq!(first, "OLD");
                assert_eq!(second, "NEW");
            }
            other => panic!("unexpected {other:?}"),
        }
        // nothing committed
        assert_eq!(r.links().count(), 1);
    }

    #[test]
    fn resolution_is_order_independent() {
        let run = |ids: &[&str]| {
            let mut r = Resolver::new(ReissueTable::default(), vec![]);
            r.resolve_year(2021, ids.iter().map(|i| rec(i, 2021)).collect())
                .unwrap();
            r.links().cloned().collect::<Vec<_>>()
        };
        assert_eq!(run(&["3", "1", "2"]), run(&["1", "2", "3"]));
    }

    #[test]
    fn links_survive_a_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity/links.parquet");
        let mut r = Resolver::new(ReissueTable::default(), vec![]);
        r.resolve_year(2021, vec![rec("1", 2021), rec("2", 2021)]).unwrap();
        r.resolve_year(2022, vec![rec("2", 2022)]).unwrap();
        save_links(&path, r.links()).unwrap();

        let loaded = load_links(&path).unwrap();
        assert_eq!(loaded, r.links().cloned().collect::<Vec<_>>());
        assert_eq!(loaded[2].relation, LinkRelation::Stable);
        assert!(load_links(&dir.path().join("missing.parquet")).unwrap().is_empty());
    }
}
