use metadata::{IdentityError, ReissueEntry};
use std::collections::{BTreeMap, BTreeSet};

/// Validated re-issue mapping: `(cadastral_id, year) -> canonical entity`.
///
/// Built once per run. Every key has a single target and the
/// id -> entity graph is acyclic (self links such as `123 -> 123` are
/// allowed; they just confirm continuity).
#[derive(Debug, Clone, Default)]
pub struct ReissueTable {
    map: BTreeMap<(String, i32), String>,
}

impl ReissueTable {
    pub fn build(entries: &[ReissueEntry]) -> Result<Self, IdentityError> {
        let mut map: BTreeMap<(String, i32), String> = BTreeMap::new();
        for e in entries {
            let key = (e.cadastral_id.trim().to_string(), e.year);
            let target = e.entity_id.trim().to_string();
            match map.get(&key) {
                Some(prev) if *prev != target => {
                    return Err(IdentityError::Conflict {
                        cadastral_id: key.0,
                        year: key.1,
                        first: prev.clone(),
                        second: target,
                    })
                }
                Some(_) => {}
                None => {
                    map.insert(key, target);
                }
            }
        }
        let table = Self { map };
        table.check_acyclic()?;
        Ok(table)
    }

    pub fn target(&self, cadastral_id: &str, year: i32) -> Option<&str> {
        self.map
            .get(&(cadastral_id.to_string(), year))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn check_acyclic(&self) -> Result<(), IdentityError> {
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for ((id, _), target) in &self.map {
            if id != target {
                edges.entry(id.as_str()).or_default().insert(target.as_str());
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        for &start in edges.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // iterative DFS; `path` mirrors the active stack
            let mut stack: Vec<(&str, Vec<&str>)> =
                vec![(start, edges[start].iter().copied().collect())];
            let mut path = vec![start];
            marks.insert(start, Mark::Active);

            while let Some((node, pending)) = stack.last_mut() {
                let Some(next) = pending.pop() else {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                    path.pop();
                    continue;
                };
                match marks.get(next) {
                    Some(Mark::Active) => {
                        let from = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[from..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return Err(IdentityError::Cycle { path: cycle });
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Active);
                        path.push(next);
                        let succ = edges
                            .get(next)
                            .map(|s| s.iter().copied().collect())
                            .unwrap_or_default();
                        stack.push((next, succ));
                    }
                }
            }
        }
        Ok(())
    }
}
