use anyhow::{anyhow, Context, Result};
use csv_async::AsyncReaderBuilder;
use futures::StreamExt;
use metadata::text::{fold_header, parse_whole};
use metadata::ReissueEntry;
use std::path::Path;
use tokio::io::BufReader;

/// Reads the external reconciliation table
/// (comma-separated `old_cadastral_id,year,canonical_entity_id`).
pub async fn read_reissue_table(path: &Path) -> Result<Vec<ReissueEntry>> {
    let f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut rdr = AsyncReaderBuilder::new()
        .has_headers(true)
        .create_reader(BufReader::new(f));

    let headers = rdr.headers().await?.clone();
    let find = |names: &[&str]| {
        headers
            .iter()
            .position(|h| names.contains(&fold_header(h).as_str()))
            .ok_or_else(|| anyhow!("{}: missing column {}", path.display(), names[0]))
    };
    let id_idx = find(&["old_cadastral_id", "cadastral_id"])?;
    let year_idx = find(&["year", "ano"])?;
    let entity_idx = find(&["canonical_entity_id", "entity_id"])?;

    let mut entries = Vec::new();
    let mut records = rdr.records();
    let mut line = 1;
    while let Some(rec) = records.next().await {
        let rec = rec?;
        line += 1;
        let field = |i: usize| rec.get(i).map(str::trim).filter(|s| !s.is_empty());
        let (Some(id), Some(year), Some(entity)) = (field(id_idx), field(year_idx), field(entity_idx))
        else {
            return Err(anyhow!("{}:{line}: incomplete re-issue entry", path.display()));
        };
        let year = parse_whole(year)
            .and_then(|y| i32::try_from(y).ok())
            .ok_or_else(|| anyhow!("{}:{line}: bad year '{year}'", path.display()))?;
        entries.push(ReissueEntry {
            cadastral_id: id.to_string(),
            year,
            entity_id: entity.to_string(),
        });
    }
    tracing::info!(entries = entries.len(), path = %path.display(), "re-issue table loaded");
    Ok(entries)
}
