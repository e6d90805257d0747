use crate::clean_cell;
use anyhow::{anyhow, Context, Result};
use metadata::{RawRow, RawSnapshot};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Keys under which open-data portals nest the record list.
const DATA_KEYS: [&str; 6] = ["data", "dados", "registros", "records", "items", "imoveis"];

/// JSON extracts come in three shapes: a bare list of objects, a
/// `{fields: [{id}], records: [...]}` datastore dump, or an object holding
/// the list under one of [`DATA_KEYS`].
pub(crate) async fn read_json(year: i32, source: &Path) -> Result<RawSnapshot> {
    let bytes = tokio::fs::read(source)
        .await
        .with_context(|| format!("read {}", source.display()))?;
    let doc: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse JSON {}", source.display()))?;
    let (headers, rows) = table_from_json(doc)?;
    Ok(RawSnapshot {
        year,
        source_file: source.display().to_string(),
        headers,
        rows,
    })
}

fn table_from_json(doc: Value) -> Result<(Vec<String>, Vec<RawRow>)> {
    match doc {
        Value::Array(items) => objects_to_rows(items),
        Value::Object(mut obj) => {
            let is_datastore = obj.get("fields").is_some_and(Value::is_array)
                && obj.get("records").is_some_and(Value::is_array);
            if is_datastore {
                let fields = take_array(&mut obj, "fields");
                let records = take_array(&mut obj, "records");
                let headers = fields
                    .iter()
                    .map(|f| {
                        f.get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| anyhow!("datastore field without 'id'"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                return datastore_rows(headers, records);
            }
            for key in DATA_KEYS {
                if let Some(Value::Array(items)) = obj.remove(key) {
                    return objects_to_rows(items);
                }
            }
            Err(anyhow!("unsupported JSON layout: no record list found"))
        }
        _ => Err(anyhow!("unsupported JSON layout: expected array or object")),
    }
}

fn take_array(obj: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Header = keys in first-seen order across all records.
fn objects_to_rows(items: Vec<Value>) -> Result<(Vec<String>, Vec<RawRow>)> {
    let mut headers: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut objects: Vec<Map<String, Value>> = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(map) = item else {
            return Err(anyhow!("record list contains a non-object entry"));
        };
        for k in map.keys() {
            if !index.contains_key(k) {
                index.insert(k.clone(), headers.len());
                headers.push(k.clone());
            }
        }
        objects.push(map);
    }

    let rows = objects
        .into_iter()
        .enumerate()
        .map(|(i, map)| {
            let mut values = vec![None; headers.len()];
            for (k, v) in map {
                if let Some(&col) = index.get(&k) {
                    values[col] = cell_text(v);
                }
            }
            RawRow {
                row_number: i as u64 + 1,
                values,
            }
        })
        .collect();
    Ok((headers, rows))
}

fn datastore_rows(headers: Vec<String>, records: Vec<Value>) -> Result<(Vec<String>, Vec<RawRow>)> {
    let mut rows = Vec::with_capacity(records.len());
    for (i, rec) in records.into_iter().enumerate() {
        let values = match rec {
            Value::Array(cells) => {
                let mut cells = cells.into_iter().map(cell_text).collect::<Vec<_>>();
                cells.resize(headers.len(), None);
                cells
            }
            Value::Object(mut map) => headers
                .iter()
                .map(|h| map.remove(h).and_then(cell_text))
                .collect(),
            _ => return Err(anyhow!("datastore record {} is neither array nor object", i + 1)),
        };
        rows.push(RawRow {
            row_number: i as u64 + 1,
            values,
        });
    }
    Ok((headers, rows))
}

fn cell_text(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => clean_cell(s),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_list_unions_keys() {
        let (headers, rows) = table_from_json(json!([
            {"id": "1", "bairro": "Derby"},
            {"id": 2, "valor": 10.5, "bairro": null}
        ]))
        .unwrap();
        assert_eq!(headers.len(), 3);
        let id = headers.iter().position(|h| h == "id").unwrap();
        let valor = headers.iter().position(|h| h == "valor").unwrap();
        assert_eq!(rows[1].values[id].as_deref(), Some("2"));
        assert_eq!(rows[1].values[valor].as_deref(), Some("10.5"));
        assert_eq!(rows[0].values[valor], None);
    }

    #[test]
    fn datastore_dump_uses_field_ids() {
        let (headers, rows) = table_from_json(json!({
            "fields": [{"id": "contribuinte"}, {"id": "bairro"}],
            "records": [["10", "Boa Vista"], {"contribuinte": "11", "bairro": " "}]
        }))
        .unwrap();
        assert_eq!(headers, vec!["contribuinte", "bairro"]);
        assert_eq!(rows[0].values[1].as_deref(), Some("Boa Vista"));
        assert_eq!(rows[1].values[0].as_deref(), Some("11"));
        assert_eq!(rows[1].values[1], None);
    }

    #[test]
    fn nested_record_list() {
        let (headers, rows) =
            table_from_json(json!({"imoveis": [{"bairro": "Derby"}]})).unwrap();
        assert_eq!(headers, vec!["bairro"]);
        assert_eq!(rows.len(), 1);
        assert!(table_from_json(json!({"other": 1})).is_err());
    }
}
