//! Shared disk helpers: atomic JSON writes and JSONL append/load.

use crate::error::KilnResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// Write a JSON-serializable value to `path` atomically.
///
/// Serializes to a `<stem>.tmp.<uuid>` sibling first, then renames over the
/// target, so a crash mid-write never leaves a corrupt or half-written
/// record. Temp names carry no `.json` extension, which keeps them out of
/// extension-keyed directory scans.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> KilnResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;

    let temp_name = format!(
        "{}.tmp.{}",
        path.file_stem().and_then(|s| s.to_str()).unwrap_or("file"),
        Uuid::new_v4()
    );
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, json).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        e
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        e
    })?;
    Ok(())
}

/// Read a JSON file into a typed value.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> KilnResult<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Append one JSON-serialized item as a line to a JSONL file.
pub fn append_jsonl<T: Serialize>(path: &Path, item: &T) -> KilnResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(item)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Load all items from a JSONL file, skipping malformed lines with a warning.
pub fn load_jsonl<T: DeserializeOwned>(path: &Path) -> KilnResult<Vec<T>> {
    let mut items = Vec::new();
    if !path.exists() {
        return Ok(items);
    }

    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(item) => items.push(item),
            Err(e) => {
                warn!("skipping malformed line {} in {}: {}", line_num + 1, path.display(), e);
            }
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        name: String,
    }

    #[test]
    fn test_atomic_write_then_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sub").join("row.json");

        let row = Row { id: 7, name: "seven".to_string() };
        atomic_write_json(&path, &row).unwrap();

        let back: Row = read_json(&path).unwrap();
        assert_eq!(back, row);
        // no temp leftovers
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["row.json".to_string()]);
    }

    #[test]
    fn test_atomic_write_replaces_previous_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("row.json");

        atomic_write_json(&path, &Row { id: 1, name: "one".to_string() }).unwrap();
        atomic_write_json(&path, &Row { id: 2, name: "two".to_string() }).unwrap();

        let back: Row = read_json(&path).unwrap();
        assert_eq!(back.id, 2);
    }

    #[test]
    fn test_load_jsonl_skips_malformed_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rows.jsonl");

        append_jsonl(&path, &Row { id: 1, name: "a".to_string() }).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{{not json"))
            .unwrap();
        append_jsonl(&path, &Row { id: 2, name: "b".to_string() }).unwrap();

        let rows: Vec<Row> = load_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id, 2);
    }

    #[test]
    fn test_load_jsonl_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let rows: Vec<Row> = load_jsonl(&temp.path().join("absent.jsonl")).unwrap();
        assert!(rows.is_empty());
    }
}
