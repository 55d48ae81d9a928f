// Legacy Log Migration
//
// Converts the old whole-file JSON array into line-oriented records.

use crate::error::{LoggerError, Result};
use crate::storage::{append_lines, move_aside};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No legacy file at the source path
    NothingToMigrate,
    /// Records appended to the destination; the source now lives at `backup`
    Migrated { records: usize, backup: PathBuf },
    /// Source was not a JSON array; moved to `backup` and nothing was written
    CorruptSource { backup: PathBuf },
}

/// Append every entry of the legacy array at `source` to the JSONL file at `dest`.
///
/// Entries are copied verbatim, so older record shapes survive the move.
pub fn migrate_legacy_array(source: &Path, dest: &Path) -> Result<MigrationOutcome> {
    let bytes = match fs::read(source) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(MigrationOutcome::NothingToMigrate)
        }
        Err(e) => return Err(LoggerError::io("reading legacy log", source, e)),
    };

    let entries: Vec<Value> = match serde_json::from_slice(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            let backup = move_aside(source, "backup")?;
            tracing::warn!(
                "legacy log {} is not a valid JSON array ({}); moved to {}, skipping migration",
                source.display(),
                e,
                backup.display()
            );
            return Ok(MigrationOutcome::CorruptSource { backup });
        }
    };

    let lines = entries
        .iter()
        .map(|entry| {
            let id = entry
                .get("requestId")
                .and_then(|v| v.as_str())
                .unwrap_or("<legacy>");
            serde_json::to_string(entry).map_err(|e| LoggerError::serialize(id, e))
        })
        .collect::<Result<Vec<_>>>()?;

    append_lines(dest, &lines)?;
    let backup = move_aside(source, "migrated")?;
    tracing::info!(
        "migrated {} records from {} to {} (original kept at {})",
        lines.len(),
        source.display(),
        dest.display(),
        backup.display()
    );

    Ok(MigrationOutcome::Migrated {
        records: lines.len(),
        backup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_two_element_array_becomes_two_lines() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("traffic.json");
        let dest = dir.path().join("traffic.jsonl");
        let legacy = json!([
            {"requestId": "a", "request": {"url": "https://api.anthropic.com/v1/messages"}},
            {"requestId": "b", "request": {"url": "https://api.anthropic.com/v1/messages"}}
        ]);
        fs::write(&source, serde_json::to_vec_pretty(&legacy).unwrap()).unwrap();

        let outcome = migrate_legacy_array(&source, &dest).unwrap();
        let MigrationOutcome::Migrated { records, backup } = outcome else {
            panic!("expected a migration");
        };
        assert_eq!(records, 2);
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("traffic.json.migrated."));
        assert!(backup.exists());
        assert!(!source.exists());

        let text = fs::read_to_string(&dest).unwrap();
        let ids: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["requestId"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_corrupt_legacy_file_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("traffic.json");
        let dest = dir.path().join("traffic.jsonl");
        fs::write(&source, "[{\"requestId\": \"a\"},").unwrap();

        let outcome = migrate_legacy_array(&source, &dest).unwrap();
        let MigrationOutcome::CorruptSource { backup } = outcome else {
            panic!("expected a corrupt source");
        };
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("traffic.json.backup."));
        assert!(!source.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = migrate_legacy_array(
            &dir.path().join("absent.json"),
            &dir.path().join("out.jsonl"),
        )
        .unwrap();
        assert_eq!(outcome, MigrationOutcome::NothingToMigrate);
    }
}
