// Record Storage Sinks
//
// Line files are append-only: a batch is one write at the end, and the unit of
// failure is a whole line. The array file is rewritten through a temp file in the
// destination directory and renamed into place, so a reader sees either the old file
// or the new one, never a torn write.

use crate::config::{StorageFormat, WriterConfig};
use crate::error::{LoggerError, Result};
use crate::record::LogRecord;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Destination for flushed batches. Calls are blocking and made off the async runtime.
pub trait RecordSink: Send + Sync {
    /// Append `records` after everything already stored, preserving their order
    fn append(&self, records: &[LogRecord]) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Build the sink selected by the writer configuration
pub fn sink_for(config: &WriterConfig) -> Arc<dyn RecordSink> {
    match config.format {
        StorageFormat::Jsonl => Arc::new(JsonlSink::new(&config.log_file)),
        StorageFormat::JsonArray => Arc::new(JsonArraySink::new(&config.log_file)),
    }
}

// ============================================================================
// Filesystem helpers
// ============================================================================

fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .map_err(|e| LoggerError::io("creating log directory", &parent, e))?;
    Ok(parent)
}

/// Replace `path` with `contents` via a same-directory temp file and rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = ensure_parent(path)?;
    let mut tmp = NamedTempFile::new_in(&dir)
        .map_err(|e| LoggerError::io("creating temp file", &dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| LoggerError::io("writing temp file", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| LoggerError::io("syncing temp file", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| LoggerError::io("renaming temp file into place", path, e.error))?;
    Ok(())
}

fn read_existing(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(LoggerError::io("reading log file", path, e)),
    }
}

/// `<file>.<label>.<epoch millis>` next to the original
pub fn timestamped_sibling(path: &Path, label: &str) -> PathBuf {
    let millis = chrono::Utc::now().timestamp_millis();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}", label, millis));
    path.with_file_name(name)
}

/// Move a file aside with a timestamped suffix and return where it went
pub fn move_aside(path: &Path, label: &str) -> Result<PathBuf> {
    let target = timestamped_sibling(path, label);
    fs::rename(path, &target).map_err(|e| LoggerError::io("moving file aside", path, e))?;
    Ok(target)
}

/// Append pre-serialized JSON lines to a line-oriented file. A torn tail left by an
/// earlier crash is closed off first so it stays one unreadable line.
pub fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggerError::io("opening log file", path, e))?;

    let mut batch = Vec::new();
    if !ends_with_newline(&mut file).map_err(|e| LoggerError::io("reading log file", path, e))? {
        batch.push(b'\n');
    }
    for line in lines {
        batch.extend_from_slice(line.as_bytes());
        batch.push(b'\n');
    }

    file.write_all(&batch)
        .map_err(|e| LoggerError::io("appending to log file", path, e))?;
    file.sync_data()
        .map_err(|e| LoggerError::io("syncing log file", path, e))?;
    Ok(())
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

// ============================================================================
// Sinks
// ============================================================================

/// One JSON object per line
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSink for JsonlSink {
    fn append(&self, records: &[LogRecord]) -> Result<()> {
        let lines = records
            .iter()
            .map(|r| {
                serde_json::to_string(r).map_err(|e| LoggerError::serialize(&r.request_id, e))
            })
            .collect::<Result<Vec<_>>>()?;
        append_lines(&self.path, &lines)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Legacy layout: the whole log is one JSON array, rewritten on every flush
#[derive(Debug, Clone)]
pub struct JsonArraySink {
    path: PathBuf,
}

impl JsonArraySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Existing entries. A corrupt file is moved aside and treated as empty.
    fn load(&self) -> Result<Vec<Value>> {
        let bytes = read_existing(&self.path)?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Vec<Value>>(&bytes) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                let backup = move_aside(&self.path, "backup")?;
                tracing::warn!(
                    "log file {} is corrupt ({}); moved to {} and starting fresh",
                    self.path.display(),
                    e,
                    backup.display()
                );
                Ok(Vec::new())
            }
        }
    }
}

impl RecordSink for JsonArraySink {
    fn append(&self, records: &[LogRecord]) -> Result<()> {
        let mut entries = self.load()?;
        for record in records {
            let value = serde_json::to_value(record)
                .map_err(|e| LoggerError::serialize(&record.request_id, e))?;
            entries.push(value);
        }
        let contents = serde_json::to_vec_pretty(&entries)
            .map_err(|e| LoggerError::serialize("<batch>", e))?;
        write_atomic(&self.path, &contents)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ProjectInfo;
    use crate::record::{CapturedRequest, HeaderMap, ProjectMeta, Protocol};
    use chrono::Utc;

    pub(crate) fn record(id: &str) -> LogRecord {
        LogRecord {
            request_id: id.to_string(),
            request: CapturedRequest {
                timestamp: Utc::now(),
                protocol: Protocol::Https,
                url: "https://api.anthropic.com/v1/messages".to_string(),
                method: "POST".to_string(),
                headers: HeaderMap::new(),
                body: None,
            },
            response: None,
            project: ProjectMeta::stamp(&ProjectInfo::default(), Utc::now()),
        }
    }

    fn ids_in_jsonl(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| {
                let v: Value = serde_json::from_str(l).unwrap();
                v["requestId"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn test_jsonl_appends_without_disturbing_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log.jsonl");
        let sink = JsonlSink::new(&path);

        sink.append(&[record("a"), record("b")]).unwrap();
        sink.append(&[record("c")]).unwrap();

        assert_eq!(ids_in_jsonl(&path), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_jsonl_repairs_missing_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, serde_json::to_string(&record("old")).unwrap()).unwrap();

        JsonlSink::new(&path).append(&[record("new")]).unwrap();
        assert_eq!(ids_in_jsonl(&path), vec!["old", "new"]);
    }

    #[test]
    fn test_jsonl_append_does_not_replace_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let sink = JsonlSink::new(&path);
        sink.append(&[record("a")]).unwrap();

        // a handle opened before the flush sees the new line only if the file was
        // extended in place rather than swapped out
        let mut before = File::open(&path).unwrap();
        sink.append(&[record("b")]).unwrap();

        let mut contents = String::new();
        before.read_to_string(&mut contents).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"requestId\":\"b\""));
    }

    #[test]
    fn test_jsonl_torn_tail_stays_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let first = serde_json::to_string(&record("a")).unwrap();
        fs::write(&path, format!("{}\n{{\"requestId\": \"to", first)).unwrap();

        JsonlSink::new(&path).append(&[record("b")]).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(serde_json::from_str::<Value>(lines[1]).is_err());
        let last: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["requestId"], "b");
    }

    #[test]
    fn test_array_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let sink = JsonArraySink::new(&path);

        sink.append(&[record("a")]).unwrap();
        sink.append(&[record("b")]).unwrap();

        let entries: Vec<Value> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["requestId"], "b");
    }

    #[test]
    fn test_array_sink_backs_up_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        fs::write(&path, "[{\"requestId\": ").unwrap();

        JsonArraySink::new(&path).append(&[record("fresh")]).unwrap();

        let entries: Vec<Value> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("log.json.backup."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        JsonlSink::new(&path).append(&[record("a")]).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["log.jsonl".to_string()]);
    }
}
