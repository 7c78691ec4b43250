//! Append-only JSONL file per log source.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

/// Appends entries to `<logs_dir>/raw/<date>_<source>.jsonl`.
pub struct SourceLogWriter {
    source: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl SourceLogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, source: impl Into<String>) -> std::io::Result<Self> {
        let source = source.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, source));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            source,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line and flush it.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for SourceLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every entry under `<logs_dir>/raw`, oldest first. Unparseable lines
/// are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(&raw_dir)? {
        let path = dir_entry?.path();
        if path.extension().map_or(true, |e| e != "jsonl") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        entries.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .filter_map(|l| JsonLogEntry::from_json_line(l).ok()),
        );
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}
