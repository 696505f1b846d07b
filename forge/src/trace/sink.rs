//! Durable append-only sinks for trace events.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::trace::event::TraceEvent;

/// Append-only destination for trace events.
///
/// `append` must make the event durable before returning, so a crash
/// immediately afterwards never loses an acknowledged event.
pub trait TraceSink {
    fn append(&mut self, event: &TraceEvent) -> Result<()>;
}

/// File sink writing one JSON object per line.
pub struct JsonlSink {
    file: File,
    path: PathBuf,
}

impl JsonlSink {
    /// Open (or create) the trace file in append mode.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create trace dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for JsonlSink {
    fn append(&mut self, event: &TraceEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize trace event")?;
        line.push('\n');
        // One write per event keeps the append atomic at the line level.
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("sync {}", self.path.display()))?;
        Ok(())
    }
}

/// Read a persisted JSONL trace back into memory.
pub fn load_events(path: &Path) -> Result<Vec<TraceEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read trace {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: TraceEvent = serde_json::from_str(line)
            .with_context(|| format!("parse trace line {} of {}", index + 1, path.display()))?;
        events.push(event);
    }
    Ok(events)
}
