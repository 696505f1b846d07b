//! Canonical output locations for one pipeline run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All artifact paths for a run, derived from the workspace root, the
/// service slug, and an optional domain grouping.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub root: PathBuf,
    pub generated_dir: PathBuf,
    pub data_module_path: PathBuf,
    pub data_json_path: PathBuf,
    pub server_module_path: PathBuf,
    pub metadata_json_path: PathBuf,
    pub tests_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Append-only JSONL trace for the run.
    pub trace_path: PathBuf,
    /// Exported snapshot (summary + events) written at the end of the run.
    pub trace_export_path: PathBuf,
    /// Per-stage agent runtime artifacts (response JSON, process logs).
    pub runtime_dir: PathBuf,
}

impl OutputPaths {
    pub fn new(root: impl Into<PathBuf>, slug: &str, domain: Option<&str>) -> Self {
        let root = root.into();
        let group = |base: PathBuf| -> PathBuf {
            match domain {
                Some(domain) => base.join(domain).join(slug),
                None => base.join(slug),
            }
        };
        let generated_dir = group(root.join("generated"));
        let tests_dir = group(root.join("tests"));
        let transcripts_dir = group(root.join("transcripts"));
        let logs_dir = group(root.join("logs"));
        let module_slug = slug.replace('-', "_");
        Self {
            root,
            data_module_path: generated_dir.join(format!("{module_slug}_data.py")),
            data_json_path: generated_dir.join(format!("{module_slug}_data.json")),
            server_module_path: generated_dir.join(format!("{module_slug}_server.py")),
            metadata_json_path: generated_dir.join(format!("{module_slug}_metadata.json")),
            trace_path: logs_dir.join(format!("trace_{slug}.jsonl")),
            trace_export_path: logs_dir.join(format!("trace_summary_{slug}.json")),
            runtime_dir: logs_dir.join("runtime"),
            generated_dir,
            tests_dir,
            transcripts_dir,
            logs_dir,
        }
    }

    /// Create every directory a run writes into.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            &self.generated_dir,
            &self.tests_dir,
            &self.transcripts_dir,
            &self.logs_dir,
            &self.runtime_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Response/log file pair for one stage's runtime invocation.
    pub fn runtime_files(&self, step_name: &str) -> (PathBuf, PathBuf) {
        (
            self.runtime_dir.join(format!("{step_name}.response.json")),
            self.runtime_dir.join(format!("{step_name}.log")),
        )
    }
}

/// Create a filesystem-friendly slug.
pub fn slugify(value: &str) -> String {
    let simplified = value.trim().to_lowercase().replace(' ', "-");
    let slug: String = simplified
        .chars()
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_'))
        .collect();
    if slug.is_empty() {
        "service".to_string()
    } else {
        slug
    }
}

/// Workspace-relative rendering for summaries and prompts.
pub fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| rel.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}
