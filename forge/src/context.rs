//! Shared mutable state threaded through every stage.
//!
//! Ownership is one writer per field: planning freezes the contract and the
//! expected tool names, the sequencer appends stage results, and agents
//! reach the filesystem only through the context's path map. Later stages
//! never rewrite an earlier stage's output; a rerun replaces only its own
//! same-named entry, so the full history stays reconstructible.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};
use serde_json::Value;

use crate::core::gate::DataContract;
use crate::core::types::StageResult;
use crate::io::paths::{OutputPaths, relative_to};

/// Shared state for one pipeline run.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workspace_root: PathBuf,
    pub schema_path: PathBuf,
    pub schema: Value,
    pub slug: String,
    pub service_name: String,
    pub domain: Option<String>,
    pub schema_summary: String,
    output_paths: BTreeMap<String, PathBuf>,
    contract: Option<DataContract>,
    expected_tool_names: BTreeSet<String>,
    tool_names_frozen: bool,
    stage_results: Vec<StageResult>,
    /// Free-form coordination notes shared across stages.
    pub notes: Vec<String>,
}

impl WorkflowContext {
    pub fn new(
        workspace_root: PathBuf,
        schema_path: PathBuf,
        schema: Value,
        slug: String,
        domain: Option<String>,
        paths: &OutputPaths,
    ) -> Self {
        let service_name = service_name_from_schema(&schema, &schema_path);
        let expected_tool_names = tool_names_from_schema(&schema);
        let output_paths = BTreeMap::from([
            ("data_module".to_string(), paths.data_module_path.clone()),
            ("data_json".to_string(), paths.data_json_path.clone()),
            ("server_module".to_string(), paths.server_module_path.clone()),
            ("metadata_json".to_string(), paths.metadata_json_path.clone()),
            ("tests_dir".to_string(), paths.tests_dir.clone()),
            ("transcripts_dir".to_string(), paths.transcripts_dir.clone()),
        ]);

        let mut context = Self {
            workspace_root,
            schema_path,
            schema,
            slug,
            service_name,
            domain,
            schema_summary: String::new(),
            output_paths,
            contract: None,
            expected_tool_names,
            tool_names_frozen: false,
            stage_results: Vec::new(),
            notes: Vec::new(),
        };
        context.schema_summary = build_schema_summary(&context);
        context
    }

    /// Logical artifact name -> absolute path. Stages read and write only
    /// through this map.
    pub fn output_paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.output_paths
    }

    pub fn output_path(&self, name: &str) -> Result<&Path> {
        self.output_paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("unknown output path '{name}'"))
    }

    /// Workspace-relative rendering of the path map, for prompts and logs.
    pub fn relative_output_paths(&self) -> BTreeMap<String, String> {
        self.output_paths
            .iter()
            .map(|(name, path)| (name.clone(), self.relative(path)))
            .collect()
    }

    /// Resolve a workspace-relative path, refusing escapes from the root.
    pub fn resolve_path(&self, value: &str) -> Result<PathBuf> {
        let candidate = Path::new(value);
        let mut resolved = if candidate.is_absolute() {
            PathBuf::from(candidate)
        } else {
            self.workspace_root.join(candidate)
        };
        resolved = normalize(&resolved)?;
        if resolved.starts_with(&self.workspace_root) {
            Ok(resolved)
        } else {
            Err(anyhow!(
                "path {value} is outside the workspace root {}",
                self.workspace_root.display()
            ))
        }
    }

    /// Return a workspace-relative string for a resolved path.
    pub fn relative(&self, path: &Path) -> String {
        relative_to(&self.workspace_root, path)
    }

    /// Freeze the data contract produced by planning. Exactly one writer:
    /// a second call is an error.
    pub fn set_contract(&mut self, contract: DataContract) -> Result<()> {
        if self.contract.is_some() {
            return Err(anyhow!("data contract is already set"));
        }
        self.contract = Some(contract);
        Ok(())
    }

    pub fn contract(&self) -> Option<&DataContract> {
        self.contract.as_ref()
    }

    /// Freeze the expected tool names after planning. `narrowed` replaces
    /// the schema-derived set when the planner declared one.
    pub fn freeze_expected_tools(&mut self, narrowed: Option<Vec<String>>) -> Result<()> {
        if self.tool_names_frozen {
            return Err(anyhow!("expected tool names are already frozen"));
        }
        if let Some(names) = narrowed
            && !names.is_empty()
        {
            self.expected_tool_names = names.into_iter().collect();
        }
        self.tool_names_frozen = true;
        Ok(())
    }

    pub fn expected_tool_names(&self) -> &BTreeSet<String> {
        &self.expected_tool_names
    }

    /// Append a stage result, replacing only a same-named prior entry.
    pub fn record_stage_result(&mut self, result: StageResult) {
        if let Some(existing) = self
            .stage_results
            .iter_mut()
            .find(|entry| entry.name == result.name)
        {
            *existing = result;
        } else {
            self.stage_results.push(result);
        }
    }

    /// Stage results in execution order.
    pub fn stage_results(&self) -> &[StageResult] {
        &self.stage_results
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, erroring when `..` climbs past the path's start.
fn normalize(path: &Path) -> Result<PathBuf> {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match parts.last() {
                    Some(Component::Normal(_)) => {
                        parts.pop();
                    }
                    _ => return Err(anyhow!("path {} escapes its root", path.display())),
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.into_iter().collect())
}

/// Load the declarative service schema.
pub fn load_schema(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read schema {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse schema {}", path.display()))
}

/// Service name from the schema, falling back to the file stem.
pub fn service_name_from_schema(schema: &Value, schema_path: &Path) -> String {
    let crawled_name = schema
        .pointer("/metadata/server_info_crawled/name")
        .and_then(Value::as_str);
    let declared_name = schema.pointer("/metadata/server_name").and_then(Value::as_str);
    crawled_name
        .or(declared_name)
        .map(str::to_string)
        .unwrap_or_else(|| {
            schema_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "service".to_string())
        })
}

/// Tool names declared by the schema.
pub fn tool_names_from_schema(schema: &Value) -> BTreeSet<String> {
    schema
        .pointer("/metadata/server_info_crawled/tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Human-readable digest of the schema, used by the planner prompt.
fn build_schema_summary(context: &WorkflowContext) -> String {
    let tools = context
        .schema
        .pointer("/metadata/server_info_crawled/tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut lines = vec![
        format!("Service name: {}", context.service_name),
        format!("Schema file: {}", context.relative(&context.schema_path)),
        format!("Planned slug: {}", context.slug),
        format!("Tool count: {}", tools.len()),
    ];
    for tool in &tools {
        let name = tool.get("name").and_then(Value::as_str).unwrap_or("<unknown>");
        let description = tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        lines.push(format!("- {name}: {description}"));
        if let Some(parameters) = tool.get("parameters").and_then(Value::as_array) {
            for parameter in parameters {
                let parameter_name =
                    parameter.get("name").and_then(Value::as_str).unwrap_or("");
                let parameter_type = parameter
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let required_flag = if parameter
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    "required"
                } else {
                    "optional"
                };
                lines.push(format!(
                    "    - {parameter_name} ({parameter_type}, {required_flag})"
                ));
            }
        }
    }
    lines.push(String::new());
    lines.push("Recommended output locations:".to_string());
    for (name, path) in &context.output_paths {
        lines.push(format!("- {name}: {}", context.relative(path)));
    }
    lines.join("\n")
}
