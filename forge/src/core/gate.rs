//! Validation gate: contract and tool-coverage checks.
//!
//! Both checks are stateless comparisons over plain data. Recording the
//! corresponding `validation` trace event is the sequencer's job, so a gate
//! call here is deterministic: same inputs, same result, no hidden state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The declared shape a synthesized data artifact must satisfy.
///
/// Captured once during planning and read-only for the rest of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContract {
    /// Required top-level key -> required fields for every record under it.
    /// A key mapped to an empty list only requires the key itself.
    #[serde(default)]
    pub required_keys: BTreeMap<String, Vec<String>>,
    /// Tool names the final implementation must expose. Optional in the
    /// planner output; when present it narrows the schema-derived set.
    #[serde(default)]
    pub expected_tools: Vec<String>,
}

impl DataContract {
    pub fn is_empty(&self) -> bool {
        self.required_keys.is_empty()
    }

    /// One-line digest used in prompts and trace payloads.
    pub fn describe(&self) -> String {
        let keys = self
            .required_keys
            .iter()
            .map(|(key, fields)| {
                if fields.is_empty() {
                    key.clone()
                } else {
                    format!("{key}[{}]", fields.join(", "))
                }
            })
            .collect::<Vec<_>>();
        format!("required keys: {}", keys.join("; "))
    }
}

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern should be valid")
});

/// Extract a [`DataContract`] from planner output.
///
/// Accepts either raw JSON or the first fenced ```json block containing an
/// object with `required_keys`. Returns `None` when no parseable contract is
/// present; the caller treats that as a planning failure.
pub fn parse_contract(text: &str) -> Option<DataContract> {
    let candidates = std::iter::once(text.trim().to_string()).chain(
        FENCED_JSON_RE
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string())),
    );
    for candidate in candidates {
        if let Ok(contract) = serde_json::from_str::<DataContract>(&candidate)
            && !contract.is_empty()
        {
            return Some(contract);
        }
    }
    None
}

/// Outcome of a contract check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContractCheck {
    pub success: bool,
    pub missing_keys: Vec<String>,
    pub missing_fields_by_key: BTreeMap<String, Vec<String>>,
}

impl ContractCheck {
    fn failure(missing_keys: Vec<String>) -> Self {
        Self {
            success: false,
            missing_keys,
            missing_fields_by_key: BTreeMap::new(),
        }
    }

    /// Human-readable diagnostic, used as review feedback and trace detail.
    pub fn describe(&self) -> String {
        if self.success {
            return "data artifact satisfies the contract".to_string();
        }
        let mut parts = Vec::new();
        if !self.missing_keys.is_empty() {
            parts.push(format!("missing keys: {}", self.missing_keys.join(", ")));
        }
        for (key, fields) in &self.missing_fields_by_key {
            parts.push(format!("key '{key}' records missing: {}", fields.join(", ")));
        }
        if parts.is_empty() {
            parts.push("artifact is empty or not a JSON object".to_string());
        }
        parts.join("; ")
    }
}

/// Check a synthesized artifact against the contract.
///
/// Fails closed: an empty or non-object artifact is always a failure, never
/// "nothing to validate". For every required key present and holding an
/// array of records, every declared field must appear in every record.
pub fn validate_contract(artifact: &Value, contract: &DataContract) -> ContractCheck {
    let Some(object) = artifact.as_object() else {
        return ContractCheck::failure(contract.required_keys.keys().cloned().collect());
    };
    if object.is_empty() {
        return ContractCheck::failure(contract.required_keys.keys().cloned().collect());
    }

    let mut missing_keys = Vec::new();
    let mut missing_fields_by_key = BTreeMap::new();
    for (key, fields) in &contract.required_keys {
        let Some(value) = object.get(key) else {
            missing_keys.push(key.clone());
            continue;
        };
        if fields.is_empty() {
            continue;
        }
        if let Some(records) = value.as_array() {
            let mut missing: BTreeSet<String> = BTreeSet::new();
            for record in records {
                for field in fields {
                    let present = record
                        .as_object()
                        .is_some_and(|fields_map| fields_map.contains_key(field));
                    if !present {
                        missing.insert(field.clone());
                    }
                }
            }
            if !missing.is_empty() {
                missing_fields_by_key.insert(key.clone(), missing.into_iter().collect());
            }
        }
    }

    ContractCheck {
        success: missing_keys.is_empty() && missing_fields_by_key.is_empty(),
        missing_keys,
        missing_fields_by_key,
    }
}

/// Outcome of a tool-coverage check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageCheck {
    pub success: bool,
    /// Expected tools the implementation does not expose. Fatal under
    /// strict coverage.
    pub missing: Vec<String>,
    /// Exposed tools nothing expected. Reported as a warning only.
    pub extra: Vec<String>,
}

impl CoverageCheck {
    pub fn describe(&self) -> String {
        if self.success && self.extra.is_empty() {
            return "implementation exposes every expected tool".to_string();
        }
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing tools: {}", self.missing.join(", ")));
        }
        if !self.extra.is_empty() {
            parts.push(format!("extra tools: {}", self.extra.join(", ")));
        }
        parts.join("; ")
    }
}

/// Set difference in both directions between observed and expected tools.
pub fn validate_tool_coverage(
    observed: &BTreeSet<String>,
    expected: &BTreeSet<String>,
) -> CoverageCheck {
    let missing: Vec<String> = expected.difference(observed).cloned().collect();
    let extra: Vec<String> = observed.difference(expected).cloned().collect();
    CoverageCheck {
        success: missing.is_empty(),
        missing,
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract(keys: &[(&str, &[&str])]) -> DataContract {
        DataContract {
            required_keys: keys
                .iter()
                .map(|(key, fields)| {
                    (
                        (*key).to_string(),
                        fields.iter().map(|f| (*f).to_string()).collect(),
                    )
                })
                .collect(),
            expected_tools: Vec::new(),
        }
    }

    #[test]
    fn missing_top_level_key_fails() {
        let contract = contract(&[("users", &[]), ("posts", &[])]);
        let artifact = json!({"users": [{"id": 1}]});

        let check = validate_contract(&artifact, &contract);
        assert!(!check.success);
        assert_eq!(check.missing_keys, vec!["posts".to_string()]);
        assert!(check.missing_fields_by_key.is_empty());
    }

    #[test]
    fn missing_record_field_is_reported_per_key() {
        let contract = contract(&[("users", &["id", "name"])]);
        let artifact = json!({"users": [{"id": 1, "name": "a"}, {"id": 2}]});

        let check = validate_contract(&artifact, &contract);
        assert!(!check.success);
        assert!(check.missing_keys.is_empty());
        assert_eq!(
            check.missing_fields_by_key.get("users"),
            Some(&vec!["name".to_string()])
        );
    }

    #[test]
    fn empty_artifact_fails_closed() {
        let contract = contract(&[("users", &[])]);
        for artifact in [json!({}), json!(null), json!([1, 2])] {
            let check = validate_contract(&artifact, &contract);
            assert!(!check.success, "artifact {artifact} should fail");
            assert_eq!(check.missing_keys, vec!["users".to_string()]);
        }
    }

    #[test]
    fn validate_contract_is_deterministic() {
        let contract = contract(&[("users", &["id"]), ("posts", &["title"])]);
        let artifact = json!({"posts": [{}]});

        let first = validate_contract(&artifact, &contract);
        let second = validate_contract(&artifact, &contract);
        assert_eq!(first, second);
    }

    #[test]
    fn satisfied_contract_passes() {
        let contract = contract(&[("users", &["id"])]);
        let artifact = json!({"users": [{"id": 1}, {"id": 2}], "meta": {}});

        let check = validate_contract(&artifact, &contract);
        assert!(check.success);
        assert_eq!(check.describe(), "data artifact satisfies the contract");
    }

    #[test]
    fn coverage_reports_missing_and_extra() {
        let observed: BTreeSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

        let check = validate_tool_coverage(&observed, &expected);
        assert!(!check.success);
        assert_eq!(check.missing, vec!["b".to_string()]);
        assert_eq!(check.extra, vec!["c".to_string()]);
    }

    #[test]
    fn coverage_with_only_extra_tools_succeeds() {
        let observed: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

        let check = validate_tool_coverage(&observed, &expected);
        assert!(check.success);
        assert_eq!(check.extra, vec!["c".to_string()]);
    }

    #[test]
    fn parse_contract_accepts_raw_and_fenced_json() {
        let raw = r#"{"required_keys": {"users": ["id"]}}"#;
        let fenced = format!("Plan summary.\n\n```json\n{raw}\n```\nDone.");

        let from_raw = parse_contract(raw).expect("raw contract");
        let from_fenced = parse_contract(&fenced).expect("fenced contract");
        assert_eq!(from_raw, from_fenced);
        assert_eq!(
            from_raw.required_keys.get("users"),
            Some(&vec!["id".to_string()])
        );
    }

    #[test]
    fn parse_contract_rejects_empty_or_absent() {
        assert!(parse_contract("no contract here").is_none());
        assert!(parse_contract(r#"{"required_keys": {}}"#).is_none());
    }
}
