//! Fail-closed parsing of reviewer verdicts.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ReviewVerdict;

/// A parsed review decision for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewDecision {
    pub verdict: ReviewVerdict,
    pub reasoning: String,
    /// 1-based review cycle that produced this decision.
    pub cycle: u32,
}

/// Reasoning attached when the reviewer output matches neither label.
pub const UNPARSEABLE_REASONING: &str = "unparseable decision";

static LEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s*_`:>#-]+").expect("markdown leader pattern should be valid")
});

/// Parse reviewer output into a decision.
///
/// The verdict is taken from the first non-empty line, after stripping
/// markdown leaders. Anything that is not an explicit `APPROVED` is treated
/// as revisions needed; output matching neither label yields revisions with
/// [`UNPARSEABLE_REASONING`], so unparsed output can never read as approval.
pub fn parse_review_decision(output: &str, cycle: u32) -> ReviewDecision {
    for line in output.lines() {
        let clean = LEADER_RE.replace(line, "");
        let clean = clean.trim();
        if clean.is_empty() {
            continue;
        }
        let upper = clean.to_uppercase();
        if upper.starts_with("APPROVED") {
            return ReviewDecision {
                verdict: ReviewVerdict::Approved,
                reasoning: trim_label(clean, "APPROVED"),
                cycle,
            };
        }
        if upper.starts_with("REVISIONS_NEEDED") {
            return ReviewDecision {
                verdict: ReviewVerdict::RevisionsNeeded,
                reasoning: remaining_reasoning(output, clean),
                cycle,
            };
        }
        break;
    }
    ReviewDecision {
        verdict: ReviewVerdict::RevisionsNeeded,
        reasoning: UNPARSEABLE_REASONING.to_string(),
        cycle,
    }
}

fn trim_label(line: &str, label: &str) -> String {
    line[label.len()..].trim_start_matches([':', ' ']).to_string()
}

/// Revision reasoning keeps the full remaining output so the builder sees
/// every requested fix, not just the verdict line.
fn remaining_reasoning(output: &str, verdict_line: &str) -> String {
    let stripped = trim_label(verdict_line, "REVISIONS_NEEDED");
    let rest: String = output
        .lines()
        .skip_while(|line| !line.contains("REVISIONS_NEEDED"))
        .skip(1)
        .collect::<Vec<_>>()
        .join("\n");
    let rest = rest.trim();
    if rest.is_empty() {
        stripped
    } else if stripped.is_empty() {
        rest.to_string()
    } else {
        format!("{stripped}\n{rest}")
    }
}
