use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};

use super::ids::{AgentName, AgentSet, FindingId};

/// Reported severity, ordered from least to most severe.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Inclusive 1-based line range, optionally anchored to a column.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl LineRange {
    pub fn line(line: u32) -> Self {
        Self {
            start: line,
            end: line,
            column: None,
        }
    }

    pub fn span(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            column: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start >= 1 && self.end >= self.start
    }

    /// Number of lines covered; smaller is more specific.
    pub fn width(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// True when the gap between the two ranges is at most `window` lines.
    pub fn within(&self, other: &LineRange, window: u32) -> bool {
        let (first, second) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        second.start <= first.end.saturating_add(window)
    }
}

/// Suggested remediation attached to a finding.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FixSuggestion {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

/// One agent's claim about one issue, prior to consensus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    /// Filled in by the dispatcher; adapters may leave it empty.
    #[serde(default)]
    pub agent: AgentName,
    pub rule_id: String,
    pub severity: Severity,
    pub file: String,
    pub location: LineRange,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixSuggestion>,
    /// Shared-taxonomy category declared by the adapter, used when no
    /// configured mapping covers `rule_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl RawFinding {
    /// Describes why the finding cannot take part in consensus, if it can't.
    pub fn defect(&self) -> Option<&'static str> {
        if self.agent.as_str().trim().is_empty() {
            return Some("missing agent");
        }
        if self.rule_id.trim().is_empty() {
            return Some("missing rule id");
        }
        if self.file.trim().is_empty() {
            return Some("missing file path");
        }
        if !self.location.is_valid() {
            return Some("invalid line range");
        }
        if !self.confidence.is_finite()
            || !(0.0..=1.0).contains(&self.confidence)
        {
            return Some("confidence outside [0, 1]");
        }
        None
    }

    /// Length of the human-readable text, used to pick the most detailed
    /// report in a cluster.
    pub fn detail_len(&self) -> usize {
        self.title.trim().len() + self.description.trim().len()
    }
}

/// Shared-taxonomy vulnerability class (e.g. `sql-injection`).
#[derive(
    Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_lowercase())
    }

    /// Fallback for rules with no taxonomy mapping. Scoped to the agent so
    /// unmapped rules from different tools never merge by accident.
    pub fn unmapped(agent: &AgentName, rule_id: &str) -> Self {
        Self(format!("unmapped:{}:{}", agent, rule_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unmapped(&self) -> bool {
        self.0.starts_with("unmapped:")
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Review state of a consensus finding. Only `Open` is produced here; the
/// others are set by downstream review tooling.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    #[default]
    Open,
    Fixed,
    Ignored,
    FalsePositive,
}

/// Deduplicated finding produced from one cluster of raw findings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusFinding {
    pub id: FindingId,
    pub severity: Severity,
    pub category: Category,
    pub file: String,
    pub location: LineRange,
    pub score: f64,
    pub contributing_agents: AgentSet,
    /// `agent:rule` pairs of every member.
    pub rule_ids: BTreeSet<String>,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixSuggestion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    pub member_count: usize,
    /// Agents whose severity or category hint is in the minority within
    /// the cluster.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub conflicting_agents: AgentSet,
    /// How many of severity and category hint the members disagree on.
    #[serde(default)]
    pub disagreements: u8,
    #[serde(default)]
    pub status: FindingStatus,
}

impl ConsensusFinding {
    /// True when the contributing agents disagreed on anything.
    pub fn is_disputed(&self) -> bool {
        self.disagreements > 0
    }
}

/// Summary counters for one consensus pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusStats {
    pub raw_total: usize,
    pub skipped: usize,
    pub clusters: usize,
    pub multi_agent_clusters: usize,
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
    pub average_score: f64,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding() -> RawFinding {
        RawFinding {
            agent: AgentName::from("semgrep"),
            rule_id: "python.sqli".into(),
            severity: Severity::High,
            file: "app/db.py".into(),
            location: LineRange::line(12),
            title: "SQL injection".into(),
            description: String::new(),
            confidence: 0.9,
            fix: None,
            category_hint: None,
            references: Vec::new(),
        }
    }

    #[test]
    fn ranges_match_within_window() {
        let a = LineRange::line(10);
        assert!(a.within(&LineRange::line(12), 2));
        assert!(LineRange::line(12).within(&a, 2));
        assert!(!a.within(&LineRange::line(13), 2));
        assert!(LineRange::span(1, 20).within(&LineRange::line(5), 0));
    }

    #[test]
    fn defect_detects_malformed_findings() {
        assert_eq!(finding().defect(), None);

        let mut f = finding();
        f.file = " ".into();
        assert_eq!(f.defect(), Some("missing file path"));

        let mut f = finding();
        f.location = LineRange::span(9, 3);
        assert_eq!(f.defect(), Some("invalid line range"));

        let mut f = finding();
        f.location = LineRange::line(0);
        assert_eq!(f.defect(), Some("invalid line range"));

        let mut f = finding();
        f.confidence = f64::NAN;
        assert!(f.defect().is_some());

        let mut f = finding();
        f.confidence = 1.5;
        assert!(f.defect().is_some());
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Info);
        let parsed: Severity = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Severity::Medium);
    }
}
