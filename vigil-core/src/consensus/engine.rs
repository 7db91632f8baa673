use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ConsensusConfig,
    cluster::{ClusterKey, cluster},
    score::{AgentWeights, consensus_score},
    taxonomy::CategoryTaxonomy,
};
use crate::{
    error::Result,
    types::{
        AgentName, AgentSet, Category, ConsensusFinding, ConsensusStats,
        FindingId, FindingStatus, RawFinding,
    },
};

/// Namespace for content-derived finding ids.
const FINDING_NAMESPACE: Uuid =
    Uuid::from_u128(0x6f1c_2a7e_93d4_4b0f_8e55_c1a9_0d3b_7e21);

/// Output of one consensus pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReport {
    pub findings: Vec<ConsensusFinding>,
    pub stats: ConsensusStats,
}

/// Clusters raw findings and scores each cluster.
#[derive(Clone)]
pub struct ConsensusEngine {
    window: u32,
    weights: AgentWeights,
    taxonomy: CategoryTaxonomy,
    priority: HashMap<AgentName, usize>,
    high_confidence: f64,
    medium_confidence: f64,
}

impl fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("window", &self.window)
            .field("weights", &self.weights)
            .field("priority_agents", &self.priority.len())
            .finish()
    }
}

struct Prepared<'a> {
    finding: &'a RawFinding,
    category: Category,
}

impl ConsensusEngine {
    pub fn new(config: &ConsensusConfig) -> Result<Self> {
        let taxonomy = CategoryTaxonomy::compile(&config.taxonomy)?;
        let priority = config
            .agent_priority
            .iter()
            .enumerate()
            .rev()
            .map(|(rank, agent)| (agent.clone(), rank))
            .collect();
        Ok(Self {
            window: config.proximity_window,
            weights: AgentWeights::new(
                config.agent_weights.clone(),
                config.default_weight,
            ),
            taxonomy,
            priority,
            high_confidence: config.high_confidence,
            medium_confidence: config.medium_confidence,
        })
    }

    /// Deduplicates `findings`. Malformed entries are logged and skipped;
    /// the pass itself never fails.
    pub fn analyze(&self, findings: &[RawFinding]) -> ConsensusReport {
        let mut stats = ConsensusStats {
            raw_total: findings.len(),
            ..ConsensusStats::default()
        };

        let mut prepared = Vec::with_capacity(findings.len());
        for finding in findings {
            if let Some(defect) = finding.defect() {
                warn!(
                    target: "vigil::consensus",
                    agent = %finding.agent,
                    rule = %finding.rule_id,
                    file = %finding.file,
                    defect,
                    "skipping malformed finding"
                );
                stats.skipped += 1;
                continue;
            }
            let category = self.taxonomy.resolve(
                &finding.agent,
                &finding.rule_id,
                finding.category_hint.as_deref(),
            );
            prepared.push(Prepared { finding, category });
        }

        // Canonical input order, so cluster membership and tie-breaks do
        // not depend on the order agents happened to report in.
        prepared.sort_by(|a, b| self.canonical_order(a, b));

        let keys: Vec<ClusterKey<'_>> = prepared
            .iter()
            .map(|p| ClusterKey {
                file: p.finding.file.as_str(),
                category: &p.category,
                location: p.finding.location,
            })
            .collect();

        let mut out: Vec<ConsensusFinding> = cluster(&keys, self.window)
            .into_iter()
            .map(|members| {
                let members: Vec<&Prepared<'_>> =
                    members.into_iter().map(|i| &prepared[i]).collect();
                self.merge(&members)
            })
            .collect();

        out.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.file.cmp(&b.file))
                .then_with(|| a.location.start.cmp(&b.location.start))
                .then_with(|| a.id.cmp(&b.id))
        });

        self.fill_stats(&mut stats, &out);
        debug!(
            target: "vigil::consensus",
            raw = stats.raw_total,
            skipped = stats.skipped,
            clusters = stats.clusters,
            multi_agent = stats.multi_agent_clusters,
            "consensus pass complete"
        );

        ConsensusReport {
            findings: out,
            stats,
        }
    }

    /// Statistics for findings that were merged earlier, e.g. a cached
    /// result. Skipped inputs are not known at this point and count as zero.
    pub fn summarize(&self, findings: &[ConsensusFinding]) -> ConsensusStats {
        let mut stats = ConsensusStats {
            raw_total: findings.iter().map(|f| f.member_count).sum(),
            ..ConsensusStats::default()
        };
        self.fill_stats(&mut stats, findings);
        stats
    }

    fn rank(&self, agent: &AgentName) -> usize {
        self.priority.get(agent).copied().unwrap_or(usize::MAX)
    }

    fn by_agent_priority(&self, a: &RawFinding, b: &RawFinding) -> Ordering {
        self.rank(&a.agent)
            .cmp(&self.rank(&b.agent))
            .then_with(|| a.agent.cmp(&b.agent))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    }

    fn canonical_order(&self, a: &Prepared<'_>, b: &Prepared<'_>) -> Ordering {
        let (fa, fb) = (a.finding, b.finding);
        fa.file
            .cmp(&fb.file)
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| fa.location.start.cmp(&fb.location.start))
            .then_with(|| fa.location.end.cmp(&fb.location.end))
            .then_with(|| fa.agent.cmp(&fb.agent))
            .then_with(|| fa.rule_id.cmp(&fb.rule_id))
            .then_with(|| fa.confidence.total_cmp(&fb.confidence))
            .then_with(|| fa.title.cmp(&fb.title))
            .then_with(|| fa.description.cmp(&fb.description))
    }

    fn merge(&self, members: &[&Prepared<'_>]) -> ConsensusFinding {
        let raws: Vec<&RawFinding> = members.iter().map(|p| p.finding).collect();
        let category = members[0].category.clone();

        let severity = raws
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(crate::types::Severity::Info);

        let located = raws
            .iter()
            .copied()
            .min_by(|a, b| {
                a.location
                    .width()
                    .cmp(&b.location.width())
                    .then_with(|| a.location.start.cmp(&b.location.start))
                    .then_with(|| self.by_agent_priority(a, b))
            })
            .unwrap_or(raws[0]);

        let detailed = raws
            .iter()
            .copied()
            .min_by(|a, b| {
                b.detail_len()
                    .cmp(&a.detail_len())
                    .then_with(|| self.by_agent_priority(a, b))
            })
            .unwrap_or(raws[0]);

        let mut by_priority = raws.clone();
        by_priority.sort_by(|a, b| self.by_agent_priority(a, b));
        let fix = by_priority.iter().find_map(|f| f.fix.clone());

        let contributing_agents: AgentSet =
            raws.iter().map(|f| f.agent.clone()).collect();
        let rule_ids: BTreeSet<String> = raws
            .iter()
            .map(|f| format!("{}:{}", f.agent, f.rule_id))
            .collect();
        let references: Vec<String> = raws
            .iter()
            .flat_map(|f| f.references.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let score = consensus_score(
            raws.iter().map(|f| (&f.agent, f.confidence)),
            &self.weights,
        );
        let (conflicting_agents, disagreements) = detect_conflicts(&raws);
        if disagreements > 0 {
            debug!(
                target: "vigil::consensus",
                file = %located.file,
                line = located.location.start,
                conflicting = conflicting_agents.len(),
                disagreements,
                "agents disagree on a merged finding"
            );
        }

        ConsensusFinding {
            id: finding_id(&category, &raws),
            severity,
            category,
            file: located.file.clone(),
            location: located.location,
            score,
            contributing_agents,
            rule_ids,
            title: detailed.title.clone(),
            description: detailed.description.clone(),
            fix,
            references,
            member_count: raws.len(),
            conflicting_agents,
            disagreements,
            status: FindingStatus::Open,
        }
    }

    fn fill_stats(&self, stats: &mut ConsensusStats, out: &[ConsensusFinding]) {
        stats.clusters = out.len();
        let mut total = 0.0;
        for finding in out {
            if finding.contributing_agents.len() > 1 {
                stats.multi_agent_clusters += 1;
            }
            if finding.score >= self.high_confidence {
                stats.high_confidence += 1;
            } else if finding.score >= self.medium_confidence {
                stats.medium_confidence += 1;
            } else {
                stats.low_confidence += 1;
            }
            *stats.by_severity.entry(finding.severity).or_default() += 1;
            *stats
                .by_category
                .entry(finding.category.to_string())
                .or_default() += 1;
            total += finding.score;
        }
        stats.average_score = if out.is_empty() {
            0.0
        } else {
            total / out.len() as f64
        };
    }
}

/// Agents holding a minority view on severity or hinted category, and how
/// many of those two dimensions have more than one view.
fn detect_conflicts(members: &[&RawFinding]) -> (AgentSet, u8) {
    let mut conflicting = AgentSet::new();
    let mut disagreements = 0;
    if minority_views(
        members.iter().map(|f| (f.severity, &f.agent)),
        &mut conflicting,
    ) {
        disagreements += 1;
    }
    if minority_views(
        members.iter().filter_map(|f| {
            f.category_hint
                .as_deref()
                .map(|hint| (Category::new(hint), &f.agent))
        }),
        &mut conflicting,
    ) {
        disagreements += 1;
    }
    (conflicting, disagreements)
}

/// Adds the agents behind every view held by fewer agents than the most
/// common one. Returns whether more than one view exists; on a tie nobody is
/// in the minority.
fn minority_views<'a, K: Ord>(
    views: impl Iterator<Item = (K, &'a AgentName)>,
    conflicting: &mut AgentSet,
) -> bool {
    let mut by_view: BTreeMap<K, BTreeSet<&AgentName>> = BTreeMap::new();
    for (view, agent) in views {
        by_view.entry(view).or_default().insert(agent);
    }
    if by_view.len() < 2 {
        return false;
    }
    let majority = by_view.values().map(BTreeSet::len).max().unwrap_or(0);
    for agents in by_view.values().filter(|agents| agents.len() < majority) {
        conflicting.extend(agents.iter().map(|agent| (*agent).clone()));
    }
    true
}

/// Stable across reruns: derived only from cluster content, with members in
/// canonical order.
fn finding_id(category: &Category, members: &[&RawFinding]) -> FindingId {
    let mut key = String::new();
    key.push_str(category.as_str());
    for f in members {
        key.push('\u{1f}');
        key.push_str(&format!(
            "{}\u{1e}{}\u{1e}{}\u{1e}{}\u{1e}{}",
            f.agent, f.rule_id, f.file, f.location.start, f.location.end
        ));
    }
    FindingId(Uuid::new_v5(&FINDING_NAMESPACE, key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consensus::TaxonomyRule,
        types::{FixSuggestion, LineRange, Severity},
    };

    fn raw(agent: &str, rule: &str, line: u32, confidence: f64) -> RawFinding {
        RawFinding {
            agent: AgentName::from(agent),
            rule_id: rule.into(),
            severity: Severity::Medium,
            file: "a.go".into(),
            location: LineRange::line(line),
            title: format!("{agent} title"),
            description: String::new(),
            confidence,
            fix: None,
            category_hint: Some("sql-injection".into()),
            references: Vec::new(),
        }
    }

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            agent_weights: [
                (AgentName::from("x"), 0.9),
                (AgentName::from("y"), 0.7),
            ]
            .into(),
            agent_priority: vec![AgentName::from("y"), AgentName::from("x")],
            ..ConsensusConfig::default()
        }
    }

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(&config()).unwrap()
    }

    #[test]
    fn agreeing_agents_merge_and_score() {
        let report = engine().analyze(&[raw("x", "X1", 10, 0.8), raw("y", "Y9", 10, 0.6)]);
        assert_eq!(report.findings.len(), 1);
        let f = &report.findings[0];
        assert!((f.score - 0.8376).abs() < 1e-12);
        assert_eq!(f.contributing_agents.len(), 2);
        assert_eq!(f.member_count, 2);
        assert_eq!(report.stats.multi_agent_clusters, 1);
        assert_eq!(report.stats.high_confidence, 1);
    }

    #[test]
    fn single_agent_cluster_kept() {
        let report = engine().analyze(&[raw("x", "X1", 10, 0.8)]);
        assert_eq!(report.findings.len(), 1);
        assert!((report.findings[0].score - 0.72).abs() < 1e-12);
    }

    #[test]
    fn malformed_findings_are_skipped_not_fatal() {
        let mut broken = raw("y", "Y1", 10, 0.6);
        broken.file.clear();
        let mut nan = raw("y", "Y2", 10, 0.6);
        nan.confidence = f64::NAN;

        let report = engine().analyze(&[broken, raw("x", "X1", 10, 0.8), nan]);
        assert_eq!(report.stats.raw_total, 3);
        assert_eq!(report.stats.skipped, 2);
        assert_eq!(report.findings.len(), 1);
    }

    #[test]
    fn output_is_identical_regardless_of_input_order() {
        let a = vec![
            raw("x", "X1", 10, 0.8),
            raw("y", "Y1", 11, 0.6),
            raw("x", "X2", 40, 0.3),
            raw("y", "Y2", 90, 0.9),
        ];
        let mut b = a.clone();
        b.reverse();

        let e = engine();
        let ra = serde_json::to_string(&e.analyze(&a)).unwrap();
        let rb = serde_json::to_string(&e.analyze(&b)).unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn representative_fields() {
        let mut wide = raw("x", "X1", 10, 0.8);
        wide.location = LineRange::span(8, 14);
        wide.severity = Severity::Low;
        wide.description = "much longer explanation of the problem".into();

        let mut narrow = raw("y", "Y1", 11, 0.6);
        narrow.severity = Severity::Critical;
        narrow.fix = Some(FixSuggestion {
            description: "use placeholders".into(),
            replacement: None,
        });

        let report = engine().analyze(&[wide, narrow]);
        let f = &report.findings[0];
        assert_eq!(f.severity, Severity::Critical);
        assert_eq!(f.location, LineRange::line(11));
        assert_eq!(f.title, "x title");
        assert_eq!(f.fix.as_ref().unwrap().description, "use placeholders");
    }

    #[test]
    fn text_ties_fall_back_to_agent_priority() {
        let report = engine().analyze(&[raw("x", "X1", 10, 0.8), raw("y", "Y1", 10, 0.6)]);
        // Titles have equal length; `y` is listed first in agent_priority.
        assert_eq!(report.findings[0].title, "y title");
    }

    #[test]
    fn taxonomy_decides_category_not_rule_id() {
        let mut cfg = config();
        cfg.taxonomy = vec![
            TaxonomyRule {
                agent: Some("x".into()),
                rule: Some("G201".into()),
                category: "sqli".into(),
                ..TaxonomyRule::default()
            },
            TaxonomyRule {
                agent: Some("y".into()),
                rule: Some("python.sql".into()),
                category: "sqli".into(),
                ..TaxonomyRule::default()
            },
        ];
        let engine = ConsensusEngine::new(&cfg).unwrap();

        let mut a = raw("x", "G201", 10, 0.8);
        a.category_hint = None;
        let mut b = raw("y", "python.sql", 10, 0.6);
        b.category_hint = None;
        let mut c = raw("y", "other-rule", 10, 0.6);
        c.category_hint = None;

        let report = engine.analyze(&[a, b, c]);
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[0].category.as_str(), "sqli");
        assert!(report.findings[1].category.is_unmapped());
    }

    #[test]
    fn findings_sorted_by_score_then_location() {
        let report = engine().analyze(&[
            raw("y", "Y1", 50, 0.5),
            raw("x", "X1", 10, 0.9),
            raw("y", "Y2", 90, 0.5),
        ]);
        let lines: Vec<u32> =
            report.findings.iter().map(|f| f.location.start).collect();
        assert_eq!(lines, vec![10, 50, 90]);
    }

    #[test]
    fn minority_severity_is_flagged_as_conflict() {
        let mut x = raw("x", "X1", 10, 0.8);
        x.severity = Severity::High;
        let mut y = raw("y", "Y1", 10, 0.6);
        y.severity = Severity::High;
        let mut z = raw("z", "Z1", 11, 0.5);
        z.severity = Severity::Low;

        let report = engine().analyze(&[x, y, z]);
        assert_eq!(report.findings.len(), 1);
        let f = &report.findings[0];
        assert_eq!(f.disagreements, 1);
        assert!(f.is_disputed());
        assert_eq!(f.conflicting_agents, [AgentName::from("z")].into());
        assert_eq!(f.severity, Severity::High);
    }

    #[test]
    fn split_opinions_count_without_a_minority() {
        let mut x = raw("x", "X1", 10, 0.8);
        x.severity = Severity::Critical;
        x.category_hint = Some("SQL-Injection".into());
        let y = raw("y", "Y1", 10, 0.6);

        let f = &engine().analyze(&[x, y]).findings[0];
        assert_eq!(f.disagreements, 1);
        assert!(f.conflicting_agents.is_empty());

        let agreed = &engine()
            .analyze(&[raw("x", "X1", 10, 0.8), raw("y", "Y1", 10, 0.6)])
            .findings[0];
        assert!(!agreed.is_disputed());
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let input = vec![raw("x", "X1", 10, 0.8), raw("y", "Y1", 10, 0.6)];
        let first = engine().analyze(&input);
        let second = engine().analyze(&input);
        assert_eq!(first.findings[0].id, second.findings[0].id);
    }
}
