use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ScanError},
    types::{AgentName, Category},
};

/// One mapping from an agent's rule vocabulary onto the shared taxonomy.
///
/// Exactly one of `rule` (exact id) or `pattern` (regex over the id) must be
/// set. Rules scoped to an `agent` take precedence over global ones.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaxonomyRule {
    #[serde(default)]
    pub agent: Option<AgentName>,
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    pub category: String,
}

#[derive(Clone, Debug)]
enum RuleMatcher {
    Exact(String),
    Pattern(Regex),
}

impl RuleMatcher {
    fn matches(&self, rule_id: &str) -> bool {
        match self {
            RuleMatcher::Exact(expected) => expected == rule_id,
            RuleMatcher::Pattern(re) => re.is_match(rule_id),
        }
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    agent: Option<AgentName>,
    matcher: RuleMatcher,
    category: Category,
}

/// Compiled taxonomy used to decide category equivalence between agents.
#[derive(Clone, Debug, Default)]
pub struct CategoryTaxonomy {
    scoped: Vec<CompiledRule>,
    global: Vec<CompiledRule>,
}

impl CategoryTaxonomy {
    pub fn compile(rules: &[TaxonomyRule]) -> Result<Self> {
        let mut taxonomy = Self::default();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.category.trim().is_empty() {
                return Err(ScanError::Config(format!(
                    "consensus.taxonomy[{idx}] has an empty category"
                )));
            }
            let matcher = match (&rule.rule, &rule.pattern) {
                (Some(exact), None) => RuleMatcher::Exact(exact.trim().to_string()),
                (None, Some(pattern)) => {
                    RuleMatcher::Pattern(Regex::new(pattern).map_err(|e| {
                        ScanError::Config(format!(
                            "consensus.taxonomy[{idx}] pattern is invalid: {e}"
                        ))
                    })?)
                }
                _ => {
                    return Err(ScanError::Config(format!(
                        "consensus.taxonomy[{idx}] needs exactly one of `rule` or `pattern`"
                    )));
                }
            };
            let compiled = CompiledRule {
                agent: rule.agent.clone(),
                matcher,
                category: Category::new(&rule.category),
            };
            if compiled.agent.is_some() {
                taxonomy.scoped.push(compiled);
            } else {
                taxonomy.global.push(compiled);
            }
        }
        Ok(taxonomy)
    }

    /// Configured mapping first, then the adapter's own hint, then an
    /// agent-scoped fallback that never matches other agents.
    pub fn resolve(
        &self,
        agent: &AgentName,
        rule_id: &str,
        hint: Option<&str>,
    ) -> Category {
        let rule_id = rule_id.trim();
        let scoped = self
            .scoped
            .iter()
            .filter(|r| r.agent.as_ref() == Some(agent));
        if let Some(rule) = scoped
            .chain(self.global.iter())
            .find(|r| r.matcher.matches(rule_id))
        {
            return rule.category.clone();
        }

        match hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(hint) => Category::new(hint),
            None => Category::unmapped(agent, rule_id),
        }
    }
}
