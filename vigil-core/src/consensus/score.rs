use std::collections::BTreeMap;

use crate::types::AgentName;

/// Fixed per-agent reliability weights.
#[derive(Clone, Debug)]
pub struct AgentWeights {
    weights: BTreeMap<AgentName, f64>,
    default_weight: f64,
}

impl AgentWeights {
    pub fn new(weights: BTreeMap<AgentName, f64>, default_weight: f64) -> Self {
        Self {
            weights,
            default_weight,
        }
    }

    pub fn weight(&self, agent: &AgentName) -> f64 {
        self.weights
            .get(agent)
            .copied()
            .unwrap_or(self.default_weight)
            .clamp(0.0, 1.0)
    }
}

/// Consensus score `1 - Π(1 - w·c)` over the agents of one cluster.
///
/// `evidence` yields one `(agent, confidence)` per member. An agent that
/// reports the same issue several times contributes its strongest `w·c` once,
/// so repetition by one tool is not mistaken for independent agreement.
/// Terms are multiplied in agent-name order, which keeps the result
/// bit-identical regardless of input order.
pub fn consensus_score<'a, I>(evidence: I, weights: &AgentWeights) -> f64
where
    I: IntoIterator<Item = (&'a AgentName, f64)>,
{
    let mut strongest: BTreeMap<&AgentName, f64> = BTreeMap::new();
    for (agent, confidence) in evidence {
        let term = (weights.weight(agent) * confidence).clamp(0.0, 1.0);
        strongest
            .entry(agent)
            .and_modify(|best| *best = best.max(term))
            .or_insert(term);
    }

    let miss = strongest
        .values()
        .fold(1.0_f64, |acc, term| acc * (1.0 - term));
    (1.0 - miss).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> AgentWeights {
        AgentWeights::new(
            [
                (AgentName::from("x"), 0.9),
                (AgentName::from("y"), 0.7),
            ]
            .into(),
            0.5,
        )
    }

    #[test]
    fn two_agents_agreeing() {
        let (x, y) = (AgentName::from("x"), AgentName::from("y"));
        let score = consensus_score([(&x, 0.8), (&y, 0.6)], &weights());
        assert!((score - 0.8376).abs() < 1e-12, "got {score}");
    }

    #[test]
    fn single_agent_is_unscaled() {
        let x = AgentName::from("x");
        let score = consensus_score([(&x, 0.8)], &weights());
        assert!((score - 0.72).abs() < 1e-12);
    }

    #[test]
    fn unknown_agent_uses_default_weight() {
        let z = AgentName::from("z");
        let score = consensus_score([(&z, 0.8)], &weights());
        assert!((score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn agreement_never_lowers_the_score() {
        let names: Vec<AgentName> =
            ["x", "y", "z", "q"].into_iter().map(AgentName::from).collect();
        let confidences = [0.3, 0.05, 0.9, 0.6];
        let w = weights();

        let mut previous = 0.0;
        for n in 1..=names.len() {
            let score = consensus_score(
                names.iter().zip(confidences).take(n),
                &w,
            );
            assert!(score >= previous, "{score} < {previous} at {n}");
            assert!(score <= 1.0);
            previous = score;
        }
    }

    #[test]
    fn repeated_reports_from_one_agent_count_once() {
        let x = AgentName::from("x");
        let once = consensus_score([(&x, 0.8)], &weights());
        let twice = consensus_score([(&x, 0.8), (&x, 0.4)], &weights());
        assert_eq!(once.to_bits(), twice.to_bits());
    }

    #[test]
    fn input_order_does_not_change_bits() {
        let (x, y) = (AgentName::from("x"), AgentName::from("y"));
        let z = AgentName::from("z");
        let w = weights();
        let a = consensus_score([(&x, 0.31), (&y, 0.77), (&z, 0.12)], &w);
        let b = consensus_score([(&z, 0.12), (&x, 0.31), (&y, 0.77)], &w);
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
