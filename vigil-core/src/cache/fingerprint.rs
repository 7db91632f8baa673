use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{AgentSet, ScanTarget};

/// Stable identity of a unit of cacheable work.
///
/// `content` covers repository, commit and file subset and addresses the
/// cache slot; `agents` covers the normalized agent set. Keeping them apart
/// lets a lookup find an entry computed with a superset of the agents it
/// needs.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub content: String,
    pub agents: String,
}

impl Fingerprint {
    pub fn compute(target: &ScanTarget, agents: &AgentSet) -> Self {
        let mut files: Vec<String> =
            target.files.iter().filter_map(|f| normalize_path(f)).collect();
        files.sort();
        files.dedup();

        let mut content = Sha256::new();
        update_field(&mut content, "repo", target.repository.id.trim());
        update_field(&mut content, "commit", target.commit.trim());
        for file in &files {
            update_field(&mut content, "file", file);
        }

        let mut agent_hasher = Sha256::new();
        for agent in agents {
            update_field(&mut agent_hasher, "agent", agent.as_str());
        }

        Self {
            content: hex::encode(content.finalize()),
            agents: hex::encode(agent_hasher.finalize()),
        }
    }

    /// Single digest over content and agent set.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hasher.update(b":");
        hasher.update(self.agents.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest())
    }
}

// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently.
fn update_field(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update(tag.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn normalize_path(raw: &str) -> Option<String> {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }
    if path.is_empty() { None } else { Some(path) }
}
