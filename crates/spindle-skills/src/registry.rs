//! Skill registry and top-K selection.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::{SkillContract, SkillTier};

/// A scored selection candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillCandidate {
    /// Skill name.
    pub name: String,
    /// Relevance score (tag/keyword overlap).
    pub score: u32,
    /// Origin tier (tie-break).
    pub tier: SkillTier,
    /// One-line description, for the injection block.
    pub description: String,
}

/// Holds registered skill contracts and answers selection queries.
#[derive(Default)]
pub struct SkillRegistry {
    contracts: RwLock<HashMap<String, SkillContract>>,
}

impl SkillRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a contract.
    pub fn register(&self, contract: SkillContract) {
        debug!(skill = %contract.name, "skill registered");
        self.contracts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(contract.name.clone(), contract);
    }

    /// Look up one contract.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SkillContract> {
        self.contracts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Number of registered contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Score skills against a (sanitized) prompt and return the top K.
    ///
    /// Score is tag/keyword overlap with the prompt's words plus a bonus
    /// for the skill name itself appearing. Ties break by tier (project
    /// outranks pack outranks base), then by name.
    #[must_use]
    pub fn select_top_k(&self, prompt: &str, k: usize) -> Vec<SkillCandidate> {
        let words: Vec<String> = prompt
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
            .filter(|w| w.len() > 2)
            .map(str::to_owned)
            .collect();

        let contracts = self
            .contracts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut candidates: Vec<SkillCandidate> = contracts
            .values()
            .filter_map(|contract| {
                let mut score = 0u32;
                for tag in &contract.tags {
                    let tag = tag.to_lowercase();
                    if words.iter().any(|w| w == &tag) {
                        score += 2;
                    } else if words.iter().any(|w| w.contains(&tag) || tag.contains(w.as_str())) {
                        score += 1;
                    }
                }
                if words.iter().any(|w| w == &contract.name.to_lowercase()) {
                    score += 3;
                }
                (score > 0).then(|| SkillCandidate {
                    name: contract.name.clone(),
                    score,
                    tier: contract.tier,
                    description: contract.description.clone(),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.tier.cmp(&a.tier))
                .then(a.name.cmp(&b.name))
        });
        candidates.truncate(k);
        candidates
    }
}

impl std::fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("contracts", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SkillRegistry {
        let registry = SkillRegistry::new();
        registry.register(SkillContract::new(
            "refactor",
            SkillTier::Base,
            &["refactor", "rename", "cleanup"],
        ));
        registry.register(SkillContract::new(
            "test-writer",
            SkillTier::Pack,
            &["test", "coverage"],
        ));
        registry.register(SkillContract::new(
            "project-style",
            SkillTier::Project,
            &["style", "cleanup"],
        ));
        registry
    }

    #[test]
    fn test_selection_scores_tags() {
        let registry = registry();
        let top = registry.select_top_k("please refactor the parser and add a test", 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].name, "refactor");
    }

    #[test]
    fn test_tier_breaks_ties() {
        let registry = registry();
        // "cleanup" matches both refactor (base) and project-style (project).
        let top = registry.select_top_k("cleanup", 2);
        assert_eq!(top[0].name, "project-style");
        assert_eq!(top[1].name, "refactor");
    }

    #[test]
    fn test_zero_scores_are_dropped() {
        let registry = registry();
        assert!(registry.select_top_k("completely unrelated prompt", 5).is_empty());
    }

    #[test]
    fn test_replace_on_reregister() {
        let registry = registry();
        registry.register(SkillContract::new(
            "refactor",
            SkillTier::Project,
            &["refactor"],
        ));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("refactor").unwrap().tier, SkillTier::Project);
    }
}
