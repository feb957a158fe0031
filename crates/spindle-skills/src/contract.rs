//! Skill contract types.

use serde::{Deserialize, Serialize};

/// Where a skill comes from. Project skills outrank pack skills, which
/// outrank base skills, when selection scores tie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillTier {
    /// Shipped with the runtime.
    #[default]
    Base,
    /// Installed from a skill pack.
    Pack,
    /// Defined by the workspace.
    Project,
}

/// A skill's tool surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillTools {
    /// Tools the skill needs.
    pub required: Vec<String>,
    /// Tools the skill may use.
    pub optional: Vec<String>,
    /// Tools the skill must never use.
    pub denied: Vec<String>,
}

/// A skill's spend limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SkillBudget {
    /// Cap on tool calls while the skill is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u64>,
    /// Cap on tokens consumed while the skill is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// A skill contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SkillContract {
    /// Unique skill name.
    pub name: String,
    /// Origin tier.
    pub tier: SkillTier,
    /// Tags scored against the prompt during selection.
    pub tags: Vec<String>,
    /// One-line description.
    pub description: String,
    /// Tool allow/deny surface.
    pub tools: SkillTools,
    /// Spend limits.
    pub budget: SkillBudget,
    /// Artifacts the skill produces.
    pub outputs: Vec<String>,
    /// Skills this one composes with.
    pub composable_with: Vec<String>,
    /// Artifacts the skill consumes.
    pub consumes: Vec<String>,
    /// Cap on concurrent activations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Stability marker (e.g. `"experimental"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<String>,
    /// Rough cost hint for planners.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_hint: Option<String>,
}

impl SkillContract {
    /// Minimal contract with a name and tags.
    #[must_use]
    pub fn new(name: impl Into<String>, tier: SkillTier, tags: &[&str]) -> Self {
        Self {
            name: name.into(),
            tier,
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            ..Self::default()
        }
    }

    /// Whether the allow-list admits a tool.
    ///
    /// An empty allow surface (no required and no optional tools) admits
    /// everything not denied.
    #[must_use]
    pub fn allows_tool(&self, tool: &str) -> bool {
        if self.denies_tool(tool) {
            return false;
        }
        if self.tools.required.is_empty() && self.tools.optional.is_empty() {
            return true;
        }
        self.tools.required.iter().any(|t| t == tool)
            || self.tools.optional.iter().any(|t| t == tool)
    }

    /// Whether the skill explicitly denies a tool.
    #[must_use]
    pub fn denies_tool(&self, tool: &str) -> bool {
        self.tools.denied.iter().any(|t| t == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_surface_admits_everything() {
        let contract = SkillContract::new("review", SkillTier::Base, &["review"]);
        assert!(contract.allows_tool("read"));
        assert!(contract.allows_tool("exec"));
    }

    #[test]
    fn test_allow_and_deny() {
        let contract = SkillContract {
            tools: SkillTools {
                required: vec!["read".to_owned()],
                optional: vec!["exec".to_owned()],
                denied: vec!["exec".to_owned()],
            },
            ..SkillContract::new("audit", SkillTier::Pack, &[])
        };
        assert!(contract.allows_tool("read"));
        // Denied wins over optional.
        assert!(!contract.allows_tool("exec"));
        assert!(!contract.allows_tool("write"));
    }

    #[test]
    fn test_tier_ordering() {
        assert!(SkillTier::Base < SkillTier::Pack);
        assert!(SkillTier::Pack < SkillTier::Project);
    }
}
