//! The tool access policy chain.
//!
//! Checks run in a fixed order in front of every tool call:
//!
//! 1. `bash`/`shell` are blocked unconditionally (use `exec` instead).
//! 2. The workspace-wide deny-list (best-effort glob match).
//! 3. The active skill's allow-list, when enforcement is on. A fixed set
//!    of runtime tools is exempt so an agent can always inspect state,
//!    compact, or roll back.
//! 4. The session cost budget.
//! 5. The active skill's tool-call and token budgets, per enforcement
//!    mode (warn emits a one-time warning per skill).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::warn;

use spindle_core::{ErrorCode, SessionId};

use crate::contract::SkillContract;

/// Tools exempt from skill allow-list enforcement.
pub const EXEMPT_TOOLS: &[&str] = &[
    "skill_complete",
    "skill_load",
    "ledger_query",
    "cost_view",
    "tape_handoff",
    "tape_info",
    "tape_search",
    "session_compact",
    "rollback_last_patch",
];

/// Enforcement mode for a policy dimension (mirrors the config section;
/// converted at the runtime boundary).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// No checking.
    Off,
    /// Check; emit a one-time warning but allow.
    #[default]
    Warn,
    /// Check and reject.
    Enforce,
}

/// Access gate configuration.
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    /// Skill allow-list enforcement.
    pub allowed_tools_mode: Mode,
    /// Whether skill-declared denied tools are rejected.
    pub enforce_denied_tools: bool,
    /// Per-skill token budget enforcement.
    pub skill_max_tokens_mode: Mode,
    /// Per-skill tool-call budget enforcement.
    pub skill_max_tool_calls_mode: Mode,
    /// Workspace-wide tool deny patterns.
    pub command_deny_list: Vec<String>,
}

/// Errors (rejections) raised by the gate.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Raw shell access is never allowed.
    #[error("tool '{0}' is blocked; use 'exec' instead")]
    ShellBlocked(String),

    /// The workspace deny-list matched.
    #[error("tool '{0}' is denied by workspace policy")]
    DenyListed(String),

    /// The active skill's allow-list does not admit the tool.
    #[error("tool '{tool}' is not in skill '{skill}' allow-list")]
    NotInAllowList {
        /// The rejected tool.
        tool: String,
        /// The active skill.
        skill: String,
    },

    /// The session's cost budget is exhausted.
    #[error("session budget exceeded")]
    SessionBudgetExceeded,

    /// The active skill used up its tool-call budget.
    #[error("skill '{skill}' exceeded its tool-call budget of {limit}")]
    SkillMaxToolCalls {
        /// The active skill.
        skill: String,
        /// Its declared cap.
        limit: u64,
    },

    /// The active skill used up its token budget.
    #[error("skill '{skill}' exceeded its token budget of {limit}")]
    SkillMaxTokens {
        /// The active skill.
        skill: String,
        /// Its declared cap.
        limit: u64,
    },
}

impl ErrorCode for AccessError {
    fn code(&self) -> &'static str {
        match self {
            Self::ShellBlocked(_) => "tool_blocked_shell",
            Self::DenyListed(_) => "tool_blocked_denylist",
            Self::NotInAllowList { .. } => "tool_blocked_allowlist",
            Self::SessionBudgetExceeded => "limit_session_budget_exceeded",
            Self::SkillMaxToolCalls { .. } => "limit_skill_max_tool_calls",
            Self::SkillMaxTokens { .. } => "limit_skill_max_tokens",
        }
    }
}

/// Result type for gate decisions.
pub type AccessResult<T> = Result<T, AccessError>;

/// Per-call context the gate cannot know on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessContext<'a> {
    /// The active skill's contract, if a skill is active.
    pub active_skill: Option<&'a SkillContract>,
    /// Whether the session cost budget is exhausted.
    pub session_budget_blocked: bool,
}

/// A one-time warning produced in `Warn` mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageWarning {
    /// Which budget fired (`"max_tool_calls"` or `"max_tokens"` or
    /// `"allow_list"`).
    pub kind: &'static str,
    /// The skill concerned.
    pub skill: String,
    /// Human-readable message.
    pub message: String,
}

/// Per-skill activation accounting within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkillUsage {
    /// Tool calls made while the skill was active.
    pub tool_calls: u64,
    /// Tokens consumed while the skill was active.
    pub tokens: u64,
}

/// The gate itself.
pub struct ToolAccessGate {
    config: AccessConfig,
    deny: Option<GlobSet>,
    usage: Mutex<HashMap<(SessionId, String), SkillUsage>>,
    warned: Mutex<HashSet<(SessionId, String, &'static str)>>,
}

impl ToolAccessGate {
    /// Build a gate. Invalid deny patterns are skipped with a warning
    /// (the deny-list is best-effort by contract).
    #[must_use]
    pub fn new(config: AccessConfig) -> Self {
        let deny = if config.command_deny_list.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.command_deny_list {
                match Glob::new(pattern) {
                    Ok(glob) => {
                        builder.add(glob);
                    },
                    Err(err) => {
                        warn!(pattern, error = %err, "invalid deny pattern skipped");
                    },
                }
            }
            builder.build().ok()
        };
        Self {
            config,
            deny,
            usage: Mutex::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Run the policy chain for one tool call.
    ///
    /// # Errors
    ///
    /// Returns the first rejection in chain order; `Ok` carries any
    /// one-time warnings to surface as events.
    pub fn check_tool_access(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        ctx: &AccessContext<'_>,
    ) -> AccessResult<Vec<UsageWarning>> {
        let mut warnings = Vec::new();

        // 1. Raw shell is never allowed.
        let lowered = tool_name.to_lowercase();
        if lowered == "bash" || lowered == "shell" {
            return Err(AccessError::ShellBlocked(tool_name.to_owned()));
        }

        // 2. Workspace deny-list.
        if let Some(deny) = &self.deny
            && deny.is_match(tool_name)
        {
            return Err(AccessError::DenyListed(tool_name.to_owned()));
        }

        // 3. Skill allow/deny lists.
        if let Some(skill) = ctx.active_skill
            && !EXEMPT_TOOLS.contains(&tool_name)
        {
            if self.config.enforce_denied_tools && skill.denies_tool(tool_name) {
                return Err(AccessError::NotInAllowList {
                    tool: tool_name.to_owned(),
                    skill: skill.name.clone(),
                });
            }
            if self.config.allowed_tools_mode != Mode::Off && !skill.allows_tool(tool_name) {
                match self.config.allowed_tools_mode {
                    Mode::Enforce => {
                        return Err(AccessError::NotInAllowList {
                            tool: tool_name.to_owned(),
                            skill: skill.name.clone(),
                        });
                    },
                    Mode::Warn => {
                        if self.take_warning(session_id, &skill.name, "allow_list") {
                            warnings.push(UsageWarning {
                                kind: "allow_list",
                                skill: skill.name.clone(),
                                message: format!(
                                    "tool '{tool_name}' outside skill '{}' allow-list",
                                    skill.name
                                ),
                            });
                        }
                    },
                    Mode::Off => {},
                }
            }
        }

        // 4. Session cost budget.
        if ctx.session_budget_blocked {
            return Err(AccessError::SessionBudgetExceeded);
        }

        // 5. Skill spend budgets.
        if let Some(skill) = ctx.active_skill {
            let usage = self.usage(session_id, &skill.name);
            if let Some(limit) = skill.budget.max_tool_calls
                && usage.tool_calls >= limit
            {
                match self.config.skill_max_tool_calls_mode {
                    Mode::Enforce => {
                        return Err(AccessError::SkillMaxToolCalls {
                            skill: skill.name.clone(),
                            limit,
                        });
                    },
                    Mode::Warn => {
                        if self.take_warning(session_id, &skill.name, "max_tool_calls") {
                            warnings.push(UsageWarning {
                                kind: "max_tool_calls",
                                skill: skill.name.clone(),
                                message: format!(
                                    "skill '{}' passed its tool-call budget of {limit}",
                                    skill.name
                                ),
                            });
                        }
                    },
                    Mode::Off => {},
                }
            }
            if let Some(limit) = skill.budget.max_tokens
                && usage.tokens >= limit
            {
                match self.config.skill_max_tokens_mode {
                    Mode::Enforce => {
                        return Err(AccessError::SkillMaxTokens {
                            skill: skill.name.clone(),
                            limit,
                        });
                    },
                    Mode::Warn => {
                        if self.take_warning(session_id, &skill.name, "max_tokens") {
                            warnings.push(UsageWarning {
                                kind: "max_tokens",
                                skill: skill.name.clone(),
                                message: format!(
                                    "skill '{}' passed its token budget of {limit}",
                                    skill.name
                                ),
                            });
                        }
                    },
                    Mode::Off => {},
                }
            }
        }

        Ok(warnings)
    }

    /// Count a tool call against the active skill.
    pub fn record_tool_call(&self, session_id: &SessionId, skill: &str) {
        let mut usage = self
            .usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        usage
            .entry((session_id.clone(), skill.to_owned()))
            .or_default()
            .tool_calls += 1;
    }

    /// Count tokens against the active skill.
    pub fn record_tokens(&self, session_id: &SessionId, skill: &str, tokens: u64) {
        let mut usage = self
            .usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        usage
            .entry((session_id.clone(), skill.to_owned()))
            .or_default()
            .tokens += tokens;
    }

    /// Current usage for a (session, skill) pair.
    #[must_use]
    pub fn usage(&self, session_id: &SessionId, skill: &str) -> SkillUsage {
        self.usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(session_id.clone(), skill.to_owned()))
            .copied()
            .unwrap_or_default()
    }

    /// Drop all per-session accounting (teardown).
    pub fn clear_session(&self, session_id: &SessionId) {
        self.usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(sid, _), _| sid != session_id);
        self.warned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(sid, _, _)| sid != session_id);
    }

    /// True the first time a (session, skill, kind) warning is taken.
    fn take_warning(&self, session_id: &SessionId, skill: &str, kind: &'static str) -> bool {
        self.warned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((session_id.clone(), skill.to_owned(), kind))
    }
}

impl std::fmt::Debug for ToolAccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAccessGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{SkillBudget, SkillTier, SkillTools};

    fn skill_with_tools(allowed: &[&str]) -> SkillContract {
        SkillContract {
            tools: SkillTools {
                required: allowed.iter().map(|t| (*t).to_owned()).collect(),
                ..SkillTools::default()
            },
            ..SkillContract::new("writer", SkillTier::Base, &[])
        }
    }

    #[test]
    fn test_shell_is_always_blocked() {
        let gate = ToolAccessGate::new(AccessConfig::default());
        let err = gate
            .check_tool_access(&"s1".into(), "bash", &AccessContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "tool_blocked_shell");
        assert!(err.to_string().contains("use 'exec' instead"));
    }

    #[test]
    fn test_deny_list_glob() {
        let gate = ToolAccessGate::new(AccessConfig {
            command_deny_list: vec!["net_*".to_owned()],
            ..AccessConfig::default()
        });
        let err = gate
            .check_tool_access(&"s1".into(), "net_fetch", &AccessContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "tool_blocked_denylist");
        assert!(
            gate.check_tool_access(&"s1".into(), "read", &AccessContext::default())
                .is_ok()
        );
    }

    #[test]
    fn test_allow_list_enforced() {
        let gate = ToolAccessGate::new(AccessConfig {
            allowed_tools_mode: Mode::Enforce,
            ..AccessConfig::default()
        });
        let skill = skill_with_tools(&["read"]);
        let ctx = AccessContext {
            active_skill: Some(&skill),
            session_budget_blocked: false,
        };
        assert!(gate.check_tool_access(&"s1".into(), "read", &ctx).is_ok());
        let err = gate.check_tool_access(&"s1".into(), "write", &ctx).unwrap_err();
        assert_eq!(err.code(), "tool_blocked_allowlist");
        // Exempt tools bypass the allow-list.
        assert!(
            gate.check_tool_access(&"s1".into(), "session_compact", &ctx)
                .is_ok()
        );
    }

    #[test]
    fn test_allow_list_warns_once() {
        let gate = ToolAccessGate::new(AccessConfig {
            allowed_tools_mode: Mode::Warn,
            ..AccessConfig::default()
        });
        let skill = skill_with_tools(&["read"]);
        let ctx = AccessContext {
            active_skill: Some(&skill),
            session_budget_blocked: false,
        };
        let first = gate.check_tool_access(&"s1".into(), "write", &ctx).unwrap();
        assert_eq!(first.len(), 1);
        let second = gate.check_tool_access(&"s1".into(), "write", &ctx).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_budget_blocked_session() {
        let gate = ToolAccessGate::new(AccessConfig::default());
        let ctx = AccessContext {
            active_skill: None,
            session_budget_blocked: true,
        };
        let err = gate.check_tool_access(&"s1".into(), "read", &ctx).unwrap_err();
        assert_eq!(err.code(), "limit_session_budget_exceeded");
    }

    #[test]
    fn test_skill_tool_call_budget_enforced() {
        let gate = ToolAccessGate::new(AccessConfig {
            skill_max_tool_calls_mode: Mode::Enforce,
            ..AccessConfig::default()
        });
        let skill = SkillContract {
            budget: SkillBudget {
                max_tool_calls: Some(2),
                max_tokens: None,
            },
            ..SkillContract::new("limited", SkillTier::Base, &[])
        };
        let ctx = AccessContext {
            active_skill: Some(&skill),
            session_budget_blocked: false,
        };

        for _ in 0..2 {
            gate.check_tool_access(&"s1".into(), "read", &ctx).unwrap();
            gate.record_tool_call(&"s1".into(), "limited");
        }
        let err = gate.check_tool_access(&"s1".into(), "read", &ctx).unwrap_err();
        assert_eq!(err.code(), "limit_skill_max_tool_calls");
    }

    #[test]
    fn test_skill_token_budget_warns_once() {
        let gate = ToolAccessGate::new(AccessConfig {
            skill_max_tokens_mode: Mode::Warn,
            ..AccessConfig::default()
        });
        let skill = SkillContract {
            budget: SkillBudget {
                max_tool_calls: None,
                max_tokens: Some(100),
            },
            ..SkillContract::new("chatty", SkillTier::Base, &[])
        };
        let ctx = AccessContext {
            active_skill: Some(&skill),
            session_budget_blocked: false,
        };

        gate.record_tokens(&"s1".into(), "chatty", 150);
        let first = gate.check_tool_access(&"s1".into(), "read", &ctx).unwrap();
        assert_eq!(first[0].kind, "max_tokens");
        let second = gate.check_tool_access(&"s1".into(), "read", &ctx).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_clear_session_resets_warnings_and_usage() {
        let gate = ToolAccessGate::new(AccessConfig::default());
        gate.record_tool_call(&"s1".into(), "writer");
        gate.clear_session(&"s1".into());
        assert_eq!(gate.usage(&"s1".into(), "writer"), SkillUsage::default());
    }
}
