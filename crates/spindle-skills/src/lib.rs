//! Spindle Skills - Skill contracts, selection, and tool access policy.
//!
//! Skill *contracts* declare what a skill may do (tool allow/deny lists),
//! how much it may spend (tool-call and token budgets), and how it
//! composes. The registry holds contracts registered by collaborators
//! (the file-system document loader is outside this crate); the selector
//! scores them against a prompt; the access gate enforces the policy
//! chain in front of every tool call.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod access;
mod contract;
mod registry;

pub use access::{
    AccessConfig, AccessContext, AccessError, AccessResult, EXEMPT_TOOLS, Mode, SkillUsage,
    ToolAccessGate, UsageWarning,
};
pub use contract::{SkillBudget, SkillContract, SkillTier, SkillTools};
pub use registry::{SkillCandidate, SkillRegistry};
