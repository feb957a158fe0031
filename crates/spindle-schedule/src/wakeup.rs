//! The schedule wakeup message (`spindle.schedule-wakeup.v1`).

use spindle_replay::{AnchorInfo, SessionProjection};

use crate::intent::ScheduleIntent;

/// Cap applied to anchor summary and next-steps lines.
const ANCHOR_TEXT_LIMIT: usize = 320;

/// Build the textual wakeup block passed into a child session.
///
/// `parent` is the parent session's projection (for inherited task/truth
/// counts) and `anchor` its last tape anchor, both omitted for
/// `continuity_mode = fresh`.
#[must_use]
pub fn build_wakeup_message(
    intent: &ScheduleIntent,
    run_index: u32,
    parent: Option<&SessionProjection>,
    anchor: Option<&AnchorInfo>,
) -> String {
    let inherited_spec = parent.is_some_and(|p| p.task.spec.is_some());
    let inherited_facts = parent.map_or(0, |p| p.truth.active_facts().len());

    let mut out = String::from("[Schedule Wakeup]\n");
    out.push_str(&format!("intent_id: {}\n", intent.intent_id));
    out.push_str(&format!("parent_session_id: {}\n", intent.parent_session_id));
    out.push_str(&format!("run_index: {run_index}\n"));
    out.push_str(&format!("reason: {}\n", intent.reason));
    out.push_str(&format!(
        "continuity_mode: {}\n",
        intent.continuity_mode.as_str()
    ));
    out.push_str(&format!(
        "time_zone: {}\n",
        intent.time_zone.as_deref().unwrap_or("none")
    ));
    out.push_str(&format!(
        "goal_ref: {}\n",
        intent.goal_ref.as_deref().unwrap_or("none")
    ));
    out.push_str(&format!(
        "inherited_task_spec: {}\n",
        if inherited_spec { "yes" } else { "no" }
    ));
    out.push_str(&format!("inherited_truth_facts: {inherited_facts}\n"));
    match anchor {
        Some(anchor) => {
            out.push_str("parent_anchor_id: last\n");
            out.push_str(&format!("parent_anchor_name: {}\n", anchor.name));
            out.push_str(&format!(
                "parent_anchor_summary: {}\n",
                clamp(&anchor.summary)
            ));
            out.push_str(&format!(
                "parent_anchor_next_steps: {}\n",
                clamp(&anchor.next_steps)
            ));
        },
        None => {
            out.push_str("parent_anchor_id: none\n");
            out.push_str("parent_anchor_name: none\n");
            out.push_str("parent_anchor_summary: none\n");
            out.push_str("parent_anchor_next_steps: none\n");
        },
    }
    out.push_str(
        "Please continue the task from this wakeup context and produce concrete progress.",
    );
    out
}

fn clamp(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= ANCHOR_TEXT_LIMIT {
        return text.to_owned();
    }
    chars[..ANCHOR_TEXT_LIMIT].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{ContinuityMode, IntentStatus};

    fn intent() -> ScheduleIntent {
        ScheduleIntent {
            intent_id: "i1".into(),
            parent_session_id: "parent".into(),
            reason: "ping".to_owned(),
            goal_ref: None,
            continuity_mode: ContinuityMode::Fresh,
            run_at: Some(1000),
            cron: None,
            time_zone: None,
            max_runs: 1,
            run_count: 0,
            next_run_at: Some(1000),
            status: IntentStatus::Active,
            convergence_condition: None,
            consecutive_errors: 0,
            lease_until_ms: None,
            last_error: None,
            last_evaluation_session_id: None,
            updated_at: 0,
            event_offset: 0,
        }
    }

    #[test]
    fn test_fresh_wakeup_block() {
        let message = build_wakeup_message(&intent(), 1, None, None);
        assert!(message.starts_with("[Schedule Wakeup]\n"));
        assert!(message.contains("intent_id: i1\n"));
        assert!(message.contains("run_index: 1\n"));
        assert!(message.contains("continuity_mode: fresh\n"));
        assert!(message.contains("time_zone: none\n"));
        assert!(message.contains("inherited_task_spec: no\n"));
        assert!(message.contains("parent_anchor_name: none\n"));
        assert!(message.ends_with("produce concrete progress."));
    }

    #[test]
    fn test_anchor_text_is_clamped() {
        let anchor = AnchorInfo {
            name: "handoff".to_owned(),
            summary: "s".repeat(1000),
            next_steps: "n".repeat(1000),
            turn: None,
            timestamp: 0,
        };
        let message = build_wakeup_message(&intent(), 1, None, Some(&anchor));
        let summary_line = message
            .lines()
            .find(|l| l.starts_with("parent_anchor_summary:"))
            .unwrap();
        assert!(summary_line.len() <= "parent_anchor_summary: ".len() + 320);
    }
}
