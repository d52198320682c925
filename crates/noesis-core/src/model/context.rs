//! The orchestrator's read output: a bounded, rankable bundle of memory
//! drawn from whichever tiers the query plan named.

use serde::{Deserialize, Serialize};

use super::episodic::EpisodicEvent;
use super::fact::ExtractedFact;
use super::message::Message;
use super::plan::QueryPlan;
use super::procedural::ProceduralPattern;

/// Assembled, token-bounded memory handed back to the caller of
/// `RetrieveContext`.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryContext {
    pub working_messages: Vec<Message>,
    pub facts: Vec<ExtractedFact>,
    pub archived_messages: Vec<EpisodicEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_pattern: Option<ProceduralPattern>,
    pub query_plan: QueryPlan,
    pub total_tokens: u32,
    /// Set when one or more tiers missed the retrieval deadline; the
    /// context still contains whatever tiers completed in time.
    #[serde(default)]
    pub partial: bool,
}

impl MemoryContext {
    /// Deterministic, prompt-ready rendering: procedural instructions first,
    /// then working messages newest-last, then facts, then archived
    /// messages, matching the orchestrator's priority order
    /// (procedural > working > semantic > episodic).
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(pattern) = &self.applied_pattern {
            out.push_str(&pattern.instruction_template);
            out.push_str("\n\n");
        }

        if !self.facts.is_empty() {
            out.push_str("Known facts:\n");
            for fact in &self.facts {
                out.push_str(&format!("- {}: {}\n", fact.key, fact.value));
            }
            out.push('\n');
        }

        if !self.archived_messages.is_empty() {
            out.push_str("Relevant history:\n");
            for event in &self.archived_messages {
                out.push_str(&format!("- {}\n", event.content));
            }
            out.push('\n');
        }

        if !self.working_messages.is_empty() {
            out.push_str("Recent conversation:\n");
            for msg in &self.working_messages {
                out.push_str(&format!("{}: {}\n", msg.role, msg.content));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::Role;
    use crate::model::plan::{QueryKind, QueryPlan};

    fn empty_context() -> MemoryContext {
        MemoryContext {
            working_messages: vec![],
            facts: vec![],
            archived_messages: vec![],
            applied_pattern: None,
            query_plan: QueryPlan::for_kind(QueryKind::Continuation, 100),
            total_tokens: 0,
            partial: false,
        }
    }

    #[test]
    fn render_includes_working_messages() {
        let mut ctx = empty_context();
        ctx.working_messages
            .push(Message::new("u1", "c1", Role::User, "hello"));
        let rendered = ctx.render();
        assert!(rendered.contains("hello"));
    }

    #[test]
    fn render_puts_pattern_instructions_first() {
        let mut ctx = empty_context();
        ctx.applied_pattern = Some(ProceduralPattern::new(
            "u1",
            "p",
            "d",
            vec![],
            "ALWAYS CHECK THE DATABASE",
            0.5,
        ));
        ctx.working_messages
            .push(Message::new("u1", "c1", Role::User, "hi"));
        let rendered = ctx.render();
        assert!(rendered.find("ALWAYS CHECK").unwrap() < rendered.find("hi").unwrap());
    }

    #[test]
    fn empty_context_renders_empty_string() {
        assert_eq!(empty_context().render(), "");
    }
}
