//! The four-tier data model (§3): [`Message`] (working), [`ExtractedFact`]
//! (semantic), [`EpisodicEvent`] (episodic), [`ProceduralPattern`]
//! (procedural), plus the planner/orchestrator value types.

mod context;
mod episodic;
mod fact;
mod message;
mod plan;
mod procedural;

pub use context::MemoryContext;
pub use episodic::EpisodicEvent;
pub use fact::{EntityType, ExtractedFact};
pub use message::{Message, Role};
pub use plan::{MemoryLayer, QueryKind, QueryPlan};
pub use procedural::{ProceduralPattern, Trigger, TriggerKind};
