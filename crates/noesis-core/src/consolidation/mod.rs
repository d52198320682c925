//! Consolidation (C6, §4.6): the three-phase Working→Semantic→Episodic→
//! Procedural pipeline, run as a retried, per-user unit ([`pipeline`]) by a
//! background scheduler that also coalesces concurrent on-demand requests
//! ([`periodic`]).

mod periodic;
pub mod phases;
mod pipeline;

pub use periodic::ConsolidationScheduler;
pub use pipeline::{run_cycle, ConsolidationReport, Trigger};
