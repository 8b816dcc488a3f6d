//! Agent decision runtime (spec.md §4.1-§4.7): market ingestion, memory,
//! session gating, the LLM decider, and the scheduler that drives them.

pub mod book;
pub mod context;
pub mod kill_switch;
pub mod llm;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod session_gate;
pub mod types;
