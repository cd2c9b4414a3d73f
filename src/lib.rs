//! Inbox triage: heuristic, model, and rule-based thread classification.

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
