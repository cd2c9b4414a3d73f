//! Three-tier classification pipeline.
//!
//! Uncategorized threads flow through:
//! 1. `heuristics::classify()`: built-in header and subject patterns (no LLM)
//! 2. `LlmClassifier::classify_batch()`: batched model calls for the rest
//! 3. `RuleEngine::evaluate()`: user rules, re-run over the whole window
//!
//! `ClassificationOrchestrator` sequences the stages and owns the writes.
//! User rules always have the final say.

pub mod buckets;
pub mod guard;
pub mod heuristics;
pub mod llm_classifier;
pub mod orchestrator;
pub mod rules;
pub mod types;

pub use buckets::BucketRegistry;
pub use guard::RunGuard;
pub use llm_classifier::LlmClassifier;
pub use orchestrator::ClassificationOrchestrator;
pub use rules::RuleEngine;
