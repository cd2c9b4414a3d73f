//! Built-in heuristics that run before the model.
//!
//! An ordered cascade, first match wins:
//! - bulk/list headers → Newsletter
//! - no-reply senders, transactional subjects → Auto-archive
//! - questions, approval requests → Important
//!
//! Anything else falls through to the LLM classifier. The cascade is pure:
//! no I/O, no clock, same input → same output.

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::buckets::{AUTO_ARCHIVE, IMPORTANT, NEWSLETTER};
use crate::pipeline::types::Thread;

static NO_REPLY_SENDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)no[\-_.]?reply@").unwrap());

static TRANSACTIONAL_SUBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)receipt|invoice|order|ticket|notification").unwrap());

static ATTENTION_SUBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)action required|please review|approval").unwrap());

/// A heuristic decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeuristicHit {
    pub bucket: &'static str,
    pub reason: &'static str,
}

/// Run the cascade against a thread. `None` means defer to the model.
pub fn classify(thread: &Thread) -> Option<HeuristicHit> {
    let subject = thread.subject.as_deref().unwrap_or("");
    let from = thread.from_address.as_deref().unwrap_or("");

    if thread.headers.is_bulk() {
        return Some(HeuristicHit {
            bucket: NEWSLETTER,
            reason: "Detected bulk/list via headers",
        });
    }

    if NO_REPLY_SENDER.is_match(from) || TRANSACTIONAL_SUBJECT.is_match(subject) {
        return Some(HeuristicHit {
            bucket: AUTO_ARCHIVE,
            reason: "Transactional or no-reply pattern",
        });
    }

    if subject.ends_with('?') || ATTENTION_SUBJECT.is_match(subject) {
        return Some(HeuristicHit {
            bucket: IMPORTANT,
            reason: "Likely requires attention (question/approval)",
        });
    }

    None
}
