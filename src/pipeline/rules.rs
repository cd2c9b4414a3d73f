//! User rule engine: ordered pattern matching with final authority.
//!
//! Rules are evaluated by ascending priority and the first match wins.
//! A match carries a reference to the rule itself so callers resolve the
//! target bucket from `rule.bucket_id`, never from the reason text.

use tracing::debug;
use uuid::Uuid;

use crate::pipeline::types::{Rule, RuleType, Thread};

/// Priority given to rules flagged as high priority at creation.
pub const HIGH_PRIORITY: i64 = 1;

/// Priority for rules targeting a user-defined bucket.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Creation-time priority for a rule targeting the bucket with `slug`.
pub fn priority_for_bucket(slug: &str, high_priority: bool) -> i64 {
    if high_priority {
        return HIGH_PRIORITY;
    }
    match slug {
        "important" => 10,
        "can-wait" => 50,
        "newsletter" => 100,
        "auto-archive" => 200,
        _ => DEFAULT_PRIORITY,
    }
}

/// The first rule that matched a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    pub reason: String,
}

impl RuleMatch<'_> {
    pub fn rule_id(&self) -> Uuid {
        self.rule.id
    }

    pub fn bucket_id(&self) -> Uuid {
        self.rule.bucket_id
    }
}

/// A user's rules in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Build an engine, ordering rules by ascending priority.
    ///
    /// The sort is stable: equal priorities keep their input order, which the
    /// store supplies as creation time then id.
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    /// An engine with no rules (every evaluation returns `None`).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Return the first matching rule, if any.
    pub fn evaluate(&self, thread: &Thread) -> Option<RuleMatch<'_>> {
        let subject = thread.subject.as_deref().unwrap_or("").to_lowercase();
        let from = thread.from_address.as_deref().unwrap_or("").to_lowercase();
        let domain = thread.sender_domain().unwrap_or_default();

        for rule in &self.rules {
            let pattern = rule.pattern.trim().to_lowercase();

            let matched = match rule.rule_type {
                RuleType::FromEquals => !pattern.is_empty() && from.contains(&pattern),
                RuleType::FromDomain => !pattern.is_empty() && domain == pattern,
                RuleType::SubjectContains => !pattern.is_empty() && subject.contains(&pattern),
                RuleType::HasListUnsubscribe => thread.headers.list_unsubscribe,
            };

            if matched {
                let reason = match rule.rule_type {
                    RuleType::HasListUnsubscribe => format!("Matched {}", rule.rule_type),
                    _ => format!("Matched {}:{}", rule.rule_type, rule.pattern),
                };
                debug!(
                    thread_id = %thread.id,
                    rule_id = %rule.id,
                    priority = rule.priority,
                    "Thread matched user rule"
                );
                return Some(RuleMatch { rule, reason });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::pipeline::types::HeaderSignals;

    fn rule(rule_type: RuleType, pattern: &str, priority: i64) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            user_id: "user1".into(),
            bucket_id: Uuid::new_v4(),
            rule_type,
            pattern: pattern.into(),
            priority,
            created_at: Utc::now(),
        }
    }

    fn thread() -> Thread {
        Thread::new("thread1", "user1")
    }

    #[test]
    fn no_match_returns_none() {
        let engine = RuleEngine::new(vec![rule(RuleType::FromDomain, "another.com", 100)]);
        let t = thread().with_from("test@test.com");
        assert!(engine.evaluate(&t).is_none());
    }

    #[test]
    fn empty_engine_matches_nothing() {
        let t = thread().with_from("a@b.com").with_subject("anything");
        assert!(RuleEngine::empty().evaluate(&t).is_none());
    }

    #[test]
    fn from_domain_matches_display_form_sender() {
        let r = rule(RuleType::FromDomain, "Example.com", 100);
        let engine = RuleEngine::new(vec![r.clone()]);
        let t = thread().with_from("User <user@example.com>");

        let m = engine.evaluate(&t).unwrap();
        assert_eq!(m.rule_id(), r.id);
        assert_eq!(m.bucket_id(), r.bucket_id);
        assert!(m.reason.contains("FROM_DOMAIN:Example.com"));
    }

    #[test]
    fn from_domain_is_exact_not_suffix() {
        let engine = RuleEngine::new(vec![rule(RuleType::FromDomain, "example.com", 100)]);
        let t = thread().with_from("user@mail.example.com");
        assert!(engine.evaluate(&t).is_none());
    }

    #[test]
    fn from_equals_is_substring_containment() {
        let engine = RuleEngine::new(vec![rule(RuleType::FromEquals, "specific-user", 100)]);
        let t = thread().with_from("Specific-User@example.com");
        let m = engine.evaluate(&t).unwrap();
        assert!(m.reason.contains("FROM_EQUALS:specific-user"));
    }

    #[test]
    fn subject_contains_is_case_insensitive() {
        let engine = RuleEngine::new(vec![rule(RuleType::SubjectContains, "Important Update", 100)]);
        let t = thread().with_subject("This is an important update");
        assert!(engine.evaluate(&t).is_some());
    }

    #[test]
    fn has_list_unsubscribe_ignores_pattern() {
        let engine = RuleEngine::new(vec![rule(RuleType::HasListUnsubscribe, "whatever", 100)]);
        let with_header = thread().with_headers(HeaderSignals {
            list_unsubscribe: true,
            ..Default::default()
        });
        let m = engine.evaluate(&with_header).unwrap();
        assert_eq!(m.reason, "Matched HAS_LIST_UNSUBSCRIBE");
        assert!(engine.evaluate(&thread()).is_none());
    }

    #[test]
    fn empty_text_pattern_never_matches() {
        let engine = RuleEngine::new(vec![
            rule(RuleType::FromEquals, "  ", 1),
            rule(RuleType::SubjectContains, "", 2),
        ]);
        let t = thread().with_from("a@b.com").with_subject("hello");
        assert!(engine.evaluate(&t).is_none());
    }

    #[test]
    fn lower_priority_number_wins_regardless_of_input_order() {
        let newsletter = rule(RuleType::SubjectContains, "Newsletter", 100);
        let domain = rule(RuleType::FromDomain, "example.com", 1);
        let engine = RuleEngine::new(vec![newsletter, domain.clone()]);

        let t = thread().with_from("user@example.com").with_subject("Newsletter");
        let m = engine.evaluate(&t).unwrap();
        assert_eq!(m.rule_id(), domain.id);
        assert!(m.reason.contains("FROM_DOMAIN:example.com"));
    }

    #[test]
    fn equal_priorities_keep_input_order() {
        let first = rule(RuleType::SubjectContains, "invoice", 50);
        let second = rule(RuleType::FromDomain, "vendor.io", 50);
        let engine = RuleEngine::new(vec![first.clone(), second]);

        let t = thread().with_from("billing@vendor.io").with_subject("Invoice #42");
        assert_eq!(engine.evaluate(&t).unwrap().rule_id(), first.id);
    }

    #[test]
    fn priority_for_bucket_mapping() {
        assert_eq!(priority_for_bucket("important", false), 10);
        assert_eq!(priority_for_bucket("can-wait", false), 50);
        assert_eq!(priority_for_bucket("newsletter", false), 100);
        assert_eq!(priority_for_bucket("auto-archive", false), 200);
        assert_eq!(priority_for_bucket("receipts", false), DEFAULT_PRIORITY);
        assert_eq!(priority_for_bucket("auto-archive", true), HIGH_PRIORITY);
    }
}
