//! Shared types for the classification pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bucket name a thread carries before any stage has classified it.
pub const UNCATEGORIZED: &str = "uncategorized";

// ── Threads ─────────────────────────────────────────────────────────

/// Header-derived flags recorded at ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSignals {
    /// A `List-Unsubscribe` header was present.
    #[serde(default)]
    pub list_unsubscribe: bool,
    /// Raw `Precedence` header value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precedence: Option<String>,
    /// A mailing-list header (`List-Id`, `X-Mailing-List`) was present.
    #[serde(default)]
    pub mailing_list: bool,
}

impl HeaderSignals {
    /// `Precedence: bulk`, compared case-insensitively.
    pub fn is_precedence_bulk(&self) -> bool {
        self.precedence
            .as_deref()
            .is_some_and(|p| p.trim().eq_ignore_ascii_case("bulk"))
    }

    /// Any marker of bulk or list mail.
    pub fn is_bulk(&self) -> bool {
        self.list_unsubscribe || self.is_precedence_bulk() || self.mailing_list
    }
}

/// Which pipeline stage decided a thread's current bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Heuristic,
    Rule,
    Llm,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Rule => "rule",
            Self::Llm => "llm",
        }
    }
}

impl fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heuristic" => Ok(Self::Heuristic),
            "rule" => Ok(Self::Rule),
            "llm" => Ok(Self::Llm),
            other => Err(format!("unknown classification source: '{other}'")),
        }
    }
}

/// Classification provenance. Always stored and cleared as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub source: ClassificationSource,
    pub reason: String,
    pub classified_at: DateTime<Utc>,
    /// Set only for rule-sourced decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
}

impl Provenance {
    pub fn heuristic(reason: impl Into<String>) -> Self {
        Self {
            source: ClassificationSource::Heuristic,
            reason: reason.into(),
            classified_at: Utc::now(),
            rule_id: None,
        }
    }

    pub fn llm(reason: impl Into<String>) -> Self {
        Self {
            source: ClassificationSource::Llm,
            reason: reason.into(),
            classified_at: Utc::now(),
            rule_id: None,
        }
    }

    pub fn rule(rule_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            source: ClassificationSource::Rule,
            reason: reason.into(),
            classified_at: Utc::now(),
            rule_id: Some(rule_id),
        }
    }
}

/// A mail conversation tracked for triage.
///
/// Content fields are owned by the ingestion side; `bucket` and
/// `provenance` are written only by the classification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Provider thread ID.
    pub id: String,
    pub user_id: String,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    /// Raw `From` header, e.g. `Alice <alice@example.com>`.
    pub from_address: Option<String>,
    pub from_domain: Option<String>,
    pub internal_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub headers: HeaderSignals,
    pub bucket: String,
    pub provenance: Option<Provenance>,
}

impl Thread {
    /// A fresh, uncategorized thread with no content.
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            subject: None,
            snippet: None,
            from_address: None,
            from_domain: None,
            internal_date: None,
            headers: HeaderSignals::default(),
            bucket: UNCATEGORIZED.to_string(),
            provenance: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    /// Set the sender and its derived domain.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        let from = from.into();
        self.from_domain = derive_domain(&from);
        self.from_address = Some(from);
        self
    }

    pub fn with_internal_date(mut self, at: DateTime<Utc>) -> Self {
        self.internal_date = Some(at);
        self
    }

    pub fn with_headers(mut self, headers: HeaderSignals) -> Self {
        self.headers = headers;
        self
    }

    /// Stored domain, or one derived from the sender when ingestion left it empty.
    /// Always lowercase.
    pub fn sender_domain(&self) -> Option<String> {
        self.from_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(str::to_lowercase)
            .or_else(|| self.from_address.as_deref().and_then(derive_domain))
    }

    pub fn is_uncategorized(&self) -> bool {
        self.bucket == UNCATEGORIZED
    }
}

/// Extract the lowercase domain from `Name <user@domain>` or a bare address.
pub fn derive_domain(from: &str) -> Option<String> {
    let email = match (from.find('<'), from.rfind('>')) {
        (Some(start), Some(end)) if end > start + 1 => &from[start + 1..end],
        _ => from,
    }
    .trim();

    let at = email.rfind('@')?;
    let domain = email[at + 1..].trim();
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_lowercase())
    }
}

// ── Buckets ─────────────────────────────────────────────────────────

/// A named triage category owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub slug: String,
    pub is_default: bool,
    /// Guidance shown to the model for user-defined buckets.
    pub description: Option<String>,
    pub color: Option<String>,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

// ── Rules ───────────────────────────────────────────────────────────

/// What a user rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// Case-insensitive substring of the sender address.
    FromEquals,
    /// Exact, case-insensitive match on the sender domain.
    FromDomain,
    /// Case-insensitive substring of the subject.
    SubjectContains,
    /// Thread carries a `List-Unsubscribe` header. Pattern is ignored.
    HasListUnsubscribe,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FromEquals => "FROM_EQUALS",
            Self::FromDomain => "FROM_DOMAIN",
            Self::SubjectContains => "SUBJECT_CONTAINS",
            Self::HasListUnsubscribe => "HAS_LIST_UNSUBSCRIBE",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FROM_EQUALS" => Ok(Self::FromEquals),
            "FROM_DOMAIN" => Ok(Self::FromDomain),
            "SUBJECT_CONTAINS" => Ok(Self::SubjectContains),
            "HAS_LIST_UNSUBSCRIBE" => Ok(Self::HasListUnsubscribe),
            other => Err(format!("unknown rule type: '{other}'")),
        }
    }
}

/// A user-authored pattern that assigns a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: Uuid,
    pub user_id: String,
    pub bucket_id: Uuid,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub pattern: String,
    /// Lower runs first.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

// ── Pipeline outputs ────────────────────────────────────────────────

/// One pending bucket assignment, applied inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationWrite {
    pub thread_id: String,
    pub bucket: String,
    pub provenance: Provenance,
}

/// Counts reported by a classification run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Threads at the sentinel bucket when the run started classifying.
    pub total_uncategorized: usize,
    /// Rule matches observed in the override pass, changed or not.
    pub rules: usize,
    /// Threads resolved by heuristics.
    pub heuristics: usize,
    /// Threads dispatched to the model.
    pub llm: usize,
}
