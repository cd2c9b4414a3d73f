//! LLM classifier: one batch of threads, one model call.
//!
//! Sends a minimal projection of each thread (id, subject, sender domain,
//! snippet, header flags), never message bodies. The response must decode
//! as JSON matching the classification schema; any parse or validation
//! failure rejects the whole batch.
//!
//! Partitioning and concurrency belong to the caller.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MAX_LLM_BATCH_SIZE;
use crate::error::ClassifyError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, ResponseFormat};
use crate::pipeline::buckets::builtin_guidance;
use crate::pipeline::types::{Bucket, Thread};

/// Most results accepted in one response.
pub const MAX_RESULTS_PER_RESPONSE: usize = 50;

/// Longest reason accepted, in characters.
pub const MAX_REASON_CHARS: usize = 240;

/// Deterministic decoding.
const CLASSIFY_TEMPERATURE: f32 = 0.0;

const SCHEMA_NAME: &str = "classifications";

/// One validated model decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub thread_id: String,
    pub bucket: String,
    pub reason: String,
}

// ── Request projection ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadProjection<'a> {
    thread_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snippet: Option<&'a str>,
    headers: ProjectedHeaders<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectedHeaders<'a> {
    list_unsubscribe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    precedence: Option<&'a str>,
    mailing_list: bool,
}

impl<'a> From<&'a Thread> for ThreadProjection<'a> {
    fn from(thread: &'a Thread) -> Self {
        Self {
            thread_id: &thread.id,
            subject: thread.subject.as_deref(),
            from_domain: thread.sender_domain(),
            snippet: thread.snippet.as_deref(),
            headers: ProjectedHeaders {
                list_unsubscribe: thread.headers.list_unsubscribe,
                precedence: thread.headers.precedence.as_deref(),
                mailing_list: thread.headers.mailing_list,
            },
        }
    }
}

// ── Response shape ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBatch {
    classifications: Vec<RawClassification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawClassification {
    thread_id: String,
    bucket: String,
    reason: String,
}

/// Classifies batches of threads with a remote model.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    prompt_version: String,
    max_batch_size: usize,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, prompt_version: impl Into<String>) -> Self {
        Self {
            llm,
            prompt_version: prompt_version.into(),
            max_batch_size: MAX_LLM_BATCH_SIZE,
        }
    }

    /// Cap the threads accepted per call (never above the response item cap).
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max.clamp(1, MAX_LLM_BATCH_SIZE);
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Classify one batch into the user's buckets.
    ///
    /// Returned items are schema-valid but not checked for batch membership.
    pub async fn classify_batch(
        &self,
        threads: &[Thread],
        buckets: &[Bucket],
    ) -> Result<Vec<Classification>, ClassifyError> {
        if threads.is_empty() {
            return Ok(Vec::new());
        }
        if threads.len() > self.max_batch_size {
            return Err(ClassifyError::BatchTooLarge {
                size: threads.len(),
                max: self.max_batch_size,
            });
        }

        let allowed = allowed_bucket_names(buckets);
        if allowed.is_empty() {
            return Err(ClassifyError::NoBuckets);
        }

        let user_payload = build_user_payload(threads, &allowed)
            .map_err(|e| ClassifyError::InvalidResponse(format!("payload encoding: {e}")))?;

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(buckets, &self.prompt_version)),
            ChatMessage::user(user_payload),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_response_format(ResponseFormat::JsonSchema {
            name: SCHEMA_NAME.to_string(),
            schema: response_schema(&allowed),
            strict: true,
        });

        debug!(
            batch_size = threads.len(),
            model = self.llm.model_name(),
            "Dispatching classification batch"
        );

        let response = self.llm.complete(request).await?;

        parse_classifications(&response.content, &allowed).map_err(|e| {
            warn!(
                error = %e,
                raw_len = response.content.len(),
                "Rejecting classification batch"
            );
            ClassifyError::InvalidResponse(e)
        })
    }
}

/// Bucket names in display order, without duplicates.
fn allowed_bucket_names(buckets: &[Bucket]) -> Vec<&str> {
    let mut seen = HashSet::new();
    buckets
        .iter()
        .map(|b| b.name.as_str())
        .filter(|name| seen.insert(*name))
        .collect()
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the system prompt enumerating every allowed bucket.
fn build_system_prompt(buckets: &[Bucket], version: &str) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You are an email triage assistant. Classify each thread into exactly one bucket \
         with a short reason (<= 240 chars).\nBuckets:\n",
    );

    let mut seen = HashSet::new();
    for bucket in buckets.iter().filter(|b| seen.insert(b.name.as_str())) {
        let guidance = bucket
            .is_default
            .then(|| builtin_guidance(&bucket.name))
            .flatten()
            .map(str::to_string)
            .or_else(|| {
                bucket
                    .description
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "user-defined bucket; infer intent from its name.".to_string());
        prompt.push_str(&format!("- {}: {}\n", bucket.name, guidance));
    }

    prompt.push_str(
        "\nRules:\n\
         - Use only the provided fields (subject, fromDomain, snippet, headers).\n\
         - Prefer Newsletter when List-Unsubscribe/bulk markers are present.\n\
         - Prefer Auto-archive for noreply/receipts/notifications.\n\
         - Otherwise decide between Important vs Can wait based on likely urgency.\n\
         - Use a user-defined bucket when its description fits better than any default.\n\
         - Return one classification per input thread, using its exact threadId.\n\
         - Output MUST be valid JSON matching the provided schema. No extra text.\n",
    );
    prompt.push_str(&format!("\nPrompt version: {version}"));
    prompt
}

/// Serialize the thread projections and allowed bucket names.
fn build_user_payload(threads: &[Thread], allowed: &[&str]) -> Result<String, serde_json::Error> {
    let projections: Vec<ThreadProjection<'_>> = threads.iter().map(Into::into).collect();
    serde_json::to_string(&serde_json::json!({
        "threads": projections,
        "allowedBuckets": allowed,
    }))
}

/// JSON schema handed to the provider as the output constraint.
fn response_schema(allowed: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "classifications": {
                "type": "array",
                "maxItems": MAX_RESULTS_PER_RESPONSE,
                "items": {
                    "type": "object",
                    "properties": {
                        "threadId": { "type": "string" },
                        "bucket": { "type": "string", "enum": allowed },
                        "reason": { "type": "string", "maxLength": MAX_REASON_CHARS }
                    },
                    "required": ["threadId", "bucket", "reason"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["classifications"],
        "additionalProperties": false
    })
}

// ── Response validation ─────────────────────────────────────────────

/// Decode and validate a model response. Any violation fails the whole batch.
fn parse_classifications(raw: &str, allowed: &[&str]) -> Result<Vec<Classification>, String> {
    let batch: RawBatch =
        serde_json::from_str(raw.trim()).map_err(|e| format!("non-JSON or malformed output: {e}"))?;

    if batch.classifications.len() > MAX_RESULTS_PER_RESPONSE {
        return Err(format!(
            "{} classifications exceeds the limit of {MAX_RESULTS_PER_RESPONSE}",
            batch.classifications.len()
        ));
    }

    batch
        .classifications
        .into_iter()
        .map(|item| {
            if !allowed.contains(&item.bucket.as_str()) {
                return Err(format!(
                    "thread {} assigned to unknown bucket '{}'",
                    item.thread_id, item.bucket
                ));
            }
            let reason_len = item.reason.chars().count();
            if reason_len > MAX_REASON_CHARS {
                return Err(format!(
                    "thread {} reason is {reason_len} chars (max {MAX_REASON_CHARS})",
                    item.thread_id
                ));
            }
            Ok(Classification {
                thread_id: item.thread_id,
                bucket: item.bucket,
                reason: item.reason,
            })
        })
        .collect()
}
