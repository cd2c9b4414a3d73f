//! `Database` trait: the async persistence interface for buckets, rules,
//! and threads.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{Bucket, ClassificationWrite, Rule, Thread};

/// Backend-agnostic store. Every read and write is scoped to one user.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Buckets ─────────────────────────────────────────────────────

    /// The user's buckets ordered by sort order, then name.
    async fn list_buckets(&self, user_id: &str) -> Result<Vec<Bucket>, DatabaseError>;

    async fn get_bucket(&self, user_id: &str, id: Uuid) -> Result<Option<Bucket>, DatabaseError>;

    /// Insert buckets atomically, skipping any whose `(user_id, slug)` already
    /// exists. Returns the number inserted.
    async fn insert_buckets(&self, buckets: &[Bucket]) -> Result<usize, DatabaseError>;

    /// Create a user-defined bucket placed after the existing ones.
    async fn create_bucket(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Bucket, DatabaseError>;

    /// Delete a bucket, its rules, and reset the threads filed under it.
    /// Returns `false` if the bucket did not exist.
    async fn delete_bucket(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    /// Rules by ascending priority, ties by creation time then id.
    async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError>;

    async fn create_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    /// Delete a rule and reset the threads it decided.
    /// Returns `false` if the rule did not exist.
    async fn delete_rule(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Insert or refresh a thread's content. Never touches bucket or provenance
    /// of an existing row.
    async fn upsert_thread(&self, thread: &Thread) -> Result<(), DatabaseError>;

    async fn get_thread(&self, user_id: &str, id: &str) -> Result<Option<Thread>, DatabaseError>;

    /// Most recent threads first (NULL dates last, then by id), optionally
    /// filtered by bucket name.
    async fn list_threads(
        &self,
        user_id: &str,
        bucket: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Thread>, DatabaseError>;

    /// Move the `n` most recent threads back to the sentinel bucket with
    /// provenance cleared, in one statement. Returns rows changed.
    async fn reset_recent_threads(&self, user_id: &str, n: usize) -> Result<usize, DatabaseError>;

    /// Apply bucket + provenance writes in one transaction. Writes for threads
    /// that no longer exist are skipped. Returns rows applied.
    async fn apply_classifications(
        &self,
        user_id: &str,
        writes: &[ClassificationWrite],
    ) -> Result<usize, DatabaseError>;
}
