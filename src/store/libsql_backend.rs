//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Multi-statement writes run
//! inside libsql transactions so bucket and provenance columns always land
//! together.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::buckets::slugify;
use crate::pipeline::types::{
    Bucket, ClassificationSource, ClassificationWrite, HeaderSignals, Provenance, Rule, RuleType,
    Thread, UNCATEGORIZED,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// Writes are serialized through `write_lock` so a transaction never
/// interleaves with another task's statements on the shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width UTC form, so text ordering matches time ordering.
fn sortable_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

/// Map a libsql Row to a Bucket. Column order matches BUCKET_COLUMNS.
fn row_to_bucket(row: &libsql::Row) -> Result<Bucket, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("bucket.id: {e}")))?;
    let user_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("bucket.user_id: {e}")))?;
    let name: String = row.get(2).map_err(|e| DatabaseError::Query(format!("bucket.name: {e}")))?;
    let slug: String = row.get(3).map_err(|e| DatabaseError::Query(format!("bucket.slug: {e}")))?;
    let is_default: i64 = row.get(4).unwrap_or(0);
    let description: Option<String> = row.get(5).ok();
    let color: Option<String> = row.get(6).ok();
    let sort_order: i64 = row.get(7).unwrap_or(0);
    let created_str: String = row.get(8).unwrap_or_default();

    Ok(Bucket {
        id: parse_uuid("bucket.id", &id_str)?,
        user_id,
        name,
        slug,
        is_default: is_default != 0,
        description,
        color,
        sort_order,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a Rule. Column order matches RULE_COLUMNS.
fn row_to_rule(row: &libsql::Row) -> Result<Rule, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("rule.id: {e}")))?;
    let user_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("rule.user_id: {e}")))?;
    let bucket_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("rule.bucket_id: {e}")))?;
    let type_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("rule.rule_type: {e}")))?;
    let pattern: String = row.get(4).unwrap_or_default();
    let priority: i64 = row.get(5).unwrap_or(100);
    let created_str: String = row.get(6).unwrap_or_default();

    let rule_type: RuleType = type_str.parse().map_err(DatabaseError::Serialization)?;

    Ok(Rule {
        id: parse_uuid("rule.id", &id_str)?,
        user_id,
        bucket_id: parse_uuid("rule.bucket_id", &bucket_str)?,
        rule_type,
        pattern,
        priority,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a Thread. Column order matches THREAD_COLUMNS.
///
/// Provenance is rebuilt only when `source` is present and valid; a row
/// with partial provenance reads back as unclassified provenance.
fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("thread.id: {e}")))?;
    let user_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("thread.user_id: {e}")))?;
    let subject: Option<String> = row.get(2).ok();
    let snippet: Option<String> = row.get(3).ok();
    let from_address: Option<String> = row.get(4).ok();
    let from_domain: Option<String> = row.get(5).ok();
    let internal_date = row
        .get::<String>(6)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s));
    let headers: HeaderSignals = row
        .get::<String>(7)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let bucket: String = row.get(8).unwrap_or_else(|_| UNCATEGORIZED.to_string());

    let source: Option<ClassificationSource> = row
        .get::<String>(9)
        .ok()
        .and_then(|s| s.parse().ok());
    let reason: Option<String> = row.get(10).ok();
    let classified_at: Option<String> = row.get(11).ok();
    let rule_id = row
        .get::<String>(12)
        .ok()
        .and_then(|s| Uuid::parse_str(&s).ok());

    let provenance = match (source, classified_at) {
        (Some(source), Some(at)) => Some(Provenance {
            source,
            reason: reason.unwrap_or_default(),
            classified_at: parse_datetime(&at),
            rule_id,
        }),
        _ => None,
    };

    Ok(Thread {
        id,
        user_id,
        subject,
        snippet,
        from_address,
        from_domain,
        internal_date,
        headers,
        bucket,
        provenance,
    })
}

/// Provenance columns as bind values: source, reason, classified_at, rule_id.
fn provenance_values(p: Option<&Provenance>) -> [libsql::Value; 4] {
    match p {
        Some(p) => [
            libsql::Value::Text(p.source.as_str().to_string()),
            libsql::Value::Text(p.reason.clone()),
            libsql::Value::Text(p.classified_at.to_rfc3339()),
            opt_text_owned(p.rule_id.map(|id| id.to_string())),
        ],
        None => [
            libsql::Value::Null,
            libsql::Value::Null,
            libsql::Value::Null,
            libsql::Value::Null,
        ],
    }
}

// ── Trait implementation ────────────────────────────────────────────

const BUCKET_COLUMNS: &str =
    "id, user_id, name, slug, is_default, description, color, sort_order, created_at";

const RULE_COLUMNS: &str = "id, user_id, bucket_id, rule_type, pattern, priority, created_at";

const THREAD_COLUMNS: &str = "id, user_id, subject, snippet, from_address, from_domain, internal_date, headers, bucket, source, reason, classified_at, rule_id";

/// Recency order shared by listing and reset: newest first, undated last.
const RECENCY_ORDER: &str = "internal_date IS NULL, internal_date DESC, id ASC";

/// Clears bucket and every provenance column together.
const RESET_ASSIGNMENT: &str =
    "bucket = ?1, source = NULL, reason = NULL, classified_at = NULL, rule_id = NULL";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Buckets ─────────────────────────────────────────────────────

    async fn list_buckets(&self, user_id: &str) -> Result<Vec<Bucket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BUCKET_COLUMNS} FROM buckets WHERE user_id = ?1 ORDER BY sort_order ASC, name ASC"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_buckets: {e}")))?;

        let mut buckets = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_buckets row: {e}")))?
        {
            buckets.push(row_to_bucket(&row)?);
        }
        Ok(buckets)
    }

    async fn get_bucket(&self, user_id: &str, id: Uuid) -> Result<Option<Bucket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE user_id = ?1 AND id = ?2"),
                params![user_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_bucket: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_bucket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_bucket row: {e}"))),
        }
    }

    async fn insert_buckets(&self, buckets: &[Bucket]) -> Result<usize, DatabaseError> {
        if buckets.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_buckets begin: {e}")))?;

        let mut inserted = 0usize;
        for bucket in buckets {
            let affected = tx
                .execute(
                    "INSERT INTO buckets (id, user_id, name, slug, is_default, description, color, sort_order, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (user_id, slug) DO NOTHING",
                    params![
                        bucket.id.to_string(),
                        bucket.user_id.as_str(),
                        bucket.name.as_str(),
                        bucket.slug.as_str(),
                        bucket.is_default as i64,
                        opt_text(bucket.description.as_deref()),
                        opt_text(bucket.color.as_deref()),
                        bucket.sort_order,
                        bucket.created_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_buckets: {e}")))?;
            inserted += affected as usize;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_buckets commit: {e}")))?;
        debug!(inserted, requested = buckets.len(), "Buckets inserted");
        Ok(inserted)
    }

    async fn create_bucket(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Bucket, DatabaseError> {
        let name = name.trim();
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(DatabaseError::Constraint(
                "bucket name must contain a letter or digit".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let conn = self.conn();

        let mut rows = conn
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM buckets WHERE user_id = ?1 AND slug = ?2),
                    (SELECT COALESCE(MAX(sort_order), -1) FROM buckets WHERE user_id = ?1)",
                params![user_id, slug.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_bucket lookup: {e}")))?;

        let (clash, max_order): (i64, i64) = match rows.next().await {
            Ok(Some(row)) => (row.get(0).unwrap_or(0), row.get(1).unwrap_or(-1)),
            Ok(None) => (0, -1),
            Err(e) => return Err(DatabaseError::Query(format!("create_bucket lookup row: {e}"))),
        };
        if clash > 0 {
            return Err(DatabaseError::Constraint(format!(
                "bucket '{slug}' already exists"
            )));
        }

        let bucket = Bucket {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            slug,
            is_default: false,
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from),
            color: None,
            sort_order: max_order + 1,
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO buckets (id, user_id, name, slug, is_default, description, color, sort_order, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?6, ?7)",
            params![
                bucket.id.to_string(),
                user_id,
                bucket.name.as_str(),
                bucket.slug.as_str(),
                opt_text(bucket.description.as_deref()),
                bucket.sort_order,
                bucket.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_bucket: {e}")))?;

        info!(user_id, bucket = %bucket.name, "Bucket created");
        Ok(bucket)
    }

    async fn delete_bucket(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_bucket begin: {e}")))?;

        let mut rows = tx
            .query(
                "SELECT name FROM buckets WHERE user_id = ?1 AND id = ?2",
                params![user_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_bucket lookup: {e}")))?;
        let name: String = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("delete_bucket name: {e}")))?,
            Ok(None) => {
                drop(rows);
                tx.rollback()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_bucket rollback: {e}")))?;
                return Ok(false);
            }
            Err(e) => return Err(DatabaseError::Query(format!("delete_bucket row: {e}"))),
        };
        drop(rows);

        let reset = tx
            .execute(
                &format!("UPDATE threads SET {RESET_ASSIGNMENT} WHERE user_id = ?2 AND bucket = ?3"),
                params![UNCATEGORIZED, user_id, name.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_bucket reset threads: {e}")))?;
        let rules = tx
            .execute(
                "DELETE FROM rules WHERE user_id = ?1 AND bucket_id = ?2",
                params![user_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_bucket rules: {e}")))?;
        tx.execute(
            "DELETE FROM buckets WHERE user_id = ?1 AND id = ?2",
            params![user_id, id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_bucket: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_bucket commit: {e}")))?;

        info!(user_id, bucket = %name, threads_reset = reset, rules_deleted = rules, "Bucket deleted");
        Ok(true)
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE user_id = ?1 ORDER BY priority ASC, created_at ASC, id ASC"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules row: {e}")))?
        {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn create_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO rules (id, user_id, bucket_id, rule_type, pattern, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rule.id.to_string(),
                    rule.user_id.as_str(),
                    rule.bucket_id.to_string(),
                    rule.rule_type.as_str(),
                    rule.pattern.as_str(),
                    rule.priority,
                    sortable_datetime(&rule.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_rule: {e}")))?;

        debug!(rule_id = %rule.id, rule_type = %rule.rule_type, priority = rule.priority, "Rule created");
        Ok(())
    }

    async fn delete_rule(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule begin: {e}")))?;

        let reset = tx
            .execute(
                &format!("UPDATE threads SET {RESET_ASSIGNMENT} WHERE user_id = ?2 AND rule_id = ?3"),
                params![UNCATEGORIZED, user_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule reset threads: {e}")))?;
        let deleted = tx
            .execute(
                "DELETE FROM rules WHERE user_id = ?1 AND id = ?2",
                params![user_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;

        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_rule rollback: {e}")))?;
            return Ok(false);
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule commit: {e}")))?;
        info!(user_id, rule_id = %id, threads_reset = reset, "Rule deleted");
        Ok(true)
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn upsert_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        let headers = serde_json::to_string(&thread.headers)
            .map_err(|e| DatabaseError::Serialization(format!("thread headers: {e}")))?;
        let [source, reason, classified_at, rule_id] =
            provenance_values(thread.provenance.as_ref());

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO threads (id, user_id, subject, snippet, from_address, from_domain, internal_date, headers, bucket, source, reason, classified_at, rule_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (user_id, id) DO UPDATE SET
                    subject = excluded.subject,
                    snippet = excluded.snippet,
                    from_address = excluded.from_address,
                    from_domain = excluded.from_domain,
                    internal_date = excluded.internal_date,
                    headers = excluded.headers",
                params![
                    thread.id.as_str(),
                    thread.user_id.as_str(),
                    opt_text(thread.subject.as_deref()),
                    opt_text(thread.snippet.as_deref()),
                    opt_text(thread.from_address.as_deref()),
                    opt_text_owned(thread.sender_domain()),
                    opt_text_owned(thread.internal_date.as_ref().map(sortable_datetime)),
                    headers,
                    thread.bucket.as_str(),
                    source,
                    reason,
                    classified_at,
                    rule_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_thread: {e}")))?;
        Ok(())
    }

    async fn get_thread(&self, user_id: &str, id: &str) -> Result<Option<Thread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ?1 AND id = ?2"),
                params![user_id, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_thread row: {e}"))),
        }
    }

    async fn list_threads(
        &self,
        user_id: &str,
        bucket: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Thread>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn();
        let query = match bucket {
            Some(bucket) => {
                conn.query(
                    &format!(
                        "SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ?1 AND bucket = ?2 ORDER BY {RECENCY_ORDER} LIMIT ?3"
                    ),
                    params![user_id, bucket, limit],
                )
                .await
            }
            None => {
                conn.query(
                    &format!(
                        "SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ?1 ORDER BY {RECENCY_ORDER} LIMIT ?2"
                    ),
                    params![user_id, limit],
                )
                .await
            }
        };
        let mut rows = query.map_err(|e| DatabaseError::Query(format!("list_threads: {e}")))?;

        let mut threads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_threads row: {e}")))?
        {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    async fn reset_recent_threads(&self, user_id: &str, n: usize) -> Result<usize, DatabaseError> {
        if n == 0 {
            return Ok(0);
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);

        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE threads SET {RESET_ASSIGNMENT}
                     WHERE user_id = ?2 AND id IN (
                        SELECT id FROM threads WHERE user_id = ?2 ORDER BY {RECENCY_ORDER} LIMIT ?3
                     )"
                ),
                params![UNCATEGORIZED, user_id, limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_recent_threads: {e}")))?;

        debug!(user_id, requested = n, changed, "Recent threads reset");
        Ok(changed as usize)
    }

    async fn apply_classifications(
        &self,
        user_id: &str,
        writes: &[ClassificationWrite],
    ) -> Result<usize, DatabaseError> {
        if writes.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_classifications begin: {e}")))?;

        let mut applied = 0usize;
        for write in writes {
            let [source, reason, classified_at, rule_id] =
                provenance_values(Some(&write.provenance));
            let affected = tx
                .execute(
                    "UPDATE threads SET bucket = ?1, source = ?2, reason = ?3, classified_at = ?4, rule_id = ?5
                     WHERE user_id = ?6 AND id = ?7",
                    params![
                        write.bucket.as_str(),
                        source,
                        reason,
                        classified_at,
                        rule_id,
                        user_id,
                        write.thread_id.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_classifications: {e}")))?;

            if affected == 0 {
                warn!(user_id, thread_id = %write.thread_id, "Skipping write for missing thread");
            } else {
                applied += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_classifications commit: {e}")))?;

        debug!(user_id, applied, skipped = writes.len() - applied, "Classifications committed");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::pipeline::types::ClassificationSource;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn make_thread(id: &str, minutes: i64) -> Thread {
        Thread::new(id, "user1")
            .with_subject(format!("Subject {id}"))
            .with_from("Alice <alice@example.com>")
            .with_internal_date(at(minutes))
    }

    fn make_rule(bucket_id: Uuid, rule_type: RuleType, pattern: &str, priority: i64) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            user_id: "user1".into(),
            bucket_id,
            rule_type,
            pattern: pattern.into(),
            priority,
            created_at: Utc::now(),
        }
    }

    fn write(thread_id: &str, bucket: &str, provenance: Provenance) -> ClassificationWrite {
        ClassificationWrite {
            thread_id: thread_id.into(),
            bucket: bucket.into(),
            provenance,
        }
    }

    // ── Bucket tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn create_bucket_assigns_slug_and_order() {
        let db = test_db().await;
        let first = db.create_bucket("user1", "Travel Plans", None).await.unwrap();
        let second = db
            .create_bucket("user1", "Receipts", Some("  Purchase receipts "))
            .await
            .unwrap();

        assert_eq!(first.slug, "travel-plans");
        assert!(!first.is_default);
        assert_eq!(first.sort_order, 0);
        assert_eq!(second.sort_order, 1);
        assert_eq!(second.description.as_deref(), Some("Purchase receipts"));

        let fetched = db.get_bucket("user1", first.id).await.unwrap().unwrap();
        assert_eq!(fetched, first);
    }

    #[tokio::test]
    async fn create_bucket_rejects_duplicate_slug() {
        let db = test_db().await;
        db.create_bucket("user1", "Travel", None).await.unwrap();
        let err = db.create_bucket("user1", "travel", None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        // Other users are unaffected
        db.create_bucket("user2", "Travel", None).await.unwrap();
    }

    #[tokio::test]
    async fn create_bucket_rejects_blank_name() {
        let db = test_db().await;
        let err = db.create_bucket("user1", "  !! ", None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn insert_buckets_is_idempotent_on_slug() {
        let db = test_db().await;
        let bucket = Bucket {
            id: Uuid::new_v4(),
            user_id: "user1".into(),
            name: "Important".into(),
            slug: "important".into(),
            is_default: true,
            description: None,
            color: Some("#0ea5e9".into()),
            sort_order: 0,
            created_at: Utc::now(),
        };
        assert_eq!(db.insert_buckets(&[bucket.clone()]).await.unwrap(), 1);

        let dup = Bucket {
            id: Uuid::new_v4(),
            ..bucket
        };
        assert_eq!(db.insert_buckets(&[dup]).await.unwrap(), 0);
        assert_eq!(db.list_buckets("user1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_bucket_scoped_to_owner() {
        let db = test_db().await;
        let bucket = db.create_bucket("user1", "Travel", None).await.unwrap();
        assert!(db.get_bucket("user2", bucket.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_bucket_resets_threads_and_drops_rules() {
        let db = test_db().await;
        let travel = db.create_bucket("user1", "Travel", None).await.unwrap();
        let rule = make_rule(travel.id, RuleType::FromDomain, "airline.com", 100);
        db.create_rule(&rule).await.unwrap();

        let mut filed = make_thread("t1", 0);
        filed.bucket = "Travel".into();
        filed.provenance = Some(Provenance::rule(rule.id, "Matched FROM_DOMAIN:airline.com"));
        db.upsert_thread(&filed).await.unwrap();
        db.upsert_thread(&make_thread("t2", 1)).await.unwrap();

        assert!(db.delete_bucket("user1", travel.id).await.unwrap());

        let t1 = db.get_thread("user1", "t1").await.unwrap().unwrap();
        assert!(t1.is_uncategorized());
        assert!(t1.provenance.is_none());
        assert!(db.list_rules("user1").await.unwrap().is_empty());
        assert!(db.get_bucket("user1", travel.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_bucket_returns_false() {
        let db = test_db().await;
        assert!(!db.delete_bucket("user1", Uuid::new_v4()).await.unwrap());
    }

    // ── Rule tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn list_rules_orders_by_priority_then_creation() {
        let db = test_db().await;
        let bucket = db.create_bucket("user1", "Travel", None).await.unwrap();

        let mut late = make_rule(bucket.id, RuleType::SubjectContains, "late", 50);
        late.created_at = at(10);
        let mut early = make_rule(bucket.id, RuleType::SubjectContains, "early", 50);
        early.created_at = at(0);
        let urgent = make_rule(bucket.id, RuleType::FromDomain, "boss.com", 1);

        db.create_rule(&late).await.unwrap();
        db.create_rule(&early).await.unwrap();
        db.create_rule(&urgent).await.unwrap();

        let patterns: Vec<String> = db
            .list_rules("user1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.pattern)
            .collect();
        assert_eq!(patterns, vec!["boss.com", "early", "late"]);
    }

    #[tokio::test]
    async fn delete_rule_resets_only_threads_it_decided() {
        let db = test_db().await;
        let bucket = db.create_bucket("user1", "Travel", None).await.unwrap();
        let rule = make_rule(bucket.id, RuleType::FromDomain, "airline.com", 100);
        let other = make_rule(bucket.id, RuleType::SubjectContains, "trip", 100);
        db.create_rule(&rule).await.unwrap();
        db.create_rule(&other).await.unwrap();

        let mut by_rule = make_thread("t1", 0);
        by_rule.bucket = "Travel".into();
        by_rule.provenance = Some(Provenance::rule(rule.id, "Matched FROM_DOMAIN:airline.com"));
        let mut by_other = make_thread("t2", 1);
        by_other.bucket = "Travel".into();
        by_other.provenance = Some(Provenance::rule(other.id, "Matched SUBJECT_CONTAINS:trip"));
        db.upsert_thread(&by_rule).await.unwrap();
        db.upsert_thread(&by_other).await.unwrap();

        assert!(db.delete_rule("user1", rule.id).await.unwrap());

        assert!(db.get_thread("user1", "t1").await.unwrap().unwrap().is_uncategorized());
        let t2 = db.get_thread("user1", "t2").await.unwrap().unwrap();
        assert_eq!(t2.bucket, "Travel");
        assert_eq!(t2.provenance.unwrap().rule_id, Some(other.id));
    }

    #[tokio::test]
    async fn delete_rule_of_other_user_is_noop() {
        let db = test_db().await;
        let bucket = db.create_bucket("user1", "Travel", None).await.unwrap();
        let rule = make_rule(bucket.id, RuleType::FromDomain, "airline.com", 100);
        db.create_rule(&rule).await.unwrap();

        assert!(!db.delete_rule("user2", rule.id).await.unwrap());
        assert_eq!(db.list_rules("user1").await.unwrap().len(), 1);
    }

    // ── Thread tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_round_trips_content() {
        let db = test_db().await;
        let thread = make_thread("t1", 0).with_headers(HeaderSignals {
            list_unsubscribe: true,
            precedence: Some("bulk".into()),
            mailing_list: false,
        });
        db.upsert_thread(&thread).await.unwrap();

        let fetched = db.get_thread("user1", "t1").await.unwrap().unwrap();
        assert_eq!(fetched.subject.as_deref(), Some("Subject t1"));
        assert_eq!(fetched.from_domain.as_deref(), Some("example.com"));
        assert_eq!(fetched.internal_date, Some(at(0)));
        assert!(fetched.headers.list_unsubscribe);
        assert!(fetched.is_uncategorized());
    }

    #[tokio::test]
    async fn upsert_update_preserves_classification() {
        let db = test_db().await;
        db.upsert_thread(&make_thread("t1", 0)).await.unwrap();
        db.apply_classifications(
            "user1",
            &[write("t1", "Important", Provenance::llm("Needs a reply"))],
        )
        .await
        .unwrap();

        let mut refreshed = make_thread("t1", 5).with_subject("Re: updated");
        refreshed.bucket = UNCATEGORIZED.into();
        db.upsert_thread(&refreshed).await.unwrap();

        let fetched = db.get_thread("user1", "t1").await.unwrap().unwrap();
        assert_eq!(fetched.subject.as_deref(), Some("Re: updated"));
        assert_eq!(fetched.bucket, "Important");
        assert_eq!(
            fetched.provenance.map(|p| p.source),
            Some(ClassificationSource::Llm)
        );
    }

    #[tokio::test]
    async fn list_threads_most_recent_first_nulls_last() {
        let db = test_db().await;
        db.upsert_thread(&make_thread("old", 0)).await.unwrap();
        db.upsert_thread(&make_thread("new", 60)).await.unwrap();
        db.upsert_thread(&Thread::new("undated", "user1")).await.unwrap();
        db.upsert_thread(&make_thread("mid", 30)).await.unwrap();

        let ids: Vec<String> = db
            .list_threads("user1", None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old", "undated"]);

        let limited = db.list_threads("user1", None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn list_threads_filters_by_bucket_and_user() {
        let db = test_db().await;
        db.upsert_thread(&make_thread("t1", 0)).await.unwrap();
        db.upsert_thread(&make_thread("t2", 1)).await.unwrap();
        db.upsert_thread(&Thread::new("x1", "user2")).await.unwrap();
        db.apply_classifications(
            "user1",
            &[write("t1", "Newsletter", Provenance::heuristic("bulk"))],
        )
        .await
        .unwrap();

        let sentinel = db.list_threads("user1", Some(UNCATEGORIZED), 10).await.unwrap();
        assert_eq!(sentinel.len(), 1);
        assert_eq!(sentinel[0].id, "t2");

        let news = db.list_threads("user1", Some("Newsletter"), 10).await.unwrap();
        assert_eq!(news.len(), 1);
        assert_eq!(news[0].id, "t1");
    }

    #[tokio::test]
    async fn reset_recent_threads_resets_exactly_n() {
        let db = test_db().await;
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            db.upsert_thread(&make_thread(id, i as i64)).await.unwrap();
        }
        let writes: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| write(id, "Can wait", Provenance::llm("FYI")))
            .collect();
        db.apply_classifications("user1", &writes).await.unwrap();

        let changed = db.reset_recent_threads("user1", 2).await.unwrap();
        assert_eq!(changed, 2);

        for id in ["d", "c"] {
            let t = db.get_thread("user1", id).await.unwrap().unwrap();
            assert!(t.is_uncategorized());
            assert!(t.provenance.is_none());
        }
        for id in ["b", "a"] {
            let t = db.get_thread("user1", id).await.unwrap().unwrap();
            assert_eq!(t.bucket, "Can wait");
            assert!(t.provenance.is_some());
        }
    }

    #[tokio::test]
    async fn apply_classifications_skips_missing_threads() {
        let db = test_db().await;
        db.upsert_thread(&make_thread("t1", 0)).await.unwrap();

        let applied = db
            .apply_classifications(
                "user1",
                &[
                    write("t1", "Important", Provenance::heuristic("question")),
                    write("ghost", "Important", Provenance::heuristic("question")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(applied, 1);

        let t1 = db.get_thread("user1", "t1").await.unwrap().unwrap();
        let provenance = t1.provenance.unwrap();
        assert_eq!(t1.bucket, "Important");
        assert_eq!(provenance.source, ClassificationSource::Heuristic);
        assert_eq!(provenance.reason, "question");
        assert!(provenance.rule_id.is_none());
    }

    #[tokio::test]
    async fn apply_classifications_records_rule_id() {
        let db = test_db().await;
        db.upsert_thread(&make_thread("t1", 0)).await.unwrap();
        let rule_id = Uuid::new_v4();

        db.apply_classifications(
            "user1",
            &[write("t1", "Travel", Provenance::rule(rule_id, "Matched FROM_DOMAIN:x"))],
        )
        .await
        .unwrap();

        let t1 = db.get_thread("user1", "t1").await.unwrap().unwrap();
        assert_eq!(t1.provenance.unwrap().rule_id, Some(rule_id));
    }

    #[tokio::test]
    async fn apply_classifications_does_not_cross_users() {
        let db = test_db().await;
        db.upsert_thread(&Thread::new("shared-id", "user2")).await.unwrap();

        let applied = db
            .apply_classifications(
                "user1",
                &[write("shared-id", "Important", Provenance::llm("x"))],
            )
            .await
            .unwrap();
        assert_eq!(applied, 0);
        assert!(
            db.get_thread("user2", "shared-id")
                .await
                .unwrap()
                .unwrap()
                .is_uncategorized()
        );
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_thread(&make_thread("t1", 0)).await.unwrap();
            db.apply_classifications(
                "user1",
                &[write("t1", "Important", Provenance::heuristic("question"))],
            )
            .await
            .unwrap();
        }
        assert!(path.parent().unwrap().is_dir());

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let thread = db.get_thread("user1", "t1").await.unwrap().unwrap();
        assert_eq!(thread.bucket, "Important");
        assert_eq!(
            thread.provenance.unwrap().source,
            ClassificationSource::Heuristic
        );

        // Reopening must not re-apply migrations.
        let mut rows = db
            .conn
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }
}
