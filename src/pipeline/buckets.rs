//! Bucket registry: seeds a user's default buckets.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::Bucket;
use crate::store::Database;

pub const IMPORTANT: &str = "Important";
pub const CAN_WAIT: &str = "Can wait";
pub const NEWSLETTER: &str = "Newsletter";
pub const AUTO_ARCHIVE: &str = "Auto-archive";

/// Seed data for one built-in bucket.
#[derive(Debug, Clone, Copy)]
pub struct DefaultBucket {
    pub name: &'static str,
    pub slug: &'static str,
    pub color: &'static str,
    pub sort_order: i64,
    /// Prompt wording for the model.
    pub guidance: &'static str,
}

pub const DEFAULT_BUCKETS: [DefaultBucket; 4] = [
    DefaultBucket {
        name: IMPORTANT,
        slug: "important",
        color: "#0ea5e9",
        sort_order: 0,
        guidance: "human-sent or clearly requiring timely attention or action.",
    },
    DefaultBucket {
        name: CAN_WAIT,
        slug: "can-wait",
        color: "#64748b",
        sort_order: 1,
        guidance: "informational or low-urgency.",
    },
    DefaultBucket {
        name: NEWSLETTER,
        slug: "newsletter",
        color: "#16a34a",
        sort_order: 2,
        guidance: "bulk email or mailing list (usually has List-Unsubscribe or bulk markers).",
    },
    DefaultBucket {
        name: AUTO_ARCHIVE,
        slug: "auto-archive",
        color: "#a3a3a3",
        sort_order: 3,
        guidance: "automated transactional (receipts, notifications, tickets) or \"noreply@\".",
    },
];

/// Built-in prompt wording for a default bucket name.
pub fn builtin_guidance(name: &str) -> Option<&'static str> {
    DEFAULT_BUCKETS
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.guidance)
}

/// Lowercase, dash-separated slug for a display name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Ensures each user owns a bucket set before classification runs.
pub struct BucketRegistry {
    store: Arc<dyn Database>,
}

impl BucketRegistry {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Return the user's buckets, creating the four defaults on first use.
    ///
    /// A user who already owns any bucket gets their set back as-is; missing
    /// defaults are not topped up.
    pub async fn ensure_defaults(&self, user_id: &str) -> Result<Vec<Bucket>, DatabaseError> {
        let existing = self.store.list_buckets(user_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let now = Utc::now();
        let defaults: Vec<Bucket> = DEFAULT_BUCKETS
            .iter()
            .map(|d| Bucket {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                name: d.name.to_string(),
                slug: d.slug.to_string(),
                is_default: true,
                description: None,
                color: Some(d.color.to_string()),
                sort_order: d.sort_order,
                created_at: now,
            })
            .collect();

        // Insert is idempotent on (user_id, slug), so a concurrent first call
        // cannot double-seed; re-read to return whichever rows won.
        self.store.insert_buckets(&defaults).await?;
        info!(user_id, "Seeded default buckets");
        self.store.list_buckets(user_id).await
    }
}
