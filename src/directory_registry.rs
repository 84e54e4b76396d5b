//! Directory registry store
//!
//! Persistent state per remote directory: endpoint, health counters, ignore
//! flag, scheduled deletion and origin. Eligibility for updates and cleanup
//! is a pure function of the record and the policy constants, so the
//! scheduler can be tested without a database.

use crate::db::Database;
use crate::error::{McsdError, Result, StorageError};
use chrono::{DateTime, SecondsFormat, Utc};
use deadpool_sqlite::rusqlite::{self, OptionalExtension};
use serde::{Deserialize, Serialize};

/// How a directory entered the registry. Provider-sourced entries are
/// managed (and removed) by the refresher; manual entries never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryOrigin {
    Provider,
    Manual,
}

impl DirectoryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryOrigin::Provider => "provider",
            DirectoryOrigin::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "manual" => DirectoryOrigin::Manual,
            _ => DirectoryOrigin::Provider,
        }
    }
}

/// One row of `directory_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: String,
    pub endpoint_address: String,
    pub origin: DirectoryOrigin,
    /// Consecutive failed sync attempts since the last success.
    pub failed_sync_count: i64,
    /// Total failed attempts across the ignore window.
    pub failed_attempts: i64,
    pub last_success_sync: Option<DateTime<Utc>>,
    pub is_ignored: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Policy constants evaluated against a [`DirectoryRecord`]. All durations
/// in seconds.
#[derive(Debug, Clone, Copy)]
pub struct UpdatePolicy {
    pub stale_timeout: u64,
    pub ignore_after_success_timeout: u64,
    pub ignore_after_failed_attempts: u32,
    pub cleanup_after_success_timeout: u64,
}

impl UpdatePolicy {
    pub fn from_config(config: &crate::config::SchedulerConfig) -> Self {
        Self {
            stale_timeout: config.directory_stale_timeout,
            ignore_after_success_timeout: config.ignore_directory_after_success_timeout,
            ignore_after_failed_attempts: config.ignore_directory_after_failed_attempts_threshold,
            cleanup_after_success_timeout: config.cleanup_client_directory_after_success_timeout,
        }
    }
}

impl DirectoryRecord {
    /// Updates may be dispatched: not ignored and not past its deletion
    /// moment. Cleanup remains permitted for ignored directories.
    pub fn eligible_for_update(&self, now: DateTime<Utc>) -> bool {
        !self.is_ignored && !matches!(self.deleted_at, Some(at) if at <= now)
    }

    /// Never synced, or silent for longer than the stale timeout. Reported
    /// only; staleness does not suppress dispatch.
    pub fn is_stale(&self, policy: &UpdatePolicy, now: DateTime<Utc>) -> bool {
        match self.last_success_sync {
            None => true,
            Some(last) => age_secs(now, last) >= policy.stale_timeout,
        }
    }

    /// The ignore threshold has tripped: too many failed attempts, or a
    /// previously healthy directory silent past the success timeout.
    pub fn must_auto_ignore(&self, policy: &UpdatePolicy, now: DateTime<Utc>) -> bool {
        if self.failed_attempts >= policy.ignore_after_failed_attempts as i64 {
            return true;
        }
        match self.last_success_sync {
            Some(last) => age_secs(now, last) >= policy.ignore_after_success_timeout,
            None => false,
        }
    }

    /// Local data should be removed: the scheduled deletion moment passed,
    /// or the directory has been silent past the cleanup timeout.
    pub fn must_clean_up(&self, policy: &UpdatePolicy, now: DateTime<Utc>) -> bool {
        if matches!(self.deleted_at, Some(at) if at <= now) {
            return true;
        }
        match self.last_success_sync {
            Some(last) => age_secs(now, last) >= policy.cleanup_after_success_timeout,
            None => false,
        }
    }
}

fn age_secs(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    (now - then).num_seconds().max(0) as u64
}

/// Timestamps are persisted as fixed-width RFC 3339 UTC strings so that SQL
/// `MAX()` string comparison preserves chronological order.
fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Store for `directory_info` rows.
#[derive(Clone)]
pub struct DirectoryRegistry {
    db: Database,
}

impl DirectoryRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the directory, or refreshes its endpoint if already known.
    /// Origin and health counters of an existing row are left untouched.
    pub async fn upsert(
        &self,
        id: &str,
        endpoint_address: &str,
        origin: DirectoryOrigin,
    ) -> Result<DirectoryRecord> {
        let id = id.to_string();
        let endpoint = endpoint_address.to_string();
        let origin_str = origin.as_str().to_string();
        let now = fmt_ts(Utc::now());

        let lookup_id = id.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO directory_info (id, endpoint_address, origin, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         endpoint_address = excluded.endpoint_address,
                         modified_at = excluded.modified_at",
                    rusqlite::params![id, endpoint, origin_str, now],
                )?;
                Ok(())
            })
            .await?;

        self.get_required(&lookup_id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DirectoryRecord>> {
        let id = id.to_string();
        self.db
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT id, endpoint_address, origin, failed_sync_count, failed_attempts,
                            last_success_sync, is_ignored, deleted_at, created_at, modified_at
                     FROM directory_info WHERE id = ?1",
                    rusqlite::params![id],
                    extract_directory_record,
                )
                .optional()
            })
            .await
    }

    async fn get_required(&self, id: &str) -> Result<DirectoryRecord> {
        self.get(id).await?.ok_or_else(|| {
            McsdError::Storage(StorageError::DirectoryNotFound { id: id.to_string() })
        })
    }

    pub async fn list_all(&self) -> Result<Vec<DirectoryRecord>> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, endpoint_address, origin, failed_sync_count, failed_attempts,
                            last_success_sync, is_ignored, deleted_at, created_at, modified_at
                     FROM directory_info ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], extract_directory_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Directories the scheduler may dispatch update passes against.
    pub async fn list_eligible_for_update(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DirectoryRecord>> {
        let all = self.list_all().await?;
        Ok(all
            .into_iter()
            .filter(|d| d.eligible_for_update(now))
            .collect())
    }

    /// Directories whose local data must be removed under the policy.
    pub async fn list_eligible_for_cleanup(
        &self,
        now: DateTime<Utc>,
        policy: &UpdatePolicy,
    ) -> Result<Vec<DirectoryRecord>> {
        let all = self.list_all().await?;
        Ok(all
            .into_iter()
            .filter(|d| d.must_clean_up(policy, now))
            .collect())
    }

    /// Records a fully successful pass: counters reset, the watermark moves
    /// forward (never backward), and a failure-tripped ignore is lifted.
    pub async fn mark_success(&self, id: &str, t: DateTime<Utc>) -> Result<()> {
        let id = id.to_string();
        let ts = fmt_ts(t);
        let now = fmt_ts(Utc::now());

        let id_for_query = id.clone();
        let changed = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET
                         failed_sync_count = 0,
                         failed_attempts = 0,
                         is_ignored = 0,
                         last_success_sync = CASE
                             WHEN last_success_sync IS NULL THEN ?2
                             ELSE MAX(last_success_sync, ?2)
                         END,
                         modified_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![id_for_query, ts, now],
                )
            })
            .await?;

        if changed == 0 {
            return Err(McsdError::Storage(StorageError::DirectoryNotFound { id }));
        }
        Ok(())
    }

    /// Records a failed pass. Both counters increment; when the failed
    /// attempts reach `ignore_threshold` the ignore flag is set in the same
    /// statement, so the Nth failure and the flag are atomic.
    pub async fn mark_failure(&self, id: &str, ignore_threshold: u32) -> Result<DirectoryRecord> {
        let id = id.to_string();
        let now = fmt_ts(Utc::now());

        let lookup_id = id.clone();
        let changed = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET
                         failed_sync_count = failed_sync_count + 1,
                         failed_attempts = failed_attempts + 1,
                         is_ignored = CASE
                             WHEN failed_attempts + 1 >= ?2 THEN 1
                             ELSE is_ignored
                         END,
                         modified_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![id, ignore_threshold, now],
                )
            })
            .await?;

        if changed == 0 {
            return Err(McsdError::Storage(StorageError::DirectoryNotFound {
                id: lookup_id,
            }));
        }
        self.get_required(&lookup_id).await
    }

    pub async fn mark_ignored(&self, id: &str) -> Result<()> {
        self.set_ignored(id, true).await
    }

    /// Administrative lift of the ignore flag; also resets the attempt
    /// counter so the directory gets a fresh ignore window.
    pub async fn unignore(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = fmt_ts(Utc::now());
        let lookup_id = id.clone();
        let changed = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET is_ignored = 0, failed_attempts = 0, modified_at = ?2
                     WHERE id = ?1",
                    rusqlite::params![id, now],
                )
            })
            .await?;
        if changed == 0 {
            return Err(McsdError::Storage(StorageError::DirectoryNotFound {
                id: lookup_id,
            }));
        }
        Ok(())
    }

    async fn set_ignored(&self, id: &str, ignored: bool) -> Result<()> {
        let id = id.to_string();
        let now = fmt_ts(Utc::now());
        let lookup_id = id.clone();
        let changed = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET is_ignored = ?2, modified_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, ignored, now],
                )
            })
            .await?;
        if changed == 0 {
            return Err(McsdError::Storage(StorageError::DirectoryNotFound {
                id: lookup_id,
            }));
        }
        Ok(())
    }

    /// Schedules the directory's local data for removal at `at`.
    pub async fn schedule_delete(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let id = id.to_string();
        let ts = fmt_ts(at);
        let now = fmt_ts(Utc::now());
        let lookup_id = id.clone();
        let changed = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET deleted_at = ?2, modified_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, ts, now],
                )
            })
            .await?;
        if changed == 0 {
            return Err(McsdError::Storage(StorageError::DirectoryNotFound {
                id: lookup_id,
            }));
        }
        Ok(())
    }

    /// Administrative restore: clears a scheduled deletion and the failure
    /// counters, keeping existing resource mappings intact.
    pub async fn restore(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = fmt_ts(Utc::now());
        let lookup_id = id.clone();
        let changed = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET
                         deleted_at = NULL,
                         is_ignored = 0,
                         failed_attempts = 0,
                         failed_sync_count = 0,
                         modified_at = ?2
                     WHERE id = ?1",
                    rusqlite::params![id, now],
                )
            })
            .await?;
        if changed == 0 {
            return Err(McsdError::Storage(StorageError::DirectoryNotFound {
                id: lookup_id,
            }));
        }
        Ok(())
    }

    /// Removes the directory record entirely. The caller is responsible for
    /// having removed the mapped local resources first (see the cleanup
    /// pipeline).
    pub async fn purge(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let deleted = self
            .db
            .with_connection(move |conn| {
                conn.execute(
                    "DELETE FROM directory_info WHERE id = ?1",
                    rusqlite::params![id],
                )
            })
            .await?;
        Ok(deleted > 0)
    }

    /// Resets health counters after a policy-driven (non-purge) cleanup.
    pub async fn reset_counters(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = fmt_ts(Utc::now());
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE directory_info SET
                         failed_sync_count = 0,
                         failed_attempts = 0,
                         last_success_sync = NULL,
                         deleted_at = NULL,
                         modified_at = ?2
                     WHERE id = ?1",
                    rusqlite::params![id, now],
                )?;
                Ok(())
            })
            .await
    }
}

fn extract_directory_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectoryRecord> {
    let origin: String = row.get(2)?;
    let last_success_sync: Option<String> = row.get(5)?;
    let deleted_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let modified_at: String = row.get(9)?;

    Ok(DirectoryRecord {
        id: row.get(0)?,
        endpoint_address: row.get(1)?,
        origin: DirectoryOrigin::parse(&origin),
        failed_sync_count: row.get(3)?,
        failed_attempts: row.get(4)?,
        last_success_sync: last_success_sync.as_deref().and_then(parse_ts),
        is_ignored: row.get(6)?,
        deleted_at: deleted_at.as_deref().and_then(parse_ts),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        modified_at: parse_ts(&modified_at).unwrap_or_else(Utc::now),
    })
}
