//! Resource-map store
//!
//! Bidirectional mapping between a resource's identity inside its source
//! directory and the identity it is written under in the local addressing
//! FHIR server. The local id is never derived from the raw remote id, so two
//! directories both exposing `Organization/1` can never collide.

use crate::db::Database;
use crate::error::{McsdError, Result, StorageError};
use chrono::{DateTime, SecondsFormat, Utc};
use deadpool_sqlite::rusqlite::{self, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of `resource_map`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMapRecord {
    pub id: String,
    pub directory_id: String,
    pub resource_type: String,
    pub directory_resource_id: String,
    pub directory_resource_version: i64,
    pub update_client_resource_id: String,
    pub update_client_resource_version: i64,
    pub last_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Store for `resource_map` rows.
#[derive(Clone)]
pub struct ResourceMapStore {
    db: Database,
}

/// Maximum length of the per-directory namespace segment inside a local id.
/// With a 32-hex UUID token and the joining dash the total stays within the
/// 64-character FHIR id limit.
const NAMESPACE_MAX: usize = 20;

/// Reduces a directory id to the FHIR id character set (`A-Z a-z 0-9 - .`)
/// and bounds its length. The result prefixes every local id allocated for
/// that directory.
pub fn directory_namespace(directory_id: &str) -> String {
    let mut out: String = directory_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(NAMESPACE_MAX)
        .collect();

    while out.ends_with('-') || out.ends_with('.') {
        out.pop();
    }

    if out.is_empty() {
        out.push_str("dir");
    }
    out
}

fn new_local_id(directory_id: &str) -> String {
    format!(
        "{}-{}",
        directory_namespace(directory_id),
        Uuid::new_v4().simple()
    )
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl ResourceMapStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn lookup(
        &self,
        directory_id: &str,
        resource_type: &str,
        directory_resource_id: &str,
    ) -> Result<Option<ResourceMapRecord>> {
        let directory_id = directory_id.to_string();
        let resource_type = resource_type.to_string();
        let directory_resource_id = directory_resource_id.to_string();

        self.db
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT id, directory_id, resource_type, directory_resource_id,
                            directory_resource_version, update_client_resource_id,
                            update_client_resource_version, last_update, created_at, modified_at
                     FROM resource_map
                     WHERE directory_id = ?1 AND resource_type = ?2 AND directory_resource_id = ?3",
                    rusqlite::params![directory_id, resource_type, directory_resource_id],
                    extract_resource_map,
                )
                .optional()
            })
            .await
    }

    /// Reserves a local id for the remote resource, or returns the existing
    /// mapping. Concurrent allocations for the same key converge on one row
    /// through the unique constraint; the freshly generated id loses and the
    /// surviving row is returned.
    pub async fn allocate(
        &self,
        directory_id: &str,
        resource_type: &str,
        directory_resource_id: &str,
    ) -> Result<ResourceMapRecord> {
        let directory_id_owned = directory_id.to_string();
        let resource_type_owned = resource_type.to_string();
        let remote_id_owned = directory_resource_id.to_string();
        let row_id = Uuid::new_v4().to_string();
        let local_id = new_local_id(directory_id);
        let now = fmt_ts(Utc::now());

        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO resource_map
                         (id, directory_id, resource_type, directory_resource_id,
                          update_client_resource_id, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(directory_id, resource_type, directory_resource_id) DO NOTHING",
                    rusqlite::params![
                        row_id,
                        directory_id_owned,
                        resource_type_owned,
                        remote_id_owned,
                        local_id,
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;

        self.lookup(directory_id, resource_type, directory_resource_id)
            .await?
            .ok_or_else(|| {
                McsdError::Storage(StorageError::MapNotFound {
                    resource_type: resource_type.to_string(),
                    directory_resource_id: directory_resource_id.to_string(),
                })
            })
    }

    /// Records the versions observed and written during a successful apply.
    /// Both counters are guarded with `MAX()` so a replayed or out-of-order
    /// apply never regresses them.
    pub async fn record_versions(
        &self,
        map: &ResourceMapRecord,
        directory_resource_version: i64,
        update_client_resource_version: i64,
        t: DateTime<Utc>,
    ) -> Result<()> {
        let map_id = map.id.clone();
        let ts = fmt_ts(t);
        let now = fmt_ts(Utc::now());

        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE resource_map SET
                         directory_resource_version = MAX(directory_resource_version, ?2),
                         update_client_resource_version = MAX(update_client_resource_version, ?3),
                         last_update = ?4,
                         modified_at = ?5
                     WHERE id = ?1",
                    rusqlite::params![
                        map_id,
                        directory_resource_version,
                        update_client_resource_version,
                        ts,
                        now
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Removes a mapping. Callers delete the local resource first; the row
    /// only disappears once the local side is confirmed gone.
    pub async fn delete(&self, map: &ResourceMapRecord) -> Result<()> {
        let map_id = map.id.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "DELETE FROM resource_map WHERE id = ?1",
                    rusqlite::params![map_id],
                )?;
                Ok(())
            })
            .await
    }

    /// All mappings for a directory in deterministic order (type, then
    /// remote id) so that cleanup passes are replayable.
    pub async fn list_for_directory(&self, directory_id: &str) -> Result<Vec<ResourceMapRecord>> {
        let directory_id = directory_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, directory_id, resource_type, directory_resource_id,
                            directory_resource_version, update_client_resource_id,
                            update_client_resource_version, last_update, created_at, modified_at
                     FROM resource_map
                     WHERE directory_id = ?1
                     ORDER BY resource_type, directory_resource_id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![directory_id], extract_resource_map)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count_for_directory(&self, directory_id: &str) -> Result<i64> {
        let directory_id = directory_id.to_string();
        self.db
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM resource_map WHERE directory_id = ?1",
                    rusqlite::params![directory_id],
                    |row| row.get(0),
                )
            })
            .await
    }
}

fn extract_resource_map(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceMapRecord> {
    let last_update: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let modified_at: String = row.get(9)?;

    Ok(ResourceMapRecord {
        id: row.get(0)?,
        directory_id: row.get(1)?,
        resource_type: row.get(2)?,
        directory_resource_id: row.get(3)?,
        directory_resource_version: row.get(4)?,
        update_client_resource_id: row.get(5)?,
        update_client_resource_version: row.get(6)?,
        last_update: last_update.as_deref().and_then(parse_ts),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        modified_at: parse_ts(&modified_at).unwrap_or_else(Utc::now),
    })
}
