//! Provider-directory refresher
//!
//! Periodically refreshes the set of known directories from a directory
//! provider: either an HTTP endpoint returning a FHIR Bundle of `Endpoint`
//! resources, or a local JSON file. Discovered entries are reconciled into
//! the registry; entries that disappear from the provider are marked removed
//! and scheduled for cleanup. Manually registered directories are never
//! touched.

use crate::config::ProviderConfig;
use crate::db::Database;
use crate::directory_registry::{DirectoryOrigin, DirectoryRegistry};
use crate::error::{McsdError, ProviderError, Result};
use crate::fhir;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use deadpool_sqlite::rusqlite;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

/// A `{id, endpoint}` pair advertised by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderDirectory {
    pub id: String,
    pub endpoint_address: String,
}

/// Where the directory set comes from.
#[derive(Debug, Clone)]
pub enum ProviderSource {
    Http(Url),
    File(PathBuf),
}

impl ProviderSource {
    pub fn from_config(config: &ProviderConfig) -> Result<Option<Self>> {
        if let Some(url) = &config.directories_provider_url {
            let url = Url::parse(url).map_err(|_| ProviderError::Unavailable {
                url: url.clone(),
            })?;
            return Ok(Some(ProviderSource::Http(url)));
        }
        if let Some(path) = &config.directory_urls_path {
            return Ok(Some(ProviderSource::File(path.clone())));
        }
        Ok(None)
    }

    fn key(&self) -> String {
        match self {
            ProviderSource::Http(url) => url.to_string(),
            ProviderSource::File(path) => format!("file://{}", path.display()),
        }
    }
}

/// Refreshes the registry from one provider source and tracks per-directory
/// churn in the linkage table.
pub struct DirectoryProviderRefresher {
    db: Database,
    registry: DirectoryRegistry,
    source: ProviderSource,
    client: reqwest::Client,
    backoff: std::time::Duration,
    cleanup_after_removal: Option<Duration>,
}

impl DirectoryProviderRefresher {
    /// `cleanup_delay` is how long after removal-from-provider a directory's
    /// local data survives; `None` disables removal-driven cleanup.
    pub fn new(
        db: Database,
        registry: DirectoryRegistry,
        source: ProviderSource,
        config: &ProviderConfig,
        cleanup_delay: Option<std::time::Duration>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .connect_timeout(std::time::Duration::from_secs(5))
            .user_agent(concat!("mcsd-update-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            db,
            registry,
            source,
            client,
            backoff: std::time::Duration::from_secs(config.backoff),
            cleanup_after_removal: cleanup_delay
                .map(|d| Duration::seconds(d.as_secs() as i64)),
        })
    }

    /// One refresh cycle: fetch, upsert, reconcile.
    #[tracing::instrument(name = "provider.refresh", skip_all)]
    pub async fn refresh(&self) -> Result<usize> {
        let directories = self.fetch().await?;
        let now = Utc::now();
        let provider_id = self.ensure_provider_row(now).await?;

        for directory in &directories {
            self.registry
                .upsert(
                    &directory.id,
                    &directory.endpoint_address,
                    DirectoryOrigin::Provider,
                )
                .await?;
            self.touch_linkage(&provider_id, &directory.id, now).await?;
        }

        self.reconcile_removed(&provider_id, &directories, now)
            .await?;

        info!(count = directories.len(), "Provider refresh finished");
        Ok(directories.len())
    }

    async fn fetch(&self) -> Result<Vec<ProviderDirectory>> {
        match &self.source {
            ProviderSource::Http(url) => match self.fetch_http(url).await {
                Ok(directories) => Ok(directories),
                // One retry after the configured backoff; beyond that the
                // next scheduler tick tries again.
                Err(McsdError::Provider(ProviderError::Unavailable { .. })) => {
                    tokio::time::sleep(self.backoff).await;
                    self.fetch_http(url).await
                }
                Err(e) => Err(e),
            },
            ProviderSource::File(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                let directories: Vec<ProviderDirectory> =
                    serde_json::from_str(&raw).map_err(|e| {
                        McsdError::Provider(ProviderError::InvalidPayload {
                            message: format!("directory file is not valid JSON: {e}"),
                        })
                    })?;
                Ok(directories)
            }
        }
    }

    /// Parses a Bundle of `Endpoint` resources: the endpoint id names the
    /// directory, `address` is its FHIR base.
    async fn fetch_http(&self, url: &Url) -> Result<Vec<ProviderDirectory>> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!(provider = %url, error = %e, "Provider fetch failed");
            McsdError::Provider(ProviderError::Unavailable {
                url: url.to_string(),
            })
        })?;

        if !response.status().is_success() {
            return Err(McsdError::Provider(ProviderError::Unavailable {
                url: format!("HTTP {} for {url}", response.status()),
            }));
        }

        let bundle: Value = response.json().await.map_err(|e| {
            McsdError::Provider(ProviderError::InvalidPayload {
                message: format!("provider response is not valid JSON: {e}"),
            })
        })?;

        let entries = fhir::bundle_entries(&bundle).map_err(|e| {
            McsdError::Provider(ProviderError::InvalidPayload {
                message: e.to_string(),
            })
        })?;

        let mut directories = Vec::new();
        for entry in entries {
            let Some(resource) = entry.get("resource") else {
                continue;
            };
            if resource.get("resourceType").and_then(Value::as_str) != Some("Endpoint") {
                continue;
            }
            let (Some(id), Some(address)) = (
                resource.get("id").and_then(Value::as_str),
                resource.get("address").and_then(Value::as_str),
            ) else {
                warn!("Endpoint entry without id or address, skipping");
                continue;
            };
            directories.push(ProviderDirectory {
                id: id.to_string(),
                endpoint_address: address.to_string(),
            });
        }

        Ok(directories)
    }

    async fn ensure_provider_row(&self, now: DateTime<Utc>) -> Result<String> {
        let url = self.source.key();
        let row_id = Uuid::new_v4().to_string();
        let ts = fmt_ts(now);

        let url_lookup = url.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO directory_providers (id, url, enabled, last_refresh_at, created_at, modified_at)
                     VALUES (?1, ?2, 1, ?3, ?3, ?3)
                     ON CONFLICT(url) DO UPDATE SET
                         last_refresh_at = excluded.last_refresh_at,
                         modified_at = excluded.modified_at",
                    rusqlite::params![row_id, url, ts],
                )?;
                conn.query_row(
                    "SELECT id FROM directory_providers WHERE url = ?1",
                    rusqlite::params![url_lookup],
                    |row| row.get(0),
                )
            })
            .await
    }

    async fn touch_linkage(
        &self,
        provider_id: &str,
        directory_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let provider_id = provider_id.to_string();
        let directory_id = directory_id.to_string();
        let ts = fmt_ts(now);

        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO directory_provider_directories
                         (provider_id, directory_id, first_seen_at, last_seen_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(provider_id, directory_id) DO UPDATE SET
                         last_seen_at = excluded.last_seen_at,
                         removed_at = NULL",
                    rusqlite::params![provider_id, directory_id, ts],
                )?;
                Ok(())
            })
            .await
    }

    /// Marks linkage rows whose directory vanished from the provider and
    /// schedules their local data for cleanup after the configured delay.
    async fn reconcile_removed(
        &self,
        provider_id: &str,
        present: &[ProviderDirectory],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let present_ids: Vec<String> = present.iter().map(|d| d.id.clone()).collect();
        let provider_id = provider_id.to_string();
        let ts = fmt_ts(now);

        let known: Vec<String> = self
            .db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT directory_id FROM directory_provider_directories
                     WHERE provider_id = ?1 AND removed_at IS NULL",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![provider_id.clone()], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;

                for directory_id in &rows {
                    if !present_ids.contains(directory_id) {
                        conn.execute(
                            "UPDATE directory_provider_directories
                             SET removed_at = ?3
                             WHERE provider_id = ?1 AND directory_id = ?2",
                            rusqlite::params![provider_id, directory_id, ts],
                        )?;
                    }
                }
                Ok(rows)
            })
            .await?;

        let Some(delay) = self.cleanup_after_removal else {
            return Ok(());
        };

        for directory_id in known {
            if present.iter().any(|d| d.id == directory_id) {
                continue;
            }

            let Some(record) = self.registry.get(&directory_id).await? else {
                continue;
            };
            // Manual registrations are outside the provider's authority.
            if record.origin == DirectoryOrigin::Manual {
                continue;
            }
            if record.deleted_at.is_none() {
                info!(
                    directory_id = %directory_id,
                    "Directory disappeared from provider, scheduling cleanup"
                );
                self.registry
                    .schedule_delete(&directory_id, now + delay)
                    .await?;
            }
        }

        Ok(())
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}
