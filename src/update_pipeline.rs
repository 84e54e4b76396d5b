//! Per-directory update pipeline
//!
//! One pass: determine the watermark, page through type-level history (or a
//! `_lastUpdated` search where history is unsupported), translate identities
//! through the resource map, rewrite references, and upsert/delete against
//! the local FHIR server. Entry-level problems are skipped and counted;
//! structural problems abort the pass and leave the watermark unchanged.

use crate::cache::{CacheKey, MetadataCache};
use crate::config::{ClientConfig, SchedulerConfig};
use crate::directory_registry::{DirectoryRecord, DirectoryRegistry};
use crate::error::{DirectoryError, FhirError, McsdError, Result};
use crate::fhir::{self, EntryMethod, McsdResourceType, RemoteRef};
use crate::fhir_client::{DirectoryClient, Page};
use crate::local_writer::UpdateClientWriter;
use crate::resource_map::ResourceMapStore;
use crate::rewriter::{self, ReferenceContext};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lookback subtracted from the success watermark so that clock skew between
/// directory and client cannot hide events.
const WATERMARK_LOOKBACK_SECS: i64 = 60;

/// Counters emitted per pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PassCounters {
    pub entries_seen: u64,
    pub entries_written: u64,
    pub entries_deleted: u64,
    pub entries_skipped: u64,
    pub bytes_transferred: u64,
}

/// Terminal state of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PassOutcome {
    Success,
    Failed { error: String },
    Cancelled,
    DeadlineExceeded { made_progress: bool },
}

/// Structured record of one pass, retained by the scheduler's log ring.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub directory_id: String,
    pub outcome: PassOutcome,
    pub counters: PassCounters,
    pub started_at: DateTime<Utc>,
    pub wall_time_ms: u64,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.outcome == PassOutcome::Success
    }
}

/// The per-directory update job. All collaborators are injected at
/// construction; the scheduler owns one pipeline and runs it against many
/// directories.
pub struct UpdatePipeline {
    registry: DirectoryRegistry,
    maps: ResourceMapStore,
    writer: UpdateClientWriter,
    cache: Arc<dyn MetadataCache>,
    client_config: ClientConfig,
    ignore_threshold: u32,
    pass_deadline: Option<std::time::Duration>,
}

impl UpdatePipeline {
    pub fn new(
        registry: DirectoryRegistry,
        maps: ResourceMapStore,
        writer: UpdateClientWriter,
        cache: Arc<dyn MetadataCache>,
        client_config: ClientConfig,
        scheduler_config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            maps,
            writer,
            cache,
            client_config,
            ignore_threshold: scheduler_config.ignore_directory_after_failed_attempts_threshold,
            pass_deadline: scheduler_config.pass_deadline.map(std::time::Duration::from_secs),
        }
    }

    /// Runs one pass against the directory and updates its health record.
    /// Cancellation aborts without touching any counter.
    #[tracing::instrument(name = "update.pass", skip_all, fields(directory_id = %directory.id))]
    pub async fn run(
        &self,
        directory: &DirectoryRecord,
        cancel: &CancellationToken,
    ) -> PassReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut counters = PassCounters::default();

        let result = self
            .run_inner(directory, directory.last_success_sync, cancel, &mut counters)
            .await;

        let outcome = match result {
            Ok(()) => {
                // Lookback keeps the watermark slightly behind the wall
                // clock; mark_success never moves it backwards.
                let watermark = Utc::now() - ChronoDuration::seconds(WATERMARK_LOOKBACK_SECS);
                match self.registry.mark_success(&directory.id, watermark).await {
                    Ok(()) => PassOutcome::Success,
                    Err(e) => PassOutcome::Failed {
                        error: format!("pass succeeded but marking failed: {e}"),
                    },
                }
            }
            Err(McsdError::Cancelled) => PassOutcome::Cancelled,
            Err(McsdError::DeadlineExceeded) => {
                let made_progress =
                    counters.entries_written > 0 || counters.entries_deleted > 0;
                if !made_progress {
                    self.record_failure(directory).await;
                }
                PassOutcome::DeadlineExceeded { made_progress }
            }
            Err(e) => {
                if matches!(e, McsdError::Network(_) | McsdError::Directory(_)) {
                    // Re-probe a flapping directory instead of trusting its
                    // cached metadata.
                    self.cache.invalidate_directory(&directory.id).await;
                }
                self.record_failure(directory).await;
                PassOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let report = PassReport {
            directory_id: directory.id.clone(),
            outcome,
            counters,
            started_at,
            wall_time_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            outcome = ?report.outcome,
            seen = counters.entries_seen,
            written = counters.entries_written,
            deleted = counters.entries_deleted,
            skipped = counters.entries_skipped,
            bytes = counters.bytes_transferred,
            wall_time_ms = report.wall_time_ms,
            "Update pass finished"
        );

        report
    }

    async fn record_failure(&self, directory: &DirectoryRecord) {
        match self
            .registry
            .mark_failure(&directory.id, self.ignore_threshold)
            .await
        {
            Ok(record) if record.is_ignored && !directory.is_ignored => {
                warn!(
                    directory_id = %directory.id,
                    failed_attempts = record.failed_attempts,
                    "Directory crossed the failure threshold and is now ignored"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(directory_id = %directory.id, error = %e, "Failed to record failure"),
        }
    }

    async fn run_inner(
        &self,
        directory: &DirectoryRecord,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
        counters: &mut PassCounters,
    ) -> Result<()> {
        let client = DirectoryClient::new(&directory.endpoint_address, &self.client_config)?;
        let local_base = self.writer.base_url().clone();
        let ctx = ReferenceContext::new(client.base_url().clone(), local_base);

        let capability = self.capability(directory, &client).await?;
        let deadline_at = self.pass_deadline.map(|d| Instant::now() + d);

        for resource_type in McsdResourceType::ALL {
            if cancel.is_cancelled() {
                return Err(McsdError::Cancelled);
            }

            let use_history = capability
                .as_ref()
                .map(|c| fhir::capability_supports(c, resource_type, &["history-type"]))
                .unwrap_or(true);

            let entries = self
                .collect_entries(
                    &client,
                    resource_type,
                    since,
                    use_history,
                    cancel,
                    deadline_at,
                    counters,
                )
                .await?;

            self.apply_entries(directory, &client, &ctx, resource_type, entries, counters)
                .await?;
        }

        Ok(())
    }

    /// Fetches the directory's CapabilityStatement through the metadata
    /// cache. In strict mode every mCSD type must advertise the ITI-91
    /// interactions; otherwise a missing statement only disables the
    /// history/search decision.
    async fn capability(
        &self,
        directory: &DirectoryRecord,
        client: &DirectoryClient,
    ) -> Result<Option<Value>> {
        let key = CacheKey::new(&directory.id, "capability", client.base_url().as_str());
        let capability = match self.cache.get(&key).await {
            Some(cached) => Some(cached),
            None => match client.capability().await {
                Ok(capability) => {
                    self.cache.put(key, capability.clone()).await;
                    Some(capability)
                }
                Err(e) if self.client_config.strict_validation => return Err(e),
                Err(e) => {
                    warn!(directory_id = %directory.id, error = %e, "CapabilityStatement unavailable");
                    None
                }
            },
        };

        if self.client_config.strict_validation {
            let capability = capability.as_ref().ok_or_else(|| {
                McsdError::Directory(DirectoryError::CapabilityRejected {
                    url: directory.endpoint_address.clone(),
                })
            })?;
            for resource_type in McsdResourceType::ALL {
                if !fhir::capability_supports(
                    capability,
                    resource_type,
                    &fhir::REQUIRED_INTERACTIONS,
                ) {
                    return Err(McsdError::Directory(DirectoryError::CapabilityRejected {
                        url: directory.endpoint_address.clone(),
                    }));
                }
            }
        }

        Ok(capability)
    }

    /// Pages through history (or search) for one resource type, keeping only
    /// the newest entry per resource. Cancellation and the soft deadline are
    /// checked at every page boundary.
    #[allow(clippy::too_many_arguments)]
    async fn collect_entries(
        &self,
        client: &DirectoryClient,
        resource_type: McsdResourceType,
        since: Option<DateTime<Utc>>,
        use_history: bool,
        cancel: &CancellationToken,
        deadline_at: Option<Instant>,
        counters: &mut PassCounters,
    ) -> Result<Vec<Value>> {
        let mut newest_per_id: HashMap<RemoteRef, Value> = HashMap::new();
        let mut order: Vec<RemoteRef> = Vec::new();

        let mut page: Option<Page> = Some(if use_history {
            client.history(resource_type, since).await?
        } else {
            client.search_since(resource_type, since).await?
        });

        while let Some(current) = page.take() {
            counters.bytes_transferred += current.bytes;

            for entry in current.entries {
                counters.entries_seen += 1;
                let Some(remote) = fhir::entry_type_and_id(&entry) else {
                    debug!(%resource_type, "Entry without a resolvable identity, skipping");
                    counters.entries_skipped += 1;
                    continue;
                };

                if remote.resource_type != resource_type.as_str() {
                    // History pages may interleave other types via _include;
                    // they are processed in their own iteration.
                    counters.entries_skipped += 1;
                    continue;
                }

                // History is newest-first: the first occurrence wins.
                if !newest_per_id.contains_key(&remote) {
                    order.push(remote.clone());
                    newest_per_id.insert(remote, entry);
                }
            }

            if let Some(next) = current.next {
                if cancel.is_cancelled() {
                    return Err(McsdError::Cancelled);
                }
                if matches!(deadline_at, Some(at) if Instant::now() >= at) {
                    return Err(McsdError::DeadlineExceeded);
                }
                page = Some(client.next_page(next).await?);
            }
        }

        // Apply oldest first so later updates overwrite earlier ones and
        // version counters only move forward.
        let mut entries: Vec<Value> = order
            .into_iter()
            .filter_map(|remote| newest_per_id.remove(&remote))
            .collect();
        entries.sort_by_key(|entry| {
            entry
                .get("resource")
                .and_then(fhir::meta_last_updated)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });

        Ok(entries)
    }

    async fn apply_entries(
        &self,
        directory: &DirectoryRecord,
        client: &DirectoryClient,
        ctx: &ReferenceContext,
        resource_type: McsdResourceType,
        entries: Vec<Value>,
        counters: &mut PassCounters,
    ) -> Result<()> {
        for entry in entries {
            let Some(remote) = fhir::entry_type_and_id(&entry) else {
                continue;
            };

            match fhir::entry_method(&entry) {
                EntryMethod::Delete => {
                    self.apply_delete(directory, resource_type, &remote, counters)
                        .await?;
                }
                EntryMethod::Upsert => {
                    match self
                        .apply_upsert(directory, client, ctx, resource_type, &remote, &entry)
                        .await
                    {
                        Ok(true) => counters.entries_written += 1,
                        Ok(false) => counters.entries_skipped += 1,
                        Err(e) if !e.is_fatal_to_pass() => {
                            warn!(
                                directory_id = %directory.id,
                                resource = %remote,
                                error = %e,
                                "Skipping entry"
                            );
                            counters.entries_skipped += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletion propagation: remove the local copy, then the mapping. A
    /// deletion for a resource never seen locally is a no-op success.
    async fn apply_delete(
        &self,
        directory: &DirectoryRecord,
        resource_type: McsdResourceType,
        remote: &RemoteRef,
        counters: &mut PassCounters,
    ) -> Result<()> {
        let existing = self
            .maps
            .lookup(&directory.id, resource_type.as_str(), &remote.id)
            .await?;

        if let Some(map) = existing {
            self.writer
                .delete(resource_type.as_str(), &map.update_client_resource_id)
                .await?;
            self.maps.delete(&map).await?;
        }

        counters.entries_deleted += 1;
        Ok(())
    }

    /// Returns `Ok(true)` when a resource was written, `Ok(false)` when the
    /// entry was benignly skipped (e.g. deleted remotely between the history
    /// page and the read).
    async fn apply_upsert(
        &self,
        directory: &DirectoryRecord,
        client: &DirectoryClient,
        ctx: &ReferenceContext,
        resource_type: McsdResourceType,
        remote: &RemoteRef,
        entry: &Value,
    ) -> Result<bool> {
        let mut resource = match entry.get("resource") {
            Some(resource) if resource.is_object() => resource.clone(),
            _ => match client.read(resource_type, &remote.id).await? {
                Some(resource) => resource,
                None => return Ok(false),
            },
        };

        if fhir::resource_type_and_id(&resource).is_none() {
            return Err(McsdError::Fhir(FhirError::InvalidResource {
                message: format!("{remote}: resource body lacks resourceType or id"),
            }));
        }

        if self.client_config.strict_validation
            && resource.get("resourceType").and_then(Value::as_str)
                != Some(resource_type.as_str())
        {
            return Err(McsdError::Fhir(FhirError::ValidationFailed {
                message: format!("{remote}: resourceType does not match the requested type"),
            }));
        }

        let remote_version = fhir::remote_version(&resource);

        // Reserve-then-fill: every referenced resource gets a local id
        // before this one is written, so forward and cyclic references are
        // always resolvable.
        let references = rewriter::collect_references(&resource, ctx)?;
        let mut local_ids: HashMap<RemoteRef, String> = HashMap::with_capacity(references.len() + 1);
        for reference in references {
            let reserved = self
                .maps
                .allocate(&directory.id, &reference.resource_type, &reference.id)
                .await?;
            local_ids.insert(reference, reserved.update_client_resource_id);
        }

        let map = self
            .maps
            .allocate(&directory.id, resource_type.as_str(), &remote.id)
            .await?;

        rewriter::rewrite_resource(&mut resource, ctx, &local_ids)?;
        resource["id"] = Value::String(map.update_client_resource_id.clone());

        self.writer
            .put(resource_type.as_str(), &map.update_client_resource_id, &resource)
            .await?;

        self.maps
            .record_versions(
                &map,
                remote_version,
                map.update_client_resource_version + 1,
                Utc::now(),
            )
            .await?;

        Ok(true)
    }
}
