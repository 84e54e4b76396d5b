//! Reference rewriter
//!
//! Rewrites a resource fetched from a directory so that every reference
//! points into the local addressing namespace. The walk is schema-less over
//! the JSON tree and preserves unknown fields verbatim; it runs in two pure
//! phases around the (async) id allocation:
//!
//! 1. [`collect_references`] finds every rewritable reference,
//! 2. the pipeline reserves local ids for them through the resource map,
//! 3. [`rewrite_resource`] substitutes the ids and strips directory-local
//!    identifiers.
//!
//! Given the same inputs and id map, the output is identical; ordering of
//! untouched fields is preserved by `serde_json`'s map.

use crate::error::{McsdError, Result, RewriteError};
use crate::fhir::{self, RemoteRef};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use url::Url;

/// The two origins a reference may legitimately point at.
#[derive(Debug, Clone)]
pub struct ReferenceContext {
    pub directory_base: Url,
    pub local_base: Url,
}

impl ReferenceContext {
    pub fn new(directory_base: Url, local_base: Url) -> Self {
        Self {
            directory_base,
            local_base,
        }
    }

    fn directory_system(&self) -> &str {
        self.directory_base.as_str().trim_end_matches('/')
    }
}

enum RefClass {
    /// Left untouched: fragments, urns, non-mCSD targets, local-origin URLs.
    Preserve,
    /// Points into the source directory; must be mapped.
    Rewrite(RemoteRef),
}

fn classify(value: &str, ctx: &ReferenceContext) -> Result<RefClass> {
    if value.starts_with('#') || value.starts_with("urn:") {
        return Ok(RefClass::Preserve);
    }

    match Url::parse(value) {
        Ok(absolute) => {
            if fhir::is_under_base(&absolute, &ctx.directory_base) {
                return Ok(match fhir::split_reference_path(value) {
                    Some(remote) => RefClass::Rewrite(remote),
                    None => RefClass::Preserve,
                });
            }
            if fhir::is_under_base(&absolute, &ctx.local_base) {
                return Ok(RefClass::Preserve);
            }
            Err(McsdError::Rewrite(RewriteError::CrossOriginReference {
                reference: value.to_string(),
                origin: ctx.directory_base.to_string(),
            }))
        }
        // Relative reference: only the mCSD types are mapped.
        Err(_) => Ok(match fhir::split_reference_path(value) {
            Some(remote) => RefClass::Rewrite(remote),
            None => RefClass::Preserve,
        }),
    }
}

/// Collects every reference in the resource that must be mapped to a local
/// id. Fails with a `cross-origin-reference` error when the tree points at a
/// third-party host; the caller then skips the containing resource.
pub fn collect_references(
    resource: &Value,
    ctx: &ReferenceContext,
) -> Result<HashSet<RemoteRef>> {
    let mut refs = HashSet::new();
    collect_walk(resource, ctx, &mut refs)?;
    Ok(refs)
}

fn collect_walk(
    value: &Value,
    ctx: &ReferenceContext,
    refs: &mut HashSet<RemoteRef>,
) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    ("reference" | "fullUrl", Value::String(s)) => {
                        if let RefClass::Rewrite(remote) = classify(s, ctx)? {
                            refs.insert(remote);
                        }
                    }
                    _ => collect_walk(child, ctx, refs)?,
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_walk(item, ctx, refs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rewrites the resource in place:
///
/// - clears `meta.versionId` / `meta.lastUpdated`,
/// - replaces every mapped `reference` with `{Type}/{local_id}`,
/// - replaces every mapped `fullUrl` with `{local_base}/{Type}/{local_id}`,
/// - removes `identifier` entries whose `system` is the source directory's
///   base URL, preserving externally meaningful identifiers verbatim.
///
/// Every reference collected by [`collect_references`] must have an entry in
/// `local_ids`; a missing entry is a malformed-reference error rather than a
/// silently un-rewritten value.
pub fn rewrite_resource(
    resource: &mut Value,
    ctx: &ReferenceContext,
    local_ids: &HashMap<RemoteRef, String>,
) -> Result<()> {
    fhir::clear_server_assigned_meta(resource);
    rewrite_walk(resource, ctx, local_ids)
}

fn rewrite_walk(
    value: &mut Value,
    ctx: &ReferenceContext,
    local_ids: &HashMap<RemoteRef, String>,
) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut strip_identifier = false;
            for (key, child) in map.iter_mut() {
                match key.as_str() {
                    "reference" => {
                        let mapped = match child.as_str() {
                            Some(s) => mapped_reference(s, ctx, local_ids)?,
                            None => None,
                        };
                        if let Some(local) = mapped {
                            *child = Value::String(local.relative);
                        }
                    }
                    "fullUrl" => {
                        let mapped = match child.as_str() {
                            Some(s) => mapped_reference(s, ctx, local_ids)?,
                            None => None,
                        };
                        if let Some(local) = mapped {
                            *child = Value::String(format!(
                                "{}/{}",
                                ctx.local_base.as_str().trim_end_matches('/'),
                                local.relative
                            ));
                        }
                    }
                    "identifier" => match child {
                        Value::Array(items) => {
                            items.retain(|item| !is_directory_identifier(item, ctx));
                            for item in items.iter_mut() {
                                rewrite_walk(item, ctx, local_ids)?;
                            }
                        }
                        // A lone identifier object (e.g. inside a Reference)
                        // is dropped entirely when it belongs to the
                        // directory's namespace.
                        other => {
                            if other.is_object() && is_directory_identifier(other, ctx) {
                                strip_identifier = true;
                            } else {
                                rewrite_walk(other, ctx, local_ids)?;
                            }
                        }
                    },
                    _ => rewrite_walk(child, ctx, local_ids)?,
                }
            }
            if strip_identifier {
                map.remove("identifier");
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_walk(item, ctx, local_ids)?;
            }
        }
        _ => {}
    }
    Ok(())
}

struct MappedRef {
    relative: String,
}

fn mapped_reference(
    value: &str,
    ctx: &ReferenceContext,
    local_ids: &HashMap<RemoteRef, String>,
) -> Result<Option<MappedRef>> {
    match classify(value, ctx)? {
        RefClass::Preserve => Ok(None),
        RefClass::Rewrite(remote) => {
            let local_id = local_ids.get(&remote).ok_or_else(|| {
                McsdError::Rewrite(RewriteError::MalformedReference {
                    reference: value.to_string(),
                })
            })?;
            Ok(Some(MappedRef {
                relative: format!("{}/{}", remote.resource_type, local_id),
            }))
        }
    }
}

fn is_directory_identifier(identifier: &Value, ctx: &ReferenceContext) -> bool {
    identifier
        .get("system")
        .and_then(Value::as_str)
        .map(|system| system.trim_end_matches('/') == ctx.directory_system())
        .unwrap_or(false)
}
