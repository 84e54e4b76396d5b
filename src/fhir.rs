//! Schema-less FHIR R4 helpers
//!
//! The update client treats FHIR resources as tagged JSON trees
//! (`serde_json::Value`) rather than strongly typed models, so unknown fields
//! survive the round trip verbatim. This module holds the mCSD resource-type
//! set and the bundle/entry/reference accessors shared by the client, the
//! rewriter and the pipeline.

use crate::error::{FhirError, McsdError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use url::Url;

/// The fixed set of mCSD resource types, in referential-dependency order.
///
/// Passes process types in this order so that referenced resources
/// (organizations, locations) tend to exist before their referrers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McsdResourceType {
    Organization,
    Location,
    Endpoint,
    HealthcareService,
    Practitioner,
    PractitionerRole,
    OrganizationAffiliation,
}

impl McsdResourceType {
    pub const ALL: [McsdResourceType; 7] = [
        McsdResourceType::Organization,
        McsdResourceType::Location,
        McsdResourceType::Endpoint,
        McsdResourceType::HealthcareService,
        McsdResourceType::Practitioner,
        McsdResourceType::PractitionerRole,
        McsdResourceType::OrganizationAffiliation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            McsdResourceType::Organization => "Organization",
            McsdResourceType::Location => "Location",
            McsdResourceType::Endpoint => "Endpoint",
            McsdResourceType::HealthcareService => "HealthcareService",
            McsdResourceType::Practitioner => "Practitioner",
            McsdResourceType::PractitionerRole => "PractitionerRole",
            McsdResourceType::OrganizationAffiliation => "OrganizationAffiliation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        McsdResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
    }
}

impl fmt::Display for McsdResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to a resource inside its source directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    pub resource_type: String,
    pub id: String,
}

impl RemoteRef {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// What a history entry asks the update client to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMethod {
    Upsert,
    Delete,
}

/// Asserts the value is a FHIR Bundle and returns its entries (empty when
/// `entry` is absent).
pub fn bundle_entries(bundle: &Value) -> Result<Vec<&Value>> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(McsdError::Fhir(FhirError::InvalidBundle {
            message: "resourceType is not Bundle".to_string(),
        }));
    }

    match bundle.get("entry") {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(entries)) => Ok(entries.iter().collect()),
        Some(_) => Err(McsdError::Fhir(FhirError::InvalidBundle {
            message: "entry is not an array".to_string(),
        })),
    }
}

/// Returns the bundle's `link[relation=next]` URL, if any.
pub fn next_link(bundle: &Value) -> Option<&str> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
}

/// The HTTP method recorded on a history entry. Entries without a request
/// default to upsert (plain search results carry no request).
pub fn entry_method(entry: &Value) -> EntryMethod {
    match entry
        .get("request")
        .and_then(|r| r.get("method"))
        .and_then(Value::as_str)
    {
        Some("DELETE") => EntryMethod::Delete,
        _ => EntryMethod::Upsert,
    }
}

/// Resolves the resource type and id of a bundle entry.
///
/// The resource body is preferred; deletion entries carry no body, so
/// `request.url` (`{Type}/{id}` or `{Type}/{id}/_history/{v}`) and `fullUrl`
/// are consulted as fallbacks.
pub fn entry_type_and_id(entry: &Value) -> Option<RemoteRef> {
    if let Some(resource) = entry.get("resource") {
        if let Some(r) = resource_type_and_id(resource) {
            return Some(r);
        }
    }

    if let Some(request_url) = entry
        .get("request")
        .and_then(|r| r.get("url"))
        .and_then(Value::as_str)
    {
        if let Some(r) = split_reference_path(request_url) {
            return Some(r);
        }
    }

    let full_url = entry.get("fullUrl").and_then(Value::as_str)?;
    split_reference_path(full_url)
}

/// Extracts `(resourceType, id)` from a resource body.
pub fn resource_type_and_id(resource: &Value) -> Option<RemoteRef> {
    let resource_type = resource.get("resourceType").and_then(Value::as_str)?;
    let id = resource.get("id").and_then(Value::as_str)?;
    Some(RemoteRef::new(resource_type, id))
}

/// Parses the trailing `{Type}/{id}` pair out of a reference path or URL,
/// skipping `_history` suffixes. Returns `None` for `urn:` values and
/// internal `#fragment` references.
pub fn split_reference_path(reference: &str) -> Option<RemoteRef> {
    if reference.starts_with("urn:") || reference.starts_with('#') {
        return None;
    }

    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // Trailing `_history/{version}` does not change the identity.
    let segments = match segments.as_slice() {
        [head @ .., h, _v] if *h == "_history" => head,
        other => other,
    };

    match segments {
        [.., resource_type, id] if McsdResourceType::parse(resource_type).is_some() => {
            Some(RemoteRef::new(*resource_type, *id))
        }
        _ => None,
    }
}

/// Whether an absolute URL lives under the given FHIR base (same scheme,
/// host, port, and the base path as a whole-segment prefix).
pub fn is_under_base(absolute: &Url, base: &Url) -> bool {
    if absolute.scheme() != base.scheme()
        || absolute.host_str() != base.host_str()
        || absolute.port_or_known_default() != base.port_or_known_default()
    {
        return false;
    }

    let base_path = base.path().trim_matches('/');
    let abs_path = absolute.path().trim_start_matches('/');
    base_path.is_empty()
        || abs_path == base_path
        || abs_path
            .strip_prefix(base_path)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The resource's `meta.lastUpdated` instant, if present and parseable.
pub fn meta_last_updated(resource: &Value) -> Option<DateTime<Utc>> {
    let raw = resource
        .get("meta")?
        .get("lastUpdated")?
        .as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The resource's `meta.versionId` parsed as an integer, defaulting to 1.
pub fn remote_version(resource: &Value) -> i64 {
    resource
        .get("meta")
        .and_then(|m| m.get("versionId"))
        .and_then(Value::as_str)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Removes `meta.versionId` and `meta.lastUpdated`; the local server
/// reassigns both. An emptied `meta` object is dropped entirely.
pub fn clear_server_assigned_meta(resource: &mut Value) {
    let remove_meta = match resource.get_mut("meta").and_then(Value::as_object_mut) {
        Some(meta) => {
            meta.remove("versionId");
            meta.remove("lastUpdated");
            meta.is_empty()
        }
        None => false,
    };

    if remove_meta {
        if let Some(obj) = resource.as_object_mut() {
            obj.remove("meta");
        }
    }
}

/// Checks that a CapabilityStatement advertises the given interactions for a
/// resource type.
pub fn capability_supports(
    capability: &Value,
    resource_type: McsdResourceType,
    interactions: &[&str],
) -> bool {
    let Some(rest) = capability.get("rest").and_then(Value::as_array) else {
        return false;
    };

    rest.iter()
        .filter(|r| r.get("mode").and_then(Value::as_str) != Some("client"))
        .flat_map(|r| {
            r.get("resource")
                .and_then(Value::as_array)
                .map(|a| a.as_slice())
                .unwrap_or(&[])
        })
        .filter(|r| r.get("type").and_then(Value::as_str) == Some(resource_type.as_str()))
        .any(|r| {
            let supported: Vec<&str> = r
                .get("interaction")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(|i| i.get("code").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            interactions.iter().all(|i| supported.contains(i))
        })
}

/// The interactions ITI-91 requires of a directory for every mCSD type.
pub const REQUIRED_INTERACTIONS: [&str; 3] = ["read", "search-type", "history-type"];
