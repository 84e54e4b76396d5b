//! FHIR payload builders for tests

use serde_json::{json, Value};

/// A CapabilityStatement advertising read/search-type/history-type for every
/// mCSD resource type.
pub fn capability_all() -> Value {
    let resources: Vec<Value> = [
        "Organization",
        "Location",
        "Endpoint",
        "HealthcareService",
        "Practitioner",
        "PractitionerRole",
        "OrganizationAffiliation",
    ]
    .iter()
    .map(|t| {
        json!({
            "type": t,
            "interaction": [
                {"code": "read"},
                {"code": "search-type"},
                {"code": "history-type"}
            ]
        })
    })
    .collect();

    json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "fhirVersion": "4.0.1",
        "rest": [{"mode": "server", "resource": resources}]
    })
}

/// A CapabilityStatement that only supports searches (no history).
pub fn capability_search_only() -> Value {
    json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "fhirVersion": "4.0.1",
        "rest": [{"mode": "server", "resource": [{
            "type": "Organization",
            "interaction": [{"code": "read"}, {"code": "search-type"}]
        }]}]
    })
}

/// A history bundle over the given entries with an optional `next` link.
pub fn history_bundle(entries: Vec<Value>, next: Option<&str>) -> Value {
    let mut links = vec![json!({"relation": "self", "url": "urn:ignored"})];
    if let Some(next) = next {
        links.push(json!({"relation": "next", "url": next}));
    }

    json!({
        "resourceType": "Bundle",
        "type": "history",
        "link": links,
        "entry": entries
    })
}

/// An upsert history entry wrapping the resource.
pub fn upsert_entry(resource: Value) -> Value {
    let resource_type = resource["resourceType"].as_str().unwrap_or_default();
    let id = resource["id"].as_str().unwrap_or_default();
    json!({
        "fullUrl": format!("urn:uuid:{id}"),
        "resource": resource,
        "request": {"method": "PUT", "url": format!("{resource_type}/{id}")}
    })
}

/// A deletion history entry for a resource id.
pub fn delete_entry(resource_type: &str, id: &str) -> Value {
    json!({
        "request": {"method": "DELETE", "url": format!("{resource_type}/{id}/_history/2")}
    })
}

/// A minimal Organization with an optional `partOf` reference.
pub fn organization(id: &str, last_updated: &str, part_of: Option<&str>) -> Value {
    let mut org = json!({
        "resourceType": "Organization",
        "id": id,
        "meta": {"versionId": "1", "lastUpdated": last_updated},
        "name": format!("Organization {id}"),
        "active": true
    });
    if let Some(part_of) = part_of {
        org["partOf"] = json!({"reference": part_of});
    }
    org
}
