//! FHIR directory client
//!
//! Read side of the update pipeline: capability statements, type-level
//! history and `_lastUpdated` searches against a remote directory, with
//! pagination over `Bundle.link[relation=next]` and bounded exponential
//! backoff on idempotent requests.

use crate::config::ClientConfig;
use crate::error::{DirectoryError, FhirError, McsdError, Result};
use crate::fhir;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

const FHIR_JSON: &str = "application/fhir+json";

/// One page of bundle entries plus the link to the next page.
#[derive(Debug)]
pub struct Page {
    pub entries: Vec<Value>,
    pub next: Option<Url>,
    /// Size of the raw response body, fed into the pass counters.
    pub bytes: u64,
}

/// Client for one remote mCSD directory.
///
/// Cheap to construct; the scheduler builds one per directory per pass from
/// the shared [`ClientConfig`].
pub struct DirectoryClient {
    client: Client,
    base_url: Url,
    config: ClientConfig,
}

impl DirectoryClient {
    pub fn new(base_url: &str, config: &ClientConfig) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|_| DirectoryError::Unavailable {
            url: base_url.to_string(),
        })?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .connect_timeout(std::time::Duration::from_secs(5))
            .user_agent(concat!("mcsd-update-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches the server's CapabilityStatement from `{base}/metadata`.
    pub async fn capability(&self) -> Result<Value> {
        let url = self.join("metadata")?;
        let response = self.get_with_retries(url).await?;
        let body = response.text().await?;
        let capability: Value = serde_json::from_str(&body).map_err(|e| {
            McsdError::Fhir(FhirError::InvalidResource {
                message: format!("CapabilityStatement is not valid JSON: {e}"),
            })
        })?;
        Ok(capability)
    }

    /// First page of type-level history since the watermark. Deletions show
    /// up as entries with `request.method = DELETE`.
    pub async fn history(
        &self,
        resource_type: fhir::McsdResourceType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Page> {
        let mut url = self.join(&format!("{resource_type}/_history"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("_count", &self.config.request_count.to_string());
            if let Some(since) = since {
                query.append_pair(
                    "_since",
                    &since.to_rfc3339_opts(SecondsFormat::Millis, true),
                );
            }
        }
        self.fetch_page(url).await
    }

    /// First page of a `_lastUpdated=ge{W}` search, the fallback when the
    /// directory does not support type-level history.
    pub async fn search_since(
        &self,
        resource_type: fhir::McsdResourceType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Page> {
        let mut url = self.join(resource_type.as_str())?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("_count", &self.config.request_count.to_string());
            if let Some(since) = since {
                query.append_pair(
                    "_lastUpdated",
                    &format!("ge{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
        }
        self.fetch_page(url).await
    }

    /// Follows a `next` link produced by [`Self::history`] or
    /// [`Self::search_since`].
    pub async fn next_page(&self, next: Url) -> Result<Page> {
        self.fetch_page(next).await
    }

    /// Reads a single resource. `Ok(None)` for 404/410.
    pub async fn read(
        &self,
        resource_type: fhir::McsdResourceType,
        id: &str,
    ) -> Result<Option<Value>> {
        let url = self.join(&format!("{resource_type}/{id}"))?;
        let response = match self.get_with_retries(url).await {
            Ok(response) => response,
            Err(McsdError::Directory(DirectoryError::HttpStatus { status, .. }))
                if status == 404 || status == 410 =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let body = response.text().await?;
        let resource: Value = serde_json::from_str(&body).map_err(|e| {
            McsdError::Fhir(FhirError::InvalidResource {
                message: format!("resource body is not valid JSON: {e}"),
            })
        })?;
        Ok(Some(resource))
    }

    async fn fetch_page(&self, url: Url) -> Result<Page> {
        let response = self.get_with_retries(url).await?;
        let body = response.text().await?;
        let bytes = body.len() as u64;

        let bundle: Value = serde_json::from_str(&body).map_err(|e| {
            McsdError::Fhir(FhirError::InvalidBundle {
                message: format!("page is not valid JSON: {e}"),
            })
        })?;

        let entries: Vec<Value> = fhir::bundle_entries(&bundle)?
            .into_iter()
            .cloned()
            .collect();

        let next = match fhir::next_link(&bundle) {
            Some(link) => Some(self.resolve_next(link)?),
            None => None,
        };

        debug!(
            entries = entries.len(),
            has_next = next.is_some(),
            "Fetched directory page"
        );

        Ok(Page {
            entries,
            next,
            bytes,
        })
    }

    /// Resolves a `next` link against the directory base. A link pointing at
    /// a different origin fails the batch rather than leaking requests to a
    /// third party.
    fn resolve_next(&self, link: &str) -> Result<Url> {
        let resolved = self
            .base_url
            .join(link)
            .map_err(|_| {
                McsdError::Fhir(FhirError::InvalidBundle {
                    message: format!("unparseable next link: {link}"),
                })
            })?;

        if resolved.host_str() != self.base_url.host_str()
            || resolved.scheme() != self.base_url.scheme()
            || resolved.port_or_known_default() != self.base_url.port_or_known_default()
        {
            return Err(McsdError::Fhir(FhirError::InvalidBundle {
                message: format!("next link points off-origin: {link}"),
            }));
        }
        Ok(resolved)
    }

    fn join(&self, path: &str) -> Result<Url> {
        let base = format!("{}/", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&base)
            .and_then(|b| b.join(path))
            .map_err(|_| {
                McsdError::Directory(DirectoryError::Unavailable {
                    url: format!("{}/{path}", self.base_url),
                })
            })
    }

    async fn get_with_retries(&self, url: Url) -> Result<Response> {
        send_with_retries(
            &self.client,
            Method::GET,
            url,
            None,
            self.config.retry_attempts,
            self.config.backoff_ms,
        )
        .await
    }
}

/// Whether a response status is worth retrying. 4xx responses are final
/// except for timeout (408), too-early (425) and rate limiting (429).
fn retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status.as_u16() == 425
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Sends an idempotent request with bounded exponential backoff and jitter.
/// Shared by the directory client and the local writer.
pub(crate) async fn send_with_retries(
    client: &Client,
    method: Method,
    url: Url,
    body: Option<&Value>,
    retry_attempts: u32,
    backoff_ms: u64,
) -> Result<Response> {
    let attempts = retry_attempts.max(1);
    let mut last_error: Option<McsdError> = None;

    for attempt in 1..=attempts {
        debug!(
            attempt,
            attempts,
            %url,
            "Sending {method} request"
        );

        let mut request = client
            .request(method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, FHIR_JSON);
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, FHIR_JSON)
                .json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return Err(McsdError::Directory(DirectoryError::AuthRejected {
                        url: url.to_string(),
                    }));
                }

                if retryable(status) {
                    last_error = Some(McsdError::Directory(DirectoryError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    }));
                } else {
                    return Err(McsdError::Directory(DirectoryError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    }));
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "Request failed, will retry if attempts remain");
                last_error = Some(McsdError::Network(e));
            }
        }

        if attempt < attempts {
            let base = backoff_ms.max(1) * 2_u64.pow(attempt - 1);
            let jitter: u64 = rand::random::<u8>() as u64 % 250;
            tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| {
        McsdError::Directory(DirectoryError::Unavailable {
            url: url.to_string(),
        })
    }))
}
