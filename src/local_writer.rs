//! Local FHIR writer
//!
//! Idempotent PUT/DELETE against the local addressing FHIR server (the
//! "update client" store). A DELETE answered with 404 or 410 counts as
//! success: the resource is gone either way.

use crate::config::ClientConfig;
use crate::error::{DirectoryError, McsdError, Result};
use crate::fhir_client::send_with_retries;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Writer for the update-client FHIR server.
#[derive(Clone)]
pub struct UpdateClientWriter {
    client: Client,
    base_url: Url,
    retry_attempts: u32,
    backoff_ms: u64,
}

impl UpdateClientWriter {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base_url =
            Url::parse(&config.update_client_url).map_err(|_| DirectoryError::Unavailable {
                url: config.update_client_url.clone(),
            })?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .connect_timeout(std::time::Duration::from_secs(5))
            .user_agent(concat!("mcsd-update-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            retry_attempts: config.retry_attempts,
            backoff_ms: config.backoff_ms,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Creates or replaces `{base}/{type}/{id}` with the given body.
    pub async fn put(&self, resource_type: &str, local_id: &str, body: &Value) -> Result<()> {
        let url = self.join(resource_type, local_id)?;
        send_with_retries(
            &self.client,
            Method::PUT,
            url,
            Some(body),
            self.retry_attempts,
            self.backoff_ms,
        )
        .await?;
        debug!(resource_type, local_id, "Stored resource locally");
        Ok(())
    }

    /// Deletes `{base}/{type}/{id}`. Absence is success.
    pub async fn delete(&self, resource_type: &str, local_id: &str) -> Result<()> {
        let url = self.join(resource_type, local_id)?;
        match send_with_retries(
            &self.client,
            Method::DELETE,
            url,
            None,
            self.retry_attempts,
            self.backoff_ms,
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(McsdError::Directory(DirectoryError::HttpStatus { status, .. }))
                if status == 404 || status == 410 =>
            {
                debug!(resource_type, local_id, "Delete target already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn join(&self, resource_type: &str, local_id: &str) -> Result<Url> {
        let base = format!("{}/", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&base)
            .and_then(|b| b.join(&format!("{resource_type}/{local_id}")))
            .map_err(|_| {
                McsdError::Directory(DirectoryError::Unavailable {
                    url: format!("{}/{resource_type}/{local_id}", self.base_url),
                })
            })
    }
}
