//! Microsoft Graph drive-item source

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{info, warn};

use super::credentials::CredentialProvider;
use super::{FileId, SourceDocument, SourceMetadata, SpreadsheetSource};
use crate::error::ImportError;

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
}

/// Downloads drive items with a bearer token from the given provider
pub struct GraphDriveSource {
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl GraphDriveSource {
    pub fn new(
        base_url: &str,
        client: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
        }
    }

    pub fn item_url(&self, file_id: &FileId) -> String {
        format!(
            "{}/drives/{}/items/{}",
            self.base_url,
            urlencoding::encode(file_id.drive_id()),
            urlencoding::encode(file_id.item_id())
        )
    }

    /// GET with one retry after an expired-token 401
    async fn get(&self, url: &str) -> Result<reqwest::Response, ImportError> {
        let mut retried = false;
        loop {
            let token = self.credentials.access_token().await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| ImportError::SourceUnavailable(format!("request failed: {}", e)))?;

            match response.status() {
                StatusCode::UNAUTHORIZED if !retried => {
                    warn!("Graph rejected the access token, refreshing once");
                    self.credentials.invalidate().await;
                    retried = true;
                }
                status if status.is_success() => return Ok(response),
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ImportError::SourceUnavailable(format!(
                        "GET {} returned {}: {}",
                        url, status, body
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl SpreadsheetSource for GraphDriveSource {
    async fn fetch(&self, file_id: &FileId, _refresh: bool) -> Result<SourceDocument, ImportError> {
        let item_url = self.item_url(file_id);

        let item: DriveItem = self
            .get(&item_url)
            .await?
            .json()
            .await
            .map_err(|e| ImportError::SourceUnavailable(format!("invalid drive item: {}", e)))?;

        let bytes = self
            .get(&format!("{}/content", item_url))
            .await?
            .bytes()
            .await
            .map_err(|e| ImportError::SourceUnavailable(format!("download interrupted: {}", e)))?;

        info!("Downloaded '{}' ({} bytes) from drive {}", item.name, bytes.len(), file_id.drive_id());

        Ok(SourceDocument {
            metadata: SourceMetadata {
                name: item.name,
                size: item.size,
                last_modified: item.last_modified_date_time,
            },
            bytes: Arc::new(bytes.to_vec()),
        })
    }

    fn name(&self) -> &'static str {
        "graph"
    }
}
