//! Elasticsearch `_bulk` client over HTTP.

use super::{BulkResponse, IndexClient};
use crate::config::IndexConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

pub struct ElasticsearchClient {
    client: Client,
    addresses: Vec<String>,
    user: Option<(String, String)>,
}

impl ElasticsearchClient {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        if config.addresses.is_empty() {
            return Err(SyncError::Config("index.addresses must not be empty".into()));
        }
        if config.accept_invalid_certs {
            tracing::warn!("TLS certificate verification disabled for index connections");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        let user = (!config.user.is_empty()).then(|| (config.user.clone(), config.password.clone()));

        Ok(Self {
            client,
            addresses: config
                .addresses
                .iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
            user,
        })
    }

    async fn send_to(&self, address: &str, body: String) -> Result<BulkResponse> {
        let url = format!("{}/_bulk", address);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if let Some((user, password)) = &self.user {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::IndexStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<BulkResponse>().await?)
    }
}

#[async_trait]
impl IndexClient for ElasticsearchClient {
    async fn bulk_write(&self, body: String) -> Result<BulkResponse> {
        let mut last_err = None;
        for address in &self.addresses {
            match self.send_to(address, body.clone()).await {
                Ok(resp) => return Ok(resp),
                // The node answered; another node would see the same request.
                Err(e @ SyncError::IndexStatus { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("bulk request to {} failed: {}", address, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::Config("index.addresses must not be empty".into())))
    }

    fn backend_name(&self) -> &str {
        "elasticsearch"
    }
}
