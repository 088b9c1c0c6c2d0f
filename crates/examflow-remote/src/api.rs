//! Content API client: order tables and submissions.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use examflow_core::submission::SubmissionPayload;
use examflow_core::traits::{OrderTableSource, SubmissionReceipt, SubmissionSink};
use examflow_core::{OrderEntry, SubmissionError};

use crate::config::ApiConfig;
use crate::error::RemoteError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client for the content service.
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

/// The order endpoint answers either with a bare list or wrapped in `data`.
#[derive(Deserialize)]
#[serde(untagged)]
enum OrderResponse {
    Bare(Vec<OrderEntry>),
    Wrapped { data: Vec<OrderEntry> },
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, token, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout_secs: timeout.as_secs(),
            client,
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, RemoteError> {
        Self::with_timeout(
            &config.base_url,
            config.token.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = self.authorize(req).send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(self.timeout_secs)
            } else {
                RemoteError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::AuthenticationFailed(body));
        }
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::ApiError {
                status,
                message: body,
            });
        }
        Ok(response)
    }

    #[instrument(skip(self))]
    pub async fn fetch_order(&self, test_set_id: &str) -> Result<Vec<OrderEntry>, RemoteError> {
        let url = format!("{}/testsets/{}/order", self.base_url, test_set_id);
        let response = self.send(self.client.get(url)).await?;

        let body: OrderResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("order table: {e}")))?;
        let entries = match body {
            OrderResponse::Bare(entries) | OrderResponse::Wrapped { data: entries } => entries,
        };

        tracing::debug!(entries = entries.len(), "order table fetched");
        Ok(entries)
    }

    #[instrument(skip(self, payload), fields(testset = %payload.testset_id, answered = payload.answered()))]
    pub async fn post_submission(
        &self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionReceipt, RemoteError> {
        let url = format!("{}/submissions", self.base_url);
        let response = self.send(self.client.post(url).json(payload)).await?;

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("submission result: {e}")))?;

        tracing::info!("submission accepted");
        Ok(SubmissionReceipt { result })
    }
}

#[async_trait]
impl OrderTableSource for ApiClient {
    async fn order_table(&self, test_set_id: &str) -> anyhow::Result<Vec<OrderEntry>> {
        Ok(self.fetch_order(test_set_id).await?)
    }
}

#[async_trait]
impl SubmissionSink for ApiClient {
    async fn submit(
        &self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.post_submission(payload).await.map_err(Into::into)
    }
}
