//! HTTP media fetcher.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use examflow_core::traits::{FetchedMedia, MediaFetcher};
use examflow_core::{MediaKind, MediaLoadError};

use crate::error::RemoteError;

/// Backstop for a single request. The preload manager applies its own,
/// shorter timeout on top.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Fetches media over plain HTTP GET.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpMediaFetcher {
    pub fn new() -> Result<Self, RemoteError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;
        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    #[instrument(skip(self, kind), fields(%kind))]
    async fn fetch(&self, url: &str, kind: MediaKind) -> Result<FetchedMedia, MediaLoadError> {
        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                MediaLoadError::Timeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                MediaLoadError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status().as_u16();
        if status >= 400 {
            tracing::warn!(status, "media request failed");
            return Err(MediaLoadError::Http {
                url: url.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(transport)?;

        tracing::debug!(bytes = bytes.len(), ?content_type, "media fetched");
        Ok(FetchedMedia {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_body_and_content_type() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/audio/p1.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![1u8, 2, 3, 4]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpMediaFetcher::new().unwrap();
        let media = fetcher
            .fetch(&format!("{}/audio/p1.mp3", server.uri()), MediaKind::Audio)
            .await
            .unwrap();

        assert_eq!(media.bytes, vec![1, 2, 3, 4]);
        assert_eq!(media.content_type.as_deref(), Some("audio/mpeg"));
    }

    #[tokio::test]
    async fn error_status_maps_to_http_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpMediaFetcher::new().unwrap();
        let url = format!("{}/missing.png", server.uri());
        let err = fetcher.fetch(&url, MediaKind::Image).await.unwrap_err();

        assert_eq!(err, MediaLoadError::Http { url, status: 404 });
    }

    #[tokio::test]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fetcher = HttpMediaFetcher::with_timeout(Duration::from_millis(200)).unwrap();
        let err = fetcher
            .fetch(&format!("{}/slow.mp3", server.uri()), MediaKind::Audio)
            .await
            .unwrap_err();

        assert!(matches!(err, MediaLoadError::Timeout { .. }), "got {err:?}");
    }
}
