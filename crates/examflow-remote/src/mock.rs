//! In-memory collaborators for offline runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use examflow_core::submission::SubmissionPayload;
use examflow_core::traits::{FetchedMedia, MediaFetcher, SubmissionReceipt, SubmissionSink};
use examflow_core::{MediaKind, MediaLoadError, SubmissionError};

/// A media fetcher that serves placeholder bytes without touching the network.
#[derive(Default)]
pub struct MockMediaFetcher {
    latency: Duration,
    failing: HashSet<String>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make fetches of `url` fail with HTTP 503.
    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    /// Number of fetches issued for `url`.
    pub fn call_count(&self, url: &str) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }
}

#[async_trait]
impl MediaFetcher for MockMediaFetcher {
    async fn fetch(&self, url: &str, kind: MediaKind) -> Result<FetchedMedia, MediaLoadError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(url.to_string())
            .or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing.contains(url) {
            return Err(MediaLoadError::Http {
                url: url.to_string(),
                status: 503,
            });
        }

        let content_type = match kind {
            MediaKind::Audio => "audio/mpeg",
            MediaKind::Image => "image/png",
        };
        Ok(FetchedMedia {
            bytes: url.as_bytes().to_vec(),
            content_type: Some(content_type.to_string()),
        })
    }
}

/// A submission sink that records payloads and answers with a summary.
#[derive(Default)]
pub struct MockSubmissionSink {
    failures_left: AtomicU32,
    submissions: Mutex<Vec<SubmissionPayload>>,
}

impl MockSubmissionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` submissions with a transport error.
    pub fn failing_first(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<SubmissionPayload> {
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl SubmissionSink for MockSubmissionSink {
    async fn submit(
        &self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(SubmissionError::Transport("mock failure".into()));
        }

        Ok(SubmissionReceipt {
            result: serde_json::json!({
                "testsetId": payload.testset_id,
                "answered": payload.answered(),
                "total": payload.user_answers.len(),
                "completionTime": payload.completion_time,
            }),
        })
    }
}
