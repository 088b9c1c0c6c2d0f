//! Boundary traits for the engine's external collaborators.
//!
//! HTTP implementations live in `examflow-remote`; tests supply in-memory
//! ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MediaLoadError, SubmissionError};
use crate::model::MediaKind;
use crate::order::OrderEntry;
use crate::submission::SubmissionPayload;

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Fetches the bytes behind a media URL.
///
/// Implementations do not retry and do not enforce the preload timeout; the
/// preload manager owns both policies.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, kind: MediaKind) -> Result<FetchedMedia, MediaLoadError>;
}

/// Raw fetched media.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Order table
// ---------------------------------------------------------------------------

/// Supplies the order table for a test set.
#[async_trait]
pub trait OrderTableSource: Send + Sync {
    async fn order_table(&self, test_set_id: &str) -> anyhow::Result<Vec<OrderEntry>>;
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Delivers a finished submission to the grading service.
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn submit(&self, payload: &SubmissionPayload)
        -> Result<SubmissionReceipt, SubmissionError>;
}

/// What the grading service returned. Opaque to the engine; handed to the
/// result pages through the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub result: serde_json::Value,
}
