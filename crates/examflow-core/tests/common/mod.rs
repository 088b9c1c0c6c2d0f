//! Shared helpers for session integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use examflow_core::error::{MediaLoadError, SubmissionError};
use examflow_core::submission::SubmissionPayload;
use examflow_core::traits::{FetchedMedia, MediaFetcher, SubmissionReceipt, SubmissionSink};
use examflow_core::{MediaKind, TestDefinition};
use serde_json::json;

/// Media fetcher that counts calls per URL and answers after `latency`.
#[derive(Default)]
pub struct CountingFetcher {
    pub latency: Duration,
    calls: Mutex<HashMap<String, u32>>,
}

impl CountingFetcher {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MediaFetcher for CountingFetcher {
    async fn fetch(&self, url: &str, _kind: MediaKind) -> Result<FetchedMedia, MediaLoadError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        tokio::time::sleep(self.latency).await;
        Ok(FetchedMedia {
            bytes: vec![0; 16],
            content_type: Some("audio/mpeg".into()),
        })
    }
}

/// Submission sink that records payloads and fails the first `failures`.
#[derive(Default)]
pub struct RecordingSink {
    failures: AtomicU32,
    pub payloads: Mutex<Vec<SubmissionPayload>>,
}

impl RecordingSink {
    pub fn failing(times: u32) -> Self {
        Self {
            failures: AtomicU32::new(times),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl SubmissionSink for RecordingSink {
    async fn submit(
        &self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.payloads.lock().unwrap().push(payload.clone());
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SubmissionError::Transport("connection reset".into()));
        }
        Ok(SubmissionReceipt {
            result: json!({ "answered": payload.answered() }),
        })
    }
}

/// A group as the content service would send it.
pub fn group(id: &str, part: u8, questions: u32, audio: bool) -> serde_json::Value {
    let files: Vec<serde_json::Value> = if audio {
        vec![json!({
            "url": format!("https://cdn.example/{id}.mp3"),
            "fileType": "AUDIO",
            "displayOrder": 1
        })]
    } else {
        vec![]
    };
    let questions: Vec<serde_json::Value> = (1..=questions)
        .map(|n| {
            json!({
                "id": format!("{id}-q{n}"),
                "questionNumber": n,
                "questionText": "",
                "answers": (1..=4).map(|o| json!({
                    "id": format!("{id}-q{n}-a{o}"),
                    "content": "",
                    "answerOrder": o
                })).collect::<Vec<_>>()
            })
        })
        .collect();
    json!({
        "id": id,
        "questionPart": format!("PART_{part}"),
        "files": files,
        "questions": questions
    })
}

pub fn exam(groups: Vec<serde_json::Value>) -> TestDefinition {
    serde_json::from_value(json!({
        "collectionId": "c1",
        "testSetId": "ts1",
        "testName": "Integration",
        "mode": "exam",
        "questionGroups": groups
    }))
    .unwrap()
}

pub fn table(entries: &[(&str, u32)]) -> examflow_core::BaseOrderTable {
    examflow_core::BaseOrderTable::from_entries(entries.iter().map(|(id, base)| {
        examflow_core::OrderEntry {
            question_group_id: id.to_string(),
            question_part_order: *base,
        }
    }))
}

/// Receive notices until one matches. Fails the test after an hour of
/// (virtual) silence.
pub async fn expect<F>(
    notices: &mut tokio::sync::mpsc::UnboundedReceiver<examflow_core::EngineNotice>,
    mut matches: F,
) -> examflow_core::EngineNotice
where
    F: FnMut(&examflow_core::EngineNotice) -> bool,
{
    let wait = async {
        while let Some(notice) = notices.recv().await {
            if matches(&notice) {
                return notice;
            }
        }
        panic!("notice channel closed");
    };
    tokio::time::timeout(Duration::from_secs(3600), wait)
        .await
        .expect("expected notice never arrived")
}
