//! The `examflow simulate` command: drive a whole session headlessly.
//!
//! Audio "plays" instantly: every `PlayAudio` notice is answered with an
//! ended event. Answers from the answers file are entered while their group
//! is on screen during listening, and all at once once free navigation opens.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use examflow_core::traits::{MediaFetcher, OrderTableSource, SubmissionSink};
use examflow_core::{
    fetch_order_table, EngineNotice, ExamSession, FileStore, OptionLetter, PhaseState,
    SessionHandle,
};
use examflow_remote::{
    load_config_from, ApiClient, HttpMediaFetcher, MockMediaFetcher, MockSubmissionSink,
};

const MAX_RELOADS: u32 = 3;
const MAX_SUBMIT_RETRIES: u32 = 3;

pub struct SimulateArgs {
    pub test: PathBuf,
    pub order: Option<PathBuf>,
    pub answers: Option<PathBuf>,
    pub offline: bool,
    pub config: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub store: Option<PathBuf>,
}

pub async fn execute(args: SimulateArgs) -> Result<()> {
    let config = load_config_from(args.config.as_deref())?;
    let definition = super::load_definition(&args.test)?;
    let answers = load_answers(args.answers.as_deref())?;

    let fetcher: Arc<dyn MediaFetcher>;
    let sink: Arc<dyn SubmissionSink>;
    let table;
    if args.offline {
        fetcher = Arc::new(MockMediaFetcher::new()) as Arc<dyn MediaFetcher>;
        sink = Arc::new(MockSubmissionSink::new()) as Arc<dyn SubmissionSink>;
        table = super::load_order(args.order.as_deref())?;
    } else {
        let client = Arc::new(ApiClient::from_config(&config.api)?);
        table = match &args.order {
            Some(path) => super::load_order(Some(path))?,
            None => {
                let source: &dyn OrderTableSource = client.as_ref();
                fetch_order_table(source, &definition.test_set_id).await
            }
        };
        fetcher = Arc::new(HttpMediaFetcher::new()?) as Arc<dyn MediaFetcher>;
        sink = client as Arc<dyn SubmissionSink>;
    }

    let store_dir = args.store.unwrap_or_else(|| config.store_dir.clone());
    tracing::info!(
        test = %args.test.display(),
        offline = args.offline,
        store = %store_dir.display(),
        "simulating session"
    );

    let mut running = ExamSession::new(definition, table, fetcher, sink)
        .with_store(Arc::new(FileStore::new(store_dir)))
        .with_config(config.engine_config())
        .start()?;

    let mut driver = Autopilot {
        handle: running.handle.clone(),
        answers,
        reloads: 0,
        retries: 0,
    };

    let mut failure = None;
    while let Some(notice) = running.notices.recv().await {
        if let Err(e) = driver.react(&notice) {
            running.handle.shutdown();
            failure = Some(e);
            break;
        }
    }

    let outcome = running.task.await.context("session task failed")?;
    if let Some(e) = failure {
        return Err(e);
    }

    let payload = outcome
        .payload
        .filter(|_| outcome.phase == PhaseState::Complete)
        .context("session ended without a submission")?;
    let json = serde_json::to_string_pretty(&payload)?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, &json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "Submitted {}/{} answers, payload written to {}",
                payload.answered(),
                payload.user_answers.len(),
                path.display()
            );
        }
        None => println!("{json}"),
    }

    Ok(())
}

fn load_answers(path: Option<&Path>) -> Result<BTreeMap<u32, OptionLetter>> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read answers: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse answers: {}", path.display()))
}

/// Plays the part of the user.
struct Autopilot {
    handle: SessionHandle,
    answers: BTreeMap<u32, OptionLetter>,
    reloads: u32,
    retries: u32,
}

impl Autopilot {
    fn react(&mut self, notice: &EngineNotice) -> Result<()> {
        match notice {
            EngineNotice::PhaseChanged { phase } => {
                tracing::debug!(?phase, "phase changed");
                match phase {
                    PhaseState::AwaitingDirection(_) => self.handle.dismiss_direction()?,
                    PhaseState::ListeningToReadingTransition => self.handle.start_reading()?,
                    PhaseState::ReadingTimed | PhaseState::PracticeTimed => {
                        for (&number, &letter) in &self.answers {
                            self.handle.select_answer(number, letter)?;
                        }
                        self.handle.submit()?;
                    }
                    _ => {}
                }
            }
            EngineNotice::ShowGroup {
                first_number,
                last_number,
                ..
            } => {
                for (&number, &letter) in self.answers.range(*first_number..=*last_number) {
                    self.handle.select_answer(number, letter)?;
                }
            }
            EngineNotice::PlayAudio { group_index, .. } => {
                self.handle.audio_ended(*group_index)?;
            }
            EngineNotice::NetworkError {
                group_index,
                reload_enabled,
                message,
                ..
            } => {
                if !reload_enabled || self.reloads >= MAX_RELOADS {
                    anyhow::bail!("audio for group {group_index} unavailable: {message}");
                }
                self.reloads += 1;
                tracing::warn!(group_index, attempt = self.reloads, "reloading audio");
                self.handle.reload()?;
            }
            EngineNotice::SubmissionFailed {
                message,
                retry_enabled,
            } => {
                if !retry_enabled || self.retries >= MAX_SUBMIT_RETRIES {
                    anyhow::bail!("submission failed: {message}");
                }
                self.retries += 1;
                tracing::warn!(attempt = self.retries, "retrying submission");
                self.handle.retry_submission()?;
            }
            EngineNotice::NavigationRefused { reason } => {
                tracing::debug!(%reason, "command refused");
            }
            EngineNotice::DegradedNumbering => {
                tracing::warn!("order table unusable, numbering contiguously");
            }
            EngineNotice::Submitted { .. } => {
                tracing::info!("submission accepted");
            }
            _ => {}
        }
        Ok(())
    }
}
