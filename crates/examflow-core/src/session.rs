//! Session driver.
//!
//! [`ExamSession`] wires a [`PhaseController`] to the outside world. One
//! tokio task owns the controller; it drains host input and effect
//! completions, sleeps until the controller's next deadline, and carries out
//! the effects the controller returns. Hosts talk to it through a cloneable
//! [`SessionHandle`] and read [`EngineNotice`]s from an unbounded channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::controller::{
    Completion, Effect, EngineNotice, PhaseController, PhaseState, PlaybackEvent,
    PlaybackEventKind, SessionInput, UserCommand,
};
use crate::error::{DefinitionError, SessionClosed};
use crate::model::{MediaKind, OptionLetter, TestDefinition};
use crate::order::BaseOrderTable;
use crate::preload::{PreloadManager, PreloadedMedia, DEFAULT_PRELOAD_TIMEOUT};
use crate::stall::{BufferedRange, DEFAULT_BUFFER_THRESHOLD, DEFAULT_STALL_GRACE};
use crate::store::{ActiveTest, MemoryStore, SessionStore, StoreKey, StoredResult};
use crate::submission::SubmissionPayload;
use crate::timer::{LISTENING_NOMINAL, READING_BUDGET};
use crate::traits::{MediaFetcher, OrderTableSource, SubmissionReceipt, SubmissionSink};

/// Tunables for a session. Defaults are the production values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between a listening group's lock and the next group.
    pub pacing_delay: Duration,
    /// Stand-in playback length for a listening group without audio.
    pub synthetic_delay: Duration,
    /// A stall only counts when less than this much audio is buffered ahead.
    pub buffer_threshold: Duration,
    pub stall_grace: Duration,
    pub preload_timeout: Duration,
    pub reading_budget: Duration,
    pub listening_nominal: Duration,
    pub tick_interval: Duration,
    /// Dismiss direction screens on their own after this long.
    pub direction_auto_dismiss: Option<Duration>,
    /// How many upcoming groups to warm.
    pub lookahead_groups: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pacing_delay: Duration::from_millis(800),
            synthetic_delay: Duration::from_millis(100),
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            stall_grace: DEFAULT_STALL_GRACE,
            preload_timeout: DEFAULT_PRELOAD_TIMEOUT,
            reading_budget: READING_BUDGET,
            listening_nominal: LISTENING_NOMINAL,
            tick_interval: Duration::from_secs(1),
            direction_auto_dismiss: None,
            lookahead_groups: 2,
        }
    }
}

/// Fetch the order table for a test set. A failed fetch is logged and
/// yields an empty table, which makes the session fall back to contiguous
/// numbering.
pub async fn fetch_order_table(source: &dyn OrderTableSource, test_set_id: &str) -> BaseOrderTable {
    match source.order_table(test_set_id).await {
        Ok(entries) => BaseOrderTable::from_entries(entries),
        Err(e) => {
            tracing::warn!(test_set_id, error = %e, "order table unavailable, numbering contiguously");
            BaseOrderTable::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A configured, not yet running, session.
pub struct ExamSession {
    definition: Arc<TestDefinition>,
    table: BaseOrderTable,
    fetcher: Arc<dyn MediaFetcher>,
    sink: Arc<dyn SubmissionSink>,
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
}

/// A session whose driver task is running.
pub struct RunningSession {
    pub handle: SessionHandle,
    pub notices: mpsc::UnboundedReceiver<EngineNotice>,
    pub task: JoinHandle<SessionOutcome>,
}

/// Final state reported when the driver task ends.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub phase: PhaseState,
    pub payload: Option<SubmissionPayload>,
    pub receipt: Option<SubmissionReceipt>,
}

impl ExamSession {
    pub fn new(
        definition: TestDefinition,
        table: BaseOrderTable,
        fetcher: Arc<dyn MediaFetcher>,
        sink: Arc<dyn SubmissionSink>,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            table,
            fetcher,
            sink,
            store: Arc::new(MemoryStore::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the definition and spawn the driver task.
    pub fn start(self) -> Result<RunningSession, DefinitionError> {
        self.definition.validate()?;

        for issue in self.table.audit(&self.definition) {
            tracing::warn!(%issue, "order table issue");
        }

        let preload = PreloadManager::with_timeout(self.fetcher, self.config.preload_timeout);
        let controller = PhaseController::new(Arc::clone(&self.definition), &self.table, self.config);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            controller,
            preload: preload.clone(),
            sink: self.sink,
            store: self.store,
            inputs: input_rx,
            notices: notice_tx,
            completion_tx,
            completions: completion_rx,
            tasks: Vec::new(),
            receipt: None,
        };

        tracing::info!(
            test_set = %self.definition.test_set_id,
            mode = ?self.definition.mode,
            groups = self.definition.question_groups.len(),
            "starting exam session"
        );
        let task = tokio::spawn(driver.run());

        Ok(RunningSession {
            handle: SessionHandle {
                inputs: input_tx,
                preload,
            },
            notices: notice_rx,
            task,
        })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DriverInput {
    Session(SessionInput),
    Shutdown,
}

/// Cloneable sender for host commands and playback events.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<DriverInput>,
    preload: PreloadManager,
}

impl SessionHandle {
    pub fn send(&self, input: SessionInput) -> Result<(), SessionClosed> {
        self.inputs
            .send(DriverInput::Session(input))
            .map_err(|_| SessionClosed)
    }

    pub fn command(&self, command: UserCommand) -> Result<(), SessionClosed> {
        self.send(SessionInput::Command(command))
    }

    pub fn dismiss_direction(&self) -> Result<(), SessionClosed> {
        self.command(UserCommand::DismissDirection)
    }

    pub fn start_reading(&self) -> Result<(), SessionClosed> {
        self.command(UserCommand::StartReading)
    }

    pub fn select_answer(&self, number: u32, letter: OptionLetter) -> Result<(), SessionClosed> {
        self.command(UserCommand::SelectAnswer { number, letter })
    }

    pub fn toggle_flag(&self, number: u32) -> Result<(), SessionClosed> {
        self.command(UserCommand::ToggleFlag { number })
    }

    pub fn go_to_question(&self, number: u32) -> Result<(), SessionClosed> {
        self.command(UserCommand::GoToQuestion(number))
    }

    pub fn submit(&self) -> Result<(), SessionClosed> {
        self.command(UserCommand::Submit)
    }

    pub fn reload(&self) -> Result<(), SessionClosed> {
        self.command(UserCommand::Reload)
    }

    pub fn retry_submission(&self) -> Result<(), SessionClosed> {
        self.command(UserCommand::RetrySubmission)
    }

    pub fn audio_progress(&self, group_index: usize, position: Duration) -> Result<(), SessionClosed> {
        self.playback(group_index, PlaybackEventKind::Progress { position })
    }

    pub fn audio_stalled(
        &self,
        group_index: usize,
        position: Duration,
        buffered: Vec<BufferedRange>,
    ) -> Result<(), SessionClosed> {
        self.playback(group_index, PlaybackEventKind::Stalled { position, buffered })
    }

    pub fn audio_ended(&self, group_index: usize) -> Result<(), SessionClosed> {
        self.playback(group_index, PlaybackEventKind::Ended)
    }

    fn playback(&self, group_index: usize, kind: PlaybackEventKind) -> Result<(), SessionClosed> {
        self.send(SessionInput::Playback(PlaybackEvent { group_index, kind }))
    }

    /// Stop the session, cancelling loads and releasing media.
    pub fn shutdown(&self) {
        let _ = self.inputs.send(DriverInput::Shutdown);
    }

    /// Preloaded media for `url`, if ready.
    pub fn media(&self, url: &str) -> Option<Arc<PreloadedMedia>> {
        self.preload.media(url)
    }

    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    controller: PhaseController,
    preload: PreloadManager,
    sink: Arc<dyn SubmissionSink>,
    store: Arc<dyn SessionStore>,
    inputs: mpsc::UnboundedReceiver<DriverInput>,
    notices: mpsc::UnboundedSender<EngineNotice>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    tasks: Vec<JoinHandle<()>>,
    receipt: Option<SubmissionReceipt>,
}

impl Driver {
    async fn run(mut self) -> SessionOutcome {
        let active = ActiveTest::new(self.controller.definition());
        if let Err(e) = self.store.put_typed(StoreKey::ActiveTest, &active) {
            tracing::warn!(error = %e, "could not record active test");
        }

        let effects = self.controller.start(Instant::now());
        self.apply(effects);

        while !self.controller.is_complete() {
            let deadline = self.controller.next_deadline();
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(DriverInput::Session(input)) => {
                        let effects = self.controller.handle_input(input, Instant::now());
                        self.apply(effects);
                    }
                    Some(DriverInput::Shutdown) | None => {
                        tracing::info!(phase = ?self.controller.phase(), "session shut down");
                        break;
                    }
                },
                Some(completion) = self.completions.recv() => {
                    let effects = self.controller.handle_completion(completion, Instant::now());
                    self.apply(effects);
                }
                _ = sleep => {
                    let effects = self.controller.poll(Instant::now());
                    self.apply(effects);
                }
            }

            self.tasks.retain(|t| !t.is_finished());
        }

        self.teardown();
        SessionOutcome {
            phase: self.controller.phase(),
            payload: self.controller.payload().cloned(),
            receipt: self.receipt,
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(notice) => {
                    if self.notices.send(notice).is_err() {
                        tracing::debug!("notice receiver dropped");
                    }
                }
                Effect::Warm(assets) => {
                    let started = self.preload.warm(assets.iter());
                    tracing::debug!(started, requested = assets.len(), "warming media");
                }
                Effect::LoadAudio { group_index, url } => {
                    let preload = self.preload.clone();
                    self.spawn(async move {
                        let result = preload.preload(&url, MediaKind::Audio).await.map(|_| ());
                        Completion::AudioLoaded {
                            group_index,
                            url,
                            result,
                        }
                    });
                }
                Effect::ReloadAudio { group_index, url } => {
                    let preload = self.preload.clone();
                    self.spawn(async move {
                        let result = preload.reload(&url, MediaKind::Audio).await.map(|_| ());
                        Completion::ReloadFinished {
                            group_index,
                            url,
                            result,
                        }
                    });
                }
                Effect::Submit(payload) => {
                    let sink = Arc::clone(&self.sink);
                    self.spawn(async move {
                        Completion::SubmissionFinished(sink.submit(&payload).await)
                    });
                }
                Effect::Persist(receipt) => {
                    self.persist(&receipt);
                    self.receipt = Some(receipt);
                }
            }
        }
    }

    fn spawn<F>(&mut self, work: F)
    where
        F: std::future::Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completion_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let _ = tx.send(work.await);
        }));
    }

    fn persist(&self, receipt: &SubmissionReceipt) {
        let Some(payload) = self.controller.payload() else {
            return;
        };
        let stored = StoredResult {
            test_set_id: payload.testset_id.clone(),
            answered: payload.answered(),
            total: payload.user_answers.len(),
            completion_time: payload.completion_time,
            result: receipt.result.clone(),
            completed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.put_typed(StoreKey::LatestResult, &stored) {
            tracing::warn!(error = %e, "could not store result");
        }
        if let Err(e) = self.store.take(StoreKey::ActiveTest) {
            tracing::warn!(error = %e, "could not clear active test");
        }
    }

    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.preload.shutdown();
    }
}
