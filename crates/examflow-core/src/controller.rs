//! Phase controller.
//!
//! A synchronous state machine that owns the session's phase, the answer
//! sheet, the stall monitor and the phase clocks. It never performs I/O:
//! every call takes the current instant and returns the [`Effect`]s the
//! driver must carry out. Results of those effects come back as
//! [`Completion`]s. [`PhaseController::next_deadline`] tells the driver when
//! to call [`PhaseController::poll`] next.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{MediaLoadError, NavigationError, SubmissionError};
use crate::model::{DeliveryMode, MediaAsset, OptionLetter, QuestionPart, TestDefinition};
use crate::navigation::Navigator;
use crate::order::{BaseOrderTable, Numbering};
use crate::session::EngineConfig;
use crate::stall::{BufferedRange, StallMonitor, StallSignal, StallState};
use crate::submission::{assemble, SubmissionPayload};
use crate::timer::{SegmentKind, TimerTick, TimerService};
use crate::traits::SubmissionReceipt;

// ---------------------------------------------------------------------------
// Phases and notices
// ---------------------------------------------------------------------------

/// Top-level session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "value", rename_all = "snake_case")]
pub enum PhaseState {
    /// Direction screen for a part; nothing loads until it is dismissed.
    AwaitingDirection(QuestionPart),
    /// Playing the listening group at this index.
    Listening(usize),
    ListeningToReadingTransition,
    ReadingTimed,
    PracticeTimed,
    Submitting,
    Complete,
}

impl PhaseState {
    fn accepts_answers(self) -> bool {
        matches!(
            self,
            PhaseState::Listening(_) | PhaseState::ReadingTimed | PhaseState::PracticeTimed
        )
    }
}

/// What the host should render or play. Emitted in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotice {
    PhaseChanged {
        phase: PhaseState,
    },
    /// Order table was unusable; numbers are contiguous from 1.
    DegradedNumbering,
    ShowGroup {
        group_index: usize,
        part: QuestionPart,
        first_number: u32,
        last_number: u32,
        images: Vec<String>,
    },
    PlayAudio {
        group_index: usize,
        url: String,
        from: Duration,
    },
    GroupLocked {
        group_index: usize,
        numbers: Vec<u32>,
    },
    WaitingForNetwork {
        group_index: usize,
    },
    NetworkRecovered {
        group_index: usize,
    },
    /// Playback is blocked until the user reloads.
    NetworkError {
        group_index: usize,
        attempts: u32,
        reload_enabled: bool,
        message: String,
    },
    AnswerRecorded {
        number: u32,
        letter: Option<OptionLetter>,
    },
    FlagToggled {
        number: u32,
        flagged: bool,
    },
    NavigationRefused {
        reason: String,
    },
    TimerTick {
        remaining: Duration,
    },
    TimeExpired,
    SubmissionFailed {
        message: String,
        retry_enabled: bool,
    },
    Submitted {
        receipt: SubmissionReceipt,
    },
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Commands issued by the user through the host.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    DismissDirection,
    StartReading,
    SelectAnswer { number: u32, letter: OptionLetter },
    ClearAnswer { number: u32 },
    ToggleFlag { number: u32 },
    GoToGroup(usize),
    GoToQuestion(u32),
    NextGroup,
    PreviousGroup,
    Submit,
    Reload,
    RetrySubmission,
}

/// Signal from the host's audio player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackEvent {
    pub group_index: usize,
    pub kind: PlaybackEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEventKind {
    Progress {
        position: Duration,
    },
    Stalled {
        position: Duration,
        buffered: Vec<BufferedRange>,
    },
    Ended,
}

/// Everything the host can send into a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Command(UserCommand),
    Playback(PlaybackEvent),
}

/// Result of an [`Effect`] the driver carried out.
#[derive(Debug, Clone)]
pub enum Completion {
    AudioLoaded {
        group_index: usize,
        url: String,
        result: Result<(), MediaLoadError>,
    },
    ReloadFinished {
        group_index: usize,
        url: String,
        result: Result<(), MediaLoadError>,
    },
    SubmissionFinished(Result<SubmissionReceipt, SubmissionError>),
}

/// Work the driver must perform on the controller's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notify(EngineNotice),
    /// Start background loads, in order.
    Warm(Vec<MediaAsset>),
    LoadAudio { group_index: usize, url: String },
    ReloadAudio { group_index: usize, url: String },
    Submit(SubmissionPayload),
    /// Store the grading result for the result pages.
    Persist(SubmissionReceipt),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListeningStage {
    AwaitingMedia,
    Playing,
    SyntheticDelay { until: Instant },
    Pacing { until: Instant },
}

#[derive(Debug, Clone)]
struct ActiveAudio {
    group_index: usize,
    url: String,
    position: Duration,
    ready: bool,
    reloads: u32,
}

pub struct PhaseController {
    definition: Arc<TestDefinition>,
    navigator: Navigator,
    config: EngineConfig,
    phase: PhaseState,
    current_group: usize,
    pending_group: Option<usize>,
    directions_seen: HashSet<QuestionPart>,
    direction_deadline: Option<Instant>,
    stage: Option<ListeningStage>,
    audio: Option<ActiveAudio>,
    stall: StallMonitor,
    timers: TimerService,
    next_tick: Option<Instant>,
    payload: Option<SubmissionPayload>,
    submit_in_flight: bool,
}

impl PhaseController {
    pub fn new(definition: Arc<TestDefinition>, table: &BaseOrderTable, config: EngineConfig) -> Self {
        let navigator = Navigator::new(&definition, table);
        let stall = StallMonitor::new(config.buffer_threshold, config.stall_grace);
        Self {
            definition,
            navigator,
            config,
            phase: PhaseState::AwaitingDirection(QuestionPart::Part1),
            current_group: 0,
            pending_group: None,
            directions_seen: HashSet::new(),
            direction_deadline: None,
            stage: None,
            audio: None,
            stall,
            timers: TimerService::new(),
            next_tick: None,
            payload: None,
            submit_in_flight: false,
        }
    }

    pub fn phase(&self) -> PhaseState {
        self.phase
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn definition(&self) -> &TestDefinition {
        &self.definition
    }

    pub fn current_group(&self) -> usize {
        self.current_group
    }

    pub fn stall_state(&self) -> StallState {
        self.stall.state()
    }

    /// The assembled payload, once submission has begun.
    pub fn payload(&self) -> Option<&SubmissionPayload> {
        self.payload.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == PhaseState::Complete
    }

    /// Enter the first phase.
    pub fn start(&mut self, now: Instant) -> Vec<Effect> {
        let mut out = Vec::new();

        if self.navigator.numbering() == Numbering::Contiguous {
            out.push(Effect::Notify(EngineNotice::DegradedNumbering));
        }
        self.warm_from(0, &mut out);

        match self.definition.mode {
            DeliveryMode::Exam => {
                if self.group(0).is_listening() {
                    self.timers.start_untimed(
                        SegmentKind::Listening,
                        self.config.listening_nominal,
                        now,
                    );
                    self.enter_listening(0, now, &mut out);
                } else {
                    self.enter_transition(now, &mut out);
                }
            }
            DeliveryMode::Practice => {
                let part = self.group(0).question_part;
                self.show_direction(part, 0, now, &mut out);
            }
        }

        out
    }

    pub fn handle_input(&mut self, input: SessionInput, now: Instant) -> Vec<Effect> {
        let mut out = Vec::new();
        match input {
            SessionInput::Command(command) => self.on_command(command, now, &mut out),
            SessionInput::Playback(event) => self.on_playback(event, now, &mut out),
        }
        out
    }

    pub fn handle_completion(&mut self, completion: Completion, _now: Instant) -> Vec<Effect> {
        let mut out = Vec::new();
        match completion {
            Completion::AudioLoaded {
                group_index,
                url,
                result,
            } => self.on_audio_loaded(group_index, &url, result, &mut out),
            Completion::ReloadFinished {
                group_index,
                url,
                result,
            } => self.on_reload_finished(group_index, &url, result, &mut out),
            Completion::SubmissionFinished(result) => self.on_submission_finished(result, &mut out),
        }
        out
    }

    /// Fire every deadline that has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<Effect> {
        let mut out = Vec::new();

        if self.direction_deadline.is_some_and(|d| now >= d) {
            tracing::debug!("direction auto-dismissed");
            self.dismiss_direction(now, &mut out);
        }

        if let PhaseState::Listening(index) = self.phase {
            match self.stage {
                Some(ListeningStage::SyntheticDelay { until }) if now >= until => {
                    self.begin_advance(index, now, &mut out);
                }
                Some(ListeningStage::Pacing { until }) if now >= until => {
                    self.advance_from(index, now, &mut out);
                }
                _ => {}
            }
        }

        if self.stall.poll(now) == StallSignal::Escalated {
            if let Some(audio) = &self.audio {
                out.push(Effect::Notify(EngineNotice::NetworkError {
                    group_index: audio.group_index,
                    attempts: audio.reloads,
                    reload_enabled: true,
                    message: "playback stalled".into(),
                }));
            }
        }

        if self.timers.deadline().is_some_and(|d| now >= d)
            && self.timers.tick(now) == Some(TimerTick::Expired)
        {
            tracing::info!(phase = ?self.phase, "time expired");
            out.push(Effect::Notify(EngineNotice::TimeExpired));
            self.begin_submit(now, &mut out);
        }

        if let Some(tick_at) = self.next_tick {
            if now >= tick_at {
                if let Some(remaining) = self.timers.remaining(now) {
                    out.push(Effect::Notify(EngineNotice::TimerTick { remaining }));
                }
                self.next_tick = Some(now + self.config.tick_interval);
            }
        }

        out
    }

    /// Earliest instant at which [`PhaseController::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let stage = match self.stage {
            Some(ListeningStage::SyntheticDelay { until })
            | Some(ListeningStage::Pacing { until }) => Some(until),
            _ => None,
        };
        [
            self.direction_deadline,
            stage,
            self.stall.deadline(),
            self.timers.deadline(),
            self.next_tick,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // -- commands -----------------------------------------------------------

    fn on_command(&mut self, command: UserCommand, now: Instant, out: &mut Vec<Effect>) {
        tracing::debug!(?command, phase = ?self.phase, "command");
        match command {
            UserCommand::DismissDirection => self.dismiss_direction(now, out),
            UserCommand::StartReading => self.start_reading(now, out),
            UserCommand::SelectAnswer { number, letter } => {
                let result = self
                    .answerable()
                    .and_then(|_| self.navigator.try_set_answer(number, letter));
                self.report(result.map(|_| EngineNotice::AnswerRecorded {
                    number,
                    letter: Some(letter),
                }), out);
            }
            UserCommand::ClearAnswer { number } => {
                let result = self
                    .answerable()
                    .and_then(|_| self.navigator.clear_answer(number));
                self.report(result.map(|_| EngineNotice::AnswerRecorded {
                    number,
                    letter: None,
                }), out);
            }
            UserCommand::ToggleFlag { number } => {
                let result = self
                    .answerable()
                    .and_then(|_| self.navigator.toggle_flag(number));
                self.report(
                    result.map(|flagged| EngineNotice::FlagToggled { number, flagged }),
                    out,
                );
            }
            UserCommand::GoToGroup(target) => {
                let result = self.navigate(target, out);
                self.report_refusal(result, out);
            }
            UserCommand::GoToQuestion(number) => {
                let result = self
                    .navigator
                    .locate(number)
                    .and_then(|pos| self.navigate(pos.group_index, out));
                self.report_refusal(result, out);
            }
            UserCommand::NextGroup => {
                let target = self.current_group + 1;
                let result = if target >= self.definition.question_groups.len() {
                    Err(NavigationError::AtEdge("last"))
                } else {
                    self.navigate(target, out)
                };
                self.report_refusal(result, out);
            }
            UserCommand::PreviousGroup => {
                let result = match self.current_group.checked_sub(1) {
                    Some(target) => self.navigate(target, out),
                    None => Err(NavigationError::AtEdge("first")),
                };
                self.report_refusal(result, out);
            }
            UserCommand::Submit => self.begin_submit(now, out),
            UserCommand::Reload => self.reload(out),
            UserCommand::RetrySubmission => self.retry_submission(out),
        }
    }

    fn answerable(&self) -> Result<(), NavigationError> {
        if self.phase.accepts_answers() {
            Ok(())
        } else {
            Err(NavigationError::NotNavigable)
        }
    }

    fn report(&self, result: Result<EngineNotice, NavigationError>, out: &mut Vec<Effect>) {
        match result {
            Ok(notice) => out.push(Effect::Notify(notice)),
            Err(err) => self.report_refusal(Err(err), out),
        }
    }

    fn report_refusal(&self, result: Result<(), NavigationError>, out: &mut Vec<Effect>) {
        if let Err(err) = result {
            tracing::debug!(error = %err, phase = ?self.phase, "command refused");
            out.push(Effect::Notify(EngineNotice::NavigationRefused {
                reason: err.to_string(),
            }));
        }
    }

    // -- directions ---------------------------------------------------------

    fn show_direction(
        &mut self,
        part: QuestionPart,
        group_index: usize,
        now: Instant,
        out: &mut Vec<Effect>,
    ) {
        self.directions_seen.insert(part);
        self.pending_group = Some(group_index);
        self.direction_deadline = self.config.direction_auto_dismiss.map(|d| now + d);
        self.set_phase(PhaseState::AwaitingDirection(part), out);
    }

    fn dismiss_direction(&mut self, now: Instant, out: &mut Vec<Effect>) {
        self.direction_deadline = None;
        let (PhaseState::AwaitingDirection(_), Some(index)) = (self.phase, self.pending_group.take())
        else {
            self.report_refusal(Err(NavigationError::NotNavigable), out);
            return;
        };

        match self.definition.mode {
            DeliveryMode::Exam => self.begin_listening_group(index, now, out),
            DeliveryMode::Practice => {
                match self.definition.time_limit {
                    Some(minutes) => {
                        let budget = Duration::from_secs(u64::from(minutes) * 60);
                        self.timers
                            .start_countdown(SegmentKind::Practice, budget, now);
                        self.next_tick = Some(now + self.config.tick_interval);
                    }
                    None => self.timers.start_stopwatch(SegmentKind::Practice, now),
                }
                self.set_phase(PhaseState::PracticeTimed, out);
                self.show_practice_group(index, out);
            }
        }
    }

    // -- listening ----------------------------------------------------------

    fn enter_listening(&mut self, index: usize, now: Instant, out: &mut Vec<Effect>) {
        let part = self.group(index).question_part;
        if self.directions_seen.contains(&part) {
            self.begin_listening_group(index, now, out);
        } else {
            self.show_direction(part, index, now, out);
        }
    }

    fn begin_listening_group(&mut self, index: usize, now: Instant, out: &mut Vec<Effect>) {
        self.current_group = index;
        self.set_phase(PhaseState::Listening(index), out);
        self.show_group(index, out);
        self.warm_from(index + 1, out);
        self.stall.reset();

        match self.group(index).audio().map(|a| a.url.clone()) {
            Some(url) => {
                self.stage = Some(ListeningStage::AwaitingMedia);
                self.start_audio(index, url, out);
            }
            None => {
                tracing::debug!(group = index, "group has no audio, using synthetic delay");
                self.audio = None;
                self.stage = Some(ListeningStage::SyntheticDelay {
                    until: now + self.config.synthetic_delay,
                });
            }
        }
    }

    fn start_audio(&mut self, group_index: usize, url: String, out: &mut Vec<Effect>) {
        out.push(Effect::LoadAudio {
            group_index,
            url: url.clone(),
        });
        self.audio = Some(ActiveAudio {
            group_index,
            url,
            position: Duration::ZERO,
            ready: false,
            reloads: 0,
        });
    }

    /// Lock the finished group and start pacing.
    fn begin_advance(&mut self, index: usize, now: Instant, out: &mut Vec<Effect>) {
        self.audio = None;
        if self.stall.reset() == StallSignal::WaitingCleared {
            out.push(Effect::Notify(EngineNotice::NetworkRecovered { group_index: index }));
        }
        match self.navigator.lock(index) {
            Ok(outcome) => out.push(Effect::Notify(EngineNotice::GroupLocked {
                group_index: index,
                numbers: outcome.newly_locked,
            })),
            Err(err) => tracing::warn!(group = index, error = %err, "could not lock group"),
        }
        self.stage = Some(ListeningStage::Pacing {
            until: now + self.config.pacing_delay,
        });
    }

    fn advance_from(&mut self, index: usize, now: Instant, out: &mut Vec<Effect>) {
        self.stage = None;
        let next = index + 1;
        if next < self.definition.question_groups.len() && self.group(next).is_listening() {
            self.enter_listening(next, now, out);
        } else {
            self.enter_transition(now, out);
        }
    }

    fn enter_transition(&mut self, now: Instant, out: &mut Vec<Effect>) {
        self.timers.stop(now);
        self.stage = None;
        self.audio = None;
        match self.definition.first_reading_group() {
            Some(first) => {
                self.set_phase(PhaseState::ListeningToReadingTransition, out);
                self.warm_from(first, out);
            }
            None => {
                tracing::info!("no reading groups, submitting after listening");
                self.begin_submit(now, out);
            }
        }
    }

    // -- playback -----------------------------------------------------------

    fn on_playback(&mut self, event: PlaybackEvent, now: Instant, out: &mut Vec<Effect>) {
        let Some(audio) = self
            .audio
            .as_mut()
            .filter(|a| a.group_index == event.group_index && a.ready)
        else {
            tracing::debug!(group = event.group_index, kind = ?event.kind, "playback event for inactive audio ignored");
            return;
        };

        match event.kind {
            PlaybackEventKind::Progress { position } => {
                audio.position = position;
                if self.stall.on_progress(now) == StallSignal::WaitingCleared {
                    out.push(Effect::Notify(EngineNotice::NetworkRecovered {
                        group_index: event.group_index,
                    }));
                }
            }
            PlaybackEventKind::Stalled { position, buffered } => {
                audio.position = position;
                if self.stall.on_stall(now, position, &buffered) == StallSignal::WaitingShown {
                    out.push(Effect::Notify(EngineNotice::WaitingForNetwork {
                        group_index: event.group_index,
                    }));
                }
            }
            PlaybackEventKind::Ended => {
                if self.stall.is_blocked() {
                    // Stays blocked until a reload succeeds.
                    tracing::debug!(group = event.group_index, "audio ended while blocked, ignored");
                } else if self.phase == PhaseState::Listening(event.group_index)
                    && self.stage == Some(ListeningStage::Playing)
                {
                    self.begin_advance(event.group_index, now, out);
                } else {
                    tracing::debug!(group = event.group_index, "audio ended");
                }
            }
        }
    }

    fn on_audio_loaded(
        &mut self,
        group_index: usize,
        url: &str,
        result: Result<(), MediaLoadError>,
        out: &mut Vec<Effect>,
    ) {
        let Some(audio) = self
            .audio
            .as_mut()
            .filter(|a| a.group_index == group_index && a.url == url && !a.ready)
        else {
            tracing::debug!(group = group_index, url, "stale audio load ignored");
            return;
        };

        match result {
            Ok(()) => {
                audio.ready = true;
                let from = audio.position;
                if self.stage == Some(ListeningStage::AwaitingMedia) {
                    self.stage = Some(ListeningStage::Playing);
                }
                out.push(Effect::Notify(EngineNotice::PlayAudio {
                    group_index,
                    url: url.to_string(),
                    from,
                }));
            }
            Err(err) => {
                tracing::warn!(group = group_index, error = %err, "audio failed to load");
                let attempts = audio.reloads;
                self.stall.fail_load(audio.position);
                out.push(Effect::Notify(EngineNotice::NetworkError {
                    group_index,
                    attempts,
                    reload_enabled: true,
                    message: err.to_string(),
                }));
            }
        }
    }

    fn reload(&mut self, out: &mut Vec<Effect>) {
        let Some(audio) = self.audio.as_mut() else {
            tracing::debug!("reload requested with no active audio");
            return;
        };
        if self.stall.begin_reload().is_none() {
            tracing::debug!(group = audio.group_index, "reload not available");
            return;
        }
        audio.reloads += 1;
        audio.ready = false;
        out.push(Effect::Notify(EngineNotice::NetworkError {
            group_index: audio.group_index,
            attempts: audio.reloads,
            reload_enabled: false,
            message: "reloading".into(),
        }));
        out.push(Effect::ReloadAudio {
            group_index: audio.group_index,
            url: audio.url.clone(),
        });
    }

    fn on_reload_finished(
        &mut self,
        group_index: usize,
        url: &str,
        result: Result<(), MediaLoadError>,
        out: &mut Vec<Effect>,
    ) {
        let Some(audio) = self
            .audio
            .as_mut()
            .filter(|a| a.group_index == group_index && a.url == url)
        else {
            tracing::debug!(group = group_index, url, "stale reload ignored");
            return;
        };

        match result {
            Ok(()) => {
                let from = self.stall.finish_reload(true).unwrap_or(audio.position);
                audio.ready = true;
                audio.position = from;
                if self.stage == Some(ListeningStage::AwaitingMedia) {
                    self.stage = Some(ListeningStage::Playing);
                }
                tracing::info!(group = group_index, ?from, "reload succeeded");
                out.push(Effect::Notify(EngineNotice::NetworkRecovered { group_index }));
                out.push(Effect::Notify(EngineNotice::PlayAudio {
                    group_index,
                    url: url.to_string(),
                    from,
                }));
                self.warm_from(self.current_group + 1, out);
            }
            Err(err) => {
                tracing::warn!(group = group_index, error = %err, "reload failed");
                self.stall.finish_reload(false);
                out.push(Effect::Notify(EngineNotice::NetworkError {
                    group_index,
                    attempts: audio.reloads,
                    reload_enabled: true,
                    message: err.to_string(),
                }));
            }
        }
    }

    // -- reading and practice -----------------------------------------------

    fn start_reading(&mut self, now: Instant, out: &mut Vec<Effect>) {
        let (PhaseState::ListeningToReadingTransition, Some(first)) =
            (self.phase, self.definition.first_reading_group())
        else {
            self.report_refusal(Err(NavigationError::NotNavigable), out);
            return;
        };

        self.timers
            .start_countdown(SegmentKind::Reading, self.config.reading_budget, now);
        self.next_tick = Some(now + self.config.tick_interval);
        self.current_group = first;
        self.set_phase(PhaseState::ReadingTimed, out);
        self.show_group(first, out);
        out.push(Effect::Notify(EngineNotice::TimerTick {
            remaining: self.config.reading_budget,
        }));
        self.warm_from(first + 1, out);
    }

    fn navigate(&mut self, target: usize, out: &mut Vec<Effect>) -> Result<(), NavigationError> {
        if target >= self.definition.question_groups.len() {
            return Err(NavigationError::NoSuchGroup(target));
        }
        match self.phase {
            PhaseState::ReadingTimed => {
                let first = self.definition.first_reading_group().unwrap_or(0);
                if target < first {
                    return Err(NavigationError::BoundaryCrossing { target });
                }
                self.current_group = target;
                self.show_group(target, out);
                self.warm_from(target + 1, out);
                Ok(())
            }
            PhaseState::PracticeTimed => {
                self.show_practice_group(target, out);
                Ok(())
            }
            _ => Err(NavigationError::NotNavigable),
        }
    }

    fn show_practice_group(&mut self, index: usize, out: &mut Vec<Effect>) {
        self.current_group = index;
        self.show_group(index, out);
        self.warm_from(index + 1, out);
        self.stall.reset();
        match self.group(index).audio().map(|a| a.url.clone()) {
            Some(url) => self.start_audio(index, url, out),
            None => self.audio = None,
        }
    }

    // -- submission ---------------------------------------------------------

    fn begin_submit(&mut self, now: Instant, out: &mut Vec<Effect>) {
        if self.payload.is_some() {
            tracing::debug!("submission already started, ignoring");
            return;
        }

        self.timers.stop(now);
        self.next_tick = None;
        self.direction_deadline = None;
        self.pending_group = None;
        self.stage = None;
        self.audio = None;
        self.stall.reset();

        let payload = assemble(
            &self.definition,
            &self.navigator,
            self.timers.total_elapsed(now),
        );
        tracing::info!(
            answered = payload.answered(),
            total = payload.user_answers.len(),
            completion_time = payload.completion_time,
            "submitting"
        );

        self.set_phase(PhaseState::Submitting, out);
        self.submit_in_flight = true;
        out.push(Effect::Submit(payload.clone()));
        self.payload = Some(payload);
    }

    fn retry_submission(&mut self, out: &mut Vec<Effect>) {
        match (&self.payload, self.phase, self.submit_in_flight) {
            (Some(payload), PhaseState::Submitting, false) => {
                tracing::info!("retrying submission");
                self.submit_in_flight = true;
                out.push(Effect::Submit(payload.clone()));
            }
            _ => tracing::debug!(phase = ?self.phase, "retry not available"),
        }
    }

    fn on_submission_finished(
        &mut self,
        result: Result<SubmissionReceipt, SubmissionError>,
        out: &mut Vec<Effect>,
    ) {
        self.submit_in_flight = false;
        if self.phase != PhaseState::Submitting {
            tracing::debug!(phase = ?self.phase, "late submission result ignored");
            return;
        }
        match result {
            Ok(receipt) => {
                self.set_phase(PhaseState::Complete, out);
                out.push(Effect::Persist(receipt.clone()));
                out.push(Effect::Notify(EngineNotice::Submitted { receipt }));
            }
            Err(err) => {
                tracing::warn!(error = %err, "submission failed");
                out.push(Effect::Notify(EngineNotice::SubmissionFailed {
                    message: err.to_string(),
                    retry_enabled: true,
                }));
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn group(&self, index: usize) -> &crate::model::QuestionGroup {
        &self.definition.question_groups[index]
    }

    fn set_phase(&mut self, phase: PhaseState, out: &mut Vec<Effect>) {
        tracing::info!(from = ?self.phase, to = ?phase, "phase changed");
        self.phase = phase;
        out.push(Effect::Notify(EngineNotice::PhaseChanged { phase }));
    }

    fn show_group(&self, index: usize, out: &mut Vec<Effect>) {
        let group = self.group(index);
        let Some(range) = self.navigator.group_range(index) else {
            return;
        };
        out.push(Effect::Notify(EngineNotice::ShowGroup {
            group_index: index,
            part: group.question_part,
            first_number: *range.start(),
            last_number: *range.end(),
            images: group.images().into_iter().map(|a| a.url.clone()).collect(),
        }));
    }

    /// Queue media for the groups starting at `from`, within the lookahead.
    fn warm_from(&self, from: usize, out: &mut Vec<Effect>) {
        let groups = &self.definition.question_groups;
        if from >= groups.len() {
            return;
        }
        let end = (from + self.config.lookahead_groups).min(groups.len());
        let assets: Vec<MediaAsset> = groups[from..end]
            .iter()
            .flat_map(|g| g.media().into_iter().cloned())
            .collect();
        if !assets.is_empty() {
            out.push(Effect::Warm(assets));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{contiguous_table, definition, group};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn controller(groups: Vec<crate::model::QuestionGroup>, mode: DeliveryMode) -> PhaseController {
        let def = definition(groups, mode);
        let table = contiguous_table(&def, 1);
        PhaseController::new(Arc::new(def), &table, EngineConfig::default())
    }

    fn notices(effects: &[Effect]) -> Vec<&EngineNotice> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn command(c: &mut PhaseController, cmd: UserCommand, now: Instant) -> Vec<Effect> {
        c.handle_input(SessionInput::Command(cmd), now)
    }

    fn playback(c: &mut PhaseController, group_index: usize, kind: PlaybackEventKind, now: Instant) -> Vec<Effect> {
        c.handle_input(SessionInput::Playback(PlaybackEvent { group_index, kind }), now)
    }

    fn loaded(c: &mut PhaseController, group_index: usize, now: Instant) -> Vec<Effect> {
        let url = c.group(group_index).audio().unwrap().url.clone();
        c.handle_completion(
            Completion::AudioLoaded {
                group_index,
                url,
                result: Ok(()),
            },
            now,
        )
    }

    fn letter(c: char) -> OptionLetter {
        OptionLetter::new(c).unwrap()
    }

    fn two_listening_one_reading() -> PhaseController {
        controller(
            vec![
                group("l1", QuestionPart::Part1, 2, true),
                group("l2", QuestionPart::Part1, 2, true),
                group("r1", QuestionPart::Part5, 3, false),
            ],
            DeliveryMode::Exam,
        )
    }

    #[test]
    fn exam_waits_on_direction_before_loading_audio() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        let fx = c.start(t0);

        assert_eq!(c.phase(), PhaseState::AwaitingDirection(QuestionPart::Part1));
        assert!(!fx.iter().any(|e| matches!(e, Effect::LoadAudio { .. })));
        assert!(fx.iter().any(|e| matches!(e, Effect::Warm(_))));

        let fx = command(&mut c, UserCommand::DismissDirection, t0);
        assert_eq!(c.phase(), PhaseState::Listening(0));
        assert!(fx.contains(&Effect::LoadAudio {
            group_index: 0,
            url: "https://cdn.example/l1.mp3".into()
        }));
    }

    #[test]
    fn audio_end_locks_paces_and_advances() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        let fx = loaded(&mut c, 0, t0);
        assert!(matches!(notices(&fx)[..], [EngineNotice::PlayAudio { group_index: 0, .. }]));

        command(&mut c, UserCommand::SelectAnswer { number: 1, letter: letter('C') }, t0);
        let t1 = t0 + Duration::from_secs(30);
        let fx = playback(&mut c, 0, PlaybackEventKind::Ended, t1);
        assert!(notices(&fx).contains(&&EngineNotice::GroupLocked {
            group_index: 0,
            numbers: vec![1, 2]
        }));
        assert_eq!(c.next_deadline(), Some(t1 + ms(800)));

        // Duplicate end while pacing changes nothing.
        assert!(playback(&mut c, 0, PlaybackEventKind::Ended, t1 + ms(10)).is_empty());

        assert!(c.poll(t1 + ms(799)).is_empty());
        assert_eq!(c.phase(), PhaseState::Listening(0));
        c.poll(t1 + ms(800));
        // Same part, so no second direction screen.
        assert_eq!(c.phase(), PhaseState::Listening(1));

        let fx = command(&mut c, UserCommand::SelectAnswer { number: 1, letter: letter('A') }, t1 + ms(900));
        assert!(matches!(notices(&fx)[..], [EngineNotice::NavigationRefused { .. }]));
        assert_eq!(c.navigator().answer(1), Some(letter('C')));
    }

    #[test]
    fn group_without_audio_advances_after_synthetic_delay() {
        let mut c = controller(
            vec![
                group("l1", QuestionPart::Part2, 1, false),
                group("r1", QuestionPart::Part6, 1, false),
            ],
            DeliveryMode::Exam,
        );
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        assert_eq!(c.next_deadline(), Some(t0 + ms(100)));

        c.poll(t0 + ms(100));
        assert!(c.navigator().is_locked(1));
        assert_eq!(c.next_deadline(), Some(t0 + ms(900)));

        c.poll(t0 + ms(900));
        assert_eq!(c.phase(), PhaseState::ListeningToReadingTransition);
    }

    #[test]
    fn new_listening_part_shows_its_direction() {
        let mut c = controller(
            vec![
                group("l1", QuestionPart::Part1, 1, false),
                group("l2", QuestionPart::Part2, 1, false),
                group("r1", QuestionPart::Part5, 1, false),
            ],
            DeliveryMode::Exam,
        );
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        c.poll(t0 + ms(100));
        c.poll(t0 + ms(900));
        assert_eq!(c.phase(), PhaseState::AwaitingDirection(QuestionPart::Part2));
        command(&mut c, UserCommand::DismissDirection, t0 + ms(950));
        assert_eq!(c.phase(), PhaseState::Listening(1));
    }

    #[test]
    fn direction_auto_dismisses_when_configured() {
        let def = definition(vec![group("l1", QuestionPart::Part1, 1, true)], DeliveryMode::Exam);
        let table = contiguous_table(&def, 1);
        let config = EngineConfig {
            direction_auto_dismiss: Some(Duration::from_secs(10)),
            ..EngineConfig::default()
        };
        let mut c = PhaseController::new(Arc::new(def), &table, config);
        let t0 = Instant::now();
        c.start(t0);
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_secs(10)));
        let fx = c.poll(t0 + Duration::from_secs(10));
        assert_eq!(c.phase(), PhaseState::Listening(0));
        assert!(fx.iter().any(|e| matches!(e, Effect::LoadAudio { .. })));
    }

    #[test]
    fn stall_escalates_after_grace_and_reload_resumes() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        loaded(&mut c, 0, t0);

        let stall_at = t0 + Duration::from_secs(20);
        let fx = playback(
            &mut c,
            0,
            PlaybackEventKind::Stalled {
                position: Duration::from_secs(20),
                buffered: vec![],
            },
            stall_at,
        );
        assert_eq!(notices(&fx), vec![&EngineNotice::WaitingForNetwork { group_index: 0 }]);
        assert_eq!(c.next_deadline(), Some(stall_at + Duration::from_secs(5)));

        let fx = c.poll(stall_at + Duration::from_secs(5));
        assert!(matches!(
            notices(&fx)[..],
            [EngineNotice::NetworkError { reload_enabled: true, attempts: 0, .. }]
        ));

        let fx = command(&mut c, UserCommand::Reload, stall_at + Duration::from_secs(6));
        assert!(fx.contains(&Effect::ReloadAudio {
            group_index: 0,
            url: "https://cdn.example/l1.mp3".into()
        }));
        // Second click while in flight does nothing.
        assert!(command(&mut c, UserCommand::Reload, stall_at + Duration::from_secs(6)).is_empty());

        let fx = c.handle_completion(
            Completion::ReloadFinished {
                group_index: 0,
                url: "https://cdn.example/l1.mp3".into(),
                result: Ok(()),
            },
            stall_at + Duration::from_secs(7),
        );
        assert!(notices(&fx).contains(&&EngineNotice::PlayAudio {
            group_index: 0,
            url: "https://cdn.example/l1.mp3".into(),
            from: Duration::from_secs(20),
        }));
        assert_eq!(c.stall_state(), StallState::Idle);
    }

    #[test]
    fn recovery_inside_grace_clears_indicator() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        loaded(&mut c, 0, t0);

        playback(
            &mut c,
            0,
            PlaybackEventKind::Stalled { position: Duration::from_secs(4), buffered: vec![] },
            t0,
        );
        let fx = playback(
            &mut c,
            0,
            PlaybackEventKind::Progress { position: Duration::from_secs(5) },
            t0 + Duration::from_secs(3),
        );
        assert_eq!(notices(&fx), vec![&EngineNotice::NetworkRecovered { group_index: 0 }]);
        assert!(c.poll(t0 + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn audio_end_while_blocked_does_not_advance() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        loaded(&mut c, 0, t0);

        playback(
            &mut c,
            0,
            PlaybackEventKind::Stalled { position: Duration::from_secs(3), buffered: vec![] },
            t0,
        );
        let fx = c.poll(t0 + Duration::from_secs(5));
        assert!(matches!(notices(&fx)[..], [EngineNotice::NetworkError { attempts: 0, .. }]));

        let fx = playback(&mut c, 0, PlaybackEventKind::Ended, t0 + Duration::from_secs(6));
        assert!(fx.is_empty());
        assert!(!c.navigator().is_locked(1));
        assert_eq!(
            c.stall_state(),
            StallState::Blocked { position: Duration::from_secs(3), reload_in_flight: false }
        );

        assert!(c.poll(t0 + Duration::from_secs(7)).is_empty());
        assert_eq!(c.phase(), PhaseState::Listening(0));
        assert_eq!(c.next_deadline(), None);
    }

    fn warmed(effects: &[Effect]) -> Vec<Vec<&str>> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Warm(assets) => Some(assets.iter().map(|a| a.url.as_str()).collect()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn playing_group_warms_the_next_two_groups() {
        let mut c = controller(
            vec![
                group("l1", QuestionPart::Part1, 1, true),
                group("l2", QuestionPart::Part1, 1, true),
                group("l3", QuestionPart::Part1, 1, true),
                group("l4", QuestionPart::Part1, 1, true),
            ],
            DeliveryMode::Exam,
        );
        let t0 = Instant::now();
        c.start(t0);

        let fx = command(&mut c, UserCommand::DismissDirection, t0);
        assert_eq!(
            warmed(&fx),
            vec![vec!["https://cdn.example/l2.mp3", "https://cdn.example/l3.mp3"]]
        );

        loaded(&mut c, 0, t0);
        playback(
            &mut c,
            0,
            PlaybackEventKind::Stalled { position: Duration::from_secs(1), buffered: vec![] },
            t0,
        );
        c.poll(t0 + Duration::from_secs(5));
        command(&mut c, UserCommand::Reload, t0 + Duration::from_secs(6));
        let fx = c.handle_completion(
            Completion::ReloadFinished {
                group_index: 0,
                url: "https://cdn.example/l1.mp3".into(),
                result: Ok(()),
            },
            t0 + Duration::from_secs(7),
        );
        assert_eq!(
            warmed(&fx),
            vec![vec!["https://cdn.example/l2.mp3", "https://cdn.example/l3.mp3"]]
        );

        // Advancing to group 1 moves the window to groups 2 and 3.
        playback(&mut c, 0, PlaybackEventKind::Ended, t0 + Duration::from_secs(8));
        let fx = c.poll(t0 + Duration::from_secs(8) + ms(800));
        assert_eq!(c.phase(), PhaseState::Listening(1));
        assert_eq!(
            warmed(&fx),
            vec![vec!["https://cdn.example/l3.mp3", "https://cdn.example/l4.mp3"]]
        );
    }

    #[test]
    fn failed_load_blocks_until_reload() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        let fx = c.handle_completion(
            Completion::AudioLoaded {
                group_index: 0,
                url: "https://cdn.example/l1.mp3".into(),
                result: Err(MediaLoadError::Timeout {
                    url: "https://cdn.example/l1.mp3".into(),
                    secs: 10,
                }),
            },
            t0 + Duration::from_secs(10),
        );
        assert!(matches!(notices(&fx)[..], [EngineNotice::NetworkError { .. }]));
        assert!(matches!(c.stall_state(), StallState::Blocked { .. }));

        // Playback events are ignored until the reload completes.
        assert!(playback(&mut c, 0, PlaybackEventKind::Ended, t0 + Duration::from_secs(11)).is_empty());
        assert_eq!(c.phase(), PhaseState::Listening(0));
    }

    #[test]
    fn reading_refuses_listening_groups_and_expires_once() {
        let mut c = two_listening_one_reading();
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);
        for g in 0..2 {
            loaded(&mut c, g, t0);
            playback(&mut c, g, PlaybackEventKind::Ended, t0);
            c.poll(t0 + ms(800));
        }
        assert_eq!(c.phase(), PhaseState::ListeningToReadingTransition);

        let t1 = t0 + Duration::from_secs(60);
        command(&mut c, UserCommand::StartReading, t1);
        assert_eq!(c.phase(), PhaseState::ReadingTimed);
        assert_eq!(c.current_group(), 2);

        let fx = command(&mut c, UserCommand::GoToGroup(0), t1);
        assert!(matches!(notices(&fx)[..], [EngineNotice::NavigationRefused { .. }]));
        let fx = command(&mut c, UserCommand::PreviousGroup, t1);
        assert!(matches!(notices(&fx)[..], [EngineNotice::NavigationRefused { .. }]));

        command(&mut c, UserCommand::SelectAnswer { number: 5, letter: letter('B') }, t1);
        command(&mut c, UserCommand::ToggleFlag { number: 6 }, t1);
        assert!(c.navigator().is_flagged(6));

        let tick = c.poll(t1 + Duration::from_secs(1));
        assert_eq!(
            notices(&tick),
            vec![&EngineNotice::TimerTick { remaining: Duration::from_secs(75 * 60 - 1) }]
        );

        let end = t1 + Duration::from_secs(75 * 60);
        let fx = c.poll(end);
        assert_eq!(fx.iter().filter(|e| matches!(e, Effect::Submit(_))).count(), 1);
        assert_eq!(c.phase(), PhaseState::Submitting);
        assert_eq!(c.payload().unwrap().completion_time, 45 * 60 + 75 * 60);

        // A late explicit submit does not produce a second payload.
        assert!(command(&mut c, UserCommand::Submit, end).is_empty());
        assert!(c.poll(end + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn failed_submission_can_be_retried_with_same_payload() {
        let mut c = controller(vec![group("r1", QuestionPart::Part5, 2, false)], DeliveryMode::Exam);
        let t0 = Instant::now();
        c.start(t0);
        assert_eq!(c.phase(), PhaseState::ListeningToReadingTransition);
        command(&mut c, UserCommand::StartReading, t0);
        command(&mut c, UserCommand::SelectAnswer { number: 1, letter: letter('D') }, t0);

        let fx = command(&mut c, UserCommand::Submit, t0 + Duration::from_secs(600));
        let Some(Effect::Submit(first)) = fx.iter().find(|e| matches!(e, Effect::Submit(_))).cloned() else {
            panic!("expected a submit effect");
        };

        // Retry is refused while the first attempt is in flight.
        assert!(command(&mut c, UserCommand::RetrySubmission, t0).is_empty());

        let fx = c.handle_completion(
            Completion::SubmissionFinished(Err(SubmissionError::Transport("reset".into()))),
            t0,
        );
        assert!(matches!(notices(&fx)[..], [EngineNotice::SubmissionFailed { retry_enabled: true, .. }]));
        assert_eq!(c.phase(), PhaseState::Submitting);

        let fx = command(&mut c, UserCommand::RetrySubmission, t0);
        assert_eq!(fx, vec![Effect::Submit(first)]);

        let receipt = SubmissionReceipt { result: serde_json::json!({"score": 1}) };
        let fx = c.handle_completion(Completion::SubmissionFinished(Ok(receipt.clone())), t0);
        assert!(c.is_complete());
        assert!(fx.contains(&Effect::Persist(receipt)));
    }

    #[test]
    fn practice_mode_navigates_freely_with_stopwatch() {
        let mut c = controller(
            vec![
                group("p1", QuestionPart::Part3, 2, true),
                group("p2", QuestionPart::Part7, 2, false),
            ],
            DeliveryMode::Practice,
        );
        let t0 = Instant::now();
        c.start(t0);
        assert_eq!(c.phase(), PhaseState::AwaitingDirection(QuestionPart::Part3));

        let fx = command(&mut c, UserCommand::DismissDirection, t0);
        assert_eq!(c.phase(), PhaseState::PracticeTimed);
        assert!(fx.iter().any(|e| matches!(e, Effect::LoadAudio { group_index: 0, .. })));
        assert_eq!(c.next_deadline(), None);

        command(&mut c, UserCommand::GoToQuestion(3), t0);
        assert_eq!(c.current_group(), 1);
        command(&mut c, UserCommand::PreviousGroup, t0);
        assert_eq!(c.current_group(), 0);
        let fx = command(&mut c, UserCommand::PreviousGroup, t0);
        assert!(matches!(notices(&fx)[..], [EngineNotice::NavigationRefused { .. }]));

        command(&mut c, UserCommand::Submit, t0 + Duration::from_secs(90));
        assert_eq!(c.payload().unwrap().completion_time, 90);
        assert!(!c.payload().unwrap().is_fulltest);
    }

    #[test]
    fn practice_time_limit_counts_down() {
        let mut def = definition(vec![group("p1", QuestionPart::Part5, 1, false)], DeliveryMode::Practice);
        def.time_limit = Some(2);
        let table = contiguous_table(&def, 1);
        let mut c = PhaseController::new(Arc::new(def), &table, EngineConfig::default());
        let t0 = Instant::now();
        c.start(t0);
        command(&mut c, UserCommand::DismissDirection, t0);

        let fx = c.poll(t0 + Duration::from_secs(120));
        assert!(notices(&fx).contains(&&EngineNotice::TimeExpired));
        assert_eq!(c.phase(), PhaseState::Submitting);
        assert_eq!(c.payload().unwrap().completion_time, 120);
    }

    #[test]
    fn unusable_order_table_degrades_numbering() {
        let def = definition(vec![group("r1", QuestionPart::Part5, 1, false)], DeliveryMode::Exam);
        let mut c = PhaseController::new(Arc::new(def), &BaseOrderTable::default(), EngineConfig::default());
        let fx = c.start(Instant::now());
        assert_eq!(notices(&fx)[0], &EngineNotice::DegradedNumbering);
    }
}
