//! The session actor.
//!
//! Each session runs as one task that exclusively owns its state machine,
//! ingress buffer, turn coordinator and context window. Everything else
//! talks to it through its command queue, the stage and recognition event
//! queues and its device link's event stream, and observes it through a
//! published [`SessionSnapshot`].

use crate::config::{PipelineConfig, QuotaLimits};
use crate::context::ContextWindow;
use crate::coordinator::{Decision, Floor, TurnCoordinator};
use crate::error::SessionError;
use crate::ingress::{AudioFrame, AudioIngress, IngressEvent};
use crate::pipeline::{
    spawn_pipeline, DeliveryMsg, Engines, PipelineContext, StageEvent, TurnPipeline, TurnPlan,
};
use crate::recognition::{run_recognition, RecognitionEvent, RecognitionUpdate};
use crate::stats::{LatencyStats, LatencySummary};
use crate::store::TurnStore;
use chrono::{DateTime, Utc};
use holo_link::{DeviceLinks, LinkEvent};
use holo_types::{
    CompanionId, CompanionProfile, LinkId, ParticipantId, SessionId, SessionState, Tier, Turn,
    TurnCompletion, TurnId, Utterance, UtteranceOrigin, SYSTEM_PARTICIPANT,
};
use holo_voice::{
    AdapterPolicy, Exchange, GenerationParams, Pcm, RecognitionAdapter, RecognitionParams, Stage,
    SynthesisParams,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Frames buffered per utterance ahead of the recognition engine.
const RECOGNITION_BACKLOG: usize = 256;
const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;

pub(crate) enum Command {
    Audio(AudioFrame),
    /// The participant's audio stream closed.
    EndStream(ParticipantId),
    Text {
        participant: ParticipantId,
        text: String,
    },
    Heartbeat,
    AttachLink(LinkId),
    Close(oneshot::Sender<()>),
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TurnCounts {
    pub started: u64,
    pub completed: u64,
    pub degraded: u64,
    pub interrupted: u64,
    pub abandoned: u64,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub companion_id: CompanionId,
    pub owner: ParticipantId,
    pub tier: Tier,
    pub participants: Vec<ParticipantId>,
    pub state: SessionState,
    /// The participant whose turn it is, if any.
    pub turn_holder: Option<ParticipantId>,
    /// Whether the companion is answering the holder.
    pub companion_has_floor: bool,
    pub current_turn: Option<TurnId>,
    pub link_id: Option<LinkId>,
    pub turns: TurnCounts,
    pub pending_utterances: usize,
    pub context_len: usize,
    pub latency: LatencySummary,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub history: Vec<StateChange>,
    pub last_error: Option<String>,
}

/// Who a session is for; fixed at start.
pub(crate) struct SessionSetup {
    pub id: SessionId,
    pub owner: ParticipantId,
    pub tier: Tier,
    pub participants: Vec<ParticipantId>,
    pub profile: CompanionProfile,
    pub limits: QuotaLimits,
}

/// Node-wide services a session uses.
#[derive(Clone)]
pub(crate) struct SessionShared {
    pub config: Arc<PipelineConfig>,
    pub engines: Engines,
    pub links: DeviceLinks,
    pub store: Arc<dyn TurnStore>,
    /// Reference point for activity timestamps.
    pub clock: Instant,
}

pub(crate) struct SpawnedSession {
    pub commands: mpsc::Sender<Command>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
    /// Milliseconds since `SessionShared::clock` of the last input.
    pub activity: Arc<AtomicU64>,
    pub task: JoinHandle<()>,
}

struct Recognition {
    participant: ParticipantId,
    started_at_ms: u64,
    frames: Option<mpsc::Sender<Pcm>>,
    cancel: CancellationToken,
}

/// A turn between start and completion.
struct TurnRun {
    turn: Turn,
    pipeline: TurnPipeline,
    /// End of the utterance that started the turn; deadlines count from here.
    ended_at: Instant,
    first_text_at: Option<Instant>,
    first_audio_at: Option<Instant>,
    generation_done: bool,
    truncated: bool,
    degraded: Option<String>,
    /// The completion carried by the turn-end marker, once queued.
    end: Option<TurnCompletion>,
    end_seq: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    GenerationSoft,
    GenerationTotal,
    SynthesisSoft,
    Hard,
}

struct SessionActor {
    setup: SessionSetup,
    shared: SessionShared,
    pipeline_ctx: PipelineContext,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    activity: Arc<AtomicU64>,
    epoch: Instant,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,

    state: SessionState,
    /// State to restore when the device comes back.
    resume_state: Option<SessionState>,
    reconnect_started: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    history: VecDeque<StateChange>,
    last_error: Option<String>,

    ingress: AudioIngress,
    coordinator: TurnCoordinator,
    context: ContextWindow,
    latency: LatencyStats,
    counts: TurnCounts,

    recognitions: HashMap<u64, Recognition>,
    recognition_seq: u64,
    recognition_tx: mpsc::Sender<RecognitionEvent>,
    recognition_rx: mpsc::Receiver<RecognitionEvent>,
    stage_tx: mpsc::Sender<(TurnId, StageEvent)>,
    stage_rx: mpsc::Receiver<(TurnId, StageEvent)>,
    speech_ended: HashMap<ParticipantId, Instant>,

    link_tx: watch::Sender<Option<LinkId>>,
    link_events: Option<broadcast::Receiver<LinkEvent>>,

    next_turn_id: TurnId,
    run: Option<TurnRun>,
}

pub(crate) fn spawn_session(setup: SessionSetup, shared: SessionShared) -> SpawnedSession {
    let config = shared.config.clone();
    let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let (recognition_tx, recognition_rx) = mpsc::channel(EVENT_CAPACITY);
    let (stage_tx, stage_rx) = mpsc::channel(EVENT_CAPACITY);
    let (link_tx, link_rx) = watch::channel(None);
    let activity = Arc::new(AtomicU64::new(shared.clock.elapsed().as_millis() as u64));
    let now = Utc::now();
    let (snapshot_tx, snapshot) = watch::channel(initial_snapshot(&setup, now));

    let pipeline_ctx = PipelineContext {
        engines: shared.engines.clone(),
        links: shared.links.clone(),
        link: link_rx,
        policy: adapter_policy(&config, true),
        queue_capacity: config.session.stage_queue_capacity,
    };

    let actor = SessionActor {
        pipeline_ctx,
        commands,
        snapshot_tx,
        activity: activity.clone(),
        epoch: Instant::now(),
        created_at: now,
        last_activity_at: now,
        state: SessionState::Idle,
        resume_state: None,
        reconnect_started: None,
        reconnect_deadline: None,
        history: VecDeque::new(),
        last_error: None,
        ingress: AudioIngress::new(config.ingress.clone()),
        coordinator: TurnCoordinator::new(config.turn.clone()),
        context: ContextWindow::new(config.context.clone()),
        latency: LatencyStats::new(
            config.session.latency_samples,
            config.latency.target_mean_ms,
            config.latency.target_p95_ms,
        ),
        counts: TurnCounts::default(),
        recognitions: HashMap::new(),
        recognition_seq: 0,
        recognition_tx,
        recognition_rx,
        stage_tx,
        stage_rx,
        speech_ended: HashMap::new(),
        link_tx,
        link_events: None,
        next_turn_id: 1,
        run: None,
        setup,
        shared,
    };

    let task = tokio::spawn(actor.serve());
    SpawnedSession {
        commands: commands_tx,
        snapshot,
        activity,
        task,
    }
}

fn initial_snapshot(setup: &SessionSetup, now: DateTime<Utc>) -> SessionSnapshot {
    SessionSnapshot {
        session_id: setup.id,
        companion_id: setup.profile.companion_id.clone(),
        owner: setup.owner.clone(),
        tier: setup.tier,
        participants: setup.participants.clone(),
        state: SessionState::Idle,
        turn_holder: None,
        companion_has_floor: false,
        current_turn: None,
        link_id: None,
        turns: TurnCounts::default(),
        pending_utterances: 0,
        context_len: 0,
        latency: LatencySummary::default(),
        created_at: now,
        last_activity_at: now,
        history: Vec::new(),
        last_error: None,
    }
}

pub(crate) fn adapter_policy(config: &PipelineConfig, chunk_timeout: bool) -> AdapterPolicy {
    let a = &config.adapters;
    AdapterPolicy {
        retry_backoff: Duration::from_millis(a.retry_backoff_ms),
        chunk_timeout: chunk_timeout.then(|| Duration::from_millis(a.chunk_timeout_ms)),
        cleanup_timeout: Duration::from_millis(a.cleanup_timeout_ms),
    }
}

async fn next_link_event(
    events: &mut Option<broadcast::Receiver<LinkEvent>>,
) -> Result<LinkEvent, broadcast::error::RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn serve(mut self) {
        tracing::info!(
            session_id = %self.setup.id,
            companion_id = %self.setup.profile.companion_id,
            participants = self.setup.participants.len(),
            "session started"
        );
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        self.close().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.close().await;
                        return;
                    }
                },
                Some((turn_id, event)) = self.stage_rx.recv() => self.on_stage_event(turn_id, event).await,
                Some(event) = self.recognition_rx.recv() => self.on_recognition(event).await,
                event = next_link_event(&mut self.link_events) => self.on_link_event(event).await,
                _ = sleep_until(wake) => self.on_timer().await,
            }
            self.publish();
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn at_ms(&self, ms: u64) -> Instant {
        self.epoch + Duration::from_millis(ms)
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.activity
            .store(self.shared.clock.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn latency_config(&self) -> &crate::config::LatencyConfig {
        &self.shared.config.latency
    }

    // ---- state ----

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        tracing::info!(session_id = %self.setup.id, from = %from, to = %to, "session state changed");
        self.history.push_back(StateChange {
            from,
            to,
            at: Utc::now(),
        });
        while self.history.len() > self.shared.config.session.history_len.max(1) {
            self.history.pop_front();
        }
        self.state = to;
    }

    /// The state the session is in, or will return to after reconnecting.
    fn effective_state(&self) -> SessionState {
        match (self.state, self.resume_state) {
            (SessionState::Reconnecting, Some(resume)) => resume,
            (state, _) => state,
        }
    }

    /// Moves the turn forward from `from` to `to`, deferring the change
    /// while the device is away.
    fn progress(&mut self, from: &[SessionState], to: SessionState) {
        if !from.contains(&self.effective_state()) {
            return;
        }
        if self.state == SessionState::Reconnecting {
            self.resume_state = Some(to);
        } else {
            self.transition(to);
        }
    }

    fn enter_reconnecting(&mut self) {
        if self.state == SessionState::Reconnecting || self.run.is_none() {
            return;
        }
        let now = Instant::now();
        self.resume_state = Some(self.state);
        self.reconnect_started = Some(now);
        self.reconnect_deadline = Some(now + self.shared.config.grace_period());
        tracing::warn!(session_id = %self.setup.id, "device unavailable, holding turn for reconnect");
        self.transition(SessionState::Reconnecting);
    }

    fn leave_reconnecting(&mut self) {
        if self.state != SessionState::Reconnecting {
            return;
        }
        // Time spent waiting for the device does not count against the turn.
        if let (Some(started), Some(run)) = (self.reconnect_started.take(), self.run.as_mut()) {
            let away = started.elapsed();
            run.ended_at += away;
            if let Some(t) = run.first_text_at.as_mut() {
                *t += away;
            }
        }
        self.reconnect_deadline = None;
        let resume = self.resume_state.take().unwrap_or(SessionState::Listening);
        tracing::info!(session_id = %self.setup.id, resume = %resume, "device back, resuming");
        self.transition(resume);
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.setup.id,
            companion_id: self.setup.profile.companion_id.clone(),
            owner: self.setup.owner.clone(),
            tier: self.setup.tier,
            participants: self.setup.participants.clone(),
            state: self.state,
            turn_holder: self.coordinator.holder().cloned(),
            companion_has_floor: matches!(self.coordinator.floor(), Floor::Companion { .. }),
            current_turn: self.run.as_ref().map(|r| r.turn.id),
            link_id: *self.link_tx.borrow(),
            turns: self.counts,
            pending_utterances: self.coordinator.pending_len(),
            context_len: self.context.len(),
            latency: self.latency.summary(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            history: self.history.iter().cloned().collect(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        let next = self.build_snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // ---- timers ----

    fn deadlines(&self) -> Vec<(Instant, Deadline)> {
        let Some(run) = &self.run else {
            return Vec::new();
        };
        if run.end.is_some() || self.state == SessionState::Reconnecting {
            return Vec::new();
        }
        let l = self.latency_config();
        let ms = Duration::from_millis;
        let mut deadlines = Vec::new();
        if run.first_text_at.is_none() {
            deadlines.push((run.ended_at + ms(l.generation_soft_deadline_ms), Deadline::GenerationSoft));
        }
        if run.first_audio_at.is_none() {
            deadlines.push((run.ended_at + ms(l.hard_deadline_ms), Deadline::Hard));
            if let Some(first_text) = run.first_text_at {
                deadlines.push((first_text + ms(l.synthesis_soft_deadline_ms), Deadline::SynthesisSoft));
            }
        }
        if !run.generation_done && !run.truncated {
            deadlines.push((run.ended_at + ms(l.generation_total_deadline_ms), Deadline::GenerationTotal));
        }
        deadlines
    }

    fn next_wake(&self) -> Option<Instant> {
        let ingress = self.ingress.next_due().map(|ms| self.at_ms(ms));
        let coordinator = self.coordinator.next_due().map(|ms| self.at_ms(ms));
        let deadline = self.deadlines().into_iter().map(|(at, _)| at).min();
        [ingress, coordinator, deadline, self.reconnect_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    async fn on_timer(&mut self) {
        let now_ms = self.now_ms();
        let events = self.ingress.tick(now_ms);
        self.on_ingress(events).await;
        let decisions = self.coordinator.tick(now_ms);
        self.apply(decisions).await;

        let now = Instant::now();
        let due = self
            .deadlines()
            .into_iter()
            .filter(|(at, _)| *at <= now)
            .map(|(_, d)| d)
            .collect::<Vec<_>>();
        for deadline in due {
            self.on_deadline(deadline);
        }

        if self.reconnect_deadline.is_some_and(|at| at <= now) {
            tracing::warn!(session_id = %self.setup.id, "device did not return within the grace period");
            self.last_error = Some(SessionError::DeviceUnreachable.to_string());
            let decisions = self.end_turn(TurnCompletion::Abandoned).await;
            self.apply(decisions).await;
        }
    }

    fn on_deadline(&mut self, deadline: Deadline) {
        let session_id = self.setup.id;
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.end.is_some() {
            return;
        }
        match deadline {
            Deadline::GenerationSoft => self.fall_back("generation deadline"),
            Deadline::SynthesisSoft => self.fall_back("synthesis deadline"),
            Deadline::Hard => self.fall_back("hard deadline"),
            Deadline::GenerationTotal => {
                tracing::warn!(session_id = %session_id, turn_id = run.turn.id, "generation over its total deadline, truncating");
                run.truncated = true;
                run.degraded = Some("generation truncated at deadline".to_string());
                run.pipeline.truncate.cancel();
            }
        }
    }

    /// Replaces whatever the turn has not delivered with the companion's
    /// fallback acknowledgment.
    fn fall_back(&mut self, reason: &str) {
        let session_id = self.setup.id;
        let clip = self.setup.profile.fallback.clone();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.end.is_some() {
            return;
        }
        tracing::warn!(session_id = %session_id, turn_id = run.turn.id, reason, "turn degraded to fallback");
        run.pipeline.generation.cancel();
        run.pipeline.synthesis.cancel();
        if run.turn.response_text.is_empty() {
            run.turn.response_text = clip.text.clone();
        }
        let completion = TurnCompletion::Degraded(reason.to_string());
        run.end = Some(completion.clone());
        run.pipeline
            .inject(vec![DeliveryMsg::Fallback(clip), DeliveryMsg::End(completion)]);
    }

    fn send_end(&mut self, completion: TurnCompletion) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.end.is_some() {
            return;
        }
        run.end = Some(completion.clone());
        run.pipeline.inject(vec![DeliveryMsg::End(completion)]);
    }

    // ---- commands ----

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Audio(frame) => {
                self.touch();
                if self.state == SessionState::Idle {
                    self.transition(SessionState::Listening);
                }
                let events = self.ingress.push(frame, self.now_ms());
                self.on_ingress(events).await;
            }
            Command::EndStream(participant) => {
                let events = self.ingress.end_stream(&participant, self.now_ms());
                self.on_ingress(events).await;
            }
            Command::Text { participant, text } => {
                self.touch();
                if self.state == SessionState::Idle {
                    self.transition(SessionState::Listening);
                }
                let origin = if participant == SYSTEM_PARTICIPANT {
                    UtteranceOrigin::System
                } else {
                    UtteranceOrigin::Text
                };
                let now_ms = self.now_ms();
                let utterance = Utterance::text(participant, origin, text, now_ms);
                let decisions = self.coordinator.submit(utterance, now_ms);
                self.apply(decisions).await;
            }
            Command::Heartbeat => self.touch(),
            Command::AttachLink(link_id) => self.attach_link(link_id).await,
            Command::Close(_) => {}
        }
    }

    async fn attach_link(&mut self, link_id: LinkId) {
        let previous = *self.link_tx.borrow();
        self.link_events = match self.shared.links.subscribe(link_id).await {
            Ok(events) => Some(events),
            Err(err) => {
                tracing::warn!(session_id = %self.setup.id, link_id = %link_id, error = %err, "cannot follow device link");
                None
            }
        };
        self.link_tx.send_replace(Some(link_id));
        if let Some(previous) = previous.filter(|p| *p != link_id) {
            let _ = self.shared.links.close(previous).await;
        }
        tracing::info!(session_id = %self.setup.id, link_id = %link_id, "device link attached to session");
        if self.state == SessionState::Reconnecting {
            self.reconnect_deadline = Some(Instant::now() + self.shared.config.grace_period());
        }
    }

    // ---- ingress and recognition ----

    async fn on_ingress(&mut self, events: Vec<IngressEvent>) {
        for event in events {
            match event {
                IngressEvent::SpeechStarted {
                    participant_id,
                    arrived_ms,
                    ..
                } => {
                    if self.state == SessionState::Idle {
                        self.transition(SessionState::Listening);
                    }
                    self.coordinator.speech_started(&participant_id, arrived_ms);
                    self.start_recognition(participant_id, arrived_ms);
                }
                IngressEvent::Speech {
                    participant_id,
                    arrived_ms,
                    duration_ms,
                    energy,
                    pcm,
                    ..
                } => {
                    if let Some(recognition) = self.active_recognition(&participant_id) {
                        if let Some(frames) = &recognition.frames {
                            if let Err(mpsc::error::TrySendError::Full(_)) = frames.try_send(pcm) {
                                tracing::warn!(participant = %participant_id, "recognition backlog full, dropping frame");
                            }
                        }
                    }
                    let speaking = self.state.companion_speaking();
                    if let Some(decision) = self.coordinator.voice_activity(
                        &participant_id,
                        arrived_ms,
                        duration_ms,
                        energy,
                        speaking,
                    ) {
                        self.apply(vec![decision]).await;
                    }
                }
                IngressEvent::SpeechEnded { participant_id, .. } => {
                    self.speech_ended.insert(participant_id.clone(), Instant::now());
                    if let Some(recognition) = self.active_recognition(&participant_id) {
                        recognition.frames = None;
                    }
                }
            }
        }
    }

    fn active_recognition(&mut self, participant: &str) -> Option<&mut Recognition> {
        self.recognitions
            .values_mut()
            .find(|r| r.participant == participant && r.frames.is_some())
    }

    fn start_recognition(&mut self, participant: ParticipantId, at_ms: u64) {
        self.recognition_seq += 1;
        let seq = self.recognition_seq;
        let config = &self.shared.config;
        let adapter = RecognitionAdapter::new(
            self.shared.engines.recognition.clone(),
            RecognitionParams {
                participant_id: participant.clone(),
                sample_rate: config.ingress.sample_rate,
                language: None,
            },
            Stage::Recognition,
            adapter_policy(config, false),
        );
        let (frames_tx, frames_rx) = mpsc::channel(RECOGNITION_BACKLOG);
        let cancel = CancellationToken::new();
        tokio::spawn(run_recognition(
            adapter,
            frames_rx,
            seq,
            participant.clone(),
            self.recognition_tx.clone(),
            Duration::from_millis(config.adapters.recognition_final_timeout_ms),
            cancel.clone(),
        ));
        self.recognitions.insert(
            seq,
            Recognition {
                participant,
                started_at_ms: at_ms,
                frames: Some(frames_tx),
                cancel,
            },
        );
    }

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        let now_ms = self.now_ms();
        let participant = event.participant;
        let decisions = match event.update {
            RecognitionUpdate::Partial(update) => {
                if !self.recognitions.contains_key(&event.seq) {
                    return;
                }
                self.coordinator
                    .transcript(&participant, &update.text, update.confidence, false, now_ms)
            }
            RecognitionUpdate::Final(update) => {
                if self.recognitions.remove(&event.seq).is_none() {
                    return;
                }
                tracing::debug!(participant = %participant, transcript = %update.text, "utterance finalized");
                self.coordinator
                    .transcript(&participant, &update.text, update.confidence, true, now_ms)
            }
            RecognitionUpdate::Failed(error) => {
                if self.recognitions.remove(&event.seq).is_none() {
                    return;
                }
                tracing::warn!(session_id = %self.setup.id, participant = %participant, error = %error, "recognition failed, dropping utterance");
                self.last_error = Some(SessionError::from(error).to_string());
                self.speech_ended.remove(&participant);
                self.coordinator.speech_abandoned(&participant, now_ms)
            }
        };
        // A newer utterance from the same participant may have started
        // while this one was finalizing.
        if let Some(started) = self
            .recognitions
            .values()
            .find(|r| r.participant == participant)
            .map(|r| r.started_at_ms)
        {
            self.coordinator.speech_started(&participant, started);
        }
        self.apply(decisions).await;
    }

    // ---- coordination ----

    async fn apply(&mut self, decisions: Vec<Decision>) {
        let mut queue: VecDeque<Decision> = decisions.into();
        while let Some(decision) = queue.pop_front() {
            match decision {
                Decision::Acquired(participant) => {
                    tracing::debug!(session_id = %self.setup.id, participant = %participant, "turn acquired");
                    if matches!(self.state, SessionState::Idle | SessionState::Listening) {
                        self.transition(SessionState::Recognizing);
                    }
                }
                Decision::TurnReady(utterance) => {
                    let more = self.start_turn(utterance).await;
                    queue.extend(more);
                }
                Decision::BargeIn(participant) => {
                    let more = self.barge_in(&participant).await;
                    queue.extend(more);
                }
                Decision::Queued(participant) => {
                    tracing::debug!(session_id = %self.setup.id, participant = %participant, "utterance queued");
                    self.speech_ended.remove(&participant);
                }
                Decision::Released(participant) => {
                    tracing::debug!(session_id = %self.setup.id, participant = %participant, "turn released");
                    if self.state == SessionState::Recognizing {
                        self.transition(SessionState::Listening);
                    }
                }
                Decision::Dropped(participant) => {
                    tracing::warn!(session_id = %self.setup.id, participant = %participant, "utterance dropped");
                    self.speech_ended.remove(&participant);
                }
            }
        }
    }

    async fn start_turn(&mut self, utterance: Utterance) -> Vec<Decision> {
        let now_ms = self.now_ms();
        if self.run.is_some() {
            tracing::error!(session_id = %self.setup.id, "turn offered while another is in flight");
            return Vec::new();
        }
        if self.counts.started >= self.setup.limits.max_turns_per_session {
            let err = SessionError::QuotaExceeded {
                tier: self.setup.tier,
                limit: format!("{} turns per session", self.setup.limits.max_turns_per_session),
            };
            tracing::warn!(session_id = %self.setup.id, error = %err, "turn refused");
            self.last_error = Some(err.to_string());
            self.speech_ended.remove(&utterance.participant_id);
            if self.state == SessionState::Recognizing {
                self.transition(SessionState::Listening);
            }
            return self.coordinator.turn_finished(now_ms);
        }

        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        self.counts.started += 1;
        let ended_at = self
            .speech_ended
            .remove(&utterance.participant_id)
            .unwrap_or_else(Instant::now);

        let profile = &self.setup.profile;
        let plan = TurnPlan {
            turn_id,
            prompt: utterance.transcript.clone(),
            generation: GenerationParams {
                companion_id: profile.companion_id.clone(),
                persona: profile.persona.clone(),
                speaker: utterance.participant_id.clone(),
                history: self.context.snapshot(),
                max_chars: self.setup.limits.max_response_chars,
            },
            synthesis: SynthesisParams {
                voice_id: profile.voice_id.clone(),
                speed: profile.speed,
                sample_rate: self.shared.config.ingress.sample_rate,
            },
        };
        let pipeline = spawn_pipeline(plan, &self.pipeline_ctx, self.stage_tx.clone());
        tracing::info!(
            session_id = %self.setup.id,
            turn_id,
            speaker = %utterance.participant_id,
            "turn started"
        );
        self.run = Some(TurnRun {
            turn: Turn::new(turn_id, utterance.participant_id, utterance.transcript),
            pipeline,
            ended_at,
            first_text_at: None,
            first_audio_at: None,
            generation_done: false,
            truncated: false,
            degraded: None,
            end: None,
            end_seq: None,
        });
        if self.state == SessionState::Idle {
            self.transition(SessionState::Listening);
        }
        self.transition(SessionState::Generating);

        // A device that dropped while the session was idle produced no
        // event the turn could react to.
        let link = *self.link_tx.borrow();
        if let Some(link_id) = link {
            if !self.shared.links.is_connected(link_id).await {
                self.last_error = Some(SessionError::DeviceUnreachable.to_string());
                self.enter_reconnecting();
            }
        }
        Vec::new()
    }

    async fn barge_in(&mut self, participant: &str) -> Vec<Decision> {
        tracing::info!(session_id = %self.setup.id, participant, "barge-in, cancelling response");
        let mut decisions = Vec::new();
        if self.run.is_some() {
            self.transition(SessionState::Interrupted);
            decisions = self.end_turn(TurnCompletion::Interrupted).await;
        }
        self.transition(SessionState::Recognizing);
        decisions
    }

    /// Stops the running turn, records it, and reopens the floor.
    async fn end_turn(&mut self, completion: TurnCompletion) -> Vec<Decision> {
        let Some(mut run) = self.run.take() else {
            return Vec::new();
        };
        let bound = Duration::from_millis(self.shared.config.session.cancel_ack_timeout_ms);
        if !run.pipeline.shutdown(completion.clone(), bound).await {
            tracing::warn!(session_id = %self.setup.id, turn_id = run.turn.id, "stages did not stop in time, aborted");
        }
        run.turn.finish(completion.clone());

        match &completion {
            TurnCompletion::Completed => self.counts.completed += 1,
            TurnCompletion::Degraded(_) => self.counts.degraded += 1,
            TurnCompletion::Interrupted => self.counts.interrupted += 1,
            TurnCompletion::Abandoned => self.counts.abandoned += 1,
            TurnCompletion::InProgress => {}
        }
        if !run.turn.response_text.is_empty() {
            self.context.push(Exchange {
                participant_id: run.turn.speaker.clone(),
                said: run.turn.input.clone(),
                replied: run.turn.response_text.clone(),
            });
        }
        tracing::info!(
            session_id = %self.setup.id,
            turn_id = run.turn.id,
            completion = completion.as_str(),
            first_audio_latency_ms = run.turn.first_audio_latency_ms,
            "turn finished"
        );

        let store = self.shared.store.clone();
        let session_id = self.setup.id;
        let turn = run.turn;
        tokio::spawn(async move {
            if let Err(err) = store.save_turn(session_id, &turn).await {
                tracing::warn!(session_id = %session_id, turn_id = turn.id, error = %err, "failed to store turn");
            }
        });

        self.resume_state = None;
        self.reconnect_started = None;
        self.reconnect_deadline = None;
        if matches!(completion, TurnCompletion::Completed | TurnCompletion::Degraded(_)) {
            self.transition(SessionState::Idle);
        }
        self.transition(SessionState::Listening);
        self.touch();
        self.coordinator.turn_finished(self.now_ms())
    }

    async fn complete_turn(&mut self) {
        let completion = self
            .run
            .as_ref()
            .and_then(|r| r.end.clone())
            .unwrap_or(TurnCompletion::Completed);
        let decisions = self.end_turn(completion).await;
        self.apply(decisions).await;
    }

    // ---- stage events ----

    async fn on_stage_event(&mut self, turn_id: TurnId, event: StageEvent) {
        let session_id = self.setup.id;
        let Some(run) = self.run.as_mut().filter(|r| r.turn.id == turn_id) else {
            return;
        };
        match event {
            StageEvent::Text(text) => {
                run.turn.response_text.push_str(&text);
                if run.first_text_at.is_none() {
                    run.first_text_at = Some(Instant::now());
                    self.progress(&[SessionState::Generating], SessionState::Synthesizing);
                }
            }
            StageEvent::GenerationDone => run.generation_done = true,
            StageEvent::FirstAudio => {
                let now = Instant::now();
                run.first_audio_at = Some(now);
                let latency = now.saturating_duration_since(run.ended_at).as_millis() as u64;
                run.turn.first_audio_latency_ms = Some(latency);
                self.latency.record(latency);
                tracing::debug!(session_id = %session_id, turn_id, latency_ms = latency, "first audio handed to device link");
                self.progress(
                    &[SessionState::Generating, SessionState::Synthesizing],
                    SessionState::Responding,
                );
            }
            StageEvent::Media { span, cues } => {
                run.turn.audio.push(span);
                run.turn.cues.extend(cues);
            }
            StageEvent::Drained => {
                let completion = match &run.degraded {
                    Some(reason) => TurnCompletion::Degraded(reason.clone()),
                    None => TurnCompletion::Completed,
                };
                self.send_end(completion);
            }
            StageEvent::NoLink => {
                self.last_error = Some(SessionError::DeviceUnreachable.to_string());
                self.enter_reconnecting();
            }
            StageEvent::Delivered { seq } => {
                run.end_seq = Some(seq);
                let link = *self.link_tx.borrow();
                let acked = match link {
                    Some(link_id) => self
                        .shared
                        .links
                        .status(link_id)
                        .await
                        .is_ok_and(|s| s.last_acked >= seq),
                    None => false,
                };
                if acked {
                    self.complete_turn().await;
                }
            }
            StageEvent::Failed {
                stage,
                error,
                produced,
            } => {
                tracing::warn!(session_id = %session_id, turn_id, stage = %stage, error = %error, produced, "stage failed");
                self.last_error = Some(SessionError::from(error).to_string());
                if run.end.is_some() {
                    return;
                }
                match (stage, produced) {
                    (Stage::Generation, true) => {
                        run.degraded = Some("generation failed".to_string());
                    }
                    (Stage::Synthesis, true) => {
                        run.pipeline.generation.cancel();
                        self.send_end(TurnCompletion::Degraded("synthesis failed".to_string()));
                    }
                    (stage, _) => self.fall_back(&format!("{stage} failed")),
                }
            }
        }
    }

    // ---- device link ----

    async fn on_link_event(&mut self, event: Result<LinkEvent, broadcast::error::RecvError>) {
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(session_id = %self.setup.id, missed, "missed device link events, resyncing");
                self.resync_link().await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.link_events = None;
                return;
            }
        };
        match event {
            LinkEvent::Connected { .. } => self.leave_reconnecting(),
            LinkEvent::Disconnected => self.enter_reconnecting(),
            LinkEvent::Acked { seq } => {
                if self
                    .run
                    .as_ref()
                    .and_then(|r| r.end_seq)
                    .is_some_and(|end| seq >= end)
                {
                    self.complete_turn().await;
                }
            }
            LinkEvent::GraceExpired { dropped } => {
                if self.run.is_some() {
                    tracing::warn!(session_id = %self.setup.id, dropped, "device grace period expired, abandoning turn");
                    self.last_error = Some(SessionError::DeviceUnreachable.to_string());
                    let decisions = self.end_turn(TurnCompletion::Abandoned).await;
                    self.apply(decisions).await;
                }
            }
            LinkEvent::Closed => {
                self.link_events = None;
                self.link_tx.send_replace(None);
            }
        }
    }

    async fn resync_link(&mut self) {
        let Some(link_id) = *self.link_tx.borrow() else {
            return;
        };
        let Ok(status) = self.shared.links.status(link_id).await else {
            return;
        };
        if status.connected {
            self.leave_reconnecting();
        }
        let end_seq = self.run.as_ref().and_then(|r| r.end_seq);
        if end_seq.is_some_and(|end| status.last_acked >= end) {
            self.complete_turn().await;
        } else if status.unreachable && self.run.is_some() {
            let decisions = self.end_turn(TurnCompletion::Abandoned).await;
            self.apply(decisions).await;
        }
    }

    // ---- teardown ----

    async fn close(&mut self) {
        for recognition in self.recognitions.values() {
            recognition.cancel.cancel();
        }
        self.recognitions.clear();

        if let Some(mut run) = self.run.take() {
            let bound = Duration::from_millis(self.shared.config.session.cancel_ack_timeout_ms);
            run.pipeline.shutdown(TurnCompletion::Abandoned, bound).await;
            run.turn.finish(TurnCompletion::Abandoned);
            self.counts.abandoned += 1;
            if let Err(err) = self.shared.store.save_turn(self.setup.id, &run.turn).await {
                tracing::warn!(session_id = %self.setup.id, error = %err, "failed to store turn");
            }
        }
        let link = self.link_tx.send_replace(None);
        if let Some(link_id) = link {
            let _ = self.shared.links.close(link_id).await;
        }
        if let Err(err) = self.shared.store.session_closed(self.setup.id).await {
            tracing::warn!(session_id = %self.setup.id, error = %err, "failed to record session close");
        }
        self.resume_state = None;
        self.transition(SessionState::Closed);
        self.publish();
        tracing::info!(session_id = %self.setup.id, turns = self.counts.started, "session closed");
    }
}
