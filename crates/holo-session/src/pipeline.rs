//! The per-turn stage pipeline.
//!
//! Generation, synthesis and delivery run as three tasks joined by bounded
//! queues, so synthesis of chunk N overlaps generation of chunk N+1 and a
//! slow device pushes back all the way to the language model. The session
//! actor supervises the stages through [`StageEvent`]s and steers them with
//! cancellation tokens and in-band [`DeliveryMsg`]s; stages never touch the
//! session's state directly.

use crate::emitter::{AnimationSyncEmitter, EmittedMedia};
use holo_link::DeviceLinks;
use holo_types::{AnimationCue, AudioSpan, DevicePayload, FallbackClip, LinkId, TurnCompletion, TurnId};
use holo_voice::{
    AdapterError, AdapterPolicy, GenerationAdapter, GenerationEngine, GenerationParams,
    RecognitionEngine, Stage, StreamingAdapter, SynthesisAdapter, SynthesisChunk, SynthesisEngine,
    SynthesisParams,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The external engines a session drives.
#[derive(Clone)]
pub struct Engines {
    pub recognition: Arc<RecognitionEngine>,
    pub generation: Arc<GenerationEngine>,
    pub synthesis: Arc<SynthesisEngine>,
}

/// Progress reported by a stage to the session actor.
#[derive(Debug)]
pub(crate) enum StageEvent {
    /// A chunk of response text left generation.
    Text(String),
    GenerationDone,
    /// The first audio payload of the turn was handed to the device link.
    FirstAudio,
    /// One audio segment and its cues were handed to the device link.
    Media {
        span: AudioSpan,
        cues: Vec<AnimationCue>,
    },
    /// Synthesis finished and delivery has everything it will get.
    Drained,
    /// Delivery has nowhere to send; the session has no usable link.
    NoLink,
    /// The turn-end marker went out with this sequence number.
    Delivered { seq: u64 },
    Failed {
        stage: Stage,
        error: AdapterError,
        produced: bool,
    },
}

/// What the delivery stage consumes, in order.
#[derive(Debug)]
pub(crate) enum DeliveryMsg {
    Chunk(SynthesisChunk),
    /// Deliver the fallback acknowledgment; later chunks are discarded.
    Fallback(FallbackClip),
    /// Synthesis is done. Delivery reports it and waits for `End`.
    Drained,
    /// Send the turn-end marker and stop.
    End(TurnCompletion),
}

/// Shared, per-session inputs to every turn pipeline.
#[derive(Clone)]
pub(crate) struct PipelineContext {
    pub engines: Engines,
    pub links: DeviceLinks,
    pub link: watch::Receiver<Option<LinkId>>,
    pub policy: AdapterPolicy,
    pub queue_capacity: usize,
}

pub(crate) struct TurnPlan {
    pub turn_id: TurnId,
    pub prompt: String,
    pub generation: GenerationParams,
    pub synthesis: SynthesisParams,
}

/// Handles the actor keeps for a running turn.
pub(crate) struct TurnPipeline {
    /// Cancels every stage of the turn.
    pub cancel: CancellationToken,
    pub generation: CancellationToken,
    pub synthesis: CancellationToken,
    /// Ends generation early, keeping what was produced.
    pub truncate: CancellationToken,
    pub delivery: mpsc::Sender<DeliveryMsg>,
    /// Why the turn was cancelled, read by delivery on its way out.
    pub outcome: watch::Sender<Option<TurnCompletion>>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl TurnPipeline {
    /// Cancels every stage and waits up to `bound` for all of them to stop.
    /// Stages that overrun are aborted.
    pub async fn shutdown(&mut self, outcome: TurnCompletion, bound: Duration) -> bool {
        let _ = self.outcome.send(Some(outcome));
        self.cancel.cancel();
        let tasks = &mut self.tasks;
        let clean = tokio::time::timeout(bound, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await
        .is_ok();
        if !clean {
            for task in &self.tasks {
                task.abort();
            }
        }
        self.tasks.clear();
        clean
    }

    /// Queues delivery messages without blocking the caller.
    pub fn inject(&self, messages: Vec<DeliveryMsg>) {
        let delivery = self.delivery.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for msg in messages {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = delivery.send(msg) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Stage-side handle for reporting to the actor.
#[derive(Clone)]
pub(crate) struct Reporter {
    turn_id: TurnId,
    events: mpsc::Sender<(TurnId, StageEvent)>,
    cancel: CancellationToken,
}

impl Reporter {
    async fn send(&self, event: StageEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.events.send((self.turn_id, event)) => {}
        }
    }
}

pub(crate) fn spawn_pipeline(
    plan: TurnPlan,
    ctx: &PipelineContext,
    events: mpsc::Sender<(TurnId, StageEvent)>,
) -> TurnPipeline {
    let cancel = CancellationToken::new();
    let generation = cancel.child_token();
    let synthesis = cancel.child_token();
    let truncate = CancellationToken::new();
    let capacity = ctx.queue_capacity.max(1);
    let (text_tx, text_rx) = mpsc::channel(capacity);
    let (delivery_tx, delivery_rx) = mpsc::channel(capacity);
    let (outcome_tx, outcome_rx) = watch::channel(None);

    let reporter = |token: &CancellationToken| Reporter {
        turn_id: plan.turn_id,
        events: events.clone(),
        cancel: token.clone(),
    };

    let max_chars = plan.generation.max_chars;
    let generation_adapter = GenerationAdapter::new(
        ctx.engines.generation.clone(),
        plan.generation,
        Stage::Generation,
        ctx.policy,
    );
    let synthesis_adapter = SynthesisAdapter::new(
        ctx.engines.synthesis.clone(),
        plan.synthesis,
        Stage::Synthesis,
        ctx.policy,
    );

    let delivery = Delivery {
        turn_id: plan.turn_id,
        links: ctx.links.clone(),
        link: ctx.link.clone(),
        outcome: outcome_rx,
        report: reporter(&cancel),
        cancel: cancel.clone(),
        cleanup: ctx.policy.cleanup_timeout,
        emitter: AnimationSyncEmitter::new(),
        started: false,
        sealed: false,
        first_audio: false,
    };

    let tasks = vec![
        tokio::spawn(run_generation(
            generation_adapter,
            plan.prompt,
            max_chars,
            text_tx,
            reporter(&generation),
            generation.clone(),
            truncate.clone(),
        )),
        tokio::spawn(run_synthesis(
            synthesis_adapter,
            text_rx,
            delivery_tx.clone(),
            reporter(&synthesis),
            synthesis.clone(),
        )),
        tokio::spawn(delivery.run(delivery_rx)),
    ];

    TurnPipeline {
        cancel,
        generation,
        synthesis,
        truncate,
        delivery: delivery_tx,
        outcome: outcome_tx,
        tasks,
    }
}

async fn open_generation(
    adapter: &mut GenerationAdapter,
    prompt: String,
) -> Result<(), AdapterError> {
    adapter.stream_start().await?;
    adapter.stream_feed(prompt).await?;
    adapter.end_input();
    Ok(())
}

async fn run_generation(
    mut adapter: GenerationAdapter,
    prompt: String,
    max_chars: usize,
    text: mpsc::Sender<String>,
    report: Reporter,
    cancel: CancellationToken,
    truncate: CancellationToken,
) {
    if let Err(error) = open_generation(&mut adapter, prompt).await {
        report
            .send(StageEvent::Failed {
                stage: Stage::Generation,
                error,
                produced: false,
            })
            .await;
        return;
    }

    let mut sent = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                adapter.cancel().await;
                return;
            }
            _ = truncate.cancelled() => {
                adapter.cancel().await;
                break;
            }
            next = adapter.next_output() => next,
        };
        match next {
            Ok(Some(chunk)) => {
                let remaining = max_chars.saturating_sub(sent);
                let chunk: String = chunk.chars().take(remaining).collect();
                sent += chunk.chars().count();
                if !chunk.is_empty() {
                    report.send(StageEvent::Text(chunk.clone())).await;
                    let forwarded = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        sent = text.send(chunk) => sent.is_ok(),
                    };
                    if !forwarded {
                        adapter.cancel().await;
                        return;
                    }
                }
                if sent >= max_chars {
                    tracing::debug!(max_chars, "response reached its length limit");
                    adapter.cancel().await;
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                adapter.cancel().await;
                report
                    .send(StageEvent::Failed {
                        stage: Stage::Generation,
                        error,
                        produced: sent > 0,
                    })
                    .await;
                break;
            }
        }
    }
    report.send(StageEvent::GenerationDone).await;
}

async fn synthesize(
    adapter: &mut SynthesisAdapter,
    text: String,
) -> Result<Option<SynthesisChunk>, AdapterError> {
    adapter.stream_feed(text).await?;
    adapter.next_output().await
}

async fn forward(
    delivery: &mpsc::Sender<DeliveryMsg>,
    msg: DeliveryMsg,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = delivery.send(msg) => sent.is_ok(),
    }
}

async fn run_synthesis(
    mut adapter: SynthesisAdapter,
    mut text: mpsc::Receiver<String>,
    delivery: mpsc::Sender<DeliveryMsg>,
    report: Reporter,
    cancel: CancellationToken,
) {
    let failed = |error: AdapterError, produced: bool| StageEvent::Failed {
        stage: Stage::Synthesis,
        error,
        produced,
    };
    if let Err(error) = adapter.stream_start().await {
        report.send(failed(error, false)).await;
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                adapter.cancel().await;
                return;
            }
            next = text.recv() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        if chunk.trim().is_empty() {
            continue;
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                adapter.cancel().await;
                return;
            }
            result = synthesize(&mut adapter, chunk) => result,
        };
        match result {
            Ok(Some(audio)) => {
                if !forward(&delivery, DeliveryMsg::Chunk(audio), &cancel).await {
                    adapter.cancel().await;
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("synthesis engine closed its stream early");
                break;
            }
            Err(error) => {
                let produced = adapter.produced_output();
                adapter.cancel().await;
                report.send(failed(error, produced)).await;
                return;
            }
        }
    }

    // Whatever the engine still holds belongs at the end of the turn.
    adapter.end_input();
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                adapter.cancel().await;
                return;
            }
            result = adapter.next_output() => result,
        };
        match result {
            Ok(Some(audio)) => {
                if !forward(&delivery, DeliveryMsg::Chunk(audio), &cancel).await {
                    adapter.cancel().await;
                    return;
                }
            }
            Ok(None) => break,
            Err(error) => {
                let produced = adapter.produced_output();
                adapter.cancel().await;
                report.send(failed(error, produced)).await;
                return;
            }
        }
    }
    adapter.cancel().await;
    forward(&delivery, DeliveryMsg::Drained, &cancel).await;
}

struct Delivery {
    turn_id: TurnId,
    links: DeviceLinks,
    link: watch::Receiver<Option<LinkId>>,
    outcome: watch::Receiver<Option<TurnCompletion>>,
    report: Reporter,
    cancel: CancellationToken,
    cleanup: Duration,
    emitter: AnimationSyncEmitter,
    started: bool,
    sealed: bool,
    first_audio: bool,
}

impl Delivery {
    async fn run(mut self, mut inbox: mpsc::Receiver<DeliveryMsg>) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = inbox.recv() => msg,
            };
            let Some(msg) = msg else {
                return;
            };
            match msg {
                DeliveryMsg::Chunk(chunk) => {
                    if self.sealed {
                        tracing::debug!(turn_id = self.turn_id, "dropping audio after fallback");
                        continue;
                    }
                    let media = self.emitter.emit(chunk);
                    if !self.deliver_media(media).await {
                        break;
                    }
                }
                DeliveryMsg::Fallback(clip) => {
                    self.sealed = true;
                    let text = DevicePayload::Fallback {
                        turn_id: self.turn_id,
                        text: clip.text.clone(),
                    };
                    if self.deliver(text).await.is_none() {
                        break;
                    }
                    if let Some(media) = self.emitter.emit_clip(&clip) {
                        if !self.deliver_media(media).await {
                            break;
                        }
                    }
                }
                DeliveryMsg::Drained => self.report.send(StageEvent::Drained).await,
                DeliveryMsg::End(completion) => {
                    let end = DevicePayload::TurnEnd {
                        turn_id: self.turn_id,
                        completion,
                    };
                    if let Some(seq) = self.deliver(end).await {
                        self.report.send(StageEvent::Delivered { seq }).await;
                    }
                    return;
                }
            }
        }
        self.mark_interrupted().await;
    }

    async fn deliver_media(&mut self, media: EmittedMedia) -> bool {
        let span = AudioSpan {
            offset_ms: media.segment.offset_ms,
            duration_ms: media.segment.duration_ms,
            bytes: media.segment.pcm.len(),
        };
        let cues = media.cues.clone();
        for payload in media.into_payloads(self.turn_id) {
            let audio = matches!(payload, DevicePayload::Audio { .. });
            if self.deliver(payload).await.is_none() {
                return false;
            }
            if audio && !self.first_audio {
                self.first_audio = true;
                self.report.send(StageEvent::FirstAudio).await;
            }
        }
        self.report.send(StageEvent::Media { span, cues }).await;
        true
    }

    /// Sends one payload, preceded by the turn-start marker on first use.
    /// `None` means the turn was cancelled first.
    async fn deliver(&mut self, payload: DevicePayload) -> Option<u64> {
        if !self.started {
            self.started = true;
            self.send(DevicePayload::TurnStart {
                turn_id: self.turn_id,
            })
            .await?;
        }
        self.send(payload).await
    }

    async fn send(&mut self, payload: DevicePayload) -> Option<u64> {
        let mut reported = false;
        loop {
            let link = *self.link.borrow_and_update();
            if let Some(link_id) = link {
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    sent = self.links.send(link_id, payload.clone()) => sent,
                };
                match sent {
                    Ok(seq) => return Some(seq),
                    Err(err) => tracing::warn!(
                        turn_id = self.turn_id,
                        link_id = %link_id,
                        error = %err,
                        "device link refused frame, waiting for another link"
                    ),
                }
            }
            if !reported {
                reported = true;
                self.report.send(StageEvent::NoLink).await;
            }
            let changed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = self.link.changed() => changed,
            };
            if changed.is_err() {
                return None;
            }
        }
    }

    /// Tells the device an interrupted turn is over so it stops playback.
    async fn mark_interrupted(&mut self) {
        let interrupted = matches!(*self.outcome.borrow(), Some(TurnCompletion::Interrupted));
        let link = *self.link.borrow();
        let (true, true, Some(link_id)) = (self.started, interrupted, link) else {
            return;
        };
        let end = DevicePayload::TurnEnd {
            turn_id: self.turn_id,
            completion: TurnCompletion::Interrupted,
        };
        if tokio::time::timeout(self.cleanup, self.links.send(link_id, end))
            .await
            .is_err()
        {
            tracing::debug!(turn_id = self.turn_id, "could not mark interrupted turn on device");
        }
    }
}
