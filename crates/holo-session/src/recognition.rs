//! One recognition stream per utterance.

use holo_types::ParticipantId;
use holo_voice::{AdapterError, Pcm, RecognitionAdapter, Stage, StreamingAdapter, TranscriptUpdate};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub(crate) enum RecognitionUpdate {
    Partial(TranscriptUpdate),
    Final(TranscriptUpdate),
    Failed(AdapterError),
}

#[derive(Debug)]
pub(crate) struct RecognitionEvent {
    /// Identifies the utterance stream, so late events from a replaced
    /// stream can be told apart.
    pub seq: u64,
    pub participant: ParticipantId,
    pub update: RecognitionUpdate,
}

struct Reporter {
    seq: u64,
    participant: ParticipantId,
    events: mpsc::Sender<RecognitionEvent>,
    cancel: CancellationToken,
}

impl Reporter {
    async fn send(&self, update: RecognitionUpdate) {
        let event = RecognitionEvent {
            seq: self.seq,
            participant: self.participant.clone(),
            update,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.events.send(event) => {}
        }
    }
}

/// Feeds one utterance's audio to the engine until `frames` closes, then
/// waits up to `final_timeout` for the final transcript.
///
/// An engine that closes early yields its latest partial as the final; so
/// does one that misses the final deadline after producing text.
pub(crate) async fn run_recognition(
    mut adapter: RecognitionAdapter,
    mut frames: mpsc::Receiver<Pcm>,
    seq: u64,
    participant: ParticipantId,
    events: mpsc::Sender<RecognitionEvent>,
    final_timeout: Duration,
    cancel: CancellationToken,
) {
    let report = Reporter {
        seq,
        participant,
        events,
        cancel: cancel.clone(),
    };
    if let Err(error) = adapter.stream_start().await {
        report.send(RecognitionUpdate::Failed(error)).await;
        return;
    }

    let mut latest: Option<TranscriptUpdate> = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                adapter.cancel().await;
                return;
            }
            frame = frames.recv() => match frame {
                Some(pcm) => {
                    if let Err(error) = adapter.stream_feed(pcm).await {
                        adapter.cancel().await;
                        report.send(RecognitionUpdate::Failed(error)).await;
                        return;
                    }
                }
                None => break,
            },
            update = adapter.next_output() => match update {
                Ok(Some(update)) if update.is_final => {
                    adapter.cancel().await;
                    report.send(RecognitionUpdate::Final(update)).await;
                    return;
                }
                Ok(Some(update)) => {
                    latest = Some(update.clone());
                    report.send(RecognitionUpdate::Partial(update)).await;
                }
                Ok(None) => {
                    tracing::debug!(participant = %report.participant, "recognition engine closed early");
                    adapter.cancel().await;
                    report.send(RecognitionUpdate::Final(as_final(latest))).await;
                    return;
                }
                Err(error) => {
                    adapter.cancel().await;
                    report.send(RecognitionUpdate::Failed(error)).await;
                    return;
                }
            },
        }
    }

    let finished = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            adapter.cancel().await;
            return;
        }
        finished = tokio::time::timeout(final_timeout, adapter.stream_final()) => finished,
    };
    let update = match finished {
        Ok(Ok(rest)) => rest.into_iter().last().or(latest),
        Ok(Err(error)) => {
            report.send(RecognitionUpdate::Failed(error)).await;
            return;
        }
        Err(_) => {
            adapter.cancel().await;
            match latest {
                Some(partial) if !partial.text.trim().is_empty() => {
                    tracing::warn!(
                        participant = %report.participant,
                        "recognition did not finalize in time, using last partial"
                    );
                    Some(partial)
                }
                _ => {
                    let error = AdapterError::Timeout {
                        stage: Stage::Recognition,
                        after_ms: final_timeout.as_millis() as u64,
                    };
                    report.send(RecognitionUpdate::Failed(error)).await;
                    return;
                }
            }
        }
    };
    report.send(RecognitionUpdate::Final(as_final(update))).await;
}

fn as_final(update: Option<TranscriptUpdate>) -> TranscriptUpdate {
    match update {
        Some(update) => TranscriptUpdate {
            is_final: true,
            ..update
        },
        None => TranscriptUpdate {
            text: String::new(),
            confidence: 0.0,
            is_final: true,
        },
    }
}
