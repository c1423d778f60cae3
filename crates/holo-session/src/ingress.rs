//! Audio ingress: per-participant reordering and utterance segmentation.
//!
//! Frames carry the participant's capture timestamp. They are held for the
//! reorder window so frames that overtook each other in transit are put back
//! in capture order; frames older than one already released are dropped.
//! A simple energy detector then splits each participant's stream into
//! utterances. All times are milliseconds; `now_ms` is the session clock.
//! Capture timestamps only order one participant's frames; comparisons
//! across participants use `arrived_ms`, when the frame reached the session.

use crate::config::IngressConfig;
use holo_types::{AudioSegment, ParticipantId};
use std::collections::{BTreeMap, HashMap};

/// One frame of participant audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub participant_id: ParticipantId,
    /// Capture timestamp on the participant's clock.
    pub captured_at_ms: u64,
    /// Mono PCM, signed 16-bit little-endian.
    pub pcm: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngressEvent {
    SpeechStarted {
        participant_id: ParticipantId,
        at_ms: u64,
        arrived_ms: u64,
    },
    /// A frame belonging to an utterance in progress.
    Speech {
        participant_id: ParticipantId,
        at_ms: u64,
        arrived_ms: u64,
        duration_ms: u64,
        energy: f32,
        pcm: Vec<u8>,
    },
    SpeechEnded {
        participant_id: ParticipantId,
        at_ms: u64,
        audio_ms: u64,
    },
}

/// Root-mean-square energy of s16le PCM, normalized to `[0, 1]`.
pub fn rms_energy(pcm: &[u8]) -> f32 {
    let samples = pcm.len() / 2;
    if samples == 0 {
        return 0.0;
    }
    let sum: f64 = pcm
        .chunks_exact(2)
        .map(|b| {
            let s = i16::from_le_bytes([b[0], b[1]]) as f64 / 32768.0;
            s * s
        })
        .sum();
    (sum / samples as f64).sqrt() as f32
}

#[derive(Debug)]
struct Held {
    pcm: Vec<u8>,
    arrived_ms: u64,
}

#[derive(Debug)]
struct Utterance {
    audio_ms: u64,
    silence_ms: u64,
    last_end_ms: u64,
}

#[derive(Debug, Default)]
struct Track {
    /// Keyed by (capture timestamp, arrival order).
    held: BTreeMap<(u64, u64), Held>,
    arrivals: u64,
    newest_ms: u64,
    last_released_ms: Option<u64>,
    last_arrival_ms: u64,
    utterance: Option<Utterance>,
}

/// The ingress buffer for one session.
#[derive(Debug)]
pub struct AudioIngress {
    config: IngressConfig,
    tracks: HashMap<ParticipantId, Track>,
    late_frames: u64,
}

impl AudioIngress {
    pub fn new(config: IngressConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            late_frames: 0,
        }
    }

    /// Frames dropped for arriving after a later frame was released.
    pub fn late_frames(&self) -> u64 {
        self.late_frames
    }

    /// Whether `participant` is mid-utterance.
    pub fn is_speaking(&self, participant: &str) -> bool {
        self.tracks
            .get(participant)
            .is_some_and(|t| t.utterance.is_some())
    }

    pub fn push(&mut self, frame: AudioFrame, now_ms: u64) -> Vec<IngressEvent> {
        let track = self.tracks.entry(frame.participant_id.clone()).or_default();
        if track
            .last_released_ms
            .is_some_and(|last| frame.captured_at_ms < last)
        {
            self.late_frames += 1;
            tracing::debug!(
                participant = %frame.participant_id,
                captured_at_ms = frame.captured_at_ms,
                "dropping late audio frame"
            );
            return Vec::new();
        }
        track.arrivals += 1;
        track.newest_ms = track.newest_ms.max(frame.captured_at_ms);
        track.last_arrival_ms = now_ms;
        track.held.insert(
            (frame.captured_at_ms, track.arrivals),
            Held {
                pcm: frame.pcm,
                arrived_ms: now_ms,
            },
        );

        let mut events = Vec::new();
        release(&self.config, &frame.participant_id, track, now_ms, &mut events);
        events
    }

    /// Releases frames whose reorder hold expired and ends utterances whose
    /// participant went quiet without sending silence.
    pub fn tick(&mut self, now_ms: u64) -> Vec<IngressEvent> {
        let mut events = Vec::new();
        for (participant, track) in self.tracks.iter_mut() {
            release(&self.config, participant, track, now_ms, &mut events);
            if track.held.is_empty()
                && now_ms.saturating_sub(track.last_arrival_ms) >= self.config.end_of_speech_ms
            {
                if let Some(utterance) = track.utterance.take() {
                    events.push(IngressEvent::SpeechEnded {
                        participant_id: participant.clone(),
                        at_ms: utterance.last_end_ms,
                        audio_ms: utterance.audio_ms,
                    });
                }
            }
        }
        events
    }

    /// Ends `participant`'s utterance at once, e.g. when their stream closed.
    pub fn end_stream(&mut self, participant: &str, now_ms: u64) -> Vec<IngressEvent> {
        let Some(track) = self.tracks.get_mut(participant) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        // Flush everything regardless of the reorder window.
        let far_future = now_ms
            .saturating_add(self.config.reorder_window_ms)
            .saturating_add(1);
        release(&self.config, participant, track, far_future, &mut events);
        if let Some(utterance) = track.utterance.take() {
            events.push(IngressEvent::SpeechEnded {
                participant_id: participant.to_string(),
                at_ms: utterance.last_end_ms,
                audio_ms: utterance.audio_ms,
            });
        }
        self.tracks.remove(participant);
        events
    }

    /// The next session time at which `tick` has work to do.
    pub fn next_due(&self) -> Option<u64> {
        self.tracks
            .values()
            .filter_map(|track| {
                // Release is in capture order, so the first held frame gates the rest.
                let hold = track
                    .held
                    .values()
                    .next()
                    .map(|h| h.arrived_ms.saturating_add(self.config.reorder_window_ms));
                let quiet = track
                    .utterance
                    .as_ref()
                    .map(|_| track.last_arrival_ms.saturating_add(self.config.end_of_speech_ms));
                match (hold, quiet) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            })
            .min()
    }
}

fn release(
    config: &IngressConfig,
    participant: &str,
    track: &mut Track,
    now_ms: u64,
    events: &mut Vec<IngressEvent>,
) {
    let window = config.reorder_window_ms;
    loop {
        let Some((&(captured_ms, order), held)) = track.held.iter().next() else {
            return;
        };
        let due = held.arrived_ms.saturating_add(window) <= now_ms
            || captured_ms.saturating_add(window) <= track.newest_ms;
        if !due {
            return;
        }
        let Some(held) = track.held.remove(&(captured_ms, order)) else {
            return;
        };
        track.last_released_ms = Some(captured_ms);
        segment(config, participant, track, captured_ms, held, events);
    }
}

fn segment(
    config: &IngressConfig,
    participant: &str,
    track: &mut Track,
    at_ms: u64,
    held: Held,
    events: &mut Vec<IngressEvent>,
) {
    let Held { pcm, arrived_ms } = held;
    let duration_ms = AudioSegment::pcm_duration_ms(pcm.len(), config.sample_rate);
    let energy = rms_energy(&pcm);
    let voiced = energy >= config.speech_energy;

    if track.utterance.is_none() {
        if !voiced {
            return;
        }
        track.utterance = Some(Utterance {
            audio_ms: 0,
            silence_ms: 0,
            last_end_ms: at_ms,
        });
        events.push(IngressEvent::SpeechStarted {
            participant_id: participant.to_string(),
            at_ms,
            arrived_ms,
        });
    }
    let Some(utterance) = track.utterance.as_mut() else {
        return;
    };

    utterance.audio_ms += duration_ms;
    utterance.last_end_ms = at_ms.saturating_add(duration_ms);
    if voiced {
        utterance.silence_ms = 0;
    } else {
        utterance.silence_ms += duration_ms;
    }
    events.push(IngressEvent::Speech {
        participant_id: participant.to_string(),
        at_ms,
        arrived_ms,
        duration_ms,
        energy,
        pcm,
    });

    if utterance.silence_ms >= config.end_of_speech_ms || utterance.audio_ms >= config.max_utterance_ms
    {
        let audio_ms = utterance.audio_ms;
        let end = utterance.last_end_ms;
        track.utterance = None;
        events.push(IngressEvent::SpeechEnded {
            participant_id: participant.to_string(),
            at_ms: end,
            audio_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(reorder_window_ms: u64) -> IngressConfig {
        IngressConfig {
            sample_rate: 16_000,
            reorder_window_ms,
            speech_energy: 0.05,
            end_of_speech_ms: 60,
            max_utterance_ms: 10_000,
        }
    }

    /// 20 ms of constant-amplitude audio.
    fn frame(participant: &str, at_ms: u64, amplitude: i16) -> AudioFrame {
        let pcm = std::iter::repeat(amplitude.to_le_bytes())
            .take(320)
            .flatten()
            .collect();
        AudioFrame {
            participant_id: participant.to_string(),
            captured_at_ms: at_ms,
            pcm,
        }
    }

    fn kinds(events: &[IngressEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                IngressEvent::SpeechStarted { .. } => "start",
                IngressEvent::Speech { .. } => "speech",
                IngressEvent::SpeechEnded { .. } => "end",
            })
            .collect()
    }

    #[test]
    fn energy_of_silence_and_full_scale() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert_eq!(rms_energy(&frame("a", 0, 0).pcm), 0.0);
        let loud = rms_energy(&frame("a", 0, i16::MAX).pcm);
        assert!(loud > 0.99);
    }

    #[test]
    fn silence_ends_an_utterance() {
        let mut ingress = AudioIngress::new(config(0));
        assert!(ingress.push(frame("a", 0, 0), 0).is_empty());

        let mut events = ingress.push(frame("a", 20, 8_000), 20);
        events.extend(ingress.push(frame("a", 40, 8_000), 40));
        for t in [60, 80, 100] {
            events.extend(ingress.push(frame("a", t, 0), t));
        }
        assert_eq!(
            kinds(&events),
            vec!["start", "speech", "speech", "speech", "speech", "speech", "end"]
        );
        match events.last().unwrap() {
            IngressEvent::SpeechEnded { at_ms, audio_ms, .. } => {
                assert_eq!(*at_ms, 120);
                assert_eq!(*audio_ms, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ingress.is_speaking("a"));
    }

    #[test]
    fn reorder_window_restores_capture_order() {
        let mut ingress = AudioIngress::new(config(50));
        assert!(ingress.push(frame("a", 20, 8_000), 0).is_empty());
        assert!(ingress.push(frame("a", 0, 8_000), 5).is_empty());
        assert_eq!(ingress.next_due(), Some(55));
        assert!(ingress.tick(50).is_empty());

        let events = ingress.tick(55);
        let order: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                IngressEvent::Speech { at_ms, .. } => Some(*at_ms),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![0, 20]);

        // A frame older than what was released is dropped.
        assert!(ingress.push(frame("a", 10, 8_000), 60).is_empty());
        assert_eq!(ingress.late_frames(), 1);
    }

    #[test]
    fn quiet_participant_times_out() {
        let mut ingress = AudioIngress::new(config(0));
        ingress.push(frame("a", 0, 8_000), 0);
        assert!(ingress.is_speaking("a"));
        assert_eq!(ingress.next_due(), Some(60));
        let events = ingress.tick(60);
        assert_eq!(kinds(&events), vec!["end"]);
    }

    #[test]
    fn timestamps_near_the_end_of_the_clock_do_not_overflow() {
        let mut ingress = AudioIngress::new(config(50));
        let start = u64::MAX - 5;
        assert!(ingress.push(frame("a", start, 8_000), 0).is_empty());
        assert_eq!(ingress.next_due(), Some(50));

        let events = ingress.tick(50);
        assert_eq!(kinds(&events), vec!["start", "speech"]);
        let mut events = ingress.push(frame("a", u64::MAX, 8_000), u64::MAX - 10);
        events.extend(ingress.tick(u64::MAX));
        events.extend(ingress.end_stream("a", u64::MAX));
        match events.last() {
            Some(IngressEvent::SpeechEnded { at_ms, .. }) => assert_eq!(*at_ms, u64::MAX),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn speech_carries_the_session_arrival_time() {
        let mut ingress = AudioIngress::new(config(0));
        // The participant's clock runs far ahead of the session's.
        let events = ingress.push(frame("a", 90_000, 8_000), 40);
        match &events[0] {
            IngressEvent::SpeechStarted {
                at_ms, arrived_ms, ..
            } => {
                assert_eq!(*at_ms, 90_000);
                assert_eq!(*arrived_ms, 40);
            }
            other => panic!("unexpected {other:?}"),
        }
        let events = ingress.push(frame("a", 90_020, 8_000), 60);
        assert!(matches!(
            events[0],
            IngressEvent::Speech { at_ms: 90_020, arrived_ms: 60, .. }
        ));
    }

    #[test]
    fn participants_are_segmented_independently() {
        let mut ingress = AudioIngress::new(config(0));
        let mut events = ingress.push(frame("a", 0, 8_000), 0);
        events.extend(ingress.push(frame("b", 0, 8_000), 0));
        events.extend(ingress.end_stream("a", 10));
        assert_eq!(kinds(&events), vec!["start", "speech", "start", "speech", "end"]);
        assert!(ingress.is_speaking("b"));
    }
}
