//! Places synthesized audio and animation cues on one turn timeline.

use holo_types::{AnimationCue, AudioSegment, DevicePayload, FallbackClip, TurnId};
use holo_voice::{SynthesisChunk, TimingMark};

/// Audio for one chunk plus the cues that play during it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedMedia {
    pub segment: AudioSegment,
    pub cues: Vec<AnimationCue>,
}

impl EmittedMedia {
    /// Device payloads in delivery order: the audio first, then its cues.
    pub fn into_payloads(self, turn_id: TurnId) -> Vec<DevicePayload> {
        let mut payloads = Vec::with_capacity(1 + self.cues.len());
        payloads.push(DevicePayload::Audio {
            turn_id,
            segment: self.segment,
        });
        payloads.extend(
            self.cues
                .into_iter()
                .map(|cue| DevicePayload::Cue { turn_id, cue }),
        );
        payloads
    }
}

/// Converts chunk-relative timing marks into turn-relative cues.
///
/// Every cue lands inside the audio segment it belongs to and cue offsets
/// never go backwards, so a renderer can schedule them against the audio
/// clock as they arrive.
#[derive(Debug, Default)]
pub struct AnimationSyncEmitter {
    cursor_ms: u64,
    last_cue_ms: u64,
}

impl AnimationSyncEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the audio emitted so far.
    pub fn cursor_ms(&self) -> u64 {
        self.cursor_ms
    }

    pub fn emit(&mut self, chunk: SynthesisChunk) -> EmittedMedia {
        let duration_ms = if chunk.duration_ms > 0 {
            chunk.duration_ms
        } else {
            AudioSegment::pcm_duration_ms(chunk.pcm.len(), chunk.sample_rate)
        };
        let marks: Vec<AnimationCue> = chunk.marks.into_iter().map(mark_to_cue).collect();
        self.place(chunk.pcm, chunk.sample_rate, duration_ms, marks)
    }

    /// Emits a pre-rendered fallback clip, if it carries audio.
    pub fn emit_clip(&mut self, clip: &FallbackClip) -> Option<EmittedMedia> {
        let audio = clip.audio.as_ref()?;
        let duration_ms = if audio.duration_ms > 0 {
            audio.duration_ms
        } else {
            AudioSegment::pcm_duration_ms(audio.pcm.len(), audio.sample_rate)
        };
        Some(self.place(
            audio.pcm.clone(),
            audio.sample_rate,
            duration_ms,
            clip.cues.clone(),
        ))
    }

    fn place(
        &mut self,
        pcm: Vec<u8>,
        sample_rate: u32,
        duration_ms: u64,
        mut marks: Vec<AnimationCue>,
    ) -> EmittedMedia {
        let start = self.cursor_ms;
        let end = start + duration_ms;
        marks.sort_by_key(|m| m.offset_ms);

        let cues = marks
            .into_iter()
            .map(|mark| {
                let offset = (start + mark.offset_ms)
                    .min(end.saturating_sub(1).max(start))
                    .max(self.last_cue_ms);
                self.last_cue_ms = offset;
                AnimationCue {
                    offset_ms: offset,
                    duration_ms: mark.duration_ms.min(end.saturating_sub(offset)),
                    shape: mark.shape,
                }
            })
            .collect();

        self.cursor_ms = end;
        EmittedMedia {
            segment: AudioSegment {
                offset_ms: start,
                duration_ms,
                sample_rate,
                pcm,
            },
            cues,
        }
    }
}

fn mark_to_cue(mark: TimingMark) -> AnimationCue {
    AnimationCue {
        offset_ms: mark.offset_ms,
        shape: mark.shape,
        duration_ms: mark.duration_ms,
    }
}
