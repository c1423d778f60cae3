//! Deterministic in-process engines.
//!
//! Used by the test suites and by `engines.kind = "scripted"` for running a
//! server without any speech or language backends. Each engine can inject
//! failures and delays, and counts its open and live streams so tests can
//! check retries and that cancelled requests were torn down.

use crate::engine::{Engine, EngineStream, OutputSink};
use crate::error::EngineError;
use crate::types::{
    GenerationParams, Pcm, RecognitionParams, SynthesisChunk, SynthesisParams, TranscriptUpdate,
};
use crate::visemes::{approximate_marks, viseme_units};
use async_trait::async_trait;
use holo_types::{AudioSegment, ParticipantId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STREAM_CAPACITY: usize = 32;

/// Failure injection and stream accounting shared by the scripted engines.
#[derive(Debug, Default)]
pub struct ScriptControls {
    fail_opens: AtomicU32,
    fail_streams: AtomicU32,
    opened: AtomicU32,
    live: Arc<AtomicUsize>,
}

impl ScriptControls {
    /// The next `n` calls to `open` fail outright.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// The next `n` opened streams report an error before any output.
    pub fn fail_next_streams(&self, n: u32) {
        self.fail_streams.store(n, Ordering::SeqCst);
    }

    /// Total `open` calls, including failed ones.
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Streams whose engine side is still running.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn begin(&self, engine: &str) -> Result<(LiveGuard, bool), EngineError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_opens) {
            return Err(EngineError::Unavailable(format!("{engine}: scripted open failure")));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());
        Ok((guard, Self::take(&self.fail_streams)))
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn scripted_failure<O>(output: &OutputSink<O>, engine: &str) {
    let _ = output
        .send(Err(EngineError::Failed(format!("{engine}: scripted stream failure"))))
        .await;
}

/// Recognition that reveals a fixed transcript word by word as audio arrives.
#[derive(Debug)]
pub struct ScriptedRecognition {
    transcripts: HashMap<ParticipantId, String>,
    default_transcript: String,
    ms_per_word: u64,
    controls: ScriptControls,
}

impl ScriptedRecognition {
    pub fn new(default_transcript: impl Into<String>) -> Self {
        Self {
            transcripts: HashMap::new(),
            default_transcript: default_transcript.into(),
            ms_per_word: 200,
            controls: ScriptControls::default(),
        }
    }

    /// What `participant` will be heard saying.
    pub fn with_transcript(
        mut self,
        participant: impl Into<ParticipantId>,
        text: impl Into<String>,
    ) -> Self {
        self.transcripts.insert(participant.into(), text.into());
        self
    }

    /// Audio needed to reveal one word.
    pub fn with_ms_per_word(mut self, ms: u64) -> Self {
        self.ms_per_word = ms.max(1);
        self
    }

    pub fn controls(&self) -> &ScriptControls {
        &self.controls
    }
}

#[async_trait]
impl Engine for ScriptedRecognition {
    type Params = RecognitionParams;
    type Input = Pcm;
    type Output = TranscriptUpdate;

    fn name(&self) -> &str {
        "scripted-recognition"
    }

    async fn open(
        &self,
        params: RecognitionParams,
    ) -> Result<EngineStream<Pcm, TranscriptUpdate>, EngineError> {
        let (guard, fail) = self.controls.begin(self.name())?;
        let transcript = self
            .transcripts
            .get(&params.participant_id)
            .unwrap_or(&self.default_transcript)
            .clone();
        let ms_per_word = self.ms_per_word;

        Ok(EngineStream::<Pcm, TranscriptUpdate>::spawn(STREAM_CAPACITY, move |mut input, output, _abort| async move {
            let _guard = guard;
            if fail {
                scripted_failure(&output, "scripted-recognition").await;
                return;
            }
            let words: Vec<&str> = transcript.split_whitespace().collect();
            let full_ms = (words.len() as u64 * ms_per_word).max(1);
            let mut heard_ms = 0u64;

            while let Some(pcm) = input.recv().await {
                heard_ms += AudioSegment::pcm_duration_ms(pcm.len(), params.sample_rate);
                let revealed = (heard_ms.div_ceil(ms_per_word) as usize).min(words.len());
                let update = TranscriptUpdate {
                    text: words[..revealed].join(" "),
                    confidence: (heard_ms as f32 / full_ms as f32).min(0.9),
                    is_final: false,
                };
                if output.send(Ok(update)).await.is_err() {
                    return;
                }
            }

            let _ = output
                .send(Ok(TranscriptUpdate {
                    text: words.join(" "),
                    confidence: 1.0,
                    is_final: true,
                }))
                .await;
        }))
    }
}

/// Generation that streams canned replies.
#[derive(Debug)]
pub struct ScriptedGeneration {
    replies: Vec<(String, Vec<String>)>,
    default_reply: Vec<String>,
    first_chunk_delay: Duration,
    chunk_delay: Duration,
    controls: ScriptControls,
}

impl ScriptedGeneration {
    /// Streams `default_reply` chunk by chunk for any prompt.
    pub fn new<S: Into<String>>(default_reply: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Vec::new(),
            default_reply: default_reply.into_iter().map(Into::into).collect(),
            first_chunk_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            controls: ScriptControls::default(),
        }
    }

    /// Streams `reply` when the prompt contains `needle` (case-insensitive).
    pub fn reply_to<S: Into<String>>(
        mut self,
        needle: impl Into<String>,
        reply: impl IntoIterator<Item = S>,
    ) -> Self {
        self.replies.push((
            needle.into().to_lowercase(),
            reply.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn with_delays(mut self, first_chunk: Duration, between_chunks: Duration) -> Self {
        self.first_chunk_delay = first_chunk;
        self.chunk_delay = between_chunks;
        self
    }

    pub fn controls(&self) -> &ScriptControls {
        &self.controls
    }
}

#[async_trait]
impl Engine for ScriptedGeneration {
    type Params = GenerationParams;
    type Input = String;
    type Output = String;

    fn name(&self) -> &str {
        "scripted-generation"
    }

    async fn open(
        &self,
        _params: GenerationParams,
    ) -> Result<EngineStream<String, String>, EngineError> {
        let (guard, fail) = self.controls.begin(self.name())?;
        let replies = self.replies.clone();
        let default_reply = self.default_reply.clone();
        let (first_delay, chunk_delay) = (self.first_chunk_delay, self.chunk_delay);

        Ok(EngineStream::<String, String>::spawn(STREAM_CAPACITY, move |mut input, output, _abort| async move {
            let _guard = guard;
            let mut prompt = String::new();
            while let Some(part) = input.recv().await {
                prompt.push_str(&part);
            }
            if fail {
                scripted_failure(&output, "scripted-generation").await;
                return;
            }
            let prompt = prompt.to_lowercase();
            let reply = replies
                .iter()
                .find(|(needle, _)| prompt.contains(needle.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or(default_reply);

            tokio::time::sleep(first_delay).await;
            for (i, chunk) in reply.into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(chunk_delay).await;
                }
                if output.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        }))
    }
}

/// Synthesis that renders silence sized to the text, with approximate visemes.
#[derive(Debug)]
pub struct ScriptedSynthesis {
    ms_per_unit: u64,
    chunk_delay: Duration,
    controls: ScriptControls,
}

impl Default for ScriptedSynthesis {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSynthesis {
    pub fn new() -> Self {
        Self {
            ms_per_unit: 60,
            chunk_delay: Duration::ZERO,
            controls: ScriptControls::default(),
        }
    }

    /// Audio length per phonetic unit of text.
    pub fn with_ms_per_unit(mut self, ms: u64) -> Self {
        self.ms_per_unit = ms;
        self
    }

    /// Processing time per text chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn controls(&self) -> &ScriptControls {
        &self.controls
    }
}

#[async_trait]
impl Engine for ScriptedSynthesis {
    type Params = SynthesisParams;
    type Input = String;
    type Output = SynthesisChunk;

    fn name(&self) -> &str {
        "scripted-synthesis"
    }

    async fn open(
        &self,
        params: SynthesisParams,
    ) -> Result<EngineStream<String, SynthesisChunk>, EngineError> {
        let (guard, fail) = self.controls.begin(self.name())?;
        let (ms_per_unit, chunk_delay) = (self.ms_per_unit, self.chunk_delay);

        Ok(EngineStream::<String, SynthesisChunk>::spawn(STREAM_CAPACITY, move |mut input, output, _abort| async move {
            let _guard = guard;
            if fail {
                scripted_failure(&output, "scripted-synthesis").await;
                return;
            }
            while let Some(text) = input.recv().await {
                tokio::time::sleep(chunk_delay).await;
                let duration_ms = viseme_units(&text).len() as u64 * ms_per_unit;
                let samples = duration_ms * params.sample_rate as u64 / 1000;
                let chunk = SynthesisChunk {
                    marks: approximate_marks(&text, duration_ms),
                    text,
                    sample_rate: params.sample_rate,
                    pcm: vec![0; samples as usize * 2],
                    duration_ms,
                };
                if output.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        }))
    }
}
