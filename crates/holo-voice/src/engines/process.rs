//! Local-binary engines: a whisper.cpp-style recognizer and a piper-style
//! synthesizer, both driven over stdin/stdout.

use crate::engine::{Engine, EngineStream};
use crate::error::EngineError;
use crate::types::{Pcm, RecognitionParams, SynthesisChunk, SynthesisParams, TranscriptUpdate};
use crate::visemes::approximate_marks;
use async_trait::async_trait;
use holo_types::AudioSegment;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum buffered audio per utterance (10 MiB).
const MAX_RECOGNITION_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Maximum text per synthesis call (64 KiB).
const MAX_SYNTHESIS_INPUT_BYTES: usize = 64 * 1024;

const STREAM_CAPACITY: usize = 16;

/// Runs `command`, writes `input` to its stdin and collects stdout.
async fn run_binary(
    mut command: Command,
    input: Vec<u8>,
    timeout: Duration,
    what: &str,
) -> Result<Vec<u8>, EngineError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| EngineError::Unavailable(format!("failed to spawn {what}: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Failed(format!("failed to open {what} stdin")))?;

    // Write from a separate task so a full stdout pipe cannot deadlock us.
    let write_task = tokio::spawn(async move { stdin.write_all(&input).await });

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            EngineError::Failed(format!(
                "{what} timed out after {} seconds",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| EngineError::Failed(format!("failed to wait for {what}: {e}")))?;

    match write_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(EngineError::Failed(format!(
                "failed to write to {what} stdin: {e}"
            )))
        }
        Err(e) => return Err(EngineError::Failed(format!("stdin task failed: {e}"))),
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Failed(format!("{what} failed: {stderr}")));
    }
    Ok(output.stdout)
}

/// Speech recognition through a whisper.cpp-compatible binary.
///
/// The binary has no streaming mode, so audio is buffered until the
/// utterance ends and a single final transcript is emitted.
#[derive(Debug, Clone)]
pub struct ProcessRecognition {
    binary_path: PathBuf,
    model_path: PathBuf,
    timeout: Duration,
}

impl ProcessRecognition {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: model_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Engine for ProcessRecognition {
    type Params = RecognitionParams;
    type Input = Pcm;
    type Output = TranscriptUpdate;

    fn name(&self) -> &str {
        "whisper"
    }

    async fn open(
        &self,
        params: RecognitionParams,
    ) -> Result<EngineStream<Pcm, TranscriptUpdate>, EngineError> {
        let engine = self.clone();
        Ok(EngineStream::<Pcm, TranscriptUpdate>::spawn(
            STREAM_CAPACITY,
            move |mut input, output, _abort| async move {
                let mut audio = Vec::new();
                while let Some(pcm) = input.recv().await {
                    if audio.len() + pcm.len() > MAX_RECOGNITION_INPUT_BYTES {
                        let _ = output
                            .send(Err(EngineError::InvalidInput(format!(
                                "audio exceeds maximum size of {MAX_RECOGNITION_INPUT_BYTES} bytes"
                            ))))
                            .await;
                        return;
                    }
                    audio.extend_from_slice(&pcm);
                }

                let mut command = Command::new(&engine.binary_path);
                command.arg("-m").arg(&engine.model_path).arg("-f").arg("-");
                if let Some(language) = &params.language {
                    command.arg("-l").arg(language);
                }

                let result = run_binary(command, audio, engine.timeout, "whisper")
                    .await
                    .map(|stdout| TranscriptUpdate {
                        text: String::from_utf8_lossy(&stdout).trim().to_string(),
                        confidence: 1.0,
                        is_final: true,
                    });
                let _ = output.send(result).await;
            },
        ))
    }
}

/// Speech synthesis through a piper-compatible binary emitting raw PCM.
///
/// Voices resolve to `<voices_dir>/<voice_id>.onnx`. Each text chunk is one
/// process invocation; viseme marks are approximated from the text.
#[derive(Debug, Clone)]
pub struct ProcessSynthesis {
    binary_path: PathBuf,
    voices_dir: PathBuf,
    timeout: Duration,
}

impl ProcessSynthesis {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        voices_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            voices_dir: voices_dir.into(),
            timeout,
        }
    }

    fn model_path(&self, voice_id: &str) -> PathBuf {
        let path = Path::new(voice_id);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.voices_dir.join(format!("{voice_id}.onnx"))
        }
    }
}

#[async_trait]
impl Engine for ProcessSynthesis {
    type Params = SynthesisParams;
    type Input = String;
    type Output = SynthesisChunk;

    fn name(&self) -> &str {
        "piper"
    }

    async fn open(
        &self,
        params: SynthesisParams,
    ) -> Result<EngineStream<String, SynthesisChunk>, EngineError> {
        if !(0.1..=10.0).contains(&params.speed) {
            return Err(EngineError::InvalidInput(
                "speed must be between 0.1 and 10.0".to_string(),
            ));
        }
        let model_path = self.model_path(&params.voice_id);
        if !model_path.exists() {
            return Err(EngineError::Unavailable(format!(
                "voice model not found: {}",
                model_path.display()
            )));
        }
        let engine = self.clone();

        Ok(EngineStream::<String, SynthesisChunk>::spawn(
            STREAM_CAPACITY,
            move |mut input, output, _abort| async move {
                while let Some(text) = input.recv().await {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if text.len() > MAX_SYNTHESIS_INPUT_BYTES {
                        let _ = output
                            .send(Err(EngineError::InvalidInput(format!(
                                "text exceeds maximum size of {MAX_SYNTHESIS_INPUT_BYTES} bytes"
                            ))))
                            .await;
                        return;
                    }

                    let mut command = Command::new(&engine.binary_path);
                    command
                        .arg("--model")
                        .arg(&model_path)
                        .arg("--output_raw")
                        // Length scale is the inverse of speed.
                        .arg("--length_scale")
                        .arg((1.0 / params.speed).to_string());

                    let chunk = run_binary(
                        command,
                        text.clone().into_bytes(),
                        engine.timeout,
                        "piper",
                    )
                    .await
                    .map(|pcm| {
                        let duration_ms = AudioSegment::pcm_duration_ms(pcm.len(), params.sample_rate);
                        SynthesisChunk {
                            marks: approximate_marks(&text, duration_ms),
                            text,
                            sample_rate: params.sample_rate,
                            pcm,
                            duration_ms,
                        }
                    });
                    let failed = chunk.is_err();
                    if output.send(chunk).await.is_err() || failed {
                        return;
                    }
                }
            },
        ))
    }
}
