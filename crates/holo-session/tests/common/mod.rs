#![allow(dead_code)]

use holo_link::OutboundFrame;
use holo_session::{Collaborators, Engines, MemoryTurnStore, Orchestrator, PipelineConfig, SessionSnapshot};
use holo_types::{DevicePayload, SessionId};
use holo_voice::scripted::{ScriptedGeneration, ScriptedRecognition, ScriptedSynthesis};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Samples per 20 ms frame at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;
pub const FRAME_MS: u64 = 20;

/// Speech energy that counts as talking but not as barging in.
pub const TALK: i16 = 4_000;
/// Loud enough to interrupt the companion.
pub const SHOUT: i16 = 16_000;

pub const PIPELINE: &str = r#"
[latency]
generation_soft_deadline_ms = 800
generation_total_deadline_ms = 4000
synthesis_soft_deadline_ms = 700
hard_deadline_ms = 2000
target_mean_ms = 1200
target_p95_ms = 2000

[context]
max_turns = 8
max_chars = 4000
eviction = "drop_oldest"

[turn]
likely_final_confidence = 0.6
likely_final_min_ms = 300
arbitration_window_ms = 100
pending_capacity = 4
barge_in_energy = 0.2
barge_in_min_ms = 200

[ingress]
sample_rate = 16000
reorder_window_ms = 0
speech_energy = 0.05
end_of_speech_ms = 300
max_utterance_ms = 15000

[link]
grace_period_ms = 20000
unacked_capacity = 256

[adapters]
retry_backoff_ms = 50
chunk_timeout_ms = 1500
recognition_final_timeout_ms = 2000
cleanup_timeout_ms = 100

[session]
idle_timeout_ms = 600000
cancel_ack_timeout_ms = 250
stage_queue_capacity = 16
latency_samples = 64
history_len = 64

[quotas.free]
max_concurrent_sessions = 2
max_turns_per_session = 50
max_response_chars = 400

[quotas.premium]
max_concurrent_sessions = 10
max_turns_per_session = 1000
max_response_chars = 2000
"#;

pub fn config() -> PipelineConfig {
    toml::from_str(PIPELINE).unwrap()
}

pub fn engines(
    recognition: ScriptedRecognition,
    generation: ScriptedGeneration,
    synthesis: ScriptedSynthesis,
) -> Engines {
    Engines {
        recognition: Arc::new(recognition),
        generation: Arc::new(generation),
        synthesis: Arc::new(synthesis),
    }
}

pub struct Harness {
    pub orch: Orchestrator,
    pub store: MemoryTurnStore,
}

pub fn harness(config: PipelineConfig, engines: Engines) -> Harness {
    let store = MemoryTurnStore::default();
    let collaborators = Collaborators {
        store: Arc::new(store.clone()),
        ..Collaborators::default()
    };
    let orch = Orchestrator::new(config, engines, collaborators).unwrap();
    Harness { orch, store }
}

/// One 20 ms frame of a constant signal.
pub fn frame(amplitude: i16) -> Vec<u8> {
    amplitude.to_le_bytes().repeat(FRAME_SAMPLES)
}

/// Streams `duration_ms` of audio in real time, starting at capture time
/// `start_ms`.
pub async fn speak(
    orch: &Orchestrator,
    session_id: SessionId,
    participant: &str,
    start_ms: u64,
    duration_ms: u64,
    amplitude: i16,
) {
    for i in 0..duration_ms / FRAME_MS {
        orch.submit_audio_frame(session_id, participant, start_ms + i * FRAME_MS, frame(amplitude))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
    }
}

/// A device that plays and acknowledges every frame as it arrives.
pub struct Device {
    pub frames: Arc<Mutex<Vec<OutboundFrame>>>,
    task: JoinHandle<()>,
}

impl Device {
    pub fn payloads(&self) -> Vec<DevicePayload> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.payload.clone())
            .collect()
    }

    pub fn seqs(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.seq).collect()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn acking_device(orch: &Orchestrator, session_id: SessionId) -> Device {
    let attachment = orch.attach_device(session_id, "holo-1").await.unwrap();
    let links = orch.links().clone();
    let mut connection = links
        .connect(attachment.link_id, &attachment.token, None)
        .await
        .unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let seen = frames.clone();
    let task = tokio::spawn(async move {
        while let Some(frame) = connection.frames.recv().await {
            let seq = frame.seq;
            seen.lock().unwrap().push(frame);
            let _ = links.ack(attachment.link_id, seq).await;
        }
    });
    Device { frames, task }
}

/// Waits until a snapshot satisfies `pred`, returning it.
pub async fn wait_for(
    rx: &mut watch::Receiver<SessionSnapshot>,
    pred: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session dropped")
        .clone()
}
