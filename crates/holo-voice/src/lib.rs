//! Streaming adapters for the external speech and language engines.
//!
//! Every engine (speech recognition, response generation, speech synthesis)
//! is reached through the same contract: open a stream, feed input chunks,
//! read output chunks, close or cancel. [`Engine`] is that contract; one
//! implementation exists per external engine and the orchestrator never
//! branches on which one it is talking to.
//!
//! [`EngineAdapter`] wraps any engine with the pipeline's recovery rules:
//! a failure is retried once with backoff while no output has been produced
//! yet, per-chunk waits are bounded, and cancellation tears the external
//! request down within a bounded cleanup time.

pub mod adapter;
pub mod engine;
pub mod engines;
pub mod error;
pub mod scripted;
pub mod types;
pub mod visemes;

pub use adapter::{AdapterPolicy, EngineAdapter, StreamingAdapter};
pub use engine::{
    Engine, EngineStream, GenerationEngine, OutputSink, RecognitionEngine, SynthesisEngine,
};
pub use error::{AdapterError, EngineError, Stage};
pub use types::{
    Exchange, GenerationParams, Pcm, RecognitionParams, SynthesisChunk, SynthesisParams,
    TimingMark, TranscriptUpdate,
};

/// Adapter over a recognition engine.
pub type RecognitionAdapter = EngineAdapter<RecognitionParams, Pcm, TranscriptUpdate>;

/// Adapter over a generation engine. Input is the prompt, output is text.
pub type GenerationAdapter = EngineAdapter<GenerationParams, String, String>;

/// Adapter over a synthesis engine. Input is response text.
pub type SynthesisAdapter = EngineAdapter<SynthesisParams, String, SynthesisChunk>;
