//! The streaming contract every external engine implements.

use crate::error::EngineError;
use crate::types::{GenerationParams, Pcm, RecognitionParams, SynthesisChunk, SynthesisParams, TranscriptUpdate};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sending half of an engine's output channel.
pub type OutputSink<O> = mpsc::Sender<Result<O, EngineError>>;

/// An external streaming engine.
///
/// `open` starts one request. Input chunks go into the returned stream's
/// `input`; closing it tells the engine no more input follows. The engine
/// closes `output` when it is done, possibly early.
#[async_trait]
pub trait Engine: Send + Sync {
    type Params: Clone + Send + Sync + 'static;
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Short engine name for logs.
    fn name(&self) -> &str;

    async fn open(
        &self,
        params: Self::Params,
    ) -> Result<EngineStream<Self::Input, Self::Output>, EngineError>;
}

pub type RecognitionEngine =
    dyn Engine<Params = RecognitionParams, Input = Pcm, Output = TranscriptUpdate>;
pub type GenerationEngine = dyn Engine<Params = GenerationParams, Input = String, Output = String>;
/// Synthesis engines answer every input text chunk with exactly one
/// [`SynthesisChunk`], in input order.
pub type SynthesisEngine =
    dyn Engine<Params = SynthesisParams, Input = String, Output = SynthesisChunk>;

/// One open request against an engine.
///
/// Dropping the stream aborts the request.
#[derive(Debug)]
pub struct EngineStream<I, O> {
    input: Option<mpsc::Sender<I>>,
    output: mpsc::Receiver<Result<O, EngineError>>,
    abort: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<I: Send + 'static, O: Send + 'static> EngineStream<I, O> {
    /// Runs `work` as the engine side of a new stream.
    ///
    /// `work` receives the input channel, the output sink and the abort
    /// token. It is dropped as soon as the token fires, so child processes
    /// and HTTP requests it owns are torn down with it.
    pub fn spawn<F, Fut>(capacity: usize, work: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<I>, OutputSink<O>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (input_tx, input_rx) = mpsc::channel(capacity.max(1));
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        let abort = CancellationToken::new();
        let fut = work(input_rx, output_tx, abort.clone());
        let token = abort.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
        Self {
            input: Some(input_tx),
            output: output_rx,
            abort,
            task: Some(task),
        }
    }
}

impl<I, O> EngineStream<I, O> {
    /// Forwards one input chunk. Returns false if the engine stopped reading.
    pub async fn send(&self, chunk: I) -> bool {
        match &self.input {
            Some(input) => input.send(chunk).await.is_ok(),
            None => false,
        }
    }

    /// Signals end of input.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    pub async fn recv(&mut self) -> Option<Result<O, EngineError>> {
        self.output.recv().await
    }

    /// Aborts the request and waits up to `bound` for the engine side to
    /// finish. A task that overruns is forcibly aborted.
    pub async fn shutdown(&mut self, bound: Duration) {
        self.abort.cancel();
        self.input = None;
        self.output.close();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(bound, &mut task).await.is_err() {
                tracing::warn!(bound_ms = bound.as_millis() as u64, "engine task overran cleanup bound");
                task.abort();
            }
        }
    }
}

impl<I, O> Drop for EngineStream<I, O> {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}
