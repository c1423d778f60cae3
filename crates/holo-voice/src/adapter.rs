//! Retry, timeout and cancellation around an [`Engine`] stream.

use crate::engine::{Engine, EngineStream};
use crate::error::{AdapterError, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// The capability set shared by the recognition, generation and synthesis
/// adapters.
#[async_trait]
pub trait StreamingAdapter: Send {
    type Input: Send;
    type Output: Send;

    /// Opens the underlying engine stream.
    async fn stream_start(&mut self) -> Result<(), AdapterError>;

    /// Feeds one input chunk. Applies backpressure when the engine is slow.
    async fn stream_feed(&mut self, chunk: Self::Input) -> Result<(), AdapterError>;

    /// Waits for the next output chunk; `None` once the engine closed the
    /// stream, including an early close.
    async fn next_output(&mut self) -> Result<Option<Self::Output>, AdapterError>;

    /// Signals end of input without waiting; outputs keep coming through
    /// [`next_output`](Self::next_output).
    fn end_input(&mut self);

    /// Ends input and drains every remaining output chunk.
    async fn stream_final(&mut self) -> Result<Vec<Self::Output>, AdapterError>;

    /// Aborts the stream within the cleanup bound. Idempotent.
    async fn cancel(&mut self);
}

/// Recovery settings for one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterPolicy {
    /// Pause before the single retry.
    pub retry_backoff: Duration,
    /// Longest wait for any one output chunk. `None` waits indefinitely.
    pub chunk_timeout: Option<Duration>,
    /// Longest wait for an aborted engine request to wind down.
    pub cleanup_timeout: Duration,
}

/// Adapter over any [`Engine`].
///
/// A failure or chunk timeout is retried once, after `retry_backoff`, as
/// long as no output has reached the caller yet; input fed so far is
/// replayed into the new stream. Once output has been produced, errors
/// surface immediately so the caller can keep what it already has.
pub struct EngineAdapter<P, I, O> {
    engine: Arc<dyn Engine<Params = P, Input = I, Output = O>>,
    params: P,
    stage: Stage,
    policy: AdapterPolicy,
    stream: Option<EngineStream<I, O>>,
    replay: Vec<I>,
    retries_left: u32,
    produced: bool,
    input_done: bool,
    started: bool,
    closed: bool,
}

impl<P, I, O> EngineAdapter<P, I, O>
where
    P: Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(
        engine: Arc<dyn Engine<Params = P, Input = I, Output = O>>,
        params: P,
        stage: Stage,
        policy: AdapterPolicy,
    ) -> Self {
        Self {
            engine,
            params,
            stage,
            policy,
            stream: None,
            replay: Vec::new(),
            retries_left: 1,
            produced: false,
            input_done: false,
            started: false,
            closed: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether any output chunk has been handed to the caller.
    pub fn produced_output(&self) -> bool {
        self.produced
    }

    fn check_open(&self) -> Result<(), AdapterError> {
        if self.closed {
            Err(AdapterError::Closed)
        } else if !self.started {
            Err(AdapterError::NotStarted)
        } else {
            Ok(())
        }
    }

    async fn open_stream(&mut self) -> Result<(), AdapterError> {
        loop {
            match self.engine.open(self.params.clone()).await {
                Ok(mut stream) => {
                    for chunk in &self.replay {
                        if !stream.send(chunk.clone()).await {
                            break;
                        }
                    }
                    if self.input_done {
                        stream.close_input();
                    }
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    self.retry_or(AdapterError::Failure {
                        stage: self.stage,
                        reason: err.to_string(),
                    })
                    .await?
                }
            }
        }
    }

    /// Spends the retry if it is still available, otherwise returns `err`.
    async fn retry_or(&mut self, err: AdapterError) -> Result<(), AdapterError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown(self.policy.cleanup_timeout).await;
        }
        if self.produced || self.retries_left == 0 {
            tracing::warn!(stage = %self.stage, engine = self.engine.name(), error = %err, "adapter giving up");
            return Err(err);
        }
        self.retries_left -= 1;
        tracing::warn!(
            stage = %self.stage,
            engine = self.engine.name(),
            error = %err,
            backoff_ms = self.policy.retry_backoff.as_millis() as u64,
            "engine stream failed, retrying"
        );
        tokio::time::sleep(self.policy.retry_backoff).await;
        Ok(())
    }
}

#[async_trait]
impl<P, I, O> StreamingAdapter for EngineAdapter<P, I, O>
where
    P: Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn stream_start(&mut self) -> Result<(), AdapterError> {
        if self.closed {
            return Err(AdapterError::Closed);
        }
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.open_stream().await
    }

    async fn stream_feed(&mut self, chunk: I) -> Result<(), AdapterError> {
        self.check_open()?;
        if self.input_done {
            return Err(AdapterError::Closed);
        }
        if !self.produced {
            self.replay.push(chunk.clone());
        }
        if let Some(stream) = &self.stream {
            // A refused chunk means the engine is gone; next_output sees why.
            let _ = stream.send(chunk).await;
        }
        Ok(())
    }

    async fn next_output(&mut self) -> Result<Option<O>, AdapterError> {
        self.check_open()?;
        let chunk_timeout = self.policy.chunk_timeout;
        loop {
            if self.stream.is_none() {
                self.open_stream().await?;
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(AdapterError::Closed);
            };

            let item = match chunk_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        self.retry_or(AdapterError::Timeout {
                            stage: self.stage,
                            after_ms: limit.as_millis() as u64,
                        })
                        .await?;
                        continue;
                    }
                },
                None => stream.recv().await,
            };

            match item {
                Some(Ok(output)) => {
                    self.produced = true;
                    self.replay.clear();
                    return Ok(Some(output));
                }
                None => return Ok(None),
                Some(Err(err)) => {
                    self.retry_or(AdapterError::Failure {
                        stage: self.stage,
                        reason: err.to_string(),
                    })
                    .await?;
                }
            }
        }
    }

    fn end_input(&mut self) {
        self.input_done = true;
        if let Some(stream) = self.stream.as_mut() {
            stream.close_input();
        }
    }

    async fn stream_final(&mut self) -> Result<Vec<O>, AdapterError> {
        self.check_open()?;
        self.end_input();
        let mut rest = Vec::new();
        while let Some(output) = self.next_output().await? {
            rest.push(output);
        }
        self.stream = None;
        self.closed = true;
        Ok(rest)
    }

    async fn cancel(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown(self.policy.cleanup_timeout).await;
            tracing::debug!(stage = %self.stage, engine = self.engine.name(), "adapter cancelled");
        }
        self.replay.clear();
        self.closed = true;
    }
}
