use holo_voice::scripted::{ScriptedGeneration, ScriptedSynthesis};
use holo_voice::{
    AdapterError, AdapterPolicy, GenerationAdapter, GenerationEngine, GenerationParams, Stage,
    StreamingAdapter, SynthesisAdapter, SynthesisEngine, SynthesisParams,
};
use std::sync::Arc;
use std::time::Duration;

fn policy(chunk_timeout: Option<Duration>) -> AdapterPolicy {
    AdapterPolicy {
        retry_backoff: Duration::from_millis(50),
        chunk_timeout,
        cleanup_timeout: Duration::from_millis(100),
    }
}

fn generation_params() -> GenerationParams {
    GenerationParams {
        companion_id: "luna".into(),
        persona: String::new(),
        speaker: "alice".into(),
        history: Vec::new(),
        max_chars: 500,
    }
}

fn generation(engine: Arc<ScriptedGeneration>, chunk_timeout: Option<Duration>) -> GenerationAdapter {
    let engine: Arc<GenerationEngine> = engine;
    GenerationAdapter::new(engine, generation_params(), Stage::Generation, policy(chunk_timeout))
}

async fn collect(adapter: &mut GenerationAdapter) -> Result<Vec<String>, AdapterError> {
    let mut out = Vec::new();
    while let Some(chunk) = adapter.next_output().await? {
        out.push(chunk);
    }
    Ok(out)
}

#[tokio::test]
async fn single_failure_is_retried_transparently() {
    let engine = Arc::new(ScriptedGeneration::new(["Hi", " there!"]));
    engine.controls().fail_next_streams(1);
    let mut adapter = generation(engine.clone(), None);

    adapter.stream_start().await.unwrap();
    adapter.stream_feed("hello".into()).await.unwrap();
    let rest = adapter.stream_final().await.unwrap();

    assert_eq!(rest, vec!["Hi".to_string(), " there!".to_string()]);
    assert_eq!(engine.controls().opened(), 2);
}

#[tokio::test]
async fn open_failure_is_retried_once() {
    let engine = Arc::new(ScriptedGeneration::new(["ok"]));
    engine.controls().fail_next_opens(1);
    let mut adapter = generation(engine.clone(), None);

    adapter.stream_start().await.unwrap();
    adapter.stream_feed("hi".into()).await.unwrap();
    assert_eq!(adapter.stream_final().await.unwrap(), vec!["ok".to_string()]);
    assert_eq!(engine.controls().opened(), 2);
}

#[tokio::test]
async fn second_failure_surfaces() {
    let engine = Arc::new(ScriptedGeneration::new(["never"]));
    engine.controls().fail_next_streams(2);
    let mut adapter = generation(engine.clone(), None);

    adapter.stream_start().await.unwrap();
    adapter.stream_feed("hello".into()).await.unwrap();
    match adapter.stream_final().await {
        Err(AdapterError::Failure { stage, reason }) => {
            assert_eq!(stage, Stage::Generation);
            assert!(reason.contains("scripted stream failure"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(engine.controls().opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_engine_times_out_after_retry() {
    let engine = Arc::new(
        ScriptedGeneration::new(["late"]).with_delays(Duration::from_secs(5), Duration::ZERO),
    );
    let mut adapter = generation(engine.clone(), Some(Duration::from_millis(300)));

    adapter.stream_start().await.unwrap();
    adapter.stream_feed("hello".into()).await.unwrap();
    match adapter.stream_final().await {
        Err(AdapterError::Timeout { stage, after_ms }) => {
            assert_eq!(stage, Stage::Generation);
            assert_eq!(after_ms, 300);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(engine.controls().opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn failure_after_output_is_not_retried() {
    // Second chunk arrives too late; the first is already with the caller.
    let engine = Arc::new(
        ScriptedGeneration::new(["Hi", " there!"])
            .with_delays(Duration::ZERO, Duration::from_secs(2)),
    );
    let mut adapter = generation(engine.clone(), Some(Duration::from_millis(500)));

    adapter.stream_start().await.unwrap();
    adapter.stream_feed("hello".into()).await.unwrap();
    adapter.stream_final().await.ok();
    assert_eq!(engine.controls().opened(), 1);
}

#[tokio::test]
async fn early_close_reads_as_end_of_stream() {
    let engine = Arc::new(ScriptedGeneration::new(Vec::<String>::new()));
    let mut adapter = generation(engine, None);
    adapter.stream_start().await.unwrap();
    adapter.stream_feed("anything".into()).await.unwrap();
    assert!(adapter.stream_final().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_tears_down_the_engine_request() {
    let engine = Arc::new(
        ScriptedSynthesis::new().with_chunk_delay(Duration::from_secs(10)),
    );
    let dyn_engine: Arc<SynthesisEngine> = engine.clone();
    let params = SynthesisParams {
        voice_id: "luna".into(),
        speed: 1.0,
        sample_rate: 16_000,
    };
    let mut adapter = SynthesisAdapter::new(dyn_engine, params, Stage::Synthesis, policy(None));

    adapter.stream_start().await.unwrap();
    adapter.stream_feed("a long sentence".into()).await.unwrap();
    assert_eq!(engine.controls().live(), 1);

    let started = tokio::time::Instant::now();
    adapter.cancel().await;
    assert!(started.elapsed() <= Duration::from_millis(100));
    assert_eq!(engine.controls().live(), 0);

    assert_eq!(adapter.next_output().await.unwrap_err(), AdapterError::Closed);
    assert_eq!(
        adapter.stream_feed("more".into()).await.unwrap_err(),
        AdapterError::Closed
    );
}

#[tokio::test]
async fn unstarted_adapter_rejects_feed() {
    let engine = Arc::new(ScriptedGeneration::new(["x"]));
    let mut adapter = generation(engine, None);
    assert_eq!(
        adapter.stream_feed("hi".into()).await.unwrap_err(),
        AdapterError::NotStarted
    );
    assert_eq!(collect(&mut adapter).await.unwrap_err(), AdapterError::NotStarted);
}
