//! End-to-end pipeline scenarios over the in-memory coordination store
//! with scripted inference and codec backends.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use moments_pipeline::{
    app_context::PipelineContext,
    config::WorkerConfig,
    core::{
        error::{PipelineError, PipelineResult},
        keys,
        types::{RunState, StageId, StageStatus},
    },
    data_connector::{CoordStore, MemoryCoordStore},
    enqueue::EnqueueService,
    inference::{ChatResult, Inference},
    media::{MediaInfo, MediaProcessor},
    protocols::{
        chat::{ChatMessage, ContentPart, MessageContent},
        run::{RunConfig, SamplingParams},
        transcription::{SegmentTimestamp, TranscriptResult, WordTimestamp},
    },
    registry::{ConnectionMode, ModelDescriptor},
    storage::{catalog::MemoryCatalog, MemoryArtifactStore},
    tunnel::TunnelHandle,
    worker::Worker,
};

const VIDEO_DURATION: f64 = 300.0;

// ---- scripted backends ----

#[derive(Default)]
struct FakeInference {
    generation_content: String,
    refinement_content: String,
    generation_calls: AtomicUsize,
    refinement_calls: AtomicUsize,
    video_part_calls: AtomicUsize,
    transcribe_calls: AtomicUsize,
    /// When set, `transcribe` raises the subject's cancel flag before
    /// returning, simulating a cancel request landing mid-run.
    cancel_after_transcribe: std::sync::Mutex<Option<(Arc<MemoryCoordStore>, String)>>,
}

impl FakeInference {
    fn new(generation_content: &str) -> Self {
        Self {
            generation_content: generation_content.to_string(),
            refinement_content: r#"{"start_time": 11.0, "end_time": 59.0}"#.to_string(),
            ..Self::default()
        }
    }

    fn cancel_after_transcribe(&self, store: Arc<MemoryCoordStore>, subject_id: &str) {
        *self.cancel_after_transcribe.lock().unwrap() =
            Some((store, subject_id.to_string()));
    }
}

fn message_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::VideoUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn has_video_part(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| match &m.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .any(|p| matches!(p, ContentPart::VideoUrl { .. })),
        MessageContent::Text(_) => false,
    })
}

#[async_trait]
impl Inference for FakeInference {
    async fn chat_complete(
        &self,
        _handle: &TunnelHandle,
        _model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        _sampling: &SamplingParams,
        _cancel: &CancellationToken,
    ) -> PipelineResult<ChatResult> {
        if has_video_part(&messages) {
            self.video_part_calls.fetch_add(1, Ordering::SeqCst);
        }
        let content = if message_text(&messages).contains("Moment:") {
            self.refinement_calls.fetch_add(1, Ordering::SeqCst);
            self.refinement_content.clone()
        } else {
            self.generation_calls.fetch_add(1, Ordering::SeqCst);
            self.generation_content.clone()
        };
        Ok(ChatResult {
            content,
            model: Some("fake".to_string()),
        })
    }

    async fn transcribe(
        &self,
        _handle: &TunnelHandle,
        _audio_file: &Path,
        _cancel: &CancellationToken,
    ) -> PipelineResult<TranscriptResult> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.cancel_after_transcribe.lock().unwrap().clone();
        if let Some((store, subject_id)) = hook {
            store
                .set_nx_ex(&keys::cancel(&subject_id), "1", Duration::from_secs(300))
                .await?;
        }
        Ok(TranscriptResult {
            transcription: "welcome back today we ship".to_string(),
            word_timestamps: vec![WordTimestamp {
                word: "welcome".into(),
                start: 0.0,
                end: 0.4,
            }],
            segment_timestamps: vec![SegmentTimestamp {
                text: "welcome back today we ship".into(),
                start: 0.0,
                end: 5.0,
            }],
            processing_time: 0.1,
        })
    }
}

/// Codec fake: writes placeholder outputs, optionally failing the clip
/// whose clamped start matches `fail_clip_start`.
struct FakeMedia {
    fail_clip_start: Option<f64>,
}

#[async_trait]
impl MediaProcessor for FakeMedia {
    async fn probe(&self, _input: &Path) -> PipelineResult<MediaInfo> {
        Ok(MediaInfo {
            duration_seconds: VIDEO_DURATION,
            width: Some(1920),
            height: Some(1080),
            fps: Some(30.0),
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
            size_bytes: Some(1024),
        })
    }

    async fn extract_audio(&self, _input: &Path, output: &Path) -> PipelineResult<()> {
        tokio::fs::write(output, b"RIFFfake").await?;
        Ok(())
    }

    async fn cut_clip(
        &self,
        _input: &Path,
        output: &Path,
        start: f64,
        _end: f64,
    ) -> PipelineResult<()> {
        if self.fail_clip_start.is_some_and(|s| (s - start).abs() < 0.01) {
            return Err(PipelineError::Media("corrupt input near clip start".into()));
        }
        tokio::fs::write(output, b"clip").await?;
        Ok(())
    }
}

// ---- harness ----

struct Harness {
    app: Arc<PipelineContext>,
    store: Arc<MemoryCoordStore>,
    catalog: Arc<MemoryCatalog>,
    artifacts: Arc<MemoryArtifactStore>,
    inference: Arc<FakeInference>,
    enqueue: EnqueueService,
    _source_server: tokio::task::JoinHandle<()>,
    source_url: String,
}

fn direct_descriptor(key: &str, supports_video: bool, path: &str) -> ModelDescriptor {
    ModelDescriptor {
        key: key.to_string(),
        name: key.to_string(),
        model_id: None,
        ssh_host: String::new(),
        ssh_user: String::new(),
        local_port: 1,
        remote_host: "127.0.0.1".into(),
        remote_port: 1,
        endpoint_path: path.to_string(),
        supports_video,
        connection_mode: ConnectionMode::Direct,
        direct_host: Some("127.0.0.1".into()),
        direct_port: Some(1),
        sampling: SamplingParams::default(),
    }
}

async fn spawn_source_server() -> (tokio::task::JoinHandle<()>, String) {
    use axum::{routing::get, Router};
    let router = Router::new().route("/video.mp4", get(|| async { "fake-video-bytes" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (handle, format!("http://{addr}/video.mp4"))
}

async fn harness(inference: FakeInference, media: FakeMedia) -> Harness {
    let store = Arc::new(MemoryCoordStore::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let inference = Arc::new(inference);

    let mut config = WorkerConfig::default();
    config.block = Duration::from_millis(20);
    config.reclaim_idle = Duration::from_millis(40);
    config.temp_root = std::env::temp_dir().join("moments-pipeline-tests");

    let app = PipelineContext::new(
        config,
        store.clone() as Arc<dyn CoordStore>,
        inference.clone() as Arc<dyn Inference>,
        Arc::new(media),
        artifacts.clone(),
        catalog.clone(),
    )
    .unwrap();

    for descriptor in [
        direct_descriptor("vl", true, "/v1/chat/completions"),
        direct_descriptor("text_only", false, "/v1/chat/completions"),
        direct_descriptor("parakeet", false, "/transcribe"),
    ] {
        app.registry.upsert(&descriptor).await.unwrap();
    }

    // Deployments create the consumer group before the first submit;
    // a group created at the tail would miss earlier entries.
    store
        .group_create(keys::REQUEST_STREAM, keys::WORKER_GROUP)
        .await
        .unwrap();

    let (server, source_url) = spawn_source_server().await;
    Harness {
        enqueue: EnqueueService::new(app.clone()),
        app,
        store,
        catalog,
        artifacts,
        inference,
        _source_server: server,
        source_url,
    }
}

fn two_moments() -> String {
    r#"Here you go:
[{"start_time": 10.0, "end_time": 60.0, "title": "Opening"},
 {"start_time": 100.0, "end_time": 160.0, "title": "Demo"}]"#
        .to_string()
}

fn five_moments() -> String {
    let mut items: Vec<String> = (0..4)
        .map(|i| {
            let start = 10.0 + 50.0 * i as f64;
            format!(
                r#"{{"start_time": {start}, "end_time": {}, "title": "M{i}"}}"#,
                start + 40.0
            )
        })
        .collect();
    // The fifth moment's clamped clip start (250 - 30 padding) is the
    // one the fake codec rejects.
    items.push(r#"{"start_time": 250.0, "end_time": 290.0, "title": "M4"}"#.to_string());
    format!("[{}]", items.join(","))
}

/// Run a worker until the subject reaches a terminal archived state.
async fn run_until_archived(harness: &Harness, subject_id: &str) -> RunState {
    let shutdown = CancellationToken::new();
    let worker = Worker::new(harness.app.clone(), shutdown.clone());
    let worker_task = tokio::spawn(async move { worker.run().await });

    let state = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(snapshot) = harness.app.history.latest(subject_id).await.unwrap() {
                if snapshot.state.is_terminal() {
                    break snapshot.state;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("run did not reach a terminal state in time");

    shutdown.cancel();
    worker_task.await.unwrap().unwrap();
    state
}

async fn pending_entries(harness: &Harness) -> usize {
    harness
        .store
        .autoclaim(
            keys::REQUEST_STREAM,
            keys::WORKER_GROUP,
            "probe",
            Duration::ZERO,
            100,
        )
        .await
        .unwrap()
        .len()
}

// ---- scenarios ----

#[tokio::test]
async fn happy_path_completes_every_stage() {
    let harness = harness(FakeInference::new(&two_moments()), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    let video = harness.catalog.add_video("subject-a", Some(&harness.source_url));

    let accepted = harness
        .enqueue
        .submit("subject-a", RunConfig::new("vl", "vl"))
        .await
        .unwrap();

    let state = run_until_archived(&harness, "subject-a").await;
    assert_eq!(state, RunState::Completed);

    // Every stage completed.
    let snapshot = harness.enqueue.run(&accepted.run_id).await.unwrap().unwrap();
    for stage in StageId::ORDERED {
        assert_eq!(
            snapshot.stages[&stage],
            StageStatus::Completed,
            "stage {stage} should be completed"
        );
    }

    // Active hash deleted, lock released, entry acked, one history row.
    assert!(harness.app.status.snapshot("subject-a").await.unwrap().is_none());
    assert!(!harness.app.locks.is_held("subject-a").await.unwrap());
    assert_eq!(pending_entries(&harness).await, 0);
    assert_eq!(harness.enqueue.history("subject-a", 10).await.unwrap().len(), 1);

    // Artifacts and records landed: media + audio + 2 clips.
    assert_eq!(harness.artifacts.object_count(), 4);
    let moments = harness.catalog.moments_for_video(video.id);
    let originals = moments.iter().filter(|m| !m.is_refined).count();
    let refined = moments.iter().filter(|m| m.is_refined).count();
    assert_eq!(originals, 2);
    assert_eq!(refined, 2);
    assert!(moments
        .iter()
        .filter(|m| m.is_refined)
        .all(|m| m.parent_id.is_some()));
    assert_eq!(harness.catalog.clips().len(), 2);
    assert_eq!(harness.inference.transcribe_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.inference.video_part_calls.load(Ordering::SeqCst), 2);

    // Durable history row finalized.
    let history = harness.catalog.run_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, "completed");
}

#[tokio::test]
async fn text_only_refinement_skips_clip_stages() {
    let harness = harness(FakeInference::new(&two_moments()), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    harness.catalog.add_video("subject-b", Some(&harness.source_url));

    let accepted = harness
        .enqueue
        .submit("subject-b", RunConfig::new("vl", "text_only"))
        .await
        .unwrap();

    let state = run_until_archived(&harness, "subject-b").await;
    assert_eq!(state, RunState::Completed);

    let snapshot = harness.enqueue.run(&accepted.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.stages[&StageId::ClipExtract], StageStatus::Skipped);
    assert_eq!(snapshot.stages[&StageId::ClipUpload], StageStatus::Skipped);
    assert_eq!(snapshot.stages[&StageId::Refinement], StageStatus::Completed);

    // Refinement ran with text prompts only.
    assert_eq!(harness.inference.refinement_calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.inference.video_part_calls.load(Ordering::SeqCst), 0);
    assert!(harness.catalog.clips().is_empty());
}

#[tokio::test]
async fn cancel_between_stages_stops_before_generation() {
    let harness = harness(FakeInference::new(&two_moments()), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    harness
        .inference
        .cancel_after_transcribe(harness.store.clone(), "subject-c");

    harness.catalog.add_video("subject-c", Some(&harness.source_url));
    let accepted = harness
        .enqueue
        .submit("subject-c", RunConfig::new("vl", "vl"))
        .await
        .unwrap();

    let state = run_until_archived(&harness, "subject-c").await;
    assert_eq!(state, RunState::Cancelled);

    // Transcribe finished; generation never started.
    let snapshot = harness.enqueue.run(&accepted.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.stages[&StageId::Transcribe], StageStatus::Completed);
    assert_eq!(
        snapshot.stages[&StageId::MomentGeneration],
        StageStatus::Pending
    );
    assert_eq!(harness.inference.generation_calls.load(Ordering::SeqCst), 0);

    // Lock released, entry acked, cancel flag cleared.
    assert!(!harness.app.locks.is_held("subject-c").await.unwrap());
    assert_eq!(pending_entries(&harness).await, 0);
    assert!(!harness
        .app
        .status
        .is_cancel_requested("subject-c")
        .await
        .unwrap());
}

#[tokio::test]
async fn duplicate_submit_yields_one_accept_one_conflict() {
    let harness = harness(FakeInference::new(&two_moments()), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    harness.catalog.add_video("subject-e", Some(&harness.source_url));

    let (first, second) = tokio::join!(
        harness.enqueue.submit("subject-e", RunConfig::new("vl", "vl")),
        harness.enqueue.submit("subject-e", RunConfig::new("vl", "vl")),
    );
    let accepted = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1, "exactly one submission wins");
    let conflict = [first, second]
        .into_iter()
        .find_map(|r| r.err())
        .expect("one submission must conflict");
    assert!(matches!(conflict, PipelineError::Conflict { .. }));

    // Exactly one stream entry was appended.
    let deliveries = harness
        .store
        .group_read(
            keys::REQUEST_STREAM,
            keys::WORKER_GROUP,
            "probe",
            100,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
}

#[tokio::test]
async fn unknown_model_is_rejected_at_submit() {
    let harness = harness(FakeInference::new(&two_moments()), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    harness.catalog.add_video("subject-x", Some(&harness.source_url));

    let err = harness
        .enqueue
        .submit("subject-x", RunConfig::new("nope", "vl"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(!harness.app.locks.is_held("subject-x").await.unwrap());
}

#[tokio::test]
async fn one_failed_clip_degrades_run_to_partial() {
    let harness = harness(
        FakeInference::new(&five_moments()),
        FakeMedia {
            // 250.0 start - 30.0 default padding = 220.0 clip start.
            fail_clip_start: Some(220.0),
        },
    )
    .await;
    let video = harness.catalog.add_video("subject-f", Some(&harness.source_url));

    let accepted = harness
        .enqueue
        .submit("subject-f", RunConfig::new("vl", "vl"))
        .await
        .unwrap();

    let state = run_until_archived(&harness, "subject-f").await;
    assert_eq!(state, RunState::Partial);

    // The stage itself completed with 4 successes recorded.
    let snapshot = harness.enqueue.run(&accepted.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.stages[&StageId::ClipExtract], StageStatus::Completed);
    assert_eq!(snapshot.fields["clips_total"], "5");
    assert_eq!(snapshot.fields["clips_failed"], "1");
    assert_eq!(harness.catalog.clips().len(), 4);

    // Refinement proceeded for all five: four with the clip attached,
    // one on the text-only path.
    assert_eq!(harness.inference.refinement_calls.load(Ordering::SeqCst), 5);
    assert_eq!(harness.inference.video_part_calls.load(Ordering::SeqCst), 4);
    let refined = harness
        .catalog
        .moments_for_video(video.id)
        .into_iter()
        .filter(|m| m.is_refined)
        .count();
    assert_eq!(refined, 5);
}

#[tokio::test]
async fn crashed_worker_entry_is_reclaimed_and_completed() {
    let harness = harness(FakeInference::new(&two_moments()), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    harness.catalog.add_video("subject-d", Some(&harness.source_url));

    harness
        .enqueue
        .submit("subject-d", RunConfig::new("vl", "vl"))
        .await
        .unwrap();

    // "Worker 1" reads the entry and dies without acking; its lock
    // expires with it.
    let stolen = harness
        .store
        .group_read(
            keys::REQUEST_STREAM,
            keys::WORKER_GROUP,
            "worker-crashed",
            1,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert_eq!(stolen.len(), 1);
    harness.store.expire_now(&keys::lock("subject-d"));

    // Let the entry age past the (shortened) reclaim threshold, then
    // let a fresh worker pick it up.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let state = run_until_archived(&harness, "subject-d").await;
    assert_eq!(state, RunState::Completed);
    assert_eq!(pending_entries(&harness).await, 0);
    assert!(!harness.app.locks.is_held("subject-d").await.unwrap());
}

#[tokio::test]
async fn zero_moments_completes_with_noop_downstream() {
    let harness = harness(FakeInference::new("[]"), FakeMedia {
        fail_clip_start: None,
    })
    .await;
    let video = harness.catalog.add_video("subject-z", Some(&harness.source_url));

    let accepted = harness
        .enqueue
        .submit("subject-z", RunConfig::new("vl", "vl"))
        .await
        .unwrap();

    let state = run_until_archived(&harness, "subject-z").await;
    assert_eq!(state, RunState::Completed);

    let snapshot = harness.enqueue.run(&accepted.run_id).await.unwrap().unwrap();
    assert_eq!(
        snapshot.stages[&StageId::MomentGeneration],
        StageStatus::Completed
    );
    assert_eq!(snapshot.stages[&StageId::ClipExtract], StageStatus::Completed);
    assert_eq!(snapshot.stages[&StageId::Refinement], StageStatus::Completed);
    assert!(harness.catalog.moments_for_video(video.id).is_empty());
    assert_eq!(harness.inference.refinement_calls.load(Ordering::SeqCst), 0);
}
