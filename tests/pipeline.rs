use ai_ad_shorts::conflict::{PlanRequest, StoryboardPlanner, VisionAnswer, VisionCheck};
use ai_ad_shorts::continuity::{ChainSettings, RunMode, TRANSITION_PREFIX};
use ai_ad_shorts::enhance::AssetSource;
use ai_ad_shorts::job_store::MemoryDurableStore;
use ai_ad_shorts::orchestrator::{JobStatusView, StoryboardOutput};
use ai_ad_shorts::poller::PollPolicy;
use ai_ad_shorts::provider::{MockBehavior, MockProvider, ModelTarget};
use ai_ad_shorts::storyboard::{
    GenerationContext, Segment, SegmentKind, SegmentStatus, SolutionAction, Storyboard,
};
use ai_ad_shorts::{GenerationError, JobSpec, JobStatus, JobStore, Orchestrator, ProviderGateway};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FAST: PollPolicy = PollPolicy {
    interval: Duration::from_millis(5),
    max_ticks: 10,
    max_poll_errors: 2,
};

/// Sees an object only when its name appears in the frame URI.
struct UriVision;

#[async_trait]
impl VisionCheck for UriVision {
    async fn classify(&self, image_uri: &str, question: &str) -> Result<VisionAnswer, GenerationError> {
        let seen = ["umbrella", "coffee cup"]
            .iter()
            .any(|item| question.contains(item) && image_uri.contains(&item.replace(' ', "_")));
        Ok(VisionAnswer::Flag(seen))
    }
}

/// Replans with a raincoat instead of whatever was excluded.
struct RaincoatPlanner;

#[async_trait]
impl StoryboardPlanner for RaincoatPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Storyboard, GenerationError> {
        Ok(Storyboard::new(
            &request.brief,
            vec![
                Segment::new(SegmentKind::Hook, 0.0, 3.0, "downpour at a bus stop"),
                Segment::new(SegmentKind::Body, 3.0, 8.0, "she zips the raincoat")
                    .with_solution("raincoat", SolutionAction::Interacting),
                Segment::new(SegmentKind::Cta, 8.0, 11.0, "raincoat hero shot"),
            ],
        ))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    disk: Arc<MemoryDurableStore>,
    mock: Arc<MockProvider>,
}

fn harness(mock: MockProvider) -> Harness {
    let mock = Arc::new(mock);
    let disk = Arc::new(MemoryDurableStore::new());
    let gateway = Arc::new(ProviderGateway::new().with_provider(mock.clone()));
    let store = Arc::new(JobStore::new(disk.clone()));
    let settings = ChainSettings {
        image: ModelTarget::new("mock", "image"),
        video: ModelTarget::new("mock", "video"),
        enhancer: Some(ModelTarget::new("mock", "enhancer")),
        image_policy: FAST,
        enhance_policy: FAST,
        video_policy: FAST,
    };
    let orchestrator = Orchestrator::new(
        gateway,
        store,
        Arc::new(UriVision),
        Arc::new(RaincoatPlanner),
        settings,
    );
    Harness {
        orchestrator,
        disk,
        mock,
    }
}

fn three_beats() -> Storyboard {
    Storyboard::new(
        "compact umbrella",
        vec![
            Segment::new(SegmentKind::Hook, 0.0, 3.0, "commuter caught in sudden rain")
                .with_description("commuter drenched at a bus stop"),
            Segment::new(SegmentKind::Body, 3.0, 8.0, "she opens the umbrella")
                .with_solution("umbrella", SolutionAction::Bringing),
            Segment::new(SegmentKind::Cta, 8.0, 11.0, "folded umbrella product shot"),
        ],
    )
}

fn storyboard_job(storyboard: Storyboard, resolve_conflicts: bool) -> JobSpec {
    JobSpec::Storyboard {
        storyboard,
        context: GenerationContext::default(),
        mode: RunMode::Full,
        generate_video: true,
        resolve_conflicts,
    }
}

async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> JobStatusView {
    for _ in 0..1_000 {
        let view = orchestrator.get_job_status(job_id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

fn output_of(view: &JobStatusView) -> StoryboardOutput {
    serde_json::from_value(view.result.clone().unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn body_enhancement_timeout_still_completes_with_base_source() {
    let mock = MockProvider::new("mock").with_rule(
        |r| {
            r.model == "enhancer"
                && r.options.get("segment_type").and_then(|v| v.as_str()) == Some("body")
        },
        MockBehavior::Hang,
    );
    let h = harness(mock);

    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), false))
        .await
        .unwrap();
    let view = wait_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(view.status, JobStatus::Completed, "error: {:?}", view.error);
    let output = output_of(&view);
    assert_eq!(output.segments.len(), 3);
    assert!(output.segments.iter().all(|s| s.status == SegmentStatus::Completed));
    assert!(output.segments.iter().all(|s| s.video.is_some()));
    assert_eq!(output.segments[0].source, Some(AssetSource::Enhanced));
    assert_eq!(output.segments[1].source, Some(AssetSource::Base));
    assert_eq!(output.segments[2].source, Some(AssetSource::Enhanced));

    let usage = h.orchestrator.usage();
    assert_eq!(usage.base_fallbacks, 2);
}

#[tokio::test(start_paused = true)]
async fn first_frames_reference_previous_last_frame_except_cta() {
    let h = harness(MockProvider::new("mock"));
    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), false))
        .await
        .unwrap();
    let output = output_of(&wait_terminal(&h.orchestrator, &job_id).await);

    let hook_last = &output.segments[0].keyframes.as_ref().unwrap().last.uri;
    let body_first = &output.segments[1].keyframes.as_ref().unwrap().first;
    assert!(body_first.references.contains(hook_last));
    assert!(body_first
        .prompt
        .contains(&format!("{TRANSITION_PREFIX} commuter drenched at a bus stop")));

    let body_last = &output.segments[1].keyframes.as_ref().unwrap().last.uri;
    let cta_first = &output.segments[2].keyframes.as_ref().unwrap().first;
    assert!(!cta_first.references.contains(body_last));
    assert!(!cta_first.prompt.contains(TRANSITION_PREFIX));

    let video_requests: Vec<_> = h
        .mock
        .submitted()
        .into_iter()
        .filter(|r| r.model == "video")
        .collect();
    assert_eq!(video_requests.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn status_survives_a_restart() {
    let h = harness(MockProvider::new("mock"));
    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), false))
        .await
        .unwrap();
    let before = wait_terminal(&h.orchestrator, &job_id).await;

    h.orchestrator.store().clear_memory();
    assert_eq!(h.orchestrator.store().memory_len(), 0);

    let after = h.orchestrator.get_job_status(&job_id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(h.orchestrator.store().memory_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_checkpoint_writes_do_not_hide_latest_status() {
    let h = harness(MockProvider::new("mock"));
    h.disk.set_fail_writes(true);

    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), false))
        .await
        .unwrap();
    let view = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(view.status, JobStatus::Completed);
    assert!(h.disk.is_empty());

    h.orchestrator.store().clear_memory();
    assert!(matches!(
        h.orchestrator.get_job_status(&job_id).await,
        Err(GenerationError::JobNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn interacting_item_never_conflicts() {
    let h = harness(MockProvider::new("mock"));
    let body = Segment::new(SegmentKind::Body, 3.0, 8.0, "he sips")
        .with_solution("coffee cup", SolutionAction::Interacting);
    let frames = vec!["mock://hook/empty_desk".to_string()];

    let report = h.orchestrator.check_conflict(&body, &frames).await.unwrap();
    assert!(!report.has_conflict);
    let again = h.orchestrator.check_conflict(&body, &frames).await.unwrap();
    assert_eq!(report.has_conflict, again.has_conflict);
}

#[tokio::test(start_paused = true)]
async fn missing_umbrella_is_a_conflict_with_an_alternative_plan() {
    let h = harness(MockProvider::new("mock"));
    let body = Segment::new(SegmentKind::Body, 3.0, 8.0, "she opens it")
        .with_solution("umbrella", SolutionAction::Bringing);
    let frames = vec![
        "mock://hook/first/bus_stop".to_string(),
        "mock://hook/last/wet_street".to_string(),
    ];
    let report = h.orchestrator.check_conflict(&body, &frames).await.unwrap();
    assert!(report.has_conflict);
    let again = h.orchestrator.check_conflict(&body, &frames).await.unwrap();
    assert_eq!(report.has_conflict, again.has_conflict);

    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), true))
        .await
        .unwrap();
    let view = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(view.status, JobStatus::Completed);
    let output = output_of(&view);
    assert_eq!(output.conflicts.len(), 1);
    assert!(output.conflicts[0].has_conflict);
    let alternative = output.alternative.expect("alternative storyboard");
    assert_ne!(alternative.id, output.storyboard.id);
    assert_eq!(
        output.storyboard.segments[1].solution.as_ref().unwrap().name,
        "umbrella"
    );
}

#[tokio::test(start_paused = true)]
async fn regenerate_job_returns_new_storyboard() {
    let h = harness(MockProvider::new("mock"));
    let original = three_beats();
    let job_id = h
        .orchestrator
        .submit_job(JobSpec::Regenerate {
            storyboard: original.clone(),
            item: "umbrella".to_string(),
            hook_frames: Vec::new(),
        })
        .await
        .unwrap();
    let view = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(view.status, JobStatus::Completed);
    let fresh: Storyboard = serde_json::from_value(view.result.unwrap()).unwrap();
    assert_ne!(fresh.id, original.id);
    assert!(fresh
        .segments
        .iter()
        .filter_map(|s| s.solution.as_ref())
        .all(|s| s.name != "umbrella"));
}

fn is_cta_video(request: &ai_ad_shorts::GenerationRequest) -> bool {
    request.model == "video"
        && request.options.get("segment_type").and_then(|v| v.as_str()) == Some("cta")
}

#[tokio::test(start_paused = true)]
async fn conflicts_are_recorded_when_a_later_clip_fails() {
    let mock = MockProvider::new("mock").with_rule(
        is_cta_video,
        MockBehavior::Fail {
            after_polls: 0,
            reason: "render queue full".into(),
        },
    );
    let h = harness(mock);
    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), true))
        .await
        .unwrap();
    let failed = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(failed.status, JobStatus::Failed);

    let partial = output_of(&failed);
    assert_eq!(partial.segments[2].status, SegmentStatus::Failed);
    assert_eq!(partial.conflicts.len(), 1);
    assert!(partial.conflicts[0].has_conflict);
    assert_eq!(partial.conflicts[0].item, "umbrella");
    assert!(partial.alternative.is_some());
}

#[tokio::test(start_paused = true)]
async fn provider_failure_is_reported_and_retry_creates_fresh_job() {
    let cta_videos = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&cta_videos);
    let mock = MockProvider::new("mock").with_rule(
        move |r| is_cta_video(r) && seen.fetch_add(1, Ordering::SeqCst) == 0,
        MockBehavior::Fail {
            after_polls: 1,
            reason: "render queue full".into(),
        },
    );
    let h = harness(mock);
    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), false))
        .await
        .unwrap();
    let failed = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.as_deref().unwrap_or("").contains("render queue full"));
    let partial = output_of(&failed);
    assert_eq!(partial.segments[2].status, SegmentStatus::Failed);
    assert_eq!(partial.segments[0].status, SegmentStatus::Completed);

    let retry_id = h.orchestrator.retry_segment(&job_id, 2).await.unwrap();
    assert_ne!(retry_id, job_id);
    let retried = wait_terminal(&h.orchestrator, &retry_id).await;
    assert_eq!(retried.status, JobStatus::Completed, "error: {:?}", retried.error);
    let output = output_of(&retried);
    assert_eq!(output.retry.as_ref().map(|r| r.index), Some(2));
    assert_eq!(output.segments[2].status, SegmentStatus::Completed);
    assert!(output.segments[2].video.is_some());
    assert_eq!(cta_videos.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.orchestrator.get_job_status(&job_id).await.unwrap(),
        failed
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_running_jobs() {
    let h = harness(MockProvider::new("mock").with_default(MockBehavior::Hang));
    let job_id = h
        .orchestrator
        .submit_job(storyboard_job(three_beats(), false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.orchestrator.shutdown();

    let view = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(
        view.error_kind,
        Some(ai_ad_shorts::ErrorKind::Abandoned)
    );
}
