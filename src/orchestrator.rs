//! Caller-facing orchestration API.
//!
//! Long-running work is submitted as a job and runs on a supervised tokio
//! task; callers poll [`Orchestrator::get_job_status`]. The supervisor owns
//! the terminal write, so a job whose task panics is still recorded as
//! failed.

use crate::conflict::{ConflictDetector, ConflictReport, Regenerator, StoryboardPlanner, VisionCheck};
use crate::continuity::{
    ChainObserver, ChainSettings, ContinuityAnchor, ContinuityChain, KeyframePair, RunMode,
    SegmentOutput, anchor_after,
};
use crate::error::{ErrorKind, GenerationError};
use crate::job_store::{GenerationJob, JobKind, JobStatus, JobStore};
use crate::prompt::{PromptComposer, TemplateComposer};
use crate::provider::{ProviderGateway, UsageSnapshot};
use crate::storyboard::{GenerationContext, Segment, SegmentStatus, Storyboard};
use crate::{logi, logok, logw};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Work that can be submitted as a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    Storyboard {
        storyboard: Storyboard,
        #[serde(default)]
        context: GenerationContext,
        #[serde(default)]
        mode: RunMode,
        #[serde(default = "default_true")]
        generate_video: bool,
        #[serde(default)]
        resolve_conflicts: bool,
    },
    Keyframes {
        segment: Segment,
        #[serde(default)]
        context: GenerationContext,
        #[serde(default)]
        anchor: Option<ContinuityAnchor>,
    },
    Regenerate {
        storyboard: Storyboard,
        item: String,
        #[serde(default)]
        hook_frames: Vec<String>,
    },
}

fn default_true() -> bool {
    true
}

impl JobSpec {
    fn kind(&self) -> JobKind {
        match self {
            JobSpec::Storyboard {
                mode: RunMode::Preview,
                ..
            } => JobKind::Preview,
            JobSpec::Storyboard { .. } => JobKind::Storyboard,
            JobSpec::Keyframes { .. } => JobKind::Keyframes,
            JobSpec::Regenerate { .. } => JobKind::Regenerate,
        }
    }
}

/// Identifies a segment re-run and which prompt variant it used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub source_job: String,
    pub index: usize,
    pub attempt: usize,
    pub prompt: String,
}

/// Result payload of storyboard, preview and segment-retry jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardOutput {
    pub storyboard: Storyboard,
    #[serde(default)]
    pub context: GenerationContext,
    #[serde(default)]
    pub generate_video: bool,
    pub segments: Vec<SegmentOutput>,
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
    /// Storyboard planned without the conflicting item, offered to the
    /// caller; the original storyboard is what was rendered.
    #[serde(default)]
    pub alternative: Option<Storyboard>,
    #[serde(default)]
    pub retry: Option<RetryInfo>,
}

/// Conflict reports for a storyboard and the alternative planned for the
/// first conflicting item, if any.
#[derive(Debug, Clone, Default)]
struct ConflictFindings {
    conflicts: Vec<ConflictReport>,
    alternative: Option<Storyboard>,
}

impl StoryboardOutput {
    fn apply(&mut self, findings: ConflictFindings) {
        self.conflicts = findings.conflicts;
        self.alternative = findings.alternative;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl From<GenerationJob> for JobStatusView {
    fn from(job: GenerationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result: job.result,
            error: job.error,
            error_kind: job.error_kind,
        }
    }
}

/// A job that did not complete, with whatever partial result it produced.
struct JobFailure {
    error: GenerationError,
    partial: Option<Value>,
}

impl From<GenerationError> for JobFailure {
    fn from(error: GenerationError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    gateway: Arc<ProviderGateway>,
    store: Arc<JobStore>,
    composer: Arc<dyn PromptComposer>,
    vision: Arc<dyn VisionCheck>,
    planner: Arc<dyn StoryboardPlanner>,
    settings: Arc<ChainSettings>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<ProviderGateway>,
        store: Arc<JobStore>,
        vision: Arc<dyn VisionCheck>,
        planner: Arc<dyn StoryboardPlanner>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            gateway,
            store,
            composer: Arc::new(TemplateComposer),
            vision,
            planner,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn PromptComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.gateway.usage().snapshot()
    }

    /// Stop waiting on every running job. Remote predictions keep running;
    /// the affected jobs are recorded as abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Record a pending job and start it in the background.
    pub async fn submit_job(&self, spec: JobSpec) -> Result<String, GenerationError> {
        if let JobSpec::Storyboard { storyboard, .. } | JobSpec::Regenerate { storyboard, .. } =
            &spec
        {
            storyboard.validate()?;
        }

        let job = GenerationJob::new(spec.kind());
        let job_id = job.id.clone();
        self.store.put(&job).await;
        logi(format!("Job {} queued ({:?})", job_id, job.kind));

        let this = self.clone();
        let cancel = self.shutdown.child_token();
        let id = job_id.clone();
        self.spawn_supervised(job_id.clone(), async move {
            this.mark_processing(&id).await;
            match spec {
                JobSpec::Storyboard {
                    storyboard,
                    context,
                    mode,
                    generate_video,
                    resolve_conflicts,
                } => {
                    this.run_storyboard(&id, storyboard, context, mode, generate_video, resolve_conflicts, &cancel)
                        .await
                }
                JobSpec::Keyframes {
                    segment,
                    context,
                    anchor,
                } => {
                    let pair = this
                        .keyframes_with(&segment, &context, anchor.as_ref(), &cancel)
                        .await?;
                    to_value(&pair)
                }
                JobSpec::Regenerate {
                    storyboard,
                    item,
                    hook_frames,
                } => {
                    let fresh = this
                        .regenerate_excluding(&storyboard, &item, &hook_frames)
                        .await?;
                    to_value(&fresh)
                }
            }
        });
        Ok(job_id)
    }

    /// Always answers with a definite state; never waits on the job.
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatusView, GenerationError> {
        self.store
            .get(job_id)
            .await?
            .map(JobStatusView::from)
            .ok_or_else(|| GenerationError::JobNotFound(job_id.to_string()))
    }

    /// Resolve one segment's first/last keyframes directly.
    pub async fn generate_segment_keyframes(
        &self,
        segment: &Segment,
        context: &GenerationContext,
        anchor: Option<&ContinuityAnchor>,
    ) -> Result<KeyframePair, GenerationError> {
        let cancel = self.shutdown.child_token();
        self.keyframes_with(segment, context, anchor, &cancel).await
    }

    pub async fn check_conflict(
        &self,
        body: &Segment,
        hook_frames: &[String],
    ) -> Result<ConflictReport, GenerationError> {
        ConflictDetector::new(self.vision.as_ref())
            .check(body, hook_frames)
            .await
    }

    pub async fn regenerate_excluding(
        &self,
        storyboard: &Storyboard,
        item: &str,
        hook_frames: &[String],
    ) -> Result<Storyboard, GenerationError> {
        Regenerator::new(self.planner.as_ref(), self.vision.as_ref())
            .regenerate_excluding(storyboard, item, hook_frames)
            .await
    }

    /// Re-run one segment of a finished storyboard job as a new job.
    ///
    /// Each retry moves to the next prompt variant (alternatives first,
    /// then back to the primary prompt). The first frame is anchored on the
    /// stored last frame of the previous segment. The source job's record
    /// is not modified.
    pub async fn retry_segment(&self, job_id: &str, index: usize) -> Result<String, GenerationError> {
        let source = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| GenerationError::JobNotFound(job_id.to_string()))?;
        if !source.status.is_terminal() {
            return Err(GenerationError::Internal(format!(
                "job {job_id} is still {:?}",
                source.status
            )));
        }
        let output: StoryboardOutput = source.result_as().ok_or_else(|| {
            GenerationError::Internal(format!("job {job_id} has no storyboard result"))
        })?;
        let Some(segment) = output.storyboard.segments.get(index) else {
            return Err(GenerationError::InvalidStoryboard(format!(
                "segment {index} out of range ({} segments)",
                output.storyboard.segments.len()
            )));
        };

        let attempt = match &output.retry {
            Some(previous) if previous.index == index => previous.attempt + 1,
            _ => 1,
        };
        let mut variants: Vec<&str> = segment.alternatives.iter().map(String::as_str).collect();
        variants.push(segment.prompt.as_str());
        let prompt = variants[(attempt - 1) % variants.len()].to_string();

        let anchor = index
            .checked_sub(1)
            .and_then(|prev| {
                let pair = output.segments.get(prev)?.keyframes.as_ref()?;
                Some(anchor_after(&output.storyboard.segments[prev], pair))
            });

        let mut retried = segment.clone();
        retried.prompt = prompt.clone();

        let job = GenerationJob::new(JobKind::SegmentRetry);
        let new_id = job.id.clone();
        self.store.put(&job).await;
        logi(format!(
            "Job {} retries segment {} of {} (attempt {})",
            new_id, index, job_id, attempt
        ));

        let retry = RetryInfo {
            source_job: job_id.to_string(),
            index,
            attempt,
            prompt,
        };
        let this = self.clone();
        let cancel = self.shutdown.child_token();
        let id = new_id.clone();
        self.spawn_supervised(new_id.clone(), async move {
            this.mark_processing(&id).await;
            let mut output = output;
            output.retry = Some(retry);
            while output.segments.len() <= index {
                let i = output.segments.len();
                output
                    .segments
                    .push(SegmentOutput::pending(i, output.storyboard.segments[i].kind));
            }
            output.segments[index] = SegmentOutput::pending(index, retried.kind);

            let outcome = this
                .rerun_segment(&retried, &output.context, anchor.as_ref(), output.generate_video, &cancel)
                .await;
            match outcome {
                Ok(segment_output) => {
                    output.segments[index] = SegmentOutput {
                        index,
                        ..segment_output
                    };
                    to_value(&output)
                }
                Err(error) => {
                    output.segments[index].status = SegmentStatus::Failed;
                    output.segments[index].error = Some(error.to_string());
                    Err(JobFailure {
                        error,
                        partial: to_value(&output).ok(),
                    })
                }
            }
        });
        Ok(new_id)
    }

    fn spawn_supervised<F>(&self, job_id: String, work: F)
    where
        F: Future<Output = Result<Value, JobFailure>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(work);
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join) => Err(JobFailure::from(GenerationError::Internal(format!(
                    "job task died: {join}"
                )))),
            };
            let written = match outcome {
                Ok(result) => {
                    logok(format!("Job {} completed", job_id));
                    store.update(&job_id, |job| job.mark_completed(result)).await
                }
                Err(failure) => {
                    logw(format!("Job {} failed: {}", job_id, failure.error));
                    store
                        .update(&job_id, |job| job.mark_failed(&failure.error, failure.partial))
                        .await
                }
            };
            if let Err(e) = written {
                tracing::error!(job_id = %job_id, error = %e, "terminal job state not recorded");
            }
        });
    }

    async fn mark_processing(&self, job_id: &str) {
        if let Err(e) = self.store.update(job_id, |job| job.mark_processing(None)).await {
            tracing::warn!(job_id, error = %e, "could not mark job processing");
        }
    }

    fn chain(&self) -> ContinuityChain<'_> {
        ContinuityChain::new(&self.gateway, self.composer.as_ref(), &self.settings)
    }

    async fn keyframes_with(
        &self,
        segment: &Segment,
        context: &GenerationContext,
        anchor: Option<&ContinuityAnchor>,
        cancel: &CancellationToken,
    ) -> Result<KeyframePair, GenerationError> {
        self.chain()
            .generate_keyframes(segment, anchor, context, cancel)
            .await
    }

    async fn rerun_segment(
        &self,
        segment: &Segment,
        context: &GenerationContext,
        anchor: Option<&ContinuityAnchor>,
        with_video: bool,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutput, GenerationError> {
        let chain = self.chain();
        let pair = chain
            .generate_keyframes(segment, anchor, context, cancel)
            .await?;
        let video = if with_video {
            Some(chain.generate_video(segment, &pair, context, cancel).await?)
        } else {
            None
        };
        Ok(SegmentOutput {
            index: 0,
            kind: segment.kind,
            status: SegmentStatus::Completed,
            source: Some(pair.source()),
            keyframes: Some(pair),
            video,
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_storyboard(
        &self,
        job_id: &str,
        storyboard: Storyboard,
        context: GenerationContext,
        mode: RunMode,
        generate_video: bool,
        resolve_conflicts: bool,
        cancel: &CancellationToken,
    ) -> Result<Value, JobFailure> {
        logi(format!(
            "Job {}: {} segments, mode {:?}, video {}",
            job_id,
            storyboard.segments.len(),
            mode,
            generate_video
        ));
        let mut output = StoryboardOutput {
            storyboard,
            context,
            generate_video: generate_video && mode == RunMode::Full,
            segments: Vec::new(),
            conflicts: Vec::new(),
            alternative: None,
            retry: None,
        };

        let checkpoint = JobCheckpoint {
            orchestrator: self,
            job_id: job_id.to_string(),
            template: output.clone(),
            resolve_conflicts,
            findings: Mutex::new(None),
        };
        let run = self
            .chain()
            .run(
                &output.storyboard,
                &output.context,
                mode,
                generate_video,
                &checkpoint,
                cancel,
            )
            .await;
        let failure = match run {
            Ok(segments) => {
                output.segments = segments;
                None
            }
            Err(failure) => {
                output.segments = failure.outputs;
                Some(failure.error)
            }
        };
        if let Some(findings) = checkpoint.take_findings() {
            output.apply(findings);
        }

        match failure {
            Some(error) => Err(JobFailure {
                error,
                partial: to_value(&output).ok(),
            }),
            None => to_value(&output),
        }
    }

    /// Conflict results are advisory inside a job: collaborator errors are
    /// logged and leave the rendered output as is.
    async fn find_conflicts(
        &self,
        job_id: &str,
        storyboard: &Storyboard,
        hook_frames: &[String],
    ) -> ConflictFindings {
        let mut findings = ConflictFindings::default();
        let detector = ConflictDetector::new(self.vision.as_ref());
        for (index, body) in storyboard.bodies() {
            if body.solution.is_none() {
                continue;
            }
            match detector.check(body, hook_frames).await {
                Ok(report) => findings.conflicts.push(report),
                Err(e) => {
                    tracing::warn!(job_id, segment = index, error = %e, "conflict check failed");
                }
            }
        }

        let Some(item) = findings
            .conflicts
            .iter()
            .find(|r| r.has_conflict)
            .map(|r| r.item.clone())
        else {
            return findings;
        };
        logw(format!(
            "Job {}: '{}' is not staged in the hook, planning an alternative",
            job_id, item
        ));
        match self
            .regenerate_excluding(storyboard, &item, hook_frames)
            .await
        {
            Ok(alternative) => findings.alternative = Some(alternative),
            Err(e) => tracing::warn!(job_id, item = %item, error = %e, "alternative storyboard failed"),
        }
        findings
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, JobFailure> {
    serde_json::to_value(value)
        .map_err(|e| JobFailure::from(GenerationError::Internal(format!("result encoding: {e}"))))
}

/// Persists partial storyboard output as the chain advances. When conflicts
/// are requested they are checked as soon as the hook's keyframes resolve,
/// so a job that fails later still reports them.
struct JobCheckpoint<'a> {
    orchestrator: &'a Orchestrator,
    job_id: String,
    template: StoryboardOutput,
    resolve_conflicts: bool,
    findings: Mutex<Option<ConflictFindings>>,
}

impl JobCheckpoint<'_> {
    fn findings(&self) -> MutexGuard<'_, Option<ConflictFindings>> {
        self.findings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_findings(&self) -> Option<ConflictFindings> {
        self.findings().take()
    }

    async fn check_hook(&self, outputs: &[SegmentOutput]) {
        let checked = self.findings().is_some();
        if !self.resolve_conflicts || checked {
            return;
        }
        let Some(hook) = outputs.first().and_then(|o| o.keyframes.as_ref()) else {
            return;
        };
        let found = self
            .orchestrator
            .find_conflicts(&self.job_id, &self.template.storyboard, &hook.uris())
            .await;
        *self.findings() = Some(found);
    }
}

#[async_trait]
impl<'a> ChainObserver for JobCheckpoint<'a> {
    async fn on_progress(&self, outputs: &[SegmentOutput]) {
        self.check_hook(outputs).await;
        let mut partial = self.template.clone();
        partial.segments = outputs.to_vec();
        let found = self.findings().clone();
        if let Some(findings) = found {
            partial.apply(findings);
        }
        let Ok(value) = serde_json::to_value(&partial) else {
            return;
        };
        let done = outputs
            .iter()
            .filter(|o| o.status == SegmentStatus::Completed)
            .count();
        tracing::debug!(job_id = %self.job_id, done, total = outputs.len(), "checkpoint");
        if let Err(e) = self
            .orchestrator
            .store
            .update(&self.job_id, |job| job.mark_processing(Some(value)))
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "checkpoint skipped");
        }
    }
}
