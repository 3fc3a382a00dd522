//! The pipeline controller.
//!
//! Drives one job through `PENDING -> RUNNING -> {COMPLETED | FAILED}`:
//! report RUNNING, fetch the input, run every stage in order (each stage
//! fanning out over the previous stage's artifacts), score and rank the final
//! artifacts, materialize and publish the top-K, report COMPLETED. Any
//! unrecoverable error reports FAILED and is returned unchanged.

use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use binderflow_exec::{collect_artifacts, OutputPattern, ProcessExecutor, StageRunner};
use binderflow_types::{Artifact, BinderflowError, Cancellation, Result, ScoredArtifact};
use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::config::{JobDescriptor, PipelineConfig};
use crate::events::{EventEmitter, PipelineEvent};
use crate::publish::{materialize, name_results, MetricsDocument, SelectedResult};
use crate::retry::{execute_with_retry, with_deadline};
use crate::scorer::{ConfidenceScorer, RemarkConfidenceScorer};
use crate::selector::select_top_k;
use crate::stage::{PlannedInvocation, StageDefinition, StageReport, StageState};
use crate::status::{StatusReporter, StatusStore};
use crate::transfer::{InputFetcher, ResultPublisher};

/// Everything a successful job produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub job_id: String,
    /// Top-K results in ranking order, as materialized.
    pub selected: Vec<SelectedResult>,
    /// Every final-stage artifact with its confidence, in discovery order.
    pub scored: Vec<ScoredArtifact>,
    pub metrics: MetricsDocument,
    pub stages: Vec<StageReport>,
    pub results_dir: PathBuf,
    /// Materialized files in `results_dir`.
    pub results: Vec<PathBuf>,
    /// Locations returned by the result publisher.
    pub published: Vec<String>,
}

pub struct PipelineController {
    config: PipelineConfig,
    fetcher: Arc<dyn InputFetcher>,
    store: Arc<dyn StatusStore>,
    publisher: Arc<dyn ResultPublisher>,
    runner: Arc<dyn StageRunner>,
    scorer: Arc<dyn ConfidenceScorer>,
    events: EventEmitter,
}

impl PipelineController {
    /// Validate `config` and build a controller that runs stages as real
    /// processes and scores `REMARK` confidence annotations.
    pub fn new(
        config: PipelineConfig,
        fetcher: Arc<dyn InputFetcher>,
        store: Arc<dyn StatusStore>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let scorer = RemarkConfidenceScorer::new(&config.confidence_keyword)?;
        Ok(Self {
            config,
            fetcher,
            store,
            publisher,
            runner: Arc::new(ProcessExecutor::new()),
            scorer: Arc::new(scorer),
            events: EventEmitter::default(),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn StageRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, job: &JobDescriptor) -> Result<PipelineResult> {
        self.run_with_cancellation(job, Cancellation::new()).await
    }

    /// Run `job`, aborting when `cancel` fires or the pipeline timeout elapses.
    pub async fn run_with_cancellation(
        &self,
        job: &JobDescriptor,
        cancel: Cancellation,
    ) -> Result<PipelineResult> {
        let reporter = StatusReporter::new(self.store.clone(), job.id.clone())
            .with_retry(self.config.collaborator_retries, self.config.backoff.clone())
            .with_timeout(self.config.collaborator_timeout);

        tracing::info!(
            job_id = %job.id,
            label = %job.label,
            input = %job.input_ref,
            stages = self.config.stages.len(),
            "Starting pipeline"
        );
        self.events.emit(PipelineEvent::JobStarted {
            job_id: job.id.clone(),
            stage_count: self.config.stages.len(),
        });

        let watchdog = self.config.pipeline_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel(format!("pipeline timed out after {:?}", timeout));
            })
        });

        let timer = Instant::now();
        let outcome = self.execute(job, &reporter, &cancel).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        match outcome {
            Ok(result) => {
                let duration_ms = timer.elapsed().as_millis() as u64;
                tracing::info!(
                    job_id = %job.id,
                    selected = result.selected.len(),
                    best_score = ?result.metrics.results_summary.best_score,
                    duration_ms,
                    "Pipeline completed"
                );
                self.events.emit(PipelineEvent::JobCompleted {
                    job_id: job.id.clone(),
                    selected: result.selected.len(),
                    duration_ms,
                });
                Ok(result)
            }
            Err(e) => {
                let message = e.failure_message();
                tracing::error!(job_id = %job.id, kind = e.kind(), error = %e, "Pipeline failed");
                if let Err(report_err) = reporter.failed(&message).await {
                    tracing::error!(
                        job_id = %job.id,
                        error = %report_err,
                        "Could not record FAILED status"
                    );
                }
                self.events.emit(PipelineEvent::JobFailed {
                    job_id: job.id.clone(),
                    error: message,
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        job: &JobDescriptor,
        reporter: &StatusReporter,
        cancel: &Cancellation,
    ) -> Result<PipelineResult> {
        let started_at = Utc::now();
        let retries = self.config.collaborator_retries;
        let backoff = &self.config.backoff;
        let deadline = self.config.collaborator_timeout;

        guarded(cancel, "status update", reporter.running()).await?;

        let input_dir = self.config.input_dir();
        let input_path = guarded(
            cancel,
            "input fetch",
            execute_with_retry(
                || {
                    with_deadline(self.fetcher.fetch(&job.input_ref, &input_dir), deadline, || {
                        BinderflowError::FetchFailed {
                            reference: job.input_ref.clone(),
                            message: format!("no response within {}ms", deadline.as_millis()),
                        }
                    })
                },
                retries,
                backoff,
                "input fetch",
            ),
        )
        .await?;

        let mut artifacts = vec![Artifact::new(input_path, "input", None)];
        let mut reports = Vec::with_capacity(self.config.stages.len());
        for (position, stage) in self.config.stages.iter().enumerate() {
            let (report, outcome) = self.run_stage(job, stage, &artifacts, cancel).await;
            reports.push(report);
            match outcome {
                Ok(produced) => artifacts = produced,
                Err(e) => {
                    reports.extend(
                        self.config.stages[position + 1..]
                            .iter()
                            .map(|s| StageReport::pending(&s.name)),
                    );
                    self.events.emit(PipelineEvent::StageFailed {
                        job_id: job.id.clone(),
                        stage: stage.name.clone(),
                        error: e.to_string(),
                        stages: reports,
                    });
                    return Err(e);
                }
            }
        }

        let scored = self.score_all(&job.id, &artifacts).await;
        let selected = select_top_k(&scored, self.config.top_k, self.config.include_unscored);
        if selected.is_empty() {
            tracing::warn!(
                job_id = %job.id,
                artifacts = scored.len(),
                "No scored artifacts eligible for selection"
            );
        }
        let named = name_results(&selected, &self.config.result_prefix);
        let metrics = MetricsDocument::build(
            job,
            started_at,
            Utc::now(),
            &self.config.pipeline_version,
            &reports,
            &named,
            &scored,
            self.config.stage_parameters(),
        );

        cancel.check("result materialization")?;
        let results_dir = self.config.results_dir();
        let results = materialize(&results_dir, &named, &metrics, &self.config.metrics_file).await?;
        self.events.emit(PipelineEvent::ResultsMaterialized {
            job_id: job.id.clone(),
            results_dir: results_dir.display().to_string(),
            selected: named.len(),
        });

        let published = guarded(
            cancel,
            "result publish",
            execute_with_retry(
                || {
                    with_deadline(self.publisher.publish(&job.id, &results_dir), deadline, || {
                        BinderflowError::PublishFailed {
                            path: results_dir.clone(),
                            message: format!("no response within {}ms", deadline.as_millis()),
                        }
                    })
                },
                retries,
                backoff,
                "result publish",
            ),
        )
        .await?;

        // Unguarded: the store may apply COMPLETED before acknowledging it.
        cancel.check("status update")?;
        reporter.completed().await?;

        Ok(PipelineResult {
            job_id: job.id.clone(),
            selected: named,
            scored,
            metrics,
            stages: reports,
            results_dir,
            results,
            published,
        })
    }

    /// Run one stage and report how it went, whether or not it succeeded.
    async fn run_stage(
        &self,
        job: &JobDescriptor,
        stage: &StageDefinition,
        inputs: &[Artifact],
        cancel: &Cancellation,
    ) -> (StageReport, Result<Vec<Artifact>>) {
        let timer = Instant::now();
        let mut report = StageReport::pending(&stage.name);
        let outcome = self.fan_out(job, stage, inputs, cancel, &mut report).await;
        report.duration_ms = timer.elapsed().as_millis() as u64;

        match &outcome {
            Ok(produced) => {
                report.state = StageState::Completed;
                report.artifacts = produced.len();
                tracing::info!(
                    job_id = %job.id,
                    stage = %stage.name,
                    artifacts = report.artifacts,
                    duration_ms = report.duration_ms,
                    "Stage completed"
                );
                self.events.emit(PipelineEvent::StageCompleted {
                    job_id: job.id.clone(),
                    stage: stage.name.clone(),
                    artifacts: report.artifacts,
                    duration_ms: report.duration_ms,
                });
            }
            Err(e) => {
                report.state = StageState::Failed;
                tracing::error!(
                    job_id = %job.id,
                    stage = %stage.name,
                    artifacts = report.artifacts,
                    duration_ms = report.duration_ms,
                    error = %e,
                    "Stage failed"
                );
            }
        }
        (report, outcome)
    }

    /// Run every invocation of `stage` over `inputs` and collect what they produced.
    ///
    /// Invocations run up to `max_concurrency` at a time. The first failure
    /// cancels every sibling still running or waiting, which terminates their
    /// processes. Results are aggregated in input order, so the lowest-indexed
    /// genuine failure is the one reported.
    async fn fan_out(
        &self,
        job: &JobDescriptor,
        stage: &StageDefinition,
        inputs: &[Artifact],
        cancel: &Cancellation,
        report: &mut StageReport,
    ) -> Result<Vec<Artifact>> {
        let plan = stage.plan(inputs, &self.config.work_root)?;
        let pattern = stage.pattern()?;
        report.invocations = plan.invocations.len();
        report.skipped = plan.skipped;

        tracing::info!(
            job_id = %job.id,
            stage = %stage.name,
            inputs = inputs.len(),
            invocations = plan.invocations.len(),
            skipped = plan.skipped,
            "Stage starting"
        );
        self.events.emit(PipelineEvent::StageStarted {
            job_id: job.id.clone(),
            stage: stage.name.clone(),
            invocations: plan.invocations.len(),
            skipped: plan.skipped,
        });

        // Fired by the job-level handle or by the first failing invocation.
        let stage_cancel = Cancellation::new();
        let forward = async {
            let reason = cancel.cancelled().await;
            stage_cancel.cancel(reason);
            std::future::pending::<Infallible>().await
        };

        let pattern = &pattern;
        let stage_cancel_ref = &stage_cancel;
        let invocations = stream::iter(plan.invocations.iter().map(|planned| async move {
            let result = self
                .run_invocation(job, stage, pattern, planned, stage_cancel_ref)
                .await;
            if let Err(e) = &result {
                if !e.is_cancellation() {
                    stage_cancel_ref.cancel(format!("{} failed", planned.invocation.description));
                }
            }
            result
        }))
        .buffered(self.config.max_concurrency)
        .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            outcomes = invocations => outcomes,
            never = forward => match never {},
        };

        let mut produced = Vec::new();
        let mut failure = None;
        let mut first_cancelled = None;
        for outcome in outcomes {
            match outcome {
                Ok(artifacts) => produced.extend(artifacts),
                Err(e) if e.is_cancellation() => {
                    first_cancelled.get_or_insert(e);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure.or(first_cancelled) {
            Some(e) => {
                report.artifacts = produced.len();
                Err(e)
            }
            None => Ok(produced),
        }
    }

    async fn run_invocation(
        &self,
        job: &JobDescriptor,
        stage: &StageDefinition,
        pattern: &OutputPattern,
        planned: &PlannedInvocation,
        cancel: &Cancellation,
    ) -> Result<Vec<Artifact>> {
        let invocation = &planned.invocation;
        cancel.check(&invocation.description)?;
        reset_dir(&planned.output_dir).await?;

        let output = self.runner.run(invocation, cancel).await?;
        let artifacts =
            collect_artifacts(&planned.output_dir, pattern, &stage.name, planned.source_index)
                .await?;

        if artifacts.len() != stage.multiplicity {
            tracing::debug!(
                stage = %stage.name,
                index = planned.index,
                expected = stage.multiplicity,
                found = artifacts.len(),
                "Artifact count differs from configured multiplicity"
            );
        }
        self.events.emit(PipelineEvent::InvocationCompleted {
            job_id: job.id.clone(),
            stage: stage.name.clone(),
            index: planned.index,
            artifacts: artifacts.len(),
            duration_ms: output.duration_ms,
        });
        Ok(artifacts)
    }

    async fn score_all(&self, job_id: &str, artifacts: &[Artifact]) -> Vec<ScoredArtifact> {
        let mut scored = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let confidence = self.scorer.score(artifact).await;
            tracing::info!(
                job_id = %job_id,
                file = %artifact.file_name(),
                confidence = %confidence,
                "Scored artifact"
            );
            scored.push(ScoredArtifact {
                artifact: artifact.clone(),
                confidence,
            });
        }
        scored
    }
}

/// Await `fut` unless `cancel` fires first.
async fn guarded<T>(
    cancel: &Cancellation,
    description: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    cancel.check(description)?;
    tokio::select! {
        result = fut => result,
        reason = cancel.cancelled() => Err(BinderflowError::Cancelled {
            description: description.to_string(),
            reason,
        }),
    }
}

/// Give an invocation an empty directory, discarding leftovers of earlier runs.
async fn reset_dir(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use crate::stage::FanOut;
    use crate::status::MemoryStatusStore;
    use crate::transfer::{DirectoryPublisher, LocalFetcher};
    use async_trait::async_trait;
    use binderflow_exec::{ExecOutput, Invocation};
    use binderflow_types::{Confidence, Job, JobStatus, StatusUpdate};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes the files each fake tool would produce, keyed by program name.
    ///
    /// Every test stage passes `${output_dir} ${multiplicity} ${index}` as arguments.
    struct FakeRunner {
        scores: Vec<Option<f64>>,
        fail_on: Option<String>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl FakeRunner {
        fn new(scores: Vec<Option<f64>>) -> Self {
            Self {
                scores,
                fail_on: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, description: &str) -> Self {
            self.fail_on = Some(description.to_string());
            self
        }

        fn calls_for(&self, program: &str) -> Vec<Invocation> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|inv| inv.program == program)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl StageRunner for FakeRunner {
        async fn run(&self, invocation: &Invocation, cancel: &Cancellation) -> Result<ExecOutput> {
            cancel.check(&invocation.description)?;
            self.calls.lock().unwrap().push(invocation.clone());

            if self.fail_on.as_deref() == Some(invocation.description.as_str()) {
                return Err(BinderflowError::ProcessFailed {
                    description: invocation.description.clone(),
                    exit_code: 1,
                    stderr: "RuntimeError: CUDA out of memory".into(),
                    stdout: String::new(),
                });
            }

            let out = PathBuf::from(&invocation.args[0]);
            let multiplicity: usize = invocation.args[1].parse().unwrap();
            let index: usize = invocation.args[2].parse().unwrap();
            match invocation.program.as_str() {
                "design" => {
                    for i in 0..multiplicity {
                        std::fs::write(out.join(format!("binder_{i}.pdb")), "ATOM").unwrap();
                    }
                }
                "sequence" => {
                    std::fs::create_dir_all(out.join("seqs")).unwrap();
                    for i in 0..multiplicity {
                        let path = out.join(format!("seqs/design_{i}.fa"));
                        std::fs::write(path, ">seq\nMKV").unwrap();
                    }
                }
                "fold" => {
                    let text = match self.scores.get(index - 1).copied().flatten() {
                        Some(score) => format!("REMARK   1 CONFIDENCE {score}\nEND\n"),
                        None => "END\n".to_string(),
                    };
                    std::fs::write(out.join("model.pdb"), text).unwrap();
                }
                other => panic!("unknown fake program {other}"),
            }
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
            })
        }
    }

    fn stages(designs: usize, seqs: usize, max_structures: usize) -> Vec<StageDefinition> {
        let args = ["${output_dir}", "${multiplicity}", "${index}"];
        vec![
            StageDefinition::new(
                "rfdiffusion",
                "backbone generation",
                "design",
                "rfdiffusion_output",
                "binder_*.pdb",
            )
            .args(args)
            .fan_out(FanOut::Gather)
            .invocation_prefix("design")
            .multiplicity(designs),
            StageDefinition::new(
                "proteinmpnn",
                "sequence design",
                "sequence",
                "proteinmpnn_output",
                "**/seqs/*.fa",
            )
            .args(args)
            .invocation_prefix("scaffold")
            .input_label("scaffold")
            .multiplicity(seqs),
            StageDefinition::new(
                "colabfold",
                "structure prediction",
                "fold",
                "colabfold_output",
                "*.pdb",
            )
            .args(args)
            .invocation_prefix("prediction")
            .input_label("sequence")
            .fan_out(FanOut::PerInput {
                max_inputs: Some(max_structures),
            }),
        ]
    }

    struct Harness {
        dir: TempDir,
        store: Arc<MemoryStatusStore>,
        runner: Arc<FakeRunner>,
        controller: PipelineController,
        job: JobDescriptor,
    }

    fn harness(stages: Vec<StageDefinition>, runner: FakeRunner) -> Harness {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("6XYZ.pdb");
        std::fs::write(&input, "ATOM      1  N   MET A   1\n").unwrap();

        let mut config = PipelineConfig::new(dir.path().join("work"), stages);
        config.backoff = BackoffPolicy::None;

        let store = Arc::new(MemoryStatusStore::new());
        let runner = Arc::new(runner);
        let controller = PipelineController::new(
            config,
            Arc::new(LocalFetcher::new()),
            store.clone(),
            Arc::new(DirectoryPublisher::new(dir.path().join("published"))),
        )
        .unwrap()
        .with_runner(runner.clone());
        let job = JobDescriptor::new("job-1", input.display().to_string(), "6XYZ");

        Harness {
            dir,
            store,
            runner,
            controller,
            job,
        }
    }

    #[tokio::test]
    async fn status_goes_running_then_completed() {
        let h = harness(stages(1, 1, 3), FakeRunner::new(vec![Some(0.5)]));
        h.controller.run(&h.job).await.unwrap();
        assert_eq!(
            h.store.transitions("job-1"),
            vec![JobStatus::Running, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn scenario_a_designs_fan_out_to_multiplicity() {
        let h = harness(stages(3, 1, 3), FakeRunner::new(vec![Some(0.5); 3]));
        let result = h.controller.run(&h.job).await.unwrap();

        assert_eq!(h.runner.calls_for("design").len(), 1);
        assert_eq!(result.stages[0].artifacts, 3);
        assert_eq!(h.runner.calls_for("sequence").len(), 3);
    }

    #[tokio::test]
    async fn scenario_b_sequences_per_scaffold() {
        let h = harness(stages(3, 5, 3), FakeRunner::new(vec![Some(0.5); 3]));
        let result = h.controller.run(&h.job).await.unwrap();

        assert_eq!(result.stages[1].invocations, 3);
        assert_eq!(result.stages[1].artifacts, 15);
        let calls = h.runner.calls_for("sequence");
        assert_eq!(calls[1].description, "sequence design for scaffold 2");
        assert!(calls[1].args[0].ends_with("proteinmpnn_output/scaffold_2"));
    }

    #[tokio::test]
    async fn scenario_c_structure_prediction_is_capped() {
        let h = harness(stages(3, 5, 3), FakeRunner::new(vec![Some(0.5); 3]));
        let result = h.controller.run(&h.job).await.unwrap();

        assert_eq!(h.runner.calls_for("fold").len(), 3);
        assert_eq!(result.stages[2].invocations, 3);
        assert_eq!(result.stages[2].skipped, 12);
        assert_eq!(result.scored.len(), 3);
    }

    #[tokio::test]
    async fn scenario_d_ranking_ties_and_unscored() {
        let h = harness(
            stages(4, 1, 4),
            FakeRunner::new(vec![Some(0.91), Some(0.40), Some(0.91), None]),
        );
        let result = h.controller.run(&h.job).await.unwrap();

        let sources: Vec<Option<usize>> = result
            .selected
            .iter()
            .map(|s| {
                result
                    .scored
                    .iter()
                    .find(|a| a.artifact.path == s.source)
                    .and_then(|a| a.artifact.source_index)
            })
            .collect();
        assert_eq!(sources, vec![Some(0), Some(2), Some(1)]);
        let scores: Vec<Confidence> = result.selected.iter().map(|s| s.score).collect();
        assert_eq!(
            scores,
            vec![Confidence::Scored(0.91), Confidence::Scored(0.91), Confidence::Scored(0.40)]
        );
        assert_eq!(result.metrics.results_summary.unscored_count, 1);
        assert!(result.results_dir.join("result_1.pdb").exists());
        assert!(!result.results_dir.join("result_4.pdb").exists());
    }

    #[tokio::test]
    async fn scenario_e_failure_in_second_scaffold() {
        let runner =
            FakeRunner::new(vec![Some(0.5); 3]).failing_on("sequence design for scaffold 2");
        let h = harness(stages(3, 5, 3), runner);

        let err = h.controller.run(&h.job).await.unwrap_err();
        assert!(matches!(err, BinderflowError::ProcessFailed { .. }));
        assert!(err.to_string().contains("scaffold 2"));

        assert_eq!(h.runner.calls_for("sequence").len(), 2);
        assert!(h.runner.calls_for("fold").is_empty());

        let job = h.store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.starts_with("Pipeline failed: [ProcessFailed]"));
        assert!(message.contains("scaffold 2"));
        assert!(message.contains("CUDA out of memory"));
        assert!(!h.controller.config().results_dir().exists());
    }

    #[tokio::test]
    async fn failed_stage_event_reports_every_stage_state() {
        let runner =
            FakeRunner::new(vec![Some(0.5); 3]).failing_on("sequence design for scaffold 2");
        let h = harness(stages(3, 5, 3), runner);
        let mut rx = h.controller.events().subscribe();
        h.controller.run(&h.job).await.unwrap_err();

        let mut failed = None;
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::StageFailed { stage, stages, .. } = event {
                failed = Some((stage, stages));
            }
        }
        let (stage, reports) = failed.expect("no stage_failed event");
        assert_eq!(stage, "proteinmpnn");

        let states: Vec<(&str, StageState)> =
            reports.iter().map(|r| (r.stage.as_str(), r.state)).collect();
        assert_eq!(
            states,
            vec![
                ("rfdiffusion", StageState::Completed),
                ("proteinmpnn", StageState::Failed),
                ("colabfold", StageState::Pending),
            ]
        );
        assert_eq!(reports[1].invocations, 3);
        assert_eq!(reports[1].artifacts, 5);
        assert_eq!(reports[2], StageReport::pending("colabfold"));
    }

    #[tokio::test]
    async fn zero_artifacts_fails_the_stage() {
        let mut defs = stages(3, 5, 3);
        defs[0].output_pattern = "*.cif".into();
        let h = harness(defs, FakeRunner::new(vec![]));

        let err = h.controller.run(&h.job).await.unwrap_err();
        assert_eq!(err.kind(), "NoArtifactsProduced");
        assert!(h.runner.calls_for("sequence").is_empty());
        assert_eq!(
            h.store.transitions("job-1"),
            vec![JobStatus::Running, JobStatus::Failed]
        );
    }

    #[tokio::test]
    async fn metrics_document_is_written() {
        let h = harness(stages(2, 1, 3), FakeRunner::new(vec![Some(0.8), Some(0.6)]));
        let result = h.controller.run(&h.job).await.unwrap();

        let path = result.results_dir.join("confidence_metrics.json");
        let raw = std::fs::read_to_string(path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["job_id"], "job-1");
        assert_eq!(doc["label"], "6XYZ");
        assert_eq!(doc["results_summary"]["count"], 2);
        assert_eq!(doc["results_summary"]["best_score"], 0.8);
        assert_eq!(doc["per_stage_status"][2]["state"], "completed");
        assert_eq!(doc["selected_results"][0]["file"], "result_1.pdb");
        assert_eq!(doc["all_scores"].as_array().unwrap().len(), 2);
        assert!(doc["stage_parameters"]["colabfold"].is_object());
    }

    #[tokio::test]
    async fn results_are_published() {
        let h = harness(stages(1, 1, 3), FakeRunner::new(vec![Some(0.3)]));
        let result = h.controller.run(&h.job).await.unwrap();

        assert_eq!(result.published.len(), 2);
        let published = h.dir.path().join("published/results/job-1");
        assert!(published.join("result_1.pdb").exists());
        assert!(published.join("confidence_metrics.json").exists());
    }

    #[tokio::test]
    async fn fetch_failure_reports_failed() {
        let mut h = harness(stages(1, 1, 3), FakeRunner::new(vec![]));
        h.job.input_ref = "/nonexistent/target.pdb".into();

        let err = h.controller.run(&h.job).await.unwrap_err();
        assert!(matches!(err, BinderflowError::FetchFailed { .. }));
        assert!(h.runner.calls_for("design").is_empty());
        assert_eq!(
            h.store.get("job-1").await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn running_report_failure_stops_before_any_stage() {
        let h = harness(stages(1, 1, 3), FakeRunner::new(vec![]));
        h.store.fail_on(JobStatus::Running, usize::MAX);

        let err = h.controller.run(&h.job).await.unwrap_err();
        assert!(matches!(err, BinderflowError::StatusUpdateFailed { .. }));
        assert!(h.runner.calls_for("design").is_empty());
        assert_eq!(h.store.transitions("job-1"), vec![JobStatus::Failed]);
    }

    #[tokio::test]
    async fn failed_report_failure_keeps_original_error() {
        let runner = FakeRunner::new(vec![]).failing_on("backbone generation");
        let h = harness(stages(1, 1, 3), runner);
        h.store.fail_on(JobStatus::Failed, usize::MAX);

        let err = h.controller.run(&h.job).await.unwrap_err();
        assert!(matches!(err, BinderflowError::ProcessFailed { .. }));
        assert_eq!(h.store.transitions("job-1"), vec![JobStatus::Running]);
    }

    #[tokio::test]
    async fn pre_cancelled_job_runs_nothing() {
        let h = harness(stages(1, 1, 3), FakeRunner::new(vec![]));
        let cancel = Cancellation::new();
        cancel.cancel("operator request");

        let err = h.controller.run_with_cancellation(&h.job, cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(h.runner.calls_for("design").is_empty());
        let job = h.store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("[Cancelled]"));
    }

    /// Holds scaffold 1 open until the stage is cancelled.
    struct BlockingFirstScaffold {
        inner: FakeRunner,
    }

    #[async_trait]
    impl StageRunner for BlockingFirstScaffold {
        async fn run(&self, invocation: &Invocation, cancel: &Cancellation) -> Result<ExecOutput> {
            if invocation.description == "sequence design for scaffold 1" {
                let reason = cancel.cancelled().await;
                return Err(BinderflowError::Cancelled {
                    description: invocation.description.clone(),
                    reason,
                });
            }
            self.inner.run(invocation, cancel).await
        }
    }

    #[tokio::test]
    async fn failing_invocation_cancels_running_siblings() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("6XYZ.pdb");
        std::fs::write(&input, "ATOM\n").unwrap();

        let mut config = PipelineConfig::new(dir.path().join("work"), stages(3, 5, 3));
        config.backoff = BackoffPolicy::None;
        config.max_concurrency = 2;

        let runner = BlockingFirstScaffold {
            inner: FakeRunner::new(vec![Some(0.5); 3]).failing_on("sequence design for scaffold 2"),
        };
        let store = Arc::new(MemoryStatusStore::new());
        let controller = PipelineController::new(
            config,
            Arc::new(LocalFetcher::new()),
            store.clone(),
            Arc::new(DirectoryPublisher::new(dir.path().join("published"))),
        )
        .unwrap()
        .with_runner(Arc::new(runner));
        let job = JobDescriptor::new("job-1", input.display().to_string(), "6XYZ");

        let err = tokio::time::timeout(std::time::Duration::from_secs(10), controller.run(&job))
            .await
            .expect("sibling was not cancelled")
            .unwrap_err();

        assert!(matches!(err, BinderflowError::ProcessFailed { .. }), "got: {err:?}");
        assert!(err.to_string().contains("scaffold 2"));
        let job = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    /// Applies COMPLETED, fires the cancellation, then stalls before acknowledging.
    struct SlowAckStore {
        inner: MemoryStatusStore,
        cancel: Cancellation,
    }

    #[async_trait]
    impl StatusStore for SlowAckStore {
        async fn upsert(&self, update: &StatusUpdate) -> Result<bool> {
            let changed = self.inner.upsert(update).await?;
            if update.status == JobStatus::Completed {
                self.cancel.cancel("operator request");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Ok(changed)
        }

        async fn get(&self, job_id: &str) -> Result<Option<Job>> {
            self.inner.get(job_id).await
        }
    }

    #[tokio::test]
    async fn late_cancel_does_not_fail_a_completed_job() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("6XYZ.pdb");
        std::fs::write(&input, "ATOM\n").unwrap();

        let mut config = PipelineConfig::new(dir.path().join("work"), stages(1, 1, 3));
        config.backoff = BackoffPolicy::None;

        let cancel = Cancellation::new();
        let store = Arc::new(SlowAckStore {
            inner: MemoryStatusStore::new(),
            cancel: cancel.clone(),
        });
        let controller = PipelineController::new(
            config,
            Arc::new(LocalFetcher::new()),
            store.clone(),
            Arc::new(DirectoryPublisher::new(dir.path().join("published"))),
        )
        .unwrap()
        .with_runner(Arc::new(FakeRunner::new(vec![Some(0.5)])));
        let job = JobDescriptor::new("job-1", input.display().to_string(), "6XYZ");

        let result = controller.run_with_cancellation(&job, cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(result.is_ok(), "got: {:?}", result.err());
        assert_eq!(
            store.inner.transitions("job-1"),
            vec![JobStatus::Running, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn stale_invocation_output_is_discarded() {
        let h = harness(stages(1, 1, 3), FakeRunner::new(vec![Some(0.5)]));
        let stale = h.controller.config().work_root.join("rfdiffusion_output/design_1");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("binder_7.pdb"), "old").unwrap();

        let result = h.controller.run(&h.job).await.unwrap();
        assert_eq!(result.stages[0].artifacts, 1);
        assert!(!stale.join("binder_7.pdb").exists());
    }

    #[tokio::test]
    async fn events_follow_job_lifecycle() {
        let h = harness(stages(1, 1, 3), FakeRunner::new(vec![Some(0.5)]));
        let mut rx = h.controller.events().subscribe();
        h.controller.run(&h.job).await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let value = serde_json::to_value(&event).unwrap();
            names.push(value["event"].as_str().unwrap().to_string());
        }
        assert_eq!(names.first().map(String::as_str), Some("job_started"));
        assert_eq!(names.last().map(String::as_str), Some("job_completed"));
        assert!(names.contains(&"results_materialized".to_string()));
        assert_eq!(names.iter().filter(|n| *n == "stage_completed").count(), 3);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path(), Vec::new());
        let result = PipelineController::new(
            config,
            Arc::new(LocalFetcher::new()),
            Arc::new(MemoryStatusStore::new()),
            Arc::new(DirectoryPublisher::new(dir.path())),
        );
        assert!(matches!(result, Err(BinderflowError::Config(_))));
    }
}
