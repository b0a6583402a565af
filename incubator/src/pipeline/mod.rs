//! Stage orchestration: `INIT → STAGE1 → STAGE2 → STAGE3 → COMPLETE`.
//!
//! The orchestrator owns the checkpoint. Each stage first checks whether the
//! checkpoint's claim about it is backed by the files on disk; a trusted stage
//! is restored from those files, anything else is (re)run. Participant
//! failures are collected into a cumulative ledger; a stage in which every
//! participant fails halts the pipeline with [`StageFailedError`].

pub mod stage1;
pub mod stage2;
pub mod stage3;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::call::{CallSpec, RetryPolicy, call_structured};
use crate::core::normalize::NormalizeOptions;
use crate::core::schema::SchemaKind;
use crate::core::types::{FailureRecord, ParticipantId, Stage, StageOutputRecord};
use crate::core::validate::SchemaRegistry;
use crate::io::checkpoint::{Backing, CheckpointStore, Verification};
use crate::io::config::{PipelineConfig, write_config};
use crate::io::events::{EventSink, EventType, FanoutSink, JsonlEventSink, PipelineEvent};
use crate::io::jsonl::{read_jsonl, write_jsonl_durable};
use crate::io::prompt::{PromptEngine, TaskKind};
use crate::io::provider::Provider;
use crate::io::run_paths::RunPaths;
use crate::limiter::{CallLimiter, LimitedProvider};
use crate::report::{PortfolioEntry, write_report};
use crate::stage_exec::StageExecutor;

pub use stage2::FinalPlan;
pub use stage3::FounderOutcome;

const MAX_RUN_DIR_SUFFIX: u32 = 100;

/// Where a pipeline invocation writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    /// Create a new `run_<timestamp>` directory under `out_dir`.
    Fresh { out_dir: PathBuf },
    /// Continue an existing run directory from its checkpoint.
    Resume(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Stage1,
    Stage2,
    Stage3,
    Complete,
    Failed,
}

impl PipelineState {
    fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Stage1 => PipelineState::Stage1,
            Stage::Stage2 => PipelineState::Stage2,
            Stage::Stage3 => PipelineState::Stage3,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Init => "init",
            PipelineState::Stage1 => "stage1",
            PipelineState::Stage2 => "stage2",
            PipelineState::Stage3 => "stage3",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A stage could not produce any result, so later stages cannot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailedError {
    pub stage: Stage,
    pub reason: String,
    /// Participant failures of the failed stage.
    pub failures: Vec<FailureRecord>,
}

impl fmt::Display for StageFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.reason)
    }
}

impl std::error::Error for StageFailedError {}

/// Results of one stage: restored and newly produced results merged.
#[derive(Debug, Clone)]
pub struct StageResult<T> {
    pub results: BTreeMap<ParticipantId, T>,
    pub failures: Vec<FailureRecord>,
    /// The stage was restored from a verified checkpoint without running.
    pub restored: bool,
}

/// Summary of a completed pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_dir: PathBuf,
    pub selections: BTreeMap<ParticipantId, Value>,
    pub plans: BTreeMap<ParticipantId, FinalPlan>,
    pub results: BTreeMap<ParticipantId, FounderOutcome>,
    /// Cumulative failure ledger across all stages.
    pub failures: Vec<FailureRecord>,
    pub portfolio: Vec<PortfolioEntry>,
}

/// Shared, read-only inputs of every stage.
pub struct PipelineContext<'a> {
    pub config: &'a PipelineConfig,
    pub providers: &'a [Arc<dyn Provider>],
    pub paths: &'a RunPaths,
    pub store: &'a CheckpointStore,
    pub schemas: &'a SchemaRegistry,
    pub prompts: &'a PromptEngine,
    pub events: &'a dyn EventSink,
    /// Bounds model calls in flight across nested stage pools.
    pub limiter: &'a CallLimiter,
}

/// One structured model request made by a stage.
#[derive(Debug, Clone, Copy)]
pub struct Request<'r> {
    pub stage: Stage,
    pub participant: &'r str,
    pub label: &'r str,
    pub task: TaskKind,
    pub schema: SchemaKind,
}

impl<'a> PipelineContext<'a> {
    pub fn founders(&self) -> Vec<ParticipantId> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn provider(&self, name: &str) -> Result<&'a dyn Provider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
            .ok_or_else(|| anyhow!("no provider named {name}"))
    }

    /// Every provider except `name`, in configuration order.
    pub fn others(&self, name: &str) -> Vec<&'a dyn Provider> {
        self.providers
            .iter()
            .filter(|p| p.name() != name)
            .map(|p| p.as_ref())
            .collect()
    }

    pub fn executor(&self, stage: Stage) -> StageExecutor<'a> {
        StageExecutor {
            stage,
            parallelism: self.config.concurrency,
            reason_limit: self.config.failure_reason_limit,
            events: self.events,
        }
    }

    /// Render the prompt for `request` and run a validated structured call.
    pub fn call<S: Serialize>(&self, provider: &dyn Provider, request: Request<'_>, prompt_ctx: S) -> Result<Value> {
        let prompt = self.prompts.render(request.task, prompt_ctx)?;
        let spec = CallSpec {
            stage: request.stage,
            participant: request.participant,
            label: request.label,
            prompt: &prompt,
            system: self.prompts.system(),
            schema: self.schemas.get(request.schema),
        };
        let limited = LimitedProvider {
            inner: provider,
            limiter: self.limiter,
        };
        call_structured(&limited, &spec, RetryPolicy::new(self.config.retry_max))
    }

    pub fn step_complete(&self, stage: Stage, participant: &str, message: String, data: Value) {
        self.events.emit(
            &PipelineEvent::new(EventType::StepComplete, message)
                .with_stage(stage)
                .with_participant(participant)
                .with_data(data),
        );
    }

    /// Check the checkpoint's claim about `stage` against its backing files.
    ///
    /// A claim that fails verification is withdrawn (together with every
    /// later stage) so the stage reruns. Stage-2 founders still recorded in
    /// the backing file stay done and are not run again.
    pub fn trusted(&self, stage: Stage, backing: &[Backing<'_>]) -> Result<bool> {
        let checkpoint = self.store.load()?;
        match self.store.verify(&checkpoint, stage, backing) {
            Verification::Trusted => Ok(true),
            Verification::NotClaimed => Ok(false),
            Verification::Mismatch(discrepancy) => {
                self.store.withdraw(stage, &discrepancy)?;
                info!(stage = %stage, discrepancy = %discrepancy, "withdrew unverified checkpoint claim");
                Ok(false)
            }
        }
    }

    fn stage_failed(&self, stage: Stage, reason: String, failures: Vec<FailureRecord>) -> anyhow::Error {
        StageFailedError {
            stage,
            reason,
            failures,
        }
        .into()
    }
}

/// Run (or resume) the whole pipeline.
///
/// Events go to `events.jsonl` in the run directory and to `events`.
#[instrument(skip_all)]
pub fn run_pipeline(
    config: &PipelineConfig,
    providers: &[Arc<dyn Provider>],
    target: RunTarget,
    events: Arc<dyn EventSink>,
) -> Result<PipelineOutcome> {
    config.validate()?;
    if providers.len() < 2 {
        bail!("at least 2 providers are required, got {}", providers.len());
    }
    let resumed = matches!(target, RunTarget::Resume(_));
    let run_dir = match target {
        RunTarget::Fresh { out_dir } => create_run_dir(&out_dir)?,
        RunTarget::Resume(dir) => {
            if !dir.is_dir() {
                bail!("run directory {} does not exist", dir.display());
            }
            dir
        }
    };
    let paths = RunPaths::new(&run_dir);
    if !paths.config_snapshot_path.exists() {
        write_config(&paths.config_snapshot_path, config)?;
    }

    let log = JsonlEventSink::open(&paths.events_path)?;
    let sink = FanoutSink::new(vec![Arc::new(log) as Arc<dyn EventSink>, events]);
    let store = CheckpointStore::new(&paths);
    store.initialize()?;
    let schemas = SchemaRegistry::builtin(NormalizeOptions {
        strip_unknown: config.strip_unknown_fields,
    })?;
    let prompts = PromptEngine::new();
    let limiter = CallLimiter::new(config.concurrency);
    let ctx = PipelineContext {
        config,
        providers,
        paths: &paths,
        store: &store,
        schemas: &schemas,
        prompts: &prompts,
        events: &sink,
        limiter: &limiter,
    };

    info!(run_dir = %run_dir.display(), resumed, state = %PipelineState::Init, "pipeline starting");
    sink.emit(
        &PipelineEvent::new(EventType::PipelineStart, "pipeline started").with_data(json!({
            "run_dir": run_dir.display().to_string(),
            "resumed": resumed,
            "providers": ctx.founders(),
        })),
    );

    let mut ledger = Vec::new();
    match run_stages(&ctx, &mut ledger) {
        Ok((selections, plans, results)) => {
            let portfolio = write_report(&paths, &ctx.founders(), &results, &ledger)?;
            info!(state = %PipelineState::Complete, failures = ledger.len(), "pipeline complete");
            sink.emit(
                &PipelineEvent::new(EventType::PipelineComplete, "pipeline complete").with_data(json!({
                    "funded": portfolio.iter().filter(|entry| entry.invest > 0).count(),
                    "failures": ledger.len(),
                })),
            );
            Ok(PipelineOutcome {
                run_dir,
                selections,
                plans,
                results,
                failures: ledger,
                portfolio,
            })
        }
        Err(err) => {
            if let Some(failed) = err.downcast_ref::<StageFailedError>() {
                ledger.extend(failed.failures.iter().cloned());
            }
            if let Err(write_err) = write_jsonl_durable(&paths.failure_ledger_path, &ledger) {
                warn!(err = %format!("{write_err:#}"), "failed to write failure ledger");
            }
            warn!(state = %PipelineState::Failed, err = %format!("{err:#}"), "pipeline halted");
            sink.emit(
                &PipelineEvent::new(EventType::PipelineError, format!("{err:#}"))
                    .with_data(json!({"failures": ledger.len()})),
            );
            Err(err)
        }
    }
}

type StageOutputs = (
    BTreeMap<ParticipantId, Value>,
    BTreeMap<ParticipantId, FinalPlan>,
    BTreeMap<ParticipantId, FounderOutcome>,
);

fn run_stages(ctx: &PipelineContext<'_>, ledger: &mut Vec<FailureRecord>) -> Result<StageOutputs> {
    let stage1 = in_stage(ctx, Stage::Stage1, || stage1::run(ctx))?;
    ledger.extend(stage1.failures);

    let stage2 = in_stage(ctx, Stage::Stage2, || stage2::run(ctx, &stage1.results))?;
    ledger.extend(stage2.failures);

    let stage3 = in_stage(ctx, Stage::Stage3, || stage3::run(ctx, &stage2.results))?;
    ledger.extend(stage3.failures);

    Ok((stage1.results, stage2.results, stage3.results))
}

fn in_stage<T>(
    ctx: &PipelineContext<'_>,
    stage: Stage,
    run: impl FnOnce() -> Result<StageResult<T>>,
) -> Result<StageResult<T>> {
    info!(state = %PipelineState::for_stage(stage), title = stage.title(), "entering stage");
    ctx.events.emit(
        &PipelineEvent::new(EventType::StageStart, format!("{stage}: {}", stage.title())).with_stage(stage),
    );
    let result = run()?;
    ctx.events.emit(
        &PipelineEvent::new(EventType::StageComplete, format!("{stage} complete"))
            .with_stage(stage)
            .with_data(json!({
                "succeeded": result.results.len(),
                "failed": result.failures.len(),
                "restored": result.restored,
            })),
    );
    Ok(result)
}

fn create_run_dir(out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).with_context(|| format!("create directory {}", out_dir.display()))?;
    let base = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    for suffix in 0..MAX_RUN_DIR_SUFFIX {
        let name = if suffix == 0 {
            base.clone()
        } else {
            format!("{base}_{suffix}")
        };
        let dir = out_dir.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create run directory {}", dir.display()));
            }
        }
    }
    bail!("could not allocate a run directory under {}", out_dir.display())
}

/// Failure records a finished stage stored; empty if none were stored.
pub(crate) fn load_failures(paths: &RunPaths, stage: Stage) -> Result<Vec<FailureRecord>> {
    let path = paths.failures_path(stage);
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_jsonl(&path)
}

/// Records of a backing file keyed by participant.
pub(crate) fn load_records(path: &Path) -> Result<BTreeMap<ParticipantId, StageOutputRecord>> {
    let records: Vec<StageOutputRecord> = read_jsonl(path)?;
    Ok(records
        .into_iter()
        .map(|record| (record.participant.clone(), record))
        .collect())
}

pub(crate) fn failed_ids(failures: &[FailureRecord]) -> BTreeSet<ParticipantId> {
    failures.iter().map(|f| f.participant.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dirs_never_collide() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = create_run_dir(temp.path()).expect("first");
        let second = create_run_dir(temp.path()).expect("second");
        assert_ne!(first, second);
        let name = first.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("run_"));
    }

    #[test]
    fn stage_failed_error_survives_anyhow() {
        let err: anyhow::Error = StageFailedError {
            stage: Stage::Stage2,
            reason: "every founder failed".to_string(),
            failures: Vec::new(),
        }
        .into();
        let failed = err.downcast_ref::<StageFailedError>().expect("downcast");
        assert_eq!(failed.stage, Stage::Stage2);
        assert_eq!(err.to_string(), "stage2 failed: every founder failed");
    }
}
