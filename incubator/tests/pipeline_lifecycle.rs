//! End-to-end pipeline runs against mock providers.
//!
//! These tests drive `run_pipeline` through fresh runs, injected participant
//! failures, simulated crashes and resumes, and check the files a run leaves
//! behind.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::Result;

use incubator::core::types::{FailureRecord, Stage, StageOutputRecord};
use incubator::io::checkpoint::CheckpointStore;
use incubator::io::events::{EventSink, EventType, PipelineEvent};
use incubator::io::jsonl::read_jsonl;
use incubator::io::prompt::TaskKind;
use incubator::io::provider::{MockProvider, Provider};
use incubator::io::run_paths::RunPaths;
use incubator::pipeline::{PipelineOutcome, RunTarget, StageFailedError, run_pipeline};
use incubator::report::EntryStatus;
use incubator::test_support::{FlakyProvider, RecordingSink, mock_config, mock_providers};

const NAMES: [&str; 4] = ["anthropic", "deepseek", "gemini", "openai"];

fn flaky(providers: Vec<FlakyProvider>) -> (Vec<Arc<FlakyProvider>>, Vec<Arc<dyn Provider>>) {
    let concrete: Vec<Arc<FlakyProvider>> = providers.into_iter().map(Arc::new).collect();
    let dynamic = concrete
        .iter()
        .map(|p| p.clone() as Arc<dyn Provider>)
        .collect();
    (concrete, dynamic)
}

fn recording(names: &[&str]) -> (Vec<Arc<FlakyProvider>>, Vec<Arc<dyn Provider>>) {
    flaky(names.iter().map(|name| FlakyProvider::new(name)).collect())
}

fn fresh_run(out: &Path) -> PipelineOutcome {
    let config = mock_config(out, &NAMES);
    run_pipeline(
        &config,
        &mock_providers(&NAMES),
        RunTarget::Fresh {
            out_dir: out.to_path_buf(),
        },
        Arc::new(RecordingSink::default()),
    )
    .expect("fresh run")
}

fn participants(path: &Path) -> BTreeSet<String> {
    read_jsonl::<StageOutputRecord>(path)
        .expect("read backing file")
        .into_iter()
        .map(|record| record.participant)
        .collect()
}

fn all_names() -> BTreeSet<String> {
    NAMES.iter().map(|name| name.to_string()).collect()
}

#[test]
fn mock_run_completes_every_stage() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &NAMES);
    let sink = Arc::new(RecordingSink::default());
    let outcome = run_pipeline(
        &config,
        &mock_providers(&NAMES),
        RunTarget::Fresh {
            out_dir: temp.path().to_path_buf(),
        },
        sink.clone() as Arc<dyn EventSink>,
    )
    .expect("run");

    let paths = RunPaths::new(&outcome.run_dir);
    let checkpoint = CheckpointStore::new(&paths).load().expect("checkpoint");
    assert!(checkpoint.stage1_complete && checkpoint.stage2_complete && checkpoint.stage3_complete);
    assert_eq!(checkpoint.stage2_participants_done, all_names());

    assert_eq!(participants(&paths.selections_path), all_names());
    assert_eq!(participants(&paths.final_plans_path), all_names());
    assert_eq!(participants(&paths.pitches_path), all_names());
    // Every founder is evaluated by the three other providers.
    assert_eq!(participants(&paths.decisions_path).len(), 12);
    assert_eq!(read_jsonl::<StageOutputRecord>(&paths.ideas_path).expect("ideas").len(), 8);
    assert!(paths.plan_version_path("gemini", 0).exists());
    assert!(paths.review_round_path("gemini", 1).exists());
    assert!(paths.config_snapshot_path.exists());

    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.portfolio.len(), 4);
    assert!(outcome.portfolio.iter().all(|entry| entry.invest == 3));
    let report = fs::read_to_string(&paths.report_path).expect("report");
    assert_eq!(report.lines().count(), 5);

    let types: Vec<EventType> = sink.events().iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&EventType::PipelineStart));
    assert_eq!(types.last(), Some(&EventType::PipelineComplete));
    assert_eq!(types.iter().filter(|t| **t == EventType::StageComplete).count(), 3);
    assert!(!types.contains(&EventType::ParticipantError));

    let logged = fs::read_to_string(&paths.events_path).expect("events.jsonl");
    assert_eq!(logged.lines().count(), types.len());
}

#[test]
fn failing_founder_is_isolated_and_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &NAMES);
    let (_, providers) = flaky(vec![
        FlakyProvider::new("anthropic"),
        FlakyProvider::new("deepseek").fail_on(TaskKind::Build),
        FlakyProvider::new("gemini"),
        FlakyProvider::new("openai"),
    ]);
    let sink = Arc::new(RecordingSink::default());
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Fresh {
            out_dir: temp.path().to_path_buf(),
        },
        sink.clone() as Arc<dyn EventSink>,
    )
    .expect("run");

    assert_eq!(outcome.failures.len(), 1);
    let failure = &outcome.failures[0];
    assert_eq!(failure.participant, "deepseek");
    assert_eq!(failure.stage, Stage::Stage2);
    assert!(failure.reason.contains("slow"));

    let paths = RunPaths::new(&outcome.run_dir);
    let mut expected = all_names();
    expected.remove("deepseek");
    assert_eq!(participants(&paths.final_plans_path), expected);
    assert_eq!(participants(&paths.pitches_path), expected);

    let ledger: Vec<FailureRecord> = read_jsonl(&paths.failure_ledger_path).expect("ledger");
    assert_eq!(ledger, outcome.failures);
    let stage_failures: Vec<FailureRecord> =
        read_jsonl(&paths.failures_path(Stage::Stage2)).expect("stage2 failures");
    assert_eq!(stage_failures.len(), 1);

    let excluded = outcome
        .portfolio
        .iter()
        .find(|entry| entry.participant == "deepseek")
        .expect("excluded entry");
    assert_eq!(excluded.rank, None);
    assert_eq!(excluded.status, EntryStatus::Excluded);
    assert!(excluded.reason.as_deref().is_some_and(|r| r.starts_with("stage2:")));

    let errors: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::ParticipantError)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].participant.as_deref(), Some("deepseek"));
    assert_eq!(errors[0].stage, Some(Stage::Stage2));
}

#[test]
fn panicking_pitch_fails_only_that_founder() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &NAMES);
    let (_, providers) = flaky(vec![
        FlakyProvider::new("anthropic"),
        FlakyProvider::new("deepseek"),
        FlakyProvider::new("gemini").panic_on(TaskKind::Pitch),
        FlakyProvider::new("openai"),
    ]);
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Fresh {
            out_dir: temp.path().to_path_buf(),
        },
        Arc::new(RecordingSink::default()),
    )
    .expect("run");

    assert_eq!(outcome.results.len(), 3);
    assert!(!outcome.results.contains_key("gemini"));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, Stage::Stage3);
    assert!(outcome.failures[0].reason.contains("panicked"));
    // gemini still evaluates the other pitches as an investor.
    assert!(outcome.results["openai"].decisions.contains_key("gemini"));
}

#[test]
fn resume_after_partial_stage2_runs_only_remaining_founders() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = fresh_run(temp.path());
    let paths = RunPaths::new(&first.run_dir);
    let store = CheckpointStore::new(&paths);

    // Crash after anthropic and deepseek were checkpointed but before the
    // stage was recorded complete.
    store.reset_from(Stage::Stage2).expect("reset");
    store.record_participant_done(Stage::Stage2, "anthropic").expect("done a");
    store.record_participant_done(Stage::Stage2, "deepseek").expect("done b");
    fs::remove_file(&paths.final_plans_path).expect("remove final plans");

    let (recorders, providers) = recording(&NAMES);
    let config = mock_config(temp.path(), &NAMES);
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Resume(first.run_dir.clone()),
        Arc::new(RecordingSink::default()),
    )
    .expect("resume");

    let builds: Vec<usize> = recorders.iter().map(|p| p.count(TaskKind::Build)).collect();
    assert_eq!(builds, vec![0, 0, 1, 1]);
    assert!(recorders.iter().all(|p| p.count(TaskKind::Ideas) == 0));

    assert_eq!(participants(&paths.final_plans_path), all_names());
    assert_eq!(outcome.plans.len(), 4);
    let checkpoint = store.load().expect("checkpoint");
    assert!(checkpoint.stage2_complete && checkpoint.stage3_complete);
    assert_eq!(checkpoint.stage2_participants_done, all_names());
}

#[test]
fn missing_final_file_reruns_all_of_stage2() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = fresh_run(temp.path());
    let paths = RunPaths::new(&first.run_dir);
    fs::remove_file(&paths.final_plans_path).expect("remove final plans");
    assert!(CheckpointStore::new(&paths).load().expect("checkpoint").stage2_complete);

    let (recorders, providers) = recording(&NAMES);
    let config = mock_config(temp.path(), &NAMES);
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Resume(first.run_dir.clone()),
        Arc::new(RecordingSink::default()),
    )
    .expect("resume");

    assert!(recorders.iter().all(|p| p.count(TaskKind::Build) == 1));
    // Stage 3 depended on the withdrawn stage and runs again too.
    assert!(recorders.iter().all(|p| p.count(TaskKind::Pitch) == 1));
    assert_eq!(participants(&paths.final_plans_path), all_names());
    assert_eq!(outcome.results.len(), 4);
}

#[test]
fn crash_before_stage3_checkpoint_reruns_stage3_only() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = fresh_run(temp.path());
    let paths = RunPaths::new(&first.run_dir);
    // Backing files were written; the complete flag never made it to disk.
    CheckpointStore::new(&paths)
        .reset_from(Stage::Stage3)
        .expect("reset");

    let (recorders, providers) = recording(&NAMES);
    let config = mock_config(temp.path(), &NAMES);
    run_pipeline(
        &config,
        &providers,
        RunTarget::Resume(first.run_dir.clone()),
        Arc::new(RecordingSink::default()),
    )
    .expect("resume");

    assert!(recorders.iter().all(|p| p.count(TaskKind::Build) == 0));
    assert!(recorders.iter().all(|p| p.count(TaskKind::Pitch) == 1));
    assert_eq!(participants(&paths.decisions_path).len(), 12);
    assert!(CheckpointStore::new(&paths).load().expect("checkpoint").stage3_complete);
}

#[test]
fn resuming_a_complete_run_makes_no_model_calls() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = fresh_run(temp.path());

    let (recorders, providers) = recording(&NAMES);
    let config = mock_config(temp.path(), &NAMES);
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Resume(first.run_dir.clone()),
        Arc::new(RecordingSink::default()),
    )
    .expect("resume");

    assert!(recorders.iter().all(|p| p.tasks().is_empty()));
    assert_eq!(outcome.plans, first.plans);
    assert_eq!(outcome.results, first.results);
    assert_eq!(outcome.portfolio, first.portfolio);
}

#[test]
fn stage_with_no_survivors_halts_the_pipeline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &["a", "b"]);
    let (_, providers) = flaky(vec![
        FlakyProvider::new("a").fail_on(TaskKind::Build),
        FlakyProvider::new("b").fail_on(TaskKind::Build).with_message("quota exceeded"),
    ]);
    let sink = Arc::new(RecordingSink::default());
    let err = run_pipeline(
        &config,
        &providers,
        RunTarget::Fresh {
            out_dir: temp.path().to_path_buf(),
        },
        sink.clone() as Arc<dyn EventSink>,
    )
    .expect_err("halts");

    let failed = err.downcast_ref::<StageFailedError>().expect("stage failure");
    assert_eq!(failed.stage, Stage::Stage2);
    assert_eq!(failed.failures.len(), 2);

    let events = sink.events();
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::PipelineError));

    let run_dir = fs::read_dir(temp.path())
        .expect("list out dir")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.is_dir())
        .expect("run dir");
    let paths = RunPaths::new(&run_dir);
    let ledger: Vec<FailureRecord> = read_jsonl(&paths.failure_ledger_path).expect("ledger");
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().any(|f| f.reason.contains("quota exceeded")));
    let checkpoint = CheckpointStore::new(&paths).load().expect("checkpoint");
    assert!(checkpoint.stage1_complete);
    assert!(!checkpoint.stage2_complete);
}

/// Mock provider that tracks how many model calls are in flight at once.
struct GaugedProvider {
    inner: MockProvider,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Provider for GaugedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate(&self, prompt: &str, system: &str) -> Result<String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        let reply = self.inner.generate(prompt, system);
        self.active.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[test]
fn model_calls_in_flight_never_exceed_concurrency() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &NAMES);
    assert_eq!(config.concurrency, 2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let providers: Vec<Arc<dyn Provider>> = NAMES
        .iter()
        .map(|name| {
            Arc::new(GaugedProvider {
                inner: MockProvider::new(name),
                active: active.clone(),
                peak: peak.clone(),
            }) as Arc<dyn Provider>
        })
        .collect();
    run_pipeline(
        &config,
        &providers,
        RunTarget::Fresh {
            out_dir: temp.path().to_path_buf(),
        },
        Arc::new(RecordingSink::default()),
    )
    .expect("run");

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= config.concurrency, "peak in flight {peak}");
}

#[test]
fn torn_final_plans_file_reruns_only_missing_founder() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = fresh_run(temp.path());
    let paths = RunPaths::new(&first.run_dir);

    // openai's record is lost and the last line was cut mid-write.
    let kept: Vec<String> = fs::read_to_string(&paths.final_plans_path)
        .expect("read final plans")
        .lines()
        .filter(|line| !line.contains("\"participant\":\"openai\""))
        .map(str::to_string)
        .collect();
    assert_eq!(kept.len(), 3);
    let mut torn = kept.join("\n");
    torn.push_str("\n{\"participant\":\"open");
    fs::write(&paths.final_plans_path, torn).expect("tear final plans");

    let (recorders, providers) = recording(&NAMES);
    let config = mock_config(temp.path(), &NAMES);
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Resume(first.run_dir.clone()),
        Arc::new(RecordingSink::default()),
    )
    .expect("resume");

    let builds: Vec<usize> = recorders.iter().map(|p| p.count(TaskKind::Build)).collect();
    assert_eq!(builds, vec![0, 0, 0, 1]);
    assert!(recorders.iter().all(|p| p.count(TaskKind::Ideas) == 0));
    assert_eq!(participants(&paths.final_plans_path), all_names());
    assert_eq!(outcome.plans.len(), 4);
    assert_eq!(outcome.plans["anthropic"], first.plans["anthropic"]);
    let checkpoint = CheckpointStore::new(&paths).load().expect("checkpoint");
    assert!(checkpoint.stage2_complete && checkpoint.stage3_complete);
    assert_eq!(checkpoint.stage2_participants_done, all_names());
}

#[test]
fn failed_evaluations_are_named_in_the_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &NAMES);
    let (_, providers) = flaky(vec![
        FlakyProvider::new("anthropic"),
        FlakyProvider::new("deepseek"),
        FlakyProvider::new("gemini").fail_on(TaskKind::InvestorEval),
        FlakyProvider::new("openai"),
    ]);
    let outcome = run_pipeline(
        &config,
        &providers,
        RunTarget::Fresh {
            out_dir: temp.path().to_path_buf(),
        },
        Arc::new(RecordingSink::default()),
    )
    .expect("run");

    assert_eq!(outcome.failures.len(), 3);
    let failed: BTreeSet<&str> = outcome
        .portfolio
        .iter()
        .filter(|entry| entry.status == EntryStatus::Failed)
        .map(|entry| entry.participant.as_str())
        .collect();
    assert_eq!(
        failed,
        BTreeSet::from(["gemini@anthropic", "gemini@deepseek", "gemini@openai"])
    );

    let report = fs::read_to_string(RunPaths::new(&outcome.run_dir).report_path).expect("report");
    for id in ["gemini@anthropic", "gemini@deepseek", "gemini@openai"] {
        let line = report
            .lines()
            .find(|line| line.contains(id))
            .unwrap_or_else(|| panic!("{id} missing from report"));
        assert!(line.contains(",failed,"), "{line}");
        assert!(line.contains("stage3: "), "{line}");
    }
}

/// Modification times seen when a stage reported completion.
struct StageSnapshot {
    stage: Stage,
    claimed: bool,
    checkpoint_written: SystemTime,
    files: Vec<(PathBuf, SystemTime)>,
}

/// Captures checkpoint and backing file state at every `stage_complete`.
struct WriteOrderSink {
    paths: Mutex<Option<RunPaths>>,
    out_dir: PathBuf,
    snapshots: Mutex<Vec<StageSnapshot>>,
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or_else(|err| panic!("{}: {err}", path.display()))
}

fn backing_files(paths: &RunPaths, stage: Stage) -> Vec<PathBuf> {
    let mut files = match stage {
        Stage::Stage1 => vec![
            paths.ideas_path.clone(),
            paths.feedback_path.clone(),
            paths.selections_path.clone(),
        ],
        Stage::Stage2 => vec![paths.final_plans_path.clone(), paths.all_reviews_path.clone()],
        Stage::Stage3 => vec![paths.pitches_path.clone(), paths.decisions_path.clone()],
    };
    files.push(paths.failures_path(stage));
    files
}

impl EventSink for WriteOrderSink {
    fn emit(&self, event: &PipelineEvent) {
        let mut paths = self.paths.lock().expect("paths lock");
        if event.event_type == EventType::PipelineStart {
            let run_dir = event.data["run_dir"].as_str().map(PathBuf::from);
            *paths = run_dir.map(RunPaths::new);
        }
        let (Some(paths), EventType::StageComplete, Some(stage)) =
            (paths.as_ref(), event.event_type, event.stage)
        else {
            return;
        };
        let checkpoint = CheckpointStore::new(paths).load().expect("checkpoint");
        let snapshot = StageSnapshot {
            stage,
            claimed: checkpoint.is_complete(stage),
            checkpoint_written: modified(&paths.checkpoint_path),
            files: backing_files(paths, stage)
                .into_iter()
                .map(|path| {
                    let time = modified(&path);
                    (path, time)
                })
                .collect(),
        };
        self.snapshots.lock().expect("snapshots lock").push(snapshot);
    }
}

#[test]
fn checkpoint_claims_are_written_after_their_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = mock_config(temp.path(), &NAMES);
    let sink = Arc::new(WriteOrderSink {
        paths: Mutex::new(None),
        out_dir: temp.path().to_path_buf(),
        snapshots: Mutex::new(Vec::new()),
    });
    run_pipeline(
        &config,
        &mock_providers(&NAMES),
        RunTarget::Fresh {
            out_dir: sink.out_dir.clone(),
        },
        sink.clone() as Arc<dyn EventSink>,
    )
    .expect("run");

    let snapshots = sink.snapshots.lock().expect("snapshots lock");
    let stages: Vec<Stage> = snapshots.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    for snapshot in snapshots.iter() {
        assert!(snapshot.claimed, "{} not claimed", snapshot.stage);
        for (path, written) in &snapshot.files {
            assert!(
                *written <= snapshot.checkpoint_written,
                "{} written after the checkpoint claiming {}",
                path.display(),
                snapshot.stage
            );
        }
    }
}
