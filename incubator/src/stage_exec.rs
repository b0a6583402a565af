//! Fault-isolating execution of one stage's participant tasks.
//!
//! Every participant task runs on the [`crate::pool`] runner, wrapped so that
//! an error or a panic becomes a [`FailureRecord`] instead of taking down
//! its siblings. Successes are reported as they land so the orchestrator
//! can checkpoint each participant immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};

use anyhow::{Result, anyhow, bail};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::types::{FailureRecord, ParticipantId, Stage, truncate_reason};
use crate::io::events::{EventSink, EventType, PipelineEvent};
use crate::pool::{Task, run_all_with};

/// One participant's unit of work.
pub struct ParticipantTask<'a, T> {
    pub participant: ParticipantId,
    pub run: Task<'a, T>,
}

impl<'a, T> ParticipantTask<'a, T> {
    pub fn new(
        participant: impl Into<ParticipantId>,
        run: impl FnOnce() -> Result<T> + Send + 'a,
    ) -> Self {
        Self {
            participant: participant.into(),
            run: Box::new(run),
        }
    }
}

/// Per-participant results of one stage.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub successes: BTreeMap<ParticipantId, T>,
    /// Failures in task input order.
    pub failures: Vec<FailureRecord>,
}

impl<T> Default for StageOutcome<T> {
    fn default() -> Self {
        Self {
            successes: BTreeMap::new(),
            failures: Vec::new(),
        }
    }
}

pub struct StageExecutor<'e> {
    pub stage: Stage,
    pub parallelism: usize,
    pub reason_limit: usize,
    pub events: &'e dyn EventSink,
}

impl StageExecutor<'_> {
    /// Run every task, isolating failures per participant.
    ///
    /// `on_success` runs on the calling thread as each participant succeeds.
    /// Its errors are not participant failures: the first one aborts the
    /// stage once the in-flight tasks have drained.
    #[instrument(skip_all, fields(stage = %self.stage, participants = tasks.len()))]
    pub fn execute<'a, T, F>(
        &self,
        tasks: Vec<ParticipantTask<'a, T>>,
        mut on_success: F,
    ) -> Result<StageOutcome<T>>
    where
        T: Send + 'a,
        F: FnMut(&str, &T) -> Result<()>,
    {
        if tasks.is_empty() {
            bail!("{} has no participants to run", self.stage);
        }
        let mut seen = BTreeSet::new();
        for task in &tasks {
            if !seen.insert(task.participant.as_str()) {
                bail!(
                    "{} has duplicate participant id {}",
                    self.stage,
                    task.participant
                );
            }
        }

        let ids: Vec<ParticipantId> = tasks.iter().map(|task| task.participant.clone()).collect();
        let isolated: Vec<Task<'a, T>> = tasks.into_iter().map(|task| isolate(task.run)).collect();

        let mut failures: BTreeMap<usize, FailureRecord> = BTreeMap::new();
        let mut observer_error: Option<anyhow::Error> = None;
        let results = run_all_with(isolated, self.parallelism, |index, result| {
            let participant = &ids[index];
            match result {
                Ok(value) => {
                    info!(stage = %self.stage, participant = %participant, "participant succeeded");
                    if observer_error.is_none()
                        && let Err(err) = on_success(participant.as_str(), value)
                    {
                        observer_error = Some(err);
                    }
                }
                Err(err) => {
                    let record = self.failure_record(participant, err);
                    failures.insert(index, record);
                }
            }
        });

        if let Some(err) = observer_error {
            return Err(err);
        }

        let mut outcome = StageOutcome::default();
        for (index, (participant, result)) in ids.into_iter().zip(results).enumerate() {
            match result {
                Ok(value) => {
                    outcome.successes.insert(participant, value);
                }
                Err(err) => {
                    let record = match failures.remove(&index) {
                        Some(record) => record,
                        None => self.failure_record(&participant, &err),
                    };
                    outcome.failures.push(record);
                }
            }
        }

        info!(
            stage = %self.stage,
            succeeded = outcome.successes.len(),
            failed = outcome.failures.len(),
            "stage participants finished"
        );
        Ok(outcome)
    }

    fn failure_record(&self, participant: &str, err: &anyhow::Error) -> FailureRecord {
        let reason = truncate_reason(&format!("{err:#}"), self.reason_limit);
        warn!(stage = %self.stage, participant, reason = %reason, "participant failed");
        self.events.emit(
            &PipelineEvent::new(EventType::ParticipantError, format!("{participant} failed"))
                .with_stage(self.stage)
                .with_participant(participant)
                .with_data(json!({"reason": reason})),
        );
        FailureRecord {
            participant: participant.to_string(),
            stage: self.stage,
            reason,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn isolate<'a, T: 'a>(run: Task<'a, T>) -> Task<'a, T> {
    Box::new(move || match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("task panicked: {}", panic_message(payload.as_ref()))),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
