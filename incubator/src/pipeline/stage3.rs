//! Stage 3: founders pitch, every other provider evaluates each pitch as an
//! investor. Pitches are isolated per founder and evaluations per
//! investor/founder pair; there is no iteration.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use minijinja::context;
use serde_json::{Value, json};
use tracing::{info, instrument};

use super::{FinalPlan, PipelineContext, Request, StageResult, failed_ids, load_failures, load_records};
use crate::core::schema::SchemaKind;
use crate::core::types::{FailureRecord, ParticipantId, Stage, StageOutputRecord, evaluation_id};
use crate::io::checkpoint::Backing;
use crate::io::jsonl::write_jsonl_durable;
use crate::io::prompt::{TaskKind, json_block};
use crate::io::provider::Provider;
use crate::stage_exec::ParticipantTask;

const STAGE: Stage = Stage::Stage3;

/// A founder's pitch and the investor decisions on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FounderOutcome {
    pub pitch: Value,
    /// Investor name → validated decision.
    pub decisions: BTreeMap<ParticipantId, Value>,
}

impl FounderOutcome {
    pub fn invest_count(&self) -> usize {
        self.decisions
            .values()
            .filter(|d| d.get("decision").and_then(Value::as_str) == Some("invest"))
            .count()
    }

    pub fn average_conviction(&self) -> Option<f64> {
        let scores: Vec<f64> = self
            .decisions
            .values()
            .filter_map(|d| d.get("conviction_score").and_then(Value::as_f64))
            .collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

#[instrument(skip_all, fields(stage = %STAGE, founders = plans.len()))]
pub fn run(ctx: &PipelineContext<'_>, plans: &BTreeMap<ParticipantId, FinalPlan>) -> Result<StageResult<FounderOutcome>> {
    let stored_failures = load_failures(ctx.paths, STAGE)?;
    let failed = failed_ids(&stored_failures);
    let pitched: BTreeSet<ParticipantId> = plans
        .keys()
        .filter(|founder| !failed.contains(*founder))
        .cloned()
        .collect();
    let evaluated: BTreeSet<ParticipantId> = pitched
        .iter()
        .flat_map(|founder| {
            ctx.others(founder)
                .into_iter()
                .map(move |investor| evaluation_id(investor.name(), founder))
        })
        .filter(|id| !failed.contains(id))
        .collect();
    let backing = [
        Backing {
            path: &ctx.paths.pitches_path,
            expected: &pitched,
        },
        Backing {
            path: &ctx.paths.decisions_path,
            expected: &evaluated,
        },
    ];
    if ctx.trusted(STAGE, &backing)? {
        let results = restore(ctx)?;
        info!(founders = results.len(), "restored stage 3 from checkpoint");
        return Ok(StageResult {
            results,
            failures: stored_failures,
            restored: true,
        });
    }

    let pitch_tasks: Vec<ParticipantTask<'_, Value>> = plans
        .iter()
        .map(|(founder, fin)| {
            let id = founder.clone();
            ParticipantTask::new(founder.clone(), move || pitch(ctx, &id, &fin.plan))
        })
        .collect();
    let pitches = ctx.executor(STAGE).execute(pitch_tasks, |founder, _| {
        ctx.step_complete(STAGE, founder, format!("{founder} pitched"), Value::Null);
        Ok(())
    })?;
    let mut failures: Vec<FailureRecord> = pitches.failures;
    if pitches.successes.is_empty() {
        write_jsonl_durable(&ctx.paths.failures_path(STAGE), &failures)?;
        return Err(ctx.stage_failed(STAGE, "every pitch failed".to_string(), failures));
    }

    let mut pairs: BTreeMap<ParticipantId, (String, String)> = BTreeMap::new();
    let mut eval_tasks: Vec<ParticipantTask<'_, Value>> = Vec::new();
    for (founder, pitch) in &pitches.successes {
        let plan = &plans[founder].plan;
        for investor in ctx.others(founder) {
            let id = evaluation_id(investor.name(), founder);
            pairs.insert(id.clone(), (investor.name().to_string(), founder.clone()));
            let founder = founder.as_str();
            eval_tasks.push(ParticipantTask::new(id, move || {
                evaluate(ctx, investor, founder, pitch, plan)
            }));
        }
    }
    let decisions = ctx.executor(STAGE).execute(eval_tasks, |id, decision| {
        let verdict = decision.get("decision").and_then(Value::as_str).unwrap_or("unknown");
        ctx.step_complete(
            STAGE,
            id,
            format!("{id}: {verdict}"),
            json!({"conviction_score": decision.get("conviction_score")}),
        );
        Ok(())
    })?;
    failures.extend(decisions.failures);

    let failures_file = write_jsonl_durable(&ctx.paths.failures_path(STAGE), &failures)?;
    if decisions.successes.is_empty() {
        return Err(ctx.stage_failed(STAGE, "every investor evaluation failed".to_string(), failures));
    }

    let pitch_records: Vec<StageOutputRecord> = pitches
        .successes
        .iter()
        .map(|(founder, pitch)| StageOutputRecord::new(founder.as_str(), 0, pitch.clone()))
        .collect();
    let decision_records: Vec<StageOutputRecord> = decisions
        .successes
        .iter()
        .map(|(id, decision)| StageOutputRecord::new(id.as_str(), 0, decision.clone()))
        .collect();
    let files = [
        write_jsonl_durable(&ctx.paths.pitches_path, &pitch_records)?,
        write_jsonl_durable(&ctx.paths.decisions_path, &decision_records)?,
        failures_file,
    ];
    ctx.store.record_stage_complete(STAGE, &files)?;

    let mut results: BTreeMap<ParticipantId, FounderOutcome> = pitches
        .successes
        .into_iter()
        .map(|(founder, pitch)| {
            (
                founder,
                FounderOutcome {
                    pitch,
                    decisions: BTreeMap::new(),
                },
            )
        })
        .collect();
    for (id, decision) in decisions.successes {
        if let Some((investor, founder)) = pairs.get(&id)
            && let Some(outcome) = results.get_mut(founder)
        {
            outcome.decisions.insert(investor.clone(), decision);
        }
    }

    Ok(StageResult {
        results,
        failures,
        restored: false,
    })
}

fn pitch(ctx: &PipelineContext<'_>, founder: &str, plan: &Value) -> Result<Value> {
    let provider = ctx.provider(founder)?;
    ctx.call(
        provider,
        Request {
            stage: STAGE,
            participant: founder,
            label: "pitch",
            task: TaskKind::Pitch,
            schema: SchemaKind::Pitch,
        },
        context! { founder => founder, plan => json_block(plan) },
    )
}

fn evaluate(
    ctx: &PipelineContext<'_>,
    investor: &dyn Provider,
    founder: &str,
    pitch: &Value,
    plan: &Value,
) -> Result<Value> {
    let id = evaluation_id(investor.name(), founder);
    ctx.call(
        investor,
        Request {
            stage: STAGE,
            participant: &id,
            label: "investor_eval",
            task: TaskKind::InvestorEval,
            schema: SchemaKind::InvestorDecision,
        },
        context! {
            investor => investor.name(),
            founder => founder,
            pitch => json_block(pitch),
            plan => json_block(plan),
        },
    )
}

fn restore(ctx: &PipelineContext<'_>) -> Result<BTreeMap<ParticipantId, FounderOutcome>> {
    let mut results: BTreeMap<ParticipantId, FounderOutcome> = load_records(&ctx.paths.pitches_path)?
        .into_iter()
        .map(|(founder, record)| {
            (
                founder,
                FounderOutcome {
                    pitch: record.payload,
                    decisions: BTreeMap::new(),
                },
            )
        })
        .collect();
    for (id, record) in load_records(&ctx.paths.decisions_path)? {
        if let Some((investor, founder)) = id.split_once('@')
            && let Some(outcome) = results.get_mut(founder)
        {
            outcome.decisions.insert(investor.to_string(), record.payload);
        }
    }
    Ok(results)
}
