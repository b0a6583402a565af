//! Stage 2: each founder builds a plan, then iterates on advisor reviews
//! until the advisors converge or the round limit is reached.
//!
//! Every plan version and review round is written to a per-founder file
//! before the founder is checkpointed as done, so a resumed run reloads done
//! founders from disk and only reruns the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use anyhow::{Context, Result, anyhow};
use minijinja::context;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use super::{PipelineContext, Request, StageResult, failed_ids, load_failures, load_records};
use crate::core::schema::{ADVISOR_ROLES, SchemaKind};
use crate::core::types::{ParticipantId, Stage, StageOutputRecord};
use crate::io::checkpoint::Backing;
use crate::io::jsonl::{read_jsonl, write_jsonl_durable};
use crate::io::prompt::{TaskKind, json_block};
use crate::io::provider::Provider;
use crate::io::run_paths::RunPaths;
use crate::pool::{Task, run_all};
use crate::stage_exec::{ParticipantTask, StageOutcome};

const STAGE: Stage = Stage::Stage2;

/// A founder's final plan and the review rounds that shaped it.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalPlan {
    pub version: u32,
    pub plan: Value,
    /// Advisor reviews, one list per round.
    pub rounds: Vec<Vec<Value>>,
}

impl FinalPlan {
    pub fn converged(&self, threshold: f64) -> bool {
        self.rounds.last().is_some_and(|reviews| converged(reviews, threshold))
    }
}

/// Run stage 2 over every founder with a stage-1 selection.
///
/// Founders already checkpointed as done (and backed by a plan file) are
/// loaded from disk; only the remaining founders run.
#[instrument(skip_all, fields(stage = %STAGE, founders = selections.len()))]
pub fn run(ctx: &PipelineContext<'_>, selections: &BTreeMap<ParticipantId, Value>) -> Result<StageResult<FinalPlan>> {
    let founders: BTreeSet<ParticipantId> = selections.keys().cloned().collect();
    let stored_failures = load_failures(ctx.paths, STAGE)?;
    let expected: BTreeSet<ParticipantId> = founders
        .difference(&failed_ids(&stored_failures))
        .cloned()
        .collect();
    let backing = [Backing {
        path: &ctx.paths.final_plans_path,
        expected: &expected,
    }];
    if ctx.trusted(STAGE, &backing)? {
        let mut results = BTreeMap::new();
        for (founder, record) in load_records(&ctx.paths.final_plans_path)? {
            let rounds = load_rounds(ctx.paths, &founder)?;
            results.insert(
                founder,
                FinalPlan {
                    version: record.version,
                    plan: record.payload,
                    rounds,
                },
            );
        }
        info!(founders = results.len(), "restored stage 2 from checkpoint");
        return Ok(StageResult {
            results,
            failures: stored_failures,
            restored: true,
        });
    }

    let checkpoint = ctx.store.load()?;
    let done: BTreeSet<ParticipantId> = ctx
        .store
        .verify_participants_done(&checkpoint, ctx.paths)?
        .intersection(&founders)
        .cloned()
        .collect();
    if done != checkpoint.stage2_participants_done {
        ctx.store.retain_participants_done(&done)?;
    }
    let mut results = BTreeMap::new();
    for founder in &done {
        results.insert(founder.clone(), load_final_plan(ctx.paths, founder)?);
    }
    let remaining: Vec<&ParticipantId> = founders.difference(&done).collect();
    info!(done = done.len(), remaining = remaining.len(), "stage 2 work partitioned");

    let outcome = if remaining.is_empty() {
        StageOutcome::default()
    } else {
        let tasks: Vec<ParticipantTask<'_, FinalPlan>> = remaining
            .into_iter()
            .map(|founder| {
                let selection = &selections[founder];
                let id = founder.clone();
                ParticipantTask::new(founder.clone(), move || develop(ctx, &id, selection))
            })
            .collect();
        ctx.executor(STAGE).execute(tasks, |founder, plan| {
            ctx.store.record_participant_done(STAGE, founder)?;
            ctx.step_complete(
                STAGE,
                founder,
                format!("{founder} finished plan v{}", plan.version),
                json!({"version": plan.version, "rounds": plan.rounds.len()}),
            );
            Ok(())
        })?
    };
    results.extend(outcome.successes);

    let failures_file = write_jsonl_durable(&ctx.paths.failures_path(STAGE), &outcome.failures)?;
    if results.is_empty() {
        return Err(ctx.stage_failed(STAGE, "every founder failed".to_string(), outcome.failures));
    }

    let finals: Vec<StageOutputRecord> = results
        .iter()
        .map(|(founder, fin)| StageOutputRecord::new(founder.as_str(), fin.version, fin.plan.clone()))
        .collect();
    let reviews: Vec<StageOutputRecord> = results
        .iter()
        .flat_map(|(founder, fin)| {
            fin.rounds.iter().enumerate().flat_map(move |(round, reviews)| {
                reviews
                    .iter()
                    .map(move |review| StageOutputRecord::new(founder.as_str(), round as u32 + 1, review.clone()))
            })
        })
        .collect();
    let files = [
        write_jsonl_durable(&ctx.paths.final_plans_path, &finals)?,
        write_jsonl_durable(&ctx.paths.all_reviews_path, &reviews)?,
        failures_file,
    ];
    ctx.store.record_stage_complete(STAGE, &files)?;

    Ok(StageResult {
        results,
        failures: outcome.failures,
        restored: false,
    })
}

/// Build, review and iterate one founder's plan.
fn develop(ctx: &PipelineContext<'_>, founder: &str, selection: &Value) -> Result<FinalPlan> {
    for stale in ctx.paths.participant_files(founder)? {
        fs::remove_file(&stale).with_context(|| format!("remove stale {}", stale.display()))?;
    }
    let provider = ctx.provider(founder)?;
    let idea_id = selection
        .get("selected_idea_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("selection of {founder} has no selected_idea_id"))?;

    let mut plan = ctx.call(
        provider,
        request(founder, "build", TaskKind::Build),
        context! { founder => founder, selection => json_block(selection), idea_id => idea_id },
    )?;
    let mut version = 0;
    write_plan(ctx.paths, founder, version, &plan)?;

    let advisors = ctx.others(founder);
    let mut previous: BTreeMap<String, Value> = BTreeMap::new();
    let mut rounds = Vec::new();
    for round in 1..=ctx.config.max_iterations {
        let reviews = collect_reviews(ctx, founder, &plan, round, &advisors, &previous)?;
        let records: Vec<StageOutputRecord> = advisors
            .iter()
            .zip(&reviews)
            .map(|(advisor, review)| StageOutputRecord::new(advisor.name(), round, review.clone()))
            .collect();
        write_jsonl_durable(&ctx.paths.review_round_path(founder, round), &records)?;

        let done = converged(&reviews, ctx.config.convergence_score);
        debug!(founder, round, converged = done, "review round finished");
        ctx.step_complete(
            STAGE,
            founder,
            format!("{founder} review round {round}"),
            json!({"round": round, "converged": done, "average_readiness": average_readiness(&reviews)}),
        );
        previous = advisors
            .iter()
            .map(|advisor| advisor.name().to_string())
            .zip(reviews.iter().cloned())
            .collect();
        let reviews_block = json_block(&Value::Array(reviews.clone()));
        rounds.push(reviews);
        if done {
            break;
        }

        plan = ctx.call(
            provider,
            request(founder, "iterate", TaskKind::Iterate),
            context! { founder => founder, plan => json_block(&plan), reviews => reviews_block, round => round },
        )?;
        version = round;
        write_plan(ctx.paths, founder, version, &plan)?;
    }

    Ok(FinalPlan { version, plan, rounds })
}

fn collect_reviews(
    ctx: &PipelineContext<'_>,
    founder: &str,
    plan: &Value,
    round: u32,
    advisors: &[&dyn Provider],
    previous: &BTreeMap<String, Value>,
) -> Result<Vec<Value>> {
    let plan_block = json_block(plan);
    let jobs: Vec<Task<'_, Value>> = advisors
        .iter()
        .enumerate()
        .map(|(index, advisor)| {
            let advisor = *advisor;
            let role = advisor_role(index, round);
            let plan_block = plan_block.as_str();
            let previous_feedback = previous.get(advisor.name()).map(json_block);
            Box::new(move || {
                let label = format!("review:{}", advisor.name());
                ctx.call(
                    advisor,
                    Request {
                        stage: STAGE,
                        participant: founder,
                        label: &label,
                        task: TaskKind::AdvisorReview,
                        schema: SchemaKind::AdvisorReview,
                    },
                    context! {
                        reviewer => advisor.name(),
                        role => role,
                        plan => plan_block,
                        previous_feedback => previous_feedback,
                    },
                )
            }) as Task<'_, Value>
        })
        .collect();
    run_all(jobs, ctx.config.concurrency)
        .into_iter()
        .collect::<Result<Vec<Value>>>()
        .with_context(|| format!("collect round {round} reviews for {founder}"))
}

fn request<'r>(founder: &'r str, label: &'r str, task: TaskKind) -> Request<'r> {
    Request {
        stage: STAGE,
        participant: founder,
        label,
        task,
        schema: SchemaKind::StartupPlan,
    }
}

/// Roles rotate every round so each advisor sees the plan from a new angle.
fn advisor_role(index: usize, round: u32) -> &'static str {
    ADVISOR_ROLES[(index + round as usize - 1) % ADVISOR_ROLES.len()]
}

fn average_readiness(reviews: &[Value]) -> f64 {
    if reviews.is_empty() {
        return 0.0;
    }
    let total: f64 = reviews
        .iter()
        .filter_map(|review| review.get("readiness_score").and_then(Value::as_f64))
        .sum();
    total / reviews.len() as f64
}

/// Every advisor is ready to pitch and the average readiness meets `threshold`.
fn converged(reviews: &[Value], threshold: f64) -> bool {
    !reviews.is_empty()
        && reviews
            .iter()
            .all(|review| review.get("ready_for_pitch").and_then(Value::as_bool) == Some(true))
        && average_readiness(reviews) >= threshold
}

fn write_plan(paths: &RunPaths, founder: &str, version: u32, plan: &Value) -> Result<()> {
    let record = StageOutputRecord::new(founder, version, plan.clone());
    write_jsonl_durable(&paths.plan_version_path(founder, version), &[record])?;
    Ok(())
}

/// Reload a done founder from its highest plan version and review files.
fn load_final_plan(paths: &RunPaths, founder: &str) -> Result<FinalPlan> {
    let version = paths
        .latest_plan_version(founder)?
        .ok_or_else(|| anyhow!("no plan file for {founder}"))?;
    let path = paths.plan_version_path(founder, version);
    let record = read_jsonl::<StageOutputRecord>(&path)?
        .into_iter()
        .find(|record| record.participant == founder)
        .ok_or_else(|| anyhow!("{} holds no record for {founder}", path.display()))?;
    Ok(FinalPlan {
        version,
        plan: record.payload,
        rounds: load_rounds(paths, founder)?,
    })
}

fn load_rounds(paths: &RunPaths, founder: &str) -> Result<Vec<Vec<Value>>> {
    paths
        .review_round_paths(founder)?
        .iter()
        .map(|path| {
            let records: Vec<StageOutputRecord> = read_jsonl(path)?;
            Ok(records.into_iter().map(|record| record.payload).collect())
        })
        .collect()
}
