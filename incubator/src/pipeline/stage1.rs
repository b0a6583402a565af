//! Stage 1: every founder proposes ideas, peers review them, the founder
//! selects and refines one.

use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow};
use minijinja::context;
use serde_json::{Value, json};
use tracing::{info, instrument};

use super::{PipelineContext, Request, StageResult, failed_ids, load_failures, load_records};
use crate::core::schema::SchemaKind;
use crate::core::types::{ParticipantId, Stage, StageOutputRecord};
use crate::io::checkpoint::Backing;
use crate::io::jsonl::write_jsonl_durable;
use crate::io::prompt::{TaskKind, json_block};
use crate::pool::{Task, run_all};
use crate::stage_exec::ParticipantTask;

const STAGE: Stage = Stage::Stage1;

/// Everything one founder produced in stage 1.
#[derive(Debug, Clone)]
struct FounderIdeas {
    ideas: Vec<Value>,
    feedback: Vec<Value>,
    selection: Value,
}

/// Run stage 1, or restore it from a verified checkpoint.
///
/// Results map each founder to its validated selection.
#[instrument(skip_all, fields(stage = %STAGE))]
pub fn run(ctx: &PipelineContext<'_>) -> Result<StageResult<Value>> {
    let founders: BTreeSet<ParticipantId> = ctx.founders().into_iter().collect();
    let stored_failures = load_failures(ctx.paths, STAGE)?;
    let expected: BTreeSet<ParticipantId> = founders
        .difference(&failed_ids(&stored_failures))
        .cloned()
        .collect();
    let backing = [Backing {
        path: &ctx.paths.selections_path,
        expected: &expected,
    }];
    if ctx.trusted(STAGE, &backing)? {
        let results = load_records(&ctx.paths.selections_path)?
            .into_iter()
            .map(|(participant, record)| (participant, record.payload))
            .collect();
        info!(founders = expected.len(), "restored stage 1 from checkpoint");
        return Ok(StageResult {
            results,
            failures: stored_failures,
            restored: true,
        });
    }

    let tasks: Vec<ParticipantTask<'_, FounderIdeas>> = ctx
        .founders()
        .into_iter()
        .map(|founder| {
            let id = founder.clone();
            ParticipantTask::new(id, move || ideate(ctx, &founder))
        })
        .collect();
    let outcome = ctx.executor(STAGE).execute(tasks, |founder, produced| {
        ctx.step_complete(
            STAGE,
            founder,
            format!("{founder} selected {}", selected_id(&produced.selection)),
            json!({"ideas": produced.ideas.len(), "feedback": produced.feedback.len()}),
        );
        Ok(())
    })?;

    let failures_file = write_jsonl_durable(&ctx.paths.failures_path(STAGE), &outcome.failures)?;
    if outcome.successes.is_empty() {
        return Err(ctx.stage_failed(STAGE, "every founder failed".to_string(), outcome.failures));
    }

    let mut ideas = Vec::new();
    let mut feedback = Vec::new();
    let mut selections = Vec::new();
    for (founder, produced) in &outcome.successes {
        ideas.extend(
            produced
                .ideas
                .iter()
                .map(|idea| StageOutputRecord::new(founder.as_str(), 0, idea.clone())),
        );
        feedback.extend(
            produced
                .feedback
                .iter()
                .map(|review| StageOutputRecord::new(founder.as_str(), 0, review.clone())),
        );
        selections.push(StageOutputRecord::new(founder.as_str(), 0, produced.selection.clone()));
    }
    let files = [
        write_jsonl_durable(&ctx.paths.ideas_path, &ideas)?,
        write_jsonl_durable(&ctx.paths.feedback_path, &feedback)?,
        write_jsonl_durable(&ctx.paths.selections_path, &selections)?,
        failures_file,
    ];
    ctx.store.record_stage_complete(STAGE, &files)?;

    Ok(StageResult {
        results: outcome
            .successes
            .into_iter()
            .map(|(founder, produced)| (founder, produced.selection))
            .collect(),
        failures: outcome.failures,
        restored: false,
    })
}

fn ideate(ctx: &PipelineContext<'_>, founder: &str) -> Result<FounderIdeas> {
    let provider = ctx.provider(founder)?;
    let batch = ctx.call(
        provider,
        Request {
            stage: STAGE,
            participant: founder,
            label: "ideas",
            task: TaskKind::Ideas,
            schema: SchemaKind::IdeaBatch,
        },
        context! {
            provider => founder,
            count => ctx.config.ideas_per_provider,
            sector_focus => ctx.config.sector_focus.as_deref(),
        },
    )?;
    let ideas = match batch.get("ideas") {
        Some(Value::Array(ideas)) => ideas.clone(),
        _ => return Err(anyhow!("idea batch from {founder} has no ideas array")),
    };

    let reviewers = ctx.others(founder);
    let mut jobs: Vec<Task<'_, Value>> = Vec::new();
    for idea in &ideas {
        for reviewer in &reviewers {
            let reviewer = *reviewer;
            jobs.push(Box::new(move || {
                let label = format!("feedback:{}", reviewer.name());
                ctx.call(
                    reviewer,
                    Request {
                        stage: STAGE,
                        participant: founder,
                        label: &label,
                        task: TaskKind::Feedback,
                        schema: SchemaKind::Feedback,
                    },
                    context! { reviewer => reviewer.name(), idea => json_block(idea) },
                )
            }));
        }
    }
    let feedback = run_all(jobs, ctx.config.concurrency)
        .into_iter()
        .collect::<Result<Vec<Value>>>()
        .with_context(|| format!("collect feedback on {founder}'s ideas"))?;

    let reviewed: Vec<Value> = ideas
        .iter()
        .map(|idea| {
            let id = idea.get("idea_id").cloned().unwrap_or(Value::Null);
            let notes: Vec<&Value> = feedback.iter().filter(|f| f.get("idea_id") == Some(&id)).collect();
            json!({"idea": idea, "feedback": notes})
        })
        .collect();
    let selection = ctx.call(
        provider,
        Request {
            stage: STAGE,
            participant: founder,
            label: "select",
            task: TaskKind::Select,
            schema: SchemaKind::Selection,
        },
        context! { founder => founder, ideas => json_block(&Value::Array(reviewed)) },
    )?;

    Ok(FounderIdeas {
        ideas,
        feedback,
        selection,
    })
}

pub(crate) fn selected_id(selection: &Value) -> &str {
    selection
        .get("selected_idea_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}
