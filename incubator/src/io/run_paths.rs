//! Canonical file layout of one pipeline run directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::types::Stage;

pub const CONFIG_FILE: &str = "incubator.toml";

/// Every file a run reads or writes, relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub events_path: PathBuf,
    pub config_snapshot_path: PathBuf,
    pub ideas_path: PathBuf,
    pub feedback_path: PathBuf,
    pub selections_path: PathBuf,
    pub final_plans_path: PathBuf,
    pub all_reviews_path: PathBuf,
    pub pitches_path: PathBuf,
    pub decisions_path: PathBuf,
    pub failure_ledger_path: PathBuf,
    pub report_path: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        let run_dir = run_dir.into();
        Self {
            checkpoint_path: run_dir.join("checkpoint.json"),
            events_path: run_dir.join("events.jsonl"),
            config_snapshot_path: run_dir.join(CONFIG_FILE),
            ideas_path: run_dir.join("stage1_ideas.jsonl"),
            feedback_path: run_dir.join("stage1_feedback.jsonl"),
            selections_path: run_dir.join("stage1_selections.jsonl"),
            final_plans_path: run_dir.join("stage2_final_plans.jsonl"),
            all_reviews_path: run_dir.join("stage2_all_reviews.jsonl"),
            pitches_path: run_dir.join("stage3_pitches.jsonl"),
            decisions_path: run_dir.join("stage3_decisions.jsonl"),
            failure_ledger_path: run_dir.join("failure_ledger.jsonl"),
            report_path: run_dir.join("portfolio_report.csv"),
            run_dir,
        }
    }

    /// Per-stage failure ledger, rewritten whenever the stage finishes.
    pub fn failures_path(&self, stage: Stage) -> PathBuf {
        self.run_dir.join(format!("{stage}_failures.jsonl"))
    }

    pub fn plan_version_path(&self, participant: &str, version: u32) -> PathBuf {
        self.run_dir
            .join(format!("stage2_{participant}_plan_v{version}.jsonl"))
    }

    pub fn review_round_path(&self, participant: &str, round: u32) -> PathBuf {
        self.run_dir
            .join(format!("stage2_{participant}_reviews_r{round}.jsonl"))
    }

    /// Highest plan version on disk for `participant`, compared numerically.
    pub fn latest_plan_version(&self, participant: &str) -> Result<Option<u32>> {
        let versions = self.numbered_files(&format!("stage2_{}_plan_v", regex::escape(participant)))?;
        Ok(versions.last().map(|(version, _)| *version))
    }

    /// Review round files for `participant`, in round order.
    pub fn review_round_paths(&self, participant: &str) -> Result<Vec<PathBuf>> {
        let rounds = self.numbered_files(&format!("stage2_{}_reviews_r", regex::escape(participant)))?;
        Ok(rounds.into_iter().map(|(_, path)| path).collect())
    }

    /// Every stage-2 plan and review file of `participant`.
    pub fn participant_files(&self, participant: &str) -> Result<Vec<PathBuf>> {
        let escaped = regex::escape(participant);
        let mut files: Vec<PathBuf> = self
            .numbered_files(&format!("stage2_{escaped}_plan_v"))?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        files.extend(self.review_round_paths(participant)?);
        Ok(files)
    }

    fn numbered_files(&self, escaped_prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
        if !self.run_dir.exists() {
            return Ok(Vec::new());
        }
        let pattern = Regex::new(&format!(r"^{escaped_prefix}(\d+)\.jsonl$"))
            .context("build numbered file pattern")?;
        let entries = fs::read_dir(&self.run_dir)
            .with_context(|| format!("read run directory {}", self.run_dir.display()))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", self.run_dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(number) = pattern
                .captures(name)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            else {
                continue;
            };
            found.push((number, entry.path()));
        }
        found.sort_by_key(|(number, _)| *number);
        Ok(found)
    }
}
