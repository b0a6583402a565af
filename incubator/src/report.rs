//! Portfolio report and failure ledger written at the end of a run.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::core::types::{FailureRecord, ParticipantId};
use crate::io::fsutil::write_atomic;
use crate::io::jsonl::write_jsonl_durable;
use crate::io::run_paths::RunPaths;
use crate::pipeline::FounderOutcome;

const HEADER: &str = "rank,participant,idea_id,invest,pass,avg_conviction,status,reason";

/// How a report row came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Founder pitched and was evaluated.
    Pitched,
    /// Founder dropped out before producing a pitch.
    Excluded,
    /// Non-founder participant (an investor evaluation) that failed.
    Failed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pitched => "pitched",
            EntryStatus::Excluded => "excluded",
            EntryStatus::Failed => "failed",
        }
    }
}

/// One line in the portfolio report.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioEntry {
    /// Set only for pitched founders.
    pub rank: Option<usize>,
    /// Founder name, or `investor@founder` for failed evaluations.
    pub participant: ParticipantId,
    pub status: EntryStatus,
    pub idea_id: Option<String>,
    pub invest: usize,
    pub pass: usize,
    pub average_conviction: Option<f64>,
    /// Failure reason from the ledger, `"<stage>: <reason>"`.
    pub reason: Option<String>,
}

impl PortfolioEntry {
    fn unranked(participant: &str, status: EntryStatus, reason: String) -> Self {
        Self {
            rank: None,
            participant: participant.to_string(),
            status,
            idea_id: None,
            invest: 0,
            pass: 0,
            average_conviction: None,
            reason: Some(reason),
        }
    }
}

/// Rank founders by investor count, then average conviction.
///
/// Founders without a stage-3 outcome follow the ranking with the first
/// failure recorded for them. Every other participant in the ledger gets a
/// `failed` row of its own, so no failure is missing from the report.
pub fn build_portfolio(
    founders: &[ParticipantId],
    results: &BTreeMap<ParticipantId, FounderOutcome>,
    ledger: &[FailureRecord],
) -> Vec<PortfolioEntry> {
    let mut ranked: Vec<PortfolioEntry> = results
        .iter()
        .map(|(founder, outcome)| {
            let invest = outcome.invest_count();
            PortfolioEntry {
                rank: None,
                participant: founder.clone(),
                status: EntryStatus::Pitched,
                idea_id: outcome
                    .pitch
                    .get("idea_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                invest,
                pass: outcome.decisions.len() - invest,
                average_conviction: outcome.average_conviction(),
                reason: None,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.invest
            .cmp(&a.invest)
            .then_with(|| {
                b.average_conviction
                    .unwrap_or(0.0)
                    .total_cmp(&a.average_conviction.unwrap_or(0.0))
            })
            .then_with(|| a.participant.cmp(&b.participant))
    });
    for (index, entry) in ranked.iter_mut().enumerate() {
        entry.rank = Some(index + 1);
    }

    for founder in founders.iter().filter(|f| !results.contains_key(*f)) {
        let reason = ledger
            .iter()
            .find(|failure| &failure.participant == founder)
            .map_or_else(|| "no result recorded".to_string(), describe);
        ranked.push(PortfolioEntry::unranked(founder, EntryStatus::Excluded, reason));
    }

    for failure in ledger.iter().filter(|f| !founders.contains(&f.participant)) {
        ranked.push(PortfolioEntry::unranked(
            &failure.participant,
            EntryStatus::Failed,
            describe(failure),
        ));
    }
    ranked
}

pub fn render_csv(entries: &[PortfolioEntry]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for entry in entries {
        let rank = entry.rank.map(|r| r.to_string()).unwrap_or_default();
        let conviction = entry
            .average_conviction
            .map(|c| format!("{c:.2}"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{rank},{},{},{},{},{conviction},{},{}",
            csv_field(&entry.participant),
            csv_field(entry.idea_id.as_deref().unwrap_or("")),
            entry.invest,
            entry.pass,
            entry.status.as_str(),
            csv_field(entry.reason.as_deref().unwrap_or("")),
        );
    }
    out
}

fn describe(failure: &FailureRecord) -> String {
    format!("{}: {}", failure.stage, failure.reason)
}

/// Write `portfolio_report.csv` and `failure_ledger.jsonl`.
pub fn write_report(
    paths: &RunPaths,
    founders: &[ParticipantId],
    results: &BTreeMap<ParticipantId, FounderOutcome>,
    ledger: &[FailureRecord],
) -> Result<Vec<PortfolioEntry>> {
    let entries = build_portfolio(founders, results, ledger);
    write_atomic(&paths.report_path, render_csv(&entries).as_bytes())?;
    write_jsonl_durable(&paths.failure_ledger_path, ledger)?;
    info!(
        report = %paths.report_path.display(),
        ranked = results.len(),
        unranked = entries.len() - results.len(),
        "wrote portfolio report"
    );
    Ok(entries)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Stage;
    use serde_json::json;

    fn outcome(idea: &str, decisions: &[(&str, &str, i64)]) -> FounderOutcome {
        FounderOutcome {
            pitch: json!({"idea_id": idea}),
            decisions: decisions
                .iter()
                .map(|(investor, decision, score)| {
                    (
                        investor.to_string(),
                        json!({"decision": decision, "conviction_score": score}),
                    )
                })
                .collect(),
        }
    }

    fn failure(participant: &str, stage: Stage, reason: &str) -> FailureRecord {
        FailureRecord {
            participant: participant.to_string(),
            stage,
            reason: reason.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn ranks_by_invest_count_then_conviction() {
        let results = BTreeMap::from([
            ("a".to_string(), outcome("a-1", &[("b", "invest", 6), ("c", "pass", 2)])),
            ("b".to_string(), outcome("b-1", &[("a", "invest", 9), ("c", "pass", 5)])),
            ("c".to_string(), outcome("c-1", &[("a", "invest", 7), ("b", "invest", 7)])),
        ]);
        let founders: Vec<String> = ["a", "b", "c"].map(String::from).to_vec();
        let entries = build_portfolio(&founders, &results, &[]);
        let order: Vec<&str> = entries.iter().map(|e| e.participant.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(entries[0].rank, Some(1));
        assert_eq!(entries[2].pass, 1);
    }

    #[test]
    fn excluded_founders_carry_their_failure_reason() {
        let results = BTreeMap::from([("a".to_string(), outcome("a-1", &[("b", "invest", 7)]))]);
        let ledger = vec![failure("b", Stage::Stage2, "timed out, twice")];
        let founders = vec!["a".to_string(), "b".to_string()];
        let entries = build_portfolio(&founders, &results, &ledger);
        assert_eq!(entries[1].status, EntryStatus::Excluded);
        assert_eq!(entries[1].reason.as_deref(), Some("stage2: timed out, twice"));

        let csv = render_csv(&entries);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "1,a,a-1,1,0,7.00,pitched,");
        assert_eq!(lines[2], ",b,,0,0,,excluded,\"stage2: timed out, twice\"");
    }

    #[test]
    fn failed_evaluations_get_their_own_rows() {
        let results = BTreeMap::from([
            ("a".to_string(), outcome("a-1", &[("c", "invest", 7)])),
            ("b".to_string(), outcome("b-1", &[("c", "pass", 4)])),
        ]);
        let ledger = vec![
            failure("c@a", Stage::Stage3, "provider timeout"),
            failure("c@b", Stage::Stage3, "provider timeout"),
        ];
        let founders = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let entries = build_portfolio(&founders, &results, &ledger);

        let failed: Vec<&str> = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .map(|e| e.participant.as_str())
            .collect();
        assert_eq!(failed, vec!["c@a", "c@b"]);
        let csv = render_csv(&entries);
        assert!(csv.contains(",c@a,,0,0,,failed,stage3: provider timeout"));
        // c pitched nothing and has no ledger entry of its own.
        assert!(csv.contains(",c,,0,0,,excluded,no result recorded"));
    }
}
