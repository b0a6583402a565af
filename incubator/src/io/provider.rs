//! Model providers.
//!
//! The [`Provider`] trait decouples the pipeline from the model backend.
//! [`MockProvider`] returns deterministic, schema-valid output for dry runs;
//! [`CommandProvider`] pipes each prompt to an external program (any CLI
//! that reads a prompt on stdin and prints the model reply on stdout).

use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::config::{PipelineConfig, ProviderConfig, ProviderKind};
use super::process::run_command_with_timeout;
use super::prompt::TaskKind;

const OUTPUT_LIMIT_BYTES: usize = 2_000_000;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

static TASK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Task:\s*(\w+)\s*$").expect("task pattern should be valid"));
static COUNT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Count:\s*(\d+)\s*$").expect("count pattern should be valid"));
static ROLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Role:\s*(\w+)\s*$").expect("role pattern should be valid"));
static IDEA_ID_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""idea_id"\s*:\s*"([^"]*)""#).expect("idea id pattern should be valid")
});

/// A text-generation backend.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the endpoint guarantees well-formed JSON output.
    fn natively_structured(&self) -> bool {
        false
    }

    /// Generate a reply. Transient failures are retried inside the provider.
    fn generate(&self, prompt: &str, system: &str) -> Result<String>;
}

/// Build one provider per configured entry. `force_mock` replaces every
/// backend with a [`MockProvider`] of the same name.
pub fn build_providers(config: &PipelineConfig, force_mock: bool) -> Result<Vec<Arc<dyn Provider>>> {
    config
        .providers
        .iter()
        .map(|provider| -> Result<Arc<dyn Provider>> {
            if force_mock || provider.kind == ProviderKind::Mock {
                return Ok(Arc::new(MockProvider::new(&provider.name)));
            }
            Ok(Arc::new(CommandProvider::from_config(provider)?))
        })
        .collect()
}

/// Deterministic provider that recognizes the task from the prompt header.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn title(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    fn default_idea_id(&self) -> String {
        format!("{}-idea-1", self.name)
    }

    fn ideas(&self, count: usize) -> Value {
        const VERTICALS: [&str; 5] = ["healthcare", "fintech", "devtools", "logistics", "education"];
        let ideas: Vec<Value> = (0..count)
            .map(|i| {
                let vertical = VERTICALS[i % VERTICALS.len()];
                json!({
                    "idea_id": format!("{}-idea-{}", self.name, i + 1),
                    "title": format!("{} Startup {}", self.title(), i + 1),
                    "summary": format!(
                        "A startup in {vertical} that removes a costly manual workflow for \
                         mid-market companies and delivers a 10x improvement over incumbents."
                    ),
                    "target_customer": format!("Mid-market {vertical} companies with 50-500 employees"),
                    "why_now": "Recent advances in AI and regulatory changes open a new market window.",
                    "market_size_estimate": "$5B TAM based on industry reports for the broader category.",
                    "unfair_advantage": "Proprietary dataset and deep domain expertise in the founding team.",
                    "proposer_provider": self.name,
                })
            })
            .collect();
        json!({ "ideas": ideas })
    }

    fn feedback(&self, idea_id: &str) -> Value {
        json!({
            "idea_id": idea_id,
            "reviewer_provider": self.name,
            "score": 7.5,
            "top_strength": "Clear target customer and well-defined pain point.",
            "top_weakness": "Market size estimate lacks supporting reasoning.",
            "suggestion": "Narrow the initial target to a specific sub-segment for faster validation.",
        })
    }

    fn selection(&self) -> Value {
        let idea_id = self.default_idea_id();
        json!({
            "selected_idea_id": idea_id,
            "founder_provider": self.name,
            "reasoning": "Idea 1 received the highest average feedback score and reviewers agreed the timing is strong.",
            "refined_idea": {
                "idea_id": idea_id,
                "title": format!("{} Startup 1 (Refined)", self.title()),
                "summary": "A refined idea targeting healthcare clinics, narrowed to the first 100 customers.",
                "target_customer": "Mid-market healthcare clinics with 10-50 practitioners",
                "why_now": "Interoperability mandates and AI capabilities converge to create an opening.",
                "market_size_estimate": "$2B SAM within a $12B healthcare IT TAM.",
                "unfair_advantage": "Proprietary clinical workflow dataset from pilot partnerships.",
                "proposer_provider": self.name,
            }
        })
    }

    fn startup_plan(&self, idea_id: &str) -> Value {
        json!({
            "idea_id": idea_id,
            "founder_provider": self.name,
            "problem": "Clinics with 10-50 practitioners lose 15-20 hours a week reconciling schedules, pre-authorizations and patient messages across disconnected systems.",
            "solution": "An AI coordination layer on top of existing EHR, scheduling and billing systems that automates the predictable 80% of that work.",
            "market": {
                "tam": "$12B healthcare administrative automation",
                "sam": "$2B US mid-market clinics",
                "som": "$50M from 500 clinics at $100K ARR",
                "growth_rate": "18% CAGR",
                "reasoning": "35,000 eligible US clinics at a $100K average contract value.",
            },
            "business_model": {
                "revenue_model": "SaaS subscription priced per practitioner",
                "pricing": "$200/practitioner/month",
                "unit_economics": "LTV $288K, CAC $30K, LTV/CAC 9.6x",
            },
            "go_to_market": "Five pilot clinics from the advisor network, case studies, then medical association partnerships and EHR channel deals.",
            "competitive_landscape": [
                {
                    "competitor": "Athenahealth",
                    "strength": "Large installed base",
                    "weakness": "Slow to ship AI features",
                    "our_advantage": "Integrates with any EHR instead of replacing it",
                },
                {
                    "competitor": "Olive AI",
                    "strength": "Well-funded AI team",
                    "weakness": "Focused on large health systems",
                    "our_advantage": "Built for clinic scale",
                },
                {
                    "competitor": "Spreadsheets",
                    "strength": "Zero switching cost",
                    "weakness": "Error-prone and does not scale",
                    "our_advantage": "Measurable ROI in the first month",
                },
            ],
            "risks_and_mitigations": [
                {
                    "risk": "EHR integration complexity",
                    "severity": "high",
                    "mitigation": "Start with the top 3 EHRs covering 60% of the market",
                },
                {
                    "risk": "HIPAA compliance",
                    "severity": "critical",
                    "mitigation": "SOC2 and HIPAA from day one",
                },
            ],
            "twelve_month_roadmap": "Months 1-3 MVP with pilots; months 4-6 two ROI case studies; months 7-12 fifty paying clinics and $200K ARR.",
            "funding_ask": {
                "amount": "$1.5M seed",
                "use_of_funds": "4 engineers, 2 sales, 18 months runway",
                "target_metrics": "$200K ARR, 50 clinics, 90% retention",
                "proposed_valuation": "$8M pre-money",
            },
            "changelog": [],
        })
    }

    fn advisor_review(&self, idea_id: &str, role: &str) -> Value {
        json!({
            "idea_id": idea_id,
            "reviewer_provider": self.name,
            "advisor_role": role,
            "readiness_score": 7,
            "issues": [
                "Unit economics assume 3-year retention without supporting data.",
                "Competitive analysis misses newer AI-native entrants.",
            ],
            "strength": "Clear problem quantification and realistic market sizing.",
            "ready_for_pitch": true,
        })
    }

    fn pitch(&self, idea_id: &str) -> Value {
        json!({
            "idea_id": idea_id,
            "founder_provider": self.name,
            "elevator_pitch": "Clinics waste $150K a year on coordination; our AI layer automates 80% of it.",
            "problem_solution_fit": "Every mid-market clinic juggles 3-5 systems; we turn a 20-hour weekly burden into a 2-hour review.",
            "traction_validation": "5 pilot clinics, 2 LOIs, 35 clinics on the waitlist.",
            "team_requirements": "CTO with healthcare data background, head of sales from med-tech.",
            "the_ask": "$1.5M seed for 18 months of runway.",
            "why_now": "Interoperability mandates force clinics to open their data.",
            "five_year_vision": "The coordination OS for healthcare, $100M ARR across 5,000 facilities.",
        })
    }

    fn investor_decision(&self, idea_id: &str) -> Value {
        json!({
            "idea_id": idea_id,
            "investor_provider": self.name,
            "decision": "invest",
            "conviction_score": 7,
            "rationale": "Quantified pain point and favorable timing; EHR integrations are the main execution risk.",
            "proposed_terms": {
                "check_size": "$750K",
                "valuation_range": "$6M-8M pre-money",
                "key_conditions": "Two paying pilots before close",
            },
            "would_change_mind": "Pilot retention data and a signed EHR partnership.",
        })
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, prompt: &str, _system: &str) -> Result<String> {
        let task = TASK_LINE
            .captures(prompt)
            .and_then(|caps| caps.get(1))
            .and_then(|m| TaskKind::parse(m.as_str()));
        let idea_id = || {
            IDEA_ID_FIELD
                .captures(prompt)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| self.default_idea_id())
        };
        let value = match task {
            Some(TaskKind::Ideas) => {
                let count = COUNT_LINE
                    .captures(prompt)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .unwrap_or(5);
                self.ideas(count.max(1))
            }
            Some(TaskKind::Feedback) => self.feedback(&idea_id()),
            Some(TaskKind::Select) => self.selection(),
            Some(TaskKind::Build) | Some(TaskKind::Iterate) => self.startup_plan(&idea_id()),
            Some(TaskKind::AdvisorReview) => {
                let role = ROLE_LINE
                    .captures(prompt)
                    .and_then(|caps| caps.get(1))
                    .map_or("market_strategist", |m| m.as_str());
                self.advisor_review(&idea_id(), role)
            }
            Some(TaskKind::Pitch) => self.pitch(&idea_id()),
            Some(TaskKind::InvestorEval) => self.investor_decision(&idea_id()),
            None => json!({"message": "mock output", "provider": self.name}),
        };
        debug!(provider = %self.name, task = ?task, "mock response");
        Ok(serde_json::to_string_pretty(&value)?)
    }
}

/// Provider backed by an external program.
///
/// The system prompt and prompt are written to the program's stdin,
/// separated by a blank line; stdout is the reply. Non-zero exits, timeouts
/// and empty replies are retried with exponential backoff.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    argv: Vec<String>,
    timeout: Duration,
    max_attempts: u32,
    native_json: bool,
    backoff_base: Duration,
}

impl CommandProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            argv: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts,
            native_json: config.native_json,
            backoff_base: BACKOFF_BASE,
        })
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    fn attempt(&self, input: &[u8]) -> Result<String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("provider {} has no command", self.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, Some(input), self.timeout, OUTPUT_LIMIT_BYTES)?;
        if output.timed_out {
            bail!("timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!(
                "exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(5)
            );
        }
        let text = output.stdout_text();
        if text.trim().is_empty() {
            bail!("produced no output");
        }
        Ok(text)
    }
}

impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn natively_structured(&self) -> bool {
        self.native_json
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    fn generate(&self, prompt: &str, system: &str) -> Result<String> {
        let input = if system.trim().is_empty() {
            prompt.to_string()
        } else {
            format!("{system}\n\n{prompt}")
        };
        let mut backoff = self.backoff_base.min(BACKOFF_MAX);
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.attempt(input.as_bytes()) {
                Ok(text) => {
                    debug!(attempt, bytes = text.len(), "provider replied");
                    return Ok(text);
                }
                Err(err) => {
                    warn!(attempt, max_attempts = self.max_attempts, err = %format!("{err:#}"), "provider call failed");
                    last_error = Some(err);
                    if attempt < self.max_attempts {
                        thread::sleep(backoff);
                        backoff = next_backoff(backoff);
                    }
                }
            }
        }
        let last = last_error.map_or_else(|| "no attempts made".to_string(), |err| format!("{err:#}"));
        Err(anyhow!(
            "{} request failed after {} attempts: {last}",
            self.name,
            self.max_attempts
        ))
    }
}

/// Double `current`, capped at [`BACKOFF_MAX`].
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extract::extract_json;
    use crate::core::normalize::NormalizeOptions;
    use crate::core::schema::SchemaKind;
    use crate::core::validate::{SchemaRegistry, validate};

    fn mock_reply(prompt: &str) -> Value {
        let raw = MockProvider::new("gemini").generate(prompt, "").expect("generate");
        extract_json(&raw).expect("json")
    }

    #[test]
    fn mock_output_matches_every_schema() {
        let registry = SchemaRegistry::builtin(NormalizeOptions::default()).expect("registry");
        let cases = [
            ("Task: ideas\nCount: 3", SchemaKind::IdeaBatch),
            ("Task: feedback\n{\"idea_id\": \"oa-2\"}", SchemaKind::Feedback),
            ("Task: select", SchemaKind::Selection),
            ("Task: build", SchemaKind::StartupPlan),
            ("Task: iterate", SchemaKind::StartupPlan),
            ("Task: advisor_review\nRole: financial_advisor", SchemaKind::AdvisorReview),
            ("Task: pitch", SchemaKind::Pitch),
            ("Task: investor_eval", SchemaKind::InvestorDecision),
        ];
        for (prompt, kind) in cases {
            let value = mock_reply(prompt);
            validate(value, registry.get(kind))
                .unwrap_or_else(|err| panic!("{prompt:?} did not match {kind:?}: {err}"));
        }
    }

    #[test]
    fn mock_echoes_idea_id_role_and_count() {
        let ideas = mock_reply("Task: ideas\nCount: 2");
        assert_eq!(ideas["ideas"].as_array().expect("ideas").len(), 2);
        assert_eq!(ideas["ideas"][1]["idea_id"], "gemini-idea-2");

        let review = mock_reply("Task: advisor_review\nRole: technical_advisor\n{\"idea_id\": \"oa-9\"}");
        assert_eq!(review["advisor_role"], "technical_advisor");
        assert_eq!(review["idea_id"], "oa-9");
    }

    #[cfg(unix)]
    #[test]
    fn command_provider_pipes_prompt_through_program() {
        let provider = CommandProvider::from_config(&ProviderConfig {
            name: "echo".to_string(),
            kind: ProviderKind::Command,
            command: vec!["cat".to_string()],
            ..ProviderConfig::default()
        })
        .expect("provider");
        let reply = provider.generate("{\"ok\": true}", "system").expect("generate");
        assert_eq!(reply, "system\n\n{\"ok\": true}");
    }

    #[cfg(unix)]
    #[test]
    fn command_provider_retries_then_reports_last_error() {
        let provider = CommandProvider::from_config(&ProviderConfig {
            name: "broken".to_string(),
            kind: ProviderKind::Command,
            command: vec!["sh".to_string(), "-c".to_string(), "echo overloaded >&2; exit 7".to_string()],
            max_attempts: 2,
            ..ProviderConfig::default()
        })
        .expect("provider")
        .with_backoff_base(Duration::from_millis(1));
        let err = provider.generate("prompt", "").expect_err("fails");
        let message = format!("{err:#}");
        assert!(message.contains("after 2 attempts"));
        assert!(message.contains("overloaded"));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(20)), BACKOFF_MAX);
        assert_eq!(next_backoff(Duration::MAX), BACKOFF_MAX);
    }

    #[test]
    fn build_providers_honors_force_mock() {
        let config = PipelineConfig {
            providers: vec![
                ProviderConfig {
                    name: "local".to_string(),
                    kind: ProviderKind::Command,
                    command: vec!["llm".to_string()],
                    ..ProviderConfig::default()
                },
                ProviderConfig::mock("b"),
            ],
            ..PipelineConfig::default()
        };
        let providers = build_providers(&config, true).expect("build");
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["local", "b"]);
        assert!(providers.iter().all(|p| !p.natively_structured()));
    }
}
