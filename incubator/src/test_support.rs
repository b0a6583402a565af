//! Test doubles for providers and event sinks.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::io::config::{PipelineConfig, ProviderConfig};
use crate::io::events::{EventSink, PipelineEvent};
use crate::io::prompt::TaskKind;
use crate::io::provider::{MockProvider, Provider};

/// Replies with a fixed script of responses, one per call.
pub struct ScriptedProvider {
    name: String,
    native: bool,
    script: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<Result<String, String>>) -> Self {
        Self {
            name: name.to_string(),
            native: false,
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn natively_structured(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn natively_structured(&self) -> bool {
        self.native
    }

    fn generate(&self, prompt: &str, _system: &str) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("{} script exhausted", self.name)),
        }
    }
}

/// A [`MockProvider`] that fails (or panics) on selected tasks and records
/// every task it is asked to perform.
pub struct FlakyProvider {
    inner: MockProvider,
    fail_on: BTreeSet<&'static str>,
    panic_on: BTreeSet<&'static str>,
    message: String,
    seen: Mutex<Vec<TaskKind>>,
}

impl FlakyProvider {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MockProvider::new(name),
            fail_on: BTreeSet::new(),
            panic_on: BTreeSet::new(),
            message: "provider timeout: slow".to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_on(mut self, task: TaskKind) -> Self {
        self.fail_on.insert(task.as_str());
        self
    }

    pub fn panic_on(mut self, task: TaskKind) -> Self {
        self.panic_on.insert(task.as_str());
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    /// Tasks requested so far, in call order.
    pub fn tasks(&self) -> Vec<TaskKind> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self, task: TaskKind) -> usize {
        self.tasks().into_iter().filter(|t| *t == task).count()
    }
}

impl Provider for FlakyProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate(&self, prompt: &str, system: &str) -> Result<String> {
        let task = prompt
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("Task: "))
            .and_then(TaskKind::parse);
        if let Some(task) = task {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(task);
            }
            if self.panic_on.contains(task.as_str()) {
                panic!("{} crashed during {task}", self.name());
            }
            if self.fail_on.contains(task.as_str()) {
                return Err(anyhow!("{}", self.message));
            }
        }
        self.inner.generate(prompt, system)
    }
}

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Config with mock providers named `names`, writing runs under `out_dir`.
pub fn mock_config(out_dir: &Path, names: &[&str]) -> PipelineConfig {
    PipelineConfig {
        concurrency: 2,
        ideas_per_provider: 2,
        out_dir: out_dir.to_path_buf(),
        providers: names.iter().map(|name| ProviderConfig::mock(name)).collect(),
        ..PipelineConfig::default()
    }
}

pub fn mock_providers(names: &[&str]) -> Vec<Arc<dyn Provider>> {
    names
        .iter()
        .map(|name| Arc::new(MockProvider::new(name)) as Arc<dyn Provider>)
        .collect()
}
