//! Mock implementations of the pipeline seams.
//!
//! These mocks provide controllable test doubles for the LLM, subprocesses
//! and runtime staging, enabling deterministic cycle tests.

use crate::error::{QtcovError, Result};
use crate::llm::{LlmClient, ProviderKind};
use crate::process::{CommandRunner, CommandSpec, ProcessOutput};
use crate::remediation::RuntimeStager;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

type ErrorFactory = Arc<dyn Fn() -> QtcovError + Send + Sync>;

// ============================================================================
// LLM
// ============================================================================

/// Mock LLM client returning a fixed answer or error.
///
/// # Example
///
/// ```rust,ignore
/// let llm = MockLlmClient::new().with_response("```cpp\nvoid testA();\n```");
/// let text = llm.complete(None, "prompt").await?;
/// assert_eq!(llm.call_count(), 1);
/// ```
#[derive(Clone)]
pub struct MockLlmClient {
    response: String,
    error: Option<ErrorFactory>,
    provider: ProviderKind,
    prompts: Arc<Mutex<Vec<(Option<String>, String)>>>,
    call_count: Arc<AtomicU32>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            response: String::new(),
            error: None,
            provider: ProviderKind::OpenAi,
            prompts: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl MockLlmClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the answer text.
    #[must_use]
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Fail every call with the error built by `factory`.
    #[must_use]
    pub fn with_error<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> QtcovError + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(factory));
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// User prompt of the most recent call.
    pub fn last_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .ok()
            .and_then(|p| p.last().map(|(_, prompt)| prompt.clone()))
    }

    /// System prompt of the most recent call.
    pub fn last_system_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .ok()
            .and_then(|p| p.last().and_then(|(system, _)| system.clone()))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((system_prompt.map(str::to_string), prompt.to_string()));
        }
        match &self.error {
            Some(factory) => Err(factory()),
            None => Ok(self.response.clone()),
        }
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

// ============================================================================
// Subprocesses
// ============================================================================

/// One scripted answer of [`MockCommandRunner`].
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Process ran and produced this output
    Output(ProcessOutput),
    /// Process ran, wrote these files and produced this output
    OutputWithFiles(ProcessOutput, Vec<(PathBuf, String)>),
    /// Program could not be located
    ToolMissing,
    /// Deadline elapsed
    TimedOut,
}

/// Command runner answering from per-program queues.
///
/// Responses are keyed by [`CommandSpec::program_key`] and consumed in
/// order; an exhausted or unscripted program exits 0 with empty output.
/// Every invocation is recorded.
///
/// # Example
///
/// ```rust,ignore
/// let runner = MockCommandRunner::new()
///     .script("qmake", ScriptedResponse::Output(ProcessOutput::exited(2, "", "error")));
/// assert_eq!(runner.count("qmake"), 0);
/// ```
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl MockCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `response` for the program with key `program`.
    #[must_use]
    pub fn script(self, program: &str, response: ScriptedResponse) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(program.to_lowercase())
                .or_default()
                .push_back(response);
        }
        self
    }

    /// Display form of every recorded invocation, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Number of invocations of the program with key `program`.
    pub fn count(&self, program: &str) -> usize {
        let key = program.to_lowercase();
        self.calls
            .lock()
            .map(|c| c.iter().filter(|s| s.program_key() == key).count())
            .unwrap_or(0)
    }

    pub fn last_spec(&self) -> Option<CommandSpec> {
        self.calls.lock().ok().and_then(|c| c.last().cloned())
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&spec.program_key()).and_then(VecDeque::pop_front));

        match next {
            None => Ok(ProcessOutput::ok("")),
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::OutputWithFiles(output, files)) => {
                for (path, content) in files {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, content)?;
                }
                Ok(output)
            }
            Some(ScriptedResponse::ToolMissing) => Err(QtcovError::ToolNotFound {
                tool: spec.program.display().to_string(),
            }),
            Some(ScriptedResponse::TimedOut) => Err(QtcovError::timeout(
                spec.program.display().to_string(),
                spec.timeout.as_secs(),
            )),
        }
    }
}

// ============================================================================
// Runtime staging
// ============================================================================

/// Stager that counts calls and either succeeds or fails.
#[derive(Debug, Default)]
pub struct MockStager {
    fails: bool,
    calls: AtomicU32,
}

impl MockStager {
    /// Stager whose every call succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Stager whose every call fails with an environment error.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fails: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeStager for MockStager {
    async fn stage(&self, executable: &Path, failure: &QtcovError) -> Result<Vec<PathBuf>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(QtcovError::environment(
                executable.display().to_string(),
                "mock stager staged nothing",
                failure.missing_library().map(str::to_string),
            ));
        }
        let dir = executable.parent().unwrap_or(Path::new("."));
        Ok(vec![dir.join(failure.missing_library().unwrap_or("runtime"))])
    }
}
