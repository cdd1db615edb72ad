//! Configuration for qtcov.
//!
//! All recognized options live in [`QtcovConfig`], which is built once at the
//! CLI edge and then handed to the orchestrator. Sources are layered in this
//! order, later ones winning:
//!
//! 1. built-in defaults,
//! 2. an optional `qtcov.toml` in the project root,
//! 3. environment values, read through a lookup function (the CLI passes
//!    `std::env::var` after loading `.env`),
//! 4. CLI flags applied by the caller.

use crate::error::{QtcovError, Result};
use crate::parser::TestFramework;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the optional project configuration file.
pub const CONFIG_FILE_NAME: &str = "qtcov.toml";

/// Default directories skipped when searching the project tree for sources.
pub fn default_exclude_dirs() -> Vec<String> {
    [
        ".git",
        ".svn",
        "build",
        "debug",
        "release",
        "googletest",
        "gtest",
        "3rdparty",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Source and header extensions that reconciliation is allowed to copy.
pub mod extensions {
    /// C and C++ translation units and headers
    pub const SOURCES: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx"];
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QtcovConfig {
    /// Opt-in switch for the automation path
    pub automation: AutomationConfig,
    /// Project-relative locations
    pub paths: PathsConfig,
    /// LLM provider settings
    pub llm: LlmConfig,
    /// Source context injected into prompts
    pub context: ContextLimits,
    /// qmake/make settings
    pub toolchain: ToolchainConfig,
    /// Test executable settings
    pub tests: TestRunConfig,
    /// gcovr settings
    pub coverage: CoverageConfig,
}

/// Opt-in switch. Everything that talks to an LLM or a toolchain is refused
/// while `enabled` is false.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub enabled: bool,
}

/// Locations, relative to the project root unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub prompts_file: PathBuf,
    pub generated_dir: PathBuf,
    pub project_file: PathBuf,
    pub object_dir: PathBuf,
    pub coverage_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// Explicit test executable; discovered under `generated_dir` when unset
    pub test_executable: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prompts_file: PathBuf::from("llm_prompts.json"),
            generated_dir: PathBuf::from("tests/generated"),
            project_file: PathBuf::from("tests/generated/tests.pro"),
            object_dir: PathBuf::from("tests/generated/debug"),
            coverage_dir: PathBuf::from("coverage"),
            reports_dir: PathBuf::from("reports"),
            test_executable: None,
        }
    }
}

impl PathsConfig {
    /// Resolve a configured path against the project root.
    pub fn resolve(root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }
}

/// LLM provider settings for both supported wire protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    /// Claude-compatible endpoint
    pub anthropic_base_url: String,
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub system_prompt: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            anthropic_api_key: None,
            anthropic_model: "claude-3-5-sonnet-latest".to_string(),
            system_prompt: None,
            timeout_secs: 300,
            max_tokens: 8000,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bounds on the source context injected into a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextLimits {
    pub max_files: usize,
    pub max_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_files: 12,
            max_chars: 60_000,
        }
    }
}

/// Build toolchain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub qmake: PathBuf,
    pub make: PathBuf,
    /// Extra arguments for the configure step
    pub extra_flags: Vec<String>,
    /// Extra arguments for the build step (e.g. `-j4`)
    pub make_flags: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let make = if cfg!(windows) { "mingw32-make" } else { "make" };
        Self {
            qmake: PathBuf::from("qmake"),
            make: PathBuf::from(make),
            extra_flags: vec![
                "CONFIG+=debug".to_string(),
                "QMAKE_CXXFLAGS+=--coverage".to_string(),
                "QMAKE_LFLAGS+=--coverage".to_string(),
            ],
            make_flags: Vec::new(),
            timeout_secs: 600,
        }
    }
}

impl ToolchainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Test executable settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRunConfig {
    pub framework: TestFramework,
    /// Summary regex with `passed` and `failed` named groups
    pub summary_pattern: Option<String>,
    pub timeout_secs: u64,
    /// Directories holding runtime libraries (Qt bin, MinGW bin)
    pub runtime_dirs: Vec<PathBuf>,
    /// Deployment tool run when a missing library cannot be staged directly
    pub deploy_tool: Option<PathBuf>,
}

impl Default for TestRunConfig {
    fn default() -> Self {
        Self {
            framework: TestFramework::QtTest,
            summary_pattern: None,
            timeout_secs: 120,
            runtime_dirs: Vec::new(),
            deploy_tool: None,
        }
    }
}

impl TestRunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Coverage aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Command override, split on whitespace (e.g. `python -m gcovr`)
    pub command: Option<String>,
    pub gcov: Option<PathBuf>,
    pub exclude_dirs: Vec<String>,
    pub extensions: Vec<String>,
    pub html: bool,
    pub json: bool,
    pub csv: bool,
    pub extra_args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            command: None,
            gcov: None,
            exclude_dirs: default_exclude_dirs(),
            extensions: extensions::SOURCES.iter().map(|s| s.to_string()).collect(),
            html: true,
            json: true,
            csv: true,
            extra_args: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl CoverageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl QtcovConfig {
    /// Path of the optional project configuration file.
    pub fn config_path(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_FILE_NAME)
    }

    /// Load defaults, `qtcov.toml` and environment values, then validate.
    pub fn load<F>(project_root: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = Self::config_path(project_root);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<QtcovConfig>(&content).map_err(|e| {
                QtcovError::config_with_path(
                    format!("{} is not valid TOML: {}", path.display(), e),
                    path.clone(),
                )
            })?
        } else {
            Self::default()
        };

        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values found through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("QTCOV_ENABLE_AUTOMATION") {
            self.automation.enabled = parse_bool("QTCOV_ENABLE_AUTOMATION", &v)?;
        }

        if let Some(v) = get("QTCOV_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("QTCOV_LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("QTCOV_LLM_MODEL").or_else(|| get("OPENAI_MODEL")) {
            self.llm.model = v;
        }
        if let Some(v) = get("QTCOV_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_number("QTCOV_LLM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("QTCOV_LLM_SYSTEM_PROMPT") {
            self.llm.system_prompt = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_MODEL") {
            self.llm.anthropic_model = v;
        }
        if let Some(v) = get("ANTHROPIC_BASE_URL") {
            self.llm.anthropic_base_url = v;
        }

        if let Some(v) = get("QTCOV_CONTEXT_MAX_FILES") {
            self.context.max_files = parse_number("QTCOV_CONTEXT_MAX_FILES", &v)?;
        }
        if let Some(v) = get("QTCOV_CONTEXT_MAX_CHARS") {
            self.context.max_chars = parse_number("QTCOV_CONTEXT_MAX_CHARS", &v)?;
        }

        if let Some(v) = get("QTCOV_QMAKE") {
            self.toolchain.qmake = PathBuf::from(v);
        }
        if let Some(v) = get("QTCOV_MAKE") {
            self.toolchain.make = PathBuf::from(v);
        }
        if let Some(v) = get("QTCOV_BUILD_TIMEOUT_SECS") {
            self.toolchain.timeout_secs = parse_number("QTCOV_BUILD_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("QTCOV_TEST_EXECUTABLE") {
            self.paths.test_executable = Some(PathBuf::from(v));
        }
        if let Some(v) = get("QTCOV_TEST_TIMEOUT_SECS") {
            self.tests.timeout_secs = parse_number("QTCOV_TEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("QTCOV_DEPLOY_TOOL") {
            self.tests.deploy_tool = Some(PathBuf::from(v));
        }
        for key in ["QT_BIN_PATH", "MINGW_BIN_PATH"] {
            if let Some(v) = get(key) {
                let dir = PathBuf::from(v);
                if !self.tests.runtime_dirs.contains(&dir) {
                    self.tests.runtime_dirs.push(dir);
                }
            }
        }

        if let Some(v) = get("QTCOV_GCOV") {
            self.coverage.gcov = Some(PathBuf::from(v));
        }
        if let Some(v) = get("QTCOV_COVERAGE_CMD") {
            self.coverage.command = Some(v);
        }
        if let Some(v) = get("QTCOV_COVERAGE_TIMEOUT_SECS") {
            self.coverage.timeout_secs = parse_number("QTCOV_COVERAGE_TIMEOUT_SECS", &v)?;
        }

        Ok(())
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("toolchain.timeout_secs", self.toolchain.timeout_secs),
            ("tests.timeout_secs", self.tests.timeout_secs),
            ("coverage.timeout_secs", self.coverage.timeout_secs),
            ("context.max_files", self.context.max_files as u64),
            ("context.max_chars", self.context.max_chars as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.coverage.extensions.is_empty() {
            return Err(invalid(
                "coverage.extensions",
                "at least one extension is required",
            ));
        }
        if let Some(pattern) = &self.tests.summary_pattern {
            crate::parser::RegexTotalsParser::new("custom", pattern)?;
        }
        if let Some(command) = &self.coverage.command {
            if command.split_whitespace().next().is_none() {
                return Err(invalid("coverage.command", "command is empty"));
            }
        }
        Ok(())
    }

    /// Fail unless the automation path was explicitly enabled.
    pub fn ensure_automation_enabled(&self) -> Result<()> {
        if self.automation.enabled {
            Ok(())
        } else {
            Err(QtcovError::config(
                "automation is disabled; set QTCOV_ENABLE_AUTOMATION=1, \
                 `automation.enabled = true` in qtcov.toml, or pass --enable-automation",
            ))
        }
    }
}

fn invalid(field: &str, reason: &str) -> QtcovError {
    QtcovError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(field, &format!("'{}' is not a boolean", other))),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(field, &format!("'{}' is not a valid number", value)))
}
