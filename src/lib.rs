//! qtcov - LLM-driven QtTest generation with coverage orchestration
//!
//! Takes a named prompt, asks an LLM for a Qt unit test, saves it into the
//! generated test project, builds it with qmake/make, runs the binary and
//! collects gcovr coverage, reconciling sources the shadow build cannot see.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`prompt`] - Prompt document, source context and prompt assembly
//! - [`llm`] - OpenAI- and Claude-compatible clients and provider selection
//! - [`artifact`] - Code extraction and test file writing
//! - [`process`] - Subprocess execution behind [`process::CommandRunner`]
//! - [`parser`] - Test summary, coverage and loader-failure parsing
//! - [`build`] - qmake/make driver
//! - [`executor`] - Test executable discovery and execution
//! - [`remediation`] - Runtime staging after a loader failure
//! - [`coverage`] - gcovr collection and shadow-build reconciliation
//! - [`cycle`] - The orchestrating state machine and per-run archive
//! - [`testing`] - Testing infrastructure (mocks for every seam)
//!
//! # Example
//!
//! ```rust,ignore
//! use qtcov::{CycleOrchestrator, QtcovConfig};
//! use qtcov::llm::{client_for_selection, ProviderSelection};
//! use qtcov::process::SystemCommandRunner;
//! use std::sync::Arc;
//!
//! let config = QtcovConfig::load(".".as_ref(), |k| std::env::var(k).ok())?;
//! let llm = client_for_selection(ProviderSelection::Auto, &config.llm)?;
//! let orchestrator = CycleOrchestrator::new(
//!     config,
//!     ".",
//!     Arc::from(llm),
//!     Arc::new(SystemCommandRunner),
//! )?;
//! let result = orchestrator.full_cycle("phase1_parser").await;
//! std::process::exit(result.status.exit_code());
//! ```

pub mod artifact;
pub mod build;
pub mod config;
pub mod coverage;
pub mod cycle;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod llm;
pub mod parser;
pub mod process;
pub mod prompt;
pub mod remediation;
pub mod testing;

// Re-export commonly used types
pub use error::{QtcovError, Result};

pub use config::QtcovConfig;

pub use artifact::{GenerationResult, TestArtifactWriter};
pub use build::{BuildRunner, CompilationResult};
pub use coverage::{CoverageCollector, CoverageReport};
pub use cycle::{CycleObserver, CycleOrchestrator, CycleResult, CycleState, CycleStatus, Stage};
pub use executor::TestExecutor;
pub use llm::{LlmClient, ProviderKind, ProviderSelection};
pub use process::{CommandRunner, SystemCommandRunner};
pub use prompt::PromptStore;
pub use remediation::{DependencyStager, RuntimeStager};
