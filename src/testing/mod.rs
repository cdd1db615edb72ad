//! Testing infrastructure for qtcov.
//!
//! Test doubles for the seams of the cycle: the LLM client, the subprocess
//! runner and the runtime stager. They let the orchestrator be driven
//! through every path (failed builds, loader failures, reconciliation)
//! without a Qt toolchain or network access.
//!
//! # Example
//!
//! ```rust,ignore
//! use qtcov::testing::{MockCommandRunner, MockLlmClient, ScriptedResponse};
//!
//! let llm = MockLlmClient::new().with_response("```cpp\nvoid testA();\n```");
//! let runner = MockCommandRunner::new()
//!     .script("qmake", ScriptedResponse::ToolMissing);
//! ```

pub mod mocks;

pub use mocks::*;
