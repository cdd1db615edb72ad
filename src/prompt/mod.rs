//! Prompts: the persisted task document, source context, and assembly.
//!
//! - [`store`] - task → prompt JSON document with atomic saves
//! - [`context`] - project files offered to the model for a task
//! - [`assembler`] - final prompt text under context limits

pub mod assembler;
pub mod context;
pub mod store;

pub use assembler::{AssembledPrompt, PromptAssembler, CRITICAL_INSTRUCTIONS};
pub use context::{normalized_stem, target_stem, ContextSnippet, SourceContextCollector};
pub use store::{LoadMode, PromptMap, PromptStore};
