//! Final prompt text sent to the LLM.
//!
//! Layout, in order: system prompt, enumerated source context (bounded by
//! [`ContextLimits`]), the task prompt, and the fixed critical instructions.

use crate::config::ContextLimits;
use crate::prompt::context::ContextSnippet;
use std::path::PathBuf;

/// Marker appended to a snippet cut at the character budget.
pub const TRUNCATION_MARKER: &str = "\n// ... truncated ...";

/// Requirements appended to every generation prompt.
pub const CRITICAL_INSTRUCTIONS: &str = "\
## Critical instructions

1. Drive every branch of the code under test, including error paths and early returns.
2. Cover edge cases: empty and null inputs, boundary values, invalid or unusual object states.
3. Verify behavior with assertions (QCOMPARE, QVERIFY, QTRY_COMPARE) on return values and \
observable state. A test that only calls a function without checking the outcome is not acceptable.
4. Use data-driven tests (`_data()` functions) where several inputs exercise the same logic.
5. Only use classes and methods that appear in the provided sources.
6. Answer with exactly one complete C++ source file in a single ```cpp fenced block: \
includes, the QObject test class with its private slots, QTEST_MAIN, and the matching .moc include.";

/// Prompt text plus what happened to the context.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    /// Context files that made it into the prompt, in order
    pub included: Vec<PathBuf>,
    /// Whether the last included snippet was cut short
    pub truncated: bool,
    /// Candidates left out by the file or character limit
    pub dropped: usize,
}

/// Builds prompts under fixed context limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptAssembler {
    limits: ContextLimits,
}

impl PromptAssembler {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ContextLimits {
        self.limits
    }

    pub fn assemble(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        snippets: &[ContextSnippet],
    ) -> AssembledPrompt {
        let mut sections: Vec<String> = Vec::new();

        if let Some(system) = system_prompt.map(str::trim).filter(|s| !s.is_empty()) {
            sections.push(system.to_string());
        }

        let mut included = Vec::new();
        let mut truncated = false;
        let mut remaining = self.limits.max_chars;
        let mut context = String::new();

        for snippet in snippets.iter().take(self.limits.max_files) {
            if remaining == 0 {
                break;
            }
            let len = snippet.text.chars().count();
            let body = if len > remaining {
                truncated = true;
                let cut: String = snippet.text.chars().take(remaining).collect();
                format!("{}{}", cut, TRUNCATION_MARKER)
            } else {
                snippet.text.clone()
            };
            remaining = remaining.saturating_sub(len);

            included.push(snippet.path.clone());
            context.push_str(&format!(
                "[{}] {}\n```{}\n{}\n```\n\n",
                included.len(),
                snippet.path.display(),
                fence_tag(&snippet.path),
                body.trim_end()
            ));

            if truncated {
                break;
            }
        }

        if !context.is_empty() {
            sections.push(format!("## Source context\n\n{}", context.trim_end()));
        }
        sections.push(format!("## Task\n\n{}", prompt.trim()));
        sections.push(CRITICAL_INSTRUCTIONS.to_string());

        AssembledPrompt {
            text: sections.join("\n\n"),
            dropped: snippets.len() - included.len(),
            included,
            truncated,
        }
    }
}

fn fence_tag(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("pro") | Some("pri") => "qmake",
        Some("c") => "c",
        _ => "cpp",
    }
}
