//! Provider selection.
//!
//! Selection is a pure function over a list of probes, so the decision can
//! be tested without network access or environment variables.
//!
//! # Example
//!
//! ```rust
//! use qtcov::llm::router::{select_provider, ProviderKind, ProviderProbe, ProviderSelection};
//!
//! let probes = [
//!     ProviderProbe::new(ProviderKind::Claude, false),
//!     ProviderProbe::new(ProviderKind::OpenAi, true),
//! ];
//! assert_eq!(
//!     select_provider(ProviderSelection::Auto, &probes).unwrap(),
//!     ProviderKind::OpenAi
//! );
//! ```

use crate::config::LlmConfig;
use crate::error::{QtcovError, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Claude,
}

impl ProviderKind {
    /// Order in which `auto` considers providers.
    pub const AUTO_PRIORITY: [ProviderKind; 2] = [ProviderKind::Claude, ProviderKind::OpenAi];
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Claude => write!(f, "claude"),
        }
    }
}

/// Provider requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProviderSelection {
    #[value(name = "openai")]
    OpenAi,
    Claude,
    /// First viable provider in priority order
    #[default]
    Auto,
}

impl fmt::Display for ProviderSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSelection::OpenAi => write!(f, "openai"),
            ProviderSelection::Claude => write!(f, "claude"),
            ProviderSelection::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ProviderSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "gpt" => Ok(Self::OpenAi),
            "claude" | "anthropic" => Ok(Self::Claude),
            "auto" | "" => Ok(Self::Auto),
            other => Err(format!(
                "Unknown service '{}'. Valid options: openai, claude, auto",
                other
            )),
        }
    }
}

/// What is known about one provider before a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderProbe {
    pub kind: ProviderKind,
    pub credential_present: bool,
    /// `Some(false)` when a reachability check failed; `None` when unchecked
    pub reachable: Option<bool>,
}

impl ProviderProbe {
    pub fn new(kind: ProviderKind, credential_present: bool) -> Self {
        Self {
            kind,
            credential_present,
            reachable: None,
        }
    }

    #[must_use]
    pub fn with_reachable(mut self, reachable: bool) -> Self {
        self.reachable = Some(reachable);
        self
    }

    fn viable(&self) -> bool {
        self.credential_present && self.reachable != Some(false)
    }

    /// Probes for every provider, derived from configured credentials.
    pub fn from_config(config: &LlmConfig) -> Vec<ProviderProbe> {
        let present = |key: &Option<String>| key.as_deref().is_some_and(|k| !k.trim().is_empty());
        vec![
            ProviderProbe::new(ProviderKind::Claude, present(&config.anthropic_api_key)),
            ProviderProbe::new(ProviderKind::OpenAi, present(&config.api_key)),
        ]
    }
}

/// Pick the provider for `selection`.
///
/// Explicit selections need their own credential. `Auto` walks
/// [`ProviderKind::AUTO_PRIORITY`] and returns the first viable probe.
pub fn select_provider(
    selection: ProviderSelection,
    probes: &[ProviderProbe],
) -> Result<ProviderKind> {
    let probe_for = |kind: ProviderKind| probes.iter().find(|p| p.kind == kind);

    let explicit = match selection {
        ProviderSelection::OpenAi => Some(ProviderKind::OpenAi),
        ProviderSelection::Claude => Some(ProviderKind::Claude),
        ProviderSelection::Auto => None,
    };

    if let Some(kind) = explicit {
        return match probe_for(kind) {
            Some(p) if p.credential_present => Ok(kind),
            _ => Err(QtcovError::Auth {
                provider: kind.to_string(),
            }),
        };
    }

    ProviderKind::AUTO_PRIORITY
        .iter()
        .copied()
        .find(|kind| probe_for(*kind).is_some_and(ProviderProbe::viable))
        .ok_or_else(|| QtcovError::Auth {
            provider: "any provider (set ANTHROPIC_API_KEY or OPENAI_API_KEY)".to_string(),
        })
}
