//! Skip condition model

use crate::core::Ambiance;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Skip condition as declared on a plan node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipConditionConfig {
    /// Setup abstraction key the condition looks at
    pub key: String,

    /// Pattern the value has to match for the node to be skipped
    pub pattern: String,

    /// Whether to use regex pattern matching
    #[serde(default)]
    pub use_regex: bool,
}

/// Pattern for matching a scoping value (not serializable due to Regex)
#[derive(Debug, Clone)]
pub enum ConditionPattern {
    /// Exact string match
    Simple(String),
    /// Regular expression match
    Regex(Regex),
}

impl ConditionPattern {
    /// Check if the pattern matches the given text
    pub fn matches(&self, text: &str) -> bool {
        match self {
            ConditionPattern::Simple(pattern) => text == pattern,
            ConditionPattern::Regex(regex) => regex.is_match(text),
        }
    }
}

/// Compiled skip condition
#[derive(Debug, Clone)]
pub struct SkipCondition {
    pub key: String,
    pub pattern: ConditionPattern,
}

impl SkipCondition {
    /// Compile a skip condition; invalid regexes are reported to the caller
    pub fn compile(config: &SkipConditionConfig) -> Result<Self, regex::Error> {
        let pattern = if config.use_regex {
            ConditionPattern::Regex(Regex::new(&config.pattern)?)
        } else {
            ConditionPattern::Simple(config.pattern.clone())
        };

        Ok(Self {
            key: config.key.clone(),
            pattern,
        })
    }

    /// Whether the node should be skipped in this ambiance.
    ///
    /// A missing setup abstraction never skips.
    pub fn should_skip(&self, ambiance: &Ambiance) -> bool {
        ambiance
            .setup_abstraction(&self.key)
            .is_some_and(|value| self.pattern.matches(value))
    }
}
