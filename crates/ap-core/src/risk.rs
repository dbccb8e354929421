use std::collections::HashSet;

use crate::config::RiskConfig;
use crate::types::{Action, RiskLevel};

/// Metadata flags that force manual approval regardless of action type.
const ESCALATING_FLAGS: &[&str] = &["irreversible", "external_communication"];

/// Decides whether an action may run unattended.
///
/// An action is `Auto` only if its type is in the safe set, is not listed
/// in the manual set, and carries none of the escalating metadata flags.
/// Everything else, including unknown types, is `Manual`.
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    safe: HashSet<String>,
    manual: HashSet<String>,
}

impl RiskClassifier {
    pub fn new<S, M>(safe: S, manual: M) -> Self
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        M: IntoIterator,
        M::Item: AsRef<str>,
    {
        Self {
            safe: safe.into_iter().map(|s| normalize(s.as_ref())).collect(),
            manual: manual.into_iter().map(|s| normalize(s.as_ref())).collect(),
        }
    }

    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(&config.safe_action_types, &config.manual_types)
    }

    pub fn classify(&self, action: &Action) -> RiskLevel {
        let kind = normalize(&action.action_type);
        if self.manual.contains(&kind) || has_escalating_flag(&action.metadata) {
            return RiskLevel::Manual;
        }
        if self.safe.contains(&kind) {
            RiskLevel::Auto
        } else {
            RiskLevel::Manual
        }
    }
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::from_config(&RiskConfig::default())
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn has_escalating_flag(metadata: &serde_json::Value) -> bool {
    ESCALATING_FLAGS
        .iter()
        .any(|flag| metadata.get(flag).and_then(|v| v.as_bool()).unwrap_or(false))
}
