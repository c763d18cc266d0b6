//! Resolution policy for unattended conflict handling
//!
//! Maps a conflict to a resolution using the `conflicts` configuration:
//! rules are matched against the file's remote name in first-match-wins
//! order, falling back to the default resolution.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use lockstep_core::config::{ConflictRule, ConflictsConfig};
use lockstep_core::domain::conflict::{Conflict, ConflictResolution};

use crate::error::ConflictError;

/// What the policy decided for one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// Leave the conflict for a person to resolve
    Manual,
    Resolve(ConflictResolution),
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyDecision::Manual => write!(f, "manual"),
            PolicyDecision::Resolve(r) => write!(f, "{}", r),
        }
    }
}

/// Parses a configured resolution name
fn parse_decision(s: &str) -> Option<PolicyDecision> {
    match s {
        "manual" => Some(PolicyDecision::Manual),
        "keep_local" => Some(PolicyDecision::Resolve(
            ConflictResolution::KeepConflictingClientOperations,
        )),
        "accept_remote" => Some(PolicyDecision::Resolve(
            ConflictResolution::DeleteConflictingClientOperations,
        )),
        _ => None,
    }
}

/// Validates one configured rule
pub fn validate_rule(rule: &ConflictRule) -> Result<(), ConflictError> {
    Pattern::new(&rule.pattern).map_err(|e| ConflictError::InvalidRule {
        pattern: rule.pattern.clone(),
        reason: e.to_string(),
    })?;

    parse_decision(&rule.resolution).ok_or_else(|| ConflictError::InvalidRule {
        pattern: rule.pattern.clone(),
        reason: format!(
            "invalid resolution '{}'; valid: manual, keep_local, accept_remote",
            rule.resolution
        ),
    })?;

    Ok(())
}

/// Compiled conflict rules
pub struct ResolutionPolicy {
    rules: Vec<(Pattern, PolicyDecision)>,
    default: PolicyDecision,
}

impl ResolutionPolicy {
    /// Compiles the policy from configuration
    ///
    /// Invalid rules are logged and skipped; an invalid default falls back
    /// to manual.
    pub fn from_config(config: &ConflictsConfig) -> Self {
        let default = parse_decision(&config.default_resolution).unwrap_or(PolicyDecision::Manual);

        let rules: Vec<(Pattern, PolicyDecision)> = config
            .rules
            .iter()
            .filter_map(|rule| {
                if let Err(e) = validate_rule(rule) {
                    warn!(error = %e, "Skipping invalid conflict rule");
                    return None;
                }
                let pattern = Pattern::new(&rule.pattern).ok()?;
                let decision = parse_decision(&rule.resolution)?;
                Some((pattern, decision))
            })
            .collect();

        debug!(
            rules_count = rules.len(),
            default = %default,
            "Resolution policy initialized"
        );

        Self { rules, default }
    }

    /// Decides how to resolve a conflict on a file named `remote_name`
    pub fn evaluate(&self, remote_name: Option<&str>) -> PolicyDecision {
        if let Some(name) = remote_name {
            for (pattern, decision) in &self.rules {
                if pattern.matches(name) {
                    trace!(name, pattern = %pattern, decision = %decision, "Conflict rule matched");
                    return *decision;
                }
            }
        }
        self.default
    }

    /// Decides for a delivered conflict
    pub fn decide(&self, conflict: &Conflict) -> PolicyDecision {
        self.evaluate(conflict.remote_name().map(|n| n.as_str()))
    }

    pub fn default_decision(&self) -> PolicyDecision {
        self.default
    }

    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}
