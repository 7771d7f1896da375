//! Risk scoring and command governance vocabulary shared by
//! `brainloop-commands` and `brainloop-executor`.

use serde::{Deserialize, Serialize};

/// Coarse risk bucket assigned to a command by the validator's scoring
/// function. Ordered from least to most dangerous so that
/// `RiskLevel::High > RiskLevel::Low` compares the way a reader expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Read-only or clearly side-effect-free commands.
    Safe,
    /// Ordinary development commands (build, test, format).
    Low,
    /// Commands that mutate the workspace but stay within it.
    Medium,
    /// Commands that reach outside the workspace or touch system state.
    High,
    /// Commands matching a known-dangerous pattern; never auto-approved.
    Critical,
}

impl RiskLevel {
    /// Map a 0-100 numeric risk score to a bucket.
    ///
    /// Boundaries: `< 20` Safe, `< 40` Low, `< 60` Medium, `< 85` High,
    /// otherwise Critical.
    #[must_use]
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=19 => RiskLevel::Safe,
            20..=39 => RiskLevel::Low,
            40..=59 => RiskLevel::Medium,
            60..=84 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

/// Lifecycle state of a registered command, tracked by the command registry
/// and advanced by the policy engine's promotion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// First few observations; not yet eligible for auto-approval.
    New,
    /// Enough successful runs observed that promotion is being considered.
    Monitoring,
    /// Promoted: future identical commands are auto-approved without a
    /// fresh security re-check of the policy engine's non-dangerous-pattern
    /// rules (the dangerous-pattern check itself is never skipped).
    AutoApproved,
    /// Permanently denied; the governor refuses to execute it regardless of
    /// the caller's override flag.
    Blocked,
}

impl Default for CommandState {
    fn default() -> Self {
        CommandState::New
    }
}

/// Outcome of the policy engine's evaluation of a single command execution
/// request, after the validator's dangerous-pattern check has already run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    /// Execute without further confirmation.
    Allow,
    /// Execute, but only because the caller passed an explicit override
    /// flag; the command itself would not otherwise qualify.
    AllowWithOverride,
    /// Refuse to execute.
    Deny {
        /// Human-readable reason, safe to surface to the caller and to log.
        reason: String,
    },
}

impl PolicyDecision {
    /// `true` if this decision permits execution.
    #[must_use]
    pub fn permits_execution(&self) -> bool {
        matches!(self, PolicyDecision::Allow | PolicyDecision::AllowWithOverride)
    }
}
