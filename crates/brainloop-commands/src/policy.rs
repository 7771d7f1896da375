//! Policy engine: decides whether a single execution request proceeds, and
//! whether a command's accumulated history earns it a state change.
//!
//! # Decision order
//!
//! 1. `user_override = never` -> `Deny`, unconditionally; this dominates
//!    every other signal, including `force`.
//! 2. `user_override = always_allow` -> `Allow`, unconditionally.
//! 3. `user_override = always_ask` -> behaves like an un-promoted command:
//!    `force: true` required on every call.
//! 4. Registry state `Blocked` -> `Deny`.
//! 5. Registry state `AutoApproved` -> `Allow`.
//! 6. Caller passed `force: true` -> `AllowWithOverride`.
//! 7. Otherwise -> `Deny` (the caller must retry with `force: true`).
//!
//! This runs only after the validator's dangerous-pattern check has already
//! passed; the policy engine never overrides that check.

use brainloop_core::{CommandState, PolicyDecision, Timestamp};
use brainloop_storage::CommandRecord;

/// Minimum clean, failure-free executions before a command is worth
/// flagging as a promotion candidate (our own `Monitoring` pre-promotion
/// marker — not to be confused with the monitoring *rule* below, which
/// governs `duplicate_check_enabled` for polling loops).
pub const MIN_SUCCESSES_FOR_MONITORING: u32 = 3;

/// Minimum total executions before a command is eligible for promotion.
pub const MIN_EXECUTIONS_FOR_PROMOTION: u32 = 20;

/// Minimum `success_count / execution_count` for promotion.
pub const MIN_SUCCESS_RATE_FOR_PROMOTION: f64 = 0.95;

/// Maximum risk score (0-100 scale) for promotion, translated from the
/// 0.0-1.0 scale of `risk_score < 0.7`.
pub const MAX_RISK_SCORE_FOR_PROMOTION: u32 = 70;

/// A command last executed longer ago than this is not promoted, even with
/// an otherwise-qualifying history.
pub const PROMOTION_RECENCY_SECS: i64 = 30 * 24 * 3600;

/// Minimum total executions before the monitoring rule considers disabling
/// duplicate detection.
pub const MONITORING_RULE_MIN_EXECUTIONS: u32 = 50;

/// Mean interval (seconds) between the last 10 executions below which a
/// command is treated as a genuine polling loop.
pub const MONITORING_RULE_MAX_MEAN_INTERVAL_SECS: f64 = 5.0;

/// How many of the most recent timestamps the monitoring rule averages
/// over.
const MONITORING_RULE_WINDOW: usize = 10;

/// Minimum total executions before the rarity rule considers widening the
/// duplicate-detection window.
pub const RARITY_RULE_MIN_EXECUTIONS: u32 = 2;

/// Average inter-execution interval (seconds) above which a command is
/// treated as rare enough that its duplicate window should widen.
pub const RARITY_RULE_MIN_AVG_INTERVAL_SECS: f64 = 3600.0;

/// The duplicate-detection threshold the rarity rule raises a command to.
pub const RARITY_DUPLICATE_THRESHOLD_MS: i64 = 30_000;

fn parse_state(raw: &str) -> CommandState {
    match raw {
        "Monitoring" => CommandState::Monitoring,
        "AutoApproved" => CommandState::AutoApproved,
        "Blocked" => CommandState::Blocked,
        _ => CommandState::New,
    }
}

/// A state transition `check_auto_evolution` found a command's history
/// earns it. At most one is returned per call; the caller applies it and
/// nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvolution {
    /// Promote to `AutoApproved`, with the human-readable reason to persist
    /// alongside the promotion.
    Promote {
        /// Why this command was promoted, for the audit trail.
        reason: String,
    },
    /// Move into our own pre-promotion `Monitoring` marker state.
    EnterMonitoringState,
    /// Disable duplicate detection (the command is a genuine polling loop).
    DisableDuplicateCheck,
    /// Widen the duplicate-detection window (the command is rarely
    /// repeated, so any repetition stays worth flagging for longer).
    RaiseDuplicateThreshold {
        /// The new `duplicate_threshold_ms` value.
        threshold_ms: i64,
    },
}

/// Evaluate whether `record` may execute given the caller's `force` flag.
#[must_use]
pub fn evaluate(record: &CommandRecord, force: bool) -> PolicyDecision {
    match record.user_override.as_deref() {
        Some("never") => {
            return PolicyDecision::Deny {
                reason: format!("command {} is blocked by an operator override", record.hash),
            };
        }
        Some("always_allow") => return PolicyDecision::Allow,
        Some("always_ask") => {
            return if force {
                PolicyDecision::AllowWithOverride
            } else {
                PolicyDecision::Deny {
                    reason: "operator override requires an explicit confirmation on every run".to_string(),
                }
            };
        }
        _ => {}
    }

    match parse_state(&record.state) {
        CommandState::Blocked => PolicyDecision::Deny {
            reason: format!("command {} is permanently blocked", record.hash),
        },
        CommandState::AutoApproved => PolicyDecision::Allow,
        CommandState::New | CommandState::Monitoring => {
            if force {
                PolicyDecision::AllowWithOverride
            } else {
                PolicyDecision::Deny {
                    reason: "command is not auto-approved; retry with an explicit override".to_string(),
                }
            }
        }
    }
}

fn mean_interval_of_last(timestamps: &[i64], window: usize) -> Option<f64> {
    let len = timestamps.len();
    if len < 2 {
        return None;
    }
    let take = window.min(len);
    let slice = &timestamps[len - take..];
    if slice.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let span = (slice[slice.len() - 1] - slice[0]) as f64;
    #[allow(clippy::cast_precision_loss)]
    Some(span / (slice.len() - 1) as f64)
}

/// The state transition, if any, that `record`'s updated history earns it,
/// as of `now`. The caller is responsible for re-running the validator's
/// dangerous-pattern check on `record.command_text` inside the same
/// transaction before actually applying a [`PolicyEvolution::Promote`]:
/// this function only evaluates accumulated statistics.
#[must_use]
pub fn check_auto_evolution(record: &CommandRecord, now: i64) -> Option<PolicyEvolution> {
    let state = parse_state(&record.state);
    if matches!(state, CommandState::Blocked | CommandState::AutoApproved) {
        return None;
    }
    if record.user_override.as_deref() == Some("never") {
        return None;
    }

    if record.execution_count >= MIN_EXECUTIONS_FOR_PROMOTION {
        #[allow(clippy::cast_precision_loss)]
        let success_rate = f64::from(record.success_count) / f64::from(record.execution_count);
        let recently_executed = now.saturating_sub(record.last_seen_at) <= PROMOTION_RECENCY_SECS;
        if success_rate >= MIN_SUCCESS_RATE_FOR_PROMOTION
            && record.risk_score < MAX_RISK_SCORE_FOR_PROMOTION
            && recently_executed
        {
            let reason = format!(
                "{} executions, {:.1}% success, risk score {}",
                record.execution_count,
                success_rate * 100.0,
                record.risk_score
            );
            return Some(PolicyEvolution::Promote { reason });
        }
    }

    if state == CommandState::New && record.failure_count == 0 && record.success_count >= MIN_SUCCESSES_FOR_MONITORING {
        return Some(PolicyEvolution::EnterMonitoringState);
    }

    if record.duplicate_check_enabled && record.execution_count >= MONITORING_RULE_MIN_EXECUTIONS {
        if let Some(mean_interval) = mean_interval_of_last(&record.last_100_timestamps, MONITORING_RULE_WINDOW) {
            if mean_interval < MONITORING_RULE_MAX_MEAN_INTERVAL_SECS {
                return Some(PolicyEvolution::DisableDuplicateCheck);
            }
        }
    }

    if record.execution_count >= RARITY_RULE_MIN_EXECUTIONS && record.duplicate_threshold_ms != RARITY_DUPLICATE_THRESHOLD_MS {
        #[allow(clippy::cast_precision_loss)]
        let avg_interval_secs = (record.last_seen_at - record.first_seen_at) as f64 / f64::from(record.execution_count - 1);
        if avg_interval_secs > RARITY_RULE_MIN_AVG_INTERVAL_SECS {
            return Some(PolicyEvolution::RaiseDuplicateThreshold { threshold_ms: RARITY_DUPLICATE_THRESHOLD_MS });
        }
    }

    None
}

/// `check_auto_evolution` evaluated at the current time, for callers that
/// do not already have a timestamp on hand.
#[must_use]
pub fn check_auto_evolution_now(record: &CommandRecord) -> Option<PolicyEvolution> {
    check_auto_evolution(record, Timestamp::now().epoch_seconds())
}
