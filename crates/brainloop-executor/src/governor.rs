//! Command governor: the `execute_bash` orchestration. Ties the validator,
//! the registry, the policy engine, and the sandboxed executor into one
//! request pipeline.
//!
//! # Pipeline
//!
//! 1. Validate the command (dangerous/injection pattern check + risk score).
//! 2. Look up or create the command's registry row.
//! 3. Evaluate the policy engine's decision (auto-approved, override, deny).
//!    A deny that only means "not yet approved" surfaces as
//!    [`ExecutorError::PendingValidation`]; a hard block (`Blocked` state,
//!    or `user_override = never`) surfaces as [`ExecutorError::Rejected`].
//! 4. If the policy permits execution, duplicate-check against the
//!    registry's recent-timestamp window. A detected duplicate returns
//!    immediately; the sandbox is never invoked for it.
//! 5. Run the command in the sandbox, timing the run.
//! 6. Record the execution outcome (including duration and exit code) in
//!    the registry.
//! 7. Re-validate the command text and, if it still passes, evaluate and
//!    apply whatever promotion/monitoring/rarity transition the
//!    accumulated statistics earn it.
//! 8. Return the response.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use brainloop_commands::{CommandRegistry, validate as validate_command};
use brainloop_core::{CommandHash, PolicyDecision, Timestamp};
use brainloop_storage::MetadataDb;
use brainloop_telemetry::log_security_rejection;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, ExecutorResult};
use crate::sandbox::run_sandboxed;

/// A request to execute one shell command.
#[derive(Debug, Clone)]
pub struct ExecuteBashRequest {
    /// The command text.
    pub command: String,
    /// Working directory to run it in.
    pub cwd: PathBuf,
    /// If `true`, bypasses the "not yet auto-approved" policy denial (it
    /// never bypasses a `Blocked` state, an operator override of `never`,
    /// or a dangerous-pattern rejection).
    pub force: bool,
}

/// The response returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteBashResponse {
    /// Captured stdout. Empty when `duplicate_detected` is set, since the
    /// sandbox was never invoked.
    pub stdout: String,
    /// Captured stderr. Empty when `duplicate_detected` is set.
    pub stderr: String,
    /// Process exit code. `0` when `duplicate_detected` is set.
    pub exit_code: i32,
    /// `true` if the registry record was promoted to `AutoApproved` as a
    /// result of this execution.
    pub promoted: bool,
    /// `true` if this exact command was also seen within its registry
    /// row's `duplicate_threshold_ms`. When set, the sandbox was never
    /// invoked and every other field carries a placeholder value.
    pub duplicate_detected: bool,
    /// Seconds since this command's previous execution, if it had one.
    /// Populated whenever `duplicate_detected` is set.
    pub seconds_since_last: Option<f64>,
}

/// Orchestrates command execution end to end.
pub struct CommandGovernor {
    registry: CommandRegistry,
    metadata: Arc<MetadataDb>,
    timeout_secs: u64,
    max_output_bytes: usize,
}

impl CommandGovernor {
    /// Build a governor over shared storage handles.
    #[must_use]
    pub fn new(registry: CommandRegistry, metadata: Arc<MetadataDb>, timeout_secs: u64, max_output_bytes: usize) -> Self {
        Self { registry, metadata, timeout_secs, max_output_bytes }
    }

    /// Run the full `execute_bash` pipeline for `request`.
    pub async fn execute_bash(&self, request: ExecuteBashRequest) -> ExecutorResult<ExecuteBashResponse> {
        let hash = CommandHash::of(&request.command);

        let outcome = validate_command(&request.command);
        if let Some(rejection) = &outcome.rejection {
            self.persist_rejection(&hash, &rejection.matched_pattern, "validator");
            return Err(ExecutorError::Rejected {
                reason: format!("command matched a blocked pattern: {}", rejection.matched_pattern),
            });
        }

        let record = self.registry.get_or_create(&hash, &request.command, outcome.risk_score, outcome.risk_level)?;
        let decision = brainloop_commands::policy::evaluate(&record, request.force);
        if let PolicyDecision::Deny { reason } = &decision {
            let hard_block = record.state == "Blocked" || record.user_override.as_deref() == Some("never");
            return Err(if hard_block {
                ExecutorError::Rejected { reason: reason.clone() }
            } else {
                ExecutorError::PendingValidation
            });
        }

        let now = Timestamp::now().epoch_seconds();
        if CommandRegistry::is_recent_duplicate(&record, now) {
            let seconds_since_last = record.last_100_timestamps.last().map(|&last| (now - last) as f64);
            return Ok(ExecuteBashResponse {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                promoted: false,
                duplicate_detected: true,
                seconds_since_last,
            });
        }

        let started_at = Instant::now();
        let exec_outcome = self.run_in_sandbox(&request.command, &request.cwd).await?;
        let duration_ms = i64::try_from(started_at.elapsed().as_millis()).unwrap_or(i64::MAX);

        let updated = self.registry.record_execution(&hash, exec_outcome.succeeded(), duration_ms, exec_outcome.exit_code)?;

        let promoted = self.apply_auto_evolution(&hash, &updated)?;

        Ok(ExecuteBashResponse {
            stdout: exec_outcome.stdout,
            stderr: exec_outcome.stderr,
            exit_code: exec_outcome.exit_code,
            promoted,
            duplicate_detected: false,
            seconds_since_last: None,
        })
    }

    async fn run_in_sandbox(&self, command: &str, cwd: &Path) -> ExecutorResult<crate::sandbox::ExecutionOutcome> {
        run_sandboxed(command, cwd, self.timeout_secs, self.max_output_bytes).await
    }

    /// Re-validate the command text (the mandatory security re-check) and,
    /// if it still passes, apply whatever evolution the accumulated
    /// statistics earn it. Returns `true` if this call promoted the
    /// command.
    fn apply_auto_evolution(&self, hash: &CommandHash, record: &brainloop_storage::CommandRecord) -> ExecutorResult<bool> {
        let revalidated = validate_command(&record.command_text);
        if revalidated.rejection.is_some() {
            // The command became dangerous in light of re-validation (this
            // should not happen for an unchanged command text, but the
            // re-check is mandatory regardless); block it outright instead
            // of promoting.
            self.registry.block(hash)?;
            return Ok(false);
        }

        let now = Timestamp::now().epoch_seconds();
        match brainloop_commands::policy::check_auto_evolution(record, now) {
            Some(brainloop_commands::policy::PolicyEvolution::Promote { reason }) => {
                self.registry.promote(hash, &reason)?;
                let description = format!("command {hash} promoted to auto_approve: {reason}");
                if let Err(e) = self.metadata.record_worker_event("policy_promoted", &description, now) {
                    tracing::warn!(error = %e, "failed to persist policy_promoted event");
                }
                Ok(true)
            }
            Some(brainloop_commands::policy::PolicyEvolution::EnterMonitoringState) => {
                self.registry.set_monitoring(hash)?;
                Ok(false)
            }
            Some(brainloop_commands::policy::PolicyEvolution::DisableDuplicateCheck) => {
                self.registry.disable_duplicate_check(hash)?;
                Ok(false)
            }
            Some(brainloop_commands::policy::PolicyEvolution::RaiseDuplicateThreshold { threshold_ms }) => {
                self.registry.raise_duplicate_threshold(hash, threshold_ms)?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn persist_rejection(&self, hash: &CommandHash, matched_pattern: &str, source: &str) {
        let event = log_security_rejection(hash.as_str(), matched_pattern, source);
        if let Err(e) = self.metadata.record_security_event(&event.hash, &event.matched_pattern, &event.source, event.occurred_at) {
            tracing::warn!(error = %e, "failed to persist security event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brainloop_storage::CommandSecurityDb;

    fn governor() -> CommandGovernor {
        CommandGovernor::new(
            CommandRegistry::new(Arc::new(CommandSecurityDb::open_in_memory().unwrap())),
            Arc::new(MetadataDb::open_in_memory().unwrap()),
            5,
            10_000,
        )
    }

    #[tokio::test]
    async fn dangerous_command_is_rejected_before_execution() {
        let gov = governor();
        let req = ExecuteBashRequest {
            command: "rm -rf /".to_string(),
            cwd: std::env::temp_dir(),
            force: true,
        };
        let result = gov.execute_bash(req).await;
        assert!(matches!(result, Err(ExecutorError::Rejected { .. })));
    }

    #[tokio::test]
    async fn new_command_requires_force_to_run() {
        let gov = governor();
        let req = ExecuteBashRequest {
            command: "echo hi".to_string(),
            cwd: std::env::temp_dir(),
            force: false,
        };
        let result = gov.execute_bash(req).await;
        assert!(matches!(result, Err(ExecutorError::PendingValidation)));
    }

    #[tokio::test]
    async fn forced_command_executes_and_is_recorded() {
        let gov = governor();
        let req = ExecuteBashRequest {
            command: "echo hi".to_string(),
            cwd: std::env::temp_dir(),
            force: true,
        };
        let response = gov.execute_bash(req).await.unwrap();
        assert!(response.stdout.contains("hi"));
        assert!(!response.duplicate_detected);
    }

    #[tokio::test]
    async fn repeated_identical_command_within_the_threshold_is_flagged_a_duplicate() {
        let gov = governor();
        let req = ExecuteBashRequest {
            command: "echo hi".to_string(),
            cwd: std::env::temp_dir(),
            force: true,
        };
        let first = gov.execute_bash(req.clone()).await.unwrap();
        let second = gov.execute_bash(req).await.unwrap();
        assert!(!first.duplicate_detected);
        assert!(second.duplicate_detected);
        assert!(second.stdout.is_empty());
    }

    #[tokio::test]
    async fn twenty_successful_forced_runs_of_the_same_command_promote_it() {
        let gov = governor();
        // All 20 executions land within the same wall-clock second, so
        // duplicate detection would otherwise short-circuit every run past
        // the first; disable it for this hash to exercise promotion alone.
        let command = "echo promotion-candidate";
        let hash = CommandHash::of(command);
        let outcome = brainloop_commands::validate(command);
        gov.registry.get_or_create(&hash, command, outcome.risk_score, outcome.risk_level).unwrap();
        gov.registry.disable_duplicate_check(&hash).unwrap();
        for _ in 0..19 {
            gov.registry.record_execution(&hash, true, 5, 0).unwrap();
        }

        let req = ExecuteBashRequest { command: command.to_string(), cwd: std::env::temp_dir(), force: true };
        let response = gov.execute_bash(req).await.unwrap();
        assert!(response.promoted);
    }
}
