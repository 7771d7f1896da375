//! Session manager: orchestrates the propose/audit/refine/commit state
//! machine for one or more code-generation blocks, backed by
//! `lifecycle.db`'s `session_blocks` table and the idempotency ledger.

use std::sync::Arc;

use brainloop_commands::IdempotencyLedger;
use brainloop_core::{BlockId, CommandHash, SessionId};
use brainloop_llm::{GenerationGateway, GenerationRequest, PromptKind};
use brainloop_storage::{LifecycleDb, OutputDb, SessionBlockRow};

use crate::error::{SessionError, SessionResult};
use crate::types::{BlockProposal, BlockType, CommitOutcome};

const TEMPERATURE_PROPOSE: f64 = 0.6;
const TEMPERATURE_REFINE: f64 = 0.3;
const TEMPERATURE_COMMIT: f64 = 0.1;

const OP_COMMIT_BLOCK: &str = "commit_block";

/// Orchestrates code-generation sessions through their propose, audit,
/// refine, and commit phases.
pub struct SessionManager {
    lifecycle: Arc<LifecycleDb>,
    output: Arc<OutputDb>,
    ledger: IdempotencyLedger,
    gateway: Arc<GenerationGateway>,
}

impl SessionManager {
    /// Build a session manager over shared storage and gateway handles.
    #[must_use]
    pub fn new(
        lifecycle: Arc<LifecycleDb>,
        output: Arc<OutputDb>,
        ledger: IdempotencyLedger,
        gateway: Arc<GenerationGateway>,
    ) -> Self {
        Self { lifecycle, output, ledger, gateway }
    }

    /// Start a new session, generating an initial draft for every proposed
    /// block at `TEMPERATURE_PROPOSE`. If any block's generation fails, the
    /// whole session (including any blocks already written) is rolled back.
    pub async fn propose(&self, blocks: Vec<BlockProposal>) -> SessionResult<SessionId> {
        if blocks.is_empty() {
            return Err(SessionError::EmptyProposal);
        }

        let session_id = SessionId::new();
        match self.propose_blocks(&session_id, blocks).await {
            Ok(()) => Ok(session_id),
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "propose failed, rolling back session");
                if let Err(rollback_err) = self.lifecycle.delete_session(&session_id.to_string()) {
                    tracing::error!(session_id = %session_id, error = %rollback_err, "failed to roll back session");
                }
                Err(err)
            }
        }
    }

    async fn propose_blocks(&self, session_id: &SessionId, blocks: Vec<BlockProposal>) -> SessionResult<()> {
        let now = now_epoch_seconds();
        for proposal in blocks {
            let block_id = BlockId::new();
            let system_prompt = format!(
                "You generate {} code for an automated worker. Produce only the block's final code.",
                proposal.block_type.language_label()
            );
            let request = GenerationRequest {
                system_prompt,
                user_prompt: proposal.description.clone(),
                temperature: TEMPERATURE_PROPOSE,
                kind: PromptKind::Code {
                    language: proposal.block_type.language_label().to_string(),
                    patterns: None,
                },
                session_id: Some(session_id.to_string()),
            };
            let response = self.gateway.generate(&request).await?;

            let row = SessionBlockRow {
                session_id: session_id.to_string(),
                block_id: block_id.to_string(),
                block_type: proposal.block_type.to_db_string(),
                target: Some(proposal.target),
                description: proposal.description,
                phase: "propose".to_string(),
                temperature: TEMPERATURE_PROPOSE,
                code: response.content,
                status: "pending".to_string(),
                iterations: 1,
                created_at: now,
                updated_at: now,
                last_refined_at: None,
            };
            self.lifecycle.upsert_session_block(&row)?;
        }
        Ok(())
    }

    /// Read-only fetch of a block's current state, validating that it
    /// belongs to `session_id`. Never mutates the block.
    pub fn audit(&self, session_id: &SessionId, block_id: &BlockId) -> SessionResult<SessionBlockRow> {
        self.get_block(session_id, block_id)
    }

    /// Regenerate a block's code at `TEMPERATURE_REFINE`, composing the
    /// prompt from the block's original description, its current code, and
    /// `feedback`. On generation failure the block's previous code is left
    /// untouched.
    pub async fn refine(
        &self,
        session_id: &SessionId,
        block_id: &BlockId,
        feedback: &str,
    ) -> SessionResult<SessionBlockRow> {
        let row = self.get_block(session_id, block_id)?;
        if row.status == "committed" {
            return Err(SessionError::AlreadyCommitted { session_id: *session_id, block_id: *block_id });
        }

        let block_type = BlockType::from_db_string(&row.block_type)?;
        let user_prompt = format!(
            "Original request:\n{}\n\nCurrent code:\n{}\n\nFeedback to address:\n{}",
            row.description, row.code, feedback
        );
        let request = GenerationRequest {
            system_prompt: format!(
                "You refine {} code for an automated worker based on feedback. Produce only the revised final code.",
                block_type.language_label()
            ),
            user_prompt,
            temperature: TEMPERATURE_REFINE,
            kind: PromptKind::Code { language: block_type.language_label().to_string(), patterns: None },
            session_id: Some(session_id.to_string()),
        };
        let response = self.gateway.generate(&request).await?;

        let now = now_epoch_seconds();
        self.lifecycle.record_block_refinement(&row.session_id, &row.block_id, feedback, now)?;

        let mut updated = row;
        updated.phase = "refine".to_string();
        updated.temperature = TEMPERATURE_REFINE;
        updated.code = response.content;
        updated.iterations += 1;
        updated.updated_at = now;
        updated.last_refined_at = Some(now);
        self.lifecycle.upsert_session_block(&updated)?;
        Ok(updated)
    }

    /// Finalize a block: regenerate its code once more at
    /// `TEMPERATURE_COMMIT`, then apply its commit side effect (a SQL
    /// transaction for `BlockType::Sql`, an atomic write-to-temp-then-rename
    /// for everything else), gated by the idempotency ledger so a retried
    /// commit of an already-final hash never repeats the side effect.
    ///
    /// If the block is already committed, returns the previously recorded
    /// outcome without regenerating or re-applying any side effect. If the
    /// commit side effect fails, the block's status is left as `"pending"`
    /// so the caller may retry.
    pub async fn commit(&self, session_id: &SessionId, block_id: &BlockId) -> SessionResult<CommitOutcome> {
        let row = self.get_block(session_id, block_id)?;

        if row.status == "committed" {
            let hash = CommandHash::of_fields(&[row.session_id.as_str(), row.block_id.as_str(), row.code.as_str()]);
            if let Some(outcome) = self.ledger.get_processed::<CommitOutcome>(&hash, OP_COMMIT_BLOCK)? {
                return Ok(outcome);
            }
        }

        let block_type = BlockType::from_db_string(&row.block_type)?;
        let target = row
            .target
            .clone()
            .ok_or(SessionError::MissingTarget { session_id: *session_id, block_id: *block_id })?;

        let request = GenerationRequest {
            system_prompt: format!(
                "You finalize {} code for an automated worker immediately before it is committed. \
                 Produce only the final code, ready to execute or write verbatim.",
                block_type.language_label()
            ),
            user_prompt: format!("Original request:\n{}\n\nCurrent code:\n{}", row.description, row.code),
            temperature: TEMPERATURE_COMMIT,
            kind: PromptKind::Code { language: block_type.language_label().to_string(), patterns: None },
            session_id: Some(session_id.to_string()),
        };
        let response = match self.gateway.generate(&request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(session_id = %session_id, block_id = %block_id, error = %err, "commit generation failed");
                return Err(err.into());
            }
        };
        let final_code = response.content;
        let hash = CommandHash::of_fields(&[row.session_id.as_str(), row.block_id.as_str(), final_code.as_str()]);

        if let Some(outcome) = self.ledger.get_processed::<CommitOutcome>(&hash, OP_COMMIT_BLOCK)? {
            return Ok(outcome);
        }

        let now = now_epoch_seconds();
        let outcome = match self.apply_commit_side_effect(&row, &block_type, &target, &final_code, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    session_id = %session_id,
                    block_id = %block_id,
                    error = %err,
                    "commit side effect failed, leaving block pending for retry"
                );
                return Err(err);
            }
        };

        self.ledger.mark_processed(&hash, OP_COMMIT_BLOCK, &outcome)?;

        let mut updated = row;
        updated.phase = "commit".to_string();
        updated.temperature = TEMPERATURE_COMMIT;
        updated.code = final_code;
        updated.status = "committed".to_string();
        updated.iterations += 1;
        updated.updated_at = now;
        self.lifecycle.upsert_session_block(&updated)?;

        Ok(outcome)
    }

    fn apply_commit_side_effect(
        &self,
        row: &SessionBlockRow,
        block_type: &BlockType,
        target: &str,
        final_code: &str,
        now: i64,
    ) -> SessionResult<CommitOutcome> {
        if block_type.is_sql() {
            self.commit_sql(row, target, final_code, now)
        } else {
            self.commit_file(row, target, final_code, now)
        }
    }

    fn commit_sql(
        &self,
        row: &SessionBlockRow,
        target: &str,
        final_code: &str,
        now: i64,
    ) -> SessionResult<CommitOutcome> {
        let mut conn = rusqlite::Connection::open(target)?;
        let tx = conn.transaction()?;
        tx.execute_batch(final_code)?;
        let rows_affected = tx.changes();
        tx.commit()?;

        let statement_hash = CommandHash::of(final_code).to_string();
        self.output.record_sql_execution(&row.session_id, &row.block_id, &statement_hash, rows_affected as i64, now)?;
        Ok(CommitOutcome::SqlExecuted { rows_affected })
    }

    fn commit_file(
        &self,
        row: &SessionBlockRow,
        target: &str,
        final_code: &str,
        now: i64,
    ) -> SessionResult<CommitOutcome> {
        let target_path = std::path::Path::new(target);
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = target_path.with_extension(format!("tmp.{}", row.block_id));
        std::fs::write(&tmp_path, final_code)?;
        std::fs::rename(&tmp_path, target_path)?;

        let content_hash = CommandHash::of(final_code).to_string();
        self.output.record_generated_file(&row.session_id, &row.block_id, target, &content_hash, now)?;
        Ok(CommitOutcome::FileWritten { path: target.to_string(), bytes_written: final_code.len() })
    }

    fn get_block(&self, session_id: &SessionId, block_id: &BlockId) -> SessionResult<SessionBlockRow> {
        self.lifecycle
            .get_session_block(&session_id.to_string(), &block_id.to_string())?
            .ok_or(SessionError::BlockNotFound { session_id: *session_id, block_id: *block_id })
    }
}

fn now_epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use brainloop_config::CompletionConfig;
    use brainloop_llm::{LatencyHistogram, RateLimiter};
    use brainloop_storage::Databases;

    fn test_manager() -> (SessionManager, Arc<LifecycleDb>) {
        let dbs = Databases::open_in_memory().unwrap();
        let lifecycle = dbs.lifecycle;
        let output = dbs.output;
        let ledger = IdempotencyLedger::new(Arc::clone(&lifecycle));
        let limiter = Arc::new(RateLimiter::new(Default::default()));
        let histogram = Arc::new(LatencyHistogram::new(Arc::clone(&output)));
        let gateway = Arc::new(GenerationGateway::new(CompletionConfig::default(), limiter, histogram, Arc::clone(&output)));
        (SessionManager::new(Arc::clone(&lifecycle), output, ledger, gateway), lifecycle)
    }

    #[test]
    fn block_type_db_string_round_trips() {
        assert_eq!(BlockType::from_db_string("sql").unwrap(), BlockType::Sql);
        assert_eq!(BlockType::from_db_string("go").unwrap(), BlockType::Go);
        let code = BlockType::Code { language: "rust".to_string() };
        assert_eq!(BlockType::from_db_string(&code.to_db_string()).unwrap(), code);
        assert!(BlockType::from_db_string("nonsense").is_err());
    }

    #[tokio::test]
    async fn propose_rejects_an_empty_block_list() {
        let (manager, _) = test_manager();
        let err = manager.propose(vec![]).await.unwrap_err();
        assert!(matches!(err, SessionError::EmptyProposal));
    }

    #[test]
    fn audit_reports_not_found_for_unknown_block() {
        let (manager, _) = test_manager();
        let err = manager.audit(&SessionId::new(), &BlockId::new()).unwrap_err();
        assert!(matches!(err, SessionError::BlockNotFound { .. }));
    }

    #[tokio::test]
    async fn commit_on_an_already_committed_block_replays_the_stored_outcome() {
        let (manager, lifecycle) = test_manager();
        let session_id = SessionId::new();
        let block_id = BlockId::new();
        let row = SessionBlockRow {
            session_id: session_id.to_string(),
            block_id: block_id.to_string(),
            block_type: "go".to_string(),
            target: Some("/tmp/does-not-matter.go".to_string()),
            description: "write a no-op".to_string(),
            phase: "commit".to_string(),
            temperature: 0.1,
            code: "package main\n\nfunc main() {}\n".to_string(),
            status: "committed".to_string(),
            iterations: 3,
            created_at: 1,
            updated_at: 2,
            last_refined_at: Some(2),
        };
        lifecycle.upsert_session_block(&row).unwrap();

        let hash = CommandHash::of_fields(&[row.session_id.as_str(), row.block_id.as_str(), row.code.as_str()]);
        let outcome = CommitOutcome::FileWritten { path: "/tmp/does-not-matter.go".to_string(), bytes_written: 32 };
        let ledger = IdempotencyLedger::new(Arc::clone(&lifecycle));
        ledger.mark_processed(&hash, OP_COMMIT_BLOCK, &outcome).unwrap();

        // No gateway call should be needed: the block is already committed
        // and the ledger already holds its outcome.
        let replayed = manager.commit(&session_id, &block_id).await.unwrap();
        assert_eq!(replayed, outcome);
    }
}
