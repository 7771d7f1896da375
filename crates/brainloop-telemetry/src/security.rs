//! Structured security-event emission.
//!
//! Every validator reject, dangerous-pattern match, or promotion refusal is
//! logged through [`log_security_rejection`] rather than an ad hoc
//! `tracing::warn!` call, so the event always carries the same field names
//! and never the full command text. `brainloop-storage` persists the same
//! fields into `metadata.db::telemetry_events`; this module owns the
//! in-process half of that contract.

use serde::{Deserialize, Serialize};

/// A durable record of a security-relevant rejection, independent of how it
/// is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// SHA-256 hash of the rejected command (never the command itself).
    pub hash: String,
    /// Name of the pattern or rule that matched, e.g. `"rm -rf"` or
    /// `"shell-injection:backtick"`.
    pub matched_pattern: String,
    /// Which component raised the rejection (`"validator"`,
    /// `"policy_engine"`).
    pub source: String,
    /// Unix-epoch seconds the rejection occurred.
    pub occurred_at: i64,
}

/// Emit a `tracing::warn!` event for a rejection and return the
/// [`SecurityEvent`] the caller should persist.
pub fn log_security_rejection(hash: &str, matched_pattern: &str, source: &str) -> SecurityEvent {
    let occurred_at = chrono::Utc::now().timestamp();
    tracing::warn!(
        hash = %hash,
        matched_pattern = %matched_pattern,
        source = %source,
        "command rejected by security policy"
    );
    SecurityEvent {
        hash: hash.to_string(),
        matched_pattern: matched_pattern.to_string(),
        source: source.to_string(),
        occurred_at,
    }
}
