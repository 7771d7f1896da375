//! Block types and request/response shapes for the session manager.

use crate::error::{SessionError, SessionResult};

/// What kind of artifact a block produces, and how `commit` applies its
/// side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockType {
    /// A block of SQL statements, committed inside a transaction against
    /// `target` (a SQLite database path).
    Sql,
    /// A Go source file, committed via atomic write-to-temp-then-rename.
    Go,
    /// A Python source file, committed the same way as `Go`.
    Python,
    /// Any other language, carried through for prompt shaping and written
    /// the same way as `Go`/`Python`.
    Code {
        /// The language name passed to the generation gateway.
        language: String,
    },
}

impl BlockType {
    /// The language name used to shape the generation prompt.
    #[must_use]
    pub fn language_label(&self) -> &str {
        match self {
            Self::Sql => "sql",
            Self::Go => "go",
            Self::Python => "python",
            Self::Code { language } => language,
        }
    }

    /// Encode as the flat string stored in `session_blocks.block_type`.
    #[must_use]
    pub fn to_db_string(&self) -> String {
        match self {
            Self::Sql => "sql".to_string(),
            Self::Go => "go".to_string(),
            Self::Python => "python".to_string(),
            Self::Code { language } => format!("code:{language}"),
        }
    }

    /// Decode from the stored string, inverse of [`Self::to_db_string`].
    pub fn from_db_string(value: &str) -> SessionResult<Self> {
        match value {
            "sql" => Ok(Self::Sql),
            "go" => Ok(Self::Go),
            "python" => Ok(Self::Python),
            other => other
                .strip_prefix("code:")
                .map(|language| Self::Code { language: language.to_string() })
                .ok_or_else(|| SessionError::InvalidBlockType(other.to_string())),
        }
    }

    /// `true` for block types committed by executing SQL rather than
    /// writing a file.
    #[must_use]
    pub fn is_sql(&self) -> bool {
        matches!(self, Self::Sql)
    }
}

/// One block to propose within a new session.
#[derive(Debug, Clone)]
pub struct BlockProposal {
    /// Natural-language description of what the block should do; also the
    /// basis for every subsequent regeneration prompt.
    pub description: String,
    /// Block type, determining prompt shaping and commit side effect.
    pub block_type: BlockType,
    /// Commit target: a file path for `Go`/`Python`/`Code` blocks, or a
    /// SQLite database path for `Sql` blocks.
    pub target: String,
}

/// The outcome of committing one block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum CommitOutcome {
    /// A `Go`/`Python`/`Code` block was written to `path`.
    FileWritten {
        /// Where the final code was written.
        path: String,
        /// Size of the written content, in bytes.
        bytes_written: usize,
    },
    /// A `Sql` block executed against its target database.
    SqlExecuted {
        /// Rows affected by the final statement in the batch, per
        /// `rusqlite::Connection::changes`.
        rows_affected: u64,
    },
}
