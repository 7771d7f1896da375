//! JSON-RPC 2.0 dispatch over line-delimited stdio (§6). No framing
//! headers: one JSON value per line in, one JSON value per line out.
//!
//! The transport itself (parsing, method routing, error-code mapping) is
//! hand-rolled rather than imported — it is a few dozen lines with no
//! algorithmic content. Everything it dispatches into (the governor, the
//! session manager, the gateway, the registry, the reader cache) is a
//! thin call into an already-tested component.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use brainloop_commands::CommandRegistry;
use brainloop_core::{BlockId, CommandHash, SessionId};
use brainloop_executor::{CommandGovernor, ExecuteBashRequest, ExecutorError};
use brainloop_llm::{GenerationGateway, GenerationRequest, LatencyHistogram, PromptKind};
use brainloop_session::{BlockProposal, BlockType, SessionManager};
use brainloop_storage::{LifecycleDb, SessionBlockRow};
use serde::Deserialize;
use serde_json::Value;

use crate::reader_cache::{DEFAULT_TTL_SECS, ReaderCache};

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "brainloop";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const ACTION_FAILURE: i64 = -32000;

/// The tool's 13 actions with one-line descriptions, for `list_actions`
/// and the `tools/list` input schema's `action` enum.
const ACTIONS: &[(&str, &str)] = &[
    ("execute_bash", "Run a shell command through the adaptive command governor."),
    ("audit_code", "Read-only critique of a file against a question, at fixed temperature."),
    ("generate_file", "One-shot propose-then-commit of a single file-writing block."),
    ("generate_sql", "One-shot propose-then-commit of a single SQL block."),
    ("explore", "Alias for loop(mode=\"propose\") over one or more blocks."),
    ("loop", "Drive the propose/audit/refine/commit session state machine."),
    ("read_sqlite", "Cached digest of the table list in a SQLite database."),
    ("read_markdown", "Cached digest of a markdown file."),
    ("read_code", "Cached digest of a source file."),
    ("read_config", "Cached digest of a configuration file."),
    ("list_actions", "List the actions this tool exposes."),
    ("get_schema", "Input schema fragment for a named action."),
    ("get_stats", "Registry, latency, and reader-cache statistics, or one command's derived stats."),
];

/// One JSON-RPC request line.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// An action-layer failure, carrying the JSON-RPC error code it maps to.
struct ActionError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl ActionError {
    fn invalid_params(detail: impl Into<String>) -> Self {
        Self { code: INVALID_PARAMS, message: "invalid params".to_string(), data: Some(Value::String(detail.into())) }
    }

    fn action_failure(detail: impl Into<String>) -> Self {
        Self { code: ACTION_FAILURE, message: "action failed".to_string(), data: Some(Value::String(detail.into())) }
    }

    fn action_failure_with_body(detail: impl Into<String>, body: Value) -> Self {
        let mut data = serde_json::json!({ "error": detail.into() });
        if let (Value::Object(data_map), Value::Object(body_map)) = (&mut data, body) {
            for (key, value) in body_map {
                data_map.insert(key, value);
            }
        }
        Self { code: ACTION_FAILURE, message: "action failed".to_string(), data: Some(data) }
    }
}

macro_rules! impl_action_error_from {
    ($ty:path) => {
        impl From<$ty> for ActionError {
            fn from(e: $ty) -> Self {
                ActionError::action_failure(e.to_string())
            }
        }
    };
}

impl_action_error_from!(brainloop_session::SessionError);
impl_action_error_from!(brainloop_executor::ExecutorError);
impl_action_error_from!(brainloop_llm::LlmError);
impl_action_error_from!(brainloop_storage::StorageError);
impl_action_error_from!(brainloop_commands::CommandError);

type ActionResult = Result<Value, ActionError>;

/// Routes `initialize`/`tools/list`/`tools/call` JSON-RPC requests to the
/// worker's 13 actions.
pub struct Dispatcher {
    workspace_root: PathBuf,
    governor: Arc<CommandGovernor>,
    registry: CommandRegistry,
    session_manager: Arc<SessionManager>,
    lifecycle: Arc<LifecycleDb>,
    gateway: Arc<GenerationGateway>,
    histogram: Arc<LatencyHistogram>,
    reader_cache: Arc<ReaderCache>,
}

impl Dispatcher {
    /// Build a dispatcher over the worker's already-constructed
    /// components.
    #[must_use]
    pub fn new(
        workspace_root: PathBuf,
        governor: Arc<CommandGovernor>,
        registry: CommandRegistry,
        session_manager: Arc<SessionManager>,
        lifecycle: Arc<LifecycleDb>,
        gateway: Arc<GenerationGateway>,
        histogram: Arc<LatencyHistogram>,
        reader_cache: Arc<ReaderCache>,
    ) -> Self {
        Self { workspace_root, governor, registry, session_manager, lifecycle, gateway, histogram, reader_cache }
    }

    /// Parse and handle one line of input, returning the JSON-RPC response
    /// line to write back (always exactly one response per request line,
    /// per §6).
    pub async fn handle_line(&self, line: &str) -> String {
        let parsed: Result<RpcRequest, _> = serde_json::from_str(line);
        let request = match parsed {
            Ok(request) => request,
            Err(e) => return rpc_error(Value::Null, PARSE_ERROR, "parse error", Some(Value::String(e.to_string()))).to_string(),
        };
        let id = request.id.clone();
        match self.handle_request(request).await {
            Ok(result) => rpc_ok(id, result).to_string(),
            Err(e) => rpc_error(id, e.code, e.message, e.data).to_string(),
        }
    }

    async fn handle_request(&self, request: RpcRequest) -> ActionResult {
        match request.method.as_str() {
            "initialize" => Ok(initialize_result()),
            "tools/list" => Ok(tools_list_result()),
            "tools/call" => self.tools_call(request.params).await,
            other => Err(ActionError { code: METHOD_NOT_FOUND, message: format!("unknown method: {other}"), data: None }),
        }
    }

    async fn tools_call(&self, params: Value) -> ActionResult {
        let name = require_str(&params, "name")?;
        if name != "brainloop" {
            return Err(ActionError::invalid_params(format!("unknown tool: {name}")));
        }
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let action = require_str(&arguments, "action")?.to_string();
        let action_params = arguments.get("params").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        self.dispatch_action(&action, action_params).await
    }

    async fn dispatch_action(&self, action: &str, params: Value) -> ActionResult {
        match action {
            "execute_bash" => self.execute_bash(params).await,
            "audit_code" => self.audit_code(params).await,
            "generate_file" => self.generate_file(params).await,
            "generate_sql" => self.generate_sql(params).await,
            "explore" => self.do_propose(&params).await,
            "loop" => self.loop_action(params).await,
            "read_sqlite" => self.read_sqlite(params),
            "read_markdown" => self.read_file_digest(params, "markdown"),
            "read_code" => self.read_file_digest(params, "code"),
            "read_config" => self.read_file_digest(params, "config"),
            "list_actions" => Ok(list_actions_result()),
            "get_schema" => get_schema_result(params),
            "get_stats" => self.get_stats(params),
            other => Err(ActionError::invalid_params(format!("unknown action: {other}"))),
        }
    }

    async fn execute_bash(&self, params: Value) -> ActionResult {
        let command = require_str(&params, "command")?.to_string();
        let cwd = optional_str(&params, "cwd").map(PathBuf::from).unwrap_or_else(|| self.workspace_root.clone());
        let force = optional_bool(&params, "force").unwrap_or(false);

        let started_at = Instant::now();
        let request = ExecuteBashRequest { command: command.clone(), cwd, force };
        match self.governor.execute_bash(request).await {
            Ok(response) if response.duplicate_detected => Ok(serde_json::json!({
                "status": "duplicate_warning",
                "command": command,
                "seconds_since_last": response.seconds_since_last,
            })),
            Ok(response) => {
                let policy_used = if response.promoted { "auto_approved" } else { "approved" };
                Ok(serde_json::json!({
                    "success": response.exit_code == 0,
                    "exit_code": response.exit_code,
                    "stdout": response.stdout,
                    "stderr": response.stderr,
                    "duration_ms": u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "policy_used": policy_used,
                }))
            }
            Err(ExecutorError::PendingValidation) => {
                let hash = CommandHash::of(&command);
                let risk_score = self.registry.get(&hash).map_err(ActionError::from)?.map(|r| r.risk_score).unwrap_or(0);
                Ok(serde_json::json!({
                    "status": "pending_validation",
                    "command": command,
                    "policy": "ask",
                    "risk_score": risk_score,
                }))
            }
            Err(ExecutorError::Rejected { reason }) => {
                Err(ActionError::action_failure_with_body(reason.clone(), serde_json::json!({ "success": false, "error": reason })))
            }
            Err(other) => Err(ActionError::from(other)),
        }
    }

    async fn audit_code(&self, params: Value) -> ActionResult {
        let path = require_str(&params, "path")?;
        let question = require_str(&params, "question")?;
        let content =
            std::fs::read_to_string(path).map_err(|e| ActionError::action_failure(format!("failed to read {path}: {e}")))?;

        let request = GenerationRequest {
            system_prompt: "You are a careful code reviewer. Answer the question about the file below precisely, \
                             citing the relevant lines where it helps."
                .to_string(),
            user_prompt: format!("File: {path}\n\n{content}\n\nQuestion: {question}"),
            temperature: 0.3,
            kind: PromptKind::Freeform,
            session_id: None,
        };
        let response = self.gateway.generate(&request).await.map_err(ActionError::from)?;
        Ok(serde_json::json!({ "path": path, "answer": response.content }))
    }

    async fn generate_file(&self, params: Value) -> ActionResult {
        let description = require_str(&params, "description")?.to_string();
        let target = require_str(&params, "target")?.to_string();
        let language = optional_str(&params, "language").unwrap_or("text").to_string();
        let proposal = BlockProposal { description, block_type: BlockType::Code { language }, target };
        self.propose_then_commit(proposal).await
    }

    async fn generate_sql(&self, params: Value) -> ActionResult {
        let description = require_str(&params, "description")?.to_string();
        let target = require_str(&params, "target")?.to_string();
        let proposal = BlockProposal { description, block_type: BlockType::Sql, target };
        self.propose_then_commit(proposal).await
    }

    async fn propose_then_commit(&self, proposal: BlockProposal) -> ActionResult {
        let session_id = self.session_manager.propose(vec![proposal]).await.map_err(ActionError::from)?;
        let row = self.only_block_of(&session_id)?;
        let block_id = parse_block_id(&row.block_id)?;
        let outcome = self.session_manager.commit(&session_id, &block_id).await.map_err(ActionError::from)?;
        Ok(serde_json::json!({
            "session_id": session_id.to_string(),
            "block_id": block_id.to_string(),
            "outcome": serde_json::to_value(outcome).unwrap_or(Value::Null),
        }))
    }

    fn only_block_of(&self, session_id: &SessionId) -> Result<SessionBlockRow, ActionError> {
        self.lifecycle
            .list_session_blocks(&session_id.to_string())
            .map_err(ActionError::from)?
            .into_iter()
            .next()
            .ok_or_else(|| ActionError::action_failure("propose produced no block"))
    }

    async fn loop_action(&self, params: Value) -> ActionResult {
        let mode = require_str(&params, "mode")?;
        match mode {
            "propose" => self.do_propose(&params).await,
            "audit" => self.do_audit(&params),
            "refine" => self.do_refine(&params).await,
            "commit" => self.do_commit(&params).await,
            other => Err(ActionError::invalid_params(format!("unknown loop mode: {other}"))),
        }
    }

    async fn do_propose(&self, params: &Value) -> ActionResult {
        let blocks_value = params.get("blocks").and_then(Value::as_array).ok_or_else(|| ActionError::invalid_params("missing blocks array"))?;
        let proposals: Vec<BlockProposal> = blocks_value.iter().map(parse_block_proposal).collect::<Result<_, _>>()?;
        let session_id = self.session_manager.propose(proposals).await.map_err(ActionError::from)?;
        let rows = self.lifecycle.list_session_blocks(&session_id.to_string()).map_err(ActionError::from)?;
        Ok(serde_json::json!({
            "session_id": session_id.to_string(),
            "blocks": rows.iter().map(session_block_row_to_value).collect::<Vec<_>>(),
        }))
    }

    fn do_audit(&self, params: &Value) -> ActionResult {
        let (session_id, block_id) = parse_session_block(params)?;
        let row = self.session_manager.audit(&session_id, &block_id).map_err(ActionError::from)?;
        Ok(session_block_row_to_value(&row))
    }

    async fn do_refine(&self, params: &Value) -> ActionResult {
        let (session_id, block_id) = parse_session_block(params)?;
        let feedback = require_str(params, "feedback")?;
        let row = self.session_manager.refine(&session_id, &block_id, feedback).await.map_err(ActionError::from)?;
        Ok(session_block_row_to_value(&row))
    }

    async fn do_commit(&self, params: &Value) -> ActionResult {
        let (session_id, block_id) = parse_session_block(params)?;
        let outcome = self.session_manager.commit(&session_id, &block_id).await.map_err(ActionError::from)?;
        Ok(serde_json::json!({
            "session_id": session_id.to_string(),
            "block_id": block_id.to_string(),
            "outcome": serde_json::to_value(outcome).unwrap_or(Value::Null),
        }))
    }

    /// Reads under the reader cache's mtime-keyed contract. The
    /// extractors producing real markdown/source/config digests are out
    /// of scope; what's computed here (byte/line counts and a content
    /// hash) is a real, if minimal, digest that exercises the cache
    /// exactly as an extractor's output would.
    fn read_file_digest(&self, params: Value, source_type: &str) -> ActionResult {
        let path_str = require_str(&params, "path")?;
        let path = PathBuf::from(path_str);
        let now = chrono::Utc::now().timestamp();

        if let Some(cached) = self.cache_get(&path, now)? {
            return Ok(digest_response(path_str, source_type, cached, "hit"));
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| ActionError::action_failure(format!("failed to read {path_str}: {e}")))?;
        let digest = serde_json::json!({
            "bytes": content.len(),
            "lines": content.lines().count(),
            "sha256": CommandHash::of(&content).to_string(),
        });
        self.cache_put(&path, source_type, &digest, now)?;
        Ok(digest_response(path_str, source_type, digest, "miss"))
    }

    /// Same cache contract as [`Self::read_file_digest`], but the digest
    /// is the target SQLite database's table list rather than a generic
    /// byte count — embedded-database extraction is out of scope, but
    /// listing `sqlite_master` is not an extractor, just a schema probe.
    fn read_sqlite(&self, params: Value) -> ActionResult {
        let path_str = require_str(&params, "path")?;
        let path = PathBuf::from(path_str);
        let now = chrono::Utc::now().timestamp();

        if let Some(cached) = self.cache_get(&path, now)? {
            return Ok(digest_response(path_str, "sqlite", cached, "hit"));
        }

        let conn = rusqlite::Connection::open_with_flags(&path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| ActionError::action_failure(format!("failed to open {path_str}: {e}")))?;
        let mut statement = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(|e| ActionError::action_failure(e.to_string()))?;
        let tables: Vec<String> = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ActionError::action_failure(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| ActionError::action_failure(e.to_string()))?;

        let digest = serde_json::json!({ "tables": tables });
        self.cache_put(&path, "sqlite", &digest, now)?;
        Ok(digest_response(path_str, "sqlite", digest, "miss"))
    }

    fn cache_get(&self, path: &Path, now: i64) -> Result<Option<Value>, ActionError> {
        let raw = self.reader_cache.get(path, now).map_err(|e| ActionError::action_failure(e.to_string()))?;
        Ok(raw.map(|s| serde_json::from_str(&s).unwrap_or(Value::String(s))))
    }

    fn cache_put(&self, path: &Path, source_type: &str, digest: &Value, now: i64) -> Result<(), ActionError> {
        let digest_str = digest.to_string();
        self.reader_cache
            .put(path, source_type, &digest_str, DEFAULT_TTL_SECS, now)
            .map_err(|e| ActionError::action_failure(e.to_string()))
    }

    fn get_stats(&self, params: Value) -> ActionResult {
        if let Some(hash_str) = optional_str(&params, "hash") {
            return self.get_stats_for_hash(hash_str);
        }

        let registry_stats = self.registry.stats().map_err(ActionError::from)?;
        let now = chrono::Utc::now().timestamp();
        let p50 = self.histogram.percentile("generate", 0.5, 60, now).map_err(ActionError::from)?;
        let p95 = self.histogram.percentile("generate", 0.95, 60, now).map_err(ActionError::from)?;
        let p99 = self.histogram.percentile("generate", 0.99, 60, now).map_err(ActionError::from)?;
        let cache_hit_rate = self.reader_cache.hit_rate().map_err(|e| ActionError::action_failure(e.to_string()))?;

        Ok(serde_json::json!({
            "registry": {
                "total_commands": registry_stats.total_commands,
                "auto_approved_commands": registry_stats.auto_approved_commands,
                "blocked_commands": registry_stats.blocked_commands,
            },
            "generation_latency_ms": { "p50": p50, "p95": p95, "p99": p99 },
            "reader_cache_hit_rate": cache_hit_rate,
        }))
    }

    fn get_stats_for_hash(&self, hash_str: &str) -> ActionResult {
        let hash = CommandHash::parse(hash_str).map_err(|e| ActionError::invalid_params(format!("invalid hash: {e}")))?;
        let record = self
            .registry
            .get(&hash)
            .map_err(ActionError::from)?
            .ok_or_else(|| ActionError::action_failure(format!("no such command hash: {hash_str}")))?;

        let execution_count = record.execution_count;
        #[allow(clippy::cast_precision_loss)]
        let avg_interval_seconds = if execution_count >= 2 {
            Some((record.last_seen_at - record.first_seen_at) as f64 / f64::from(execution_count - 1))
        } else {
            None
        };
        #[allow(clippy::cast_precision_loss)]
        let success_rate =
            if execution_count > 0 { f64::from(record.success_count) / f64::from(execution_count) } else { 0.0 };

        Ok(serde_json::json!({
            "hash": record.hash,
            "risk_score": record.risk_score,
            "risk_level": record.risk_level,
            "state": record.state,
            "success_count": record.success_count,
            "failure_count": record.failure_count,
            "execution_count": execution_count,
            "success_rate": success_rate,
            "avg_interval_seconds": avg_interval_seconds,
            "avg_duration_ms": record.avg_duration_ms,
            "min_duration_ms": record.min_duration_ms,
            "max_duration_ms": record.max_duration_ms,
            "user_override": record.user_override,
            "duplicate_threshold_ms": record.duplicate_threshold_ms,
            "duplicate_check_enabled": record.duplicate_check_enabled,
            "first_seen_at": record.first_seen_at,
            "last_seen_at": record.last_seen_at,
            "last_100_timestamps": record.last_100_timestamps,
        }))
    }
}

fn rpc_ok(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Value {
    let mut error = serde_json::json!({ "code": code, "message": message.into() });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn initialize_result() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
    })
}

fn tools_list_result() -> Value {
    let action_names: Vec<&str> = ACTIONS.iter().map(|(name, _)| *name).collect();
    serde_json::json!({
        "tools": [{
            "name": "brainloop",
            "description": "Adaptive command execution, iterative code generation, and cached file/database digests for an automated worker.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": action_names },
                    "params": { "type": "object" },
                },
                "required": ["action", "params"],
            },
        }],
    })
}

fn list_actions_result() -> Value {
    serde_json::json!({
        "actions": ACTIONS.iter().map(|(name, description)| serde_json::json!({
            "name": name,
            "description": description,
        })).collect::<Vec<_>>(),
    })
}

fn get_schema_result(params: Value) -> ActionResult {
    let action = require_str(&params, "action")?;
    let schema = action_input_schema(action).ok_or_else(|| ActionError::invalid_params(format!("unknown action: {action}")))?;
    Ok(serde_json::json!({ "action": action, "input_schema": schema }))
}

fn action_input_schema(action: &str) -> Option<Value> {
    let schema = match action {
        "execute_bash" => serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "cwd": { "type": "string" },
                "force": { "type": "boolean" },
            },
            "required": ["command"],
        }),
        "audit_code" => serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" }, "question": { "type": "string" } },
            "required": ["path", "question"],
        }),
        "generate_file" => serde_json::json!({
            "type": "object",
            "properties": {
                "description": { "type": "string" },
                "target": { "type": "string" },
                "language": { "type": "string" },
            },
            "required": ["description", "target"],
        }),
        "generate_sql" => serde_json::json!({
            "type": "object",
            "properties": { "description": { "type": "string" }, "target": { "type": "string" } },
            "required": ["description", "target"],
        }),
        "explore" | "loop" => serde_json::json!({
            "type": "object",
            "properties": {
                "mode": { "type": "string", "enum": ["propose", "audit", "refine", "commit"] },
                "blocks": { "type": "array" },
                "session_id": { "type": "string" },
                "block_id": { "type": "string" },
                "feedback": { "type": "string" },
            },
        }),
        "read_sqlite" | "read_markdown" | "read_code" | "read_config" => serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        }),
        "list_actions" => serde_json::json!({ "type": "object", "properties": {} }),
        "get_schema" => serde_json::json!({
            "type": "object",
            "properties": { "action": { "type": "string" } },
            "required": ["action"],
        }),
        "get_stats" => serde_json::json!({
            "type": "object",
            "properties": { "hash": { "type": "string" } },
        }),
        _ => return None,
    };
    Some(schema)
}

fn digest_response(path: &str, source_type: &str, digest: Value, cache: &str) -> Value {
    serde_json::json!({ "path": path, "source_type": source_type, "digest": digest, "cache": cache })
}

fn session_block_row_to_value(row: &SessionBlockRow) -> Value {
    serde_json::json!({
        "session_id": row.session_id,
        "block_id": row.block_id,
        "block_type": row.block_type,
        "target": row.target,
        "description": row.description,
        "phase": row.phase,
        "temperature": row.temperature,
        "code": row.code,
        "status": row.status,
        "iterations": row.iterations,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
        "last_refined_at": row.last_refined_at,
    })
}

fn parse_block_type(raw: &str) -> BlockType {
    match raw {
        "sql" => BlockType::Sql,
        "go" => BlockType::Go,
        "python" => BlockType::Python,
        other => BlockType::Code { language: other.to_string() },
    }
}

fn parse_block_proposal(value: &Value) -> Result<BlockProposal, ActionError> {
    let description = require_str(value, "description")?.to_string();
    let block_type = parse_block_type(require_str(value, "block_type")?);
    let target = require_str(value, "target")?.to_string();
    Ok(BlockProposal { description, block_type, target })
}

fn parse_session_block(params: &Value) -> Result<(SessionId, BlockId), ActionError> {
    let session_id = require_str(params, "session_id")?
        .parse::<SessionId>()
        .map_err(|e| ActionError::invalid_params(format!("invalid session_id: {e}")))?;
    let block_id = parse_block_id(require_str(params, "block_id")?)?;
    Ok((session_id, block_id))
}

fn parse_block_id(raw: &str) -> Result<BlockId, ActionError> {
    raw.parse::<BlockId>().map_err(|e| ActionError::invalid_params(format!("invalid block_id: {e}")))
}

fn require_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, ActionError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::invalid_params(format!("missing or non-string field: {field}")))
}

fn optional_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn optional_bool(value: &Value, field: &str) -> Option<bool> {
    value.get(field).and_then(Value::as_bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brainloop_commands::{CommandRegistry, IdempotencyLedger};
    use brainloop_config::CompletionConfig;
    use brainloop_llm::RateLimiter;
    use brainloop_storage::{CommandSecurityDb, Databases, InputDb, MetadataDb};

    fn dispatcher() -> Dispatcher {
        let dbs = Databases::open_in_memory().unwrap();
        let registry = CommandRegistry::new(Arc::clone(&dbs.command_security));
        let ledger = IdempotencyLedger::new(Arc::clone(&dbs.lifecycle));
        let governor = Arc::new(CommandGovernor::new(registry.clone(), Arc::clone(&dbs.metadata), 5, 10_000));
        let limiter = Arc::new(RateLimiter::new(Default::default()));
        let histogram = Arc::new(LatencyHistogram::new(Arc::clone(&dbs.output)));
        let gateway =
            Arc::new(GenerationGateway::new(CompletionConfig::default(), Arc::clone(&limiter), Arc::clone(&histogram), Arc::clone(&dbs.output)));
        let session_manager =
            Arc::new(SessionManager::new(Arc::clone(&dbs.lifecycle), Arc::clone(&dbs.output), ledger, Arc::clone(&gateway)));
        let reader_cache = Arc::new(ReaderCache::new(Arc::clone(&dbs.input)));
        Dispatcher::new(
            PathBuf::from("/workspace"),
            governor,
            registry,
            session_manager,
            Arc::clone(&dbs.lifecycle),
            gateway,
            histogram,
            reader_cache,
        )
    }

    #[tokio::test]
    async fn initialize_reports_protocol_version_and_server_info() {
        let d = dispatcher();
        let line = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }).to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn tools_list_exposes_the_single_brainloop_tool() {
        let d = dispatcher();
        let line = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }).to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["result"]["tools"][0]["name"], "brainloop");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let d = dispatcher();
        let line = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "nonsense" }).to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_json_line_is_a_parse_error() {
        let d = dispatcher();
        let response: Value = serde_json::from_str(&d.handle_line("not json").await).unwrap();
        assert_eq!(response["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn new_command_without_force_is_pending_validation_not_an_error() {
        let d = dispatcher();
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "brainloop",
                "arguments": { "action": "execute_bash", "params": { "command": "echo hi" } },
            },
        })
        .to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["result"]["status"], "pending_validation");
    }

    #[tokio::test]
    async fn dangerous_command_is_blocked_with_an_rpc_error() {
        let d = dispatcher();
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "brainloop",
                "arguments": { "action": "execute_bash", "params": { "command": "rm -rf /", "force": true } },
            },
        })
        .to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["error"]["code"], ACTION_FAILURE);
        assert_eq!(response["error"]["data"]["success"], false);
    }

    #[tokio::test]
    async fn forced_command_executes_and_reports_duration() {
        let d = dispatcher();
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "brainloop",
                "arguments": { "action": "execute_bash", "params": { "command": "echo hi", "force": true } },
            },
        })
        .to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["result"]["success"], true);
        assert!(response["result"]["stdout"].as_str().unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn read_markdown_misses_then_hits_the_cache() {
        let d = dispatcher();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# hello").unwrap();

        let call = |path: &Path| {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {
                    "name": "brainloop",
                    "arguments": { "action": "read_markdown", "params": { "path": path.to_string_lossy() } },
                },
            })
            .to_string()
        };

        let first: Value = serde_json::from_str(&d.handle_line(&call(&path)).await).unwrap();
        assert_eq!(first["result"]["cache"], "miss");
        let second: Value = serde_json::from_str(&d.handle_line(&call(&path)).await).unwrap();
        assert_eq!(second["result"]["cache"], "hit");
    }

    #[tokio::test]
    async fn get_stats_without_a_hash_returns_the_global_aggregate() {
        let d = dispatcher();
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "brainloop", "arguments": { "action": "get_stats", "params": {} } },
        })
        .to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert!(response["result"]["registry"]["total_commands"].is_number());
        assert!(response["result"]["reader_cache_hit_rate"].is_number());
    }

    #[tokio::test]
    async fn get_schema_returns_a_fragment_for_a_known_action() {
        let d = dispatcher();
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "brainloop", "arguments": { "action": "get_schema", "params": { "action": "execute_bash" } } },
        })
        .to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["result"]["input_schema"]["required"][0], "command");
    }

    #[tokio::test]
    async fn get_schema_rejects_an_unknown_action_as_invalid_params() {
        let d = dispatcher();
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "brainloop", "arguments": { "action": "get_schema", "params": { "action": "nonsense" } } },
        })
        .to_string();
        let response: Value = serde_json::from_str(&d.handle_line(&line).await).unwrap();
        assert_eq!(response["error"]["code"], INVALID_PARAMS);
    }
}
