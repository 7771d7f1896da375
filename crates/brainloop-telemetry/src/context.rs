//! Request correlation context.

use chrono::{DateTime, Utc};
use tracing::Span;
use uuid::Uuid;

/// Correlates the tracing spans emitted while handling one JSON-RPC request
/// or one command-governor invocation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    component: String,
    operation: Option<String>,
    started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Start a new context for `component` (e.g. `"execute_bash"`).
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            component: component.into(),
            operation: None,
            started_at: Utc::now(),
        }
    }

    /// Attach an operation name, shown in the span as `operation`.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// The correlation id for this request.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// When this context was created.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Build a `tracing::Span` carrying this context's fields. Enter it with
    /// `.entered()` or `.enter()` to scope subsequent log events.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            component = %self.component,
            operation = self.operation.as_deref().unwrap_or("")
        )
    }
}

/// An entered [`RequestContext`] span, held for the lifetime of a request.
pub struct RequestGuard<'a> {
    _entered: tracing::span::Entered<'a>,
}

impl<'a> RequestGuard<'a> {
    /// Enter `span` and hold the guard.
    #[must_use]
    pub fn enter(span: &'a Span) -> Self {
        Self {
            _entered: span.enter(),
        }
    }
}
