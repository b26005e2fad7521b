//! Trace spans.
//!
//! Spans start `running` and finish exactly once, as `completed` or `failed`. A child span
//! inherits its parent's trace ID and is listed in the parent's `children`. Finished spans
//! are also copied into a bounded log for [`SpanService::recent_spans`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::history::BoundedLog;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::status::{transition, RunStatus, Status};
use starport_core::telemetry::TelemetryEvent;
use starport_runtime::Dispatcher;
use std::collections::BTreeMap;

/// A timed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Span ID
    pub id: String,
    /// Trace shared by a root span and its descendants
    pub trace_id: String,
    /// Parent span, `None` for roots
    pub parent_id: Option<String>,
    /// Operation name
    pub name: String,
    /// `running`, then `completed` or `failed`
    pub status: RunStatus,
    /// Caller-supplied attributes
    pub attributes: BTreeMap<String, Value>,
    /// Child span IDs, in start order
    pub children: Vec<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Finish time
    pub ended_at: Option<DateTime<Utc>>,
    /// Milliseconds between start and finish
    pub duration_ms: Option<i64>,
    /// Failure description
    pub error: Option<String>,
}

impl Entity for Span {
    fn id(&self) -> &str {
        &self.id
    }
}

/// How a span ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum SpanOutcome {
    /// The work succeeded
    Ok,
    /// The work failed
    Error(String),
}

/// A span with its descendants nested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanTree {
    /// The span
    pub span: Span,
    /// Child trees, in start order
    pub children: Vec<SpanTree>,
}

impl SpanTree {
    /// Number of spans in the tree
    #[must_use]
    pub fn size(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(tree) = stack.pop() {
            count += 1;
            stack.extend(&tree.children);
        }
        count
    }
}

// Deep traces are torn down with an explicit stack.
impl Drop for SpanTree {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut tree) = stack.pop() {
            stack.append(&mut tree.children);
        }
    }
}

/// Span feature state
#[derive(Debug, Clone)]
pub struct SpanState {
    spans: Registry<Span>,
    finished: BoundedLog<Span>,
}

impl SpanState {
    /// Empty state keeping the last `finished_limit` finished spans
    #[must_use]
    pub fn new(finished_limit: usize) -> Self {
        Self {
            spans: Registry::new("Span"),
            finished: BoundedLog::new(finished_limit),
        }
    }

    /// Nest `root_id` and its descendants
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when `root_id` is unknown.
    pub fn trace(&self, root_id: &str) -> Result<SpanTree, LifecycleError> {
        let root = self.spans.require(root_id)?;
        Ok(self.subtree(root))
    }

    fn subtree(&self, root: &Span) -> SpanTree {
        // Pre-order walk, each node paired with its parent's index.
        let mut nodes: Vec<(&Span, usize)> = Vec::new();
        let mut stack = vec![(root, 0)];
        while let Some((span, parent)) = stack.pop() {
            let index = nodes.len();
            nodes.push((span, parent));
            stack.extend(
                span.children
                    .iter()
                    .rev()
                    .filter_map(|id| self.spans.get(id))
                    .map(|child| (child, index)),
            );
        }

        // Children always follow their parent, so a reverse pass sees every child first.
        let mut children: Vec<Vec<SpanTree>> = std::iter::repeat_with(Vec::new).take(nodes.len()).collect();
        for (index, (span, parent)) in nodes.iter().enumerate().skip(1).rev() {
            let mut nested = std::mem::take(&mut children[index]);
            nested.reverse();
            children[*parent].push(SpanTree {
                span: (*span).clone(),
                children: nested,
            });
        }
        let mut nested = std::mem::take(&mut children[0]);
        nested.reverse();
        SpanTree {
            span: root.clone(),
            children: nested,
        }
    }
}

impl Feature for SpanState {
    const NAME: &'static str = "spans";
}

/// Start a span, optionally under a parent
#[derive(Debug, Clone)]
pub struct StartSpan {
    /// Operation name
    pub name: String,
    /// Parent span
    pub parent_id: Option<String>,
    /// Attributes
    pub attributes: BTreeMap<String, Value>,
}

impl Operation<SpanState> for StartSpan {
    type Output = Span;
    const NAME: &'static str = "start_span";

    fn apply(self, state: &mut SpanState, env: &Environment) -> Result<Applied<Span>, LifecycleError> {
        let trace_id = match &self.parent_id {
            Some(parent_id) => state.spans.require(parent_id)?.trace_id.clone(),
            None => env.next_id("trace"),
        };
        let id = env.next_id("span");
        if let Some(parent_id) = &self.parent_id {
            state.spans.update(parent_id, |parent| parent.children.push(id.clone()))?;
        }

        let span = state
            .spans
            .insert(Span {
                id,
                trace_id,
                parent_id: self.parent_id,
                name: self.name,
                status: RunStatus::Running,
                attributes: self.attributes,
                children: Vec::new(),
                started_at: env.now(),
                ended_at: None,
                duration_ms: None,
                error: None,
            })
            .clone();
        let mut event = TelemetryEvent::new("started")
            .with("span_id", span.id.as_str())
            .with("trace_id", span.trace_id.as_str())
            .with("name", span.name.as_str());
        if let Some(parent_id) = &span.parent_id {
            event = event.with("parent_id", parent_id.as_str());
        }
        Ok(Applied::new(span).with_event(event))
    }
}

/// Finish a running span
#[derive(Debug, Clone)]
pub struct FinishSpan {
    /// Span ID
    pub span_id: String,
    /// How it ended
    pub outcome: SpanOutcome,
}

impl Operation<SpanState> for FinishSpan {
    type Output = Span;
    const NAME: &'static str = "finish_span";

    #[allow(clippy::cast_precision_loss)]
    fn apply(self, state: &mut SpanState, env: &Environment) -> Result<Applied<Span>, LifecycleError> {
        let now = env.now();
        let span = state.spans.require_mut(&self.span_id)?;
        let next = match self.outcome {
            SpanOutcome::Ok => RunStatus::Completed,
            SpanOutcome::Error(_) => RunStatus::Failed,
        };
        span.status = transition("Span", &span.id, span.status, next)?;
        span.ended_at = Some(now);
        let duration_ms = (now - span.started_at).num_milliseconds().max(0);
        span.duration_ms = Some(duration_ms);
        if let SpanOutcome::Error(message) = self.outcome {
            span.error = Some(message);
        }

        let span = span.clone();
        state.finished.push(span.clone());
        let event = TelemetryEvent::new("finished")
            .with_value(duration_ms as f64)
            .with("span_id", span.id.as_str())
            .with("name", span.name.as_str())
            .with("status", span.status.as_str());
        Ok(Applied::new(span).with_event(event))
    }
}

/// Span service
#[derive(Debug, Clone)]
pub struct SpanService {
    dispatcher: Dispatcher<SpanState>,
}

impl SpanService {
    /// Empty service keeping the last `finished_limit` finished spans
    #[must_use]
    pub fn new(env: Environment, finished_limit: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(SpanState::new(finished_limit), env),
        }
    }

    /// Start a span without attributes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown parent.
    pub async fn start_span(&self, name: impl Into<String>, parent_id: Option<&str>) -> Result<Span, LifecycleError> {
        self.start_span_with(name, parent_id, BTreeMap::new()).await
    }

    /// Start a span with attributes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown parent.
    pub async fn start_span_with(
        &self,
        name: impl Into<String>,
        parent_id: Option<&str>,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Span, LifecycleError> {
        self.dispatcher
            .send(StartSpan {
                name: name.into(),
                parent_id: parent_id.map(str::to_string),
                attributes,
            })
            .await
    }

    /// Finish a span.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown span and `InvalidTransition` when it already
    /// finished.
    pub async fn finish_span(&self, span_id: impl Into<String>, outcome: SpanOutcome) -> Result<Span, LifecycleError> {
        self.dispatcher
            .send(FinishSpan {
                span_id: span_id.into(),
                outcome,
            })
            .await
    }

    /// Look up a span
    pub async fn get_span(&self, span_id: &str) -> Option<Span> {
        self.dispatcher.state(|s| s.spans.get_cloned(span_id)).await
    }

    /// A span and its descendants, nested.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown span.
    pub async fn trace(&self, root_id: &str) -> Result<SpanTree, LifecycleError> {
        self.dispatcher.state(|s| s.trace(root_id)).await
    }

    /// Up to `n` finished spans, most recently finished first
    pub async fn recent_spans(&self, n: usize) -> Vec<Span> {
        self.dispatcher.state(|s| s.finished.recent(n)).await
    }

    /// Spans still running, in start order
    pub async fn active_spans(&self) -> Vec<Span> {
        self.dispatcher
            .state(|s| s.spans.list(|span| span.status == RunStatus::Running))
            .await
    }
}
