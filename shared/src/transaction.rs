use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use opentelemetry::{
    trace::{SpanContext, TraceContextExt, TraceState},
    Context, SpanId, TraceId,
};
use serde::{Deserialize, Serialize};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::agent::{AgentCore, VendorEntry};
use crate::error::MalformedContext;
use crate::trace_context::{TraceContext, TraceFields};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub event_type: String,
    pub timestamp_ms: u128,
    pub trace_id: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId(usize);

#[derive(Debug)]
struct Segment {
    name: String,
    span_id: SpanId,
    parent_id: SpanId,
    started: Instant,
    duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub name: String,
    pub span_id: String,
    pub parent_id: String,
    pub duration: Duration,
}

/// What happened to an inbound trace context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The transaction now continues the upstream trace.
    Accepted,
    /// No context was supplied; the transaction stays a root.
    Missing,
    /// The context could not be parsed; the transaction stays a root.
    Malformed(MalformedContext),
    /// The call was not allowed at this point and had no effect.
    Ignored,
}

/// Everything the agent reports about one finished invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: bool,
    pub priority: f32,
    pub trace_state: String,
    pub timestamp_ms: u128,
    pub duration: Duration,
    pub segments: Vec<SegmentRecord>,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub custom_events: Vec<CustomEvent>,
}

/// One invocation's unit of traced work.
///
/// A transaction is started by [`crate::agent::Agent::start_transaction`].
/// The `Default` value is a transaction that never started: it has no ids
/// and emits an empty context.
#[derive(Debug)]
pub struct Transaction {
    name: String,
    agent: Option<Arc<AgentCore>>,
    trace_id: TraceId,
    span_id: SpanId,
    transaction_id: SpanId,
    parent_span_id: Option<SpanId>,
    sampled: bool,
    priority: f32,
    trace_state: TraceState,
    accepted: bool,
    started: Option<Instant>,
    timestamp_ms: u128,
    segments: Vec<Segment>,
    open_segments: Vec<SegmentId>,
    attributes: BTreeMap<String, AttributeValue>,
    custom_events: Vec<CustomEvent>,
    span: tracing::Span,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            name: String::new(),
            agent: None,
            trace_id: TraceId::INVALID,
            span_id: SpanId::INVALID,
            transaction_id: SpanId::INVALID,
            parent_span_id: None,
            sampled: false,
            priority: 0.0,
            trace_state: TraceState::NONE,
            accepted: false,
            started: None,
            timestamp_ms: 0,
            segments: Vec::new(),
            open_segments: Vec::new(),
            attributes: BTreeMap::new(),
            custom_events: Vec::new(),
            span: tracing::Span::none(),
        }
    }
}

impl Transaction {
    pub(crate) fn start(agent: Arc<AgentCore>, name: &str) -> Self {
        let trace_id = agent.new_trace_id();
        let span_id = agent.new_span_id();
        let transaction_id = agent.new_span_id();
        let sampled = agent.should_sample(trace_id);
        let priority = agent.root_priority(trace_id, sampled);

        let span = tracing::info_span!(
            "transaction",
            otel.name = %name,
            trace.id = %trace_id,
            span.id = %span_id,
            parent.id = tracing::field::Empty,
        );

        Self {
            name: name.to_string(),
            agent: Some(agent),
            trace_id,
            span_id,
            transaction_id,
            parent_span_id: None,
            sampled,
            priority,
            trace_state: TraceState::NONE,
            accepted: false,
            started: Some(Instant::now()),
            timestamp_ms: now_ms(),
            segments: Vec::new(),
            open_segments: Vec::new(),
            attributes: BTreeMap::new(),
            custom_events: Vec::new(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    /// The `tracing` span that log lines of this invocation should run under.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Snapshot of this transaction's position in the trace, ready for an
    /// outbound call. The span-id is that of the innermost open segment, or
    /// the transaction itself when no segment is open.
    pub fn emit_context(&self) -> TraceContext {
        let Some(agent) = &self.agent else {
            return TraceContext::default();
        };
        if !agent.config.distributed_tracing_enabled {
            return TraceContext::default();
        }

        let span_id = self.current_span_id();
        let trace_state = agent.with_vendor_entry(
            &self.trace_state,
            VendorEntry {
                span_id,
                transaction_id: self.transaction_id,
                sampled: self.sampled,
                priority: self.priority,
            },
        );

        TraceContext {
            trace_id: self.trace_id,
            span_id,
            sampled: self.sampled,
            trace_state,
        }
    }

    /// Makes this transaction a child of the context in `fields`.
    ///
    /// Must run once, before any segment starts. Missing or malformed fields
    /// leave the transaction as a root of its own trace.
    pub fn accept_context(&mut self, fields: &TraceFields) -> AcceptOutcome {
        let Some(agent) = self.agent.clone() else {
            tracing::debug!("Ignoring trace context for a transaction that never started");
            return AcceptOutcome::Ignored;
        };
        if !agent.config.distributed_tracing_enabled {
            return AcceptOutcome::Ignored;
        }

        debug_assert!(
            self.segments.is_empty(),
            "trace context must be accepted before any segment starts"
        );
        if !self.segments.is_empty() {
            tracing::warn!("Ignoring trace context accepted after a segment started");
            return AcceptOutcome::Ignored;
        }
        if self.accepted {
            tracing::warn!("Ignoring trace context, one was already accepted");
            return AcceptOutcome::Ignored;
        }

        match TraceContext::from_fields(fields) {
            Ok(parent) => {
                self.trace_id = parent.trace_id;
                self.parent_span_id = Some(parent.span_id);
                self.sampled = parent.sampled;
                self.priority = agent
                    .inherited_priority(&parent.trace_state)
                    .unwrap_or_else(|| agent.root_priority(parent.trace_id, parent.sampled));
                self.trace_state = parent.trace_state;
                self.accepted = true;

                self.span.record("trace.id", tracing::field::display(self.trace_id));
                self.span.record("parent.id", tracing::field::display(parent.span_id));
                self.link_span();

                AcceptOutcome::Accepted
            }
            Err(MalformedContext::Missing) => {
                tracing::debug!("No inbound trace context, continuing as a root transaction");
                AcceptOutcome::Missing
            }
            Err(e) => {
                tracing::warn!("Discarding inbound trace context: {}", e);
                AcceptOutcome::Malformed(e)
            }
        }
    }

    pub fn start_segment(&mut self, name: impl Into<String>) -> SegmentId {
        let name = name.into();
        let parent_id = self.current_span_id();
        let span_id = self
            .agent
            .as_ref()
            .map(|agent| agent.new_span_id())
            .unwrap_or(SpanId::INVALID);

        tracing::debug!(segment = %name, span.id = %span_id, "Segment started");

        let id = SegmentId(self.segments.len());
        self.segments.push(Segment {
            name,
            span_id,
            parent_id,
            started: Instant::now(),
            duration: None,
        });
        self.open_segments.push(id);
        id
    }

    pub fn end_segment(&mut self, id: SegmentId) {
        match self.segments.get_mut(id.0) {
            Some(segment) if segment.duration.is_none() => {
                let duration = segment.started.elapsed();
                segment.duration = Some(duration);
                self.open_segments.retain(|open| *open != id);
                tracing::debug!(segment = %segment.name, ?duration, "Segment ended");
            }
            Some(segment) => {
                tracing::warn!(segment = %segment.name, "Segment already ended");
            }
            None => {
                tracing::warn!("Unknown segment {:?}", id);
            }
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn record_custom_event<K, V, I>(&mut self, event_type: &str, fields: I)
    where
        K: Into<String>,
        V: Into<AttributeValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.custom_events.push(CustomEvent {
            event_type: event_type.to_string(),
            timestamp_ms: now_ms(),
            trace_id: self.trace_id.to_string(),
            attributes: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
    }

    /// Closes any open segments and produces the final record.
    pub fn finish(mut self) -> TransactionRecord {
        for id in std::mem::take(&mut self.open_segments) {
            if let Some(segment) = self.segments.get_mut(id.0) {
                segment.duration = Some(segment.started.elapsed());
            }
        }

        TransactionRecord {
            name: self.name,
            trace_id: self.trace_id.to_string(),
            span_id: self.span_id.to_string(),
            parent_span_id: self.parent_span_id.map(|id| id.to_string()),
            sampled: self.sampled,
            priority: self.priority,
            trace_state: self.trace_state.header(),
            timestamp_ms: self.timestamp_ms,
            duration: self.started.map(|s| s.elapsed()).unwrap_or_default(),
            segments: self
                .segments
                .into_iter()
                .map(|segment| SegmentRecord {
                    name: segment.name,
                    span_id: segment.span_id.to_string(),
                    parent_id: segment.parent_id.to_string(),
                    duration: segment.duration.unwrap_or_default(),
                })
                .collect(),
            attributes: self.attributes,
            custom_events: self.custom_events,
        }
    }

    fn current_span_id(&self) -> SpanId {
        self.open_segments
            .last()
            .and_then(|id| self.segments.get(id.0))
            .map(|segment| segment.span_id)
            .unwrap_or(self.span_id)
    }

    // Only a transaction continuing an upstream trace has a parent to point
    // at; a root's own span-id is never exported, so its span stays unparented.
    fn remote_parent(&self) -> Option<SpanContext> {
        let parent_span_id = self.parent_span_id?;
        let parent = TraceContext {
            trace_id: self.trace_id,
            span_id: parent_span_id,
            sampled: self.sampled,
            trace_state: self.trace_state.clone(),
        };
        Some(parent.to_span_context(true))
    }

    fn link_span(&self) {
        if let Some(parent) = self.remote_parent() {
            let _ = self
                .span
                .set_parent(Context::new().with_remote_span_context(parent));
        }
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
