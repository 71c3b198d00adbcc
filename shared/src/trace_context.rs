use std::collections::HashMap;
use std::str::FromStr;

use opentelemetry::{
    trace::{SpanContext, TraceState},
    SpanId, TraceFlags, TraceId,
};

use crate::error::MalformedContext;

pub const TRACEPARENT_KEY: &str = "traceparent";
pub const TRACESTATE_KEY: &str = "tracestate";

const SUPPORTED_VERSION: &str = "00";
const FORBIDDEN_VERSION: &str = "ff";

/// Header-like key/value pairs carried between functions.
pub type TraceFields = HashMap<String, String>;

/// A position in a distributed trace, as handed from one function to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
    pub trace_state: TraceState,
}

impl Default for TraceContext {
    fn default() -> Self {
        Self {
            trace_id: TraceId::INVALID,
            span_id: SpanId::INVALID,
            sampled: false,
            trace_state: TraceState::NONE,
        }
    }
}

impl TraceContext {
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }

    pub fn trace_flags(&self) -> TraceFlags {
        if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        }
    }

    pub fn traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            SUPPORTED_VERSION,
            self.trace_id,
            self.span_id,
            self.trace_flags().to_u8()
        )
    }

    /// Encodes the context as transport fields. A context without valid ids
    /// (e.g. from a transaction that never started) encodes to no fields.
    pub fn to_fields(&self) -> TraceFields {
        let mut fields = TraceFields::new();
        if !self.is_valid() {
            tracing::debug!("Skipping trace context encoding, ids are not set");
            return fields;
        }

        fields.insert(TRACEPARENT_KEY.to_string(), self.traceparent());

        let trace_state = self.trace_state.header();
        if !trace_state.is_empty() {
            fields.insert(TRACESTATE_KEY.to_string(), trace_state);
        }

        fields
    }

    /// Decodes transport fields. Keys are matched case-insensitively, so both
    /// `traceparent` and `Traceparent` are understood.
    pub fn from_fields(fields: &TraceFields) -> Result<Self, MalformedContext> {
        let traceparent = find_field(fields, TRACEPARENT_KEY)
            .filter(|value| !value.is_empty())
            .ok_or(MalformedContext::Missing)?;

        let (trace_id, span_id, sampled) = parse_traceparent(traceparent)?;

        let trace_state = match find_field(fields, TRACESTATE_KEY).filter(|ts| !ts.is_empty()) {
            Some(header) => TraceState::from_str(header).unwrap_or_else(|_| {
                tracing::debug!("Dropping unparseable tracestate: {}", header);
                TraceState::NONE
            }),
            None => TraceState::NONE,
        };

        Ok(Self {
            trace_id,
            span_id,
            sampled,
            trace_state,
        })
    }

    pub fn to_span_context(&self, is_remote: bool) -> SpanContext {
        SpanContext::new(
            self.trace_id,
            self.span_id,
            self.trace_flags(),
            is_remote,
            self.trace_state.clone(),
        )
    }
}

// Exact key first; otherwise the case-insensitive match with the smallest key,
// so the choice does not depend on map iteration order.
fn find_field<'a>(fields: &'a TraceFields, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .or_else(|| {
            fields
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(key))
                .min_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, v)| v)
        })
        .map(|v| v.trim())
}

fn parse_traceparent(traceparent: &str) -> Result<(TraceId, SpanId, bool), MalformedContext> {
    let parts: Vec<&str> = traceparent.split('-').collect();

    if parts.len() < 4 {
        return Err(MalformedContext::Invalid("expected four dash-separated fields"));
    }

    let version = parts[0];
    if !is_lower_hex(version, 2) {
        return Err(MalformedContext::Invalid("version is not two lowercase hex digits"));
    }
    if version == FORBIDDEN_VERSION {
        return Err(MalformedContext::Invalid("version ff is forbidden"));
    }
    if version == SUPPORTED_VERSION && parts.len() != 4 {
        return Err(MalformedContext::Invalid("version 00 carries exactly four fields"));
    }

    if !is_lower_hex(parts[1], 32) {
        return Err(MalformedContext::Invalid("trace-id is not 32 lowercase hex digits"));
    }
    let trace_id = TraceId::from_hex(parts[1])
        .map_err(|_| MalformedContext::Invalid("trace-id is not hex"))?;
    if trace_id == TraceId::INVALID {
        return Err(MalformedContext::Invalid("trace-id is all zeros"));
    }

    if !is_lower_hex(parts[2], 16) {
        return Err(MalformedContext::Invalid("parent-id is not 16 lowercase hex digits"));
    }
    let span_id = SpanId::from_hex(parts[2])
        .map_err(|_| MalformedContext::Invalid("parent-id is not hex"))?;
    if span_id == SpanId::INVALID {
        return Err(MalformedContext::Invalid("parent-id is all zeros"));
    }

    if !is_lower_hex(parts[3], 2) {
        return Err(MalformedContext::Invalid("trace-flags is not two lowercase hex digits"));
    }
    let flags = u8::from_str_radix(parts[3], 16)
        .map_err(|_| MalformedContext::Invalid("trace-flags is not hex"))?;

    Ok((trace_id, span_id, flags & TraceFlags::SAMPLED.to_u8() != 0))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
