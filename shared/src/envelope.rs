use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::trace_context::{TraceContext, TraceFields};

/// Payload sent from one function to the next: the business request plus the
/// trace context of the sending transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetItemsRequest {
    pub sort_by: String,
    pub sort_order: String,
    pub items_to_get: i64,
    #[serde(default, deserialize_with = "trace_payload")]
    pub distributed_trace_payload: TraceFields,
}

impl GetItemsRequest {
    pub fn new(
        sort_by: impl Into<String>,
        sort_order: impl Into<String>,
        items_to_get: i64,
    ) -> Self {
        Self {
            sort_by: sort_by.into(),
            sort_order: sort_order.into(),
            items_to_get,
            distributed_trace_payload: TraceFields::new(),
        }
    }

    /// Replaces the embedded trace payload; business fields are untouched.
    pub fn attach_context(&mut self, context: &TraceContext) {
        self.distributed_trace_payload = context.to_fields();
    }
}

// Accepts `{"k": "v"}` as well as the multi-valued header shape
// `{"K": ["v"]}`; the first value of a list wins. Anything else in the
// payload is dropped so a bad context never fails the whole request.
fn trace_payload<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TraceFields, D::Error> {
    let headers = match Value::deserialize(deserializer)? {
        Value::Object(headers) => headers,
        Value::Null => return Ok(TraceFields::new()),
        other => {
            tracing::warn!("Ignoring distributed trace payload that is not a map: {}", other);
            return Ok(TraceFields::new());
        }
    };

    Ok(headers
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(value) => Some((key, value)),
            Value::Array(values) => match values.into_iter().next() {
                Some(Value::String(value)) => Some((key, value)),
                _ => None,
            },
            _ => {
                tracing::warn!("Ignoring distributed trace field {} with a non-string value", key);
                None
            }
        })
        .collect())
}
