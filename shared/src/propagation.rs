use crate::envelope::GetItemsRequest;
use crate::error::{PropagationError, SerializationError};
use crate::invoker::{DispatchHandle, FunctionInvoker};
use crate::trace_context::TRACEPARENT_KEY;
use crate::transaction::Transaction;

pub const DISPATCH_ERROR_ATTRIBUTE: &str = "dispatch.error";
pub const DISPATCH_STATUS_ATTRIBUTE: &str = "dispatch.statusCode";

/// Sends `request` to `function_name` carrying the transaction's trace context.
///
/// The call runs inside its own segment, so the downstream transaction becomes
/// a child of that segment. Failures are recorded on the transaction and
/// returned for logging; they are never meant to fail the caller's own work.
#[tracing::instrument("dispatch", skip(transaction, invoker, request), fields(
    faas.invoked_name = function_name,
    faas.invocation_type = "event",
))]
pub async fn dispatch_with_context<I: FunctionInvoker + ?Sized>(
    transaction: &mut Transaction,
    invoker: &I,
    function_name: &str,
    request: &mut GetItemsRequest,
) -> Result<DispatchHandle, PropagationError> {
    let segment = transaction.start_segment(format!("Lambda/invoke/{function_name}"));

    let context = transaction.emit_context();
    request.attach_context(&context);
    tracing::info!(
        traceparent = request
            .distributed_trace_payload
            .get(TRACEPARENT_KEY)
            .map(String::as_str)
            .unwrap_or_default(),
        "Inserted distributed trace fields for context propagation"
    );

    let result = match serde_json::to_vec(request) {
        Ok(payload) => invoker
            .invoke_async(function_name, payload)
            .await
            .map_err(PropagationError::from),
        Err(e) => Err(SerializationError(e).into()),
    };
    transaction.end_segment(segment);

    match &result {
        Ok(handle) => {
            transaction.add_attribute(DISPATCH_STATUS_ATTRIBUTE, i64::from(handle.status_code));
        }
        Err(e) => {
            tracing::error!("Failed to invoke {}: {}", function_name, e);
            transaction.add_attribute(DISPATCH_ERROR_ATTRIBUTE, e.to_string());
        }
    }

    result
}
