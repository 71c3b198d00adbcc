use std::time::Duration;

use lambda_runtime::{Error, LambdaEvent};
use shared::agent::Agent;
use shared::envelope::GetItemsRequest;
use shared::invoker::FunctionInvoker;
use shared::propagation::dispatch_with_context;
use shared::transaction::{AcceptOutcome, Transaction};
use tracing::Instrument;

pub(crate) const SUCCESS: &str = "Success!";

pub(crate) struct HandlerDeps<I: FunctionInvoker> {
    pub agent: Agent,
    pub invoker: I,
    pub work_duration: Duration,
    pub next_function_name: Option<String>,
}

#[tracing::instrument(skip(deps, event), fields(faas.invocation_id = %event.context.request_id))]
pub(crate) async fn function_handler<I: FunctionInvoker>(
    deps: &HandlerDeps<I>,
    event: LambdaEvent<GetItemsRequest>,
) -> Result<String, Error> {
    let mut transaction = deps.agent.start_transaction(&deps.agent.config().app_name);
    transaction.add_attribute("aws.requestId", event.context.request_id.clone());

    let span = transaction.span().clone();
    get_items(deps, &mut transaction, event.payload)
        .instrument(span)
        .await;

    deps.agent.end_transaction(transaction);
    Ok(SUCCESS.to_string())
}

async fn get_items<I: FunctionInvoker>(
    deps: &HandlerDeps<I>,
    transaction: &mut Transaction,
    request: GetItemsRequest,
) {
    // Accept before any segment starts, so the work below reports under the caller's trace
    match transaction.accept_context(&request.distributed_trace_payload) {
        AcceptOutcome::Accepted => tracing::info!("Accepted Distributed Tracing Payload"),
        AcceptOutcome::Missing => {
            tracing::info!("No Distributed Tracing Payload, tracing as a new root")
        }
        AcceptOutcome::Malformed(e) => {
            tracing::warn!("Ignoring malformed Distributed Tracing Payload: {}", e)
        }
        AcceptOutcome::Ignored => tracing::debug!("Distributed Tracing Payload not accepted"),
    }
    transaction.record_custom_event("MyRustEvent", [("zip", "zap")]);

    let segment = transaction.start_segment("goToSleep");
    tracing::info!("Going to sleep....yawn");
    tokio::time::sleep(deps.work_duration).await;
    tracing::info!("Woke up....yawn");
    transaction.end_segment(segment);

    match &deps.next_function_name {
        Some(next_function_name) => {
            let mut onward = GetItemsRequest::new(
                request.sort_by,
                request.sort_order,
                request.items_to_get,
            );
            if let Err(e) =
                dispatch_with_context(transaction, &deps.invoker, next_function_name, &mut onward)
                    .await
            {
                tracing::warn!("Continuing without onward invocation: {}", e);
            }
        }
        None => {
            let onward = transaction.emit_context().to_fields();
            tracing::info!(fields = ?onward, "Distributed trace fields ready for the next hop");
        }
    }

    transaction.add_attribute("ItemsToGet", request.items_to_get);
}

#[cfg(test)]
mod tests {
    use super::{function_handler, HandlerDeps, SUCCESS};
    use lambda_runtime::{Context, LambdaEvent};
    use mockall::predicate::{always, eq};
    use serde_json::json;
    use shared::agent::Agent;
    use shared::configuration::AgentConfig;
    use shared::envelope::GetItemsRequest;
    use shared::invoker::{DispatchHandle, MockFunctionInvoker};
    use shared::trace_context::{TraceContext, TraceFields};
    use shared::transaction::AttributeValue;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const CALLER_TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const CALLER_SPAN_ID: &str = "00f067aa0ba902b7";

    fn deps(
        invoker: MockFunctionInvoker,
        next_function_name: Option<&str>,
    ) -> HandlerDeps<MockFunctionInvoker> {
        HandlerDeps {
            agent: Agent::new(AgentConfig {
                app_name: "get-items".into(),
                account_id: "1234567".into(),
                ..AgentConfig::default()
            })
            .unwrap(),
            invoker,
            work_duration: Duration::ZERO,
            next_function_name: next_function_name.map(String::from),
        }
    }

    fn create_lambda_event(payload: serde_json::Value) -> LambdaEvent<GetItemsRequest> {
        let request = serde_json::from_value(payload).expect("Failed to create GetItemsRequest");
        LambdaEvent::new(request, Context::default())
    }

    fn caller_payload() -> serde_json::Value {
        json!({
            "SortBy": "time",
            "SortOrder": "descending",
            "ItemsToGet": 10,
            "DistributedTracePayload": {
                "traceparent": format!("00-{CALLER_TRACE_ID}-{CALLER_SPAN_ID}-01"),
                "tracestate": "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE"
            }
        })
    }

    #[tokio::test]
    async fn when_caller_context_present_should_continue_its_trace() {
        let mut invoker = MockFunctionInvoker::new();
        invoker.expect_invoke_async().times(0);
        let deps = deps(invoker, None);

        let result = function_handler(&deps, create_lambda_event(caller_payload())).await;

        assert_eq!(result.unwrap(), SUCCESS);
        let records = deps.agent.drain();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.trace_id, CALLER_TRACE_ID);
        assert_ne!(record.span_id, CALLER_SPAN_ID);
        assert_eq!(record.parent_span_id.as_deref(), Some(CALLER_SPAN_ID));
        assert!(record.sampled);
        assert_eq!(record.trace_state, "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE");
        assert_eq!(record.segments.len(), 1);
        assert_eq!(record.segments[0].name, "goToSleep");
        assert_eq!(record.attributes.get("ItemsToGet"), Some(&AttributeValue::Int(10)));
        assert_eq!(record.custom_events[0].trace_id, CALLER_TRACE_ID);
    }

    #[tokio::test]
    async fn when_trace_payload_is_empty_should_trace_as_new_root() {
        let mut invoker = MockFunctionInvoker::new();
        invoker.expect_invoke_async().times(0);
        let deps = deps(invoker, None);
        let payload = json!({
            "SortBy": "time",
            "SortOrder": "descending",
            "ItemsToGet": 5,
            "DistributedTracePayload": {}
        });

        let result = function_handler(&deps, create_lambda_event(payload)).await;

        assert_eq!(result.unwrap(), SUCCESS);
        let record = &deps.agent.drain()[0];
        assert_eq!(record.trace_id.len(), 32);
        assert_ne!(record.trace_id, "0".repeat(32));
        assert_eq!(record.parent_span_id, None);
    }

    #[tokio::test]
    async fn when_trace_payload_is_garbled_should_trace_as_new_root() {
        let mut invoker = MockFunctionInvoker::new();
        invoker.expect_invoke_async().times(0);
        let deps = deps(invoker, None);
        let payload = json!({
            "SortBy": "time",
            "SortOrder": "descending",
            "ItemsToGet": 5,
            "DistributedTracePayload": {"Traceparent": ["not-a-traceparent"]}
        });

        let result = function_handler(&deps, create_lambda_event(payload)).await;

        assert_eq!(result.unwrap(), SUCCESS);
        let record = &deps.agent.drain()[0];
        assert_ne!(record.trace_id, CALLER_TRACE_ID);
        assert_eq!(record.parent_span_id, None);
    }

    #[tokio::test]
    async fn when_trace_payload_has_wrong_types_should_trace_as_new_root() {
        for trace_payload in [json!({"traceparent": 42}), json!("garbage")] {
            let mut invoker = MockFunctionInvoker::new();
            invoker.expect_invoke_async().times(0);
            let deps = deps(invoker, None);
            let payload = json!({
                "SortBy": "time",
                "SortOrder": "descending",
                "ItemsToGet": 5,
                "DistributedTracePayload": trace_payload
            });

            let result = function_handler(&deps, create_lambda_event(payload)).await;

            assert_eq!(result.unwrap(), SUCCESS);
            let record = &deps.agent.drain()[0];
            assert_eq!(record.trace_id.len(), 32);
            assert_eq!(record.parent_span_id, None);
        }
    }

    #[tokio::test]
    async fn when_next_function_configured_should_forward_same_trace() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let captured = sent.clone();
        let mut invoker = MockFunctionInvoker::new();
        invoker
            .expect_invoke_async()
            .times(1)
            .with(eq("get-more-items"), always())
            .returning(move |function_name, payload| {
                *captured.lock().unwrap() = payload;
                Ok(DispatchHandle {
                    function_name: function_name.to_string(),
                    status_code: 202,
                })
            });
        let deps = deps(invoker, Some("get-more-items"));

        let result = function_handler(&deps, create_lambda_event(caller_payload())).await;

        assert_eq!(result.unwrap(), SUCCESS);
        let forwarded: GetItemsRequest = serde_json::from_slice(&sent.lock().unwrap()).unwrap();
        assert_eq!(forwarded.items_to_get, 10);
        let context: TraceContext =
            TraceContext::from_fields(&forwarded.distributed_trace_payload).unwrap();
        assert_eq!(context.trace_id.to_string(), CALLER_TRACE_ID);
        assert_ne!(context.span_id.to_string(), CALLER_SPAN_ID);
        assert!(context.sampled);
        let trace_state = context.trace_state.header();
        assert!(trace_state.starts_with("1234567@nr="));
        assert!(trace_state.ends_with(",rojo=00f067aa0ba902b7,congo=t61rcWkgMzE"));

        let record = &deps.agent.drain()[0];
        assert_eq!(record.segments.len(), 2);
        assert_eq!(record.segments[1].span_id, context.span_id.to_string());
    }

    #[tokio::test]
    async fn when_onward_dispatch_fails_should_still_succeed() {
        let mut invoker = MockFunctionInvoker::new();
        invoker.expect_invoke_async().times(1).returning(|function_name, _| {
            Err(shared::error::DispatchError::UnexpectedStatus {
                function_name: function_name.to_string(),
                status_code: 500,
            })
        });
        let deps = deps(invoker, Some("get-more-items"));
        let event = create_lambda_event(json!({
            "SortBy": "time",
            "SortOrder": "descending",
            "ItemsToGet": 1,
            "DistributedTracePayload": TraceFields::new()
        }));

        let result = function_handler(&deps, event).await;

        assert_eq!(result.unwrap(), SUCCESS);
        assert!(deps.agent.drain()[0]
            .attributes
            .contains_key(shared::propagation::DISPATCH_ERROR_ATTRIBUTE));
    }
}
