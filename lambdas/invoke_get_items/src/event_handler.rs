use lambda_runtime::{Error, LambdaEvent};
use opentelemetry::{global, KeyValue};
use serde_json::Value;
use shared::agent::Agent;
use shared::envelope::GetItemsRequest;
use shared::invoker::FunctionInvoker;
use shared::propagation::dispatch_with_context;
use shared::transaction::Transaction;
use tracing::Instrument;

pub(crate) const SUCCESS: &str = "Success!";

pub(crate) struct HandlerDeps<I: FunctionInvoker> {
    pub agent: Agent,
    pub invoker: I,
    pub target_function_name: String,
}

#[tracing::instrument(skip(deps, event), fields(faas.invocation_id = %event.context.request_id))]
pub(crate) async fn function_handler<I: FunctionInvoker>(
    deps: &HandlerDeps<I>,
    event: LambdaEvent<Value>,
) -> Result<String, Error> {
    let mut transaction = deps.agent.start_transaction(&deps.agent.config().app_name);
    transaction.add_attribute("aws.requestId", event.context.request_id.clone());

    let span = transaction.span().clone();
    invoke_get_items(deps, &mut transaction).instrument(span).await;

    deps.agent.end_transaction(transaction);
    Ok(SUCCESS.to_string())
}

async fn invoke_get_items<I: FunctionInvoker>(
    deps: &HandlerDeps<I>,
    transaction: &mut Transaction,
) {
    let meter = global::meter("invoke_get_items");
    let dispatch_counter = meter.u64_counter("downstream_dispatches").build();

    transaction.record_custom_event("MyRustEvent", [("zip", "zap")]);

    let mut request = GetItemsRequest::new("time", "descending", 10);
    tracing::info!("Invoking lambda function: {}", deps.target_function_name);

    let outcome = match dispatch_with_context(
        transaction,
        &deps.invoker,
        &deps.target_function_name,
        &mut request,
    )
    .await
    {
        Ok(handle) => {
            tracing::info!("Request Complete, Got StatusCode: {}", handle.status_code);
            "dispatched"
        }
        Err(e) => {
            tracing::warn!("Continuing without downstream invocation: {}", e);
            "failed"
        }
    };
    dispatch_counter.add(1, &[KeyValue::new("outcome", outcome)]);

    // Lands on the invocation's own transaction record
    transaction.add_attribute("customAttribute", "customAttributeValue");
}
