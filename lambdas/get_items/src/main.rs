use std::sync::Arc;

use crate::config::Config;
use crate::event_handler::{function_handler, HandlerDeps};
use lambda_runtime::{run, service_fn, Error};
use shared::agent::Agent;
use shared::configuration::AgentConfig;
use shared::invoker::LambdaFunctionInvoker;

mod config;
mod event_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Cold start: a misconfigured agent aborts startup.
    let agent_config = AgentConfig::load()?;
    let otel_guard = Arc::new(shared::observability::init_otel(&agent_config)?);
    let agent = Agent::new(agent_config)?;

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let config = Config::load()?;
    let deps = HandlerDeps {
        agent,
        invoker: LambdaFunctionInvoker::new(aws_sdk_lambda::Client::new(&aws_config)),
        work_duration: config.work_duration(),
        next_function_name: config.next_function_name(),
    };

    run(service_fn(|event| async {
        let res = function_handler(&deps, event).await;

        deps.agent.flush();
        otel_guard.flush();

        res
    }))
    .await
}
