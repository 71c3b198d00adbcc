use async_trait::async_trait;
use aws_sdk_lambda::error::{DisplayErrorContext, SdkError};
use aws_sdk_lambda::{primitives::Blob, types::InvocationType, Client};

use crate::error::DispatchError;

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// Send-time acknowledgement of a fire-and-forget invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchHandle {
    pub function_name: String,
    pub status_code: i32,
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Queues an asynchronous invocation. Only the send-time outcome is
    /// reported; the downstream function's own result is never observed.
    async fn invoke_async(
        &self,
        function_name: &str,
        payload: Vec<u8>,
    ) -> Result<DispatchHandle, DispatchError>;
}

pub struct LambdaFunctionInvoker {
    lambda_client: Client,
}

impl LambdaFunctionInvoker {
    pub fn new(lambda_client: Client) -> Self {
        Self { lambda_client }
    }
}

#[async_trait]
impl FunctionInvoker for LambdaFunctionInvoker {
    async fn invoke_async(
        &self,
        function_name: &str,
        payload: Vec<u8>,
    ) -> Result<DispatchHandle, DispatchError> {
        let result = self
            .lambda_client
            .invoke()
            .function_name(function_name)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(payload))
            .send()
            .await;

        match result {
            Ok(output) if (200..300).contains(&output.status_code()) => Ok(DispatchHandle {
                function_name: function_name.to_string(),
                status_code: output.status_code(),
            }),
            Ok(output) => Err(DispatchError::UnexpectedStatus {
                function_name: function_name.to_string(),
                status_code: output.status_code(),
            }),
            Err(e) => Err(service_error(function_name, &e)),
        }
    }
}

// Keeps the whole source chain, so timeouts and connector failures stay readable.
fn service_error<E, R>(function_name: &str, error: &SdkError<E, R>) -> DispatchError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    DispatchError::Service {
        function_name: function_name.to_string(),
        message: DisplayErrorContext(error).to_string(),
    }
}
