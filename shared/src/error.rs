use thiserror::Error;

/// The agent could not be configured at cold start. Fatal to the process.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to load agent configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid agent configuration: {0}")]
    Invalid(String),
}

/// The outbound envelope could not be encoded. Aborts that one dispatch.
#[derive(Debug, Error)]
#[error("failed to serialize envelope: {0}")]
pub struct SerializationError(#[from] pub serde_json::Error);

/// The downstream function could not be invoked at send time.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invocation of {function_name} was rejected: {message}")]
    Service {
        function_name: String,
        message: String,
    },
    #[error("invocation of {function_name} returned unexpected status {status_code}")]
    UnexpectedStatus {
        function_name: String,
        status_code: i32,
    },
}

/// Inbound trace fields that cannot be turned into a parent context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedContext {
    #[error("no traceparent field present")]
    Missing,
    #[error("invalid traceparent: {0}")]
    Invalid(&'static str),
}

/// Anything that can go wrong while propagating a context to another function.
#[derive(Debug, Error)]
pub enum PropagationError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
