pub mod agent;
pub mod configuration;
pub mod envelope;
pub mod error;
pub mod invoker;
pub mod observability;
pub mod propagation;
pub mod trace_context;
pub mod transaction;
