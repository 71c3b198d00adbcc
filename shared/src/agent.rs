use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry::{trace::TraceState, SpanId, TraceId};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

use crate::configuration::AgentConfig;
use crate::error::ConfigurationError;
use crate::transaction::{Transaction, TransactionRecord};

const VENDOR_SUFFIX: &str = "@nr";
const VENDOR_VERSION: &str = "0";
const PARENT_TYPE_APP: &str = "0";
const PRIORITY_FIELD: usize = 7;

/// The process-wide instrumentation agent.
///
/// Built once at cold start and handed to every invocation by reference.
/// Finished transactions are buffered until [`Agent::flush`] is called at the
/// end of the invocation.
pub struct Agent {
    core: Arc<AgentCore>,
    harvest: Mutex<Vec<TransactionRecord>>,
}

/// State shared between the agent and the transactions it starts.
#[derive(Debug)]
pub(crate) struct AgentCore {
    pub(crate) config: AgentConfig,
    pub(crate) id_generator: Box<dyn IdGenerator>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, ConfigurationError> {
        Self::with_id_generator(config, RandomIdGenerator::default())
    }

    pub fn with_id_generator<G: IdGenerator + 'static>(
        config: AgentConfig,
        id_generator: G,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        tracing::info!(
            app_name = %config.app_name,
            distributed_tracing = config.distributed_tracing_enabled,
            "Agent initialised"
        );

        Ok(Self {
            core: Arc::new(AgentCore {
                config,
                id_generator: Box::new(id_generator),
            }),
            harvest: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.core.config
    }

    /// Starts a root transaction with a fresh trace-id and sampling decision.
    pub fn start_transaction(&self, name: &str) -> Transaction {
        Transaction::start(self.core.clone(), name)
    }

    /// Closes the transaction and queues its record for the next flush.
    pub fn end_transaction(&self, transaction: Transaction) -> TransactionRecord {
        let record = transaction.finish();
        self.harvest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        record
    }

    /// Takes every queued record out of the harvest buffer.
    pub fn drain(&self) -> Vec<TransactionRecord> {
        std::mem::take(&mut *self.harvest.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Writes queued records to the log and empties the buffer.
    pub fn flush(&self) -> usize {
        let records = self.drain();
        for record in &records {
            match serde_json::to_string(record) {
                Ok(json) => tracing::info!(
                    target: "agent::harvest",
                    trace_id = %record.trace_id,
                    record = %json,
                    "Transaction harvested"
                ),
                Err(e) => tracing::error!("Failed to serialize transaction record: {:?}", e),
            }
        }
        records.len()
    }
}

/// Fields written into the agent's own tracestate entry.
pub(crate) struct VendorEntry {
    pub span_id: SpanId,
    pub transaction_id: SpanId,
    pub sampled: bool,
    pub priority: f32,
}

impl AgentCore {
    pub(crate) fn new_trace_id(&self) -> TraceId {
        self.id_generator.new_trace_id()
    }

    pub(crate) fn new_span_id(&self) -> SpanId {
        self.id_generator.new_span_id()
    }

    /// Trace-id ratio sampling, decided once at the root of a trace.
    pub(crate) fn should_sample(&self, trace_id: TraceId) -> bool {
        let ratio = self.config.sampling_ratio;
        if ratio >= 1.0 {
            return true;
        }
        if ratio <= 0.0 {
            return false;
        }
        let threshold = (ratio * (1u64 << 63) as f64) as u64;
        lower_bits(trace_id) >> 1 < threshold
    }

    /// Root priority in `[0, 1)` derived from the trace-id, plus one when sampled.
    pub(crate) fn root_priority(&self, trace_id: TraceId, sampled: bool) -> f32 {
        let fraction = (lower_bits(trace_id) >> 40) as f32 / (1u32 << 24) as f32;
        if sampled {
            fraction + 1.0
        } else {
            fraction
        }
    }

    pub(crate) fn vendor_key(&self) -> String {
        format!("{}{}", self.config.trusted_account_key(), VENDOR_SUFFIX)
    }

    /// Priority carried by an upstream entry of this account, if any.
    pub(crate) fn inherited_priority(&self, trace_state: &TraceState) -> Option<f32> {
        trace_state
            .get(&self.vendor_key())
            .and_then(|entry| entry.split('-').nth(PRIORITY_FIELD))
            .and_then(|priority| f32::from_str(priority).ok())
    }

    /// Inserts (or refreshes) this agent's entry at the front of `trace_state`,
    /// leaving every other entry in place.
    pub(crate) fn with_vendor_entry(
        &self,
        trace_state: &TraceState,
        entry: VendorEntry,
    ) -> TraceState {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let value = format!(
            "{}-{}-{}-{}-{}-{}-{}-{:.6}-{}",
            VENDOR_VERSION,
            PARENT_TYPE_APP,
            self.config.account_id,
            self.config.primary_application_id,
            entry.span_id,
            entry.transaction_id,
            if entry.sampled { "1" } else { "0" },
            entry.priority,
            timestamp
        );

        match trace_state.insert(self.vendor_key(), value) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!("Could not add vendor tracestate entry: {:?}", e);
                trace_state.clone()
            }
        }
    }
}

fn lower_bits(trace_id: TraceId) -> u64 {
    let bytes = trace_id.to_bytes();
    let mut lower = [0u8; 8];
    lower.copy_from_slice(&bytes[8..]);
    u64::from_be_bytes(lower)
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::test_support::{agent_config, SequentialIdGenerator};
    use super::*;
    use crate::configuration::AgentConfig;
    use crate::trace_context::TRACEPARENT_KEY;

    #[test]
    fn when_config_is_invalid_should_refuse_to_start() {
        let result = Agent::new(AgentConfig::default());

        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn when_root_transactions_started_trace_ids_should_be_unique() {
        let agent = Agent::new(agent_config()).unwrap();

        let trace_ids: HashSet<String> = (0..10_000)
            .map(|_| {
                let transaction = agent.start_transaction("root");
                let fields = transaction.emit_context().to_fields();
                fields.get(TRACEPARENT_KEY).unwrap()[3..35].to_string()
            })
            .collect();

        assert_eq!(trace_ids.len(), 10_000);
    }

    #[test]
    fn when_transactions_ended_should_be_harvested_once() {
        let agent =
            Agent::with_id_generator(agent_config(), SequentialIdGenerator::default()).unwrap();

        agent.end_transaction(agent.start_transaction("first"));
        agent.end_transaction(agent.start_transaction("second"));

        assert_eq!(agent.flush(), 2);
        assert!(agent.drain().is_empty());
    }

    #[test]
    fn when_sampling_ratio_is_zero_roots_should_not_be_sampled() {
        let config = AgentConfig {
            sampling_ratio: 0.0,
            ..agent_config()
        };
        let agent = Agent::new(config).unwrap();

        let transaction = agent.start_transaction("root");

        assert!(!transaction.is_sampled());
        assert!(transaction.emit_context().to_fields()[TRACEPARENT_KEY].ends_with("-00"));
    }

    #[test]
    fn when_vendor_entry_inserted_should_lead_and_preserve_others() {
        let agent =
            Agent::with_id_generator(agent_config(), SequentialIdGenerator::default()).unwrap();
        let upstream = TraceState::from_str(
            "1234567@nr=0-0-1-2-3-4-1-1.500000-5,rojo=00f067aa0ba902b7,congo=t61rcWkgMzE",
        )
        .unwrap();

        let updated = agent.core.with_vendor_entry(
            &upstream,
            VendorEntry {
                span_id: SpanId::from_bytes([1; 8]),
                transaction_id: SpanId::from_bytes([2; 8]),
                sampled: true,
                priority: 1.25,
            },
        );

        let header = updated.header();
        assert!(header.starts_with(
            "1234567@nr=0-0-1234567-98765-0101010101010101-0202020202020202-1-1.250000-"
        ));
        assert!(header.ends_with(",rojo=00f067aa0ba902b7,congo=t61rcWkgMzE"));
        assert_eq!(agent.core.inherited_priority(&upstream), Some(1.5));
    }
}
