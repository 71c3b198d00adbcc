use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigurationError;

/// Settings for the process-wide instrumentation agent, read once at cold start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub app_name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub account_id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub trusted_account_key: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub primary_application_id: String,
    pub distributed_tracing_enabled: bool,
    pub sampling_ratio: f64,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_name: "unknown-function".to_string(),
            account_id: String::new(),
            trusted_account_key: None,
            primary_application_id: "Unknown".to_string(),
            distributed_tracing_enabled: true,
            sampling_ratio: 1.0,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Defaults, then the Lambda function name as `app_name`, then any
    /// `AGENT_*` variable (`AGENT_ACCOUNT_ID`, `AGENT_SAMPLING_RATIO`, ...).
    pub fn load() -> Result<Self, ConfigurationError> {
        let config: AgentConfig = Figment::from(Serialized::defaults(AgentConfig::default()))
            .merge(
                Env::raw()
                    .only(&["AWS_LAMBDA_FUNCTION_NAME"])
                    .map(|_| "app_name".into()),
            )
            .merge(Env::prefixed("AGENT_"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigurationError::Invalid("app_name must not be empty".into()));
        }
        if self.distributed_tracing_enabled && self.account_id.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "account_id is required when distributed tracing is enabled".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(ConfigurationError::Invalid(format!(
                "sampling_ratio must be within [0, 1], got {}",
                self.sampling_ratio
            )));
        }
        Ok(())
    }

    /// The tracestate tenant; falls back to the account id.
    pub fn trusted_account_key(&self) -> &str {
        self.trusted_account_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .unwrap_or(&self.account_id)
    }
}

// Numeric-looking env values (account ids) come through figment as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Unsigned(u64),
    Signed(i64),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Unsigned(n) => n.to_string(),
            StringOrNumber::Signed(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    StringOrNumber::deserialize(deserializer).map(String::from)
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<StringOrNumber>::deserialize(deserializer).map(|value| value.map(String::from))
}
