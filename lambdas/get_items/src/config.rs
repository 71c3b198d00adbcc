use std::time::Duration;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Config {
    pub work_duration_ms: u64,
    pub next_function_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_duration_ms: 1000,
            next_function_name: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::raw().only(&["WORK_DURATION_MS", "NEXT_FUNCTION_NAME"]))
            .extract()
    }

    pub fn work_duration(&self) -> Duration {
        Duration::from_millis(self.work_duration_ms)
    }

    pub fn next_function_name(&self) -> Option<String> {
        self.next_function_name
            .clone()
            .filter(|name| !name.trim().is_empty())
    }
}
