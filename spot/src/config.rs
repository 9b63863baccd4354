use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// Tunables for one engine instance.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    /// Max messages pulled per blocking read.
    pub batch_size: usize,
    /// Blocking-read timeout; keeps the loop re-evaluating shutdown.
    pub block_millis: u64,
    /// Pending deliveries idle longer than this are reclaimed.
    pub claim_idle_millis: u64,
    /// Per-cycle match cap, so matching yields back to message intake.
    pub match_cap: usize,
    /// Consecutive cycle errors before the engine fatally aborts.
    pub error_threshold: u32,
    pub retry_max: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_backoff_cap_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
    /// Failures per message before dead-letter diversion.
    pub dlq_max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            batch_size: 64,
            block_millis: 1000,
            claim_idle_millis: 30_000,
            match_cap: 128,
            error_threshold: 50,
            retry_max: 3,
            retry_base_backoff_ms: 50,
            retry_backoff_cap_ms: 2000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 10_000,
            dlq_max_retries: 5,
        }
    }
}

/// Worker counts and channel sizing for the cooperative pipeline driver.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineSettings {
    pub channel_capacity: usize,
    pub processors: usize,
    pub matchers: usize,
    pub persisters: usize,
    /// Matcher wakeup period when no signals arrive.
    pub matcher_wakeup_millis: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            channel_capacity: 256,
            processors: 2,
            matchers: 1,
            persisters: 2,
            matcher_wakeup_millis: 250,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub metrics_addr: String,
    /// MySQL connection URL; empty selects the in-memory store.
    pub database_url: String,
    /// Instruments to run engines for, e.g. ["BTC/USDT"].
    pub instruments: Vec<String>,
    /// Concurrency driver: "serial" or "pipeline".
    pub strategy: String,
    pub engine: EngineSettings,
    pub pipeline: PipelineSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            metrics_addr: "0.0.0.0:4010".to_string(),
            database_url: String::new(),
            instruments: vec!["BTC/USDT".to_string()],
            strategy: "serial".to_string(),
            engine: EngineSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig::default()
    }

    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        *instance().lock().unwrap() = config.clone();
        Some(config)
    }
}
