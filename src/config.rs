use anyhow::Result;
use chrono::Weekday;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for shipflow
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ShipflowConfig {
    /// Guard evaluation settings
    pub guards: GuardSettings,
    /// SLA scheduler settings
    pub scheduler: SchedulerSettings,
    /// Saga execution settings
    pub sagas: SagaSettings,
    /// Business calendar used by business-hours SLA policies
    pub business_hours: BusinessHoursConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Audit mirror settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Individual guard timeout
    pub per_guard_timeout_ms: u64,
    /// Deadline for all guards of one transition
    pub overall_deadline_ms: u64,
    /// Guards evaluated concurrently
    pub max_concurrency: usize,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            per_guard_timeout_ms: 2_000,
            overall_deadline_ms: 5_000,
            max_concurrency: 8,
        }
    }
}

impl GuardSettings {
    pub fn per_guard_timeout(&self) -> Duration {
        Duration::from_millis(self.per_guard_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Duration {
        Duration::from_millis(self.overall_deadline_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the scheduler loop checks for expired timers
    pub tick_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SagaSettings {
    /// First retry delay
    pub backoff_base_ms: u64,
    /// Upper bound for a single retry delay
    pub backoff_max_ms: u64,
    /// Add random jitter to retry delays
    pub jitter: bool,
    /// Retries per compensation before alerting an operator
    pub compensation_retries: u32,
    /// How long a trigger idempotency key is remembered
    pub idempotency_ttl_secs: u64,
    /// Maximum number of remembered trigger keys
    pub idempotency_capacity: u64,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            jitter: true,
            compensation_retries: 2,
            idempotency_ttl_secs: 7 * 24 * 3_600, // one week
            idempotency_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusinessHoursConfig {
    /// Offset of the operating timezone from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// Opening hour (local, 0-23)
    pub open_hour: u32,
    /// Closing hour (local, 1-24)
    pub close_hour: u32,
    /// Working days, e.g. ["mon", "tue", "wed", "thu", "fri"]
    pub working_days: Vec<String>,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            open_hour: 9,
            close_hour: 17,
            working_days: ["mon", "tue", "wed", "thu", "fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl BusinessHoursConfig {
    /// Parsed working days; unknown names are skipped.
    pub fn weekdays(&self) -> Vec<Weekday> {
        self.working_days
            .iter()
            .filter_map(|d| d.parse::<Weekday>().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON logs instead of human-readable ones
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl ShipflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (shipflow.toml, .shipflow-rc)
    /// 3. Environment variables (prefixed with SHIPFLOW_)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("shipflow.toml").exists() {
            builder = builder.add_source(File::with_name("shipflow"));
        }

        if Path::new(".shipflow-rc").exists() {
            builder = builder.add_source(File::with_name(".shipflow-rc").format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("SHIPFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let shipflow_config: ShipflowConfig = config.try_deserialize()?;
        Ok(shipflow_config)
    }

    /// Load configuration from an explicit file, still honouring env overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("SHIPFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<ShipflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = ShipflowConfig::load_env_file();
        ShipflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static ShipflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
