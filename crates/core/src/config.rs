use serde::Deserialize;

pub const FLOW_MIN_DEPTH: u32 = 0;
pub const FLOW_MAX_DEPTH: u32 = 5;
pub const RETENTION_MIN_PERIODS: u32 = 1;
pub const RETENTION_MAX_PERIODS: u32 = 52;
/// Retention requests wider than this are accepted but flagged as slow.
pub const RETENTION_WARN_PERIODS: u32 = 26;
pub const DEFAULT_BINDING_KEY_LIMIT: usize = 500;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRILLDOWN__` and an optional TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub funnel: FunnelConfigDefaults,
    #[serde(default)]
    pub flow: FlowConfigDefaults,
    #[serde(default)]
    pub retention: RetentionConfigDefaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Quiet period after the last configuration change before executing.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunnelConfigDefaults {
    #[serde(default = "default_binding_key_limit")]
    pub binding_key_limit: usize,
    #[serde(default = "default_count_unique")]
    pub count_unique: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfigDefaults {
    #[serde(default = "default_steps_before")]
    pub steps_before: u32,
    #[serde(default = "default_steps_after")]
    pub steps_after: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfigDefaults {
    #[serde(default = "default_retention_periods")]
    pub periods: u32,
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_binding_key_limit() -> usize {
    DEFAULT_BINDING_KEY_LIMIT
}
fn default_count_unique() -> bool {
    true
}
fn default_steps_before() -> u32 {
    0
}
fn default_steps_after() -> u32 {
    3
}
fn default_retention_periods() -> u32 {
    12
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for FunnelConfigDefaults {
    fn default() -> Self {
        Self {
            binding_key_limit: default_binding_key_limit(),
            count_unique: default_count_unique(),
        }
    }
}

impl Default for FlowConfigDefaults {
    fn default() -> Self {
        Self {
            steps_before: default_steps_before(),
            steps_after: default_steps_after(),
        }
    }
}

impl Default for RetentionConfigDefaults {
    fn default() -> Self {
        Self {
            periods: default_retention_periods(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("DRILLDOWN")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
