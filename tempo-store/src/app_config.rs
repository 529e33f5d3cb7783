use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub payout_provider: PayoutProviderConfig,
    pub business_rules: BusinessRules,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    #[serde(default = "default_hold_ttl")]
    pub hold_ttl_seconds: u64,
    #[serde(default = "default_max_extension")]
    pub max_extension_minutes: i64,
    /// IANA zone the rooms' slot times are expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_purpose")]
    pub payout_purpose: String,
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_backoff")]
    pub retry_backoff_seconds: u64,
    #[serde(default = "default_backoff_cap")]
    pub retry_backoff_cap_seconds: u64,
    #[serde(default = "default_max_deliveries")]
    pub max_expiry_deliveries: u32,
}

fn default_hold_ttl() -> u64 { 300 }
fn default_max_extension() -> i64 { 15 }
fn default_timezone() -> String { "Asia/Kolkata".to_string() }
fn default_currency() -> String { "INR".to_string() }
fn default_purpose() -> String { "Room session payout".to_string() }
fn default_max_retries() -> u32 { 3 }
fn default_backoff() -> u64 { 300 }
fn default_backoff_cap() -> u64 { 3600 }
fn default_max_deliveries() -> u32 { 5 }

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            hold_ttl_seconds: default_hold_ttl(),
            max_extension_minutes: default_max_extension(),
            timezone: default_timezone(),
            currency: default_currency(),
            payout_purpose: default_purpose(),
            max_retry_attempts: default_max_retries(),
            retry_backoff_seconds: default_backoff(),
            retry_backoff_cap_seconds: default_backoff_cap(),
            max_expiry_deliveries: default_max_deliveries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    pub lifecycle_interval_seconds: u64,
    pub payout_interval_seconds: u64,
    pub expiry_interval_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            lifecycle_interval_seconds: 60,
            payout_interval_seconds: 300,
            expiry_interval_seconds: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayoutProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub payments_base_url: String,
    pub key_id: String,
    pub key_secret: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 { 10 }

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String { "tempo".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub commit_topic: String,
    pub events_topic: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Never checked in
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(environment())
            .build()?;

        s.try_deserialize()
    }
}

/// Eg.. `TEMPO_BUSINESS_RULES__HOLD_TTL_SECONDS=600`
fn environment() -> config::Environment {
    config::Environment::with_prefix("TEMPO")
        .prefix_separator("_")
        .separator("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_rules_defaults_apply() {
        let rules: BusinessRules = serde_json::from_str(r#"{"hold_ttl_seconds": 600}"#).unwrap();
        assert_eq!(rules.hold_ttl_seconds, 600);
        assert_eq!(rules.max_retry_attempts, 3);
        assert_eq!(rules.timezone, "Asia/Kolkata");
    }

    #[test]
    fn test_environment_overrides_nested_keys() {
        let vars = config::Map::from([(
            "TEMPO_BUSINESS_RULES__HOLD_TTL_SECONDS".to_string(),
            "600".to_string(),
        )]);
        let s = config::Config::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap();

        assert_eq!(s.get::<i64>("business_rules.hold_ttl_seconds").unwrap(), 600);
    }
}
