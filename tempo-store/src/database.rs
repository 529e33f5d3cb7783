use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use tracing::info;

use crate::app_config::BusinessRules;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Overlay rows of `business_rules` on top of the file/env configuration.
    pub async fn fetch_business_rules(&self, defaults: BusinessRules) -> Result<BusinessRules, sqlx::Error> {
        let rows = sqlx::query("SELECT rule_key, rule_value FROM business_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut rules = defaults;
        for row in rows {
            let key: String = row.try_get("rule_key")?;
            let value: Value = row.try_get("rule_value")?;
            apply_rule(&mut rules, &key, &value);
        }

        Ok(rules)
    }
}

/// Expected format: `{"value": <number/string>}`. Unknown keys are ignored.
fn apply_rule(rules: &mut BusinessRules, key: &str, raw: &Value) {
    let Some(v) = raw.get("value") else {
        return;
    };

    match key {
        "hold_ttl_seconds" => {
            if let Some(u) = v.as_u64() {
                rules.hold_ttl_seconds = u;
            }
        }
        "max_extension_minutes" => {
            if let Some(i) = v.as_i64() {
                rules.max_extension_minutes = i;
            }
        }
        "max_retry_attempts" => {
            if let Some(u) = v.as_u64() {
                rules.max_retry_attempts = u as u32;
            }
        }
        "retry_backoff_seconds" => {
            if let Some(u) = v.as_u64() {
                rules.retry_backoff_seconds = u;
            }
        }
        "payout_purpose" => {
            if let Some(s) = v.as_str() {
                rules.payout_purpose = s.to_string();
            }
        }
        _ => {}
    }
}
