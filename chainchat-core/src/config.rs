//! Core configuration
//!
//! Stored one key per row in the `settings` table as JSON values. Missing or
//! unreadable rows fall back to their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::pool;
use crate::error::{CoreError, CoreResult};

/// Retry budget and backoff shape for ledger submissions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Failed attempts before an entry becomes `failed`
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Delay is scaled by a random factor in `1 ± jitter_ratio`
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Configuration for the queue, sync engine and key ring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub retry: RetryPolicy,
    /// Timeout applied to every ledger call
    pub ledger_timeout_ms: u64,
    /// Interval of the safety-net sync pass while online
    pub sync_interval_secs: u64,
    /// Previous key pairs kept for decryption after rotation
    pub key_retention: usize,
    /// Clock-skew allowance when matching ledger records to queued entries
    pub idempotency_window_ms: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ledger_timeout_ms: 30_000,
            sync_interval_secs: 60,
            key_retention: 3,
            idempotency_window_ms: 600_000,
        }
    }
}

impl CoreConfig {
    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Reject values the sync engine cannot work with
    pub fn validate(&self) -> CoreResult<()> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(CoreError::Config("retry.maxAttempts must be at least 1".into()));
        }
        if retry.base_delay_ms == 0 {
            return Err(CoreError::Config("retry.baseDelayMs must be positive".into()));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(CoreError::Config(
                "retry.maxDelayMs must not be below retry.baseDelayMs".into(),
            ));
        }
        // From 1/3 on the jitter bands of consecutive doubling steps overlap
        if !(0.0..1.0 / 3.0).contains(&retry.jitter_ratio) {
            return Err(CoreError::Config("retry.jitterRatio must be in [0, 1/3)".into()));
        }
        if self.ledger_timeout_ms == 0 {
            return Err(CoreError::Config("ledgerTimeoutMs must be positive".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(CoreError::Config("syncIntervalSecs must be positive".into()));
        }
        if self.idempotency_window_ms < 0 {
            return Err(CoreError::Config("idempotencyWindowMs must not be negative".into()));
        }
        Ok(())
    }

    /// Load from the settings table
    pub async fn load(db: &SqlitePool) -> CoreResult<Self> {
        let mut config = Self::default();

        for (key, value) in pool::get_settings(db).await? {
            let applied = match key.as_str() {
                "retry" => serde_json::from_str(&value).map(|v| config.retry = v),
                "ledgerTimeoutMs" => serde_json::from_str(&value).map(|v| config.ledger_timeout_ms = v),
                "syncIntervalSecs" => {
                    serde_json::from_str(&value).map(|v| config.sync_interval_secs = v)
                }
                "keyRetention" => serde_json::from_str(&value).map(|v| config.key_retention = v),
                "idempotencyWindowMs" => {
                    serde_json::from_str(&value).map(|v| config.idempotency_window_ms = v)
                }
                _ => Ok(()),
            };
            if let Err(e) = applied {
                tracing::warn!("Ignoring unreadable setting {}: {}", key, e);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Persist every field to the settings table
    pub async fn save(&self, db: &SqlitePool) -> CoreResult<()> {
        self.validate()?;

        pool::update_setting(db, "retry", &serde_json::to_string(&self.retry)?).await?;
        pool::update_setting(db, "ledgerTimeoutMs", &serde_json::to_string(&self.ledger_timeout_ms)?)
            .await?;
        pool::update_setting(
            db,
            "syncIntervalSecs",
            &serde_json::to_string(&self.sync_interval_secs)?,
        )
        .await?;
        pool::update_setting(db, "keyRetention", &serde_json::to_string(&self.key_retention)?)
            .await?;
        pool::update_setting(
            db,
            "idempotencyWindowMs",
            &serde_json::to_string(&self.idempotency_window_ms)?,
        )
        .await?;

        Ok(())
    }
}
