use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::SchedulerError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub sandbox: bool,
    /// Serialized access credential from an earlier session.
    pub access_token: Option<String>,
    /// Serialized request token of a handshake awaiting `verifier`.
    pub request_token: Option<String>,
    pub verifier: Option<String>,
    /// Run against the in-memory broker instead of the REST API.
    pub simulated: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            sandbox: true,
            access_token: None,
            request_token: None,
            verifier: None,
            simulated: false,
        }
    }
}

/// Per-module request budgets and polling cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub accounts_rps: u32,
    pub market_rps: u32,
    pub orders_rps: u32,
    pub idle_wakeup_ms: u64,
    pub order_page_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            accounts_rps: 2,
            market_rps: 4,
            orders_rps: 2,
            idle_wakeup_ms: 1000,
            order_page_size: 25,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for budget in [self.accounts_rps, self.market_rps, self.orders_rps] {
            if budget == 0 {
                return Err(SchedulerError::InvalidBudget(budget));
            }
        }
        if self.order_page_size == 0 {
            return Err(SchedulerError::InvalidPageSize(self.order_page_size));
        }
        if self.idle_wakeup_ms == 0 {
            return Err(SchedulerError::InvalidIdleWakeup);
        }
        Ok(())
    }

    pub fn idle_wakeup(&self) -> Duration {
        Duration::from_millis(self.idle_wakeup_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub health_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker_defaults = BrokerConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let parsed = |key: &str, default| parse_or(&lookup, key, default);

        let config = Config {
            broker: BrokerConfig {
                consumer_key: lookup("ETRADE_CONSUMER_KEY").unwrap_or_default(),
                consumer_secret: lookup("ETRADE_CONSUMER_SECRET").unwrap_or_default(),
                sandbox: parse_or(&lookup, "ETRADE_SANDBOX", broker_defaults.sandbox),
                access_token: non_empty(lookup("ETRADE_ACCESS_TOKEN")),
                request_token: non_empty(lookup("ETRADE_REQUEST_TOKEN")),
                verifier: non_empty(lookup("ETRADE_VERIFIER")),
                simulated: parse_or(&lookup, "ETRADE_SIMULATED", broker_defaults.simulated),
            },
            scheduler: SchedulerConfig {
                accounts_rps: parsed("ACCOUNTS_RPS", scheduler_defaults.accounts_rps),
                market_rps: parsed("MARKET_RPS", scheduler_defaults.market_rps),
                orders_rps: parsed("ORDERS_RPS", scheduler_defaults.orders_rps),
                idle_wakeup_ms: parse_or(
                    &lookup,
                    "IDLE_WAKEUP_MS",
                    scheduler_defaults.idle_wakeup_ms,
                ),
                order_page_size: parsed("ORDER_PAGE_SIZE", scheduler_defaults.order_page_size),
            },
            monitoring: MonitoringConfig {
                log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                health_port: parse_or(&lookup, "HEALTH_PORT", 3000),
            },
        };

        config
            .scheduler
            .validate()
            .context("invalid scheduler configuration")?;
        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
