pub mod config;
pub mod health;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use health::HealthChecker;
pub use metrics::SchedulerMetrics;
