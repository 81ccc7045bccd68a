use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prometheus instruments shared by every module of one client.
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    pub requests_executed: IntCounterVec,
    pub request_errors: IntCounterVec,
    pub rate_limit_waits: IntCounterVec,
    pub authorization_failures: IntCounterVec,
    pub user_queue_depth: IntGaugeVec,
}

impl SchedulerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("etrade".to_string()), None)?;

        let requests_executed = IntCounterVec::new(
            Opts::new("requests_executed_total", "Request parts sent to the broker"),
            &["module", "origin"],
        )?;
        let request_errors = IntCounterVec::new(
            Opts::new("request_errors_total", "Request parts that returned an error"),
            &["module"],
        )?;
        let rate_limit_waits = IntCounterVec::new(
            Opts::new("rate_limit_waits_total", "Times a module waited for its rate window"),
            &["module"],
        )?;
        let authorization_failures = IntCounterVec::new(
            Opts::new(
                "authorization_failures_total",
                "Authorization failures that stopped a module",
            ),
            &["module"],
        )?;
        let user_queue_depth = IntGaugeVec::new(
            Opts::new("user_queue_depth", "User requests waiting in a module"),
            &["module"],
        )?;

        registry.register(Box::new(requests_executed.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(rate_limit_waits.clone()))?;
        registry.register(Box::new(authorization_failures.clone()))?;
        registry.register(Box::new(user_queue_depth.clone()))?;

        Ok(Self {
            registry,
            requests_executed,
            request_errors,
            rate_limit_waits,
            authorization_failures,
            user_queue_depth,
        })
    }

    /// Text exposition format for a `/metrics` endpoint.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_labelled_counters() {
        let metrics = SchedulerMetrics::new().unwrap();
        metrics
            .requests_executed
            .with_label_values(&["orders", "user"])
            .inc();
        metrics.rate_limit_waits.with_label_values(&["orders"]).inc_by(3);

        let text = metrics.render();
        assert!(
            text.contains("etrade_requests_executed_total{module=\"orders\",origin=\"user\"} 1")
        );
        assert!(text.contains("etrade_rate_limit_waits_total{module=\"orders\"} 3"));
    }
}
