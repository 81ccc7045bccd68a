use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use warp::Filter;

use super::metrics::SchedulerMetrics;
use crate::connection::ConnectionState;
use crate::engine::ModuleState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub connection: String,
    pub modules: BTreeMap<String, String>,
}

impl ComponentHealth {
    fn is_healthy(&self) -> bool {
        self.connection == ConnectionState::Connected.as_str()
            && self
                .modules
                .values()
                .all(|state| state == ModuleState::Started.as_str())
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    status: Arc<RwLock<ComponentHealth>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            status: Arc::new(RwLock::new(ComponentHealth {
                connection: ConnectionState::Disconnected.as_str().to_string(),
                modules: BTreeMap::new(),
            })),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.status.read().await.clone();

        HealthStatus {
            status: if components.is_healthy() {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    pub async fn update_connection(&self, state: ConnectionState) {
        self.status.write().await.connection = state.as_str().to_string();
    }

    pub async fn update_module(&self, module: &str, state: ModuleState) {
        self.status
            .write()
            .await
            .modules
            .insert(module.to_string(), state.as_str().to_string());
    }

    /// Mirrors the connection state until the sender goes away.
    pub fn track_connection(&self, mut rx: watch::Receiver<ConnectionState>) {
        let checker = self.clone();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                checker.update_connection(state).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Mirrors one module's state until the module goes away.
    pub fn track_module(&self, module: String, mut rx: watch::Receiver<ModuleState>) {
        let checker = self.clone();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                checker.update_module(&module, state).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET /health` (JSON) and `GET /metrics` (prometheus text).
pub fn routes(
    checker: HealthChecker,
    metrics: SchedulerMetrics,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || checker.clone()))
        .and_then(|checker: HealthChecker| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || metrics.render());

    health.or(metrics)
}

pub async fn start_health_server(checker: HealthChecker, metrics: SchedulerMetrics, port: u16) {
    tracing::info!("Health endpoint listening on port {}", port);
    warp::serve(routes(checker, metrics))
        .run(([0, 0, 0, 0], port))
        .await;
}
