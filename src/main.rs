use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use etrade_connector::api::{
    ApiError, BrokerApi, EtradeClient, OrderStatus, SimulatedAuthorizer, SimulatedBroker,
};
use etrade_connector::core::health::{start_health_server, HealthChecker};
use etrade_connector::core::{logging, Config};
use etrade_connector::{AccessCredential, Authorizer, Client, ClientEvent, ModuleKind};

/// Prints the authorization URL and reads the verifier from stdin.
struct ConsoleAuthorizer;

#[async_trait]
impl Authorizer for ConsoleAuthorizer {
    async fn authorize(&self, url: &str) -> Option<String> {
        println!("Open the following URL, approve access and enter the verification code:");
        println!("{}", url);

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => {
                let code = line.trim();
                (!code.is_empty()).then(|| code.to_string())
            }
            Err(e) => {
                tracing::error!("Failed to read verifier: {}", e);
                None
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init_logging(&config.monitoring.log_level);

    tracing::info!("E*TRADE connector starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Sandbox mode: {} | simulated broker: {}",
        config.broker.sandbox,
        config.broker.simulated
    );

    let (api, authorizer): (Arc<dyn BrokerApi>, Arc<dyn Authorizer>) = if config.broker.simulated {
        (Arc::new(simulated_broker()), Arc::new(SimulatedAuthorizer))
    } else {
        if config.broker.consumer_key.is_empty() || config.broker.consumer_secret.is_empty() {
            bail!(ApiError::MissingConsumerCredentials);
        }
        (
            Arc::new(EtradeClient::new(&config.broker)),
            Arc::new(ConsoleAuthorizer),
        )
    };

    let client = Client::new(api, &config.scheduler, Some(authorizer))
        .context("failed to build the client")?;

    if let Some(raw) = &config.broker.access_token {
        let credential =
            AccessCredential::deserialize(raw).context("ETRADE_ACCESS_TOKEN is malformed")?;
        client.connection().set_access_credential(Some(credential)).await;
    }
    if let (Some(raw), Some(verifier)) = (&config.broker.request_token, &config.broker.verifier) {
        let request_token =
            AccessCredential::deserialize(raw).context("ETRADE_REQUEST_TOKEN is malformed")?;
        client
            .connection()
            .set_pending_authorization(request_token, verifier.clone())
            .await;
    }

    let health_checker = HealthChecker::new();
    health_checker.track_connection(client.connection().subscribe_state());
    for kind in ModuleKind::ALL {
        health_checker.track_module(kind.as_str().to_string(), client.subscribe_module_state(kind));
    }
    tokio::spawn(start_health_server(
        health_checker.clone(),
        client.metrics().clone(),
        config.monitoring.health_port,
    ));

    tokio::spawn(log_events(client.subscribe()));

    let state = client.connect().await?;
    tracing::info!("Connection is {}", state.as_str());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    if let Some(credential) = client.access_credential().await {
        tracing::info!(
            "Set ETRADE_ACCESS_TOKEN={} to resume this session",
            credential.serialize()
        );
    }
    client.disconnect().await?;

    let status = health_checker.get_status().await;
    tracing::info!("Final status: {} (uptime: {}s)", status.status, status.uptime_seconds);
    Ok(())
}

fn simulated_broker() -> SimulatedBroker {
    let broker = SimulatedBroker::new("simulated");
    broker.add_account("SIM-1", "Simulated brokerage");
    broker.add_position("SIM-1", "AAPL", 10.0);
    broker.add_order("SIM-1", 1001, OrderStatus::Executed);
    broker.add_order("SIM-1", 1002, OrderStatus::Open);
    broker
}

async fn log_events(mut rx: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log fell behind, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ClientEvent::ConnectionStateChanged(state) => {
                tracing::info!("Connection state: {}", state.as_str())
            }
            ClientEvent::ConnectionError(e) => tracing::error!("Connection error: {}", e),
            ClientEvent::AuthorizationRequired { url } => {
                tracing::info!("Authorization required: {}", url)
            }
            ClientEvent::AccountsData { accounts, error } => match error {
                Some(e) => tracing::warn!("Accounts poll failed: {}", e),
                None => tracing::info!("{} accounts", accounts.len()),
            },
            ClientEvent::PositionsData {
                portfolio,
                positions,
                error,
            } => match error {
                Some(e) => tracing::warn!("Positions poll of {} failed: {}", portfolio, e),
                None => tracing::info!("{}: {} positions", portfolio, positions.len()),
            },
            ClientEvent::OrdersData {
                portfolio,
                orders,
                error,
            } => match error {
                Some(e) => tracing::warn!("Orders poll of {} failed: {}", portfolio, e),
                None => tracing::info!("{}: {} orders", portfolio, orders.len()),
            },
            other => tracing::info!("{}: {:?}", other.name(), other),
        }
    }
}
