use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use etrade_connector::api::{
    ApiError, OrderRequest, OrderStatus, OrderTerm, PriceType, Side, SimulatedAuthorizer,
    SimulatedBroker,
};
use etrade_connector::core::config::SchedulerConfig;
use etrade_connector::engine::ModuleState;
use etrade_connector::{Client, ClientEvent, ConnectionState, ModuleKind};

fn seeded_broker() -> Arc<SimulatedBroker> {
    let broker = Arc::new(SimulatedBroker::new("ck"));
    broker.add_account("P1", "first");
    broker.add_account("P2", "second");
    broker.add_order("P1", 100, OrderStatus::Open);
    broker.add_order("P2", 200, OrderStatus::Executed);
    broker
}

fn client(broker: &Arc<SimulatedBroker>) -> Client {
    Client::new(
        broker.clone(),
        &SchedulerConfig::default(),
        Some(Arc::new(SimulatedAuthorizer)),
    )
    .unwrap()
}

/// Waits for the first event `pick` accepts, skipping everything else.
async fn wait_for<T>(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    let deadline = Duration::from_secs(60);
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

fn order(account: &str, client_order_id: &str) -> OrderRequest {
    OrderRequest {
        account_id: account.to_string(),
        client_order_id: client_order_id.to_string(),
        symbol: "IBM".to_string(),
        side: Side::Buy,
        quantity: 5,
        price_type: PriceType::Limit { limit_price: 120.0 },
        order_term: OrderTerm::GoodForDay,
        all_or_none: false,
    }
}

#[tokio::test(start_paused = true)]
async fn connect_starts_polling_of_discovered_portfolios() {
    let broker = seeded_broker();
    let client = client(&broker);
    let mut rx = client.subscribe();

    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
    for kind in ModuleKind::ALL {
        assert_eq!(client.module_state(kind), ModuleState::Started);
    }

    let accounts = wait_for(&mut rx, |e| match e {
        ClientEvent::AccountsData { accounts, error: None } => Some(accounts),
        _ => None,
    })
    .await;
    assert_eq!(accounts.len(), 2);

    let (portfolio, orders) = wait_for(&mut rx, |e| match e {
        ClientEvent::OrdersData {
            portfolio,
            orders,
            error: None,
        } => Some((portfolio, orders)),
        _ => None,
    })
    .await;
    assert_eq!(portfolio, "P1");
    assert_eq!(orders[0].order_id, 100);
    assert_eq!(client.portfolios(), vec!["P1", "P2"]);

    client.disconnect().await.unwrap();
    assert_eq!(client.module_state(ModuleKind::Orders), ModuleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn user_order_is_served_and_registers_activity() {
    let broker = seeded_broker();
    let client = client(&broker);
    let mut rx = client.subscribe();
    client.connect().await.unwrap();

    client.register_order("tx-1", order("P2", "c-1"));
    let (transaction_id, ack, error) = wait_for(&mut rx, |e| match e {
        ClientEvent::OrderRegisterResult {
            transaction_id,
            ack,
            error,
        } => Some((transaction_id, ack, error)),
        _ => None,
    })
    .await;
    assert_eq!(transaction_id, "tx-1");
    assert!(error.is_none());
    let ack = ack.unwrap();
    assert_eq!(ack.account_id, "P2");

    // The new order shows up on the next poll of P2.
    let orders = wait_for(&mut rx, |e| match e {
        ClientEvent::OrdersData {
            portfolio, orders, ..
        } if portfolio == "P2" && orders.iter().any(|o| o.order_id == ack.order_num) => {
            Some(orders)
        }
        _ => None,
    })
    .await;
    assert!(!orders.is_empty());

    client.cancel_order("tx-2", ack.order_num, "P2");
    let error = wait_for(&mut rx, |e| match e {
        ClientEvent::OrderCancelResult {
            transaction_id,
            error,
            ..
        } if transaction_id == "tx-2" => Some(error),
        _ => None,
    })
    .await;
    assert!(error.is_none());
    client.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn orders_module_never_exceeds_its_budget() {
    let broker = seeded_broker();
    let client = client(&broker);
    let mut rx = client.subscribe();
    client.connect().await.unwrap();

    for i in 0..6 {
        client.register_order(format!("tx-{}", i), order("P1", &format!("c-{}", i)));
    }
    for _ in 0..6 {
        wait_for(&mut rx, |e| match e {
            ClientEvent::OrderRegisterResult { .. } => Some(()),
            _ => None,
        })
        .await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    client.disconnect().await.unwrap();

    let budget = SchedulerConfig::default().orders_rps as usize;
    let orders_calls: Vec<Instant> = broker
        .calls()
        .into_iter()
        .filter(|c| matches!(c.operation, "SendOrder" | "GetOrderList"))
        .map(|c| c.at)
        .collect();
    assert!(orders_calls.len() >= 6);
    for (i, start) in orders_calls.iter().enumerate() {
        let in_window = orders_calls[i..]
            .iter()
            .filter(|t| t.duration_since(*start) < Duration::from_secs(1))
            .count();
        assert!(in_window <= budget);
    }
}

#[tokio::test(start_paused = true)]
async fn expired_token_triggers_one_reconnect() {
    let broker = seeded_broker();
    let client = client(&broker);
    let mut rx = client.subscribe();
    client.connect().await.unwrap();
    assert_eq!(client.connection().connect_cycles(), 1);

    wait_for(&mut rx, |e| match e {
        ClientEvent::AccountsData { error: None, .. } => Some(()),
        _ => None,
    })
    .await;

    broker.expire_token();

    let mut states = Vec::new();
    while states.last() != Some(&ConnectionState::Connected) {
        let state = wait_for(&mut rx, |e| match e {
            ClientEvent::ConnectionStateChanged(state) => Some(state),
            _ => None,
        })
        .await;
        states.push(state);
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert_eq!(client.connection().connect_cycles(), 2);
    assert_eq!(broker.call_count("RenewAccessToken"), 1);

    // Polling resumes with the renewed token.
    wait_for(&mut rx, |e| match e {
        ClientEvent::AccountsData { error: None, .. } => Some(()),
        _ => None,
    })
    .await;
    client.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_errors_reach_the_caller_without_reconnecting() {
    let broker = seeded_broker();
    let client = client(&broker);
    let mut rx = client.subscribe();
    client.connect().await.unwrap();

    broker.inject_error(ApiError::Status {
        operation: "ProductLookup".into(),
        status: 503,
    });
    client.lookup_products("international business");

    let error = wait_for(&mut rx, |e| match e {
        ClientEvent::ProductLookupResult { error, .. } => Some(error),
        ClientEvent::AccountsData { error: Some(e), .. }
        | ClientEvent::PositionsData { error: Some(e), .. }
        | ClientEvent::OrdersData { error: Some(e), .. } => Some(Some(e)),
        _ => None,
    })
    .await;
    assert!(matches!(error, Some(ApiError::Status { status: 503, .. })));
    assert_eq!(client.connection().connect_cycles(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    client.request_rate_limit_status(ModuleKind::Orders);
    let status = wait_for(&mut rx, |e| match e {
        ClientEvent::RateLimitStatus { module, status, .. } if module == "orders" => status,
        _ => None,
    })
    .await;
    assert_eq!(status.consumer_key, "ck");
    client.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_a_connected_client_stops_all_polling() {
    let broker = seeded_broker();
    let client = client(&broker);
    let mut rx = client.subscribe();
    client.connect().await.unwrap();
    wait_for(&mut rx, |e| match e {
        ClientEvent::OrdersData { error: None, .. } => Some(()),
        _ => None,
    })
    .await;

    let mut states: Vec<_> = ModuleKind::ALL
        .into_iter()
        .map(|kind| client.subscribe_module_state(kind))
        .collect();
    drop(client);
    for state in &mut states {
        state
            .wait_for(|s| *s == ModuleState::Stopped)
            .await
            .unwrap();
    }

    let calls = broker.calls().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.calls().len(), calls);
}
