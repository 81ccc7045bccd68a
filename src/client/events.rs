use tokio::sync::broadcast;

use crate::api::{
    AccountInfo, ApiError, CancelAck, OrderAck, OrderInfo, PositionInfo, ProductInfo,
    RateLimitStatus,
};
use crate::connection::ConnectionState;

/// Everything the client reports to its subscribers.
///
/// Data events carry either the payload or the error of the call that
/// produced them; a failed call still yields exactly one event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    ConnectionError(ApiError),
    /// The user must open `url` and hand the verifier to `Client::submit_verifier`.
    AuthorizationRequired {
        url: String,
    },
    AccountsData {
        accounts: Vec<AccountInfo>,
        error: Option<ApiError>,
    },
    PositionsData {
        portfolio: String,
        positions: Vec<PositionInfo>,
        error: Option<ApiError>,
    },
    OrdersData {
        portfolio: String,
        orders: Vec<OrderInfo>,
        error: Option<ApiError>,
    },
    OrderRegisterResult {
        transaction_id: String,
        ack: Option<OrderAck>,
        error: Option<ApiError>,
    },
    OrderChangeResult {
        transaction_id: String,
        ack: Option<OrderAck>,
        error: Option<ApiError>,
    },
    OrderCancelResult {
        transaction_id: String,
        ack: Option<CancelAck>,
        error: Option<ApiError>,
    },
    ProductLookupResult {
        criteria: String,
        products: Vec<ProductInfo>,
        error: Option<ApiError>,
    },
    RateLimitStatus {
        module: String,
        status: Option<RateLimitStatus>,
        error: Option<ApiError>,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ConnectionStateChanged(_) => "connection_state_changed",
            ClientEvent::ConnectionError(_) => "connection_error",
            ClientEvent::AuthorizationRequired { .. } => "authorization_required",
            ClientEvent::AccountsData { .. } => "accounts_data",
            ClientEvent::PositionsData { .. } => "positions_data",
            ClientEvent::OrdersData { .. } => "orders_data",
            ClientEvent::OrderRegisterResult { .. } => "order_register_result",
            ClientEvent::OrderChangeResult { .. } => "order_change_result",
            ClientEvent::OrderCancelResult { .. } => "order_cancel_result",
            ClientEvent::ProductLookupResult { .. } => "product_lookup_result",
            ClientEvent::RateLimitStatus { .. } => "rate_limit_status",
        }
    }
}

/// One event, many listeners.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ClientEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::debug!("Event {} published to {} receivers", name, receivers);
            }
            Err(_) => {
                tracing::trace!("Event {} dropped, nobody is subscribed", name);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(ClientEvent::AuthorizationRequired {
            url: "https://example.test/authorize".into(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                ClientEvent::AuthorizationRequired { url } => assert!(url.ends_with("authorize")),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.publish(ClientEvent::ConnectionError(ApiError::MissingConsumerCredentials));
    }
}
