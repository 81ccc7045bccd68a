use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::credential::AccessCredential;
use crate::api::{ApiError, BrokerApi};
use crate::client::events::{ClientEvent, EventBus};
use crate::engine::{DispatchContext, DispatchError, Dispatcher, ReconnectTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// The out-of-band step where the account holder approves the request token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns the verifier shown after approving at `url`, or `None` to
    /// leave the connection waiting for `Connection::submit_verifier`.
    async fn authorize(&self, url: &str) -> Option<String>;
}

/// Observer of session boundaries. Modules are started and stopped through it.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn on_connected(&self);
    async fn on_disconnecting(&self);
}

#[derive(Default)]
struct Session {
    access: Option<AccessCredential>,
    request_token: Option<AccessCredential>,
    verifier: Option<String>,
}

/// Token lifecycle and single-flight reconnect.
///
/// All state changes run on the dispatcher's request lane, one at a time.
pub struct Connection {
    api: Arc<dyn BrokerApi>,
    dispatcher: Dispatcher,
    events: EventBus,
    authorizer: Option<Arc<dyn Authorizer>>,
    state: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
    session: Mutex<Session>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    connect_cycles: AtomicU64,
    this: Weak<Connection>,
}

impl Connection {
    pub fn new(
        api: Arc<dyn BrokerApi>,
        dispatcher: Dispatcher,
        events: EventBus,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|this| Self {
            api,
            dispatcher,
            events,
            authorizer,
            state,
            reconnecting: AtomicBool::new(false),
            session: Mutex::new(Session::default()),
            listeners: RwLock::new(Vec::new()),
            connect_cycles: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Seeds a previously persisted access credential, renewed on connect.
    pub async fn set_access_credential(&self, credential: Option<AccessCredential>) {
        self.session.lock().await.access = credential;
    }

    /// Seeds a pending handshake: the request token and its verifier.
    pub async fn set_pending_authorization(
        &self,
        request_token: AccessCredential,
        verifier: String,
    ) {
        let mut session = self.session.lock().await;
        session.request_token = Some(request_token);
        session.verifier = Some(verifier);
    }

    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Completed or attempted `Connect()` runs since construction.
    pub fn connect_cycles(&self) -> u64 {
        self.connect_cycles.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub async fn access_credential(&self) -> Option<AccessCredential> {
        self.session.lock().await.access.clone()
    }

    /// Handle for modules. Holds the connection weakly.
    pub fn reconnect_trigger(&self) -> Arc<dyn ReconnectTrigger> {
        Arc::new(ReconnectHandle {
            connection: self.this.clone(),
        })
    }

    pub async fn connect(&self) -> Result<ConnectionState, DispatchError> {
        let this = self.strong()?;
        self.dispatcher
            .post_sync(DispatchContext::Request, move || async move {
                this.connect_inner().await;
                this.state()
            })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), DispatchError> {
        let this = self.strong()?;
        self.dispatcher
            .post_sync(DispatchContext::Request, move || async move {
                this.disconnect_inner().await
            })
            .await
    }

    /// Completes a handshake left waiting for the user's verifier.
    pub async fn submit_verifier(
        &self,
        verifier: String,
    ) -> Result<ConnectionState, DispatchError> {
        let this = self.strong()?;
        self.dispatcher
            .post_sync(DispatchContext::Request, move || async move {
                this.session.lock().await.verifier = Some(verifier);
                this.connect_inner().await;
                this.state()
            })
            .await
    }

    /// Queues one disconnect/connect cycle unless one is already pending.
    ///
    /// Never blocks; safe to call from a module loop.
    pub fn reconnect(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already pending");
            return;
        }
        let Ok(this) = self.strong() else {
            return;
        };
        info!("Reconnecting");
        self.dispatcher
            .enqueue(DispatchContext::Request, move || async move {
                this.disconnect_inner().await;
                this.connect_inner().await;
            });
    }

    fn strong(&self) -> Result<Arc<Connection>, DispatchError> {
        self.this
            .upgrade()
            .ok_or(DispatchError::Closed(DispatchContext::Request.as_str()))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Connection {} -> {}", previous.as_str(), state.as_str());
            self.events.publish(ClientEvent::ConnectionStateChanged(state));
        }
    }

    fn report(&self, error: ApiError) {
        error!("Connection error: {}", error);
        self.events.publish(ClientEvent::ConnectionError(error));
    }

    async fn connect_inner(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        if self.state() == ConnectionState::Connected {
            return;
        }
        self.connect_cycles.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let mut session = self.session.lock().await;
        let access = loop {
            if let Some(verifier) = session.verifier.take() {
                match session.request_token.take() {
                    Some(request_token) => {
                        match self.api.get_access_token(&request_token, &verifier).await {
                            Ok(access) => break access,
                            Err(e) => {
                                self.report(e);
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                    None => warn!("Ignoring verifier without a pending request token"),
                }
            }

            if let Some(stored) = session.access.take() {
                match self.api.renew_access_token(&stored).await {
                    Ok(renewed) => break renewed,
                    Err(e) => {
                        warn!("Stored access token could not be renewed, starting a new handshake");
                        self.report(e);
                    }
                }
            }

            let request_token = match self.api.get_request_token().await {
                Ok(token) => token,
                Err(e) => {
                    self.report(e);
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            };
            let url = self.api.authorize_url(&request_token);
            session.request_token = Some(request_token);
            self.events
                .publish(ClientEvent::AuthorizationRequired { url: url.clone() });

            let verifier = match &self.authorizer {
                Some(authorizer) => authorizer.authorize(&url).await,
                None => None,
            };
            match verifier {
                Some(verifier) => session.verifier = Some(verifier),
                None => {
                    info!("Waiting for the authorization verifier");
                    return;
                }
            }
        };

        session.access = Some(access.clone());
        drop(session);

        self.api.set_credential(Some(access)).await;
        self.set_state(ConnectionState::Connected);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_connected().await;
        }
    }

    async fn disconnect_inner(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_disconnecting().await;
        }
        self.api.set_credential(None).await;
        self.set_state(ConnectionState::Disconnected);
    }
}

struct ReconnectHandle {
    connection: Weak<Connection>,
}

impl ReconnectTrigger for ReconnectHandle {
    fn request_reconnect(&self, module: &str) {
        match self.connection.upgrade() {
            Some(connection) => {
                warn!("Module {} lost authorization", module);
                connection.reconnect();
            }
            None => debug!("Module {} asked for a reconnect after shutdown", module),
        }
    }
}
