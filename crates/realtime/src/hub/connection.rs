//! Hub connection manager
//!
//! One `HubConnection` per hub URL. Every outbound call goes through
//! [`HubConnection::invoke`], which first drives the state machine to
//! `Connected`. Unexpected closes are retried in the background with the
//! configured [`ReconnectPolicy`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_retry::RetryIf;
use url::Url;

use super::listeners::{ListenerRegistry, Subscription};
use super::protocol::HubFrame;
use super::reconnect::ReconnectPolicy;
use super::state::{ConnectionState, ConnectionStateMachine};
use super::transport::{HubLink, HubTransport, WebSocketTransport};
use super::{HubError, HubEvent, HubResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type CompletionResult = HubResult<Option<Value>>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CompletionResult>,
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<HubFrame>,
    generation: u64,
    reader: JoinHandle<()>,
}

/// Why a link stopped
struct LinkClosed {
    error: Option<String>,
    allow_reconnect: bool,
}

struct Inner {
    url: Url,
    transport: Arc<dyn HubTransport>,
    policy: ReconnectPolicy,
    machine: Mutex<ConnectionStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    connection_error: Mutex<Option<String>>,
    listeners: Arc<ListenerRegistry>,
    link: Mutex<Option<ActiveLink>>,
    pending: Mutex<HashMap<String, PendingCall>>,
    next_invocation_id: AtomicU64,
    generation: AtomicU64,
    /// Serializes connect attempts (lazy and automatic)
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Managed connection to the messaging hub
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl HubConnection {
    pub fn new(url: Url, transport: Arc<dyn HubTransport>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url,
                transport,
                policy,
                machine: Mutex::new(ConnectionStateMachine::default()),
                state_tx,
                connection_error: Mutex::new(None),
                listeners: Arc::new(ListenerRegistry::new()),
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_invocation_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect_task: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Connection over WebSocket with the default reconnect policy
    pub fn websocket(url: Url, access_token: Option<String>) -> Self {
        Self::new(
            url,
            Arc::new(WebSocketTransport::new(access_token)),
            ReconnectPolicy::default(),
        )
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.machine).state().clone()
    }

    /// Observe every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Last recorded connection failure, cleared on a successful (re)connect
    pub fn connection_error(&self) -> Option<String> {
        lock(&self.inner.connection_error).clone()
    }

    /// Number of events that currently have an installed listener
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.listener_count()
    }

    /// Register a handler for a server event
    ///
    /// Registration does not connect; handlers start receiving once the
    /// connection is up.
    pub fn on<E, F>(&self, handler: F) -> Subscription
    where
        E: HubEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.inner.listeners.add::<E, F>(handler)
    }

    /// Connect explicitly; a no-op when already connected
    pub async fn start(&self) -> HubResult<()> {
        self.ensure_connected().await
    }

    /// Call a hub method and wait for its completion
    ///
    /// Connects first when needed. There is no timeout beyond the transport's
    /// own: the call stays pending until a completion arrives or the link drops.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> HubResult<T> {
        self.ensure_connected().await?;

        let invocation_id = self
            .inner
            .next_invocation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(
            invocation_id.clone(),
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        let frame = HubFrame::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments: args,
        };
        let sent = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.outbound.send(frame).is_ok())
            .unwrap_or(false);

        if !sent {
            lock(&self.inner.pending).remove(&invocation_id);
            return Err(HubError::ConnectionClosed);
        }

        tracing::debug!(
            method = %method,
            invocation_id = %invocation_id,
            "Hub invocation sent"
        );

        let result = rx.await.map_err(|_| HubError::ConnectionClosed)??;
        Ok(serde_json::from_value(result.unwrap_or(Value::Null))?)
    }

    /// Tear the connection down for good
    ///
    /// Stops reconnection, closes the link, drops all listeners and fails any
    /// pending invocation. Calling it again does nothing.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Drive the state machine to `Connected`
    async fn ensure_connected(&self) -> HubResult<()> {
        loop {
            if self.is_disposed() {
                return Err(HubError::Disposed);
            }

            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    // Queue behind the attempt already in flight
                    let mut rx = self.watch_state();
                    let settled = rx
                        .wait_for(|state| !state.is_transitioning())
                        .await
                        .map(|state| state.clone())
                        .map_err(|_| HubError::Disposed)?;

                    match settled {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Failed(error) => return Err(HubError::Connect(error)),
                        _ => continue,
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                    let _guard = self.inner.connect_lock.lock().await;
                    match self.state() {
                        ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                            return self.inner.connect_once().await;
                        }
                        // Someone else connected while we waited
                        _ => continue,
                    }
                }
            }
        }
    }
}

impl Inner {
    fn transition(
        &self,
        f: impl FnOnce(&mut ConnectionStateMachine) -> HubResult<ConnectionState>,
    ) -> HubResult<ConnectionState> {
        let mut machine = lock(&self.machine);
        let from = machine.state().clone();
        let next = f(&mut machine)?;
        self.state_tx.send_replace(next.clone());
        drop(machine);

        tracing::debug!(url = %self.url, from = %from, to = %next, "Hub state changed");
        Ok(next)
    }

    fn set_connection_error(&self, error: Option<String>) {
        *lock(&self.connection_error) = error;
    }

    /// Lazy connect from `Disconnected` or `Failed`; caller holds `connect_lock`
    async fn connect_once(self: &Arc<Self>) -> HubResult<()> {
        self.transition(|m| m.begin_connect())?;
        tracing::info!(url = %self.url, "Connecting to hub");

        let link = match self.transport.connect(&self.url).await {
            Ok(link) => link,
            Err(e) => {
                let message = e.to_string();
                if self.transition(|m| m.on_failed(message.clone())).is_ok() {
                    self.set_connection_error(Some(message));
                }
                tracing::warn!(url = %self.url, error = %e, "Hub connection failed");
                return Err(e);
            }
        };

        if self.disposed.load(Ordering::SeqCst) {
            return Err(HubError::Disposed);
        }

        self.install_link(link)?;
        self.set_connection_error(None);
        tracing::info!(url = %self.url, "Hub connected");
        Ok(())
    }

    /// Publish `Connected` and start reading the new link
    fn install_link(self: &Arc<Self>, link: HubLink) -> HubResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Held across the transition so a reader that closes immediately
        // observes `Connected`
        let mut slot = lock(&self.link);
        self.transition(|m| m.on_connected())?;

        let reader = spawn_reader(Arc::downgrade(self), link.inbound, generation);
        *slot = Some(ActiveLink {
            outbound: link.outbound,
            generation,
            reader,
        });
        Ok(())
    }

    fn complete(&self, invocation_id: &str, result: Option<Value>, error: Option<String>) {
        let Some(call) = lock(&self.pending).remove(invocation_id) else {
            tracing::debug!(invocation_id = %invocation_id, "Completion for unknown invocation");
            return;
        };

        let outcome = match error {
            Some(message) => {
                tracing::debug!(method = %call.method, error = %message, "Hub invocation rejected");
                Err(HubError::Invocation {
                    method: call.method,
                    message,
                })
            }
            None => Ok(result),
        };
        let _ = call.tx.send(outcome);
    }

    fn fail_pending(&self, error: impl Fn() -> HubError) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Failing pending hub invocations");
        }
        for (_, call) in pending {
            let _ = call.tx.send(Err(error()));
        }
    }

    fn on_link_closed(self: &Arc<Self>, generation: u64, closed: LinkClosed) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut slot = lock(&self.link);
            match slot.as_ref() {
                Some(link) if link.generation == generation => {
                    slot.take();
                }
                // A newer link already replaced this one
                _ => return,
            }
        }

        self.fail_pending(|| HubError::ConnectionClosed);

        if let Err(e) = self.transition(|m| m.on_connection_lost()) {
            tracing::debug!(error = %e, "Ignoring link close");
            return;
        }

        tracing::warn!(
            url = %self.url,
            error = closed.error.as_deref().unwrap_or("none"),
            "Hub connection lost"
        );

        if let Some(error) = &closed.error {
            self.set_connection_error(Some(error.clone()));
        }

        if !closed.allow_reconnect || self.policy.max_attempts == 0 {
            let message = closed
                .error
                .unwrap_or_else(|| "server closed the connection".to_string());
            if self.transition(|m| m.on_failed(message.clone())).is_ok() {
                self.set_connection_error(Some(message));
            }
            return;
        }

        let handle = spawn_reconnect(Arc::downgrade(self), self.policy.clone());
        if let Some(previous) = lock(&self.reconnect_task).replace(handle) {
            previous.abort();
        }
    }

    /// One automatic reconnect attempt
    async fn reconnect_attempt(self: &Arc<Self>, attempt: u32) -> HubResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(HubError::Disposed);
        }

        self.transition(|m| m.on_reconnect_attempt(attempt))?;
        tracing::info!(url = %self.url, attempt, "Reconnecting to hub");

        let link = self.transport.connect(&self.url).await.map_err(|e| {
            tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
            e
        })?;

        if self.disposed.load(Ordering::SeqCst) {
            return Err(HubError::Disposed);
        }

        self.install_link(link)?;
        self.set_connection_error(None);
        tracing::info!(url = %self.url, attempt, "Hub reconnected");
        Ok(())
    }

    fn on_reconnect_exhausted(&self, error: HubError) {
        let message = error.to_string();
        match self.transition(|m| m.on_failed(message.clone())) {
            Ok(_) => {
                self.set_connection_error(Some(message));
                tracing::error!(url = %self.url, error = %error, "Hub reconnection gave up");
            }
            Err(e) => tracing::debug!(error = %e, "Reconnect loop ended"),
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        if let Some(link) = lock(&self.link).take() {
            link.reader.abort();
            // Dropping the outbound sender closes the socket
            drop(link.outbound);
        }

        self.listeners.clear();
        self.fail_pending(|| HubError::Disposed);

        let from = lock(&self.machine).state().clone();
        let next = lock(&self.machine).on_stopped();
        self.state_tx.send_replace(next);

        tracing::info!(url = %self.url, from = %from, "Hub connection disposed");
    }
}

fn spawn_reader(
    inner: Weak<Inner>,
    mut inbound: mpsc::UnboundedReceiver<HubFrame>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut closed = LinkClosed {
            error: None,
            allow_reconnect: true,
        };

        while let Some(frame) = inbound.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };

            match frame {
                HubFrame::Invocation {
                    target, arguments, ..
                } => {
                    let delivered = inner.listeners.dispatch(&target, &arguments);
                    tracing::trace!(target = %target, delivered, "Hub event dispatched");
                }
                HubFrame::Completion {
                    invocation_id,
                    result,
                    error,
                } => inner.complete(&invocation_id, result, error),
                HubFrame::Ping => tracing::trace!("Hub ping"),
                HubFrame::Close {
                    error,
                    allow_reconnect,
                } => {
                    closed = LinkClosed {
                        error,
                        allow_reconnect,
                    };
                    break;
                }
            }
        }

        if let Some(inner) = inner.upgrade() {
            inner.on_link_closed(generation, closed);
        }
    })
}

fn spawn_reconnect(inner: Weak<Inner>, policy: ReconnectPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        let action = || {
            attempt += 1;
            let current = attempt;
            let inner = inner.clone();
            async move {
                match inner.upgrade() {
                    Some(inner) => inner.reconnect_attempt(current).await,
                    None => Err(HubError::Disposed),
                }
            }
        };

        let result = RetryIf::spawn(policy.delays(), action, |e: &HubError| e.is_transient()).await;

        if let Err(e) = result {
            if let Some(inner) = inner.upgrade() {
                inner.on_reconnect_exhausted(e);
            }
        }
    })
}
