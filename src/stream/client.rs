//! Supervised event-stream connection.
//!
//! [`StreamClient`] keeps at most one connection alive and reconnects it with
//! capped exponential backoff. Consumers register [`StreamHandlers`]; the
//! supervisor task never captures the handler closures, it reads them
//! through a shared slot at dispatch time, so handlers can be swapped with
//! [`StreamClient::set_handlers`] without touching the connection.
//!
//! # Stop guarantee
//!
//! Every side effect of the supervisor (state changes, event delivery,
//! connection notifications) happens under a read lock on the handler slot
//! after checking the connection's cancellation token. [`StreamClient::stop`]
//! cancels the token and then takes the write lock, so once `stop` returns no
//! callback is running and none will run for that connection. Handlers
//! must not call back into `start`/`stop` themselves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::{ConnectionState, EventSource, StreamEvent};

/// Callback for delivered events.
pub type EventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Callback for connected (`true`) / disconnected (`false`) observations.
pub type ConnectionHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Delivery targets for a [`StreamClient`].
#[derive(Clone, Default)]
pub struct StreamHandlers {
    /// Invoked once per received event.
    pub on_event: Option<EventHandler>,
    /// Invoked when the connection opens or drops. Informational only.
    pub on_connection: Option<ConnectionHandler>,
}

impl std::fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandlers")
            .field("on_event", &self.on_event.is_some())
            .field("on_connection", &self.on_connection.is_some())
            .finish()
    }
}

/// State shared between the client and its supervisor task.
struct Shared {
    handlers: RwLock<StreamHandlers>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Runs `f` only if `cancel` has not fired, fenced against `stop`.
    fn emit(&self, cancel: &CancellationToken, f: impl FnOnce(&StreamHandlers)) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            return;
        }
        f(&handlers);
    }

    fn set_state(&self, cancel: &CancellationToken, state: ConnectionState) {
        self.emit(cancel, |_| {
            self.state.send_replace(state);
        });
    }

    fn dispatch(&self, cancel: &CancellationToken, event: StreamEvent) {
        self.emit(cancel, |handlers| {
            if let Some(on_event) = &handlers.on_event {
                on_event(event);
            }
        });
    }

    fn notify_connection(&self, cancel: &CancellationToken, connected: bool) {
        self.emit(cancel, |handlers| {
            if let Some(on_connection) = &handlers.on_connection {
                on_connection(connected);
            }
        });
    }
}

/// The connection currently owned by the client.
struct ActiveConnection {
    scope: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Supervised, single-connection event stream client.
pub struct StreamClient {
    source: Arc<dyn EventSource>,
    backoff: BackoffPolicy,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveConnection>>,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("backoff", &self.backoff)
            .field("state", &self.state())
            .field("scope", &self.scope())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Creates an idle client over `source`.
    pub fn new(source: Arc<dyn EventSource>, backoff: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            source,
            backoff,
            shared: Arc::new(Shared {
                handlers: RwLock::new(StreamHandlers::default()),
                state,
            }),
            active: Mutex::new(None),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the delivery targets without touching the connection.
    pub fn set_handlers(&self, handlers: StreamHandlers) {
        *self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handlers;
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watches connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Scope of the current connection, if one is active.
    pub fn scope(&self) -> Option<String> {
        self.lock_active().as_ref().map(|active| active.scope.clone())
    }

    /// Starts streaming for `scope`.
    ///
    /// A no-op while already connecting or open for the same scope. A
    /// different scope replaces the current connection. Starting the same
    /// scope while reconnecting cancels the pending timer and connects now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, scope: &str) {
        let mut active = self.lock_active();

        if let Some(current) = active.as_ref() {
            if current.scope == scope && !current.task.is_finished() && self.state().is_live() {
                log::debug!("[Stream] Already streaming for {}, ignoring start", scope);
                return;
            }
        }

        if let Some(previous) = active.take() {
            log::info!("[Stream] Replacing connection for {}", previous.scope);
            self.release(previous);
        }

        let cancel = CancellationToken::new();
        self.shared.state.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.source),
            Arc::clone(&self.shared),
            self.backoff,
            scope.to_string(),
            cancel.clone(),
        ));

        *active = Some(ActiveConnection {
            scope: scope.to_string(),
            cancel,
            task,
        });
    }

    /// Stops streaming and releases the connection and any pending timer.
    ///
    /// Idempotent; safe when never started. No handler runs after this
    /// returns.
    pub fn stop(&self) {
        let previous = self.lock_active().take();
        let _fence = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = previous {
            log::info!("[Stream] Stopping stream for {}", previous.scope);
            previous.cancel.cancel();
            previous.task.abort();
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }

    /// Cancels a connection that is being replaced.
    fn release(&self, connection: ActiveConnection) {
        connection.cancel.cancel();
        // Wait out any in-progress dispatch.
        drop(
            self.shared
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        connection.task.abort();
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connection supervisor: connect, pump events, back off, repeat.
async fn supervise(
    source: Arc<dyn EventSource>,
    shared: Arc<Shared>,
    backoff: BackoffPolicy,
    scope: String,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(&cancel, ConnectionState::Connecting);
        log::debug!("[Stream] Connecting for {}", scope);

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = source.connect(&scope) => result,
        };

        match connected {
            Ok(mut events) => {
                attempt = 0;
                shared.set_state(&cancel, ConnectionState::Open);
                log::info!("[Stream] Connected for {}", scope);
                shared.notify_connection(&cancel, true);

                let reason = loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            log::trace!("[Stream] Received {} event", event.kind());
                            shared.dispatch(&cancel, event);
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                };

                log::warn!("[Stream] Connection lost for {}: {}", scope, reason);
                shared.notify_connection(&cancel, false);
            }
            Err(e) => {
                log::warn!("[Stream] Failed to connect for {}: {}", scope, e);
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        shared.set_state(&cancel, ConnectionState::Reconnecting { attempt, delay });
        log::info!(
            "[Stream] Reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f32(),
            attempt
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
