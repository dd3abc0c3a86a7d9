//! The owning component of the local notification state.
//!
//! [`Reconciler`] merges three racing inputs into one [`InboxSnapshot`]:
//! full refreshes over [`NotificationApi`], pushes from the
//! [`StreamClient`], and identity changes from the session layer.
//!
//! # Epochs
//!
//! Every identity transition bumps an epoch counter. A refresh remembers
//! the epoch it started in and is discarded if the epoch moved while it
//! was in flight, so one identity's data never lands in another's state.
//! The refresh guard is tagged with the epoch as well: a refresh left over
//! from a previous identity never blocks the first refresh of the next one.
//!
//! # Transition table
//!
//! | previous | next      | effect                                           |
//! |----------|-----------|--------------------------------------------------|
//! | none     | none      | nothing                                          |
//! | A        | A         | nothing (display fields updated)                 |
//! | none     | A         | refresh, then start stream for A                 |
//! | A        | none      | stop stream, clear                               |
//! | A        | B         | stop stream, clear, refresh, start stream for B  |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::model::{position, unread_in, NotificationRecord};
use super::normalize::{normalize_count, normalize_list, normalize_record};
use crate::error::ApiError;
use crate::stream::{ConnectionState, StreamClient, StreamEvent, StreamHandlers};
use crate::transport::{Identity, NotificationApi};

/// Observable inbox state. Set and counter always change together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxSnapshot {
    /// Records, newest first, unique by id.
    pub notifications: Vec<NotificationRecord>,
    /// Unread total as last reported by the server, adjusted locally.
    pub unread_count: u64,
    /// A refresh is in flight.
    pub is_loading: bool,
    /// The event stream is currently open.
    pub is_stream_connected: bool,
}

/// Result of [`Reconciler::refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New state is visible.
    Applied {
        /// Records in the new set.
        notifications: usize,
        /// New unread total.
        unread: u64,
    },
    /// Another refresh was already in flight; nothing was requested.
    Skipped,
    /// The identity changed while in flight; the result was discarded.
    Stale,
    /// A call failed; state is untouched.
    Failed(ApiError),
}

/// Classification of an identity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityTransition {
    /// Same principal (or still nobody).
    Unchanged,
    /// Somebody appeared.
    SignedIn(Identity),
    /// The principal went away.
    SignedOut,
    /// A different principal replaced the current one.
    Switched {
        /// Outgoing identity.
        previous: Identity,
        /// Incoming identity.
        next: Identity,
    },
}

impl IdentityTransition {
    /// Classifies `current -> next`. Identities compare by id.
    pub fn classify(current: Option<&Identity>, next: Option<&Identity>) -> Self {
        match (current, next) {
            (None, None) => Self::Unchanged,
            (Some(a), Some(b)) if a.id == b.id => Self::Unchanged,
            (None, Some(b)) => Self::SignedIn(b.clone()),
            (Some(_), None) => Self::SignedOut,
            (Some(a), Some(b)) => Self::Switched {
                previous: a.clone(),
                next: b.clone(),
            },
        }
    }

    /// Identity that needs a fresh load, if any.
    fn incoming(&self) -> Option<&Identity> {
        match self {
            Self::SignedIn(next) | Self::Switched { next, .. } => Some(next),
            Self::Unchanged | Self::SignedOut => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State reachable from stream callbacks. Holds no reference to the stream.
struct Inner {
    api: Arc<dyn NotificationApi>,
    page_limit: u32,
    state: watch::Sender<InboxSnapshot>,
    epoch: AtomicU64,
    /// Epoch of the refresh in flight, if any.
    refreshing: Mutex<Option<u64>>,
}

impl Inner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn try_claim_refresh(&self, epoch: u64) -> bool {
        let mut slot = lock(&self.refreshing);
        if *slot == Some(epoch) {
            return false;
        }
        *slot = Some(epoch);
        self.state
            .send_if_modified(|s| !std::mem::replace(&mut s.is_loading, true));
        true
    }

    fn release_refresh(&self, epoch: u64) {
        let mut slot = lock(&self.refreshing);
        if *slot == Some(epoch) {
            *slot = None;
            self.state
                .send_if_modified(|s| std::mem::replace(&mut s.is_loading, false));
        }
    }

    /// Replaces set and counter unless the epoch moved on.
    fn apply_refresh(&self, epoch: u64, records: Vec<NotificationRecord>, unread: u64) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|s| {
            if self.current_epoch() != epoch {
                return false;
            }
            s.notifications = records;
            s.unread_count = unread;
            s.is_loading = false;
            applied = true;
            true
        });
        applied
    }

    fn push(&self, payload: &Value) {
        let Some(mut record) = normalize_record(payload, Utc::now()) else {
            log::warn!(
                "[Inbox] Ignoring push: {}",
                ApiError::MalformedPayload("notification payload is not an object".to_string())
            );
            return;
        };
        record.delivered_via_stream = true;
        log::debug!("[Inbox] Merging pushed notification {}", record.id);

        self.state.send_modify(|s| {
            if let Some(index) = position(&s.notifications, &record.id) {
                if s.notifications[index].is_unread() && record.is_read {
                    s.unread_count = s.unread_count.saturating_sub(1);
                }
                s.notifications[index] = record;
            } else {
                if record.is_unread() {
                    s.unread_count = s.unread_count.saturating_add(1);
                }
                s.notifications.insert(0, record);
            }
        });
    }

    fn on_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Notification(payload) => self.push(&payload),
            other => log::debug!("[Inbox] Ignoring {} event", other.kind()),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.state
            .send_if_modified(|s| std::mem::replace(&mut s.is_stream_connected, connected) != connected);
    }

    fn clear(&self) {
        self.state.send_modify(|s| {
            s.notifications.clear();
            s.unread_count = 0;
            s.is_loading = false;
            s.is_stream_connected = false;
        });
    }
}

/// Client-side notification state, kept in sync with the backend.
///
/// Cheap to clone; clones share state, stream and identity.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
    stream: Arc<StreamClient>,
    identity: Arc<Mutex<Option<Identity>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("page_limit", &self.inner.page_limit)
            .field("epoch", &self.inner.current_epoch())
            .field("identity", &self.identity())
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler and takes over `stream`'s handlers.
    pub fn new(api: Arc<dyn NotificationApi>, stream: StreamClient, page_limit: u32) -> Self {
        let (state, _) = watch::channel(InboxSnapshot::default());
        let inner = Arc::new(Inner {
            api,
            page_limit,
            state,
            epoch: AtomicU64::new(0),
            refreshing: Mutex::new(None),
        });

        let on_event: Weak<Inner> = Arc::downgrade(&inner);
        let on_connection = Weak::clone(&on_event);
        stream.set_handlers(StreamHandlers {
            on_event: Some(Arc::new(move |event: StreamEvent| {
                if let Some(inner) = on_event.upgrade() {
                    inner.on_stream_event(event);
                }
            })),
            on_connection: Some(Arc::new(move |connected: bool| {
                if let Some(inner) = on_connection.upgrade() {
                    inner.set_connected(connected);
                }
            })),
        });

        Self {
            inner,
            stream: Arc::new(stream),
            identity: Arc::new(Mutex::new(None)),
        }
    }

    /// Watches snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<InboxSnapshot> {
        self.inner.state.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> InboxSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Current stream connection state.
    pub fn stream_state(&self) -> ConnectionState {
        self.stream.state()
    }

    /// Identity the state currently belongs to.
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    /// Reloads page 1 and the unread count, replacing local state.
    ///
    /// Single-flight: a call made while another is outstanding returns
    /// [`RefreshOutcome::Skipped`] without issuing requests.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresh_at(self.inner.current_epoch()).await
    }

    async fn refresh_at(&self, epoch: u64) -> RefreshOutcome {
        let inner = &*self.inner;
        if inner.current_epoch() != epoch {
            return RefreshOutcome::Stale;
        }
        if !inner.try_claim_refresh(epoch) {
            log::debug!("[Inbox] Refresh already in flight, skipping");
            return RefreshOutcome::Skipped;
        }
        let _release = scopeguard::guard(epoch, |epoch| inner.release_refresh(epoch));

        log::debug!("[Inbox] Refreshing");
        let (page, count) = tokio::join!(
            inner.api.fetch_page(1, inner.page_limit),
            inner.api.fetch_unread_count()
        );
        let (page, count) = match (page, count) {
            (Ok(page), Ok(count)) => (page, count),
            (Err(e), _) | (_, Err(e)) => {
                if e.is_transient() {
                    log::warn!("[Inbox] Refresh failed, keeping current state: {}", e);
                } else {
                    log::error!("[Inbox] Refresh failed: {}", e);
                }
                return RefreshOutcome::Failed(e);
            }
        };

        let records = normalize_list(&page);
        let unread = normalize_count(&count).unwrap_or_else(|| unread_in(&records));
        let notifications = records.len();

        if inner.apply_refresh(epoch, records, unread) {
            log::info!(
                "[Inbox] Loaded {} notifications ({} unread)",
                notifications,
                unread
            );
            RefreshOutcome::Applied {
                notifications,
                unread,
            }
        } else {
            log::debug!("[Inbox] Discarding refresh from a previous session");
            RefreshOutcome::Stale
        }
    }

    /// Merges one pushed notification payload.
    ///
    /// New records go to the front and count as unread if they are; a known
    /// id is replaced in place and never counted twice.
    pub fn handle_stream_push(&self, payload: &Value) {
        self.inner.push(payload);
    }

    /// Routes a stream event; only notifications touch state.
    pub fn handle_stream_event(&self, event: StreamEvent) {
        self.inner.on_stream_event(event);
    }

    /// Marks one record read, optimistically.
    ///
    /// The local change stands even if the remote call fails.
    pub async fn mark_as_read(&self, id: &str) -> Result<(), ApiError> {
        self.inner.state.send_if_modified(|s| {
            match s.notifications.iter_mut().find(|record| record.id == id) {
                Some(record) if record.is_unread() => {
                    record.is_read = true;
                    s.unread_count = s.unread_count.saturating_sub(1);
                    true
                }
                _ => false,
            }
        });

        self.inner.api.mark_read(id).await.map_err(|e| {
            log::warn!("[Inbox] Failed to mark {} as read: {}", id, e);
            e
        })
    }

    /// Marks every record read and zeroes the counter, optimistically.
    pub async fn mark_all_as_read(&self) -> Result<(), ApiError> {
        self.inner.state.send_modify(|s| {
            for record in &mut s.notifications {
                record.is_read = true;
            }
            s.unread_count = 0;
        });

        self.inner.api.mark_all_read().await.map_err(|e| {
            log::warn!("[Inbox] Failed to mark all as read: {}", e);
            e
        })
    }

    /// Removes a record, optimistically.
    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        self.inner.state.send_if_modified(|s| {
            let Some(index) = position(&s.notifications, id) else {
                return false;
            };
            let removed = s.notifications.remove(index);
            if removed.is_unread() {
                s.unread_count = s.unread_count.saturating_sub(1);
            }
            true
        });

        self.inner.api.delete(id).await.map_err(|e| {
            log::warn!("[Inbox] Failed to delete {}: {}", id, e);
            e
        })
    }

    /// Applies an identity change through the transition table.
    pub async fn set_identity(&self, next: Option<Identity>) -> IdentityTransition {
        let (transition, epoch) = self.apply_identity(next);
        if let Some(incoming) = transition.incoming() {
            self.load_identity(incoming, epoch).await;
        }
        transition
    }

    /// Initial load for `incoming`, then the stream if the epoch held.
    async fn load_identity(&self, incoming: &Identity, epoch: u64) {
        match self.refresh_at(epoch).await {
            RefreshOutcome::Stale => return,
            RefreshOutcome::Failed(e) => {
                log::warn!("[Inbox] Initial load for {} failed: {}", incoming.id, e);
            }
            RefreshOutcome::Applied { .. } | RefreshOutcome::Skipped => {}
        }

        // Transitions bump the epoch under this lock.
        let _identity = lock(&self.identity);
        if self.inner.current_epoch() == epoch {
            self.stream.start(&incoming.id);
        }
    }

    /// Synchronous part of a transition: bookkeeping, stream stop, clear.
    fn apply_identity(&self, next: Option<Identity>) -> (IdentityTransition, u64) {
        let mut current = lock(&self.identity);
        let transition = IdentityTransition::classify(current.as_ref(), next.as_ref());

        match &transition {
            IdentityTransition::Unchanged => {}
            IdentityTransition::SignedIn(identity) => {
                log::info!("[Inbox] Signed in as {}", identity.id);
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            }
            IdentityTransition::SignedOut => {
                log::info!("[Inbox] Signed out, clearing notifications");
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                self.stream.stop();
                self.inner.clear();
            }
            IdentityTransition::Switched { previous, next } => {
                log::info!("[Inbox] Switched from {} to {}", previous.id, next.id);
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                self.stream.stop();
                self.inner.clear();
            }
        }

        *current = next;
        (transition, self.inner.current_epoch())
    }

    /// Follows a session's identity channel until it closes.
    ///
    /// Each change is applied the moment it arrives: stream stop and clear
    /// happen before the next change is read, while the load for a new
    /// identity runs in its own task and is abandoned by the next
    /// transition. When the sender goes away the reconciler signs out.
    pub fn follow(&self, mut identities: watch::Receiver<Option<Identity>>) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut loading: Option<JoinHandle<()>> = None;
            loop {
                let next = identities.borrow_and_update().clone();
                let (transition, epoch) = reconciler.apply_identity(next);

                if transition != IdentityTransition::Unchanged {
                    if let Some(previous) = loading.take() {
                        previous.abort();
                    }
                }
                if let Some(incoming) = transition.incoming().cloned() {
                    let loader = reconciler.clone();
                    loading = Some(tokio::spawn(async move {
                        loader.load_identity(&incoming, epoch).await;
                    }));
                }

                if identities.changed().await.is_err() {
                    break;
                }
            }
            log::debug!("[Inbox] Session channel closed");
            if let Some(pending) = loading.take() {
                pending.abort();
            }
            reconciler.set_identity(None).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BackoffPolicy, EventSource, EventStream};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-memory backend. Responses are captured when a call starts and
    /// released when the gate is open.
    struct FakeApi {
        page: Mutex<Value>,
        count: Mutex<Value>,
        gate: watch::Sender<bool>,
        fail_fetch: AtomicBool,
        fail_mutations: AtomicBool,
        page_calls: AtomicU32,
        count_calls: AtomicU32,
        mark_read_calls: Mutex<Vec<String>>,
        mark_all_calls: AtomicU32,
        delete_calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(page: Value, count: Value) -> Arc<Self> {
            Arc::new(Self {
                page: Mutex::new(page),
                count: Mutex::new(count),
                gate: watch::channel(true).0,
                fail_fetch: AtomicBool::new(false),
                fail_mutations: AtomicBool::new(false),
                page_calls: AtomicU32::new(0),
                count_calls: AtomicU32::new(0),
                mark_read_calls: Mutex::new(Vec::new()),
                mark_all_calls: AtomicU32::new(0),
                delete_calls: Mutex::new(Vec::new()),
            })
        }

        fn serve(&self, page: Value, count: Value) {
            *self.page.lock().unwrap() = page;
            *self.count.lock().unwrap() = count;
        }

        fn close_gate(&self) {
            self.gate.send_replace(false);
        }

        fn open_gate(&self) {
            self.gate.send_replace(true);
        }

        async fn pass_gate(&self) {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }

        fn page_calls(&self) -> u32 {
            self.page_calls.load(Ordering::SeqCst)
        }

        fn mutation_result(&self) -> Result<(), ApiError> {
            if self.fail_mutations.load(Ordering::SeqCst) {
                Err(ApiError::NetworkUnreachable("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl NotificationApi for FakeApi {
        async fn fetch_page(&self, page: u32, _limit: u32) -> Result<Value, ApiError> {
            assert_eq!(page, 1);
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            let response = self.page.lock().unwrap().clone();
            self.pass_gate().await;
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(response)
        }

        async fn fetch_unread_count(&self) -> Result<Value, ApiError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            let response = self.count.lock().unwrap().clone();
            self.pass_gate().await;
            Ok(response)
        }

        async fn mark_read(&self, id: &str) -> Result<(), ApiError> {
            self.mark_read_calls.lock().unwrap().push(id.to_string());
            self.mutation_result()
        }

        async fn mark_all_read(&self) -> Result<(), ApiError> {
            self.mark_all_calls.fetch_add(1, Ordering::SeqCst);
            self.mutation_result()
        }

        async fn delete(&self, id: &str) -> Result<(), ApiError> {
            self.delete_calls.lock().unwrap().push(id.to_string());
            self.mutation_result()
        }
    }

    type Feed = mpsc::UnboundedSender<Result<StreamEvent, ApiError>>;

    /// Event source where every connection is an in-process channel.
    #[derive(Default)]
    struct ChannelSource {
        feeds: Mutex<Vec<(String, Feed)>>,
    }

    impl ChannelSource {
        fn scopes(&self) -> Vec<String> {
            self.feeds
                .lock()
                .unwrap()
                .iter()
                .map(|(scope, _)| scope.clone())
                .collect()
        }

        fn latest(&self) -> Feed {
            self.feeds.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl EventSource for ChannelSource {
        async fn connect(&self, scope: &str) -> Result<EventStream, ApiError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push((scope.to_string(), tx));
            let events = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(events))
        }
    }

    fn reconciler(api: &Arc<FakeApi>, source: &Arc<ChannelSource>) -> Reconciler {
        let source: Arc<dyn EventSource> = Arc::clone(source) as Arc<dyn EventSource>;
        let stream = StreamClient::new(
            source,
            BackoffPolicy::fixed(Duration::from_millis(10), Duration::from_millis(40)),
        );
        Reconciler::new(Arc::clone(api) as Arc<dyn NotificationApi>, stream, 20)
    }

    fn setup(page: Value, count: Value) -> (Arc<FakeApi>, Arc<ChannelSource>, Reconciler) {
        let api = FakeApi::new(page, count);
        let source = Arc::new(ChannelSource::default());
        let reconciler = reconciler(&api, &source);
        (api, source, reconciler)
    }

    fn ids(snapshot: &InboxSnapshot) -> Vec<&str> {
        snapshot.notifications.iter().map(|r| r.id.as_str()).collect()
    }

    async fn wait_snapshot(
        reconciler: &Reconciler,
        predicate: impl FnMut(&InboxSnapshot) -> bool,
    ) -> InboxSnapshot {
        let mut rx = reconciler.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed");
        snapshot.clone()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    #[test]
    fn test_transition_table() {
        let a = Identity::new("a");
        let a_renamed = Identity {
            name: Some("Ada".into()),
            ..Identity::new("a")
        };
        let b = Identity::new("b");

        assert_eq!(IdentityTransition::classify(None, None), IdentityTransition::Unchanged);
        assert_eq!(
            IdentityTransition::classify(Some(&a), Some(&a_renamed)),
            IdentityTransition::Unchanged
        );
        assert_eq!(
            IdentityTransition::classify(None, Some(&a)),
            IdentityTransition::SignedIn(a.clone())
        );
        assert_eq!(
            IdentityTransition::classify(Some(&a), None),
            IdentityTransition::SignedOut
        );
        assert_eq!(
            IdentityTransition::classify(Some(&a), Some(&b)),
            IdentityTransition::Switched {
                previous: a,
                next: b,
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_replaces_set_and_counter() {
        let (api, _source, reconciler) = setup(
            json!({"notifications": [{"id": "n1"}, {"id": "n2", "isRead": true}]}),
            json!({"count": 1}),
        );

        let outcome = reconciler.refresh().await;
        assert_eq!(
            outcome,
            RefreshOutcome::Applied {
                notifications: 2,
                unread: 1,
            }
        );

        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["n1", "n2"]);
        assert_eq!(snapshot.unread_count, 1);
        assert!(!snapshot.is_loading);
        assert_eq!(api.count_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_count_counts_unread_records() {
        let (_api, _source, reconciler) =
            setup(json!([{"id": "a"}, {"id": "b"}, {"id": "c", "read": true}]), json!({}));
        reconciler.refresh().await;
        assert_eq!(reconciler.snapshot().unread_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let (api, _source, reconciler) = setup(json!([{"id": "n1"}]), json!(1));
        api.close_gate();

        let first = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.refresh().await })
        };
        wait_until(|| api.page_calls() == 1).await;
        assert!(reconciler.snapshot().is_loading);

        assert_eq!(reconciler.refresh().await, RefreshOutcome::Skipped);
        assert_eq!(api.page_calls(), 1);

        api.open_gate();
        assert!(matches!(first.await.unwrap(), RefreshOutcome::Applied { .. }));
        assert_eq!(api.page_calls(), 1);
        assert_eq!(api.count_calls.load(Ordering::SeqCst), 1);

        // The guard is released afterwards.
        assert!(matches!(reconciler.refresh().await, RefreshOutcome::Applied { .. }));
        assert_eq!(api.page_calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_state_untouched() {
        let (api, _source, reconciler) = setup(json!([{"id": "n1"}]), json!(1));
        reconciler.refresh().await;

        api.serve(json!([]), json!(0));
        api.fail_fetch.store(true, Ordering::SeqCst);
        let outcome = reconciler.refresh().await;

        assert!(matches!(outcome, RefreshOutcome::Failed(ApiError::Status { status: 500, .. })));
        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["n1"]);
        assert_eq!(snapshot.unread_count, 1);
        assert!(!snapshot.is_loading);
    }

    #[tokio::test]
    async fn test_push_merge_is_idempotent() {
        let (_api, _source, reconciler) = setup(json!([]), json!(0));

        for _ in 0..3 {
            reconciler.handle_stream_push(&json!({"id": "n1", "title": "Hi"}));
        }
        reconciler.handle_stream_push(&json!({"id": "n2"}));
        reconciler.handle_stream_push(&json!({"id": "n1", "title": "Updated"}));

        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["n2", "n1"]);
        assert_eq!(snapshot.notifications[1].title, "Updated");
        assert!(snapshot.notifications[1].delivered_via_stream);
        assert_eq!(snapshot.unread_count, 2);
    }

    #[tokio::test]
    async fn test_push_then_refresh_counts_once() {
        let (_api, _source, reconciler) =
            setup(json!([{"id": "n1", "isRead": false}]), json!({"count": 1}));

        reconciler.handle_stream_push(&json!({"id": "n1", "isRead": false}));
        assert_eq!(reconciler.snapshot().unread_count, 1);
        reconciler.refresh().await;

        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["n1"]);
        assert_eq!(snapshot.unread_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_then_push_counts_once() {
        let (_api, _source, reconciler) =
            setup(json!([{"id": "n1", "isRead": false}]), json!({"count": 1}));

        reconciler.refresh().await;
        reconciler.handle_stream_push(&json!({"id": "n1", "isRead": false}));

        assert_eq!(reconciler.snapshot().unread_count, 1);
    }

    #[tokio::test]
    async fn test_push_marking_read_decrements() {
        let (_api, _source, reconciler) = setup(json!([]), json!(0));
        reconciler.handle_stream_push(&json!({"id": "n1"}));
        reconciler.handle_stream_push(&json!({"id": "n1", "isRead": true}));
        reconciler.handle_stream_push(&json!({"id": "n1", "isRead": true}));
        assert_eq!(reconciler.snapshot().unread_count, 0);
    }

    #[tokio::test]
    async fn test_non_object_push_is_ignored() {
        let (_api, _source, reconciler) = setup(json!([]), json!(0));
        reconciler.handle_stream_push(&json!("hello"));
        reconciler.handle_stream_event(StreamEvent::Broadcast(json!({"id": "b1"})));
        reconciler.handle_stream_event(StreamEvent::Connected(json!({"id": "c1"})));
        assert_eq!(reconciler.snapshot(), InboxSnapshot::default());
    }

    #[tokio::test]
    async fn test_mark_as_read_is_optimistic() {
        let (api, _source, reconciler) = setup(
            json!([{"id": "n1"}, {"id": "n2", "isRead": true}]),
            json!(1),
        );
        reconciler.refresh().await;

        reconciler.mark_as_read("n1").await.unwrap();
        assert_eq!(reconciler.snapshot().unread_count, 0);
        assert!(reconciler.snapshot().notifications[0].is_read);

        // Already read and unknown ids leave the counter alone.
        reconciler.mark_as_read("n1").await.unwrap();
        reconciler.mark_as_read("n2").await.unwrap();
        reconciler.mark_as_read("missing").await.unwrap();
        assert_eq!(reconciler.snapshot().unread_count, 0);
        assert_eq!(api.mark_read_calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_mark_as_read_never_goes_negative() {
        // Server count lags behind the listing.
        let (_api, _source, reconciler) = setup(json!([{"id": "n1"}, {"id": "n2"}]), json!(0));
        reconciler.refresh().await;

        reconciler.mark_as_read("n1").await.unwrap();
        reconciler.mark_as_read("n2").await.unwrap();
        assert_eq!(reconciler.snapshot().unread_count, 0);
    }

    #[tokio::test]
    async fn test_mutation_failure_keeps_optimistic_state() {
        let (api, _source, reconciler) = setup(json!([{"id": "n1"}, {"id": "n2"}]), json!(2));
        reconciler.refresh().await;
        api.fail_mutations.store(true, Ordering::SeqCst);

        let result = reconciler.mark_as_read("n1").await;
        assert!(matches!(result, Err(ApiError::NetworkUnreachable(_))));
        assert_eq!(reconciler.snapshot().unread_count, 1);

        assert!(reconciler.delete("n2").await.is_err());
        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["n1"]);
        assert_eq!(snapshot.unread_count, 0);
    }

    #[tokio::test]
    async fn test_mark_all_as_read() {
        let (api, _source, reconciler) = setup(json!([{"id": "a"}, {"id": "b"}]), json!(5));
        reconciler.refresh().await;

        reconciler.mark_all_as_read().await.unwrap();
        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.unread_count, 0);
        assert!(snapshot.notifications.iter().all(|r| r.is_read));
        assert_eq!(api.mark_all_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_decrements_only_unread() {
        let (api, _source, reconciler) = setup(
            json!([{"id": "a"}, {"id": "b", "isRead": true}, {"id": "c"}]),
            json!(2),
        );
        reconciler.refresh().await;

        reconciler.delete("b").await.unwrap();
        assert_eq!(reconciler.snapshot().unread_count, 2);
        reconciler.delete("a").await.unwrap();
        assert_eq!(reconciler.snapshot().unread_count, 1);
        reconciler.delete("zzz").await.unwrap();
        assert_eq!(ids(&reconciler.snapshot()), vec!["c"]);
        assert_eq!(*api.delete_calls.lock().unwrap(), vec!["b", "a", "zzz"]);
    }

    #[tokio::test]
    async fn test_sign_in_loads_and_starts_stream() {
        let (_api, source, reconciler) = setup(json!([]), json!(0));

        let transition = reconciler.set_identity(Some(Identity::new("user-1"))).await;
        assert_eq!(transition, IdentityTransition::SignedIn(Identity::new("user-1")));

        let snapshot = wait_snapshot(&reconciler, |s| s.is_stream_connected).await;
        assert!(snapshot.notifications.is_empty());
        assert_eq!(source.scopes(), vec!["user-1"]);

        let feed = source.latest();
        feed.send(Ok(StreamEvent::Connected(json!({"message": "hi"}))))
            .unwrap();
        feed.send(Ok(StreamEvent::Broadcast(json!({"id": "b1"}))))
            .unwrap();
        feed.send(Ok(StreamEvent::Notification(json!({"id": "p1", "title": "Pushed"}))))
            .unwrap();

        let snapshot = wait_snapshot(&reconciler, |s| !s.notifications.is_empty()).await;
        assert_eq!(ids(&snapshot), vec!["p1"]);
        assert_eq!(snapshot.unread_count, 1);

        // Same identity again does nothing.
        let transition = reconciler.set_identity(Some(Identity::new("user-1"))).await;
        assert_eq!(transition, IdentityTransition::Unchanged);
        assert_eq!(source.scopes().len(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_stops_stream_and_clears() {
        let (_api, source, reconciler) = setup(json!([{"id": "n1"}]), json!(1));
        reconciler.set_identity(Some(Identity::new("user-1"))).await;
        wait_snapshot(&reconciler, |s| s.is_stream_connected).await;
        let feed = source.latest();

        let transition = reconciler.set_identity(None).await;
        assert_eq!(transition, IdentityTransition::SignedOut);
        assert_eq!(reconciler.snapshot(), InboxSnapshot::default());
        assert_eq!(reconciler.stream_state(), ConnectionState::Closed);
        assert_eq!(reconciler.identity(), None);

        let _ = feed.send(Ok(StreamEvent::Notification(json!({"id": "late"}))));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reconciler.snapshot(), InboxSnapshot::default());
    }

    #[tokio::test]
    async fn test_identity_change_never_leaks_previous_state() {
        let (api, source, reconciler) = setup(json!([{"id": "a1"}]), json!(1));
        api.close_gate();

        // A's load is stuck in flight while A signs out and B signs in.
        let sign_in_a = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.set_identity(Some(Identity::new("A"))).await })
        };
        wait_until(|| api.page_calls() == 1).await;

        reconciler.set_identity(None).await;
        api.serve(json!([{"id": "b1"}, {"id": "b2"}]), json!(2));

        let sign_in_b = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.set_identity(Some(Identity::new("B"))).await })
        };
        wait_until(|| api.page_calls() == 2).await;

        api.open_gate();
        sign_in_a.await.unwrap();
        sign_in_b.await.unwrap();

        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["b1", "b2"]);
        assert_eq!(snapshot.unread_count, 2);
        assert!(!snapshot.is_loading);

        wait_until(|| !source.scopes().is_empty()).await;
        assert_eq!(source.scopes(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_switch_identity_reloads() {
        let (api, source, reconciler) = setup(json!([{"id": "a1"}]), json!(1));
        reconciler.set_identity(Some(Identity::new("A"))).await;
        wait_until(|| source.scopes().len() == 1).await;
        reconciler.handle_stream_push(&json!({"id": "a-push"}));

        api.serve(json!([{"id": "b1"}]), json!(1));
        let transition = reconciler.set_identity(Some(Identity::new("B"))).await;
        assert!(matches!(transition, IdentityTransition::Switched { .. }));

        let snapshot = reconciler.snapshot();
        assert_eq!(ids(&snapshot), vec!["b1"]);
        assert_eq!(snapshot.unread_count, 1);
        wait_until(|| source.scopes().len() == 2).await;
        assert_eq!(source.scopes(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_follow_signs_out_while_initial_load_in_flight() {
        let (api, source, reconciler) = setup(json!([{"id": "a1"}]), json!(1));
        api.close_gate();
        let (identity_tx, identity_rx) = watch::channel(None);
        let task = reconciler.follow(identity_rx);

        identity_tx.send_replace(Some(Identity::new("A")));
        wait_until(|| api.page_calls() == 1).await;
        assert!(reconciler.snapshot().is_loading);

        // A's load is still held at the gate.
        identity_tx.send_replace(None);
        wait_until(|| reconciler.identity().is_none()).await;
        assert_eq!(reconciler.snapshot(), InboxSnapshot::default());

        api.serve(json!([{"id": "b1"}, {"id": "b2"}]), json!(2));
        identity_tx.send_replace(Some(Identity::new("B")));
        wait_until(|| api.page_calls() == 2).await;
        api.open_gate();

        let snapshot = wait_snapshot(&reconciler, |s| s.unread_count == 2).await;
        assert_eq!(ids(&snapshot), vec!["b1", "b2"]);
        wait_until(|| !source.scopes().is_empty()).await;
        assert_eq!(source.scopes(), vec!["B"]);

        drop(identity_tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reconciler.snapshot(), InboxSnapshot::default());
    }

    #[tokio::test]
    async fn test_follow_tracks_session_channel() {
        let (_api, _source, reconciler) = setup(json!([{"id": "n1"}]), json!(1));
        let (identity_tx, identity_rx) = watch::channel(None);
        let task = reconciler.follow(identity_rx);

        identity_tx.send_replace(Some(Identity::new("user-1")));
        wait_snapshot(&reconciler, |s| s.unread_count == 1).await;

        identity_tx.send_replace(None);
        wait_snapshot(&reconciler, |s| s.notifications.is_empty()).await;

        identity_tx.send_replace(Some(Identity::new("user-2")));
        wait_snapshot(&reconciler, |s| s.unread_count == 1).await;

        drop(identity_tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reconciler.identity(), None);
        assert_eq!(reconciler.snapshot(), InboxSnapshot::default());
    }
}
