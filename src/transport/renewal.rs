//! Single-flight credential renewal.
//!
//! When an authenticated call comes back with 401, the caller hands the
//! failure to [`RenewalCoordinator::call`]. Exactly one caller becomes the
//! renewer; everyone else arriving while that renewal is pending waits on the
//! same outcome instead of starting their own.
//!
//! ```text
//!   call A ──401──► renew() ── leader ──► POST /users/refresh ──┐
//!   call B ──401──► renew() ── follower ─── waits ──────────────┤
//!   call C ──401──► renew() ── follower ─── waits ──────────────┤
//!                                                               ▼
//!                                        outcome broadcast via watch channel
//!                                        each caller retries its call once
//! ```
//!
//! Consecutive failed renewals are counted. Once [`MAX_RENEWAL_ATTEMPTS`]
//! renewals have failed, further 401s propagate as
//! [`ApiError::RenewalExhausted`] without touching the network until a
//! renewal succeeds or [`RenewalCoordinator::reset`] is called on a fresh
//! login.
//!
//! [`MAX_RENEWAL_ATTEMPTS`]: crate::constants::MAX_RENEWAL_ATTEMPTS

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use crate::constants;
use crate::error::ApiError;

/// Observable view of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalState {
    /// A renewal call is in flight.
    pub renewing: bool,
    /// Consecutive failed renewals since the last success or reset.
    pub attempts: u32,
}

/// Broadcast when a caller is refused because renewal is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalExhaustedEvent {
    /// Failed attempts at the time of the event.
    pub attempts: u32,
}

/// Renewal slot. The receiver lets late arrivals join a pending renewal.
#[derive(Debug)]
enum Slot {
    Idle,
    Renewing(watch::Receiver<Option<bool>>),
}

#[derive(Debug)]
struct Inner {
    slot: Slot,
    attempts: u32,
}

/// Role a caller takes when it needs credentials renewed.
enum Role {
    Leader(watch::Sender<Option<bool>>),
    Follower(watch::Receiver<Option<bool>>),
    Refused(u32),
}

/// Coordinates credential renewal across concurrent callers.
#[derive(Debug)]
pub struct RenewalCoordinator {
    inner: Mutex<Inner>,
    max_attempts: u32,
    exhausted_tx: broadcast::Sender<RenewalExhaustedEvent>,
}

impl Default for RenewalCoordinator {
    fn default() -> Self {
        Self::new(constants::MAX_RENEWAL_ATTEMPTS)
    }
}

impl RenewalCoordinator {
    /// Creates a coordinator that tolerates `max_attempts` failed renewals.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        let (exhausted_tx, _) = broadcast::channel(constants::RENEWAL_EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Idle,
                attempts: 0,
            }),
            max_attempts,
            exhausted_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panic in a renewer; keep going.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current renewal state.
    pub fn state(&self) -> RenewalState {
        let inner = self.lock();
        RenewalState {
            renewing: matches!(inner.slot, Slot::Renewing(_)),
            attempts: inner.attempts,
        }
    }

    /// Clears the failed-attempt counter. Called on a fresh login.
    pub fn reset(&self) {
        self.lock().attempts = 0;
    }

    /// Subscribes to renewal-exhausted notifications.
    ///
    /// The identity layer uses this to decide whether to end the session;
    /// the coordinator itself never logs anyone out.
    pub fn subscribe_exhausted(&self) -> broadcast::Receiver<RenewalExhaustedEvent> {
        self.exhausted_tx.subscribe()
    }

    /// Runs `op`, renewing credentials and retrying once on a 401.
    ///
    /// The retry is never itself retried: if the replayed call fails again,
    /// including with another 401, that result is returned as-is. Any error
    /// other than [`ApiError::AuthorizationExpired`] is returned without
    /// renewal, so network failures never trigger it.
    pub async fn call<T, Op, OpFut, Renew, RenewFut>(
        &self,
        mut op: Op,
        renew: Renew,
    ) -> Result<T, ApiError>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T, ApiError>>,
        Renew: FnOnce() -> RenewFut,
        RenewFut: Future<Output = Result<(), ApiError>>,
    {
        match op().await {
            Err(e) if e.is_authorization_expired() => {
                self.renew(renew).await?;
                op().await
            }
            other => other,
        }
    }

    /// Renews credentials, or joins a renewal already in flight.
    ///
    /// Returns `Ok(())` when the shared renewal succeeded and
    /// [`ApiError::RenewalExhausted`] when it failed or the attempt bound has
    /// been reached.
    pub async fn renew<Renew, RenewFut>(&self, renew: Renew) -> Result<(), ApiError>
    where
        Renew: FnOnce() -> RenewFut,
        RenewFut: Future<Output = Result<(), ApiError>>,
    {
        let role = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match &inner.slot {
                Slot::Renewing(rx) => Role::Follower(rx.clone()),
                Slot::Idle if inner.attempts >= self.max_attempts => Role::Refused(inner.attempts),
                Slot::Idle => {
                    inner.attempts += 1;
                    let (tx, rx) = watch::channel(None);
                    inner.slot = Slot::Renewing(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Refused(attempts) => {
                log::warn!(
                    "[Renewal] Refusing renewal after {} failed attempts",
                    attempts
                );
                self.notify_exhausted(attempts);
                Err(ApiError::RenewalExhausted)
            }
            Role::Follower(rx) => {
                log::debug!("[Renewal] Waiting on renewal already in flight");
                Self::wait_for_outcome(rx).await
            }
            Role::Leader(tx) => self.lead(tx, renew).await,
        }
    }

    async fn lead<Renew, RenewFut>(
        &self,
        tx: watch::Sender<Option<bool>>,
        renew: Renew,
    ) -> Result<(), ApiError>
    where
        Renew: FnOnce() -> RenewFut,
        RenewFut: Future<Output = Result<(), ApiError>>,
    {
        // If this future is dropped mid-renewal, free the slot; followers see
        // the sender drop and treat it as a failed renewal.
        let guard = scopeguard::guard((), |()| {
            self.lock().slot = Slot::Idle;
        });

        log::info!("[Renewal] Renewing credentials");
        let result = renew().await;
        let renewed = result.is_ok();

        let attempts = {
            let mut inner = self.lock();
            inner.slot = Slot::Idle;
            if renewed {
                inner.attempts = 0;
            }
            inner.attempts
        };
        scopeguard::ScopeGuard::into_inner(guard);
        tx.send_replace(Some(renewed));

        match result {
            Ok(()) => {
                log::info!("[Renewal] Credentials renewed");
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "[Renewal] Renewal failed (attempt {}/{}): {}",
                    attempts,
                    self.max_attempts,
                    e
                );
                self.notify_exhausted(attempts);
                Err(ApiError::RenewalExhausted)
            }
        }
    }

    async fn wait_for_outcome(mut rx: watch::Receiver<Option<bool>>) -> Result<(), ApiError> {
        loop {
            let outcome = *rx.borrow_and_update();
            match outcome {
                Some(true) => return Ok(()),
                Some(false) => return Err(ApiError::RenewalExhausted),
                None => {}
            }
            if rx.changed().await.is_err() {
                // Leader went away; a value may still have landed first.
                let outcome = *rx.borrow();
                return match outcome {
                    Some(true) => Ok(()),
                    _ => Err(ApiError::RenewalExhausted),
                };
            }
        }
    }

    fn notify_exhausted(&self, attempts: u32) {
        // No subscribers is fine.
        let _ = self.exhausted_tx.send(RenewalExhaustedEvent { attempts });
    }
}
