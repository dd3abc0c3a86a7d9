//! Session boundary: owns the current identity.
//!
//! The sync engine never decides who is signed in. [`SessionBoundary`]
//! publishes the current [`Identity`] on a `watch` channel and the
//! [`Reconciler`](crate::inbox::Reconciler) follows it. Credentials live in
//! the [`ApiClient`]'s cookie jar; nothing here stores or logs them.

use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::ApiError;
use crate::transport::{ApiClient, Identity};

/// Publishes the signed-in identity.
///
/// Cheap to clone; clones publish on the same channel.
#[derive(Debug, Clone)]
pub struct SessionBoundary {
    client: ApiClient,
    identity: Arc<watch::Sender<Option<Identity>>>,
}

impl SessionBoundary {
    /// Creates a signed-out session over `client`.
    pub fn new(client: ApiClient) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            client,
            identity: Arc::new(identity),
        }
    }

    /// Transport client the session authenticates.
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Currently signed-in identity.
    pub fn current(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Watches identity changes.
    ///
    /// The channel closes once every clone of the session is dropped.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    fn publish(&self, identity: Option<Identity>) {
        match &identity {
            Some(identity) => log::info!("[Session] Signed in as {}", identity.id),
            None => log::info!("[Session] Signed out"),
        }
        self.identity.send_replace(identity);
    }

    /// Logs in and publishes the identity.
    ///
    /// The profile is authoritative; the login response is used only if the
    /// profile cannot be fetched.
    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, ApiError> {
        let from_login = self.client.login(email, password).await?;
        let identity = match self.client.profile().await {
            Ok(profile) => profile,
            Err(e) => {
                log::warn!("[Session] Profile fetch after login failed: {}", e);
                from_login.ok_or(e)?
            }
        };
        self.publish(Some(identity.clone()));
        Ok(identity)
    }

    /// Registers an account and publishes the identity if the backend
    /// started a session for it.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, ApiError> {
        self.client.register(name, email, password).await?;
        match self.client.profile().await {
            Ok(identity) => {
                self.publish(Some(identity.clone()));
                Ok(Some(identity))
            }
            Err(e) => {
                log::info!("[Session] Registered without a session: {}", e);
                self.client.renewal().reset();
                Ok(None)
            }
        }
    }

    /// Resumes a session still held by the cookie jar.
    ///
    /// Returns `Ok(None)` when there is no valid session.
    pub async fn restore(&self) -> Result<Option<Identity>, ApiError> {
        match self.client.profile().await {
            Ok(identity) => {
                self.publish(Some(identity.clone()));
                Ok(Some(identity))
            }
            Err(ApiError::AuthorizationExpired | ApiError::RenewalExhausted) => {
                log::debug!("[Session] No session to restore");
                self.client.renewal().reset();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Logs out. The identity is cleared even if the server call fails.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.client.logout().await;
        if let Err(e) = &result {
            log::warn!("[Session] Remote logout failed: {}", e);
        }
        self.end_session();
        result
    }

    /// Clears the identity locally without contacting the server.
    pub fn end_session(&self) {
        if self.current().is_some() {
            self.publish(None);
        }
    }

    /// Ends the session whenever the transport reports renewal exhaustion.
    ///
    /// The task holds only a weak reference to the identity channel and
    /// exits once the session or the transport is gone.
    pub fn watch_renewal_exhaustion(&self) -> JoinHandle<()> {
        let mut exhausted = self.client.renewal().subscribe_exhausted();
        let identity: Weak<watch::Sender<Option<Identity>>> = Arc::downgrade(&self.identity);

        tokio::spawn(async move {
            loop {
                match exhausted.recv().await {
                    Ok(event) => {
                        let Some(identity) = identity.upgrade() else {
                            break;
                        };
                        if identity.borrow().is_some() {
                            log::warn!(
                                "[Session] Renewal exhausted after {} attempts, ending session",
                                event.attempts
                            );
                            identity.send_replace(None);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("[Session] Missed {} renewal events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
