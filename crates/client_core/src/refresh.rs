use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::domain::UserId;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use crate::{
    credential::{Credential, CredentialStore},
    error::{ClientError, ClientResult},
};

/// Performs the network call that trades the ambient refresh credential for
/// a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> ClientResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { user_id: UserId },
    TokenRefreshed,
    SessionExpired { reason: String },
    SignedOut,
}

type RefreshOutcome = Option<ClientResult<String>>;

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    pending: StdMutex<Option<watch::Receiver<RefreshOutcome>>>,
    // Serializes login, logout and refresh completion. The value is the
    // session epoch, bumped on every sign-in and sign-out.
    writer: Mutex<u64>,
    wait_timeout: Duration,
    expiry_skew: Duration,
    events: broadcast::Sender<SessionEvent>,
    refresh_calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
        wait_timeout: Duration,
        expiry_skew: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                refresher,
                pending: StdMutex::new(None),
                writer: Mutex::new(0),
                wait_timeout,
                expiry_skew,
                events,
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn ensure_valid_token(&self) -> ClientResult<String> {
        let Some(credential) = self.inner.store.read() else {
            return Err(ClientError::SessionCleared);
        };
        if !credential.is_locally_expired(self.inner.expiry_skew) {
            return Ok(credential.access_token);
        }
        let outcome = self.join_or_start();
        self.await_outcome(outcome).await
    }

    pub async fn refresh_after_rejection(&self, rejected_token: &str) -> ClientResult<String> {
        match self.inner.store.read() {
            None => Err(ClientError::SessionCleared),
            Some(credential) if credential.access_token != rejected_token => {
                Ok(credential.access_token)
            }
            Some(_) => {
                let outcome = self.join_or_start();
                self.await_outcome(outcome).await
            }
        }
    }

    pub async fn login(&self, credential: Credential) {
        let mut epoch = self.inner.writer.lock().await;
        *epoch += 1;
        let user_id = credential.user_id;
        if let Err(err) = self.inner.store.write(credential).await {
            warn!("session: signed in with degraded persistence: {err}");
        }
        info!(user_id = user_id.0, "session: signed in");
        let _ = self.inner.events.send(SessionEvent::SignedIn { user_id });
    }

    pub async fn logout(&self) {
        let mut epoch = self.inner.writer.lock().await;
        *epoch += 1;
        if let Err(err) = self.inner.store.clear().await {
            warn!("session: sign-out left a stale replica: {err}");
        }
        info!("session: signed out");
        let _ = self.inner.events.send(SessionEvent::SignedOut);
    }

    pub async fn expire_session(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut epoch = self.inner.writer.lock().await;
        *epoch += 1;
        if let Err(err) = self.inner.store.clear().await {
            warn!("session: expiry left a stale replica: {err}");
        }
        error!(%reason, "session: expired; re-authentication required");
        let _ = self.inner.events.send(SessionEvent::SessionExpired { reason });
    }

    fn join_or_start(&self) -> watch::Receiver<RefreshOutcome> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pending.as_ref() {
            // A dropped sender means the owning task died; start over.
            if existing.has_changed().is_ok() {
                return existing.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        *pending = Some(rx.clone());
        drop(pending);

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_refresh(tx).await;
        });
        rx
    }

    async fn run_refresh(&self, tx: watch::Sender<RefreshOutcome>) {
        let epoch_at_start = *self.inner.writer.lock().await;
        let call = self.inner.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(call, "session: refreshing access token");

        let outcome = match self.inner.refresher.refresh().await {
            Ok(token) => self.commit_refreshed(token, epoch_at_start).await,
            Err(err) => {
                self.expire_session(format!("token refresh failed: {err}"))
                    .await;
                Err(ClientError::Auth {
                    message: format!("token refresh failed: {err}"),
                })
            }
        };

        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = tx.send(Some(outcome));
    }

    async fn commit_refreshed(&self, token: String, epoch_at_start: u64) -> ClientResult<String> {
        let epoch = self.inner.writer.lock().await;
        if *epoch != epoch_at_start {
            warn!("session: discarding refreshed token; session changed during refresh");
            return Err(ClientError::SessionCleared);
        }
        let Some(current) = self.inner.store.read() else {
            return Err(ClientError::SessionCleared);
        };
        let refreshed = Credential::new(token.clone(), current.user_id, current.user_name);
        if let Err(err) = self.inner.store.write(refreshed).await {
            warn!("session: refreshed token with degraded persistence: {err}");
        }
        drop(epoch);
        info!("session: access token refreshed");
        let _ = self.inner.events.send(SessionEvent::TokenRefreshed);
        Ok(token)
    }

    async fn await_outcome(
        &self,
        mut outcome: watch::Receiver<RefreshOutcome>,
    ) -> ClientResult<String> {
        let wait = async {
            outcome
                .wait_for(Option::is_some)
                .await
                .map(|value| value.clone())
        };
        match tokio::time::timeout(self.inner.wait_timeout, wait).await {
            Err(_) => {
                warn!(
                    timeout_ms = self.inner.wait_timeout.as_millis() as u64,
                    "session: gave up waiting for token refresh"
                );
                Err(ClientError::timeout("token refresh", self.inner.wait_timeout))
            }
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) | Ok(Err(_)) => Err(ClientError::network(
                "token refresh ended without a result",
            )),
        }
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
