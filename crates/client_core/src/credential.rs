use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::{ClientError, ClientResult};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub user_id: UserId,
    pub user_name: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, user_id: UserId, user_name: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id,
            user_name: user_name.into(),
        }
    }

    pub fn is_locally_expired(&self, skew: Duration) -> bool {
        token_is_expired(&self.access_token, skew, Utc::now())
    }

    fn wipe(&mut self) {
        self.access_token.zeroize();
        self.user_name.zeroize();
        self.user_id = UserId(0);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("user_name", &self.user_name)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenClaims {
    exp: Option<i64>,
}

pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: TokenClaims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

pub fn token_is_expired(token: &str, skew: Duration, now: DateTime<Utc>) -> bool {
    let Some(expires_at) = token_expiry(token) else {
        return false;
    };
    let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
    expires_at <= now + skew
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    access_token: String,
    user_id: String,
    user_name: String,
}

impl From<&Credential> for StoredCredential {
    fn from(value: &Credential) -> Self {
        Self {
            access_token: value.access_token.clone(),
            user_id: value.user_id.0.to_string(),
            user_name: value.user_name.clone(),
        }
    }
}

impl StoredCredential {
    fn into_credential(self) -> Option<Credential> {
        if self.access_token.is_empty() {
            return None;
        }
        let user_id = self.user_id.trim().parse::<i64>().ok()?;
        Some(Credential::new(self.access_token, UserId(user_id), self.user_name))
    }
}

#[async_trait]
pub trait CredentialReplica: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self) -> ClientResult<Option<Credential>>;
    async fn save(&self, credential: &Credential) -> ClientResult<()>;
    async fn clear(&self) -> ClientResult<()>;
}

#[derive(Default)]
pub struct SessionReplica {
    slot: Mutex<Option<Credential>>,
}

impl SessionReplica {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialReplica for SessionReplica {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn load(&self) -> ClientResult<Option<Credential>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, credential: &Credential) -> ClientResult<()> {
        *self.slot.lock().await = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> ClientResult<()> {
        if let Some(mut old) = self.slot.lock().await.take() {
            old.wipe();
        }
        Ok(())
    }
}

pub struct FileReplica {
    path: PathBuf,
}

impl FileReplica {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialReplica for FileReplica {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self) -> ClientResult<Option<Credential>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ClientError::storage(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )))
            }
        };
        let stored: StoredCredential = serde_json::from_slice(&raw).map_err(|err| {
            ClientError::storage(format!("corrupt credential file {}: {err}", self.path.display()))
        })?;
        Ok(stored.into_credential())
    }

    async fn save(&self, credential: &Credential) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                ClientError::storage(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let body = serde_json::to_vec(&StoredCredential::from(credential))
            .map_err(|err| ClientError::storage(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|err| ClientError::storage(format!("failed to write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|err| {
            ClientError::storage(format!("failed to replace {}: {err}", self.path.display()))
        })
    }

    async fn clear(&self) -> ClientResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ClientError::storage(format!(
                "failed to remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    primary: Arc<dyn CredentialReplica>,
    durable: Arc<dyn CredentialReplica>,
    current: watch::Sender<Option<Credential>>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(primary: Arc<dyn CredentialReplica>, durable: Arc<dyn CredentialReplica>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(StoreInner {
                primary,
                durable,
                current,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(SessionReplica::new()), Arc::new(SessionReplica::new()))
    }

    pub async fn open(
        primary: Arc<dyn CredentialReplica>,
        durable: Arc<dyn CredentialReplica>,
    ) -> Self {
        let store = Self::new(primary, durable);
        store.hydrate().await;
        store
    }

    async fn hydrate(&self) {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock().await;

        let from_primary = load_or_warn(inner.primary.as_ref()).await;
        let (credential, missing) = match from_primary {
            Some(credential) => (credential, &inner.durable),
            None => match load_or_warn(inner.durable.as_ref()).await {
                Some(credential) => (credential, &inner.primary),
                None => return,
            },
        };

        if let Err(err) = missing.save(&credential).await {
            warn!(replica = missing.name(), "credential: failed to re-pair replica: {err}");
        }
        info!(user_id = credential.user_id.0, "credential: restored persisted session");
        inner.current.send_replace(Some(credential));
    }

    pub fn read(&self) -> Option<Credential> {
        self.inner.current.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.inner.current.subscribe()
    }

    pub async fn write(&self, credential: Credential) -> ClientResult<()> {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock().await;

        let (primary, durable) = tokio::join!(
            inner.primary.save(&credential),
            inner.durable.save(&credential)
        );
        let previous = inner.current.send_replace(Some(credential));
        if let Some(mut previous) = previous {
            previous.wipe();
        }
        paired_outcome("write", inner, primary, durable)
    }

    pub async fn clear(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock().await;

        let (primary, durable) = tokio::join!(inner.primary.clear(), inner.durable.clear());
        if let Some(mut previous) = inner.current.send_replace(None) {
            previous.wipe();
        }
        paired_outcome("clear", inner, primary, durable)
    }
}

async fn load_or_warn(replica: &dyn CredentialReplica) -> Option<Credential> {
    match replica.load().await {
        Ok(credential) => credential,
        Err(err) => {
            warn!(replica = replica.name(), "credential: failed to load replica: {err}");
            None
        }
    }
}

fn paired_outcome(
    operation: &str,
    inner: &StoreInner,
    primary: ClientResult<()>,
    durable: ClientResult<()>,
) -> ClientResult<()> {
    let mut failures = Vec::new();
    for (replica, result) in [(&inner.primary, primary), (&inner.durable, durable)] {
        if let Err(err) = result {
            warn!(replica = replica.name(), operation, "credential: replica update failed: {err}");
            failures.push(format!("{}: {err}", replica.name()));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ClientError::storage(format!(
            "credential {operation} incomplete ({})",
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
#[path = "tests/credential_tests.rs"]
mod tests;
