use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use shared::domain::UserId;
use tokio::sync::{mpsc, Mutex};

use crate::{
    credential::{Credential, CredentialReplica, CredentialStore},
    error::{ClientError, ClientResult},
    refresh::TokenRefresher,
    stomp::{StompCommand, StompFrame},
    transport::{PushConnector, PushLink},
};

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: i64,
}

/// Signed token whose `exp` lies `expires_in_secs` from now (negative for
/// already expired).
pub fn mint_token(subject: &str, expires_in_secs: i64) -> String {
    let claims = Claims {
        sub: subject,
        exp: chrono::Utc::now().timestamp() + expires_in_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("mint token")
}

pub fn credential(token: &str) -> Credential {
    Credential::new(token, UserId(7), "alice")
}

pub async fn store_with(token: &str) -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.write(credential(token)).await.expect("seed credential");
    store
}

#[derive(Default)]
pub struct FlakyReplica {
    pub failing: AtomicBool,
    pub saved: Mutex<Option<Credential>>,
}

impl FlakyReplica {
    pub fn failing() -> Arc<Self> {
        let replica = Self::default();
        replica.failing.store(true, Ordering::SeqCst);
        Arc::new(replica)
    }

    fn check(&self) -> ClientResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::storage("replica unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialReplica for FlakyReplica {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn load(&self) -> ClientResult<Option<Credential>> {
        self.check()?;
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, credential: &Credential) -> ClientResult<()> {
        self.check()?;
        *self.saved.lock().await = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> ClientResult<()> {
        self.check()?;
        *self.saved.lock().await = None;
        Ok(())
    }
}

pub struct CountingRefresher {
    pub calls: AtomicU32,
    token: String,
    delay: Duration,
}

impl CountingRefresher {
    pub fn new(token: &str) -> Arc<Self> {
        Self::slow(token, Duration::ZERO)
    }

    pub fn slow(token: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            token: token.to_string(),
            delay,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self) -> ClientResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.token.clone())
    }
}

pub struct BrokerLink {
    pub headers: HashMap<String, String>,
    pub from_client: mpsc::UnboundedReceiver<StompFrame>,
    pub to_client: mpsc::UnboundedSender<StompFrame>,
}

impl BrokerLink {
    pub async fn next_frame(&mut self) -> StompFrame {
        tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("frame within timeout")
            .expect("client link open")
    }

    pub async fn collect(&mut self, command: StompCommand, count: usize) -> Vec<StompFrame> {
        let mut seen = Vec::new();
        while seen.len() < count {
            let frame = self.next_frame().await;
            if frame.command == command {
                seen.push(frame);
            }
        }
        seen
    }

    pub fn push(&self, frame: StompFrame) {
        self.to_client.send(frame).expect("client reader alive");
    }

    pub fn message(&self, subscription: &str, destination: &str, body: &str) {
        self.push(
            StompFrame::new(StompCommand::Message)
                .with_header("subscription", subscription)
                .with_header("destination", destination)
                .with_header("message-id", "m-1")
                .with_body(body),
        );
    }

    pub fn reject(&self) {
        self.push(
            StompFrame::new(StompCommand::Error)
                .with_header("message", "401 Unauthorized: token expired"),
        );
    }
}

/// In-memory connector; every successful open is handed to the test through
/// the receiver returned by [`FakeBroker::new`].
pub struct FakeBroker {
    pub opens: AtomicU32,
    pub refuse_auth: AtomicBool,
    accepted: mpsc::UnboundedSender<BrokerLink>,
}

impl FakeBroker {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerLink>) {
        let (accepted, links) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            opens: AtomicU32::new(0),
            refuse_auth: AtomicBool::new(false),
            accepted,
        });
        (broker, links)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for FakeBroker {
    async fn open(&self, _url: &str, headers: &HashMap<String, String>) -> ClientResult<PushLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_auth.load(Ordering::SeqCst) {
            return Err(ClientError::Auth {
                message: "401 Unauthorized".into(),
            });
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.accepted.send(BrokerLink {
            headers: headers.clone(),
            from_client,
            to_client,
        });
        Ok(PushLink { outbound, inbound })
    }
}

pub async fn next_link(links: &mut mpsc::UnboundedReceiver<BrokerLink>) -> BrokerLink {
    tokio::time::timeout(Duration::from_secs(2), links.recv())
        .await
        .expect("link within timeout")
        .expect("broker alive")
}

/// Connector whose handshake never completes.
pub struct StalledConnector;

#[async_trait]
impl PushConnector for StalledConnector {
    async fn open(&self, _url: &str, _headers: &HashMap<String, String>) -> ClientResult<PushLink> {
        futures::future::pending().await
    }
}
