use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};

use anyhow::Context;
use futures::StreamExt;
use shared::{
    domain::{
        chat_destination, chat_publish_destination, user_notification_destination, ChatId,
        ConversationSummary,
    },
    protocol::ControlFrame,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, WatchStream};
use tracing::{info, warn};

pub mod cache;
pub mod config;
pub mod connection;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod refresh;
pub mod stomp;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use cache::ConversationCache;
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, PushMessage};
pub use credential::{Credential, CredentialStore, FileReplica, SessionReplica};
pub use dispatcher::{ChatDispatcher, ChatEvent};
pub use error::{ClientError, ClientResult};
pub use http::{ApiClient, ApiRequest, HttpTokenRefresher};
pub use refresh::{RefreshCoordinator, SessionEvent};
pub use transport::{PushConnector, WsConnector};

const HISTORY_PAGE_SIZE: u32 = 30;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Session(SessionEvent),
    Connection(ConnectionState),
    Chat(ChatEvent),
    Notification { body: String },
}

pub struct NotifyClient {
    settings: ClientSettings,
    api: ApiClient,
    connection: ConnectionManager,
    cache: ConversationCache,
    inner: Mutex<ClientState>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct ClientState {
    open_chats: HashMap<ChatId, OpenChat>,
    notifications: Option<JoinHandle<()>>,
}

struct OpenChat {
    dispatcher: ChatDispatcher,
    runner: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl OpenChat {
    fn stop(self) {
        self.runner.abort();
        self.forwarder.abort();
    }
}

impl NotifyClient {
    pub async fn open(settings: ClientSettings) -> anyhow::Result<Arc<Self>> {
        config::prepare_data_dir(&settings)?;
        let store = CredentialStore::open(
            Arc::new(SessionReplica::new()),
            Arc::new(FileReplica::new(settings.credential_file())),
        )
        .await;
        let http = http::build_http_client().context("failed to build http client")?;
        Ok(Self::with_parts(settings, store, http, Arc::new(WsConnector)))
    }

    pub fn with_parts(
        settings: ClientSettings,
        store: CredentialStore,
        http: reqwest::Client,
        connector: Arc<dyn PushConnector>,
    ) -> Arc<Self> {
        let refresher = Arc::new(HttpTokenRefresher::new(
            http.clone(),
            &settings.api_base_url,
            &settings.refresh_path,
        ));
        let coordinator = RefreshCoordinator::new(
            store,
            refresher,
            settings.refresh_wait_timeout,
            settings.expiry_skew,
        );
        let api = ApiClient::new(
            http,
            settings.api_base_url.clone(),
            settings.refresh_path.clone(),
            coordinator.clone(),
        );
        let connection =
            ConnectionManager::start(ConnectionConfig::from(&settings), connector, coordinator);
        let (events, _) = broadcast::channel(1024);

        let client = Arc::new(Self {
            settings,
            api,
            connection,
            cache: ConversationCache::new(),
            inner: Mutex::new(ClientState::default()),
            background: StdMutex::new(Vec::new()),
            events,
        });
        client.spawn_forwarders();
        client
    }

    fn spawn_forwarders(self: &Arc<Self>) {
        let mut states = WatchStream::new(self.connection.watch_state());
        let events = self.events.clone();
        let state_task = tokio::spawn(async move {
            while let Some(state) = states.next().await {
                let _ = events.send(ClientEvent::Connection(state));
            }
        });

        let mut sessions = BroadcastStream::new(self.api.coordinator().subscribe_events());
        let client: Weak<Self> = Arc::downgrade(self);
        let session_task = tokio::spawn(async move {
            while let Some(event) = sessions.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: session events lagged");
                        continue;
                    }
                };
                let Some(client) = client.upgrade() else {
                    break;
                };
                if matches!(
                    event,
                    SessionEvent::SessionExpired { .. } | SessionEvent::SignedOut
                ) {
                    client.close_all().await;
                }
                let _ = client.events.send(ClientEvent::Session(event));
            }
        });

        self.lock_background().extend([state_task, session_task]);
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn current_user(&self) -> Option<Credential> {
        self.api.coordinator().store().read()
    }

    pub async fn login(&self, user_name: &str, password: &str) -> ClientResult<Credential> {
        let credential = self.api.login(user_name, password).await?;
        self.connection.connect().await?;
        Ok(credential)
    }

    pub async fn resume(&self) -> ClientResult<Option<Credential>> {
        let Some(credential) = self.current_user() else {
            return Ok(None);
        };
        self.connection.connect().await?;
        info!(user_id = credential.user_id.0, "client: resumed session");
        Ok(Some(credential))
    }

    pub async fn logout(&self) {
        self.close_all().await;
        self.api.logout().await;
    }

    pub async fn refresh_conversations(&self) -> ClientResult<Vec<ConversationSummary>> {
        let rows = self.api.list_conversations().await?;
        self.cache.replace_all(rows).await;
        Ok(self.cache.list().await)
    }

    pub async fn open_chat(&self, chat_id: ChatId) -> ClientResult<ChatDispatcher> {
        let viewer = self
            .current_user()
            .ok_or(ClientError::SessionCleared)?
            .user_id;
        if let Some(open) = self.inner.lock().await.open_chats.get(&chat_id) {
            return Ok(open.dispatcher.clone());
        }

        self.connection.connect().await?;
        let dispatcher = ChatDispatcher::new(chat_id, viewer, self.cache.clone());
        let page = self
            .api
            .fetch_messages(chat_id, 0, HISTORY_PAGE_SIZE)
            .await?;
        dispatcher.merge_history(page.messages).await;
        let (_, frames) = self.connection.subscribe(&chat_destination(chat_id)).await?;
        dispatcher.mark_read_locally().await;

        let mut chat_events = dispatcher.subscribe_events();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match chat_events.recv().await {
                    Ok(event) => {
                        let _ = events.send(ClientEvent::Chat(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: chat events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(frames).await })
        };

        let previous = self.inner.lock().await.open_chats.insert(
            chat_id,
            OpenChat {
                dispatcher: dispatcher.clone(),
                runner,
                forwarder,
            },
        );
        if let Some(previous) = previous {
            previous.stop();
        }
        info!(%chat_id, "client: chat opened");
        Ok(dispatcher)
    }

    pub async fn load_older(&self, chat_id: ChatId, page: u32) -> ClientResult<usize> {
        let dispatcher = self.open_chat(chat_id).await?;
        let page = self
            .api
            .fetch_messages(chat_id, page, HISTORY_PAGE_SIZE)
            .await?;
        Ok(dispatcher.merge_history(page.messages).await)
    }

    pub async fn close_chat(&self, chat_id: ChatId) -> bool {
        let Some(open) = self.inner.lock().await.open_chats.remove(&chat_id) else {
            return false;
        };
        self.connection
            .unsubscribe(&chat_destination(chat_id))
            .await;
        open.stop();
        info!(%chat_id, "client: chat closed");
        true
    }

    pub async fn subscribe_notifications(&self) -> ClientResult<()> {
        let user_id = self
            .current_user()
            .ok_or(ClientError::SessionCleared)?
            .user_id;
        self.connection.connect().await?;
        let (_, mut feed) = self
            .connection
            .subscribe(&user_notification_destination(user_id))
            .await?;

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = feed.recv().await {
                let _ = events.send(ClientEvent::Notification { body: message.body });
            }
        });
        if let Some(previous) = self.inner.lock().await.notifications.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: ChatId, typing: bool) -> ClientResult<()> {
        let sender_id = self
            .current_user()
            .ok_or(ClientError::SessionCleared)?
            .user_id;
        let frame = if typing {
            ControlFrame::Typing {
                sender_id,
                chat_id: Some(chat_id),
            }
        } else {
            ControlFrame::StopTyping {
                sender_id,
                chat_id: Some(chat_id),
            }
        };
        self.publish_control(chat_id, &frame).await
    }

    pub async fn send_read_receipt(&self, chat_id: ChatId) -> ClientResult<()> {
        let sender_id = self
            .current_user()
            .ok_or(ClientError::SessionCleared)?
            .user_id;
        self.publish_control(
            chat_id,
            &ControlFrame::Reading {
                sender_id,
                chat_id: Some(chat_id),
            },
        )
        .await
    }

    async fn publish_control(&self, chat_id: ChatId, frame: &ControlFrame) -> ClientResult<()> {
        let payload = serde_json::to_string(frame)
            .map_err(|err| ClientError::protocol(format!("failed to encode control frame: {err}")))?;
        self.connection
            .publish(&chat_publish_destination(chat_id), payload)
            .await
    }

    async fn close_all(&self) {
        let (chats, notifications) = {
            let mut state = self.inner.lock().await;
            (
                state.open_chats.drain().collect::<Vec<_>>(),
                state.notifications.take(),
            )
        };
        for (chat_id, open) in chats {
            self.connection
                .unsubscribe(&chat_destination(chat_id))
                .await;
            open.stop();
        }
        if let Some(task) = notifications {
            task.abort();
        }
        self.cache.clear().await;
    }

    pub async fn shutdown(&self) {
        self.close_all().await;
        for task in self.lock_background().drain(..) {
            task.abort();
        }
        self.connection.shutdown().await;
        info!("client: shut down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
