use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
    refresh::RefreshCoordinator,
    stomp::{StompCommand, StompFrame},
    transport::{PushConnector, PushLink},
};

const AUTHORIZATION: &str = "Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_auth_failures: u32,
}

impl From<&ClientSettings> for ConnectionConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            url: settings.push_url.clone(),
            connect_timeout: settings.connect_timeout,
            health_check_interval: settings.health_check_interval,
            reconnect_delay: settings.reconnect_delay,
            max_auth_failures: settings.max_auth_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub destination: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    destination: String,
}

impl SubscriptionHandle {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn unsubscribe(&self, manager: &ConnectionManager) -> bool {
        manager.unsubscribe(&self.destination).await
    }
}

type ConnectFuture = Shared<BoxFuture<'static, ClientResult<()>>>;

/// Owns the single push connection and multiplexes subscriptions over it.
///
/// The registry outlives any one link: every successful (re)connect replays
/// it as fresh subscriptions.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ConnectionConfig,
    connector: Arc<dyn PushConnector>,
    coordinator: RefreshCoordinator,
    state: watch::Sender<ConnectionState>,
    core: Mutex<Core>,
    connecting: StdMutex<Option<ConnectFuture>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct Core {
    live: Option<LiveLink>,
    registry: HashMap<String, RegistryEntry>,
    headers: HashMap<String, String>,
    next_subscription: u64,
    generation: u64,
    auth_failures: u32,
    // Set once the session is gone or the retry budget is spent. Only stands
    // while the store is empty.
    halted: Option<ClientError>,
    // Whether the connection should be kept alive by reconnects.
    wanted: bool,
    // An authorization failure is being refreshed and retried.
    recovering_auth: bool,
}

struct LiveLink {
    outbound: mpsc::UnboundedSender<StompFrame>,
    reader: JoinHandle<()>,
}

struct RegistryEntry {
    sender: mpsc::UnboundedSender<PushMessage>,
    headers: Vec<(String, String)>,
    live_id: Option<String>,
}

impl Core {
    fn subscription_id(&mut self) -> String {
        self.next_subscription += 1;
        format!("sub-{}", self.next_subscription)
    }

    fn send(&self, frame: StompFrame) -> bool {
        match &self.live {
            Some(live) => live.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn take_link(&mut self) -> Option<LiveLink> {
        for entry in self.registry.values_mut() {
            entry.live_id = None;
        }
        self.live.take()
    }

    fn clear_session(&mut self) -> Option<LiveLink> {
        self.wanted = false;
        self.recovering_auth = false;
        self.registry.clear();
        self.headers.remove(AUTHORIZATION);
        self.take_link()
    }

    fn link_is_dead(&self) -> bool {
        match &self.live {
            Some(live) => live.outbound.is_closed() || live.reader.is_finished(),
            None => true,
        }
    }
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn PushConnector>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                coordinator,
                state,
                core: Mutex::new(Core {
                    live: None,
                    registry: HashMap::new(),
                    headers: HashMap::new(),
                    next_subscription: 0,
                    generation: 0,
                    auth_failures: 0,
                    halted: None,
                    wanted: false,
                    recovering_auth: false,
                }),
                connecting: StdMutex::new(None),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn start(
        config: ConnectionConfig,
        connector: Arc<dyn PushConnector>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        let manager = Self::new(config, connector, coordinator);
        let health = tokio::spawn(manager.clone().run_health_checks());
        let credentials = tokio::spawn(manager.clone().run_credential_listener());
        manager.lock_tasks().extend([health, credentials]);
        manager
    }

    pub async fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.teardown().await;
        info!("push: connection manager shut down");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.core.lock().await.registry.len()
    }

    pub async fn auth_failures(&self) -> u32 {
        self.inner.core.lock().await.auth_failures
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(state = ?next, "push: connection state changed");
        }
    }

    pub fn connect(&self) -> BoxFuture<'static, ClientResult<()>> {
        let manager = self.clone();
        async move { manager.connect_or_join().await }.boxed()
    }

    async fn connect_or_join(&self) -> ClientResult<()> {
        if self.state() == ConnectionState::Connected && !self.inner.core.lock().await.link_is_dead()
        {
            return Ok(());
        }

        let attempt = {
            let mut slot = self
                .inner
                .connecting
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let manager = self.clone();
                    let task = tokio::spawn(async move {
                        let result = manager.establish().await;
                        manager
                            .inner
                            .connecting
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        result
                    });
                    let attempt = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(ClientError::network(format!("connect task failed: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    async fn establish(&self) -> ClientResult<()> {
        {
            let mut core = self.inner.core.lock().await;
            if core.halted.is_some() && self.inner.coordinator.store().read().is_some() {
                info!("push: signed in again; reconnects re-enabled");
                core.halted = None;
                core.auth_failures = 0;
            }
            if let Some(reason) = &core.halted {
                return Err(reason.clone());
            }
            if core.live.is_some() && !core.link_is_dead() {
                drop(core);
                self.set_state(ConnectionState::Connected);
                return Ok(());
            }
        }

        let recovering = self.state() != ConnectionState::Disconnected;
        if !recovering {
            self.set_state(ConnectionState::Connecting);
        }
        let fallback = if recovering {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };

        let token = match self.inner.coordinator.ensure_valid_token().await {
            Ok(token) => token,
            Err(err) => {
                self.set_state(fallback);
                return Err(err);
            }
        };
        let headers = {
            let mut core = self.inner.core.lock().await;
            core.wanted = true;
            core.headers
                .insert(AUTHORIZATION.to_string(), format!("Bearer {token}"));
            core.headers.clone()
        };

        let opened = tokio::time::timeout(
            self.inner.config.connect_timeout,
            self.inner.connector.open(&self.inner.config.url, &headers),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ClientError::timeout(
                "push connect",
                self.inner.config.connect_timeout,
            ))
        });

        let link = match opened {
            Ok(link) => link,
            Err(err) => {
                warn!("push: connect failed: {err}");
                self.set_state(fallback);
                if err.is_auth() {
                    let manager = self.clone();
                    tokio::spawn(async move { manager.handle_auth_failure(token).await });
                }
                return Err(err);
            }
        };

        self.install_link(link).await
    }

    async fn install_link(&self, link: PushLink) -> ClientResult<()> {
        let mut core = self.inner.core.lock().await;
        if let Some(reason) = &core.halted {
            let _ = link.outbound.send(StompFrame::disconnect());
            return Err(reason.clone());
        }
        if !core.wanted {
            let _ = link.outbound.send(StompFrame::disconnect());
            return Err(ClientError::NotConnected);
        }

        if let Some(stale) = core.take_link() {
            stale.reader.abort();
        }
        core.generation += 1;
        let generation = core.generation;
        let reader = tokio::spawn(self.clone().read_loop(generation, link.inbound));
        core.live = Some(LiveLink {
            outbound: link.outbound,
            reader,
        });
        self.resubscribe_all(&mut core);
        drop(core);

        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn resubscribe_all(&self, core: &mut Core) {
        let destinations: Vec<String> = core.registry.keys().cloned().collect();
        let mut restored = 0usize;
        for destination in destinations {
            let id = core.subscription_id();
            let Some(entry) = core.registry.get(&destination) else {
                continue;
            };
            let mut frame = StompFrame::subscribe(&id, &destination);
            frame.headers.extend(entry.headers.iter().cloned());
            if core.send(frame) {
                if let Some(entry) = core.registry.get_mut(&destination) {
                    entry.live_id = Some(id);
                }
                restored += 1;
            } else {
                warn!(%destination, "push: resubscribe failed");
            }
        }
        if restored > 0 {
            info!(restored, "push: subscriptions restored");
        }
    }

    pub async fn subscribe(
        &self,
        destination: &str,
    ) -> ClientResult<(SubscriptionHandle, mpsc::UnboundedReceiver<PushMessage>)> {
        self.subscribe_with_headers(destination, Vec::new()).await
    }

    pub async fn subscribe_with_headers(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
    ) -> ClientResult<(SubscriptionHandle, mpsc::UnboundedReceiver<PushMessage>)> {
        let mut core = self.inner.core.lock().await;
        if self.state() != ConnectionState::Connected || core.live.is_none() {
            return Err(ClientError::NotConnected);
        }

        let id = core.subscription_id();
        let mut frame = StompFrame::subscribe(&id, destination);
        frame.headers.extend(headers.iter().cloned());
        if !core.send(frame) {
            return Err(ClientError::NotConnected);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let previous = core.registry.insert(
            destination.to_string(),
            RegistryEntry {
                sender,
                headers,
                live_id: Some(id),
            },
        );
        if let Some(old_id) = previous.and_then(|entry| entry.live_id) {
            core.send(StompFrame::unsubscribe(&old_id));
        }
        debug!(%destination, "push: subscribed");

        Ok((
            SubscriptionHandle {
                destination: destination.to_string(),
            },
            receiver,
        ))
    }

    pub async fn unsubscribe(&self, destination: &str) -> bool {
        let mut core = self.inner.core.lock().await;
        let Some(entry) = core.registry.remove(destination) else {
            return false;
        };
        if let Some(id) = entry.live_id {
            core.send(StompFrame::unsubscribe(&id));
        }
        debug!(%destination, "push: unsubscribed");
        true
    }

    pub async fn publish(&self, destination: &str, payload: impl Into<String>) -> ClientResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let token = self.inner.coordinator.ensure_valid_token().await?;

        let mut core = self.inner.core.lock().await;
        let bearer = format!("Bearer {token}");
        core.headers.insert(AUTHORIZATION.to_string(), bearer.clone());
        let frame = StompFrame::send(destination, payload).with_header(AUTHORIZATION, bearer);
        if core.send(frame) {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    pub async fn disconnect(&self) {
        let link = {
            let mut core = self.inner.core.lock().await;
            core.wanted = false;
            core.take_link()
        };
        close_link(link);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self) {
        let link = self.inner.core.lock().await.clear_session();
        close_link(link);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn read_loop(self, generation: u64, mut inbound: mpsc::UnboundedReceiver<StompFrame>) {
        while let Some(frame) = inbound.recv().await {
            match frame.command {
                StompCommand::Message => self.deliver(generation, frame).await,
                StompCommand::Error if frame.is_auth_failure() => {
                    let rejected = self.current_token().await;
                    if self.is_current(generation).await {
                        let manager = self.clone();
                        tokio::spawn(async move { manager.handle_auth_failure(rejected).await });
                    }
                    return;
                }
                StompCommand::Error => {
                    warn!(
                        message = frame.header("message").unwrap_or_default(),
                        "push: broker reported an error; treating link as lost"
                    );
                    break;
                }
                StompCommand::Receipt => {
                    debug!(receipt = frame.header("receipt-id").unwrap_or_default(), "push: receipt")
                }
                other => debug!(command = %other, "push: ignoring frame"),
            }
        }
        self.on_link_lost(generation).await;
    }

    async fn is_current(&self, generation: u64) -> bool {
        let core = self.inner.core.lock().await;
        core.generation == generation && core.live.is_some()
    }

    async fn current_token(&self) -> String {
        let core = self.inner.core.lock().await;
        core.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_string()
    }

    async fn deliver(&self, generation: u64, frame: StompFrame) {
        let mut core = self.inner.core.lock().await;
        if core.generation != generation {
            return;
        }
        // A delivered message proves the current credential works.
        core.auth_failures = 0;

        let subscription = frame.header("subscription");
        let destination = frame.header("destination").unwrap_or_default();
        let key = core
            .registry
            .iter()
            .find(|(_, entry)| subscription.is_some() && entry.live_id.as_deref() == subscription)
            .map(|(key, _)| key.clone())
            .or_else(|| {
                core.registry
                    .contains_key(destination)
                    .then(|| destination.to_string())
            });
        let Some(key) = key else {
            debug!(%destination, "push: message for unknown subscription");
            return;
        };

        let message = PushMessage {
            destination: key.clone(),
            headers: frame.headers.clone(),
            body: frame.body,
        };
        let receiver_gone = core
            .registry
            .get(&key)
            .map(|entry| entry.sender.send(message).is_err())
            .unwrap_or(false);
        if receiver_gone {
            if let Some(entry) = core.registry.remove(&key) {
                if let Some(id) = entry.live_id {
                    core.send(StompFrame::unsubscribe(&id));
                }
            }
            debug!(destination = %key, "push: consumer dropped; subscription removed");
        }
    }

    async fn on_link_lost(&self, generation: u64) {
        {
            let mut core = self.inner.core.lock().await;
            if core.generation != generation || core.live.is_none() {
                return;
            }
            core.take_link();
            if core.halted.is_some() || !core.wanted {
                drop(core);
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        }
        warn!("push: connection lost; reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let manager = self.clone();
        let delay = self.inner.config.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.state() != ConnectionState::Reconnecting
                || manager.inner.core.lock().await.recovering_auth
            {
                return;
            }
            if let Err(err) = manager.connect().await {
                warn!("push: reconnect failed; health check will retry: {err}");
            }
        });
    }

    async fn handle_auth_failure(&self, rejected_token: String) {
        let (failures, link) = {
            let mut core = self.inner.core.lock().await;
            if core.halted.is_some() {
                return;
            }
            core.auth_failures += 1;
            core.recovering_auth = true;
            (core.auth_failures, core.take_link())
        };
        close_link(link);
        let max = self.inner.config.max_auth_failures;
        warn!(failures, max, "push: authorization rejected");

        if failures > max {
            let reason = ClientError::RetryBudgetExhausted { failures };
            self.inner
                .coordinator
                .expire_session(reason.to_string())
                .await;
            self.halt(reason).await;
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        match self
            .inner
            .coordinator
            .refresh_after_rejection(&rejected_token)
            .await
        {
            Ok(token) => {
                self.inner
                    .core
                    .lock()
                    .await
                    .headers
                    .insert(AUTHORIZATION.to_string(), format!("Bearer {token}"));
            }
            Err(err) if err.is_terminal() => {
                error!("push: refresh after authorization failure failed: {err}");
                self.halt(err).await;
                return;
            }
            Err(err) => {
                warn!("push: refresh after authorization failure failed; health check will retry: {err}");
                self.inner.core.lock().await.recovering_auth = false;
                return;
            }
        }

        tokio::time::sleep(self.inner.config.reconnect_delay).await;
        {
            let mut core = self.inner.core.lock().await;
            core.recovering_auth = false;
            if core.halted.is_some() || !core.wanted {
                return;
            }
        }
        if let Err(err) = self.connect().await {
            warn!("push: reconnect after refresh failed: {err}");
        }
    }

    async fn halt(&self, reason: ClientError) {
        let link = {
            let mut core = self.inner.core.lock().await;
            core.recovering_auth = false;
            if self.inner.coordinator.store().read().is_some() {
                debug!("push: not halting; signed in again: {reason}");
                return;
            }
            error!("push: halting reconnects: {reason}");
            core.wanted = false;
            core.halted = Some(reason);
            core.take_link()
        };
        close_link(link);
        self.set_state(ConnectionState::Disconnected);
    }

    pub async fn health_check(&self) {
        let stale = {
            let mut core = self.inner.core.lock().await;
            if core.halted.is_some()
                || !core.wanted
                || core.recovering_auth
                || !core.link_is_dead()
            {
                return;
            }
            core.take_link()
        };
        if stale.is_some() {
            warn!("push: health check found a dead link");
        }
        close_link(stale);

        self.set_state(ConnectionState::Reconnecting);
        debug!("push: health check reconnecting");
        if let Err(err) = self.connect().await {
            warn!("push: health check reconnect failed: {err}");
        }
    }

    async fn run_health_checks(self) {
        let mut ticker = tokio::time::interval(self.inner.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.health_check().await;
        }
    }

    async fn run_credential_listener(self) {
        let mut credentials = self.inner.coordinator.store().subscribe();
        while credentials.changed().await.is_ok() {
            let token = credentials
                .borrow_and_update()
                .as_ref()
                .map(|credential| credential.access_token.clone());
            match token {
                None => {
                    let link = {
                        let mut core = self.inner.core.lock().await;
                        if self.inner.coordinator.store().read().is_some() {
                            continue;
                        }
                        core.clear_session()
                    };
                    info!("push: credential cleared; tearing down connection");
                    close_link(link);
                    self.set_state(ConnectionState::Disconnected);
                }
                Some(token) => {
                    let mut core = self.inner.core.lock().await;
                    if core.halted.take().is_some() {
                        core.auth_failures = 0;
                        info!("push: new session; reconnects re-enabled");
                    }
                    core.headers
                        .insert(AUTHORIZATION.to_string(), format!("Bearer {token}"));
                }
            }
        }
    }
}

fn close_link(link: Option<LiveLink>) {
    if let Some(link) = link {
        let _ = link.outbound.send(StompFrame::disconnect());
        link.reader.abort();
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
