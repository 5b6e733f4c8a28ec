//! Single persistent push-hub connection with backoff reconnect.

use super::backoff::ExponentialBackoff;
use super::transport::{HubLink, HubSession, HubTransport, TransportEvent};
use crate::auth::{CredentialProvider, require_token};
use async_trait::async_trait;
use runwire_core::event::HubFrame;
use runwire_core::permission::{DEFAULT_DENY_REASON, RunCommands};
use runwire_core::{ClientError, ClientSettings, Result};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub const METHOD_JOIN: &str = "Join";
pub const METHOD_GRANT: &str = "Grant";
pub const METHOD_DENY: &str = "Deny";
pub const METHOD_SUBSCRIBE: &str = "SubscribeToChat";
pub const METHOD_UNSUBSCRIBE: &str = "UnsubscribeFromChat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Everything the manager reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum HubNotification {
    ConnectionStateChanged(bool),
    /// Transport or auth failure the caller should surface
    Error(ClientError),
    /// A pushed frame, unmodified
    Frame(HubFrame),
    /// Chat ids resubscribed after a reconnect
    Resubscribed(Vec<String>),
}

struct State {
    status: ConnectionStatus,
    link: Option<Arc<dyn HubLink>>,
    subscriptions: BTreeSet<String>,
    joined_run: Option<String>,
    cancel: CancellationToken,
}

struct Inner {
    settings: ClientSettings,
    transport: Arc<dyn HubTransport>,
    credentials: Arc<dyn CredentialProvider>,
    notifications: mpsc::UnboundedSender<HubNotification>,
    state: Mutex<State>,
    connecting: AtomicBool,
}

/// Owns the one live hub link.
///
/// Session and run state are never touched here; everything received is
/// forwarded as a [`HubNotification`]. Subscriptions are private to the
/// manager: replayed after a reconnect and cleared by [`disconnect`].
///
/// [`disconnect`]: ConnectionManager::disconnect
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: ClientSettings,
        transport: Arc<dyn HubTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<HubNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            settings,
            transport,
            credentials,
            notifications: tx,
            state: Mutex::new(State {
                status: ConnectionStatus::Disconnected,
                link: None,
                subscriptions: BTreeSet::new(),
                joined_run: None,
                cancel: CancellationToken::new(),
            }),
            connecting: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Opens the hub link.
    ///
    /// Fails with `AuthRequired` before opening anything when no credential
    /// is available. A call while another connect is running, or while
    /// already connected, is a no-op. Transport failures are retried with
    /// backoff; the last one becomes `ConnectionFailed`.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("[Hub] connect already in progress, ignoring");
            return Ok(());
        }
        let _flag = ConnectFlag(&self.inner.connecting);

        require_token(self.inner.credentials.as_ref())?;

        let cancel = {
            let mut state = self.inner.state.lock().await;
            if state.status != ConnectionStatus::Disconnected {
                tracing::debug!("[Hub] connect ignored, status is {:?}", state.status);
                return Ok(());
            }
            state.status = ConnectionStatus::Connecting;
            state.cancel = CancellationToken::new();
            state.cancel.clone()
        };

        tracing::info!("[Hub] Connecting to {}", self.inner.settings.hub_url());
        let session = match self.inner.open_with_retry(&cancel, false).await {
            Ok(session) => session,
            Err(err) => {
                self.inner.set_status(ConnectionStatus::Disconnected).await;
                return Err(err);
            }
        };

        self.inner.activate(session.link, &cancel).await?;
        tokio::spawn(supervise(self.inner.clone(), session.events, cancel));
        Ok(())
    }

    /// Closes the link and forgets subscriptions and the joined run. No
    /// reconnect is attempted afterwards. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (link, was_connected) = {
            let mut state = self.inner.state.lock().await;
            state.cancel.cancel();
            state.subscriptions.clear();
            state.joined_run = None;
            let was_connected = state.status == ConnectionStatus::Connected;
            state.status = ConnectionStatus::Disconnected;
            (state.link.take(), was_connected)
        };

        if let Some(link) = link {
            link.close().await;
        }
        if was_connected {
            tracing::info!("[Hub] Disconnected");
            self.inner
                .notify(HubNotification::ConnectionStateChanged(false));
        }
    }

    /// Asks the server to push events for `chat_id`. No-op when not
    /// connected.
    pub async fn subscribe(&self, chat_id: &str) -> Result<()> {
        let Some((link, cancel)) = self.live_link().await else {
            tracing::debug!("[Hub] Not connected, subscribe({}) skipped", chat_id);
            return Ok(());
        };
        link.invoke(METHOD_SUBSCRIBE, vec![json!(chat_id)]).await?;
        if !self.inner.remember_subscription(&cancel, chat_id).await {
            tracing::debug!("[Hub] Disconnected during subscribe({}), not kept", chat_id);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, chat_id: &str) -> Result<()> {
        self.inner.state.lock().await.subscriptions.remove(chat_id);
        let Some((link, _)) = self.live_link().await else {
            tracing::debug!("[Hub] Not connected, unsubscribe({}) skipped", chat_id);
            return Ok(());
        };
        link.invoke(METHOD_UNSUBSCRIBE, vec![json!(chat_id)]).await
    }

    /// Joins a run's event group. The run is remembered and re-joined after
    /// every reconnect.
    pub async fn join(&self, run_id: &str) -> Result<()> {
        self.inner.state.lock().await.joined_run = Some(run_id.to_string());
        match self.live_link().await {
            Some((link, _)) => link.invoke(METHOD_JOIN, vec![json!(run_id)]).await,
            None => {
                tracing::debug!("[Hub] Not connected, Join({}) deferred", run_id);
                Ok(())
            }
        }
    }

    pub async fn grant(&self, run_id: &str, step_id: &str) -> Result<()> {
        self.invoke(METHOD_GRANT, vec![json!(run_id), json!(step_id)])
            .await
    }

    /// Denies a step; `reason` defaults to "Denied by user".
    pub async fn deny(&self, run_id: &str, step_id: &str, reason: Option<&str>) -> Result<()> {
        let reason = reason.unwrap_or(DEFAULT_DENY_REASON);
        self.invoke(METHOD_DENY, vec![json!(run_id), json!(step_id), json!(reason)])
            .await
    }

    /// Subscribes to every id in `chat_ids`, typically the reducer's session
    /// ids after an explicit reconnect. Returns the ids actually sent.
    pub async fn restore_subscriptions<I>(&self, chat_ids: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = String>,
    {
        if !self.is_connected().await {
            return Ok(Vec::new());
        }
        let mut restored = Vec::new();
        for chat_id in chat_ids {
            self.subscribe(&chat_id).await?;
            restored.push(chat_id);
        }
        Ok(restored)
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().await.status
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == ConnectionStatus::Connected
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .await
            .subscriptions
            .iter()
            .cloned()
            .collect()
    }

    pub async fn joined_run(&self) -> Option<String> {
        self.inner.state.lock().await.joined_run.clone()
    }

    /// The current link and the token of the connection it belongs to.
    async fn live_link(&self) -> Option<(Arc<dyn HubLink>, CancellationToken)> {
        let state = self.inner.state.lock().await;
        match (state.status, &state.link) {
            (ConnectionStatus::Connected, Some(link)) => Some((link.clone(), state.cancel.clone())),
            _ => None,
        }
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let (link, _) = self
            .live_link()
            .await
            .ok_or_else(|| ClientError::transport("Not connected to the event hub"))?;
        tracing::debug!("[Hub] invoke {}", method);
        link.invoke(method, args).await
    }
}

#[async_trait]
impl RunCommands for ConnectionManager {
    async fn grant(&self, run_id: &str, step_id: &str) -> Result<()> {
        ConnectionManager::grant(self, run_id, step_id).await
    }

    async fn deny(&self, run_id: &str, step_id: &str, reason: &str) -> Result<()> {
        ConnectionManager::deny(self, run_id, step_id, Some(reason)).await
    }
}

impl Inner {
    fn notify(&self, notification: HubNotification) {
        // The owner may have stopped listening; nothing to do then.
        let _ = self.notifications.send(notification);
    }

    async fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().await.status = status;
    }

    /// Opens a link, retrying retryable failures with backoff. With
    /// `delay_first` every attempt, including the first, waits its delay.
    async fn open_with_retry(
        &self,
        cancel: &CancellationToken,
        delay_first: bool,
    ) -> Result<HubSession> {
        let mut backoff = ExponentialBackoff::from_settings(&self.settings.reconnect);
        let mut attempts = 0u32;

        loop {
            if attempts > 0 || delay_first {
                let Some(delay) = backoff.next_delay() else {
                    tracing::error!("[Hub] Giving up after {} attempts", attempts);
                    return Err(ClientError::ConnectionFailed { attempts });
                };
                tracing::warn!("[Hub] Retrying in {:?} (attempt {})", delay, attempts + 1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ClientError::fatal_transport("Connection cancelled"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            attempts += 1;
            let token = require_token(self.credentials.as_ref())?;
            match self.open_once(&token).await {
                Ok(session) => return Ok(session),
                Err(err) if err.is_auth() || !err.is_retryable() => {
                    tracing::error!("[Hub] Connect failed: {}", err);
                    return Err(err);
                }
                Err(err) => tracing::warn!("[Hub] Connect attempt {} failed: {}", attempts, err),
            }
        }
    }

    async fn open_once(&self, token: &str) -> Result<HubSession> {
        let url = self.settings.hub_url();
        let timeout = self.settings.connect_timeout();
        match tokio::time::timeout(timeout, self.transport.open(&url, token)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(err)) => Err(classify_open_error(err)),
            Err(_) => Err(ClientError::transport(format!(
                "Connect timed out after {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Installs a freshly opened link and replays subscriptions and the
    /// joined run on it.
    async fn activate(&self, link: Arc<dyn HubLink>, cancel: &CancellationToken) -> Result<()> {
        let (subscriptions, joined_run) = {
            let mut state = self.state.lock().await;
            if cancel.is_cancelled() {
                drop(state);
                link.close().await;
                return Err(ClientError::fatal_transport("Disconnected while connecting"));
            }
            state.link = Some(link.clone());
            state.status = ConnectionStatus::Connected;
            (
                state.subscriptions.iter().cloned().collect::<Vec<_>>(),
                state.joined_run.clone(),
            )
        };
        tracing::info!("[Hub] Connected");
        self.notify(HubNotification::ConnectionStateChanged(true));

        let mut restored = Vec::new();
        for chat_id in subscriptions {
            match link.invoke(METHOD_SUBSCRIBE, vec![json!(chat_id)]).await {
                Ok(()) => restored.push(chat_id),
                Err(err) => tracing::warn!("[Hub] Resubscribe to {} failed: {}", chat_id, err),
            }
        }
        if let Some(run_id) = joined_run {
            if let Err(err) = link.invoke(METHOD_JOIN, vec![json!(run_id)]).await {
                tracing::warn!(run_id = %run_id, "[Hub] Re-join failed: {}", err);
            }
        }
        if !restored.is_empty() {
            self.notify(HubNotification::Resubscribed(restored));
        }
        Ok(())
    }

    /// Records a subscription unless the connection it was sent on has been
    /// closed by `disconnect` in the meantime.
    async fn remember_subscription(&self, cancel: &CancellationToken, chat_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        state.subscriptions.insert(chat_id.to_string());
        true
    }

    /// Moves to `Connecting` after an unexpected close. Returns `false`, and
    /// leaves the state alone, if the connection was cancelled.
    async fn mark_dropped(&self, cancel: &CancellationToken) -> bool {
        {
            let mut state = self.state.lock().await;
            if cancel.is_cancelled() {
                return false;
            }
            state.link = None;
            state.status = ConnectionStatus::Connecting;
        }
        self.notify(HubNotification::ConnectionStateChanged(false));
        true
    }

    async fn fail(&self, cancel: &CancellationToken, err: ClientError) {
        {
            let mut state = self.state.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            state.link = None;
            state.status = ConnectionStatus::Disconnected;
        }
        tracing::error!("[Hub] Connection lost for good: {}", err);
        self.notify(HubNotification::Error(err));
    }
}

/// Forwards frames until the link closes, then reconnects; repeats until
/// cancelled or the retry budget runs out.
async fn supervise(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let close_error = tokio::select! {
            _ = cancel.cancelled() => return,
            closed = pump(&inner, &mut events) => closed,
        };
        if !inner.mark_dropped(&cancel).await {
            return;
        }
        if let Some(err) = close_error.filter(ClientError::is_auth) {
            inner.fail(&cancel, err).await;
            return;
        }
        tracing::warn!("[Hub] Connection dropped, reconnecting");

        let session = match inner.open_with_retry(&cancel, true).await {
            Ok(session) => session,
            Err(err) => {
                inner.fail(&cancel, err).await;
                return;
            }
        };
        if inner.activate(session.link, &cancel).await.is_err() {
            return;
        }
        events = session.events;
    }
}

async fn pump(
    inner: &Inner,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Option<ClientError> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(frame) => inner.notify(HubNotification::Frame(frame)),
            TransportEvent::Closed(error) => return error,
        }
    }
    None
}

/// Rejected credentials are terminal; hub clients often only report them
/// as a status code inside a transport message.
fn classify_open_error(err: ClientError) -> ClientError {
    match &err {
        ClientError::Transport { message, .. }
            if message.contains("401") || message.contains("403") =>
        {
            ClientError::AuthExpired(
                "Authentication failed for the event hub. Please sign in again.".to_string(),
            )
        }
        ClientError::Http { status, .. } if matches!(status, 401 | 403) => {
            ClientError::from_status(*status, "")
        }
        _ => err,
    }
}

struct ConnectFlag<'a>(&'a AtomicBool);

impl Drop for ConnectFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
