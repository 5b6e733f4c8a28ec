//! Chat use cases: session CRUD, history loading and streamed turns.

use crate::SharedReducer;
use futures::StreamExt;
use runwire_core::reducer::{StreamTicket, TurnInput};
use runwire_core::session::{ChatSummary, Message, Session};
use runwire_core::stream::{SseDecoder, StreamDelta};
use runwire_core::{ClientError, Result};
use runwire_interaction::{ByteStream, ChatApi, ChatStreamRequest};
use std::sync::Arc;

const NEW_CHAT_TITLE: &str = "New Chat";

/// Drives the reducer from the chat REST and streaming endpoints.
///
/// A failing operation leaves the reducer as it was before the call: a
/// broken stream rolls the turn back, and CRUD calls touch local state only
/// after the backend confirmed them.
pub struct ChatService {
    api: Arc<ChatApi>,
    reducer: SharedReducer,
}

impl ChatService {
    pub fn new(api: Arc<ChatApi>, reducer: SharedReducer) -> Self {
        Self { api, reducer }
    }

    pub fn reducer(&self) -> SharedReducer {
        self.reducer.clone()
    }

    /// Lists the backend's chats and registers each as a session.
    pub async fn refresh_sessions(&self) -> Result<Vec<ChatSummary>> {
        let chats = self.api.list_chats().await?;
        let mut reducer = self.reducer.lock().await;
        for chat in &chats {
            reducer.create_session(&chat.chat_guid, chat.display_title());
        }
        tracing::info!("[ChatService] {} chat(s) listed", chats.len());
        Ok(chats)
    }

    /// Loads a chat's persisted messages into its session.
    pub async fn open_session(&self, chat_id: &str) -> Result<Session> {
        let history = self
            .api
            .fetch_history(chat_id)
            .await?
            .ok_or_else(|| ClientError::not_found("chat", chat_id))?;

        let mut reducer = self.reducer.lock().await;
        let title = history
            .title
            .filter(|t| !t.is_empty())
            .or_else(|| reducer.session(chat_id).map(|s| s.title.clone()))
            .unwrap_or_else(|| NEW_CHAT_TITLE.to_string());
        let session = reducer.load_history(chat_id, &title, history.messages)?;
        Ok(session.clone())
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<String> {
        let chat_id = self.api.create_chat(title).await?;
        self.reducer
            .lock()
            .await
            .create_session(&chat_id, title.unwrap_or(NEW_CHAT_TITLE));
        tracing::info!("[ChatService] Created chat {}", chat_id);
        Ok(chat_id)
    }

    pub async fn rename_session(&self, chat_id: &str, title: &str) -> Result<()> {
        self.api.rename_chat(chat_id, title).await?;
        let mut reducer = self.reducer.lock().await;
        if reducer.session(chat_id).is_none() {
            reducer.create_session(chat_id, title);
        }
        reducer.rename_session(chat_id, title)
    }

    pub async fn delete_session(&self, chat_id: &str) -> Result<()> {
        self.api.delete_chat(chat_id).await?;
        self.reducer.lock().await.remove_session(chat_id);
        Ok(())
    }

    /// Sends a message and streams the reply into the session.
    pub async fn send_message(&self, chat_id: &str, input: TurnInput) -> Result<Message> {
        self.send_message_with(chat_id, input, |_| {}).await
    }

    /// Like [`send_message`](Self::send_message), calling `on_delta` for every
    /// decoded delta as it arrives.
    pub async fn send_message_with<F>(
        &self,
        chat_id: &str,
        input: TurnInput,
        on_delta: F,
    ) -> Result<Message>
    where
        F: FnMut(&StreamDelta) + Send,
    {
        let request = ChatStreamRequest::new(self.api.settings(), chat_id, &input.content)
            .with_image(input.image_url.as_deref());
        let ticket = self.reducer.lock().await.begin_turn(chat_id, input)?;
        let turn = TurnGuard::new(self.reducer.clone(), ticket);
        tracing::debug!("[ChatService] Turn {} started", turn.ticket.message_id);

        let body = self.api.stream_chat(&request).await;
        self.complete_turn(turn, body, on_delta).await
    }

    /// Streams a web search summary into the session. The query is echoed
    /// as the user message; search results land in the reply's metadata.
    pub async fn web_search(&self, chat_id: &str, query: &str) -> Result<Message> {
        let ticket = self
            .reducer
            .lock()
            .await
            .begin_turn(chat_id, TurnInput::new(query))?;
        let turn = TurnGuard::new(self.reducer.clone(), ticket);
        let body = self.api.web_search(query, chat_id).await;
        self.complete_turn(turn, body, |_| {}).await
    }

    async fn complete_turn<F>(
        &self,
        mut turn: TurnGuard,
        body: Result<ByteStream>,
        mut on_delta: F,
    ) -> Result<Message>
    where
        F: FnMut(&StreamDelta) + Send,
    {
        let result = match body {
            Ok(body) => self.consume(&turn.ticket, body, &mut on_delta).await,
            Err(err) => Err(err),
        };

        let mut reducer = self.reducer.lock().await;
        turn.disarm();
        let ticket = &turn.ticket;
        match result {
            Ok(()) => {
                let message = reducer.finish_turn(ticket)?.clone();
                Ok(message)
            }
            Err(err) => {
                tracing::warn!("[ChatService] Turn {} failed: {}", ticket.message_id, err);
                reducer.fail_turn(ticket)?;
                Err(err)
            }
        }
    }

    async fn consume<F>(
        &self,
        ticket: &StreamTicket,
        mut body: ByteStream,
        on_delta: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&StreamDelta) + Send,
    {
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            let deltas = decoder.push_bytes(&chunk?);
            self.apply(ticket, deltas, on_delta).await;
            if decoder.is_done() {
                break;
            }
        }
        let tail = decoder.finish();
        self.apply(ticket, tail, on_delta).await;
        Ok(())
    }

    async fn apply<F>(&self, ticket: &StreamTicket, deltas: Vec<StreamDelta>, on_delta: &mut F)
    where
        F: FnMut(&StreamDelta) + Send,
    {
        if deltas.is_empty() {
            return;
        }
        let mut reducer = self.reducer.lock().await;
        for delta in deltas {
            on_delta(&delta);
            reducer.apply_delta(ticket, delta);
        }
    }
}

/// Rolls a turn back if the send future is dropped before it completes
/// (timeout, `select!`, task abort).
struct TurnGuard {
    reducer: SharedReducer,
    ticket: StreamTicket,
    armed: bool,
}

impl TurnGuard {
    fn new(reducer: SharedReducer, ticket: StreamTicket) -> Self {
        Self {
            reducer,
            ticket,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("[ChatService] Turn {} cancelled", self.ticket.message_id);

        if let Ok(mut reducer) = self.reducer.try_lock() {
            let _ = reducer.fail_turn(&self.ticket);
            return;
        }

        // The lock is busy, possibly held by the dropped future itself.
        let reducer = self.reducer.clone();
        let ticket = self.ticket.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = reducer.lock().await.fail_turn(&ticket);
                });
            }
            Err(_) => {
                tracing::error!("[ChatService] Turn {} left open: no runtime", ticket.message_id);
            }
        }
    }
}
