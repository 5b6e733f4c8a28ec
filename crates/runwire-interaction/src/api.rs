//! REST and streaming endpoints of the chat backend.

use crate::auth::{CredentialProvider, require_token};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use runwire_core::session::{ChatSummary, HistoryEntry};
use runwire_core::{ClientError, ClientSettings, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

/// Raw response body chunks of a streaming endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

const EVENT_STREAM: &str = "text/event-stream";

/// Body of `POST /api/chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub message: String,
    pub chat_id: String,
    pub model: String,
    pub image_urls: Vec<String>,
    #[serde(rename = "ModelKey", skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    #[serde(rename = "Provider", skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ChatStreamRequest {
    pub fn new(settings: &ClientSettings, chat_id: &str, message: &str) -> Self {
        Self {
            message: message.to_string(),
            chat_id: chat_id.to_string(),
            model: settings.default_model.clone(),
            image_urls: Vec::new(),
            model_key: settings.model_key.clone(),
            provider: settings.provider.clone(),
        }
    }

    pub fn with_image(mut self, image_url: Option<&str>) -> Self {
        self.image_urls = image_url.map(str::to_string).into_iter().collect();
        self
    }
}

/// Body of `GET /api/chat/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatHistory {
    pub chat_guid: Option<String>,
    pub title: Option<String>,
    pub messages: Vec<HistoryEntry>,
}

/// Authenticated client for the chat backend.
pub struct ChatApi {
    client: Client,
    settings: ClientSettings,
    credentials: Arc<dyn CredentialProvider>,
}

impl ChatApi {
    pub fn new(settings: ClientSettings, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_client(Client::new(), settings, credentials)
    }

    pub fn with_client(
        client: Client,
        settings: ClientSettings,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            settings,
            credentials,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let response = self
            .send(self.client.get(self.settings.endpoint("/api/chat/list")))
            .await?;
        Ok(response.json().await.map_err(decode_error)?)
    }

    /// Loads a chat with its messages. A 404 yields `None`.
    pub async fn fetch_history(&self, chat_id: &str) -> Result<Option<ChatHistory>> {
        let url = self.segment_url(&["api", "chat", chat_id])?;
        let request = self.authorize(self.client.get(url))?;
        let response = request.send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("[ChatApi] chat {} not found", chat_id);
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(response.json().await.map_err(decode_error)?))
    }

    /// Creates a chat and returns its id.
    pub async fn create_chat(&self, title: Option<&str>) -> Result<String> {
        let body = match title {
            Some(title) => json!({ "title": title }),
            None => json!({}),
        };
        let response = self
            .send(
                self.client
                    .post(self.settings.endpoint("/api/chat/create"))
                    .json(&body),
            )
            .await?;
        let value: Value = response.json().await.map_err(decode_error)?;

        ["chatGuid", "chatId", "id"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ClientError::internal("Backend did not return a chat id"))
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<()> {
        let url = self.segment_url(&["api", "chat", chat_id, "rename"])?;
        self.send(self.client.put(url).json(&json!({ "newTitle": title })))
            .await?;
        Ok(())
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let url = self.segment_url(&["api", "chat", chat_id])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    /// Starts a streamed chat completion and returns the raw body.
    pub async fn stream_chat(&self, request: &ChatStreamRequest) -> Result<ByteStream> {
        tracing::debug!(
            "[ChatApi] stream chat={} model={}",
            request.chat_id,
            request.model
        );
        let builder = self
            .client
            .post(self.settings.endpoint("/api/chat/stream"))
            .header(reqwest::header::ACCEPT, EVENT_STREAM)
            .json(request);
        Ok(body_stream(self.send(builder).await?))
    }

    /// Starts a streamed web search summary.
    pub async fn web_search(&self, query: &str, chat_id: &str) -> Result<ByteStream> {
        let builder = self
            .client
            .post(self.settings.endpoint("/api/chat/web-search"))
            .header(reqwest::header::ACCEPT, EVENT_STREAM)
            .json(&json!({ "query": query, "chatId": chat_id }));
        Ok(body_stream(self.send(builder).await?))
    }

    /// Asks the backend to run the agent on `chat_id`. The chat id doubles
    /// as the run id unless the backend names another.
    pub async fn start_agent(&self, chat_id: &str, prompt: &str) -> Result<String> {
        let url = self.segment_url(&["api", "agent", "chat", chat_id])?;
        let response = self
            .send(self.client.post(url).json(&json!({ "prompt": prompt })))
            .await?;

        let body = response.text().await.map_err(transport_error)?;
        let run_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value.get("runId").and_then(Value::as_str).map(str::to_string))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| chat_id.to_string());
        tracing::info!("[ChatApi] agent started, run {}", run_id);
        Ok(run_id)
    }

    /// Download URL for an artifact produced by an agent run.
    pub fn artifact_download_url(&self, file_name: &str) -> Result<String> {
        self.segment_url(&["api", "Files", file_name])
    }

    pub fn run_artifact_url(&self, run_id: &str, file_name: &str) -> Result<String> {
        self.segment_url(&["api", "runs", run_id, "files", file_name])
    }

    /// `api_base` plus `segments`, each percent-encoded as one path segment.
    fn segment_url(&self, segments: &[&str]) -> Result<String> {
        let mut url = Url::parse(self.settings.api_base.trim_end_matches('/'))
            .map_err(|e| ClientError::config(format!("Invalid api_base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::config("api_base cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = require_token(self.credentials.as_ref())?;
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorize(request)?
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await
    }
}

fn body_stream(response: Response) -> ByteStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(transport_error))
        .boxed()
}

/// Maps a non-success response to a `ClientError`, preferring the body's
/// `message` then `error` field over the raw text.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let details = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            ["message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or(body);
    tracing::warn!("[ChatApi] HTTP {}: {}", status.as_u16(), details);
    Err(ClientError::from_status(status.as_u16(), details))
}

fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_builder() {
        ClientError::fatal_transport(err.to_string())
    } else {
        ClientError::transport(err.to_string())
    }
}

fn decode_error(err: reqwest::Error) -> ClientError {
    ClientError::Serialization {
        format: "JSON".to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn api(base: &str) -> ChatApi {
        let settings = ClientSettings {
            api_base: base.to_string(),
            model_key: Some("gpt-4o".to_string()),
            ..ClientSettings::default()
        };
        ChatApi::new(settings, Arc::new(StaticToken::new(Some("t".into()))))
    }

    #[test]
    fn test_artifact_urls_are_encoded() {
        let api = api("http://host:5000/");
        assert_eq!(
            api.artifact_download_url("report final.pdf").unwrap(),
            "http://host:5000/api/Files/report%20final.pdf"
        );
        assert_eq!(
            api.run_artifact_url("r1", "a/b.txt").unwrap(),
            "http://host:5000/api/runs/r1/files/a%2Fb.txt"
        );
    }

    #[test]
    fn test_chat_ids_are_encoded_as_one_segment() {
        let api = api("http://host:5000");
        assert_eq!(
            api.segment_url(&["api", "chat", "a/b?c", "rename"]).unwrap(),
            "http://host:5000/api/chat/a%2Fb%3Fc/rename"
        );
        assert_eq!(
            api.segment_url(&["api", "chat", "c1"]).unwrap(),
            "http://host:5000/api/chat/c1"
        );
    }

    #[test]
    fn test_stream_request_shape() {
        let api = api("http://host");
        let request = ChatStreamRequest::new(api.settings(), "c1", "hi").with_image(Some("u"));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "message": "hi",
                "chatId": "c1",
                "model": "OpenAI",
                "imageUrls": ["u"],
                "ModelKey": "gpt-4o"
            })
        );
    }
}
