//! Network side of the runwire client: bearer credentials, the push-hub
//! connection manager and the REST/streaming chat API.

pub mod api;
pub mod auth;
pub mod hub;

pub use api::{ByteStream, ChatApi, ChatHistory, ChatStreamRequest};
pub use auth::{CredentialProvider, StaticToken};
pub use hub::{ConnectionManager, ConnectionStatus, HubNotification};
