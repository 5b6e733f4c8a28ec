//! The seam between the connection manager and a concrete push-hub client.
//!
//! The hub wire protocol lives behind these traits. An implementation opens
//! one authenticated link and delivers everything the server pushes, plus a
//! final `Closed` when the link goes away.

use async_trait::async_trait;
use runwire_core::Result;
use runwire_core::error::ClientError;
use runwire_core::event::HubFrame;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a live link reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(HubFrame),
    /// The link closed. `None` for a server-initiated clean close.
    Closed(Option<ClientError>),
}

/// An open link: the command side plus the stream of pushed events.
pub struct HubSession {
    pub link: Arc<dyn HubLink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Opens a link to `url` authenticated with `token`.
    ///
    /// Rejected credentials must be reported as `AuthExpired` so that the
    /// caller does not retry them.
    async fn open(&self, url: &str, token: &str) -> Result<HubSession>;
}

#[async_trait]
pub trait HubLink: Send + Sync {
    /// Invokes a hub method with positional arguments.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<()>;

    async fn close(&self);
}
