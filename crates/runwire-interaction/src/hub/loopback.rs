//! In-process hub transport.
//!
//! `LoopbackTransport` records every invocation and lets the holder push
//! frames and drop links by hand. It backs the test suites and offline
//! tooling; it never touches the network.

use super::transport::{HubLink, HubSession, HubTransport, TransportEvent};
use async_trait::async_trait;
use runwire_core::error::ClientError;
use runwire_core::event::HubFrame;
use runwire_core::Result;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One recorded `invoke` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub method: String,
    pub args: Vec<Value>,
}

impl Invocation {
    /// `Method(arg1,arg2)` with string arguments unquoted.
    pub fn describe(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        format!("{}({})", self.method, args.join(","))
    }
}

#[derive(Default)]
struct Shared {
    invocations: Vec<Invocation>,
    opens: u32,
    scripted_failures: VecDeque<ClientError>,
    live: Option<mpsc::UnboundedSender<TransportEvent>>,
    tokens: Vec<String>,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `open` calls fail with the given errors, in order.
    pub fn fail_next_opens(&self, errors: impl IntoIterator<Item = ClientError>) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.scripted_failures.extend(errors);
        }
    }

    /// Pushes a frame on the current link. Returns `false` if no link is open.
    pub fn push(&self, frame: HubFrame) -> bool {
        self.send(TransportEvent::Frame(frame))
    }

    /// Drops the current link as the server would.
    pub fn drop_link(&self, error: Option<ClientError>) -> bool {
        let sent = self.send(TransportEvent::Closed(error));
        if let Ok(mut shared) = self.shared.lock() {
            shared.live = None;
        }
        sent
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.shared
            .lock()
            .map(|shared| shared.invocations.clone())
            .unwrap_or_default()
    }

    /// Invocations rendered with [`Invocation::describe`].
    pub fn calls(&self) -> Vec<String> {
        self.invocations().iter().map(Invocation::describe).collect()
    }

    pub fn clear_invocations(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.invocations.clear();
        }
    }

    /// Number of `open` calls, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.shared.lock().map(|shared| shared.opens).unwrap_or_default()
    }

    /// Tokens presented to `open`, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|shared| shared.tokens.clone())
            .unwrap_or_default()
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.shared
            .lock()
            .ok()
            .and_then(|shared| shared.live.clone())
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl HubTransport for LoopbackTransport {
    async fn open(&self, _url: &str, token: &str) -> Result<HubSession> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| ClientError::internal("loopback state poisoned"))?;
        shared.opens += 1;
        shared.tokens.push(token.to_string());
        if let Some(error) = shared.scripted_failures.pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        shared.live = Some(tx.clone());
        Ok(HubSession {
            link: Arc::new(LoopbackLink {
                shared: self.shared.clone(),
                events: tx,
            }),
            events: rx,
        })
    }
}

struct LoopbackLink {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl HubLink for LoopbackLink {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<()> {
        if self.events.is_closed() {
            return Err(ClientError::transport("link closed"));
        }
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| ClientError::internal("loopback state poisoned"))?;
        shared.invocations.push(Invocation {
            method: method.to_string(),
            args,
        });
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            if shared
                .live
                .as_ref()
                .is_some_and(|live| live.same_channel(&self.events))
            {
                shared.live = None;
            }
        }
    }
}
