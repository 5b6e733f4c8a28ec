//! Push hub connectivity.
//!
//! # Module Structure
//!
//! - `transport`: the `HubTransport` / `HubLink` seam a concrete hub client implements
//! - `manager`: `ConnectionManager`, the single live connection with reconnect
//! - `backoff`: reconnect delay sequence
//! - `loopback`: in-process transport for tests and offline tooling

mod backoff;
mod loopback;
mod manager;
mod transport;

pub use backoff::{ExponentialBackoff, Jitter};
pub use loopback::{Invocation, LoopbackTransport};
pub use manager::{
    ConnectionManager, ConnectionStatus, HubNotification, METHOD_DENY, METHOD_GRANT, METHOD_JOIN,
    METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE,
};
pub use transport::{HubLink, HubSession, HubTransport, TransportEvent};
