//! Remote port forwarding over one shared SSH transport.
//!
//! This module provides:
//! - [`ForwardingRule`]: one remote listener and its accept loop
//! - [`StreamProxy`]: the duplex relay for one forwarded connection
//! - the [`TunnelTransport`] / [`TunnelListener`] seams the rules run against
//!
//! Rules never own the transport. When it goes away every listener queue is
//! closed, the accept loops end and the open relays hit EOF.

mod proxy;
pub(crate) mod router;
mod rule;
mod traits;

pub use proxy::{ProxyHandle, RELAY_BUFFER_SIZE, RelayStats, StreamProxy};
pub use router::{ForwardRouter, RouteId};
pub use rule::{ForwardingRule, RuleState};
pub use traits::{TunnelListener, TunnelStreamIo, TunnelTransport};
