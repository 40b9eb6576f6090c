//! Delivery of server-initiated `forwarded-tcpip` channels to remote listeners.
//!
//! The SSH handler receives every forwarded channel for the connection. The
//! router hands each one to the listener registered for the bound address and
//! port. Closing the router drops every queue sender, which is how accept
//! loops learn that the transport is gone.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

type Result<T> = crate::TunnelResult<T>;

/// Identifier of one registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

struct Route<T> {
    id: RouteId,
    address: String,
    port: u32,
    sender: mpsc::UnboundedSender<T>,
}

struct RouterState<T> {
    closed: bool,
    next_id: u64,
    routes: Vec<Route<T>>,
}

/// Routing table from remote `(address, port)` bindings to listener queues.
pub struct ForwardRouter<T> {
    state: Mutex<RouterState<T>>,
}

impl<T> Default for ForwardRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ForwardRouter<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                closed: false,
                next_id: 0,
                routes: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener queue for a remote binding.
    pub fn register(&self, address: &str, port: u32) -> Result<(RouteId, mpsc::UnboundedReceiver<T>)> {
        let mut state = self.lock();
        if state.closed {
            return Err(crate::TunnelError::listen(
                format!("{address}:{port}"),
                "tunnel connection is closed",
            ));
        }
        let id = RouteId(state.next_id);
        state.next_id += 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.routes.push(Route {
            id,
            address: address.to_string(),
            port,
            sender,
        });
        Ok((id, receiver))
    }

    /// Record the port the server assigned for a binding requested on port 0.
    pub fn rebind(&self, id: RouteId, port: u32) {
        if let Some(route) = self.lock().routes.iter_mut().find(|route| route.id == id) {
            route.port = port;
        }
    }

    /// Remove a listener; its queue ends once drained.
    pub fn remove(&self, id: RouteId) {
        self.lock().routes.retain(|route| route.id != id);
    }

    /// Deliver an item to the listener bound at `(address, port)`.
    ///
    /// An exact address match wins; otherwise the first listener on the same
    /// port gets it, since servers may report the bound address differently
    /// from how it was requested. The item is handed back when no listener
    /// takes it.
    pub fn dispatch(&self, address: &str, port: u32, item: T) -> std::result::Result<(), T> {
        let state = self.lock();
        let route = state
            .routes
            .iter()
            .find(|route| route.port == port && route.address == address)
            .or_else(|| state.routes.iter().find(|route| route.port == port));
        match route {
            Some(route) => route.sender.send(item).map_err(|err| err.0),
            None => Err(item),
        }
    }

    /// Refuse new registrations and end every listener queue.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.routes.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
