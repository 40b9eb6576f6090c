use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use tokio::{io::AsyncWriteExt, net::TcpStream, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    proxy::StreamProxy,
    traits::{TunnelListener, TunnelTransport},
};
use crate::error::{TunnelError, TunnelResult};

/// Lifecycle of a forwarding rule's accept loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleState {
    Accepting,
    ListenerClosed,
}

#[derive(Default)]
struct RuleCounters {
    accepted: AtomicU64,
    dial_failures: AtomicU64,
    active: AtomicUsize,
}

/// Held by a relay pair for as long as it runs.
struct ActiveConnection(Arc<RuleCounters>);

impl ActiveConnection {
    fn open(counters: &Arc<RuleCounters>) -> Self {
        counters.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One remote listener bound to one local target.
///
/// Every connection accepted on the remote side is relayed to a fresh local
/// connection to `connect_address`. The accept loop runs until the listener
/// fails, typically because the tunnel closed. Dropping the rule detaches the
/// loop without stopping it.
pub struct ForwardingRule {
    listen: String,
    connect: String,
    bound_port: u32,
    counters: Arc<RuleCounters>,
    task: JoinHandle<()>,
}

impl ForwardingRule {
    /// Bind `listen` on the remote side and start accepting.
    ///
    /// Fails with [`TunnelError::Listen`] when the remote bind is refused.
    pub async fn start<T>(transport: &T, listen: &str, connect: &str) -> TunnelResult<Self>
    where
        T: TunnelTransport + ?Sized,
    {
        let listener = transport.listen(listen).await.map_err(|err| match err {
            err @ TunnelError::Listen { .. } => err,
            other => TunnelError::listen(listen, other),
        })?;
        let bound_port = listener.bound_port();
        info!(listen, connect, bound_port, "remote forward listening");

        let counters = Arc::new(RuleCounters::default());
        let task = tokio::spawn(accept_loop(listener, listen.to_string(), connect.to_string(), Arc::clone(&counters)));
        Ok(Self {
            listen: listen.to_string(),
            connect: connect.to_string(),
            bound_port,
            counters,
            task,
        })
    }

    pub fn listen_address(&self) -> &str {
        &self.listen
    }

    pub fn connect_address(&self) -> &str {
        &self.connect
    }

    /// Port the server actually bound, which differs from the requested one for port 0.
    pub fn bound_port(&self) -> u32 {
        self.bound_port
    }

    pub fn state(&self) -> RuleState {
        if self.task.is_finished() {
            RuleState::ListenerClosed
        } else {
            RuleState::Accepting
        }
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    pub fn dial_failures(&self) -> u64 {
        self.counters.dial_failures.load(Ordering::SeqCst)
    }

    /// Relay pairs still running.
    pub fn active_connections(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Wait for the accept loop to end.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(listen = %self.listen, error = %err, "forwarding task failed");
        }
    }
}

async fn accept_loop<L: TunnelListener>(mut listener: L, listen: String, connect: String, counters: Arc<RuleCounters>) {
    loop {
        let mut inbound = match listener.accept().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(listen = %listen, error = %err, "remote listener stopped accepting");
                break;
            }
        };
        counters.accepted.fetch_add(1, Ordering::SeqCst);

        match TcpStream::connect(connect.as_str()).await {
            Ok(local) => {
                let _ = local.set_nodelay(true);
                debug!(listen = %listen, connect = %connect, "relaying forwarded connection");
                StreamProxy::relay_tracked(inbound, local, ActiveConnection::open(&counters));
            }
            Err(source) => {
                counters.dial_failures.fetch_add(1, Ordering::SeqCst);
                let err = TunnelError::Dial {
                    address: connect.clone(),
                    source,
                };
                warn!(listen = %listen, error = %err, "dropping forwarded connection");
                let _ = inbound.shutdown().await;
            }
        }
    }

    if let Err(err) = listener.close().await {
        debug!(listen = %listen, error = %err, "closing remote listener failed");
    }
    info!(listen = %listen, "remote forward closed");
}

#[cfg(test)]
#[path = "rule_tests.rs"]
mod tests;
