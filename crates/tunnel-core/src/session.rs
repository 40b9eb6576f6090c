//! Authenticated SSH connection to the tunnel server.
//!
//! A [`TunnelSession`] owns one transport. It pins the server identity during
//! the handshake, authenticates with a single public key and then acts as the
//! [`TunnelTransport`] every forwarding rule binds its remote listener on.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::{
    Channel, ChannelStream, Disconnect,
    client::{self, DisconnectReason, Handle, Msg, Session},
    keys::{PrivateKeyWithHashAlg, PublicKey},
};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    blueprint::HostIdentityVerifier,
    crypto::{auth_hash_for, single_host_key_preferred},
    error::{TunnelError, TunnelResult},
    forwarding::{ForwardRouter, RouteId, TunnelListener, TunnelTransport},
    keys::SigningKey,
    net::{normalize_host, split_host_port},
};

type ForwardedChannel = Channel<Msg>;
type SharedHandle = Arc<Mutex<Handle<TunnelHandler>>>;

/// Default interval between keepalive probes.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Missed keepalive replies tolerated before the transport is dropped.
pub const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Lifecycle of a tunnel session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Authenticating,
    Active,
    Closed,
    Error,
}

/// Transport tuning for a session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// `None` disables keepalive probes.
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum EndCause {
    Local,
    Remote(String),
}

/// First recorded reason the transport ended.
#[derive(Clone)]
struct SessionEnd {
    cause: Arc<watch::Sender<Option<EndCause>>>,
}

impl SessionEnd {
    fn new() -> Self {
        let (cause, _) = watch::channel(None);
        Self { cause: Arc::new(cause) }
    }

    /// Returns false when a cause was already recorded.
    fn record(&self, cause: EndCause) -> bool {
        self.cause.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause);
            true
        })
    }

    fn current(&self) -> Option<EndCause> {
        self.cause.borrow().clone()
    }

    async fn wait(&self) -> EndCause {
        let mut rx = self.cause.subscribe();
        let observed = match rx.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone(),
            Err(_) => None,
        };
        observed.unwrap_or_else(|| EndCause::Remote("connection closed".to_string()))
    }
}

/// russh callbacks for the tunnel transport.
pub struct TunnelHandler {
    verifier: HostIdentityVerifier,
    router: Arc<ForwardRouter<ForwardedChannel>>,
    end: SessionEnd,
}

impl client::Handler for TunnelHandler {
    type Error = TunnelError;

    fn check_server_key(&mut self, server_public_key: &PublicKey) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let verdict = self.verifier.verify(server_public_key).map(|_| true);
        async move { verdict }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        debug!(
            address = connected_address,
            port = connected_port,
            originator = %format!("{originator_address}:{originator_port}"),
            "forwarded connection opened by server"
        );
        let unrouted = self.router.dispatch(connected_address, connected_port, channel).err();
        if unrouted.is_some() {
            warn!(address = connected_address, port = connected_port, "no listener for forwarded connection");
        }
        async move {
            if let Some(channel) = unrouted {
                let _ = channel.close().await;
            }
            Ok(())
        }
    }

    fn disconnected(&mut self, reason: DisconnectReason<Self::Error>) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let cause = match reason {
            DisconnectReason::Error(err) => err.to_string(),
            _ => "server closed the connection".to_string(),
        };
        if self.end.record(EndCause::Remote(cause.clone())) {
            warn!(%cause, "tunnel connection lost");
        }
        self.router.close();
        async { Ok(()) }
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        self.router.close();
        self.end.record(EndCause::Remote("connection closed".to_string()));
    }
}

/// One authenticated connection to the tunnel server.
///
/// Clones share the transport. [`close`](Self::close) ends it for all of them.
#[derive(Clone)]
pub struct TunnelSession {
    handle: SharedHandle,
    router: Arc<ForwardRouter<ForwardedChannel>>,
    end: SessionEnd,
    blueprint: String,
    remote: String,
}

impl TunnelSession {
    /// Connect to `host`, verify its identity and authenticate as `user`.
    ///
    /// `host` defaults to port 22. With `pinned` set the server key must match
    /// that blueprint; without it the first key seen is trusted and reported
    /// by [`key_blueprint`](Self::key_blueprint).
    pub async fn establish(
        user: &str,
        host: &str,
        key: &SigningKey,
        pinned: Option<String>,
        options: &SessionOptions,
    ) -> TunnelResult<Self> {
        let remote = normalize_host(host);
        let algorithm = key.algorithm();
        let verifier = HostIdentityVerifier::new(pinned);
        let router = Arc::new(ForwardRouter::new());
        let end = SessionEnd::new();
        let handler = TunnelHandler {
            verifier: verifier.clone(),
            router: Arc::clone(&router),
            end: end.clone(),
        };
        let config = client::Config {
            preferred: single_host_key_preferred(&algorithm),
            nodelay: true,
            keepalive_interval: options.keepalive_interval,
            keepalive_max: options.keepalive_max,
            inactivity_timeout: None,
            ..Default::default()
        };

        debug!(remote = %remote, state = ?SessionState::Created, "connecting to tunnel server");
        let mut handle = client::connect(Arc::new(config), remote.as_str(), handler).await?;

        debug!(remote = %remote, user, state = ?SessionState::Authenticating, "authenticating");
        let credentials = PrivateKeyWithHashAlg::new(key.shared(), auth_hash_for(&algorithm));
        let auth = handle.authenticate_publickey(user, credentials).await?;
        if !auth.success() {
            end.record(EndCause::Local);
            let _ = handle.disconnect(Disconnect::ByApplication, "", "English").await;
            return Err(TunnelError::AuthRejected { user: user.to_string() });
        }

        let blueprint = verifier
            .pinned()
            .map(str::to_string)
            .ok_or_else(|| TunnelError::Transport("server host key was never verified".to_string()))?;
        info!(remote = %remote, user, blueprint = %blueprint, state = ?SessionState::Active, "tunnel connection established");

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            router,
            end,
            blueprint,
            remote,
        })
    }

    /// Blueprint of the host key the server presented.
    pub fn key_blueprint(&self) -> &str {
        &self.blueprint
    }

    /// Server address as dialed, with the port filled in.
    pub fn remote_address(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        match self.end.current() {
            None => SessionState::Active,
            Some(EndCause::Local) => SessionState::Closed,
            Some(EndCause::Remote(_)) => SessionState::Error,
        }
    }

    /// Tear the transport down.
    ///
    /// Every remote listener stops accepting and every relayed connection
    /// sees EOF. Calling it again, or after the server went away, does nothing.
    pub async fn close(&self) {
        if !self.end.record(EndCause::Local) {
            return;
        }
        info!(remote = %self.remote, "closing tunnel connection");
        self.router.close();
        let handle = self.handle.lock().await;
        if let Err(err) = handle.disconnect(Disconnect::ByApplication, "", "English").await {
            debug!(remote = %self.remote, error = %err, "disconnect failed");
        }
    }

    /// Wait until the transport ends.
    ///
    /// Returns `Ok` after a local [`close`](Self::close) and
    /// [`TunnelError::Transport`] when the connection was lost.
    pub async fn wait(&self) -> TunnelResult<()> {
        match self.end.wait().await {
            EndCause::Local => Ok(()),
            EndCause::Remote(cause) => Err(TunnelError::Transport(cause)),
        }
    }
}

#[async_trait]
impl TunnelTransport for TunnelSession {
    type Listener = RemoteListener;

    async fn listen(&self, address: &str) -> TunnelResult<RemoteListener> {
        let (host, port) = split_host_port(address)?;
        let requested = u32::from(port);
        let (route, incoming) = self.router.register(&host, requested)?;

        let assigned = {
            let mut handle = self.handle.lock().await;
            handle.tcpip_forward(host.clone(), requested).await
        };
        let bound_port = match assigned {
            Ok(0) => requested,
            Ok(assigned) => assigned,
            Err(err) => {
                self.router.remove(route);
                return Err(TunnelError::listen(address, err));
            }
        };
        if bound_port != requested {
            self.router.rebind(route, bound_port);
        }
        debug!(address, bound_port, "remote listener bound");

        Ok(RemoteListener {
            handle: Arc::clone(&self.handle),
            router: Arc::clone(&self.router),
            route,
            incoming,
            host,
            bound_port,
        })
    }
}

/// Remote listener bound through a `tcpip-forward` request.
pub struct RemoteListener {
    handle: SharedHandle,
    router: Arc<ForwardRouter<ForwardedChannel>>,
    route: RouteId,
    incoming: mpsc::UnboundedReceiver<ForwardedChannel>,
    host: String,
    bound_port: u32,
}

#[async_trait]
impl TunnelListener for RemoteListener {
    type Stream = ChannelStream<Msg>;

    fn bound_port(&self) -> u32 {
        self.bound_port
    }

    async fn accept(&mut self) -> TunnelResult<ChannelStream<Msg>> {
        match self.incoming.recv().await {
            Some(channel) => Ok(channel.into_stream()),
            None => Err(TunnelError::Transport("tunnel connection closed".to_string())),
        }
    }

    async fn close(self) -> TunnelResult<()> {
        self.router.remove(self.route);
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return Ok(());
        }
        handle.cancel_tcpip_forward(self.host.clone(), self.bound_port).await?;
        Ok(())
    }
}

impl Drop for RemoteListener {
    fn drop(&mut self) {
        self.router.remove(self.route);
    }
}
