//! Reverse SSH tunnels over one authenticated connection.
//!
//! [`run_tunnel`] loads the signing key, connects and pins the server
//! identity, binds one remote listener per [`Redirect`] and relays every
//! connection accepted there to its local target until the transport ends.

pub mod blueprint;
pub mod crypto;
pub mod error;
pub mod forwarding;
pub mod keys;
pub mod logging;
pub mod net;
pub mod session;

use std::{fmt, time::Duration};

use tracing::{info, warn};

pub use blueprint::{HostIdentityVerifier, key_blueprint};
pub use error::{TunnelError, TunnelResult};
pub use forwarding::{ForwardingRule, RuleState, StreamProxy};
pub use keys::{SigningKey, load_signing_key};
pub use session::{SessionOptions, SessionState, TunnelSession};

/// One remote listener and the local address its connections are relayed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    /// Remote `host:port` the server listens on.
    pub listen: String,
    /// Local `host:port` dialed for every accepted connection.
    pub connect: String,
}

impl Redirect {
    pub fn new(listen: impl Into<String>, connect: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            connect: connect.into(),
        }
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen, self.connect)
    }
}

#[derive(Clone)]
pub struct TunnelConfig {
    pub user: String,
    pub host: String,
    /// Key file path, or `@` followed by a passphrase.
    pub key: String,
    pub blueprint: Option<String>,
    pub show_blueprint: bool,
    pub redirects: Vec<Redirect>,
    pub keepalive_interval: Option<Duration>,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.key.len() > 1 && self.key.starts_with(keys::PASSPHRASE_MARKER) {
            "@<redacted>"
        } else {
            self.key.as_str()
        };
        f.debug_struct("TunnelConfig")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("key", &key)
            .field("blueprint", &self.blueprint)
            .field("show_blueprint", &self.show_blueprint)
            .field("redirects", &self.redirects)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

pub async fn run_tunnel(config: TunnelConfig) -> TunnelResult<()> {
    let key = load_signing_key(&config.key).await?;
    let options = SessionOptions {
        keepalive_interval: config.keepalive_interval,
        ..SessionOptions::default()
    };
    let session = TunnelSession::establish(&config.user, &config.host, &key, config.blueprint.clone(), &options).await?;

    if config.show_blueprint {
        println!("Remote server key blueprint is: {}", session.key_blueprint());
        session.close().await;
        return Ok(());
    }

    let rules = match start_rules(&session, &config.redirects).await {
        Ok(rules) => rules,
        Err(err) => {
            session.close().await;
            return Err(err);
        }
    };
    info!(rules = rules.len(), remote = session.remote_address(), "tunnel is up");

    let outcome = tokio::select! {
        outcome = session.wait() => outcome,
        () = interrupted(tokio::signal::ctrl_c()) => {
            info!("interrupted, closing tunnel");
            session.close().await;
            Ok(())
        }
    };
    for rule in rules {
        rule.join().await;
    }
    outcome
}

/// Resolves once `signal` reports an interrupt. A handler that could not be
/// installed never resolves, leaving the tunnel to the transport.
async fn interrupted(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(err) = signal.await {
        warn!(error = %err, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Bind every redirect on the session. The first refused bind aborts.
pub async fn start_rules(session: &TunnelSession, redirects: &[Redirect]) -> TunnelResult<Vec<ForwardingRule>> {
    let mut rules = Vec::with_capacity(redirects.len());
    for redirect in redirects {
        match ForwardingRule::start(session, &redirect.listen, &redirect.connect).await {
            Ok(rule) => rules.push(rule),
            Err(err) => {
                warn!(redirect = %redirect, error = %err, "unable to start forwarding");
                return Err(err);
            }
        }
    }
    Ok(rules)
}
