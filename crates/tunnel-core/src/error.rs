use thiserror::Error;

/// Errors that can occur while establishing or running a tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Signing key could not be read, parsed or derived
    #[error("failed to load signing key from {identifier}: {reason}")]
    KeyLoad { identifier: String, reason: String },

    /// SSH protocol or transport error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Server rejected the offered public key
    #[error("authentication rejected by server for user {user}")]
    AuthRejected { user: String },

    /// Server presented a host key whose blueprint differs from the pinned one
    #[error("invalid key blueprint: {fingerprint}")]
    HostVerification { fingerprint: String },

    /// Remote listener could not be bound
    #[error("failed to listen on remote {address}: {reason}")]
    Listen { address: String, reason: String },

    /// Local target could not be reached for one forwarded connection
    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on a proxied connection
    #[error("relay failed: {0}")]
    Relay(#[source] std::io::Error),

    /// Address is not in host:port form
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The transport ended without a local close
    #[error("connection terminated: {0}")]
    Transport(String),
}

/// Result type alias for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

impl TunnelError {
    /// Create a key load error
    pub fn key_load(identifier: impl Into<String>, reason: impl ToString) -> Self {
        Self::KeyLoad {
            identifier: identifier.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a listen error
    pub fn listen(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Listen {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Host key that could not be wire-encoded during the handshake
    pub fn host_key_encoding(err: russh::keys::ssh_key::Error) -> Self {
        Self::Ssh(russh::keys::Error::from(err).into())
    }

    /// Create an invalid address error
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error was raised while the transport was being negotiated.
    ///
    /// Host key mismatches are reported like any other handshake failure,
    /// but still carry the observed blueprint.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Ssh(_) | Self::AuthRejected { .. } | Self::HostVerification { .. })
    }
}
