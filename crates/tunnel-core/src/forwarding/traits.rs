use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

type Result<T> = crate::TunnelResult<T>;

/// Trait for streams that can be relayed.
pub trait TunnelStreamIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Trait for transports that can bind listeners on the remote side.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    type Listener: TunnelListener;

    /// Ask the remote end to listen on `address` (`host:port`).
    async fn listen(&self, address: &str) -> Result<Self::Listener>;
}

/// Trait for remote listeners delivering tunneled connections.
#[async_trait]
pub trait TunnelListener: Send + 'static {
    type Stream: TunnelStreamIo;

    /// Port the remote end actually bound.
    fn bound_port(&self) -> u32;

    /// Wait for the next tunneled connection. An error is final.
    async fn accept(&mut self) -> Result<Self::Stream>;

    /// Stop listening on the remote end.
    async fn close(self) -> Result<()>;
}
