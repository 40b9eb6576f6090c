use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::traits::TunnelStreamIo;
use crate::error::TunnelError;

/// Size of the chunk each relay direction reads before writing it on.
pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Bytes moved by one relay pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Duplex relay between an accepted tunnel stream and a dialed local stream.
///
/// Each direction runs in its own task. Whichever direction stops first
/// (EOF, read error or write error) fires the pair's teardown token, so the
/// other direction stops at its next read or write. Both streams are closed
/// once both tasks have dropped their halves.
pub struct StreamProxy;

impl StreamProxy {
    pub fn relay<A, B>(a: A, b: B) -> ProxyHandle
    where
        A: TunnelStreamIo,
        B: TunnelStreamIo,
    {
        Self::relay_tracked(a, b, ())
    }

    /// Like [`relay`](Self::relay), holding `guard` until both directions are done.
    pub fn relay_tracked<A, B, G>(a: A, b: B, guard: G) -> ProxyHandle
    where
        A: TunnelStreamIo,
        B: TunnelStreamIo,
        G: Send + Sync + 'static,
    {
        let (a_read, a_write) = split(a);
        let (b_read, b_write) = split(b);
        let teardown = CancellationToken::new();
        let guard = Arc::new(guard);
        let forward = tokio::spawn(copy_direction(a_read, b_write, teardown.clone(), Arc::clone(&guard), "a->b"));
        let backward = tokio::spawn(copy_direction(b_read, a_write, teardown, guard, "b->a"));
        ProxyHandle { forward, backward }
    }
}

/// Handle on a running relay pair.
///
/// Dropping it detaches the pair; it keeps running until either side closes.
pub struct ProxyHandle {
    forward: JoinHandle<u64>,
    backward: JoinHandle<u64>,
}

impl ProxyHandle {
    pub fn is_finished(&self) -> bool {
        self.forward.is_finished() && self.backward.is_finished()
    }

    /// Wait for both directions to stop.
    pub async fn join(self) -> RelayStats {
        let a_to_b = self.forward.await.unwrap_or_default();
        let b_to_a = self.backward.await.unwrap_or_default();
        RelayStats { a_to_b, b_to_a }
    }
}

async fn copy_direction<R, W, G>(mut reader: R, mut writer: W, teardown: CancellationToken, _guard: Arc<G>, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    G: Send + Sync,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let outcome = loop {
        let read = tokio::select! {
            _ = teardown.cancelled() => break Ok(()),
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err),
        };
        let written = tokio::select! {
            _ = teardown.cancelled() => break Ok(()),
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(err) = written {
            break Err(err);
        }
        total += n as u64;
    };

    teardown.cancel();
    let _ = writer.shutdown().await;
    match outcome {
        Ok(()) => trace!(direction, bytes = total, "relay direction finished"),
        Err(err) => debug!(direction, bytes = total, error = %TunnelError::Relay(err), "relay direction failed"),
    }
    total
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
