use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    net::TcpListener,
    sync::mpsc,
    time::{sleep, timeout},
};

use super::*;

const WAIT: Duration = Duration::from_secs(5);

struct MockTransport {
    incoming: Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>,
    closed: Arc<AtomicBool>,
    refuse: bool,
}

struct MockListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    fn new() -> (Self, mpsc::UnboundedSender<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            incoming: Mutex::new(Some(rx)),
            closed: Arc::new(AtomicBool::new(false)),
            refuse: false,
        };
        (transport, tx)
    }

    fn refusing() -> Self {
        Self {
            incoming: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            refuse: true,
        }
    }
}

#[async_trait]
impl TunnelTransport for MockTransport {
    type Listener = MockListener;

    async fn listen(&self, address: &str) -> TunnelResult<MockListener> {
        if self.refuse {
            return Err(TunnelError::Transport(format!("tcpip-forward for {address} denied")));
        }
        let incoming = self
            .incoming
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TunnelError::listen(address, "already listening"))?;
        Ok(MockListener {
            incoming,
            closed: Arc::clone(&self.closed),
        })
    }
}

#[async_trait]
impl TunnelListener for MockListener {
    type Stream = DuplexStream;

    fn bound_port(&self) -> u32 {
        9000
    }

    async fn accept(&mut self) -> TunnelResult<DuplexStream> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| TunnelError::Transport("tunnel closed".to_string()))
    }

    async fn close(self) -> TunnelResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn spawn_echo_service() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(addr)
}

async fn unused_local_address() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}

async fn eventually(check: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_remote_connections_to_local_target() -> anyhow::Result<()> {
    let target = spawn_echo_service().await?;
    let (transport, incoming) = MockTransport::new();
    let rule = ForwardingRule::start(&transport, "0.0.0.0:9000", &target.to_string()).await?;
    assert_eq!(rule.listen_address(), "0.0.0.0:9000");
    assert_eq!(rule.connect_address(), target.to_string());
    assert_eq!(rule.bound_port(), 9000);
    assert_eq!(rule.state(), RuleState::Accepting);

    let (mut remote, tunneled) = duplex(1024);
    incoming.send(tunneled)?;
    remote.write_all(b"hello").await?;
    let mut echoed = [0u8; 5];
    timeout(WAIT, remote.read_exact(&mut echoed)).await??;
    assert_eq!(&echoed, b"hello");
    assert_eq!(rule.accepted(), 1);
    assert_eq!(rule.active_connections(), 1);

    drop(remote);
    eventually(|| rule.active_connections() == 0).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_several_connections_concurrently() -> anyhow::Result<()> {
    let target = spawn_echo_service().await?;
    let (transport, incoming) = MockTransport::new();
    let rule = ForwardingRule::start(&transport, "0.0.0.0:9000", &target.to_string()).await?;

    let mut remotes = Vec::new();
    for _ in 0..3 {
        let (remote, tunneled) = duplex(1024);
        incoming.send(tunneled)?;
        remotes.push(remote);
    }
    for (i, remote) in remotes.iter_mut().enumerate() {
        let message = format!("conn-{i}");
        remote.write_all(message.as_bytes()).await?;
        let mut echoed = vec![0u8; message.len()];
        timeout(WAIT, remote.read_exact(&mut echoed)).await??;
        assert_eq!(echoed, message.as_bytes());
    }
    eventually(|| rule.active_connections() == 3).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_failure_drops_connection_and_keeps_accepting() -> anyhow::Result<()> {
    let unreachable = unused_local_address().await?;
    let (transport, incoming) = MockTransport::new();
    let rule = ForwardingRule::start(&transport, "0.0.0.0:9000", &unreachable.to_string()).await?;

    for attempt in 1..=2u64 {
        let (mut remote, tunneled) = duplex(1024);
        incoming.send(tunneled)?;
        let mut buf = [0u8; 8];
        let read = timeout(WAIT, remote.read(&mut buf)).await??;
        assert_eq!(read, 0);
        eventually(|| rule.dial_failures() == attempt).await;
    }

    assert_eq!(rule.accepted(), 2);
    assert_eq!(rule.state(), RuleState::Accepting);
    assert!(!transport.closed.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_failure_closes_listener_and_ends_rule() -> anyhow::Result<()> {
    let target = spawn_echo_service().await?;
    let (transport, incoming) = MockTransport::new();
    let rule = ForwardingRule::start(&transport, "0.0.0.0:9000", &target.to_string()).await?;

    drop(incoming);
    eventually(|| rule.state() == RuleState::ListenerClosed).await;
    assert!(transport.closed.load(Ordering::SeqCst));
    timeout(WAIT, rule.join()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_the_local_side_closes_the_tunneled_side() -> anyhow::Result<()> {
    let service = TcpListener::bind("127.0.0.1:0").await?;
    let target = service.local_addr()?;
    let (transport, incoming) = MockTransport::new();
    let rule = ForwardingRule::start(&transport, "0.0.0.0:9000", &target.to_string()).await?;

    let (mut remote, tunneled) = duplex(1024);
    incoming.send(tunneled)?;
    let (socket, _) = timeout(WAIT, service.accept()).await??;
    drop(socket);

    let mut buf = [0u8; 8];
    let read = timeout(WAIT, remote.read(&mut buf)).await??;
    assert_eq!(read, 0);
    eventually(|| rule.active_connections() == 0).await;
    Ok(())
}

#[tokio::test]
async fn refused_remote_bind_is_a_listen_error() {
    let transport = MockTransport::refusing();
    let err = match ForwardingRule::start(&transport, "0.0.0.0:22", "localhost:22").await {
        Ok(_) => panic!("bind should have been refused"),
        Err(err) => err,
    };
    match err {
        TunnelError::Listen { address, .. } => assert_eq!(address, "0.0.0.0:22"),
        other => panic!("unexpected error: {other:?}"),
    }
}
