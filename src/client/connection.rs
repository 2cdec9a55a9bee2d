//! Client-side connection management and reply correlation.
//!
//! One persistent duplex connection per destination endpoint, reused across
//! calls and services. Arbitrarily many calls are in flight on one
//! connection at a time; multiplexing is done purely by envelope id against
//! the pending-call table, never by connection-per-call.
//!
//! Connection establishment is lazy and idempotent: the first caller to
//! find no live connection dials one under that endpoint's own lock, so
//! concurrent callers to the same endpoint wait for the in-progress connect
//! instead of dialing duplicates, while calls to other endpoints proceed
//! untouched. There is no automatic reconnect — a broken connection fails
//! every pending call on it, and the next call through the manager dials
//! afresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::filter::Terminal;
use crate::wire::{encode_frame, FrameDecoder};

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum time to wait for a correlated reply before failing the call.
    pub call_timeout: Duration,

    /// Maximum time to wait for a connection to be established.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

type PendingTable = Mutex<HashMap<String, oneshot::Sender<Result<Envelope, RpcError>>>>;

/// One live connection: outbound queue, pending-call table, closed flag.
struct Connection {
    endpoint: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    async fn open(endpoint: &str, config: &ClientConfig) -> Result<Arc<Self>, RpcError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                RpcError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", endpoint),
                ))
            })??;

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: Arc<PendingTable> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            pending.clone(),
            closed.clone(),
            endpoint.to_string(),
        ));
        tokio::spawn(read_loop(
            read_half,
            pending.clone(),
            closed.clone(),
            endpoint.to_string(),
        ));

        tracing::debug!(%endpoint, "client: connection established");
        Ok(Arc::new(Self {
            endpoint: endpoint.to_string(),
            outbound,
            pending,
            closed,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one envelope and await its correlated reply.
    async fn send(&self, envelope: Envelope, call_timeout: Duration) -> Result<Envelope, RpcError> {
        let id = envelope.id.clone();
        let frame = encode_frame(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(id.clone(), tx);

        if self.outbound.send(frame).is_err() {
            self.remove_pending(&id);
            return Err(RpcError::ConnectionClosed(self.endpoint.clone()));
        }

        match tokio::time::timeout(call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed(self.endpoint.clone())),
            Err(_) => {
                self.remove_pending(&id);
                tracing::warn!(%id, endpoint = %self.endpoint, "client: call timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    fn remove_pending(&self, id: &str) {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(id);
    }
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    endpoint: String,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::warn!(%endpoint, error = %e, "client: write failed");
            tear_down(&pending, &closed, &endpoint);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    endpoint: String,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];

    loop {
        let read = match read_half.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(%endpoint, "client: peer closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "client: read failed");
                break;
            }
        };
        decoder.extend(&chunk[..read]);

        loop {
            match decoder.try_next() {
                Ok(Some(reply)) => complete(&pending, reply),
                Ok(None) => break,
                Err(e) => {
                    // Any decode failure on the reply stream leaves us unable
                    // to trust subsequent correlation; fail everything.
                    tracing::error!(%endpoint, error = %e, "client: reply stream corrupt");
                    tear_down(&pending, &closed, &endpoint);
                    return;
                }
            }
        }
    }

    tear_down(&pending, &closed, &endpoint);
}

/// Resolve the waiting caller for one reply.
fn complete(pending: &PendingTable, reply: Envelope) {
    let waiter = pending
        .lock()
        .expect("pending table lock poisoned")
        .remove(&reply.id);
    match waiter {
        Some(tx) => {
            // The caller may have timed out between removal and send.
            let _ = tx.send(Ok(reply));
        }
        None => {
            tracing::warn!(id = %reply.id, "client: reply with no pending call, dropping");
        }
    }
}

/// Mark the connection dead and fail every pending call on it.
fn tear_down(pending: &PendingTable, closed: &AtomicBool, endpoint: &str) {
    closed.store(true, Ordering::Release);
    let drained: Vec<_> = pending
        .lock()
        .expect("pending table lock poisoned")
        .drain()
        .collect();
    if !drained.is_empty() {
        tracing::warn!(
            %endpoint,
            failed_calls = drained.len(),
            "client: connection lost, failing pending calls"
        );
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(RpcError::ConnectionClosed(endpoint.to_string())));
    }
}

/// Dial state for one endpoint.
///
/// The inner lock is held across the dial, which serializes connects to
/// this endpoint only.
#[derive(Default)]
struct Slot {
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

/// Owns one connection per destination endpoint and multiplexes calls.
///
/// Doubles as the client pipeline's [`Terminal`]: by the time an envelope
/// reaches it, some filter must have stamped the destination header.
pub struct ConnectionManager {
    config: ClientConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ConnectionManager {
    /// Create a manager with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Send an envelope to its stamped destination and await the reply.
    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, RpcError> {
        let endpoint = envelope
            .target()
            .ok_or_else(|| {
                RpcError::NoDestination(format!(
                    "{}.{}",
                    envelope.interface_name, envelope.method_name
                ))
            })?
            .to_string();

        let connection = self.connection_to(&endpoint).await?;
        connection.send(envelope, self.config.call_timeout).await
    }

    fn slot_for(&self, endpoint: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .expect("slot map lock poisoned")
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }

    /// Get the live connection for `endpoint`, dialing lazily if needed.
    ///
    /// Only this endpoint's slot is locked across the dial: concurrent
    /// callers to the same endpoint wait for the one in-progress connect
    /// instead of opening duplicates, and a slow or unreachable endpoint
    /// never delays calls bound elsewhere.
    async fn connection_to(&self, endpoint: &str) -> Result<Arc<Connection>, RpcError> {
        let slot = self.slot_for(endpoint);
        let mut guard = slot.connection.lock().await;

        if let Some(existing) = guard.as_ref() {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            tracing::debug!(%endpoint, "client: stale connection, redialing");
        }

        let fresh = Connection::open(endpoint, &self.config).await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }
}

#[async_trait::async_trait]
impl Terminal for ConnectionManager {
    async fn call(&self, envelope: Envelope) -> Result<Envelope, RpcError> {
        self.send(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::wire::encode_frame;
    use tokio::net::TcpListener;

    /// Echo server that answers every request, optionally delaying and
    /// reordering replies to exercise correlation.
    async fn spawn_reordering_echo(listener: TcpListener) {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut read_half, mut write_half) = stream.into_split();
            let mut decoder = FrameDecoder::new();
            let mut chunk = [0u8; 8192];
            let mut batch = Vec::new();

            // Collect three requests, then answer them in reverse order.
            while batch.len() < 3 {
                let n = read_half.read(&mut chunk).await.expect("read");
                decoder.extend(&chunk[..n]);
                while let Some(envelope) = decoder.try_next().expect("decode") {
                    batch.push(envelope);
                }
            }
            batch.reverse();
            for request in batch {
                let reply = Envelope::response(&request, request.payload.clone());
                write_half
                    .write_all(&encode_frame(&reply).expect("encode"))
                    .await
                    .expect("write");
            }
        });
    }

    fn request_to(endpoint: &str, payload: Vec<u8>) -> Envelope {
        let mut envelope = Envelope::request("Svc", "Echo", payload);
        envelope.set_target(endpoint);
        envelope
    }

    #[tokio::test]
    async fn test_out_of_order_replies_resolve_correct_callers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();
        spawn_reordering_echo(listener).await;

        let manager = Arc::new(ConnectionManager::new(ClientConfig::default()));
        let mut handles = Vec::new();
        for i in 0u8..3 {
            let manager = manager.clone();
            let endpoint = endpoint.clone();
            handles.push(tokio::spawn(async move {
                let reply = manager
                    .send(request_to(&endpoint, vec![i]))
                    .await
                    .expect("call");
                (i, reply.payload)
            }));
        }

        for handle in handles {
            let (i, payload) = handle.await.expect("join");
            // Each caller got its own payload back despite reversed replies.
            assert_eq!(payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_connection_reused_across_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();

        // Count accepted connections while echoing forever on the first.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut read_half, mut write_half) = stream.into_split();
            let mut decoder = FrameDecoder::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = read_half.read(&mut chunk).await.expect("read");
                if n == 0 {
                    return;
                }
                decoder.extend(&chunk[..n]);
                while let Some(envelope) = decoder.try_next().expect("decode") {
                    let reply = Envelope::response(&envelope, envelope.payload.clone());
                    write_half
                        .write_all(&encode_frame(&reply).expect("encode"))
                        .await
                        .expect("write");
                }
            }
        });

        let manager = ConnectionManager::new(ClientConfig::default());
        for i in 0u8..5 {
            let reply = manager
                .send(request_to(&endpoint, vec![i]))
                .await
                .expect("call");
            assert_eq!(reply.payload, vec![i]);
        }
        // A second accept would have hung the loop above; five calls on one
        // connection demonstrate reuse.
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            // Accept, read one frame, then drop the connection silently.
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut read_half, _write_half) = stream.into_split();
            let mut chunk = [0u8; 8192];
            let _ = read_half.read(&mut chunk).await;
        });

        let manager = ConnectionManager::new(ClientConfig::default());
        let err = manager
            .send(request_to(&endpoint, vec![1]))
            .await
            .expect_err("must fail");
        assert!(matches!(err, RpcError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_call_timeout_fails_instead_of_hanging() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();

        // Server that accepts but never replies (and keeps the socket open).
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let manager = ConnectionManager::new(ClientConfig {
            call_timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        });
        let err = manager
            .send(request_to(&endpoint, vec![1]))
            .await
            .expect_err("must time out");
        assert!(matches!(err, RpcError::Timeout));
        hold.abort();
    }

    #[tokio::test]
    async fn test_missing_destination_fails_before_network() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let err = manager
            .send(Envelope::request("Svc", "M", vec![]))
            .await
            .expect_err("must fail");
        assert!(matches!(err, RpcError::NoDestination(_)));
    }

    #[tokio::test]
    async fn test_pending_dial_does_not_stall_other_endpoints() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut read_half, mut write_half) = stream.into_split();
            let mut decoder = FrameDecoder::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = read_half.read(&mut chunk).await.expect("read");
                if n == 0 {
                    return;
                }
                decoder.extend(&chunk[..n]);
                while let Some(envelope) = decoder.try_next().expect("decode") {
                    let reply = Envelope::response(&envelope, envelope.payload.clone());
                    write_half
                        .write_all(&encode_frame(&reply).expect("encode"))
                        .await
                        .expect("write");
                }
            }
        });

        let manager = ConnectionManager::new(ClientConfig::default());

        // Pin another endpoint mid-dial by holding its slot lock.
        let stuck = manager.slot_for("10.255.255.1:9");
        let _dialing = stuck.connection.lock().await;

        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            manager.send(request_to(&endpoint, vec![7])),
        )
        .await
        .expect("call must not wait on another endpoint's dial")
        .expect("call");
        assert_eq!(reply.payload, vec![7]);
    }

    #[tokio::test]
    async fn test_reconnect_on_next_use_after_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            // First connection: read a frame, then drop it.
            let (stream, _) = listener.accept().await.expect("accept first");
            let (mut read_half, write_half) = stream.into_split();
            let mut chunk = [0u8; 8192];
            let _ = read_half.read(&mut chunk).await;
            drop(read_half);
            drop(write_half);

            // Second connection: behave properly.
            let (stream, _) = listener.accept().await.expect("accept second");
            let (mut read_half, mut write_half) = stream.into_split();
            let mut decoder = FrameDecoder::new();
            loop {
                let n = read_half.read(&mut chunk).await.expect("read");
                if n == 0 {
                    return;
                }
                decoder.extend(&chunk[..n]);
                while let Some(envelope) = decoder.try_next().expect("decode") {
                    let reply = Envelope::response(&envelope, b"recovered".to_vec());
                    write_half
                        .write_all(&encode_frame(&reply).expect("encode"))
                        .await
                        .expect("write");
                }
            }
        });

        let manager = ConnectionManager::new(ClientConfig::default());

        let err = manager
            .send(request_to(&endpoint, vec![1]))
            .await
            .expect_err("first call fails");
        assert!(matches!(err, RpcError::ConnectionClosed(_)));

        // No background reconnect happened; this call triggers the redial.
        let reply = manager
            .send(request_to(&endpoint, vec![2]))
            .await
            .expect("second call succeeds");
        assert_eq!(reply.payload, b"recovered".to_vec());
    }
}
