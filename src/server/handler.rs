//! Server-side connection handler: accept, frame, dispatch, reply.
//!
//! Per connection the handler runs exactly one read loop and one write
//! loop. Each decoded envelope is dispatched on its own task so a slow call
//! never stalls the read loop, and every reply funnels through the write
//! loop's queue — concurrent writers on one connection would corrupt
//! framing.
//!
//! ```text
//! Accepted ──► Framing (read loop) ──► Dispatching (task per envelope)
//!                                            │
//!                       Replying (single writer task) ◄──┘
//! ```
//!
//! Resolution and invocation failures never crash the handler; they travel
//! back as error envelopes carrying the request's correlation id. Only
//! stream-fatal wire errors tear the connection down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{decode_args, encode_value};
use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::filter::{run_pipeline, Terminal};
use crate::server::registry::{MethodHandler, ServiceRegistry};
use crate::wire::{encode_frame, FrameDecoder};

/// A running RPC server bound to a local address.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_handle: JoinHandle<()>,
}

impl RpcServer {
    /// Bind to `addr` and start accepting connections.
    pub async fn bind(addr: &str, registry: Arc<ServiceRegistry>) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tracing::info!(%local_addr, "server: listening");
        let accept_handle = tokio::spawn(accept_loop(listener, registry, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            accept_handle,
        })
    }

    /// The address this server is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to finish.
    ///
    /// In-flight dispatches on existing connections run to completion; new
    /// connections are refused.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.accept_handle).await;
        tracing::info!(local_addr = %self.local_addr, "server: stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!("server: accept loop shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!(%peer_addr, "server: connection accepted");
                        tokio::spawn(handle_connection(stream, peer_addr, registry.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "server: accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, registry: Arc<ServiceRegistry>) {
    let (read_half, write_half) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(write_loop(write_half, reply_rx, peer_addr));
    read_loop(read_half, peer_addr, registry, reply_tx).await;

    // Dropping the last reply sender ends the writer once its queue drains;
    // dispatch tasks still in flight hold clones and finish first.
    let _ = writer.await;
    tracing::debug!(%peer_addr, "server: connection closed");
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    peer_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];

    loop {
        let read = match read_half.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(%peer_addr, "server: peer closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "server: read failed");
                return;
            }
        };
        decoder.extend(&chunk[..read]);

        loop {
            match decoder.try_next() {
                Ok(Some(envelope)) => {
                    // Independent task per envelope: a slow handler must not
                    // block decoding of the frames behind it.
                    tokio::spawn(dispatch(envelope, registry.clone(), reply_tx.clone()));
                }
                Ok(None) => break,
                Err(e) if e.is_stream_fatal() => {
                    tracing::error!(%peer_addr, error = %e, "server: framing desync, closing");
                    return;
                }
                Err(e) => {
                    // One bad frame; the stream itself is still aligned.
                    tracing::warn!(%peer_addr, error = %e, "server: dropping malformed frame");
                }
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut reply_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer_addr: SocketAddr,
) {
    while let Some(frame) = reply_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::warn!(%peer_addr, error = %e, "server: write failed");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Terminal of the server pipeline: invoke the resolved method.
struct InvokeTerminal {
    handler: Arc<dyn MethodHandler>,
}

#[async_trait::async_trait]
impl Terminal for InvokeTerminal {
    async fn call(&self, envelope: Envelope) -> Result<Envelope, RpcError> {
        let args = decode_args(&envelope.payload)?;
        let result = self.handler.invoke(args).await?;
        let payload = encode_value(&result)?;
        Ok(Envelope::response(&envelope, payload))
    }
}

async fn dispatch(
    envelope: Envelope,
    registry: Arc<ServiceRegistry>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    tracing::debug!(
        id = %envelope.id,
        interface = %envelope.interface_name,
        method = %envelope.method_name,
        "server: dispatching"
    );

    let reply = match process_call(&envelope, &registry).await {
        Ok(reply) => reply,
        Err(e) => Envelope::error_response(&envelope, &e.to_string()),
    };

    match encode_frame(&reply) {
        Ok(frame) => {
            // The receiver only disappears when the connection is gone, in
            // which case there is nobody left to reply to.
            let _ = reply_tx.send(frame);
        }
        Err(e) => {
            tracing::error!(id = %reply.id, error = %e, "server: reply encode failed");
            if let Ok(frame) = encode_frame(&Envelope::error_response(&envelope, &e.to_string())) {
                let _ = reply_tx.send(frame);
            }
        }
    }
}

async fn process_call(
    envelope: &Envelope,
    registry: &ServiceRegistry,
) -> Result<Envelope, RpcError> {
    let resolved = registry.resolve(&envelope.interface_name, &envelope.method_name)?;
    let terminal = InvokeTerminal {
        handler: resolved.handler,
    };
    run_pipeline(&resolved.filters, &terminal, envelope.clone()).await
}
