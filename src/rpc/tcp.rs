//! JSON-over-TCP RPC transport.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.
//! Each channel holds one connection and serializes calls over it, which
//! matches the one-request-at-a-time shape of health polls and forwards.

use super::{Capability, RpcChannel, RpcConnector, RpcError, RpcRequest, RpcResponse, RpcService};
use crate::cluster::registry::ServerDescriptor;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Upper bound on a single RPC frame body.
const MAX_RPC_FRAME: u32 = 8 * 1024 * 1024;

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), RpcError> {
    let body = serde_json::to_vec(value).map_err(|e| RpcError::Decode(e.to_string()))?;
    if body.len() as u64 > MAX_RPC_FRAME as u64 {
        return Err(RpcError::Transport(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let len = (body.len() as u32).to_be_bytes();
    stream
        .write_all(&len)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))
}

async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T, RpcError> {
    let mut len = [0u8; 4];
    stream
        .read_exact(&mut len)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(len);
    if len > MAX_RPC_FRAME {
        return Err(RpcError::Transport(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| RpcError::Decode(e.to_string()))
}

/// One outbound connection to a peer's RPC endpoint.
pub struct TcpRpcChannel {
    stream: Mutex<TcpStream>,
}

impl TcpRpcChannel {
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl RpcChannel for TcpRpcChannel {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut stream, &request).await?;
        read_frame(&mut stream).await
    }
}

/// Opens TCP channels against `descriptor.rpc_addr()`. The capability only
/// keys the cache slot; every capability shares the one wire protocol.
pub struct TcpRpcConnector;

#[async_trait]
impl RpcConnector for TcpRpcConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        _capability: Capability,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        let channel = TcpRpcChannel::connect(&descriptor.rpc_addr()).await?;
        Ok(Arc::new(channel))
    }
}

/// Accept loop for a node's RPC endpoint. Each connection gets its own
/// task reading request frames until the peer hangs up or shutdown fires.
pub async fn serve(
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "rpc accept failed");
                        continue;
                    }
                };
                debug!(peer = %peer, "rpc connection accepted");
                let service = Arc::clone(&service);
                let shutdown = shutdown.clone();
                tokio::spawn(serve_connection(stream, service, shutdown));
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("rpc listener stopping");
                    return;
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    service: Arc<dyn RpcService>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request: RpcRequest = tokio::select! {
            read = read_frame(&mut stream) => match read {
                Ok(request) => request,
                Err(RpcError::Transport(_)) => return,
                Err(err) => {
                    warn!(error = %err, "dropping rpc connection");
                    return;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let response = service.handle(request).await;
        if let Err(err) = write_frame(&mut stream, &response).await {
            warn!(error = %err, "rpc reply failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::GetState { from } => RpcResponse::State(crate::rpc::StateReply {
                    id: from,
                    memory: 1024,
                    free: 512,
                    loadavg: vec![0.5, 0.4, 0.3],
                }),
                _ => RpcResponse::Ack { success: true },
            }
        }
    }

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::new(EchoService), shutdown_rx));

        let channel = TcpRpcChannel::connect(&addr.to_string()).await.unwrap();
        let response = channel
            .call(RpcRequest::GetState {
                from: "probe".into(),
            })
            .await
            .unwrap();
        match response {
            RpcResponse::State(state) => {
                assert_eq!(state.id, "probe");
                assert_eq!(state.loadavg.len(), 3);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let second = channel
            .call(RpcRequest::Broadcast {
                event: "tick".into(),
                message: "{}".into(),
            })
            .await
            .unwrap();
        assert_eq!(second, RpcResponse::Ack { success: true });

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
