//! ZeroMQ REQ-socket transport.
//!
//! The BCS server exposes a REP socket; we hold one REQ socket per endpoint.
//! REQ sockets enforce strict send/recv alternation, so a request whose reply
//! never arrived leaves the socket wedged. Any timeout or socket error drops
//! the socket, and the connection must be re-established before the next call.

use super::{Endpoint, Request, Response, Transport, TransportFactory};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, instrument, warn};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Transport over a ZeroMQ REQ socket.
#[derive(Default)]
pub struct ZmqTransport {
    endpoint: Option<Endpoint>,
    socket: Option<ReqSocket>,
}

impl ZmqTransport {
    /// Create an unconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint_label(&self) -> String {
        self.endpoint
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<unconnected>".to_string())
    }

    async fn exchange(socket: &mut ReqSocket, payload: Vec<u8>) -> zeromq::ZmqResult<ZmqMessage> {
        socket.send(ZmqMessage::from(payload)).await?;
        socket.recv().await
    }

    fn decode_reply(reply: &ZmqMessage, request: &Request) -> Result<Response> {
        let frame = reply.get(0).ok_or_else(|| BridgeError::InvalidResponse {
            target: request.to_string(),
            message: "empty reply".into(),
        })?;
        Response::decode(frame, &request.to_string())
    }
}

#[async_trait]
impl Transport for ZmqTransport {
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint), err)]
    async fn connect(&mut self, endpoint: &Endpoint, connect_timeout: Duration) -> Result<()> {
        self.disconnect().await;

        // Socket connect and probe share one budget.
        let deadline = Instant::now() + connect_timeout;
        let mut socket = ReqSocket::new();
        match timeout_at(deadline, socket.connect(&endpoint.zmq_address())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(endpoint.connection_error(format!("connect failed: {e}"))),
            Err(_) => {
                return Err(endpoint.connection_error(format!(
                    "connect did not complete within {connect_timeout:?}"
                )))
            }
        }

        // ZeroMQ connects lazily; only a reply proves the server is there.
        let probe = Request::test_connection();
        let payload = probe.encode()?;
        let reply = match timeout_at(deadline, Self::exchange(&mut socket, payload)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(endpoint.connection_error(format!("probe failed: {e}"))),
            Err(_) => {
                return Err(endpoint.connection_error(format!(
                    "server did not answer within {connect_timeout:?}"
                )))
            }
        };
        Self::decode_reply(&reply, &probe)
            .map_err(|e| endpoint.connection_error(format!("unexpected probe reply: {e}")))?;

        debug!("connected");
        self.endpoint = Some(endpoint.clone());
        self.socket = Some(socket);
        Ok(())
    }

    async fn call(&mut self, request: &Request, call_timeout: Duration) -> Result<Response> {
        let label = self.endpoint_label();
        let socket = self.socket.as_mut().ok_or_else(|| BridgeError::Connection {
            endpoint: label.clone(),
            message: "not connected".into(),
        })?;
        let payload = request.encode()?;

        match timeout(call_timeout, Self::exchange(socket, payload)).await {
            Ok(Ok(reply)) => Self::decode_reply(&reply, request),
            Ok(Err(e)) => {
                warn!(endpoint = %label, command = request.command(), error = %e, "socket error");
                self.disconnect().await;
                Err(BridgeError::Connection {
                    endpoint: label,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                warn!(endpoint = %label, command = request.command(), "reply timed out");
                self.disconnect().await;
                Err(BridgeError::Timeout {
                    context: request.to_string(),
                    waited: call_timeout,
                })
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            let errors = socket.close().await;
            if !errors.is_empty() {
                debug!(endpoint = %self.endpoint_label(), ?errors, "errors while closing socket");
            }
        }
    }
}

/// Factory producing [`ZmqTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZmqTransportFactory;

impl TransportFactory for ZmqTransportFactory {
    fn create(&self, _endpoint: &Endpoint) -> Box<dyn Transport> {
        Box::new(ZmqTransport::new())
    }
}
