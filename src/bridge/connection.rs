//! One logical connection to one endpoint.
//!
//! A `Connection` owns its transport through an actor task running on the
//! bridge. Callers submit requests over a channel and the actor executes them
//! strictly one at a time, in arrival order, so a REQ socket never sees two
//! outstanding requests. Concurrent callers queue rather than fail.
//!
//! Each queued request carries a deadline fixed when it was submitted. A
//! request whose deadline passes while it waits in the queue fails with a
//! timeout without ever being sent, which leaves the link healthy.
//!
//! # Connection state
//!
//! ```text
//!  Unconnected ──ensure_connected──► Connecting ──ok──► Connected
//!       ▲                               │                  │
//!       │                              err             link fault
//!       │                               ▼                  ▼
//!       └───────────────────────────  Faulted ◄────────────┘
//! ```
//!
//! All callers that arrive while an attempt is in progress share that attempt
//! and observe the same result, so concurrent `ensure_connected` calls produce
//! exactly one attempt on the wire.

use super::Bridge;
use crate::error::{BridgeError, Result};
use crate::transport::{Endpoint, Request, Response, Transport};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

type ConnectAttempt = Shared<BoxFuture<'static, Result<()>>>;

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or a connection attempt is in progress.
    Unconnected,
    /// Last attempt succeeded and no request has faulted the link since.
    Connected,
    /// A connection attempt failed, or a sent request timed out or hit a
    /// socket error. The next `ensure_connected` reconnects.
    Faulted,
}

enum LinkState {
    Unconnected,
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
    Connected,
    Faulted,
}

/// A request waiting for its turn on the transport.
struct PendingRequest {
    request: Request,
    deadline: Instant,
    reply: oneshot::Sender<Result<Response>>,
}

enum Envelope {
    Connect {
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Call(PendingRequest),
}

/// Shared handle to one endpoint's transport.
pub struct Connection {
    endpoint: Endpoint,
    bridge: Bridge,
    connect_timeout: Duration,
    requests: mpsc::UnboundedSender<Envelope>,
    link: Arc<Mutex<LinkState>>,
    generations: AtomicU64,
}

impl Connection {
    /// Create a connection and start its actor on the bridge. Nothing is sent
    /// until the first `ensure_connected` or `call`.
    pub fn open(
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        bridge: Bridge,
        connect_timeout: Duration,
    ) -> Self {
        let (requests, inbox) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(LinkState::Unconnected));

        bridge.spawn(run_actor(
            endpoint.clone(),
            transport,
            inbox,
            Arc::clone(&link),
        ));

        Self {
            endpoint,
            bridge,
            connect_timeout,
            requests,
            link,
            generations: AtomicU64::new(0),
        }
    }

    /// Endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Bridge the connection's actor runs on.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        match &*self.link.lock() {
            LinkState::Unconnected | LinkState::Connecting { .. } => ConnectionState::Unconnected,
            LinkState::Connected => ConnectionState::Connected,
            LinkState::Faulted => ConnectionState::Faulted,
        }
    }

    /// Connect if not already connected.
    ///
    /// Idempotent: returns immediately when connected, and joins the attempt
    /// already in flight when one exists.
    pub async fn ensure_connected(&self) -> Result<()> {
        let (generation, attempt) = {
            let mut link = self.link.lock();
            match &*link {
                LinkState::Connected => return Ok(()),
                LinkState::Connecting {
                    generation,
                    attempt,
                } => (*generation, attempt.clone()),
                LinkState::Unconnected | LinkState::Faulted => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let attempt = self.start_attempt();
                    *link = LinkState::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    (generation, attempt)
                }
            }
        };

        let result = attempt.await;

        let mut link = self.link.lock();
        if matches!(&*link, LinkState::Connecting { generation: g, .. } if *g == generation) {
            *link = if result.is_ok() {
                LinkState::Connected
            } else {
                LinkState::Faulted
            };
        }
        result
    }

    fn start_attempt(&self) -> ConnectAttempt {
        let requests = self.requests.clone();
        let endpoint = self.endpoint.clone();
        let timeout = self.connect_timeout;
        async move {
            let (reply, response) = oneshot::channel();
            requests
                .send(Envelope::Connect { timeout, reply })
                .map_err(|_| endpoint.connection_error("connection actor stopped"))?;
            response
                .await
                .map_err(|_| endpoint.connection_error("connection actor stopped"))?
        }
        .boxed()
        .shared()
    }

    /// Issue one request and wait for its reply.
    ///
    /// Connects first if needed. The `timeout` covers both queueing and the
    /// round trip.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.ensure_connected().await?;

        let (reply, response) = oneshot::channel();
        let pending = PendingRequest {
            request,
            deadline: Instant::now() + timeout,
            reply,
        };
        self.requests
            .send(Envelope::Call(pending))
            .map_err(|_| self.endpoint.connection_error("connection actor stopped"))?;
        response
            .await
            .map_err(|_| self.endpoint.connection_error("connection actor stopped"))?
    }

    /// Blocking form of [`call`](Connection::call) for threads outside any
    /// async runtime.
    pub fn call_blocking(
        self: &Arc<Self>,
        request: Request,
        timeout: Duration,
    ) -> Result<Response> {
        let connection = Arc::clone(self);
        self.bridge
            .block_on(async move { connection.call(request, timeout).await })
    }

    /// Blocking form of [`ensure_connected`](Connection::ensure_connected).
    pub fn ensure_connected_blocking(self: &Arc<Self>) -> Result<()> {
        let connection = Arc::clone(self);
        self.bridge
            .block_on(async move { connection.ensure_connected().await })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Serves queued requests until every `Connection` handle is gone.
#[instrument(name = "connection", skip_all, fields(endpoint = %endpoint))]
async fn run_actor(
    endpoint: Endpoint,
    mut transport: Box<dyn Transport>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    link: Arc<Mutex<LinkState>>,
) {
    let mut connected = false;

    while let Some(envelope) = inbox.recv().await {
        match envelope {
            Envelope::Connect { timeout, reply } => {
                let result = if connected {
                    Ok(())
                } else {
                    transport.connect(&endpoint, timeout).await
                };
                match &result {
                    Ok(()) if !connected => info!("connected"),
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "connection attempt failed"),
                }
                connected = result.is_ok();
                let _ = reply.send(result);
            }
            Envelope::Call(pending) => {
                let PendingRequest {
                    request,
                    deadline,
                    reply,
                } = pending;

                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = if remaining.is_zero() {
                    debug!(request = %request, "deadline passed while queued");
                    Err(BridgeError::Timeout {
                        context: request.to_string(),
                        waited: Duration::ZERO,
                    })
                } else if !connected {
                    Err(endpoint.connection_error("link is faulted; reconnect required"))
                } else {
                    let result = transport.call(&request, remaining).await;
                    if let Err(e) = &result {
                        if e.is_link_fault() {
                            warn!(request = %request, error = %e, "link faulted");
                            transport.disconnect().await;
                            connected = false;
                            let mut state = link.lock();
                            if matches!(*state, LinkState::Connected) {
                                *state = LinkState::Faulted;
                            }
                        }
                    }
                    result
                };
                let _ = reply.send(result);
            }
        }
    }

    transport.disconnect().await;
    debug!("connection closed");
}
