//! Connection pool keyed by endpoint.
//!
//! Devices on the same server share one `Connection`. The pool hands out
//! `Arc<Connection>` and keeps only weak references itself, so a connection
//! (and its socket) is torn down once the last device using it is dropped.
//! Asking for the endpoint again afterwards opens a fresh one.

use super::{Bridge, Connection};
use crate::error::Result;
use crate::transport::zmq::ZmqTransportFactory;
use crate::transport::{Endpoint, TransportFactory};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Endpoint-keyed registry of live connections.
pub struct ConnectionPool {
    bridge: Bridge,
    factory: Arc<dyn TransportFactory>,
    connect_timeout: Duration,
    connections: RwLock<HashMap<Endpoint, Weak<Connection>>>,
}

impl ConnectionPool {
    /// Pool that builds transports with `factory` and runs them on `bridge`.
    pub fn new(
        bridge: Bridge,
        factory: Arc<dyn TransportFactory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            bridge,
            factory,
            connect_timeout,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Pool of ZeroMQ connections on a freshly started bridge.
    pub fn with_zmq(connect_timeout: Duration) -> Result<Self> {
        Ok(Self::new(
            Bridge::start()?,
            Arc::new(ZmqTransportFactory),
            connect_timeout,
        ))
    }

    /// The bridge every pooled connection runs on.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Live connection for `endpoint`, if any device still holds one.
    pub fn get_existing(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.connections.read().get(endpoint).and_then(Weak::upgrade)
    }

    /// Live connection for `endpoint`, opening one if needed.
    ///
    /// Opening does not touch the network; the first call on the connection
    /// connects it.
    pub fn get_or_open(&self, endpoint: &Endpoint) -> Arc<Connection> {
        if let Some(connection) = self.get_existing(endpoint) {
            tracing::debug!(endpoint = %endpoint, "Reusing pooled connection");
            return connection;
        }

        let mut connections = self.connections.write();
        // Re-check under the write lock
        if let Some(connection) = connections.get(endpoint).and_then(Weak::upgrade) {
            return connection;
        }
        connections.retain(|_, weak| weak.strong_count() > 0);

        let connection = Arc::new(Connection::open(
            endpoint.clone(),
            self.factory.create(endpoint),
            self.bridge.clone(),
            self.connect_timeout,
        ));
        connections.insert(endpoint.clone(), Arc::downgrade(&connection));
        tracing::info!(endpoint = %endpoint, "Opened pooled connection");
        connection
    }

    /// Number of endpoints with a live connection.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.len())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBcsServer;

    fn pool(server: &MockBcsServer) -> ConnectionPool {
        ConnectionPool::new(
            Bridge::start().unwrap(),
            Arc::new(server.clone()),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn same_endpoint_shares_one_connection() {
        let server = MockBcsServer::new();
        let pool = pool(&server);
        let a = pool.get_or_open(&Endpoint::new("10.0.0.1", 5577));
        let b = pool.get_or_open(&Endpoint::new("10.0.0.1", 5577));
        let c = pool.get_or_open(&Endpoint::new("10.0.0.2", 5577));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn connection_released_with_last_holder() {
        let server = MockBcsServer::new();
        let pool = pool(&server);
        let endpoint = Endpoint::default();

        let first = pool.get_or_open(&endpoint);
        first.ensure_connected_blocking().unwrap();
        drop(first);
        assert!(pool.get_existing(&endpoint).is_none());
        assert!(pool.is_empty());

        let second = pool.get_or_open(&endpoint);
        second.ensure_connected_blocking().unwrap();
        assert_eq!(server.connect_attempts(), 2);
    }
}
