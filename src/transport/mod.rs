//! Request/reply transport to the BCS server.
//!
//! A [`Transport`] owns exactly one socket to one [`Endpoint`]. It sends a
//! single [`Request`], waits for the matching [`Response`] within a caller
//! supplied timeout, and reports one of three results: a decoded reply, a
//! [`BridgeError::Timeout`](crate::BridgeError::Timeout), or a
//! [`BridgeError::Connection`](crate::BridgeError::Connection).
//!
//! Transports never interpret reply fields. Deciding whether `success=false`
//! or a `not_found` entry is an error is left to the device layer.
//!
//! `call` takes `&mut self`, so a transport can never have two requests in
//! flight. Sharing a transport between callers is the job of
//! [`Connection`](crate::bridge::Connection), which queues requests in front
//! of it.

pub mod message;
pub mod mock;
pub mod zmq;

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use message::{commands, Request, Response};

/// Default BCS server port.
pub const DEFAULT_PORT: u16 = 5577;

/// Default BCS server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Network address of a BCS server. Connections are pooled per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// ZeroMQ address string, e.g. `tcp://127.0.0.1:5577`.
    pub fn zmq_address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub(crate) fn connection_error(&self, message: impl Into<String>) -> BridgeError {
        BridgeError::Connection {
            endpoint: self.to_string(),
            message: message.into(),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = BridgeError;

    /// Parses `host`, `host:port` or `tcp://host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches("tcp://");
        if trimmed.is_empty() {
            return Err(BridgeError::Configuration("empty endpoint".into()));
        }
        match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    BridgeError::Configuration(format!("invalid port in endpoint '{s}': {e}"))
                })?;
                if host.is_empty() {
                    return Err(BridgeError::Configuration(format!(
                        "missing host in endpoint '{s}'"
                    )));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(trimmed, DEFAULT_PORT)),
        }
    }
}

/// One request/reply socket to one server.
#[async_trait]
pub trait Transport: Send {
    /// Open the socket and verify the server answers within `timeout`.
    ///
    /// Calling `connect` on an already connected transport re-opens it.
    async fn connect(&mut self, endpoint: &Endpoint, timeout: Duration) -> Result<()>;

    /// Send one request and wait up to `timeout` for its reply.
    ///
    /// A `Timeout` or `Connection` error leaves the transport unusable until
    /// the next successful [`connect`](Transport::connect).
    async fn call(&mut self, request: &Request, timeout: Duration) -> Result<Response>;

    /// Close the socket. Idempotent.
    async fn disconnect(&mut self);
}

/// Creates a fresh transport for an endpoint.
///
/// The pool calls this once per endpoint; swapping the factory is how tests
/// substitute the simulated server for the ZeroMQ socket.
pub trait TransportFactory: Send + Sync {
    /// Build an unconnected transport for `endpoint`.
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let ep: Endpoint = "tcp://10.0.0.5:6000".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.5", 6000));
        assert_eq!(ep.zmq_address(), "tcp://10.0.0.5:6000");

        let ep: Endpoint = "bl7-labview".parse().unwrap();
        assert_eq!(ep.port, DEFAULT_PORT);
        assert_eq!(ep.to_string(), "bl7-labview:5577");

        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!(":5577".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_default_matches_server_default() {
        assert_eq!(Endpoint::default().to_string(), "127.0.0.1:5577");
    }
}
