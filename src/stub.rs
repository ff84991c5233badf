use crate::codec::{self, Meta};
use crate::connection::Connection;
use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Ahead-of-time rendition of one schema method. Methods declaring a void
/// response are fire-and-forget notifications, everything else is a
/// request expecting exactly one correlated response.
#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    pub service_method: &'static str,
    pub requires_response: bool,
}

impl MethodDescriptor {
    pub const fn unary(service_method: &'static str) -> Self {
        MethodDescriptor {
            service_method,
            requires_response: true,
        }
    }

    pub const fn notification(service_method: &'static str) -> Self {
        MethodDescriptor {
            service_method,
            requires_response: false,
        }
    }
}

/// Hands out connections for stub calls that don't name one explicitly.
/// A pool can balance over a set of backends, pick by consistent hash, or
/// just return a single long-lived connection.
pub trait ConnectionPool: Send + Sync {
    fn get_connection(&self) -> Option<Arc<Connection>>;
}

/// Generic RPC call site: binds a schema method to a send-and-await
/// operation over a chosen connection.
pub struct ServiceStub {
    conn: Option<Arc<Connection>>,
    pool: Option<Arc<dyn ConnectionPool>>,
    timeout: Duration,
}

impl ServiceStub {
    pub fn new(conn: Arc<Connection>) -> Self {
        let timeout = conn.rpc_timeout();
        ServiceStub {
            conn: Some(conn),
            pool: None,
            timeout,
        }
    }

    pub fn with_pool(pool: Arc<dyn ConnectionPool>, timeout: Duration) -> Self {
        ServiceStub {
            conn: None,
            pool: Some(pool),
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    // Explicit argument first, then the stub default, then the pool.
    fn pick_connection(&self, explicit: Option<&Arc<Connection>>) -> Result<Arc<Connection>, Error> {
        explicit
            .cloned()
            .or_else(|| self.conn.clone())
            .or_else(|| self.pool.as_ref().and_then(|pool| pool.get_connection()))
            .ok_or(Error::NoConnection)
    }

    /// Issues a unary RPC and awaits its response.
    ///
    /// The transmission id is allocated and its result slot registered
    /// before the frame hits the send queue, so the response can never
    /// outrun its slot. On timeout the slot is removed and a late response
    /// is dropped silently.
    pub async fn call<Req, Resp>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        conn: Option<&Arc<Connection>>,
        call_timeout: Option<Duration>,
    ) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        debug_assert!(method.requires_response);
        let conn = self.pick_connection(conn)?;
        let content = codec::encode_payload(conn.parser(), request)?;

        let transmission_id = conn.next_transmission_id();
        let slot = conn.register_transmission(transmission_id);
        let meta = Meta::request(method.service_method, transmission_id);
        if let Err(err) = conn.send_packet(meta, &content) {
            conn.remove_transmission(transmission_id);
            return Err(err);
        }

        let deadline = call_timeout.unwrap_or(self.timeout);
        match timeout(deadline, slot).await {
            Ok(Ok(Ok(response))) => codec::decode_payload(conn.parser(), &response),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(Error::ConnectionClosed(
                "connection closed while awaiting response".to_string(),
            )),
            Err(elapsed) => {
                conn.remove_transmission(transmission_id);
                Err(elapsed.into())
            }
        }
    }

    /// Sends a notification and returns as soon as it is queued. No
    /// transmission id is allocated, nothing will ever come back.
    pub fn notify<Req: Serialize>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        conn: Option<&Arc<Connection>>,
    ) -> Result<(), Error> {
        let conn = self.pick_connection(conn)?;
        let content = codec::encode_payload(conn.parser(), request)?;
        conn.send_packet(Meta::notification(method.service_method), &content)
    }

    /// Sends the same message on every given connection, with no response
    /// correlation. Connections that refuse the frame are skipped.
    pub fn broadcast<Req: Serialize>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        connections: &[Arc<Connection>],
    ) -> Result<(), Error> {
        for conn in connections {
            let content = codec::encode_payload(conn.parser(), request)?;
            let _ = conn.send_packet(Meta::notification(method.service_method), &content);
        }
        Ok(())
    }
}
