use crate::codec::{self, Meta, Packet, PacketType};
use crate::config::ChannelConfig;
use crate::connection::Connection;
use crate::error::{codes, Error};
use crate::stream::{Endpoint, NetStream};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

pub type RequestHandler =
    Arc<dyn Fn(Arc<Connection>, Packet) -> BoxFuture<'static, Result<Vec<u8>, Error>> + Send + Sync>;
pub type NotificationHandler =
    Arc<dyn Fn(Arc<Connection>, Packet) -> BoxFuture<'static, ()> + Send + Sync>;

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<NetStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                NetStream::tcp(stream)
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(NetStream::Unix(stream))
            }
        }
    }
}

/// Factory and registry of connections.
///
/// A channel listens on any number of TCP or Unix-domain endpoints, accepts
/// inbound connections up to a concurrency cap, dials outbound ones, and
/// dispatches every decoded REQUEST or NOTIFICATION to the handler
/// registered under its service method.
pub struct Channel {
    config: ChannelConfig,
    connections: Arc<StdMutex<HashMap<u64, Arc<Connection>>>>,
    request_handlers: StdMutex<HashMap<String, RequestHandler>>,
    notification_handlers: StdMutex<HashMap<String, NotificationHandler>>,
    started_tx: watch::Sender<bool>,
    // Pinged every time a connection detaches, so a parked accept loop can
    // resume once a slot frees under the concurrency cap.
    slot_freed: Arc<Notify>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let (started_tx, _) = watch::channel(false);
        Arc::new(Channel {
            config,
            connections: Arc::new(StdMutex::new(HashMap::new())),
            request_handlers: StdMutex::new(HashMap::new()),
            notification_handlers: StdMutex::new(HashMap::new()),
            started_tx,
            slot_freed: Arc::new(Notify::new()),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Snapshot of the live connections, safe to iterate while connections
    /// keep attaching and detaching.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    pub fn is_full(&self) -> bool {
        self.connection_count() >= self.config.max_concurrency
    }

    /// Registers the handler answering REQUEST frames for `service_method`.
    pub fn on_request<F>(&self, service_method: &str, handler: F)
    where
        F: Fn(Arc<Connection>, Packet) -> BoxFuture<'static, Result<Vec<u8>, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.request_handlers
            .lock()
            .unwrap()
            .insert(service_method.to_string(), Arc::new(handler));
    }

    /// Registers the handler consuming NOTIFICATION frames for
    /// `service_method`.
    pub fn on_notification<F>(&self, service_method: &str, handler: F)
    where
        F: Fn(Arc<Connection>, Packet) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.notification_handlers
            .lock()
            .unwrap()
            .insert(service_method.to_string(), Arc::new(handler));
    }

    /// Binds a listening socket and spawns its accept loop. The loop stays
    /// idle until `start` is called. Returns the bound endpoint, which for
    /// TCP carries the OS-assigned port when the caller bound port zero.
    pub async fn listen(self: &Arc<Self>, endpoint: Endpoint) -> Result<Endpoint, Error> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let addr = tokio::net::lookup_host(&addr).await?.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "address resolved to nothing",
                    )
                })?;
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                let listener = socket.listen(self.config.max_backlog)?;
                let local_addr = listener.local_addr()?;
                self.spawn_accept_loop(Listener::Tcp(listener));
                Ok(Endpoint::Tcp(local_addr.to_string()))
            }
            Endpoint::Unix(path) => {
                // A previous process may have left its socket file behind.
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path)?;
                self.spawn_accept_loop(Listener::Unix(listener));
                Ok(Endpoint::Unix(path))
            }
        }
    }

    /// Enables the accept loops.
    pub fn start(&self) {
        let _ = self.started_tx.send(true);
    }

    /// Disables the accept loops. Established connections are untouched,
    /// pending ones wait in the kernel backlog.
    pub fn stop(&self) {
        let _ = self.started_tx.send(false);
    }

    /// Dials an endpoint, optionally bounded by a deadline, and attaches
    /// the resulting connection like an accepted one.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        deadline: Option<Duration>,
    ) -> Result<Arc<Connection>, Error> {
        let stream = match deadline {
            Some(deadline) => timeout(deadline, NetStream::connect(endpoint)).await??,
            None => NetStream::connect(endpoint).await?,
        };
        Ok(self.attach(stream, false))
    }

    /// Sends an already encoded frame on every live connection. The
    /// snapshot keeps concurrent detaches from tripping the iteration, and
    /// connections closing mid-broadcast are skipped silently.
    pub fn broadcast(&self, frame: &[u8]) {
        for conn in self.connections() {
            let _ = conn.send(frame.to_vec());
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: Listener) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut started_rx = channel.started_tx.subscribe();
            loop {
                // Park until start() flips the watcher on.
                while !*started_rx.borrow() {
                    if started_rx.changed().await.is_err() {
                        return;
                    }
                }

                // Past the cap we simply stop accepting, the kernel backlog
                // absorbs the pending connections until a slot frees.
                while channel.is_full() {
                    channel.slot_freed.notified().await;
                }

                // stop() has to win against a pending accept, otherwise a
                // stopped channel would still pick up the next arrival.
                tokio::select! {
                    changed = started_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    result = listener.accept() => match result {
                        Ok(stream) => {
                            channel.attach(stream, true);
                        }
                        Err(err) => {
                            error!("accept failed: {}", err);
                            continue;
                        }
                    },
                }

                // Take whatever else is already pending, bounded per wake-up
                // so a connection storm can't monopolize the loop.
                for _ in 1..channel.config.max_accept {
                    if channel.is_full() || !*started_rx.borrow() {
                        break;
                    }
                    match listener.accept().now_or_never() {
                        Some(Ok(stream)) => {
                            channel.attach(stream, true);
                        }
                        Some(Err(err)) => {
                            error!("accept failed: {}", err);
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
    }

    fn attach(self: &Arc<Self>, stream: NetStream, server_side: bool) -> Arc<Connection> {
        let conn = Connection::new(stream, server_side, self.config.connection.clone());
        info!(
            "[conn|{}][host|{}][peer|{}] made",
            conn.conn_id,
            conn.local_addr(),
            conn.peer_addr()
        );

        let connections = Arc::clone(&self.connections);
        let slot_freed = Arc::clone(&self.slot_freed);
        conn.set_close_cb(Box::new(move |closed, _reason| {
            connections.lock().unwrap().remove(&closed.conn_id);
            slot_freed.notify_one();
        }));

        {
            let mut connections = self.connections.lock().unwrap();
            debug_assert!(!connections.contains_key(&conn.conn_id));
            connections.insert(conn.conn_id, Arc::clone(&conn));
        }
        // A connection dying between creation and callback registration
        // finalized with no callback in place, detach it here instead.
        if conn.is_finalized() {
            self.connections.lock().unwrap().remove(&conn.conn_id);
        }

        if server_side {
            if let Some(heartbeat) = &self.config.heartbeat {
                conn.setup_server_heartbeat(heartbeat.interval, heartbeat.max_timeouts);
            }
        }

        self.spawn_dispatcher(Arc::clone(&conn));
        conn
    }

    // Runs in an independent task per connection, popping fully decoded
    // frames in wire order and resolving their handlers.
    fn spawn_dispatcher(self: &Arc<Self>, conn: Arc<Connection>) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(packet) = conn.recv().await {
                match packet.meta.packet_type {
                    PacketType::Request => channel.handle_request(&conn, packet).await,
                    PacketType::Notification => channel.handle_notification(&conn, packet).await,
                    // Responses are completed by the receive path itself and
                    // never reach the dispatcher.
                    PacketType::Response => {}
                }
            }
            debug!("[conn|{}] dispatcher finished", conn.conn_id);
        });
    }

    async fn handle_request(&self, conn: &Arc<Connection>, packet: Packet) {
        let service_method = packet.meta.service_method.clone();
        let transmission_id = packet.meta.transmission_id;

        let handler = self
            .request_handlers
            .lock()
            .unwrap()
            .get(&service_method)
            .cloned();
        let result = match handler {
            Some(handler) => handler(Arc::clone(conn), packet).await,
            None => Err(Error::Remote {
                name: "MethodNotFound",
                code: codes::METHOD_NOT_FOUND,
                message: format!("no handler registered for `{}`", service_method),
            }),
        };

        let outcome = match result {
            Ok(content) => conn.send_packet(Meta::response(transmission_id, false), &content),
            Err(err) => {
                let envelope = codec::ErrorEnvelope {
                    error_code: err.remote_code(),
                    error_message: err.to_string(),
                };
                match codec::encode_payload(conn.parser(), &envelope) {
                    Ok(content) => {
                        conn.send_packet(Meta::response(transmission_id, true), &content)
                    }
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = outcome {
            debug!(
                "[conn|{}] couldn't answer `{}`: {}",
                conn.conn_id, service_method, err
            );
        }
    }

    async fn handle_notification(&self, conn: &Arc<Connection>, packet: Packet) {
        // Heartbeats carry an empty service method, refreshing the liveness
        // clock was all they were for.
        if packet.meta.service_method.is_empty() {
            return;
        }

        let handler = self
            .notification_handlers
            .lock()
            .unwrap()
            .get(&packet.meta.service_method)
            .cloned();
        match handler {
            Some(handler) => handler(Arc::clone(conn), packet).await,
            None => debug!(
                "[conn|{}] no handler registered for notification `{}`",
                conn.conn_id, packet.meta.service_method
            ),
        }
    }
}
