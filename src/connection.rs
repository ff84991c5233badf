use crate::codec::{self, Meta, Packet, PacketType, ParserTag, ErrorEnvelope, HEADER_LENGTH};
use crate::config::ConnectionConfig;
use crate::error::{self, Error};
use crate::stream::NetStream;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;

// Process-wide monotonic connection id, never reissued while in use.
static CONN_ID: AtomicU64 = AtomicU64::new(1);

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

const RECV_QUEUE_SIZE: usize = 1000;

enum SendOp {
    Frame(Vec<u8>),
    // Graceful teardown marker, queued behind every frame accepted so far so
    // the writer drains them before shutting the socket down.
    Shutdown,
}

pub type CloseCallback = Box<dyn FnOnce(&Connection, Option<&Error>) + Send>;

type ResultSlot = oneshot::Sender<Result<Bytes, Error>>;

/// A single bidirectional framed stream.
///
/// The connection owns the socket through two background tasks, one draining
/// the send queue and one assembling inbound frames. Decoded RESPONSE frames
/// complete their pending transmission slot directly, everything else lands
/// in the receive queue for the dispatcher. `send` never blocks, `close` is
/// idempotent and fails every pending transmission.
pub struct Connection {
    pub conn_id: u64,
    pub server_side: bool,
    peer_addr: String,
    local_addr: String,
    config: ConnectionConfig,
    state: AtomicU8,
    send_tx: mpsc::UnboundedSender<SendOp>,
    recv_rx: Mutex<ReceiverStream<Packet>>,
    transmissions: StdMutex<HashMap<u32, ResultSlot>>,
    transmission_id: AtomicU32,
    close_cb: StdMutex<Option<CloseCallback>>,
    close_reason: StdMutex<Option<Error>>,
    // Flipped once on close, stops the reader and the heartbeat watchers.
    closed_tx: watch::Sender<bool>,
    // Flipped only on reset close, makes the writer bail out mid-drain. The
    // zero linger set on acquisition turns the resulting drop into an RST.
    reset_tx: watch::Sender<bool>,
    created_at: Instant,
    last_seen_millis: AtomicU64,
    heartbeat_counter: AtomicU32,
}

impl Connection {
    pub fn new(stream: NetStream, server_side: bool, config: ConnectionConfig) -> Arc<Self> {
        let peer_addr = stream.peer_addr();
        let local_addr = stream.local_addr();
        let (read_half, write_half) = tokio::io::split(stream);

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let (closed_tx, _) = watch::channel(false);
        let (reset_tx, _) = watch::channel(false);

        let conn = Arc::new(Connection {
            conn_id: CONN_ID.fetch_add(1, Ordering::Relaxed),
            server_side,
            peer_addr,
            local_addr,
            config,
            state: AtomicU8::new(STATE_OPEN),
            send_tx,
            recv_rx: Mutex::new(ReceiverStream::new(recv_rx)),
            transmissions: StdMutex::new(HashMap::new()),
            transmission_id: AtomicU32::new(1),
            close_cb: StdMutex::new(None),
            close_reason: StdMutex::new(None),
            closed_tx,
            reset_tx,
            created_at: Instant::now(),
            last_seen_millis: AtomicU64::new(0),
            heartbeat_counter: AtomicU32::new(0),
        });

        tokio::spawn(write_loop(Arc::clone(&conn), write_half, send_rx));
        tokio::spawn(read_loop(Arc::clone(&conn), read_half, recv_tx));

        conn
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn parser(&self) -> ParserTag {
        self.config.parser
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_OPEN
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Appends one encoded frame to the send queue and returns immediately.
    /// Frames are written to the socket in `send` order, even across partial
    /// writes.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(
                "send on closed connection".to_string(),
            ));
        }
        self.send_tx
            .send(SendOp::Frame(frame))
            .map_err(|_| Error::ConnectionClosed("send on closed connection".to_string()))
    }

    /// Encodes and queues a frame with this connection's parser and limits.
    pub fn send_packet(&self, meta: Meta, content: &[u8]) -> Result<(), Error> {
        let frame = codec::encode(
            self.config.parser,
            meta,
            content,
            self.config.max_packet_length,
        )?;
        self.send(frame)
    }

    /// Pops the next inbound REQUEST or NOTIFICATION. Returns `None` once
    /// the connection is closed and the queue is drained.
    pub async fn recv(&self) -> Option<Packet> {
        self.recv_rx.lock().await.next().await
    }

    pub async fn recv_timeout(&self, duration: Duration) -> Result<Option<Packet>, Error> {
        Ok(timeout(duration, self.recv()).await?)
    }

    // Post-increment allocation, wrapping at the u32 boundary. Ids are only
    // meaningful within this connection.
    pub fn next_transmission_id(&self) -> u32 {
        self.transmission_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts an empty result slot. The slot must be registered before the
    /// request bytes are queued, otherwise a fast response could find
    /// nothing to complete.
    pub(crate) fn register_transmission(&self, id: u32) -> oneshot::Receiver<Result<Bytes, Error>> {
        let (tx, rx) = oneshot::channel();
        self.transmissions.lock().unwrap().insert(id, tx);
        rx
    }

    pub(crate) fn remove_transmission(&self, id: u32) {
        self.transmissions.lock().unwrap().remove(&id);
    }

    pub fn pending_transmissions(&self) -> usize {
        self.transmissions.lock().unwrap().len()
    }

    /// Registers the one callback fired after the connection has fully
    /// closed. The channel uses it to detach the connection from its live
    /// map before the `Arc` can be reclaimed.
    pub fn set_close_cb(&self, cb: CloseCallback) {
        let mut slot = self.close_cb.lock().unwrap();
        debug_assert!(slot.is_none());
        *slot = Some(cb);
    }

    /// Closes the connection. Safe to call any number of times from any
    /// task, only the first call wins.
    ///
    /// A graceful close drains the send queue best-effort before shutting
    /// the socket down. A reset close discards the queue and drops the
    /// socket, which resets the peer thanks to the zero linger. Either way
    /// every pending transmission fails with the given reason and the
    /// receive queue terminates.
    pub fn close(&self, reason: Option<Error>, reset: bool) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match &reason {
            Some(reason) => error!(
                "[conn|{}][host|{}][peer|{}] closed with reason: {}",
                self.conn_id, self.local_addr, self.peer_addr, reason
            ),
            None => info!(
                "[conn|{}][host|{}][peer|{}] closed cleanly",
                self.conn_id, self.local_addr, self.peer_addr
            ),
        }

        let reason_text = reason
            .as_ref()
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| "closed".to_string());
        *self.close_reason.lock().unwrap() = reason;

        let pending: Vec<ResultSlot> = {
            let mut transmissions = self.transmissions.lock().unwrap();
            transmissions.drain().map(|(_, slot)| slot).collect()
        };
        for slot in pending {
            let _ = slot.send(Err(Error::ConnectionClosed(reason_text.clone())));
        }

        let _ = self.closed_tx.send(true);

        if reset {
            let _ = self.reset_tx.send(true);
            self.finalize();
        } else if self.send_tx.send(SendOp::Shutdown).is_err() {
            // The writer is already gone, nothing left to drain.
            self.finalize();
        }
    }

    // Last transition. Runs once, either from the writer after the drain or
    // directly from a reset close.
    pub(crate) fn finalize(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        let cb = self.close_cb.lock().unwrap().take();
        if let Some(cb) = cb {
            let reason = self.close_reason.lock().unwrap();
            cb(self, reason.as_ref());
        }
    }

    // Any complete inbound frame counts as liveness.
    fn touch(&self) {
        self.last_seen_millis
            .store(self.created_at.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.heartbeat_counter.store(0, Ordering::Relaxed);
    }

    fn handle_response(&self, packet: Packet) {
        let id = packet.meta.transmission_id;
        let slot = self.transmissions.lock().unwrap().remove(&id);
        let Some(slot) = slot else {
            // The caller gave up on this transmission already.
            debug!(
                "[conn|{}] dropped late response for transmission {}",
                self.conn_id, id
            );
            return;
        };

        let result = if packet.meta.failed {
            match codec::decode_payload::<ErrorEnvelope>(self.config.parser, &packet.content) {
                Ok(envelope) => Err(error::registry()
                    .error_for_code(envelope.error_code, envelope.error_message)),
                Err(err) => Err(err),
            }
        } else {
            Ok(packet.content)
        };
        let _ = slot.send(result);
    }

    /// Arms the server-side liveness watcher: a periodic checker expecting
    /// any inbound frame within each interval. `max_timeouts` consecutive
    /// silent intervals close the connection.
    pub fn setup_server_heartbeat(self: &Arc<Self>, interval: Duration, max_timeouts: u32) {
        debug_assert!(max_timeouts >= 1);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut closed_rx = conn.closed_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            let interval_millis = interval.as_millis() as u64;
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                let now = conn.created_at.elapsed().as_millis() as u64;
                let last_seen = conn.last_seen_millis.load(Ordering::Relaxed);
                if now.saturating_sub(last_seen) >= interval_millis {
                    let missed = conn.heartbeat_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if missed >= max_timeouts {
                        conn.close(
                            Some(Error::HeartbeatTimeout {
                                peer: conn.peer_addr.clone(),
                                timeouts: missed,
                            }),
                            false,
                        );
                        return;
                    }
                }
            }
        });
    }

    /// Arms the client-side keep-alive: an empty notification sent every
    /// interval, enough to keep the server-side counter at zero when the
    /// connection is otherwise idle.
    pub fn setup_client_heartbeat(self: &Arc<Self>, interval: Duration) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut closed_rx = conn.closed_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                if conn.send_packet(Meta::heartbeat(), &[]).is_err() {
                    return;
                }
            }
        });
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut write_half: WriteHalf<NetStream>,
    mut send_rx: mpsc::UnboundedReceiver<SendOp>,
) {
    let mut reset_rx = conn.reset_tx.subscribe();
    let max_send = conn.config.max_send;

    loop {
        let first = tokio::select! {
            biased;
            _ = reset_rx.changed() => return,
            op = send_rx.recv() => match op {
                Some(op) => op,
                None => return,
            },
        };

        // Flush a bounded batch per wake-up, then yield, so one chatty
        // connection can't starve the rest of the loop.
        let mut op = first;
        let mut batch = 0;
        loop {
            match op {
                SendOp::Frame(frame) => {
                    let write = tokio::select! {
                        biased;
                        _ = reset_rx.changed() => return,
                        result = write_half.write_all(&frame) => result,
                    };
                    if let Err(err) = write {
                        conn.close(Some(err.into()), true);
                        return;
                    }
                    batch += 1;
                }
                SendOp::Shutdown => {
                    let _ = write_half.shutdown().await;
                    conn.finalize();
                    return;
                }
            }

            if batch >= max_send {
                tokio::task::yield_now().await;
                break;
            }
            match send_rx.try_recv() {
                Ok(next) => op = next,
                Err(_) => break,
            }
        }
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut read_half: ReadHalf<NetStream>,
    recv_tx: mpsc::Sender<Packet>,
) {
    let mut closed_rx = conn.closed_tx.subscribe();
    let max_packet_length = conn.config.max_packet_length;

    // One pre-allocated buffer sized for the largest legal frame. Reads
    // append at the cursor, extraction drains from the front, and partial
    // frames survive in place until the missing bytes arrive.
    let mut buf = vec![0u8; HEADER_LENGTH + max_packet_length];
    let mut filled = 0usize;

    loop {
        let received = tokio::select! {
            biased;
            _ = closed_rx.changed() => return,
            result = read_half.read(&mut buf[filled..]) => match result {
                Ok(0) => {
                    conn.close(None, false);
                    return;
                }
                Ok(received) => received,
                Err(err) => {
                    conn.close(Some(err.into()), true);
                    return;
                }
            },
        };
        filled += received;

        loop {
            match codec::decode(&buf[..filled], max_packet_length) {
                Ok(Some((used, packet))) => {
                    conn.touch();
                    buf.copy_within(used..filled, 0);
                    filled -= used;

                    if packet.meta.packet_type == PacketType::Response {
                        conn.handle_response(packet);
                    } else if recv_tx.send(packet).await.is_err() {
                        // Dispatcher went away, nobody is reading anymore.
                        conn.close(None, false);
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    conn.close(Some(err), true);
                    return;
                }
            }
        }
    }
}
