use crate::codec::ParserTag;
use std::time::Duration;

// Accepts taken per listener wake-up before the loop yields. Raising it
// favors connection storms, lowering it favors traffic on connections that
// already exist.
pub const MAX_ACCEPT: usize = 256;
pub const MAX_BACKLOG: u32 = 1024;
pub const MAX_CONCURRENCY: usize = 50_000;

// Per-frame limit covering the serialized meta block plus the content that
// follows it. Connections buffering a frame larger than this are closed.
pub const MAX_PACKET_LENGTH: usize = 8 * 1024;
// Frames flushed per writer wake-up before yielding back to the runtime.
pub const MAX_SEND: usize = 5;

pub const RPC_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_packet_length: usize,
    pub max_send: usize,
    pub rpc_timeout: Duration,
    pub parser: ParserTag,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_packet_length: MAX_PACKET_LENGTH,
            max_send: MAX_SEND,
            rpc_timeout: RPC_DEFAULT_TIMEOUT,
            parser: ParserTag::Postcard,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub max_timeouts: u32,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_accept: usize,
    pub max_backlog: u32,
    pub max_concurrency: usize,
    // When set, every accepted connection gets a server-side heartbeat
    // watcher with these settings.
    pub heartbeat: Option<HeartbeatConfig>,
    pub connection: ConnectionConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            max_accept: MAX_ACCEPT,
            max_backlog: MAX_BACKLOG,
            max_concurrency: MAX_CONCURRENCY,
            heartbeat: None,
            connection: ConnectionConfig::default(),
        }
    }
}
