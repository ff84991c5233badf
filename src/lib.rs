//! Lightweight async RPC and streaming framework for the Tokio stack.
//!
//! This library offers a small transport core for request/response and
//! notification traffic over TCP and Unix-domain sockets, so end-users could
//! wrap an RPC server/client into their application with a few lines of code.
//!
//! It's an async library based on tokio runtime, which uses a tokio
//! TcpStream or UnixStream behind the scenes, framing every message with a
//! length-prefixed header, correlating concurrent requests through
//! per-connection transmission ids, and keeping connections alive with
//! heartbeats. A WebSocket upgrade path following the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! is available for clients that reach the server through a browser-style
//! handshake, and a consistent-hash placement layer helps spreading keys
//! across a set of backends.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod hash;
pub mod stream;
pub mod stub;
#[cfg(test)]
mod tests;
