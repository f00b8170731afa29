//! WebSocket (RFC 6455) endpoint library for the Tokio stack.
//!
//! The crate can act as both sides of a websocket session: accepting
//! connections on a server (plain TCP or TLS) and opening client connections
//! against `ws://`/`wss://` URLs. Behind the scenes it performs the HTTP/1.1
//! upgrade exchange, then reads frames, parses masks, handles opcodes,
//! assembles fragmented messages and drives the closing handshake, following
//! the [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455).
//!
//! Entry points: [`handshake::accept_async`] / [`handshake::connect_async`]
//! for one connection at a time, or [`server::start_server`] for an
//! event-stream based server with a registry of the live connections.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod message;
mod read;
pub mod registry;
mod request;
pub mod server;
pub mod split;
pub mod stream;
mod utils;
mod write;
