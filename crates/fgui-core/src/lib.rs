//! Connection lifecycle and record synchronization for backend servers that
//! expose collections over a persistent socket.
//!
//! - [`api`]: configuration and record types shared by every layer
//! - [`ws`]: the JSON frame protocol spoken on the socket
//! - [`client`]: transport adapter, call gateway, listener multiplexer and the
//!   per-server connection state machine
//! - [`sync`]: per-collection record mirror built on top of a server connection

pub mod api;
pub mod ws;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod sync;
