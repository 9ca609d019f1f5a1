//! Control-plane dispatch for the kzorp engine.
//!
//! Maps the opcode-tagged record stream of [`kzorp_proto`] onto engine
//! transaction calls, queries and restartable dumps, and serves it over a
//! Unix domain socket. One connected peer owns at most one transaction;
//! disconnecting aborts it and removes the peer's binds.

mod dump;
mod error;
mod server;
mod session;
mod wire;

pub use error::{ControlError, Result};
pub use server::{ControlServer, serve_peer};
pub use session::PeerSession;
