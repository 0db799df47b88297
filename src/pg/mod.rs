//! PostgreSQL wire-protocol front-end: codec, per-session state machine,
//! session runner, accept loop and server lifecycle.

pub mod auth;
pub mod connection;
pub mod message;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
mod protocol_tests;

pub use connection::{SessionRunner, SessionSettings};
pub use message::Frame;
pub use server::{PgServer, StartError, StopError};
pub use session::{Session, SessionState};
