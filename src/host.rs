//! Facade for the embedding host's two lifecycle calls.
//!
//! The host invokes `start`/`stop` through its own stored-procedure calling
//! convention; decoding the encoded argument record into (host, service) is
//! the host adapter's job and stays outside this crate. What crosses the
//! boundary here is plain typed calls and a flat success/failure outcome.

use std::sync::Arc;

use crate::pg::server::PgServer;

/// Flat outcome channel back to the host: success, or a reason string.
pub type HostOutcome = Result<(), String>;

pub struct HostGateway {
    server: Arc<PgServer>,
}

impl HostGateway {
    pub fn new(server: Arc<PgServer>) -> Self {
        Self { server }
    }

    /// `start(host = <str>, service = <str>)` entry point.
    pub async fn start(&self, host: &str, service: &str) -> HostOutcome {
        self.server
            .start(host, service)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// `stop()` entry point.
    pub async fn stop(&self) -> HostOutcome {
        self.server.stop().await.map_err(|e| e.to_string())
    }
}
