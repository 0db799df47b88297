pub mod backend;
pub mod config;
pub mod error;
pub mod host;
pub mod pg;

// Re-export commonly used types
pub use backend::{Backend, BackendError, ColumnDescription, QueryOutcome, StaticBackend};
pub use config::Config;
pub use error::{PgFeError, Result};
pub use pg::{PgServer, StartError, StopError};
