pub mod config;
pub mod export;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::{AppConfig, ExportConfig, Tier};
pub use observability::{apply_logging_level, init_tracing};
pub use server::{AppState, BulkportServer, ServerBuilder, build_app};
