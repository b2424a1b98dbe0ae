pub mod env;
pub mod tracing_init;

pub use env::{AuthMode, Backoff, RetryConfig, SortOrder, SourceConfig, SyncConfig};
pub use tracing_init::init_tracing;
