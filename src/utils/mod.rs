//! Utility modules shared by the loader, the store and the CLI

pub mod error;
pub mod logging;
pub mod time;

// Re-export commonly used items
pub use error::{log_error, with_fallback};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config};
pub use time::current_timestamp_millis;
