//! Utility modules shared by the host and its workers

pub mod lock;
pub mod logging;
pub mod signal;

pub use lock::{take_locked, with_lock, with_read_lock, with_write_lock};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config, init_shelf_logging};
pub use signal::{wait_for_shutdown_signal, ShutdownSignal};
