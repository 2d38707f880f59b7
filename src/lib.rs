//! NSLogger remote logging core.
//!
//! A client library ships structured log records (text, binary blobs,
//! images, block markers) to a viewer over a framed TCP protocol, with
//! optional TLS and discovery. This crate contains both halves:
//!
//! - the client pipeline ([`Logger`] and its transmit worker), which accepts
//!   log calls from any thread, buffers while no viewer is reachable, and
//!   reconnects with the same run identity;
//! - the viewer core ([`viewer::Listener`] / [`ConnectionSession`]), which
//!   accepts connections, reconstructs ordered message histories and hands
//!   batches to a [`ConnectionDelegate`];
//! - the shared wire codec ([`codec`]), a self-describing TLV frame format.
//!
//! ```no_run
//! use nslogger::{Domain, Level};
//!
//! let logger = nslogger::get_default();
//! logger.set_remote_host("10.0.0.8", 50000, false);
//! logger.log(Some(Domain::Network), Level::Info, "connection established");
//! ```

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod record;
#[cfg(feature = "tls")]
pub mod tls;
pub mod viewer;

pub use crate::client::{ClientConfig, Logger, LoggerOptions};
pub use crate::error::{Error, ProtocolError};
pub use crate::record::{
    ClientIdentity, Domain, ImageData, Level, LogRecord, MessageType, Payload, Timeval,
};
pub use crate::viewer::session::{ConnectionDelegate, ConnectionSession};
pub use crate::viewer::{Listener, ViewerConfig};

use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    static ref DEFAULT_LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
}

/// Replaces the process-wide default logger.
pub fn set_default(logger: Logger) {
    let mut slot = DEFAULT_LOGGER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(logger);
}

/// Returns the process-wide default logger, creating one with default
/// options on first use. The worker thread itself only starts on the first
/// log call.
pub fn get_default() -> Logger {
    let mut slot = DEFAULT_LOGGER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.get_or_insert_with(Logger::new).clone()
}

/// Logs a message through the default logger.
pub fn log_message(domain: Option<Domain>, level: Level, message: &str) {
    get_default().log(domain, level, message);
}

/// Sends binary data through the default logger.
pub fn log_data(domain: Option<Domain>, level: Level, data: &[u8]) {
    get_default().log_data(domain, level, data);
}

/// Sends image data through the default logger.
pub fn log_image(domain: Option<Domain>, level: Level, width: u32, height: u32, data: &[u8]) {
    get_default().log_image(domain, level, width, height, data);
}

/// Opens a block through the default logger.
pub fn log_start_block(title: &str) {
    get_default().start_block(title);
}

/// Closes the innermost block through the default logger.
pub fn log_end_block() {
    get_default().end_block();
}

/// Places a mark through the default logger.
pub fn log_mark(title: Option<&str>) {
    get_default().log_mark(title);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_logger_is_created_lazily_and_shared() {
        let first = get_default();
        let second = get_default();
        assert_eq!(
            first.identity().unique_id,
            second.identity().unique_id
        );

        let replacement = Logger::new();
        let replacement_id = replacement.identity().unique_id.clone();
        set_default(replacement);
        assert_eq!(get_default().identity().unique_id, replacement_id);
    }
}
