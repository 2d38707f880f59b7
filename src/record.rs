//! In-memory canonical form of everything that crosses the wire.

use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical channel for a log record. Mirrors the domains the desktop viewer
/// knows how to color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    App,
    View,
    Layout,
    Controller,
    Routing,
    Service,
    Network,
    Model,
    Cache,
    DB,
    IO,
    Custom(String),
}

impl Domain {
    pub fn as_str(&self) -> &str {
        match *self {
            Domain::App => "app",
            Domain::View => "view",
            Domain::Layout => "layout",
            Domain::Controller => "controller",
            Domain::Routing => "routing",
            Domain::Service => "service",
            Domain::Network => "network",
            Domain::Model => "model",
            Domain::Cache => "cache",
            Domain::DB => "db",
            Domain::IO => "io",
            Domain::Custom(ref name) => name,
        }
    }
}

/// Verbosity level, 0 = most important, higher = more verbose.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warning = 1,
    Important = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
    Noise = 6,
}

/// Variant tag of a record. The numeric values are the wire contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    Log = 0,
    BlockStart = 1,
    BlockEnd = 2,
    ClientInfo = 3,
    Disconnect = 4,
    Mark = 5,
}

impl MessageType {
    pub fn from_raw(raw: u16) -> Option<MessageType> {
        match raw {
            0 => Some(MessageType::Log),
            1 => Some(MessageType::BlockStart),
            2 => Some(MessageType::BlockEnd),
            3 => Some(MessageType::ClientInfo),
            4 => Some(MessageType::Disconnect),
            5 => Some(MessageType::Mark),
            _ => None,
        }
    }
}

/// Wall-clock timestamp captured at ingest time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Timeval {
    pub seconds: u64,
    pub microseconds: u32,
}

impl Timeval {
    pub fn now() -> Timeval {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Timeval {
                seconds: elapsed.as_secs(),
                microseconds: elapsed.subsec_micros(),
            },
            // Pre-epoch clocks get a zero timestamp rather than a panic.
            Err(_) => Timeval::default(),
        }
    }
}

/// Image payload; dimensions may be zero when the client did not send them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Record payload. Exactly one variant is meaningful for LOG records,
/// `Empty` for markers and block delimiters without a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Text(String),
    Binary(Vec<u8>),
    Image(ImageData),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(*self, Payload::Empty)
    }
}

/// A part the decoder did not recognize, preserved verbatim so re-encoding
/// a record reproduces the original frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPart {
    pub key: u8,
    pub part_type: u8,
    /// Raw part body exactly as it appeared after the type byte, including
    /// any length prefix.
    pub body: Vec<u8>,
}

/// The canonical record, symmetric between client and viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub sequence: u32,
    pub timestamp: Timeval,
    pub message_type: MessageType,
    /// Raw 0–7 level; only meaningful for LOG records.
    pub level: u16,
    pub domain: Option<String>,
    pub thread_id: String,
    pub filename: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub payload: Payload,
    /// Unrecognized wire parts, kept in ascending key order.
    pub extras: Vec<RawPart>,
}

impl LogRecord {
    /// Builds a record stamped with the current time and the calling
    /// thread's identity. Both must be captured on the caller's thread.
    pub fn new(message_type: MessageType, sequence: u32) -> LogRecord {
        LogRecord {
            sequence,
            timestamp: Timeval::now(),
            message_type,
            level: 0,
            domain: None,
            thread_id: current_thread_label(),
            filename: None,
            line: None,
            function: None,
            payload: Payload::Empty,
            extras: Vec::new(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self.payload {
            Payload::Text(ref text) => Some(text),
            _ => None,
        }
    }
}

/// First message of every run; regenerated per process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_name: String,
    pub client_version: String,
    pub os_name: String,
    pub os_version: String,
    pub device: String,
    /// Identifies the run. Stays the same across reconnections, changes on
    /// every process start.
    pub unique_id: String,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        const FALLBACK_OS_NAME: &str = "macOS";
    } else if #[cfg(target_os = "ios")] {
        const FALLBACK_OS_NAME: &str = "iOS";
    } else if #[cfg(target_os = "windows")] {
        const FALLBACK_OS_NAME: &str = "Windows";
    } else {
        const FALLBACK_OS_NAME: &str = "Linux";
    }
}

impl ClientIdentity {
    /// Detects host information and mints a fresh run id.
    pub fn detect(client_name: Option<String>, client_version: Option<String>) -> ClientIdentity {
        let client_name = client_name.unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
                .unwrap_or_else(|| String::from("unknown"))
        });

        ClientIdentity {
            client_name,
            client_version: client_version.unwrap_or_default(),
            os_name: sys_info::os_type().unwrap_or_else(|_| String::from(FALLBACK_OS_NAME)),
            os_version: sys_info::os_release().unwrap_or_default(),
            device: sys_info::hostname().unwrap_or_else(|_| String::from("unknown")),
            unique_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Short, opaque label for the calling thread. Uses the thread name when one
/// was set, the numeric id otherwise.
pub fn current_thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{:?}", current.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_raw_round_trip() {
        for raw in 0..6u16 {
            let ty = MessageType::from_raw(raw).unwrap();
            assert_eq!(ty as u16, raw);
        }
        assert_eq!(MessageType::from_raw(6), None);
    }

    #[test]
    fn identity_detection_populates_run_id() {
        let a = ClientIdentity::detect(Some("test".into()), None);
        let b = ClientIdentity::detect(Some("test".into()), None);
        assert!(!a.unique_id.is_empty());
        assert_ne!(a.unique_id, b.unique_id);
    }

    #[test]
    fn new_record_captures_thread_label() {
        let record = LogRecord::new(MessageType::Log, 7);
        assert_eq!(record.sequence, 7);
        assert!(!record.thread_id.is_empty());
        assert!(record.payload.is_empty());
    }
}
