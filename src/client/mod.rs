//! Client-side logging core: the thread-safe `Logger` front end, its
//! configuration, and the worker it feeds. A log call costs one bounded
//! enqueue under a mutex and never touches the network; everything else
//! happens on the worker thread.

pub mod state;
pub mod transport;
pub mod worker;

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use bitflags::bitflags;

use crate::client::state::{ControlEvent, LoggerState, QueuedRecord, RemoteTarget, Shared};
use crate::client::worker::MessageWorker;
use crate::discovery::DiscoverySource;
use crate::record::{
    ClientIdentity, Domain, ImageData, Level, LogRecord, MessageType, Payload,
};

/// Gates the worker's own diagnostic logging.
pub(crate) const DEBUG_LOGGER: bool = cfg!(debug_assertions);

bitflags! {
    pub struct LoggerOptions: u16 {
        /// Each log call waits until its bytes were handed to the transport
        /// (this includes waiting for a connection).
        const FLUSH_EACH_MESSAGE            = 0b0000_0001;
        /// Look for a viewer through the discovery adapter.
        const BROWSE_BONJOUR                = 0b0000_0010;
        /// Wrap the connection in TLS.
        const USE_SSL                       = 0b0000_0100;
        /// Additionally echo every record to stderr.
        const LOG_TO_CONSOLE                = 0b0000_1000;
        /// Keep records in memory while no viewer is connected.
        const BUFFER_LOGS_UNTIL_CONNECTION  = 0b0001_0000;
        /// Restrict discovery to the `local.` domain.
        const BROWSE_ONLY_LOCAL_DOMAIN      = 0b0010_0000;
    }
}

impl Default for LoggerOptions {
    fn default() -> LoggerOptions {
        LoggerOptions::BROWSE_BONJOUR
            | LoggerOptions::BUFFER_LOGS_UNTIL_CONNECTION
            | LoggerOptions::BROWSE_ONLY_LOCAL_DOMAIN
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub options: LoggerOptions,
    /// Only consider discovered services with this exact name.
    pub bonjour_service_name: Option<String>,
    /// Fixed viewer address; skips discovery when set.
    pub remote_host: Option<(String, u16)>,
    /// Stream frames to a local session file instead of a socket.
    pub file_path: Option<PathBuf>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    /// Record-count bound on the queue while no viewer is connected.
    pub queue_capacity: usize,
    /// Byte cap for records buffered while no viewer is connected.
    pub buffer_capacity: usize,
    pub connect_timeout: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    #[cfg(feature = "tls")]
    pub tls: crate::tls::TlsClientPolicy,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            options: LoggerOptions::default(),
            bonjour_service_name: None,
            remote_host: None,
            file_path: None,
            client_name: None,
            client_version: None,
            queue_capacity: 4096,
            buffer_capacity: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            retry_min: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            #[cfg(feature = "tls")]
            tls: crate::tls::TlsClientPolicy::anonymous(),
        }
    }
}

impl ClientConfig {
    pub(crate) fn buffer_until_connection(&self) -> bool {
        self.options
            .contains(LoggerOptions::BUFFER_LOGS_UNTIL_CONNECTION)
    }
}

struct Inner {
    shared: Arc<Shared>,
    config: ClientConfig,
    identity: ClientIdentity,
    start_worker: Once,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    control_rx_slot: Mutex<Option<mpsc::Receiver<ControlEvent>>>,
    discovery_slot: Mutex<Option<Box<dyn DiscoverySource>>>,
}

/// The logging front end. Cheap to clone; all clones feed the same worker.
/// Every method absorbs failures silently, a logger must never perturb the
/// host application.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    pub fn new() -> Logger {
        Logger::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Logger {
        let discovery = default_discovery();
        Logger::build(config, discovery)
    }

    /// Uses a caller-supplied discovery adapter instead of the built-in one.
    pub fn with_discovery(config: ClientConfig, discovery: Box<dyn DiscoverySource>) -> Logger {
        Logger::build(config, Some(discovery))
    }

    fn build(config: ClientConfig, discovery: Option<Box<dyn DiscoverySource>>) -> Logger {
        let identity =
            ClientIdentity::detect(config.client_name.clone(), config.client_version.clone());
        let (control_tx, control_rx) = mpsc::channel();
        let shared = Arc::new(Shared::new(
            LoggerState::new(initial_remote(&config)),
            control_tx,
        ));
        Logger {
            inner: Arc::new(Inner {
                shared,
                config,
                identity,
                start_worker: Once::new(),
                worker: Mutex::new(None),
                control_rx_slot: Mutex::new(Some(control_rx)),
                discovery_slot: Mutex::new(discovery),
            }),
        }
    }

    /// The run identity announced to viewers.
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// Points the logger at a fixed viewer address, replacing discovery.
    pub fn set_remote_host(&self, host: &str, port: u16, use_tls: bool) {
        if DEBUG_LOGGER {
            log::info!(target: "NSLogger",
                       "set_remote_host host={} port={} use_tls={}", host, port, use_tls);
        }
        if let Ok(mut state) = self.inner.shared.state.lock() {
            state.remote = Some(RemoteTarget::Tcp {
                host: host.to_string(),
                port,
                use_tls,
            });
        }
        if self.inner.start_worker.is_completed() {
            self.inner.shared.send_control(ControlEvent::RemoteChanged);
        }
    }

    pub fn log(&self, domain: Option<Domain>, level: Level, message: &str) {
        self.log_source(domain, level, None, None, None, message);
    }

    /// Logs a message carrying its source-site annotation.
    pub fn log_source(
        &self,
        domain: Option<Domain>,
        level: Level,
        filename: Option<&str>,
        line: Option<u32>,
        function: Option<&str>,
        message: &str,
    ) {
        let mut record = LogRecord::new(MessageType::Log, 0);
        record.level = level as u16;
        record.domain = domain.map(|domain| domain.as_str().to_string());
        record.filename = filename.map(str::to_string);
        record.line = line;
        record.function = function.map(str::to_string);
        record.payload = Payload::Text(message.to_string());
        self.dispatch(record);
    }

    pub fn log_data(&self, domain: Option<Domain>, level: Level, data: &[u8]) {
        let mut record = LogRecord::new(MessageType::Log, 0);
        record.level = level as u16;
        record.domain = domain.map(|domain| domain.as_str().to_string());
        record.payload = Payload::Binary(data.to_vec());
        self.dispatch(record);
    }

    pub fn log_image(
        &self,
        domain: Option<Domain>,
        level: Level,
        width: u32,
        height: u32,
        data: &[u8],
    ) {
        let mut record = LogRecord::new(MessageType::Log, 0);
        record.level = level as u16;
        record.domain = domain.map(|domain| domain.as_str().to_string());
        record.payload = Payload::Image(ImageData {
            data: data.to_vec(),
            width,
            height,
        });
        self.dispatch(record);
    }

    /// Opens a block; viewers group everything until the matching
    /// [`end_block`](Self::end_block) under it.
    pub fn start_block(&self, title: &str) {
        let mut record = LogRecord::new(MessageType::BlockStart, 0);
        record.payload = Payload::Text(title.to_string());
        self.dispatch(record);
    }

    pub fn end_block(&self) {
        self.dispatch(LogRecord::new(MessageType::BlockEnd, 0));
    }

    /// Places a mark, a visual separator without payload semantics.
    pub fn log_mark(&self, title: Option<&str>) {
        let mut record = LogRecord::new(MessageType::Mark, 0);
        if let Some(title) = title {
            record.payload = Payload::Text(title.to_string());
        }
        self.dispatch(record);
    }

    /// Records silently dropped so far by the queue policies.
    pub fn dropped_records(&self) -> u64 {
        self.inner
            .shared
            .state
            .lock()
            .map(|state| state.dropped_records)
            .unwrap_or(0)
    }

    /// Number of successful reconnections since startup.
    pub fn reconnections(&self) -> u32 {
        self.inner
            .shared
            .state
            .lock()
            .map(|state| state.reconnections)
            .unwrap_or(0)
    }

    /// Cooperative shutdown: closes the transport, discards queued records
    /// and joins the worker thread. Idempotent.
    pub fn stop(&self) {
        let already = match self.inner.shared.state.lock() {
            Ok(mut state) => std::mem::replace(&mut state.quit, true),
            Err(_) => true,
        };
        if !already {
            self.inner.shared.send_control(ControlEvent::Quit);
        }
        let handle = self
            .inner
            .worker
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn dispatch(&self, mut record: LogRecord) {
        self.ensure_worker();

        if self
            .inner
            .config
            .options
            .contains(LoggerOptions::LOG_TO_CONSOLE)
        {
            echo_to_console(&record);
        }

        let wants_flush = self
            .inner
            .config
            .options
            .contains(LoggerOptions::FLUSH_EACH_MESSAGE);
        let (ack_tx, ack_rx) = if wants_flush {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let queued = match self.inner.shared.state.lock() {
            Ok(mut state) => {
                record.sequence = state.alloc_sequence();
                state.enqueue(
                    QueuedRecord {
                        record,
                        ack: ack_tx,
                    },
                    &self.inner.config,
                )
            }
            Err(_) => false,
        };

        if queued {
            self.inner.shared.wake();
            if let Some(rx) = ack_rx {
                // Blocks until the record's bytes were handed to the
                // transport, or the worker dropped the channel on shutdown.
                let _ = rx.recv();
            }
        }
    }

    fn ensure_worker(&self) {
        let inner = &self.inner;
        inner.start_worker.call_once(|| {
            let control_rx = inner
                .control_rx_slot
                .lock()
                .ok()
                .and_then(|mut slot| slot.take());
            let control_rx = match control_rx {
                Some(rx) => rx,
                None => return,
            };
            let discovery = inner
                .discovery_slot
                .lock()
                .ok()
                .and_then(|mut slot| slot.take());
            let shared = inner.shared.clone();
            let config = inner.config.clone();
            let identity = inner.identity.clone();

            let spawned = thread::Builder::new()
                .name(String::from("nslogger-worker"))
                .spawn(move || match MessageWorker::new(
                    shared, config, identity, control_rx, discovery,
                ) {
                    Ok(worker) => worker.run(),
                    Err(e) => {
                        log::warn!(target: "NSLogger", "cannot start logging thread: {}", e)
                    }
                });
            match spawned {
                Ok(handle) => {
                    if let Ok(mut slot) = inner.worker.lock() {
                        *slot = Some(handle);
                    }
                }
                Err(e) => log::warn!(target: "NSLogger", "cannot spawn logging thread: {}", e),
            }
        });
    }
}

impl Default for Logger {
    fn default() -> Logger {
        Logger::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Signal the worker without joining; dropping a logger from an
        // arbitrary thread must not block.
        if let Ok(mut state) = self.shared.state.lock() {
            state.quit = true;
        }
        self.shared.wake();
    }
}

fn initial_remote(config: &ClientConfig) -> Option<RemoteTarget> {
    if let Some(ref path) = config.file_path {
        return Some(RemoteTarget::File(path.clone()));
    }
    config.remote_host.as_ref().map(|(host, port)| RemoteTarget::Tcp {
        host: host.clone(),
        port: *port,
        use_tls: config.options.contains(LoggerOptions::USE_SSL),
    })
}

cfg_if::cfg_if! {
    if #[cfg(feature = "bonjour")] {
        fn default_discovery() -> Option<Box<dyn DiscoverySource>> {
            Some(Box::new(crate::discovery::BonjourDiscovery::new()))
        }
    } else {
        fn default_discovery() -> Option<Box<dyn DiscoverySource>> {
            None
        }
    }
}

/// Human-readable stderr rendition used by the console option.
fn echo_to_console(record: &LogRecord) {
    let when = chrono::DateTime::from_timestamp(
        record.timestamp.seconds as i64,
        record.timestamp.microseconds.saturating_mul(1000),
    )
    .map(|utc| {
        utc.with_timezone(&chrono::Local)
            .format("%H:%M:%S%.6f")
            .to_string()
    })
    .unwrap_or_default();

    let body = match record.payload {
        Payload::Text(ref text) => text.clone(),
        Payload::Binary(ref data) => format!("<{} bytes>", data.len()),
        Payload::Image(ref image) => {
            format!("<image {}x{}>", image.width, image.height)
        }
        Payload::Empty => match record.message_type {
            MessageType::BlockEnd => String::from("<block end>"),
            MessageType::Mark => String::from("<mark>"),
            _ => String::new(),
        },
    };
    eprintln!(
        "{} | {} | {} | {} | {}",
        when,
        record.domain.as_deref().unwrap_or("-"),
        record.level,
        record.thread_id,
        body
    );
}
