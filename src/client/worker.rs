//! The transmit worker: one thread owning the discovery handle, the pending
//! queue drain, the send arena, the transport and the connection state
//! machine. Application threads never touch any of this directly; they only
//! enqueue records and wake the worker.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::client::state::{ControlEvent, QueuedRecord, RemoteTarget, Shared};
use crate::client::transport::WriteStream;
use crate::client::{ClientConfig, LoggerOptions, DEBUG_LOGGER};
use crate::codec;
use crate::discovery::{
    BrowseQuery, DiscoverySource, ServiceFound, SERVICE_TYPE_PLAIN, SERVICE_TYPE_TLS,
};
use crate::record::ClientIdentity;

const WAKE_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);

/// Stop encoding queued records into the arena once this many bytes are
/// pending; the rest stays queued until the transport catches up.
const ARENA_FILL_TARGET: usize = 256 * 1024;

/// Connection lifecycle. `Draining` and `Streaming` are both connected:
/// `Draining` has arena bytes waiting on the transport, `Streaming` is idle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Discovering,
    Resolving,
    Connecting,
    Handshaking,
    Streaming,
    Draining,
    Disconnected,
    Terminated,
}

struct Backoff {
    next: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Backoff {
        Backoff { next: min, min, max }
    }

    fn reset(&mut self) {
        self.next = self.min;
    }

    fn advance(&mut self) -> Duration {
        use rand::Rng;
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let delay = self.next.mul_f64(jitter);
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

struct FrameSlot {
    start: usize,
    ack: Option<mpsc::SyncSender<()>>,
}

/// Contiguous outbound byte arena with a `(used, offset)` cursor, where
/// `used` is `buf.len()`. Frame boundaries are tracked so a partially-sent
/// frame can be re-sent whole after a disconnection.
pub(crate) struct SendArena {
    buf: Vec<u8>,
    offset: usize,
    frames: VecDeque<FrameSlot>,
}

impl SendArena {
    pub(crate) fn new() -> SendArena {
        SendArena {
            buf: Vec::with_capacity(4096),
            offset: 0,
            frames: VecDeque::new(),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub(crate) fn push_frame(&mut self, bytes: &[u8], ack: Option<mpsc::SyncSender<()>>) {
        self.frames.push_back(FrameSlot {
            start: self.buf.len(),
            ack,
        });
        self.buf.extend_from_slice(bytes);
    }

    /// Inserts a frame in front of everything unsent. Only valid while no
    /// frame is partially written, i.e. right after connection establishment.
    pub(crate) fn push_front_frame(&mut self, bytes: &[u8]) {
        debug_assert!(self
            .frames
            .front()
            .map_or(true, |slot| slot.start >= self.offset));
        let inserted = bytes.len();
        self.buf
            .splice(self.offset..self.offset, bytes.iter().copied());
        for slot in self.frames.iter_mut() {
            slot.start += inserted;
        }
        self.frames.push_front(FrameSlot {
            start: self.offset,
            ack: None,
        });
    }

    /// Writes `[offset, used)` to the transport, advancing the cursor and
    /// acknowledging fully-sent frames. `Ok(true)` means the arena drained.
    pub(crate) fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while self.offset < self.buf.len() {
            match writer.write(&self.buf[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    self.offset += written;
                    self.release_sent();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.buf.clear();
        self.offset = 0;
        self.frames.clear();
        Ok(true)
    }

    /// After a disconnection: moves the cursor back to the start of the
    /// first incompletely-sent frame so it is re-sent whole.
    pub(crate) fn rewind_to_frame_boundary(&mut self) {
        match self.frames.front() {
            Some(front) => {
                if self.offset > front.start {
                    self.offset = front.start;
                }
            }
            None => {
                // Everything was released.
                self.buf.clear();
                self.offset = 0;
            }
        }
        self.compact();
    }

    /// Drops everything, including unsent frames and their acknowledgement
    /// channels. Used on termination only.
    pub(crate) fn abandon(&mut self) {
        self.buf.clear();
        self.offset = 0;
        self.frames.clear();
    }

    fn release_sent(&mut self) {
        loop {
            let end = match self.frames.front() {
                None => break,
                Some(_) => self
                    .frames
                    .get(1)
                    .map_or(self.buf.len(), |next| next.start),
            };
            if end > self.offset {
                break;
            }
            if let Some(slot) = self.frames.pop_front() {
                if let Some(ack) = slot.ack {
                    let _ = ack.try_send(());
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.offset == 0 {
            return;
        }
        let released = self.offset;
        self.buf.drain(..released);
        for slot in self.frames.iter_mut() {
            slot.start -= released;
        }
        self.offset = 0;
    }
}

struct ResolvedTarget {
    addrs: Vec<SocketAddr>,
    next_addr: usize,
    host: String,
    use_tls: bool,
}

pub struct MessageWorker {
    shared: Arc<Shared>,
    config: ClientConfig,
    identity: ClientIdentity,
    control_rx: mpsc::Receiver<ControlEvent>,
    discovery: Option<Box<dyn DiscoverySource>>,
    poll: Poll,
    events: Events,
    phase: Phase,
    stream: Option<WriteStream>,
    arena: SendArena,
    backoff: Backoff,
    connect_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    target: Option<ResolvedTarget>,
    had_session: bool,
    #[cfg(feature = "tls")]
    connector: Option<openssl::ssl::SslConnector>,
}

impl MessageWorker {
    pub fn new(
        shared: Arc<Shared>,
        config: ClientConfig,
        identity: ClientIdentity,
        control_rx: mpsc::Receiver<ControlEvent>,
        discovery: Option<Box<dyn DiscoverySource>>,
    ) -> io::Result<MessageWorker> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        shared.set_waker(Arc::new(waker));

        #[cfg(feature = "tls")]
        let connector = match crate::tls::build_connector(&config.tls) {
            Ok(connector) => Some(connector),
            Err(e) => {
                log::warn!(target: "NSLogger", "TLS connector unavailable: {}", e);
                None
            }
        };

        let backoff = Backoff::new(config.retry_min, config.retry_max);
        Ok(MessageWorker {
            shared,
            config,
            identity,
            control_rx,
            discovery,
            poll,
            events: Events::with_capacity(16),
            phase: Phase::Idle,
            stream: None,
            arena: SendArena::new(),
            backoff,
            connect_deadline: None,
            retry_deadline: None,
            target: None,
            had_session: false,
            #[cfg(feature = "tls")]
            connector,
        })
    }

    pub fn run(mut self) {
        if DEBUG_LOGGER {
            log::info!(target: "NSLogger", "logging thread starting up");
        }

        self.start();

        while self.phase != Phase::Terminated {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!(target: "NSLogger", "poll failed, terminating: {}", e);
                break;
            }

            let mut socket_readable = false;
            let mut socket_writable = false;
            for event in self.events.iter() {
                if event.token() == SOCKET_TOKEN {
                    socket_readable |= event.is_readable() || event.is_read_closed();
                    socket_writable |= event.is_writable();
                }
            }

            self.drain_control();
            if self.phase == Phase::Terminated {
                break;
            }
            self.advance(socket_readable, socket_writable);
        }

        self.shutdown();
    }

    // -- state machine -----------------------------------------------------

    fn start(&mut self) {
        let remote = self
            .shared
            .state
            .lock()
            .ok()
            .and_then(|state| state.remote.clone());
        match remote {
            Some(RemoteTarget::File(path)) => self.open_file(path),
            Some(RemoteTarget::Tcp {
                host,
                port,
                use_tls,
            }) => self.begin_connect_host(host, port, use_tls),
            None => {
                if self.config.options.contains(LoggerOptions::BROWSE_BONJOUR)
                    && self.discovery.is_some()
                {
                    self.begin_browse();
                } else {
                    self.phase = Phase::Idle;
                }
            }
        }
    }

    fn drain_control(&mut self) {
        while let Ok(event) = self.control_rx.try_recv() {
            match event {
                ControlEvent::Quit => {
                    self.phase = Phase::Terminated;
                    return;
                }
                ControlEvent::RemoteChanged => {
                    if DEBUG_LOGGER {
                        log::info!(target: "NSLogger", "remote target changed");
                    }
                    self.teardown_stream();
                    self.retry_deadline = None;
                    self.start();
                }
                ControlEvent::ServiceFound(service) => self.on_service_found(service),
            }
        }
        if self
            .shared
            .state
            .lock()
            .map(|state| state.quit)
            .unwrap_or(true)
        {
            self.phase = Phase::Terminated;
        }
    }

    fn advance(&mut self, socket_readable: bool, socket_writable: bool) {
        match self.phase {
            Phase::Connecting => {
                if socket_readable || socket_writable {
                    match self.stream.as_ref().map(WriteStream::connect_complete) {
                        Some(Ok(true)) => self.on_socket_connected(),
                        Some(Ok(false)) | None => {}
                        Some(Err(e)) => {
                            if DEBUG_LOGGER {
                                log::info!(target: "NSLogger", "connect failed: {}", e);
                            }
                            self.stream = None;
                            self.connect_next_addr();
                        }
                    }
                }
                self.check_connect_deadline();
            }
            Phase::Handshaking => {
                #[cfg(feature = "tls")]
                self.drive_handshake();
                self.check_connect_deadline();
            }
            Phase::Streaming | Phase::Draining => {
                if socket_readable {
                    let closed = self
                        .stream
                        .as_mut()
                        .map(WriteStream::peer_closed)
                        .unwrap_or(Ok(false));
                    match closed {
                        Ok(false) => {}
                        Ok(true) => {
                            self.on_disconnect(io::Error::new(
                                io::ErrorKind::ConnectionAborted,
                                "peer closed connection",
                            ));
                            return;
                        }
                        Err(e) => {
                            self.on_disconnect(e);
                            return;
                        }
                    }
                }
                self.pump();
            }
            Phase::Disconnected => self.check_retry_deadline(),
            Phase::Idle | Phase::Discovering | Phase::Resolving => {}
            Phase::Terminated => {}
        }
    }

    fn begin_browse(&mut self) {
        let service_type = if self.config.options.contains(LoggerOptions::USE_SSL) {
            SERVICE_TYPE_TLS
        } else {
            SERVICE_TYPE_PLAIN
        };
        let query = BrowseQuery {
            service_type: service_type.to_string(),
            only_local_domain: self
                .config
                .options
                .contains(LoggerOptions::BROWSE_ONLY_LOCAL_DOMAIN),
            name_filter: self.config.bonjour_service_name.clone(),
        };
        let shared = self.shared.clone();
        let sink = Box::new(move |service: ServiceFound| {
            shared.send_control(ControlEvent::ServiceFound(service));
        });

        match self.discovery.as_mut() {
            Some(discovery) => match discovery.browse(query, sink) {
                Ok(()) => {
                    if DEBUG_LOGGER {
                        log::info!(target: "NSLogger", "browsing for {}", service_type);
                    }
                    self.phase = Phase::Discovering;
                }
                Err(e) => {
                    log::warn!(target: "NSLogger", "discovery failed to start: {}", e);
                    self.phase = Phase::Idle;
                }
            },
            None => self.phase = Phase::Idle,
        }
    }

    fn on_service_found(&mut self, service: ServiceFound) {
        if self.phase != Phase::Discovering {
            return;
        }
        if let Some(ref wanted) = self.config.bonjour_service_name {
            if *wanted != service.service_name {
                return;
            }
        }
        if DEBUG_LOGGER {
            log::info!(target: "NSLogger",
                       "service found: {:?} at {}:{}",
                       service.service_name, service.host, service.port);
        }

        self.phase = Phase::Resolving;
        let resolved = self
            .discovery
            .as_mut()
            .and_then(|discovery| discovery.resolve(&service.service_name).ok())
            .filter(|addrs| !addrs.is_empty());
        let addrs = match resolved {
            Some(addrs) => addrs,
            None => match crate::discovery::resolve_host_port(&service.host, service.port) {
                Ok(addrs) => addrs,
                Err(e) => {
                    log::warn!(target: "NSLogger", "cannot resolve {:?}: {}", service.service_name, e);
                    self.phase = Phase::Discovering;
                    return;
                }
            },
        };

        let use_tls =
            service.requires_tls || self.config.options.contains(LoggerOptions::USE_SSL);
        self.target = Some(ResolvedTarget {
            addrs,
            next_addr: 0,
            host: service.host,
            use_tls,
        });
        self.connect_next_addr();
    }

    fn begin_connect_host(&mut self, host: String, port: u16, use_tls: bool) {
        self.phase = Phase::Resolving;
        match crate::discovery::resolve_host_port(&host, port) {
            Ok(addrs) => {
                self.target = Some(ResolvedTarget {
                    addrs,
                    next_addr: 0,
                    host,
                    use_tls,
                });
                self.connect_next_addr();
            }
            Err(e) => {
                log::warn!(target: "NSLogger", "cannot resolve {}:{}: {}", host, port, e);
                self.schedule_retry();
            }
        }
    }

    fn connect_next_addr(&mut self) {
        loop {
            let addr = match self.target.as_mut() {
                Some(target) => {
                    let addr = target.addrs.get(target.next_addr).copied();
                    target.next_addr += 1;
                    addr
                }
                None => None,
            };
            let addr = match addr {
                Some(addr) => addr,
                None => {
                    self.schedule_retry();
                    return;
                }
            };

            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        SOCKET_TOKEN,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!(target: "NSLogger", "register failed: {}", e);
                        continue;
                    }
                    if DEBUG_LOGGER {
                        log::info!(target: "NSLogger", "connecting to {}", addr);
                    }
                    self.stream = Some(WriteStream::Tcp(stream));
                    self.phase = Phase::Connecting;
                    self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
                    return;
                }
                Err(e) => {
                    if DEBUG_LOGGER {
                        log::info!(target: "NSLogger", "connect to {} failed: {}", addr, e);
                    }
                }
            }
        }
    }

    fn on_socket_connected(&mut self) {
        self.connect_deadline = None;
        let use_tls = self.target.as_ref().map_or(false, |target| target.use_tls);
        if !use_tls {
            self.on_transport_ready();
            return;
        }

        #[cfg(feature = "tls")]
        {
            let connector = match self.connector {
                Some(ref connector) => connector.clone(),
                None => {
                    self.on_disconnect(io::Error::new(
                        io::ErrorKind::Other,
                        "TLS required but connector unavailable",
                    ));
                    return;
                }
            };
            let host = self
                .target
                .as_ref()
                .map(|target| target.host.clone())
                .unwrap_or_default();
            let stream = match self.stream.take() {
                Some(stream) => stream,
                None => return,
            };
            if DEBUG_LOGGER {
                log::info!(target: "NSLogger", "starting TLS handshake with {}", host);
            }
            match stream.start_tls(&connector, &host) {
                Ok(stream) => {
                    let ready = stream.is_ready();
                    self.stream = Some(stream);
                    if ready {
                        self.on_transport_ready();
                    } else {
                        self.phase = Phase::Handshaking;
                        self.connect_deadline =
                            Some(Instant::now() + self.config.connect_timeout);
                    }
                }
                Err(e) => self.on_disconnect(e),
            }
        }

        #[cfg(not(feature = "tls"))]
        {
            self.on_disconnect(io::Error::new(
                io::ErrorKind::Other,
                "TLS required but built without the tls feature",
            ));
        }
    }

    #[cfg(feature = "tls")]
    fn drive_handshake(&mut self) {
        let done = match self.stream.as_mut() {
            Some(stream) => stream.continue_handshake(),
            None => return,
        };
        match done {
            Ok(true) => self.on_transport_ready(),
            Ok(false) => {}
            Err(e) => self.on_disconnect(e),
        }
    }

    fn on_transport_ready(&mut self) {
        self.connect_deadline = None;
        self.backoff.reset();
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop_browsing();
        }

        let continuation = self.had_session;
        self.had_session = true;
        if let Ok(mut state) = self.shared.state.lock() {
            if continuation {
                state.reconnections += 1;
            }
            state.streaming = true;
        }
        if DEBUG_LOGGER {
            log::info!(target: "NSLogger",
                       "transport ready (continuation: {})", continuation);
        }

        // The same run identity is announced as the first frame of every
        // connection, which is what lets the viewer merge reconnections.
        self.arena
            .push_front_frame(&codec::encode_client_info(&self.identity));
        self.phase = Phase::Draining;
        self.pump();
    }

    fn pump(&mut self) {
        loop {
            if self.arena.pending() < ARENA_FILL_TARGET {
                let drained = match self.shared.state.lock() {
                    Ok(mut state) => {
                        if state.queue.is_empty() {
                            Vec::new()
                        } else {
                            state.drain_queue()
                        }
                    }
                    Err(_) => Vec::new(),
                };
                for QueuedRecord { record, ack } in drained {
                    self.arena.push_frame(&codec::encode_record(&record), ack);
                }
            }

            if self.arena.is_empty() {
                self.phase = Phase::Streaming;
                return;
            }

            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };
            match self.arena.write_to(stream) {
                Ok(true) => {
                    if stream.is_file() {
                        let _ = stream.flush();
                    }
                    // Check for records queued while writing.
                }
                Ok(false) => {
                    self.phase = Phase::Draining;
                    return;
                }
                Err(e) => {
                    self.on_disconnect(e);
                    return;
                }
            }
        }
    }

    fn on_disconnect(&mut self, err: io::Error) {
        log::warn!(target: "NSLogger", "connection lost: {}", err);
        self.teardown_stream();
        self.arena.rewind_to_frame_boundary();
        self.schedule_retry();
    }

    fn teardown_stream(&mut self) {
        self.stream = None;
        self.connect_deadline = None;
        self.target = None;
        if let Ok(mut state) = self.shared.state.lock() {
            state.streaming = false;
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.advance();
        self.retry_deadline = Some(Instant::now() + delay);
        self.phase = Phase::Disconnected;
        if DEBUG_LOGGER {
            log::info!(target: "NSLogger", "next connection attempt in {:?}", delay);
        }
    }

    fn check_connect_deadline(&mut self) {
        if let Some(deadline) = self.connect_deadline {
            if Instant::now() >= deadline {
                self.on_disconnect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection attempt timed out",
                ));
            }
        }
    }

    fn check_retry_deadline(&mut self) {
        let due = match self.retry_deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        };
        if !due {
            return;
        }
        self.retry_deadline = None;

        let remote = self
            .shared
            .state
            .lock()
            .ok()
            .and_then(|state| state.remote.clone());
        match remote {
            Some(RemoteTarget::Tcp {
                host,
                port,
                use_tls,
            }) => self.begin_connect_host(host, port, use_tls),
            Some(RemoteTarget::File(_)) => {
                // File targets do not reconnect.
                self.phase = Phase::Idle;
            }
            None => {
                if self.config.options.contains(LoggerOptions::BROWSE_BONJOUR)
                    && self.discovery.is_some()
                {
                    self.begin_browse();
                } else {
                    self.phase = Phase::Idle;
                }
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let deadline = match (self.connect_deadline, self.retry_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn open_file(&mut self, path: PathBuf) {
        match File::create(&path) {
            Ok(file) => {
                let mut writer = BufWriter::new(file);
                if let Err(e) = codec::write_session_header(&mut writer) {
                    log::warn!(target: "NSLogger", "cannot write session header: {}", e);
                    self.phase = Phase::Idle;
                    return;
                }
                if DEBUG_LOGGER {
                    log::info!(target: "NSLogger", "streaming to file {:?}", path);
                }
                self.stream = Some(WriteStream::File(writer));
                self.on_transport_ready();
            }
            Err(e) => {
                log::warn!(target: "NSLogger", "cannot open {:?}: {}", path, e);
                self.phase = Phase::Idle;
            }
        }
    }

    fn shutdown(&mut self) {
        if DEBUG_LOGGER {
            log::info!(target: "NSLogger", "logging thread stopping");
        }

        let leftovers = match self.shared.state.lock() {
            Ok(mut state) => {
                state.quit = true;
                state.streaming = false;
                state.drain_queue()
            }
            Err(_) => Vec::new(),
        };

        // Best-effort final drain; whatever the transport refuses is
        // discarded, the records are advisory telemetry.
        if let Some(ref mut stream) = self.stream {
            if stream.is_ready() {
                for QueuedRecord { record, ack } in leftovers {
                    self.arena.push_frame(&codec::encode_record(&record), ack);
                }
                let _ = self.arena.write_to(stream);
                let _ = stream.flush();
            }
        }

        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop_browsing();
        }
        self.arena.abandon();
        self.stream = None;
        self.phase = Phase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogRecord, MessageType, Payload};

    /// Accepts a limited number of bytes, then reports WouldBlock.
    struct LimitedWriter {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl LimitedWriter {
        fn new(budget: usize) -> LimitedWriter {
            LimitedWriter {
                accepted: Vec::new(),
                budget,
            }
        }
    }

    impl Write for LimitedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.budget.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(seq: u32, text: &str) -> Vec<u8> {
        let mut record = LogRecord::new(MessageType::Log, seq);
        record.payload = Payload::Text(text.to_string());
        codec::encode_record(&record)
    }

    #[test]
    fn arena_drains_and_acknowledges() {
        let mut arena = SendArena::new();
        let (tx, rx) = mpsc::sync_channel(1);
        arena.push_frame(&frame(1, "one"), Some(tx));
        arena.push_frame(&frame(2, "two"), None);

        let mut sink = LimitedWriter::new(usize::MAX);
        assert!(arena.write_to(&mut sink).unwrap());
        assert!(arena.is_empty());
        rx.try_recv().unwrap();
    }

    #[test]
    fn partial_frame_is_resent_whole_after_rewind() {
        let mut arena = SendArena::new();
        let first = frame(1, "first");
        let second = frame(2, "second");
        let third = frame(3, "third");
        arena.push_frame(&first, None);
        arena.push_frame(&second, None);
        arena.push_frame(&third, None);

        // Accept the first frame and half of the second, then stall.
        let cut = first.len() + second.len() / 2;
        let mut sink = LimitedWriter::new(cut);
        assert!(!arena.write_to(&mut sink).unwrap());
        assert_eq!(sink.accepted.len(), cut);

        // Connection dies; the cursor rewinds to the second frame's start.
        arena.rewind_to_frame_boundary();
        let mut expected = second.clone();
        expected.extend_from_slice(&third);
        assert_eq!(arena.pending(), expected.len());

        let mut resend = LimitedWriter::new(usize::MAX);
        assert!(arena.write_to(&mut resend).unwrap());
        assert_eq!(resend.accepted, expected);
    }

    #[test]
    fn client_info_is_spliced_in_front_of_backlog() {
        let mut arena = SendArena::new();
        let backlog = frame(4, "backlog");
        arena.push_frame(&backlog, None);
        arena.rewind_to_frame_boundary();

        let info = frame(0, "info-stand-in");
        arena.push_front_frame(&info);

        let mut sink = LimitedWriter::new(usize::MAX);
        assert!(arena.write_to(&mut sink).unwrap());
        let mut expected = info;
        expected.extend_from_slice(&backlog);
        assert_eq!(sink.accepted, expected);
    }

    #[test]
    fn fully_released_arena_resets_on_rewind() {
        let mut arena = SendArena::new();
        arena.push_frame(&frame(1, "only"), None);
        let mut sink = LimitedWriter::new(usize::MAX);
        assert!(arena.write_to(&mut sink).unwrap());
        arena.rewind_to_frame_boundary();
        assert!(arena.is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_cap_with_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let first = backoff.advance();
        assert!(first >= Duration::from_millis(400) && first <= Duration::from_millis(600));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.advance();
        }
        // Capped: 30s nominal, 20% jitter either way.
        assert!(last <= Duration::from_secs(36));
        assert!(last >= Duration::from_secs(24));
        backoff.reset();
        let again = backoff.advance();
        assert!(again <= Duration::from_millis(600));
    }
}
