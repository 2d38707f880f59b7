//! Viewer-side connection core: accepts client connections over direct TCP
//! (optionally TLS-wrapped, optionally announced through discovery), reads
//! and decodes frames on one thread per connection, and delivers ordered
//! batches to the consumer delegate.

pub mod session;

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{DecodedFrame, FrameDecoder};
use crate::discovery::{DiscoveryPublisher, PublishHandle, TXT_KEY_TLS};
use crate::error::{Error, ProtocolError};
use crate::viewer::session::{ConnectionDelegate, ConnectionSession};

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub publishes_bonjour_service: bool,
    pub bonjour_service_name: Option<String>,
    pub has_direct_tcp_responder: bool,
    /// Port for the direct TCP responder; 0 picks an ephemeral port.
    pub direct_tcp_responder_port: u16,
    /// When false, a reconnection carrying an already-known `unique_id` is
    /// merged into the existing session instead of starting a new one.
    pub keep_multiple_runs: bool,
    pub close_without_saving: bool,
    /// Batch delivery bounds: a batch is flushed to the delegate when it
    /// reaches this many records...
    pub batch_max_records: usize,
    /// ...or when this much time has passed since the previous flush.
    pub batch_max_delay: Duration,
    #[cfg(feature = "tls")]
    pub tls: Option<crate::tls::TlsServerIdentity>,
}

impl Default for ViewerConfig {
    fn default() -> ViewerConfig {
        ViewerConfig {
            publishes_bonjour_service: false,
            bonjour_service_name: None,
            has_direct_tcp_responder: true,
            direct_tcp_responder_port: 0,
            keep_multiple_runs: false,
            close_without_saving: false,
            batch_max_records: 256,
            batch_max_delay: Duration::from_millis(100),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

struct ListenerInner {
    config: ViewerConfig,
    delegate: Arc<dyn ConnectionDelegate>,
    sessions: Mutex<Vec<Arc<Mutex<ConnectionSession>>>>,
    reader_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
    #[cfg(feature = "tls")]
    acceptor: Option<openssl::ssl::SslAcceptor>,
}

/// Accepts connections and owns the per-connection reader threads. Sessions
/// outlive their transports; they are discarded with the listener.
pub struct Listener {
    inner: Arc<ListenerInner>,
    accept_thread: Option<thread::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    publish_handle: Option<PublishHandle>,
}

impl Listener {
    /// Binds and starts accepting. Configuration problems (port in use, bad
    /// certificate) surface here, synchronously.
    pub fn start(
        config: ViewerConfig,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> Result<Listener, Error> {
        #[cfg(feature = "tls")]
        let acceptor = match config.tls {
            Some(ref identity) => Some(crate::tls::build_acceptor(identity)?),
            None => None,
        };

        let inner = Arc::new(ListenerInner {
            config,
            delegate,
            sessions: Mutex::new(Vec::new()),
            reader_threads: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            #[cfg(feature = "tls")]
            acceptor,
        });

        let mut listener = Listener {
            inner: inner.clone(),
            accept_thread: None,
            local_addr: None,
            publish_handle: None,
        };

        if inner.config.has_direct_tcp_responder {
            let port = inner.config.direct_tcp_responder_port;
            let socket = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
                Error::Configuration(format!("cannot bind responder port {}: {}", port, e))
            })?;
            socket.set_nonblocking(true).map_err(Error::Transport)?;
            listener.local_addr = socket.local_addr().ok();

            let accept_inner = inner.clone();
            let handle = thread::Builder::new()
                .name(String::from("nslogger-accept"))
                .spawn(move || accept_loop(accept_inner, socket))
                .map_err(Error::Transport)?;
            listener.accept_thread = Some(handle);
            log::info!(target: "NSLoggerViewer",
                       "listening on {:?}", listener.local_addr);
        }

        Ok(listener)
    }

    /// Like [`start`](Self::start), additionally announcing the responder
    /// through the given discovery publisher.
    pub fn start_with_publisher(
        config: ViewerConfig,
        delegate: Arc<dyn ConnectionDelegate>,
        publisher: &mut dyn DiscoveryPublisher,
    ) -> Result<Listener, Error> {
        let mut listener = Listener::start(config, delegate)?;
        if listener.inner.config.publishes_bonjour_service {
            let port = listener
                .local_addr
                .map(|addr| addr.port())
                .unwrap_or(listener.inner.config.direct_tcp_responder_port);
            let name = match listener.inner.config.bonjour_service_name {
                Some(ref name) => name.clone(),
                None => sys_info::hostname().unwrap_or_else(|_| String::from("NSLogger")),
            };
            let txt = if listener.requires_tls() {
                vec![(TXT_KEY_TLS.to_string(), String::from("1"))]
            } else {
                Vec::new()
            };
            listener.publish_handle = Some(publisher.publish(&name, port, &txt)?);
        }
        Ok(listener)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// All sessions seen so far, connected or not.
    pub fn sessions(&self) -> Vec<Arc<Mutex<ConnectionSession>>> {
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    /// Stops accepting, closes readers and joins all threads.
    pub fn shutdown(mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.publish_handle = None;
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let readers = self
            .inner
            .reader_threads
            .lock()
            .map(|mut threads| threads.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for handle in readers {
            let _ = handle.join();
        }
    }

    fn requires_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.inner.acceptor.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Fallback when shutdown() was not called; threads wind down on
        // their own once they notice the flag.
        self.inner.shutdown.store(true, Ordering::Relaxed);
    }
}

fn accept_loop(inner: Arc<ListenerInner>, socket: TcpListener) {
    while !inner.shutdown.load(Ordering::Relaxed) {
        match socket.accept() {
            Ok((stream, peer)) => {
                log::info!(target: "NSLoggerViewer", "connection from {}", peer);
                let conn_inner = inner.clone();
                let spawned = thread::Builder::new()
                    .name(String::from("nslogger-session"))
                    .spawn(move || serve_connection(conn_inner, stream, peer));
                match spawned {
                    Ok(handle) => {
                        if let Ok(mut threads) = inner.reader_threads.lock() {
                            threads.push(handle);
                        }
                    }
                    Err(e) => {
                        log::warn!(target: "NSLoggerViewer", "cannot spawn reader: {}", e)
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!(target: "NSLoggerViewer", "accept failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

enum ReadStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(openssl::ssl::SslStream<TcpStream>),
}

impl ReadStream {
    fn socket(&self) -> &TcpStream {
        match *self {
            ReadStream::Plain(ref stream) => stream,
            #[cfg(feature = "tls")]
            ReadStream::Tls(ref stream) => stream.get_ref(),
        }
    }
}

impl Read for ReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            ReadStream::Plain(ref mut stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            ReadStream::Tls(ref mut stream) => stream.read(buf),
        }
    }
}

fn serve_connection(inner: Arc<ListenerInner>, stream: TcpStream, peer: SocketAddr) {
    // Bound the handshake; a stalled client must not pin this thread.
    let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(10)));

    #[cfg(feature = "tls")]
    let mut transport = match inner.acceptor {
        Some(ref acceptor) => match acceptor.accept(stream) {
            Ok(tls) => ReadStream::Tls(tls),
            Err(e) => {
                log::warn!(target: "NSLoggerViewer", "TLS accept from {} failed: {}", peer, e);
                return;
            }
        },
        None => ReadStream::Plain(stream),
    };
    #[cfg(not(feature = "tls"))]
    let mut transport = ReadStream::Plain(stream);

    // From here on the read timeout doubles as the batch delivery clock.
    let _ = transport
        .socket()
        .set_read_timeout(Some(inner.config.batch_max_delay));

    let mut decoder = FrameDecoder::new();
    let mut session: Option<Arc<Mutex<ConnectionSession>>> = None;
    let mut chunk = [0u8; 16384];
    let mut last_flush = Instant::now();

    let outcome: Result<(), Error> = 'read: loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            break Ok(());
        }
        match transport.read(&mut chunk) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            let arc = match session {
                                Some(ref arc) => arc.clone(),
                                None => match adopt_session(&inner, &frame, peer) {
                                    Ok(arc) => {
                                        session = Some(arc.clone());
                                        arc
                                    }
                                    Err(e) => break 'read Err(Error::Protocol(e)),
                                },
                            };
                            match arc.lock() {
                                Ok(mut guard) => {
                                    if let Err(e) = guard.process_frame(frame) {
                                        break 'read Err(Error::Protocol(e));
                                    }
                                }
                                Err(_) => break 'read Ok(()),
                            };
                        }
                        Ok(None) => break,
                        Err(e) => break 'read Err(Error::Protocol(e)),
                    }
                }
                flush_batch(&inner, session.as_ref(), &mut last_flush, false);
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                flush_batch(&inner, session.as_ref(), &mut last_flush, true);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(Error::Transport(e)),
        }
    };

    if let Err(ref e) = outcome {
        log::warn!(target: "NSLoggerViewer", "session from {} terminated: {}", peer, e);
    }

    match session {
        Some(arc) => {
            if let Ok(mut guard) = arc.lock() {
                if let Some((batch, range)) = guard.take_batch() {
                    inner.delegate.did_receive_messages(&guard, &batch, range);
                }
                guard.mark_disconnected();
                inner.delegate.remote_disconnected(&guard);
            }
        }
        None => {
            // The connection died before announcing itself; the consumer
            // still gets its final notification.
            let mut orphan = ConnectionSession::new(peer);
            orphan.mark_disconnected();
            inner.delegate.remote_disconnected(&orphan);
        }
    }
}

/// Picks the session for an incoming connection based on its first frame:
/// a disconnected session carrying the same run identity is re-attached
/// (unless the viewer keeps runs separate), anything else gets a new one.
fn adopt_session(
    inner: &Arc<ListenerInner>,
    first: &DecodedFrame,
    peer: SocketAddr,
) -> Result<Arc<Mutex<ConnectionSession>>, ProtocolError> {
    let identity = first
        .identity
        .as_ref()
        .ok_or(ProtocolError::UnexpectedFirstFrame)?;

    if !inner.config.keep_multiple_runs && !identity.unique_id.is_empty() {
        if let Ok(sessions) = inner.sessions.lock() {
            for existing in sessions.iter() {
                if let Ok(mut guard) = existing.lock() {
                    let same_run = guard
                        .identity()
                        .map_or(false, |id| id.unique_id == identity.unique_id);
                    if same_run && !guard.connected() {
                        guard.reattach(peer);
                        log::info!(target: "NSLoggerViewer",
                                   "run {} reconnected from {}", identity.unique_id, peer);
                        return Ok(existing.clone());
                    }
                }
            }
        }
    }

    let session = Arc::new(Mutex::new(ConnectionSession::new(peer)));
    if let Ok(mut sessions) = inner.sessions.lock() {
        sessions.push(session.clone());
    }
    Ok(session)
}

fn flush_batch(
    inner: &Arc<ListenerInner>,
    session: Option<&Arc<Mutex<ConnectionSession>>>,
    last_flush: &mut Instant,
    timer_fired: bool,
) {
    let arc = match session {
        Some(arc) => arc,
        None => return,
    };
    if let Ok(mut guard) = arc.lock() {
        if guard.pending_len() == 0 {
            return;
        }
        let due = guard.pending_len() >= inner.config.batch_max_records
            || timer_fired
            || last_flush.elapsed() >= inner.config.batch_max_delay;
        if due {
            if let Some((batch, range)) = guard.take_batch() {
                inner.delegate.did_receive_messages(&guard, &batch, range);
            }
            *last_flush = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_bounds() {
        let config = ViewerConfig::default();
        assert!(config.has_direct_tcp_responder);
        assert_eq!(config.direct_tcp_responder_port, 0);
        assert!(!config.keep_multiple_runs);
        assert_eq!(config.batch_max_records, 256);
        assert_eq!(config.batch_max_delay, Duration::from_millis(100));
    }
}
