//! Write-side transport owned by the transmit worker: a plain socket, a
//! TLS-wrapped socket, or a local buffer file.

use std::fs::File;
use std::io::{self, Read, Write};

use mio::net::TcpStream;

#[cfg(feature = "tls")]
use openssl::ssl::{HandshakeError, MidHandshakeSslStream, SslConnector, SslStream};

#[cfg(feature = "tls")]
use crate::client::DEBUG_LOGGER;

pub enum WriteStream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    TlsHandshake(Option<MidHandshakeSslStream<TcpStream>>),
    #[cfg(feature = "tls")]
    Tls(SslStream<TcpStream>),
    File(io::BufWriter<File>),
}

impl WriteStream {
    /// Whether the connect/handshake phase is over and bytes can flow.
    pub fn is_ready(&self) -> bool {
        match *self {
            WriteStream::Tcp(_) | WriteStream::File(_) => true,
            #[cfg(feature = "tls")]
            WriteStream::Tls(_) => true,
            #[cfg(feature = "tls")]
            WriteStream::TlsHandshake(_) => false,
        }
    }

    /// True when the transport writes to a local file rather than a socket.
    pub fn is_file(&self) -> bool {
        matches!(*self, WriteStream::File(_))
    }

    /// Checks whether a non-blocking connect has completed on the underlying
    /// socket. `Ok(false)` means still in progress.
    pub fn connect_complete(&self) -> io::Result<bool> {
        let stream = match self.socket() {
            Some(stream) => stream,
            None => return Ok(true),
        };
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            // Pending connects surface as NotConnected or WouldBlock
            // depending on the platform.
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Starts a TLS handshake over an already-connected socket.
    #[cfg(feature = "tls")]
    pub fn start_tls(self, connector: &SslConnector, domain: &str) -> io::Result<WriteStream> {
        let stream = match self {
            WriteStream::Tcp(stream) => stream,
            other => return Ok(other),
        };
        let config = connector
            .configure()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        match config.connect(domain, stream) {
            Ok(tls) => Ok(WriteStream::Tls(tls)),
            Err(HandshakeError::WouldBlock(mid)) => Ok(WriteStream::TlsHandshake(Some(mid))),
            Err(e) => Err(handshake_io_error(e)),
        }
    }

    /// Drives an in-progress TLS handshake one step. Returns `true` once the
    /// stream is established.
    #[cfg(feature = "tls")]
    pub fn continue_handshake(&mut self) -> io::Result<bool> {
        let mid = match *self {
            WriteStream::TlsHandshake(ref mut slot) => match slot.take() {
                Some(mid) => mid,
                None => return Ok(false),
            },
            _ => return Ok(true),
        };
        match mid.handshake() {
            Ok(tls) => {
                if DEBUG_LOGGER {
                    log::info!(target: "NSLogger", "TLS handshake complete");
                }
                *self = WriteStream::Tls(tls);
                Ok(true)
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                *self = WriteStream::TlsHandshake(Some(mid));
                Ok(false)
            }
            Err(e) => Err(handshake_io_error(e)),
        }
    }

    /// Peer-close probe: the viewer never talks back, so readable data on the
    /// socket normally means EOF or reset.
    pub fn peer_closed(&mut self) -> io::Result<bool> {
        let mut probe = [0u8; 64];
        let read = match *self {
            WriteStream::Tcp(ref mut stream) => stream.read(&mut probe),
            #[cfg(feature = "tls")]
            WriteStream::Tls(ref mut stream) => stream.read(&mut probe),
            #[cfg(feature = "tls")]
            WriteStream::TlsHandshake(_) => return Ok(false),
            WriteStream::File(_) => return Ok(false),
        };
        match read {
            Ok(0) => Ok(true),
            Ok(_) => Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn socket(&self) -> Option<&TcpStream> {
        match *self {
            WriteStream::Tcp(ref stream) => Some(stream),
            #[cfg(feature = "tls")]
            WriteStream::Tls(ref stream) => Some(stream.get_ref()),
            #[cfg(feature = "tls")]
            WriteStream::TlsHandshake(ref slot) => slot.as_ref().map(|mid| mid.get_ref()),
            WriteStream::File(_) => None,
        }
    }
}

impl Write for WriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            WriteStream::Tcp(ref mut stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            WriteStream::Tls(ref mut stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            WriteStream::TlsHandshake(_) => Err(io::ErrorKind::WouldBlock.into()),
            WriteStream::File(ref mut stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            WriteStream::Tcp(ref mut stream) => stream.flush(),
            #[cfg(feature = "tls")]
            WriteStream::Tls(ref mut stream) => stream.flush(),
            #[cfg(feature = "tls")]
            WriteStream::TlsHandshake(_) => Ok(()),
            WriteStream::File(ref mut stream) => stream.flush(),
        }
    }
}

#[cfg(feature = "tls")]
fn handshake_io_error(err: HandshakeError<TcpStream>) -> io::Error {
    match err {
        HandshakeError::SetupFailure(stack) => io::Error::new(io::ErrorKind::Other, stack),
        HandshakeError::Failure(mid) => {
            io::Error::new(io::ErrorKind::Other, mid.error().to_string())
        }
        HandshakeError::WouldBlock(_) => io::ErrorKind::WouldBlock.into(),
    }
}
