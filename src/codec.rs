//! Framed wire codec shared by the client and viewer.
//!
//! The wire is a stream of frames: a big-endian `u32` payload size followed
//! by that many bytes of typed, keyed parts. Frames are self-describing;
//! unknown keys are skipped using the part type to determine their length
//! and preserved verbatim so a decoded record re-encodes byte-identically.
//! All multi-byte integers are big-endian; conversion happens here and
//! nowhere else.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, ProtocolError};
use crate::record::{
    ClientIdentity, ImageData, LogRecord, MessageType, Payload, RawPart, Timeval,
};

/// Semantic role of a part. Fixed wire contract.
pub mod part_key {
    pub const MESSAGE_TYPE: u8 = 0;
    pub const TIMESTAMP: u8 = 1;
    pub const SEQUENCE: u8 = 2;
    pub const THREAD_ID: u8 = 3;
    pub const TAG: u8 = 4;
    pub const LEVEL: u8 = 5;
    pub const MESSAGE: u8 = 6;
    pub const IMAGE_WIDTH: u8 = 7;
    pub const IMAGE_HEIGHT: u8 = 8;
    pub const FILENAME: u8 = 9;
    pub const LINE_NUMBER: u8 = 10;
    pub const FUNCTION_NAME: u8 = 11;

    pub const CLIENT_NAME: u8 = 20;
    pub const CLIENT_VERSION: u8 = 21;
    pub const OS_NAME: u8 = 22;
    pub const OS_VERSION: u8 = 23;
    pub const CLIENT_DEVICE: u8 = 24;
    pub const CLIENT_UNIQUE_ID: u8 = 25;
}

/// Encoding of a part's payload.
pub mod part_type {
    pub const INT16: u8 = 0;
    pub const INT32: u8 = 1;
    pub const INT64: u8 = 2;
    pub const STRING: u8 = 3;
    pub const BINARY: u8 = 4;
    pub const IMAGE: u8 = 5;
    pub const TIMEVAL: u8 = 6;
}

/// Upper bound on a single frame. Anything larger is a protocol violation,
/// not a legitimate log record.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Magic prefix of a persisted session file.
pub const SESSION_MAGIC: [u8; 6] = *b"NSLGRF";
/// Current persisted-session version.
pub const SESSION_VERSION: u8 = 1;

/// One decoded frame: the record, plus the client identity when the frame
/// was CLIENT_INFO.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub record: LogRecord,
    pub identity: Option<ClientIdentity>,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn int16_part(key: u8, value: u16) -> (u8, Vec<u8>) {
    let mut body = vec![key, part_type::INT16, 0, 0];
    BigEndian::write_u16(&mut body[2..], value);
    (key, body)
}

fn int32_part(key: u8, value: u32) -> (u8, Vec<u8>) {
    let mut body = vec![key, part_type::INT32, 0, 0, 0, 0];
    BigEndian::write_u32(&mut body[2..], value);
    (key, body)
}

fn timeval_part(key: u8, value: Timeval) -> (u8, Vec<u8>) {
    let mut body = vec![0u8; 14];
    body[0] = key;
    body[1] = part_type::TIMEVAL;
    BigEndian::write_u64(&mut body[2..10], value.seconds);
    BigEndian::write_u32(&mut body[10..], value.microseconds);
    (key, body)
}

fn blob_part(key: u8, ty: u8, bytes: &[u8]) -> (u8, Vec<u8>) {
    let mut body = Vec::with_capacity(6 + bytes.len());
    body.push(key);
    body.push(ty);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, bytes.len() as u32);
    body.extend_from_slice(&len);
    body.extend_from_slice(bytes);
    (key, body)
}

fn string_part(key: u8, text: &str) -> (u8, Vec<u8>) {
    blob_part(key, part_type::STRING, text.as_bytes())
}

fn collect_parts(record: &LogRecord, identity: Option<&ClientIdentity>) -> Vec<(u8, Vec<u8>)> {
    let mut parts = Vec::with_capacity(8 + record.extras.len());

    parts.push(int16_part(part_key::MESSAGE_TYPE, record.message_type as u16));
    parts.push(timeval_part(part_key::TIMESTAMP, record.timestamp));
    parts.push(int32_part(part_key::SEQUENCE, record.sequence));
    parts.push(string_part(part_key::THREAD_ID, &record.thread_id));
    if let Some(ref domain) = record.domain {
        parts.push(string_part(part_key::TAG, domain));
    }
    if record.message_type == MessageType::Log {
        parts.push(int16_part(part_key::LEVEL, record.level));
    }
    match record.payload {
        Payload::Empty => {}
        Payload::Text(ref text) => parts.push(string_part(part_key::MESSAGE, text)),
        Payload::Binary(ref data) => {
            parts.push(blob_part(part_key::MESSAGE, part_type::BINARY, data))
        }
        Payload::Image(ref image) => {
            parts.push(blob_part(part_key::MESSAGE, part_type::IMAGE, &image.data));
            if image.width != 0 || image.height != 0 {
                parts.push(int32_part(part_key::IMAGE_WIDTH, image.width));
                parts.push(int32_part(part_key::IMAGE_HEIGHT, image.height));
            }
        }
    }
    if let Some(ref filename) = record.filename {
        parts.push(string_part(part_key::FILENAME, filename));
    }
    if let Some(line) = record.line {
        parts.push(int32_part(part_key::LINE_NUMBER, line));
    }
    if let Some(ref function) = record.function {
        parts.push(string_part(part_key::FUNCTION_NAME, function));
    }

    if let Some(identity) = identity {
        parts.push(string_part(part_key::CLIENT_NAME, &identity.client_name));
        parts.push(string_part(part_key::CLIENT_VERSION, &identity.client_version));
        parts.push(string_part(part_key::OS_NAME, &identity.os_name));
        parts.push(string_part(part_key::OS_VERSION, &identity.os_version));
        parts.push(string_part(part_key::CLIENT_DEVICE, &identity.device));
        parts.push(string_part(part_key::CLIENT_UNIQUE_ID, &identity.unique_id));
    }

    for extra in &record.extras {
        let mut body = Vec::with_capacity(2 + extra.body.len());
        body.push(extra.key);
        body.push(extra.part_type);
        body.extend_from_slice(&extra.body);
        parts.push((extra.key, body));
    }

    // Part ordering is fixed by ascending key; the sort is stable so a
    // duplicate key keeps its relative order.
    parts.sort_by_key(|&(key, _)| key);
    parts
}

fn encode_parts(parts: Vec<(u8, Vec<u8>)>) -> Vec<u8> {
    let payload_size: usize = parts.iter().map(|(_, bytes)| bytes.len()).sum();
    let mut frame = Vec::with_capacity(4 + payload_size);
    let mut prefix = [0u8; 4];
    BigEndian::write_u32(&mut prefix, payload_size as u32);
    frame.extend_from_slice(&prefix);
    for (_, bytes) in parts {
        frame.extend_from_slice(&bytes);
    }
    frame
}

/// Encodes a record into one complete frame, size prefix included.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    encode_parts(collect_parts(record, None))
}

/// Encodes a CLIENT_INFO frame for the given identity. CLIENT_INFO carries
/// sequence 0 and does not consume a sequence number.
pub fn encode_client_info(identity: &ClientIdentity) -> Vec<u8> {
    let record = LogRecord::new(MessageType::ClientInfo, 0);
    encode_parts(collect_parts(&record, Some(identity)))
}

/// Exact size in bytes `encode_record` will produce, size prefix included.
/// Used for queue byte accounting without encoding twice.
pub fn encoded_size(record: &LogRecord) -> usize {
    let mut size = 4; // size prefix
    size += 4; // message type
    size += 14; // timestamp
    size += 6; // sequence
    size += 6 + record.thread_id.len();
    if let Some(ref domain) = record.domain {
        size += 6 + domain.len();
    }
    if record.message_type == MessageType::Log {
        size += 4;
    }
    match record.payload {
        Payload::Empty => {}
        Payload::Text(ref text) => size += 6 + text.len(),
        Payload::Binary(ref data) => size += 6 + data.len(),
        Payload::Image(ref image) => {
            size += 6 + image.data.len();
            if image.width != 0 || image.height != 0 {
                size += 12;
            }
        }
    }
    if let Some(ref filename) = record.filename {
        size += 6 + filename.len();
    }
    size += record.line.map_or(0, |_| 6);
    if let Some(ref function) = record.function {
        size += 6 + function.len();
    }
    for extra in &record.extras {
        size += 2 + extra.body.len();
    }
    size
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Value of one parsed part.
enum PartValue<'a> {
    Int(u64),
    Timeval(Timeval),
    Blob(u8, &'a [u8]),
}

/// Incremental frame decoder. Bytes go in via [`push`](Self::push), complete
/// frames come out of [`next_frame`](Self::next_frame). Needing more bytes is
/// pure state, not an error.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    consumed: usize,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Returns the next complete frame, `None` if more bytes are needed.
    /// Protocol violations are fatal for the stream; the decoder must be
    /// discarded afterwards.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>, ProtocolError> {
        let avail = &self.buf[self.consumed..];
        if avail.len() < 4 {
            return Ok(None);
        }
        let declared = BigEndian::read_u32(avail);
        if declared > MAX_FRAME_SIZE {
            return Err(ProtocolError::BadLength {
                declared,
                available: MAX_FRAME_SIZE,
            });
        }
        let total = 4 + declared as usize;
        if avail.len() < total {
            return Ok(None);
        }

        let frame = parse_frame(&avail[4..total])?;
        self.consumed += total;
        self.compact();
        Ok(Some(frame))
    }

    fn compact(&mut self) {
        if self.consumed >= 4096 && self.consumed * 2 >= self.buf.len() {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

fn parse_part<'a>(payload: &'a [u8], pos: &mut usize) -> Result<(u8, u8, PartValue<'a>), ProtocolError> {
    let remaining = payload.len() - *pos;
    if remaining < 2 {
        return Err(ProtocolError::BadLength {
            declared: 2,
            available: remaining as u32,
        });
    }
    let key = payload[*pos];
    let ty = payload[*pos + 1];
    *pos += 2;

    let need = |n: usize, pos: usize| -> Result<(), ProtocolError> {
        let rem = payload.len() - pos;
        if rem < n {
            Err(ProtocolError::BadLength {
                declared: n as u32,
                available: rem as u32,
            })
        } else {
            Ok(())
        }
    };

    let value = match ty {
        part_type::INT16 => {
            need(2, *pos)?;
            let v = BigEndian::read_u16(&payload[*pos..]) as u64;
            *pos += 2;
            PartValue::Int(v)
        }
        part_type::INT32 => {
            need(4, *pos)?;
            let v = BigEndian::read_u32(&payload[*pos..]) as u64;
            *pos += 4;
            PartValue::Int(v)
        }
        part_type::INT64 => {
            need(8, *pos)?;
            let v = BigEndian::read_u64(&payload[*pos..]);
            *pos += 8;
            PartValue::Int(v)
        }
        part_type::TIMEVAL => {
            need(12, *pos)?;
            let seconds = BigEndian::read_u64(&payload[*pos..]);
            let microseconds = BigEndian::read_u32(&payload[*pos + 8..]);
            *pos += 12;
            PartValue::Timeval(Timeval {
                seconds,
                microseconds,
            })
        }
        part_type::STRING | part_type::BINARY | part_type::IMAGE => {
            need(4, *pos)?;
            let len = BigEndian::read_u32(&payload[*pos..]) as usize;
            need(4 + len, *pos)?;
            let data = &payload[*pos + 4..*pos + 4 + len];
            *pos += 4 + len;
            PartValue::Blob(ty, data)
        }
        // The length of an unknown part type cannot be determined, so the
        // whole frame is unusable.
        other => {
            return Err(ProtocolError::UnknownType {
                key,
                part_type: other,
            })
        }
    };

    Ok((key, ty, value))
}

fn utf8(key: u8, bytes: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { key })
}

fn parse_frame(payload: &[u8]) -> Result<DecodedFrame, ProtocolError> {
    let mut message_type: Option<u16> = None;
    let mut timestamp = Timeval::default();
    let mut sequence: u32 = 0;
    let mut thread_id = String::new();
    let mut domain: Option<String> = None;
    let mut level: u16 = 0;
    let mut message: Option<(u8, Vec<u8>)> = None;
    let mut width: u32 = 0;
    let mut height: u32 = 0;
    let mut filename: Option<String> = None;
    let mut line: Option<u32> = None;
    let mut function: Option<String> = None;
    let mut info: [Option<String>; 6] = Default::default();
    let mut extras: Vec<RawPart> = Vec::new();

    let mut pos = 0;
    while pos < payload.len() {
        let body_start = pos + 2;
        let (key, ty, value) = parse_part(payload, &mut pos)?;

        // Duplicate keys: last occurrence wins; mistyped known keys fall
        // through to the opaque-part bucket.
        match (key, value) {
            (part_key::MESSAGE_TYPE, PartValue::Int(v)) => message_type = Some(v as u16),
            (part_key::TIMESTAMP, PartValue::Timeval(tv)) => timestamp = tv,
            (part_key::SEQUENCE, PartValue::Int(v)) => sequence = v as u32,
            (part_key::THREAD_ID, PartValue::Blob(part_type::STRING, bytes)) => {
                thread_id = utf8(key, bytes)?;
            }
            (part_key::TAG, PartValue::Blob(part_type::STRING, bytes)) => {
                domain = Some(utf8(key, bytes)?);
            }
            (part_key::LEVEL, PartValue::Int(v)) => level = v as u16,
            (part_key::MESSAGE, PartValue::Blob(ty, bytes)) => message = Some((ty, bytes.to_vec())),
            (part_key::IMAGE_WIDTH, PartValue::Int(v)) => width = v as u32,
            (part_key::IMAGE_HEIGHT, PartValue::Int(v)) => height = v as u32,
            (part_key::FILENAME, PartValue::Blob(part_type::STRING, bytes)) => {
                filename = Some(utf8(key, bytes)?);
            }
            (part_key::LINE_NUMBER, PartValue::Int(v)) => line = Some(v as u32),
            (part_key::FUNCTION_NAME, PartValue::Blob(part_type::STRING, bytes)) => {
                function = Some(utf8(key, bytes)?);
            }
            (part_key::CLIENT_NAME..=part_key::CLIENT_UNIQUE_ID, PartValue::Blob(part_type::STRING, bytes)) => {
                info[(key - part_key::CLIENT_NAME) as usize] = Some(utf8(key, bytes)?);
            }
            _ => extras.push(RawPart {
                key,
                part_type: ty,
                body: payload[body_start..pos].to_vec(),
            }),
        }
    }

    let raw_type = message_type.ok_or(ProtocolError::MissingPart {
        key: part_key::MESSAGE_TYPE,
    })?;
    // A type tag outside the contract leaves the frame uninterpretable.
    let message_type = MessageType::from_raw(raw_type).ok_or(ProtocolError::MissingPart {
        key: part_key::MESSAGE_TYPE,
    })?;

    let payload_value = match message {
        None => Payload::Empty,
        Some((part_type::STRING, bytes)) => Payload::Text(utf8(part_key::MESSAGE, &bytes)?),
        Some((part_type::BINARY, bytes)) => Payload::Binary(bytes),
        Some((part_type::IMAGE, data)) => Payload::Image(ImageData {
            data,
            width,
            height,
        }),
        Some((_, bytes)) => Payload::Binary(bytes),
    };

    let identity = if message_type == MessageType::ClientInfo {
        let mut fields = info.into_iter().map(|f| f.unwrap_or_default());
        Some(ClientIdentity {
            client_name: fields.next().unwrap_or_default(),
            client_version: fields.next().unwrap_or_default(),
            os_name: fields.next().unwrap_or_default(),
            os_version: fields.next().unwrap_or_default(),
            device: fields.next().unwrap_or_default(),
            unique_id: fields.next().unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(DecodedFrame {
        record: LogRecord {
            sequence,
            timestamp,
            message_type,
            level,
            domain,
            thread_id,
            filename,
            line,
            function,
            payload: payload_value,
            extras,
        },
        identity,
    })
}

// ---------------------------------------------------------------------------
// Persisted session files
// ---------------------------------------------------------------------------

/// Writes the persisted-session preamble: magic then version byte. The rest
/// of the file is frames in receive order.
pub fn write_session_header<W: std::io::Write>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&SESSION_MAGIC)?;
    writer.write_all(&[SESSION_VERSION])
}

/// Validates a persisted-session preamble.
pub fn read_session_header<R: std::io::Read>(reader: &mut R) -> Result<(), Error> {
    let mut preamble = [0u8; 7];
    reader.read_exact(&mut preamble)?;
    if preamble[..6] != SESSION_MAGIC {
        return Err(Error::Configuration(String::from(
            "not a logger session file",
        )));
    }
    if preamble[6] != SESSION_VERSION {
        return Err(Error::Configuration(format!(
            "unsupported session version {}",
            preamble[6]
        )));
    }
    Ok(())
}

/// Reads a whole persisted session back into decoded frames.
pub fn read_session<R: std::io::Read>(reader: &mut R) -> Result<Vec<DecodedFrame>, Error> {
    read_session_header(reader)?;
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    let mut frames = Vec::new();
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        decoder.push(&chunk[..read]);
        while let Some(frame) = decoder.next_frame()? {
            frames.push(frame);
        }
    }
    if decoder.pending() != 0 {
        return Err(Error::Protocol(ProtocolError::BadLength {
            declared: decoder.pending() as u32,
            available: 0,
        }));
    }
    Ok(frames)
}
