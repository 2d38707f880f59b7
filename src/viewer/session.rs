//! One client run as seen by the viewer: ordered message history, block
//! nesting, derived indices and batched delivery to the consumer.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::Range;

use crate::codec::DecodedFrame;
use crate::error::ProtocolError;
use crate::record::{ClientIdentity, LogRecord, MessageType};

/// Consumer hooks. Both callbacks may run on the session's reader thread
/// and must not assume any UI lock is held. The session keeps mutating
/// after a callback returns; copy any indices or records you want to keep.
pub trait ConnectionDelegate: Send + Sync {
    /// A batch of records was appended; `range` is their position inside
    /// [`ConnectionSession::messages`].
    fn did_receive_messages(
        &self,
        session: &ConnectionSession,
        batch: &[LogRecord],
        range: Range<usize>,
    );

    /// Always delivered once per connection, after the last batch, including
    /// on protocol errors.
    fn remote_disconnected(&self, session: &ConnectionSession) {
        let _ = session;
    }
}

/// Viewer-side model of one connection-run pairing.
///
/// Records are appended strictly in sequence order; a record, once appended,
/// is never mutated. The session survives transport loss: if the same run
/// reconnects it is re-attached and the history keeps growing.
pub struct ConnectionSession {
    identity: Option<ClientIdentity>,
    peer_address: SocketAddr,
    messages: Vec<LogRecord>,
    filenames: HashSet<String>,
    functions: HashSet<String>,
    parent_index_stack: Vec<usize>,
    reconnection_count: u32,
    connected: bool,
    last_sequence: u32,
    /// Open right after a reconnection: duplicates of already-seen records
    /// are expected at the boundary and dropped silently.
    resync: bool,
    pending: Vec<LogRecord>,
    pending_start: usize,
}

impl ConnectionSession {
    pub fn new(peer_address: SocketAddr) -> ConnectionSession {
        ConnectionSession {
            identity: None,
            peer_address,
            messages: Vec::new(),
            filenames: HashSet::new(),
            functions: HashSet::new(),
            parent_index_stack: Vec::new(),
            reconnection_count: 0,
            connected: true,
            last_sequence: 0,
            resync: false,
            pending: Vec::new(),
            pending_start: 0,
        }
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn messages(&self) -> &[LogRecord] {
        &self.messages
    }

    pub fn filenames(&self) -> &HashSet<String> {
        &self.filenames
    }

    pub fn functions(&self) -> &HashSet<String> {
        &self.functions
    }

    /// Indices of the currently open BLOCK_START records, outermost first.
    pub fn parent_index_stack(&self) -> &[usize] {
        &self.parent_index_stack
    }

    pub fn reconnection_count(&self) -> u32 {
        self.reconnection_count
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// "app 1.2 on device" — for window titles and session lists.
    pub fn client_description(&self) -> String {
        match self.identity {
            Some(ref identity) => {
                let mut description = identity.client_name.clone();
                if !identity.client_version.is_empty() {
                    description.push(' ');
                    description.push_str(&identity.client_version);
                }
                if !identity.device.is_empty() {
                    description.push_str(" on ");
                    description.push_str(&identity.device);
                }
                description
            }
            None => format!("{}", self.peer_address),
        }
    }

    /// Re-binds an existing session to a fresh transport carrying the same
    /// run. Sequence tracking continues where it left off; duplicates at the
    /// boundary are tolerated until the stream has caught up.
    pub fn reattach(&mut self, peer_address: SocketAddr) {
        self.peer_address = peer_address;
        self.connected = true;
        self.reconnection_count += 1;
        self.resync = true;
    }

    /// Called by the reader when the transport is gone for good (EOF, I/O
    /// error, or protocol violation).
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Clears the captured history while the session stays attached.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.filenames.clear();
        self.functions.clear();
        self.parent_index_stack.clear();
        self.pending.clear();
        self.pending_start = 0;
    }

    /// Feeds one decoded frame through the per-run state machine.
    pub fn process_frame(&mut self, frame: DecodedFrame) -> Result<(), ProtocolError> {
        let DecodedFrame { record, identity } = frame;

        if self.identity.is_none() {
            // First frame of a run must announce who is talking.
            let identity = identity.ok_or(ProtocolError::UnexpectedFirstFrame)?;
            log::debug!(target: "NSLoggerViewer",
                        "client info: {} ({})", identity.client_name, identity.unique_id);
            self.identity = Some(identity);
            self.resync = true;
            return Ok(());
        }

        if record.message_type == MessageType::ClientInfo {
            match identity {
                Some(ref new_identity)
                    if Some(&new_identity.unique_id)
                        != self.identity.as_ref().map(|id| &id.unique_id) =>
                {
                    return Err(ProtocolError::IdentityMismatch);
                }
                _ => {
                    // Continuation announcement after a reconnection.
                    self.resync = true;
                    return Ok(());
                }
            }
        }

        if record.message_type == MessageType::Disconnect {
            // Pseudo-records some legacy clients emit; not part of the
            // ordered history.
            return Ok(());
        }

        let expected = self.last_sequence + 1;
        if self.resync {
            // Right after a connection announcement the stream may replay
            // records that were already sent whole (dropped here) or jump
            // over records the client evicted while unreachable (accepted;
            // the reconnection count lets consumers annotate the gap).
            if record.sequence <= self.last_sequence {
                log::debug!(target: "NSLoggerViewer",
                            "dropping boundary duplicate seq {}", record.sequence);
                return Ok(());
            }
            if record.sequence != expected {
                log::info!(target: "NSLoggerViewer",
                           "sequence jumped {} -> {} across connection boundary",
                           self.last_sequence, record.sequence);
            }
        } else if record.sequence != expected {
            return Err(ProtocolError::SequenceGap {
                expected,
                got: record.sequence,
            });
        }
        self.resync = false;
        self.last_sequence = record.sequence;

        if let Some(ref filename) = record.filename {
            self.filenames.insert(filename.clone());
        }
        if let Some(ref function) = record.function {
            self.functions.insert(function.clone());
        }
        match record.message_type {
            MessageType::BlockStart => self.parent_index_stack.push(self.messages.len()),
            MessageType::BlockEnd => {
                if self.parent_index_stack.pop().is_none() {
                    // Clients are believed; an unmatched end is noted and
                    // the record still enters the history.
                    log::warn!(target: "NSLoggerViewer",
                               "unmatched block end at seq {}", record.sequence);
                }
            }
            _ => {}
        }

        if self.pending.is_empty() {
            self.pending_start = self.messages.len();
        }
        self.pending.push(record.clone());
        self.messages.push(record);
        Ok(())
    }

    /// Number of records accumulated for the next delivery.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Takes the accumulated batch and its range inside `messages`.
    pub fn take_batch(&mut self) -> Option<(Vec<LogRecord>, Range<usize>)> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.pending);
        let range = self.pending_start..self.pending_start + batch.len();
        self.pending_start = range.end;
        Some((batch, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::record::Payload;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn identity(unique_id: &str) -> ClientIdentity {
        ClientIdentity {
            client_name: String::from("demo"),
            client_version: String::from("1.0"),
            os_name: String::from("macOS"),
            os_version: String::from("14.0"),
            device: String::from("mbp"),
            unique_id: unique_id.to_string(),
        }
    }

    fn info_frame(unique_id: &str) -> DecodedFrame {
        let frame = codec::encode_client_info(&identity(unique_id));
        decode(&frame)
    }

    fn decode(bytes: &[u8]) -> DecodedFrame {
        let mut decoder = codec::FrameDecoder::new();
        decoder.push(bytes);
        decoder.next_frame().unwrap().unwrap()
    }

    fn record_frame(seq: u32, message_type: MessageType, text: &str) -> DecodedFrame {
        let mut record = LogRecord::new(message_type, seq);
        if !text.is_empty() {
            record.payload = Payload::Text(text.to_string());
        }
        decode(&codec::encode_record(&record))
    }

    fn log_frame(seq: u32, text: &str) -> DecodedFrame {
        record_frame(seq, MessageType::Log, text)
    }

    #[test]
    fn first_frame_must_be_client_info() {
        let mut session = ConnectionSession::new(peer());
        let err = session.process_frame(log_frame(1, "too early")).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedFirstFrame);

        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(1, "fine")).unwrap();
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn sequence_gap_terminates_with_history_retained() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(1, "one")).unwrap();
        session.process_frame(log_frame(2, "two")).unwrap();
        let err = session.process_frame(log_frame(4, "four")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::SequenceGap {
                expected: 3,
                got: 4
            }
        );
        assert_eq!(session.messages().len(), 2);
    }

    #[test]
    fn block_nesting_tracks_parent_indexes() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();

        // BLOCK_START(A), LOG, BLOCK_START(B), LOG, BLOCK_END, LOG,
        // BLOCK_END, LOG
        session
            .process_frame(record_frame(1, MessageType::BlockStart, "A"))
            .unwrap();
        assert_eq!(session.parent_index_stack(), &[0]);
        session.process_frame(log_frame(2, "in A")).unwrap();
        session
            .process_frame(record_frame(3, MessageType::BlockStart, "B"))
            .unwrap();
        assert_eq!(session.parent_index_stack(), &[0, 2]);
        session.process_frame(log_frame(4, "in B")).unwrap();
        session
            .process_frame(record_frame(5, MessageType::BlockEnd, ""))
            .unwrap();
        assert_eq!(session.parent_index_stack(), &[0]);
        session.process_frame(log_frame(6, "in A again")).unwrap();
        session
            .process_frame(record_frame(7, MessageType::BlockEnd, ""))
            .unwrap();
        session.process_frame(log_frame(8, "top level")).unwrap();

        assert!(session.parent_index_stack().is_empty());
        assert_eq!(session.messages().len(), 8);
        assert_eq!(session.messages()[0].message_type, MessageType::BlockStart);
        assert_eq!(session.messages()[2].message_type, MessageType::BlockStart);
        assert_eq!(session.messages()[7].message_type, MessageType::Log);
    }

    #[test]
    fn unmatched_block_end_is_ignored() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session
            .process_frame(record_frame(1, MessageType::BlockEnd, ""))
            .unwrap();
        assert!(session.parent_index_stack().is_empty());
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn reconnection_merges_with_boundary_duplicates_dropped() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        for seq in 1..=3 {
            session.process_frame(log_frame(seq, "pre")).unwrap();
        }
        session.mark_disconnected();
        assert!(!session.connected());

        session.reattach(peer());
        assert_eq!(session.reconnection_count(), 1);
        // Continuation announcement, then a duplicate of 3, then the rest.
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(3, "dup")).unwrap();
        session.process_frame(log_frame(4, "four")).unwrap();
        session.process_frame(log_frame(5, "five")).unwrap();

        let sequences: Vec<u32> = session.messages().iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn boundary_jump_is_tolerated_but_mid_stream_gap_is_fatal() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(1, "one")).unwrap();
        session.mark_disconnected();
        session.reattach(peer());
        session.process_frame(info_frame("run-1")).unwrap();

        // The client evicted record 2 while unreachable; the jump lands at
        // the connection boundary and is annotated, not fatal.
        session.process_frame(log_frame(3, "three")).unwrap();
        session.process_frame(log_frame(4, "four")).unwrap();

        // Once the stream is re-established, strictness is back.
        let err = session.process_frame(log_frame(6, "six")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::SequenceGap {
                expected: 5,
                got: 6
            }
        );
    }

    #[test]
    fn first_connection_may_start_past_one_after_client_side_drops() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(7, "first survivor")).unwrap();
        session.process_frame(log_frame(8, "next")).unwrap();
        assert_eq!(session.messages().len(), 2);
        let err = session.process_frame(log_frame(10, "gap")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::SequenceGap {
                expected: 9,
                got: 10
            }
        );
    }

    #[test]
    fn identity_change_mid_session_is_fatal() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(1, "one")).unwrap();
        let err = session.process_frame(info_frame("run-2")).unwrap_err();
        assert_eq!(err, ProtocolError::IdentityMismatch);
    }

    #[test]
    fn derived_indices_collect_filenames_and_functions() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();

        let mut record = LogRecord::new(MessageType::Log, 1);
        record.filename = Some(String::from("main.rs"));
        record.function = Some(String::from("run"));
        record.payload = Payload::Text(String::from("x"));
        session
            .process_frame(decode(&codec::encode_record(&record)))
            .unwrap();

        assert!(session.filenames().contains("main.rs"));
        assert!(session.functions().contains("run"));
    }

    #[test]
    fn batches_report_their_range_in_messages() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(1, "a")).unwrap();
        session.process_frame(log_frame(2, "b")).unwrap();

        let (batch, range) = session.take_batch().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(range, 0..2);
        assert!(session.take_batch().is_none());

        session.process_frame(log_frame(3, "c")).unwrap();
        let (batch, range) = session.take_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(range, 2..3);
    }

    #[test]
    fn clear_messages_keeps_identity_and_sequencing() {
        let mut session = ConnectionSession::new(peer());
        session.process_frame(info_frame("run-1")).unwrap();
        session.process_frame(log_frame(1, "a")).unwrap();
        session.clear_messages();
        assert!(session.messages().is_empty());
        assert!(session.identity().is_some());
        // The wire sequence keeps counting from where it was.
        session.process_frame(log_frame(2, "b")).unwrap();
        assert_eq!(session.messages().len(), 1);
    }
}
