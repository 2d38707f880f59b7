//! State shared between application threads and the transmit worker. The
//! only synchronisation producers ever pay for is the mutex around this
//! struct; sequence numbers are assigned inside the enqueue critical section
//! so global order matches wire order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

use mio::Waker;

use crate::client::{ClientConfig, DEBUG_LOGGER};
use crate::codec;
use crate::discovery::ServiceFound;
use crate::record::LogRecord;

/// Control messages for the worker, complementing the shared record queue.
#[derive(Debug)]
pub enum ControlEvent {
    /// The remote target changed (`set_remote_host`); reconnect.
    RemoteChanged,
    /// Discovery reported a candidate service.
    ServiceFound(ServiceFound),
    /// Cooperative shutdown.
    Quit,
}

/// Where the worker should ship frames.
#[derive(Debug, Clone)]
pub enum RemoteTarget {
    Tcp {
        host: String,
        port: u16,
        use_tls: bool,
    },
    File(PathBuf),
}

/// A queued record plus the optional flush acknowledgement channel used by
/// the flush-each-message option.
pub struct QueuedRecord {
    pub record: LogRecord,
    pub ack: Option<mpsc::SyncSender<()>>,
}

pub struct LoggerState {
    pub queue: VecDeque<QueuedRecord>,
    pub queued_bytes: usize,
    pub remote: Option<RemoteTarget>,
    /// Mirrored by the worker: true while the state machine is in
    /// STREAMING/DRAINING, which switches the enqueue policy.
    pub streaming: bool,
    pub quit: bool,
    pub dropped_records: u64,
    pub reconnections: u32,
    next_sequence: u32,
}

impl LoggerState {
    pub fn new(remote: Option<RemoteTarget>) -> LoggerState {
        LoggerState {
            queue: VecDeque::new(),
            queued_bytes: 0,
            remote,
            streaming: false,
            quit: false,
            dropped_records: 0,
            reconnections: 0,
            next_sequence: 1,
        }
    }

    /// Assigns the next record sequence number. Must be called with the
    /// state lock held, immediately before pushing the record.
    pub fn alloc_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    /// Applies the queue/drop policy and enqueues. Returns false when the
    /// record was dropped instead.
    pub fn enqueue(&mut self, entry: QueuedRecord, config: &ClientConfig) -> bool {
        if self.quit {
            self.dropped_records += 1;
            return false;
        }

        if self.streaming || self.remote_is_file() {
            // Connected: the worker drains fast, producers only ever pay the
            // mutex.
            self.push(entry);
            return true;
        }

        if !config.buffer_until_connection() {
            // Not connected, not buffering: drop on insert.
            self.dropped_records += 1;
            return false;
        }

        if self.queue.len() >= config.queue_capacity {
            // A record may only displace one that is no more important.
            let level = entry.record.level;
            match self.queue.iter().position(|q| q.record.level >= level) {
                Some(victim) => {
                    if let Some(removed) = self.queue.remove(victim) {
                        self.queued_bytes -= codec::encoded_size(&removed.record);
                        self.dropped_records += 1;
                    }
                }
                None => {
                    self.dropped_records += 1;
                    return false;
                }
            }
        }

        self.push(entry);
        // Drop from the head so the records immediately preceding a
        // reconnect survive.
        while self.queued_bytes > config.buffer_capacity && self.queue.len() > 1 {
            self.drop_front();
        }
        true
    }

    /// Pops everything currently queued, preserving order.
    pub fn drain_queue(&mut self) -> Vec<QueuedRecord> {
        self.queued_bytes = 0;
        self.queue.drain(..).collect()
    }

    pub fn remote_is_file(&self) -> bool {
        matches!(self.remote, Some(RemoteTarget::File(_)))
    }

    fn push(&mut self, entry: QueuedRecord) {
        self.queued_bytes += codec::encoded_size(&entry.record);
        self.queue.push_back(entry);
    }

    fn drop_front(&mut self) {
        if let Some(dropped) = self.queue.pop_front() {
            self.queued_bytes -= codec::encoded_size(&dropped.record);
            self.dropped_records += 1;
            if DEBUG_LOGGER {
                log::debug!(target: "NSLogger",
                            "buffer cap reached, dropping record {}",
                            dropped.record.sequence);
            }
        }
    }
}

/// Handle shared by the `Logger` facade, its clones and the worker thread.
pub struct Shared {
    pub state: Mutex<LoggerState>,
    control_tx: Mutex<mpsc::Sender<ControlEvent>>,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl Shared {
    pub fn new(state: LoggerState, control_tx: mpsc::Sender<ControlEvent>) -> Shared {
        Shared {
            state: Mutex::new(state),
            control_tx: Mutex::new(control_tx),
            waker: Mutex::new(None),
        }
    }

    /// Installed once by the worker after it builds its poll.
    pub fn set_waker(&self, waker: Arc<Waker>) {
        if let Ok(mut slot) = self.waker.lock() {
            *slot = Some(waker);
        }
    }

    /// Wakes the worker out of its combined wait.
    pub fn wake(&self) {
        if let Ok(slot) = self.waker.lock() {
            if let Some(ref waker) = *slot {
                let _ = waker.wake();
            }
        }
    }

    /// Sends a control event and wakes the worker.
    pub fn send_control(&self, event: ControlEvent) {
        if let Ok(tx) = self.control_tx.lock() {
            let _ = tx.send(event);
        }
        self.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, LoggerOptions};
    use crate::record::{LogRecord, MessageType, Payload};

    fn entry(state: &mut LoggerState, level: u16, text: &str) -> QueuedRecord {
        let mut record = LogRecord::new(MessageType::Log, state.alloc_sequence());
        record.level = level;
        record.payload = Payload::Text(text.to_string());
        QueuedRecord { record, ack: None }
    }

    #[test]
    fn sequence_is_dense_from_one() {
        let mut state = LoggerState::new(None);
        assert_eq!(state.alloc_sequence(), 1);
        assert_eq!(state.alloc_sequence(), 2);
        assert_eq!(state.alloc_sequence(), 3);
    }

    #[test]
    fn buffering_overflow_drops_from_head() {
        let mut config = ClientConfig::default();
        config.options = LoggerOptions::BUFFER_LOGS_UNTIL_CONNECTION;
        let mut state = LoggerState::new(None);

        let one_size = {
            let probe = entry(&mut state, 3, "xxxxxxxxxx");
            codec::encoded_size(&probe.record)
        };
        state = LoggerState::new(None);
        // Room for roughly four records, fed eight.
        config.buffer_capacity = one_size * 4;
        for _ in 0..8 {
            let e = entry(&mut state, 3, "xxxxxxxxxx");
            assert!(state.enqueue(e, &config));
        }

        assert!(state.queued_bytes <= config.buffer_capacity);
        assert_eq!(state.dropped_records, 4);
        // Most recent records survive, in order, with the highest sequences.
        let sequences: Vec<u32> = state.queue.iter().map(|q| q.record.sequence).collect();
        assert_eq!(sequences, vec![5, 6, 7, 8]);
    }

    #[test]
    fn non_buffering_drops_on_insert_when_disconnected() {
        let mut config = ClientConfig::default();
        config.options = LoggerOptions::empty();
        let mut state = LoggerState::new(None);

        let e = entry(&mut state, 3, "dropped");
        assert!(!state.enqueue(e, &config));
        assert!(state.queue.is_empty());
        assert_eq!(state.dropped_records, 1);
    }

    #[test]
    fn full_queue_evicts_oldest_no_more_important_record() {
        let mut config = ClientConfig::default();
        config.queue_capacity = 3;
        let mut state = LoggerState::new(None);

        for level in [2, 5, 4] {
            let e = entry(&mut state, level, "r");
            assert!(state.enqueue(e, &config));
        }
        // Incoming level 3 displaces the oldest record with level >= 3.
        let e = entry(&mut state, 3, "new");
        assert!(state.enqueue(e, &config));
        let levels: Vec<u16> = state.queue.iter().map(|q| q.record.level).collect();
        assert_eq!(levels, vec![2, 4, 3]);

        // An error-level backlog refuses a noise-level newcomer.
        let mut state = LoggerState::new(None);
        for _ in 0..3 {
            let e = entry(&mut state, 0, "err");
            assert!(state.enqueue(e, &config));
        }
        let e = entry(&mut state, 6, "noise");
        assert!(!state.enqueue(e, &config));
        assert_eq!(state.queue.len(), 3);
    }

    #[test]
    fn connected_queue_accepts_past_the_capacity_bounds() {
        let mut config = ClientConfig::default();
        config.queue_capacity = 2;
        let mut state = LoggerState::new(None);
        state.streaming = true;

        for _ in 0..5 {
            let e = entry(&mut state, 3, "burst");
            assert!(state.enqueue(e, &config));
        }
        assert_eq!(state.queue.len(), 5);
        assert_eq!(state.dropped_records, 0);
    }

    #[test]
    fn quit_refuses_new_records() {
        let config = ClientConfig::default();
        let mut state = LoggerState::new(None);
        state.quit = true;
        let e = entry(&mut state, 1, "late");
        assert!(!state.enqueue(e, &config));
    }
}
