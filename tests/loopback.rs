//! End-to-end tests over loopback sockets: client pipeline against the
//! viewer core, run continuity across reconnections, cancellation and the
//! file target.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nslogger::codec::{self, DecodedFrame, FrameDecoder};
use nslogger::record::{ClientIdentity, LogRecord, MessageType, Payload};
use nslogger::viewer::session::ConnectionDelegate;
use nslogger::{
    ClientConfig, ConnectionSession, Domain, Level, Listener, Logger, LoggerOptions, ViewerConfig,
};

#[derive(Default)]
struct CollectorState {
    records: Vec<LogRecord>,
    disconnects: u32,
}

#[derive(Default)]
struct Collector {
    state: Mutex<CollectorState>,
    cvar: Condvar,
}

impl ConnectionDelegate for Collector {
    fn did_receive_messages(
        &self,
        _session: &ConnectionSession,
        batch: &[LogRecord],
        _range: std::ops::Range<usize>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.records.extend_from_slice(batch);
        self.cvar.notify_all();
    }

    fn remote_disconnected(&self, _session: &ConnectionSession) {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        self.cvar.notify_all();
    }
}

impl Collector {
    fn wait_until<F: Fn(&CollectorState) -> bool>(&self, predicate: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !predicate(&state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _) = self.cvar.wait_timeout(state, remaining).unwrap();
            state = next;
        }
        true
    }

    fn records(&self) -> Vec<LogRecord> {
        self.state.lock().unwrap().records.clone()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn direct_client_config(port: u16) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.options = LoggerOptions::BUFFER_LOGS_UNTIL_CONNECTION;
    config.remote_host = Some((String::from("127.0.0.1"), port));
    config.retry_min = Duration::from_millis(100);
    config.retry_max = Duration::from_secs(1);
    config
}

#[test]
fn concurrent_producers_preserve_per_thread_order() {
    init_logging();
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 200;

    let collector = Arc::new(Collector::default());
    let listener = Listener::start(ViewerConfig::default(), collector.clone()).unwrap();
    let port = listener.local_addr().unwrap().port();

    let logger = Logger::with_config(direct_client_config(port));
    let mut producers = Vec::new();
    for tid in 0..THREADS {
        let logger = logger.clone();
        let handle = thread::Builder::new()
            .name(format!("producer-{}", tid))
            .spawn(move || {
                for i in 0..PER_THREAD {
                    logger.log(
                        Some(Domain::App),
                        Level::Debug,
                        &format!("{}:{}", tid, i),
                    );
                }
            })
            .unwrap();
        producers.push(handle);
    }
    for handle in producers {
        handle.join().unwrap();
    }

    let total = (THREADS * PER_THREAD) as usize;
    assert!(
        collector.wait_until(|state| state.records.len() >= total, Duration::from_secs(30)),
        "viewer received {} of {} records",
        collector.records().len(),
        total
    );

    let records = collector.records();
    assert_eq!(records.len(), total);

    // Global order equals sequence-assignment order, densely numbered.
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, (i + 1) as u32);
    }

    // Per-thread, the payloads come out exactly in emission order.
    for tid in 0..THREADS {
        let thread_name = format!("producer-{}", tid);
        let texts: Vec<String> = records
            .iter()
            .filter(|record| record.thread_id == thread_name)
            .filter_map(|record| match record.payload {
                Payload::Text(ref text) => Some(text.clone()),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..PER_THREAD).map(|i| format!("{}:{}", tid, i)).collect();
        assert_eq!(texts, expected, "order broken for {}", thread_name);
    }

    logger.stop();
    listener.shutdown();
}

/// Reads decoded frames from a raw server-side socket until `count` frames
/// arrived or the deadline passes.
fn read_frames(conn: &mut TcpStream, decoder: &mut FrameDecoder, count: usize) -> Vec<DecodedFrame> {
    use std::io::Read;

    conn.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut frames = Vec::new();
    let mut chunk = [0u8; 4096];
    while frames.len() < count && Instant::now() < deadline {
        match conn.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.push(&chunk[..n]);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("read failed: {}", e),
        }
    }
    frames
}

fn accept_with_timeout(server: &TcpListener, timeout: Duration) -> TcpStream {
    server.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + timeout;
    loop {
        match server.accept() {
            Ok((conn, _)) => {
                conn.set_nonblocking(false).unwrap();
                return conn;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "no connection within {:?}", timeout);
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    }
}

#[test]
fn reconnection_preserves_run_identity_and_sequencing() {
    init_logging();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let logger = Logger::with_config(direct_client_config(port));
    for i in 1..=5 {
        logger.log(None, Level::Info, &format!("msg-{}", i));
    }

    // First connection: CLIENT_INFO then records 1..=5.
    let mut conn1 = accept_with_timeout(&server, Duration::from_secs(10));
    let mut decoder1 = FrameDecoder::new();
    let frames1 = read_frames(&mut conn1, &mut decoder1, 6);
    assert_eq!(frames1.len(), 6);
    assert_eq!(frames1[0].record.message_type, MessageType::ClientInfo);
    let run_id = frames1[0].identity.as_ref().unwrap().unique_id.clone();
    assert!(!run_id.is_empty());
    for (i, frame) in frames1[1..].iter().enumerate() {
        assert_eq!(frame.record.sequence, (i + 1) as u32);
    }

    // Kill the transport; the client buffers while reconnecting.
    drop(conn1);
    thread::sleep(Duration::from_millis(50));
    logger.log(None, Level::Info, "msg-6");
    logger.log(None, Level::Info, "msg-7");

    // Second connection: a continuation CLIENT_INFO with the same run id,
    // then sequencing resumes without a reset.
    let mut conn2 = accept_with_timeout(&server, Duration::from_secs(10));
    let mut decoder2 = FrameDecoder::new();
    let frames2 = read_frames(&mut conn2, &mut decoder2, 3);
    assert!(frames2.len() >= 3, "got {} frames", frames2.len());
    assert_eq!(frames2[0].record.message_type, MessageType::ClientInfo);
    assert_eq!(frames2[0].identity.as_ref().unwrap().unique_id, run_id);

    let records: Vec<&DecodedFrame> = frames2[1..].iter().collect();
    assert_eq!(records[0].record.sequence, 6);
    assert_eq!(records[1].record.sequence, 7);
    assert_eq!(records[0].record.text(), Some("msg-6"));

    assert_eq!(logger.reconnections(), 1);
    logger.stop();
}

#[test]
fn viewer_merges_reconnected_run() {
    init_logging();
    let collector = Arc::new(Collector::default());
    let listener = Listener::start(ViewerConfig::default(), collector.clone()).unwrap();
    let addr = listener.local_addr().unwrap();

    let identity = ClientIdentity {
        client_name: String::from("scripted"),
        client_version: String::from("1.0"),
        os_name: String::from("test"),
        os_version: String::new(),
        device: String::from("loopback"),
        unique_id: String::from("run-merge-test"),
    };
    let record = |seq: u32, text: &str| {
        let mut r = LogRecord::new(MessageType::Log, seq);
        r.level = Level::Info as u16;
        r.payload = Payload::Text(text.to_string());
        codec::encode_record(&r)
    };

    // First connection carries records 1..=3 then dies.
    let mut conn1 = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    conn1.write_all(&codec::encode_client_info(&identity)).unwrap();
    for seq in 1..=3 {
        conn1.write_all(&record(seq, "pre")).unwrap();
    }
    conn1.flush().unwrap();
    drop(conn1);
    assert!(collector.wait_until(|s| s.disconnects == 1, Duration::from_secs(10)));

    // Reconnection re-announces the run and re-sends record 3 whole.
    let mut conn2 = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    conn2.write_all(&codec::encode_client_info(&identity)).unwrap();
    for seq in 3..=5 {
        conn2.write_all(&record(seq, "post")).unwrap();
    }
    conn2.flush().unwrap();
    assert!(collector.wait_until(|s| s.records.len() >= 5, Duration::from_secs(10)));
    drop(conn2);

    let sessions = listener.sessions();
    assert_eq!(sessions.len(), 1, "runs were not merged");
    {
        let session = sessions[0].lock().unwrap();
        assert_eq!(session.reconnection_count(), 1);
        let sequences: Vec<u32> = session.messages().iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    listener.shutdown();
}

#[test]
fn stop_is_prompt_while_disconnected() {
    init_logging();
    // A loopback port with nothing listening: connections are refused and
    // the worker sits in its retry cycle.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let logger = Logger::with_config(direct_client_config(port));
    logger.log(None, Level::Warning, "into the void");
    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    logger.stop();
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        started.elapsed()
    );
    // Stopping again is a no-op.
    logger.stop();
}

#[test]
fn file_target_round_trips_through_the_codec() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.nsloggerdata");

    let mut config = ClientConfig::default();
    config.options = LoggerOptions::empty();
    config.file_path = Some(path.clone());
    let logger = Logger::with_config(config);

    logger.log(Some(Domain::DB), Level::Important, "first");
    logger.start_block("span");
    logger.log(None, Level::Debug, "second");
    logger.end_block();
    logger.stop();

    let mut file = std::fs::File::open(&path).unwrap();
    let frames = codec::read_session(&mut file).unwrap();
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[0].record.message_type, MessageType::ClientInfo);
    assert!(frames[0].identity.is_some());
    assert_eq!(frames[1].record.text(), Some("first"));
    assert_eq!(frames[1].record.domain.as_deref(), Some("db"));
    assert_eq!(frames[2].record.message_type, MessageType::BlockStart);
    assert_eq!(frames[3].record.text(), Some("second"));
    assert_eq!(frames[4].record.message_type, MessageType::BlockEnd);
    let sequences: Vec<u32> = frames[1..].iter().map(|f| f.record.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}
