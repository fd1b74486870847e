//! Reliable, clock-aware command transport (spec §4.D).
//!
//! One dedicated worker thread owns the transport for the lifetime of the
//! queue (spec §5: "the serial queue runs one dedicated worker ... all other
//! components are single-threaded cooperative under the caller"). Callers
//! only ever touch the queue through `send`/`pull`/`set_clock_est`/`exit`;
//! all shared state lives behind one `parking_lot::Mutex` plus a `Condvar`
//! that wakes the worker on new sends, acks, or a clock update, matching the
//! single-internal-mutex policy in spec §5.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::clock::ClockEstimate;
use crate::error::CoreError;
use klipper_proto::frame::{build_ack, build_frame, is_ack_frame, parse, MESSAGE_MAX};

/// The transport a [`SerialQueue`] worker drives. Production code hands it a
/// blocking `tokio_serial` handle; tests and the simulator hand it one end
/// of a `UnixStream` pair.
pub trait SerialTransport: Read + Write + Send {
    /// Bounds how long one read attempt may block, so the worker keeps
    /// servicing writes, retransmits, and `exit` requests even when the MCU
    /// is silent.
    fn set_read_timeout(&mut self, dur: Duration) -> io::Result<()>;
}

impl SerialTransport for std::os::unix::net::UnixStream {
    fn set_read_timeout(&mut self, dur: Duration) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, Some(dur))
    }
}

impl SerialTransport for tokio_serial::TTYPort {
    fn set_read_timeout(&mut self, dur: Duration) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.set_timeout(dur).map_err(|e| io::Error::new(ErrorKind::Other, e))
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_MIN_RETRANSMIT: Duration = Duration::from_millis(10);
const MAX_RETRANSMIT: Duration = Duration::from_millis(2000);
const RETRANSMIT_K: f64 = 2.0;
const SEQ_MASK: u8 = 0x0f;
/// Spec §4.D: `exit()` drains `send_queue` and finishes in-flight acks "up to
/// a deadline, then close[s]" — this bounds that deadline so a silent or
/// gone MCU can never make `exit()` block forever.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn now_host_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One caller-visible producer lane; ties in `req_clock` across lanes are
/// broken by round-robin (spec §4.D "round-robining ties ... for fairness").
pub type CommandQueueId = usize;

struct Queued {
    cmdq: CommandQueueId,
    bytes: Vec<u8>,
    min_clock: u64,
    req_clock: u64,
}

struct Sent {
    seq: u8,
    cmdq: CommandQueueId,
    bytes: Vec<u8>,
    min_clock: u64,
    req_clock: u64,
    sent_at: Instant,
    retransmits: u32,
}

/// One message the caller has pulled off the receive side, matching the
/// `pull_queue_message` shape in spec §6.
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub msg: Vec<u8>,
    pub sent_time: f64,
    pub receive_time: f64,
}

/// A bounded history record surfaced by [`SerialQueue::extract_old`].
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub seq: u8,
    pub bytes: Vec<u8>,
    pub sent_time: f64,
    pub receive_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub dropped_frames: u64,
    pub last_rtt: f64,
}

struct State {
    send_queue: VecDeque<Queued>,
    sent_queue: VecDeque<Sent>,
    receive_queue: VecDeque<PulledMessage>,
    history: VecDeque<HistoryEntry>,
    send_seq: u8,
    receive_seq: u8,
    last_cmdq_served: CommandQueueId,
    clock: ClockEstimate,
    stats: Stats,
    exiting: bool,
    exited: bool,
    /// Wall-clock deadline after which the worker force-closes even with
    /// undrained `send_queue`/unacked `sent_queue` entries. Set once, when
    /// `exit()` first flips `exiting`.
    exit_deadline: Option<Instant>,
}

const SENT_QUEUE_MAX_DEFAULT: usize = 32;
const HISTORY_MAX: usize = 128;

struct Shared {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    woken: Condvar,
    sent_queue_max: usize,
    /// Floor for [`retransmit_timeout`]'s RTT-scaled backoff (spec §4.D:
    /// "Retransmit timeout = k . estimated_rtt, clamped to [MIN, MAX]"),
    /// seeded from `McuConfig::retransmit_timeout_ms`.
    min_retransmit: Duration,
}

/// A reliable command transport with clock-aware scheduling (spec §4.D).
pub struct SerialQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    next_cmdq: CommandQueueId,
}

impl SerialQueue {
    /// Spawns the worker thread and takes ownership of `transport` for the
    /// queue's lifetime (spec §3 "the serial queue owns the fd exclusively").
    ///
    /// `retransmit_timeout_ms` is the configured floor for the RTT-scaled
    /// retransmit backoff (`McuConfig::retransmit_timeout_ms`); `0` falls
    /// back to [`DEFAULT_MIN_RETRANSMIT`].
    pub fn new(
        transport: Box<dyn SerialTransport>,
        sent_queue_max: usize,
        retransmit_timeout_ms: u32,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                send_queue: VecDeque::new(),
                sent_queue: VecDeque::new(),
                receive_queue: VecDeque::new(),
                history: VecDeque::new(),
                send_seq: 0,
                receive_seq: 0,
                last_cmdq_served: 0,
                clock: ClockEstimate::new(),
                stats: Stats::default(),
                exiting: false,
                exited: false,
                exit_deadline: None,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            woken: Condvar::new(),
            sent_queue_max: if sent_queue_max == 0 {
                SENT_QUEUE_MAX_DEFAULT
            } else {
                sent_queue_max
            },
            min_retransmit: if retransmit_timeout_ms == 0 {
                DEFAULT_MIN_RETRANSMIT
            } else {
                Duration::from_millis(retransmit_timeout_ms as u64)
            },
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("serialqueue-worker".into())
            .spawn(move || worker_loop(worker_shared, transport))
            .expect("failed to spawn serial queue worker");

        SerialQueue {
            shared,
            worker: Some(worker),
            next_cmdq: 0,
        }
    }

    /// Allocates a new command-queue lane id for fair multiplexing.
    pub fn alloc_command_queue(&mut self) -> CommandQueueId {
        let id = self.next_cmdq;
        self.next_cmdq += 1;
        id
    }

    /// Enqueues `bytes` for transmission, blocking while `sent_queue` is full
    /// (spec §4.D backpressure / §5 suspension point).
    pub fn send(
        &self,
        cmdq: CommandQueueId,
        bytes: Vec<u8>,
        min_clock: u64,
        req_clock: u64,
    ) -> Result<(), CoreError> {
        if bytes.len() > MESSAGE_MAX {
            return Err(CoreError::MessageTooLarge);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.exiting || state.exited {
                return Err(CoreError::QueueClosed);
            }
            if state.sent_queue.len() < self.shared.sent_queue_max {
                break;
            }
            self.shared.not_full.wait(&mut state);
        }
        state.send_queue.push_back(Queued {
            cmdq,
            bytes,
            min_clock,
            req_clock,
        });
        self.shared.woken.notify_one();
        Ok(())
    }

    /// Blocks until one received message is available, or `deadline` elapses.
    pub fn pull(&self, deadline: Option<Duration>) -> Result<PulledMessage, CoreError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.receive_queue.pop_front() {
                return Ok(msg);
            }
            if state.exited {
                return Err(CoreError::QueueClosed);
            }
            let timed_out = match deadline {
                Some(d) => self.shared.not_empty.wait_for(&mut state, d).timed_out(),
                None => {
                    self.shared.not_empty.wait(&mut state);
                    false
                }
            };
            if timed_out {
                return Err(CoreError::Timeout);
            }
        }
    }

    pub fn set_clock_est(&self, est_freq: f64, last_ack_time: f64, last_ack_clock: u64) {
        let mut state = self.shared.state.lock();
        state.clock.update(est_freq, last_ack_time, last_ack_clock);
        self.shared.woken.notify_one();
    }

    pub fn set_baud_adjust(&self, baud_adjust: f64) {
        let mut state = self.shared.state.lock();
        state.clock.set_baud_adjust(baud_adjust);
    }

    /// Returns up to `count` recent entries, newest first, from the sent or
    /// received history (spec §4.D "bounded snapshot... for diagnostics").
    pub fn extract_old(&self, count: usize) -> Vec<HistoryEntry> {
        let state = self.shared.state.lock();
        state.history.iter().rev().take(count).cloned().collect()
    }

    pub fn stats(&self) -> Stats {
        self.shared.state.lock().stats
    }

    /// Signals the worker to drain `send_queue`, then shut down. Returns once
    /// the worker has exited — either because every queue drained, or
    /// because `EXIT_DRAIN_TIMEOUT` elapsed, whichever comes first (spec
    /// §4.D: "finish any in-flight acks up to a deadline, then close").
    /// After this, all operations fail with `QueueClosed`.
    pub fn exit(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !state.exiting {
                state.exiting = true;
                state.exit_deadline = Some(Instant::now() + EXIT_DRAIN_TIMEOUT);
            }
        }
        self.shared.woken.notify_all();
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.exit();
        }
    }
}

fn retransmit_timeout(last_rtt: f64, attempt: u32, min_retransmit: Duration) -> Duration {
    let base = Duration::from_secs_f64((RETRANSMIT_K * last_rtt).max(0.0));
    let base = base.clamp(min_retransmit, MAX_RETRANSMIT);
    let doubled = base.saturating_mul(1u32 << attempt.min(5));
    doubled.min(MAX_RETRANSMIT)
}

/// Selects the next eligible queued message: lowest `req_clock` among those
/// whose `min_clock` the estimated MCU clock has already reached, ties
/// broken by round-robin across command-queues (spec §4.D).
fn pick_eligible(state: &State, now_host: f64) -> Option<usize> {
    let mut best: Option<(usize, u64, CommandQueueId)> = None;
    for (idx, q) in state.send_queue.iter().enumerate() {
        if !state.clock.is_ready() {
            continue;
        }
        if !state.clock.is_eligible(now_host, q.min_clock, q.bytes.len()) {
            continue;
        }
        let better = match &best {
            None => true,
            Some((_, best_clock, best_cmdq)) => {
                q.req_clock < *best_clock
                    || (q.req_clock == *best_clock
                        && rr_distance(state.last_cmdq_served, q.cmdq)
                            < rr_distance(state.last_cmdq_served, *best_cmdq))
            }
        };
        if better {
            best = Some((idx, q.req_clock, q.cmdq));
        }
    }
    best.map(|(idx, _, _)| idx)
}

fn rr_distance(last: CommandQueueId, candidate: CommandQueueId) -> usize {
    candidate.wrapping_sub(last).wrapping_sub(1)
}

fn worker_loop(shared: Arc<Shared>, mut transport: Box<dyn SerialTransport>) {
    if let Err(e) = transport.set_read_timeout(POLL_INTERVAL) {
        warn!("serial queue: failed to set read timeout: {e}");
    }
    let mut rx_buf: Vec<u8> = Vec::with_capacity(MESSAGE_MAX * 4);
    let mut scratch = [0u8; MESSAGE_MAX];

    loop {
        // Receive side: best-effort read, then drain every complete frame.
        match transport.read(&mut scratch) {
            Ok(0) => {}
            Ok(n) => {
                rx_buf.extend_from_slice(&scratch[..n]);
                let mut state = shared.state.lock();
                state.stats.bytes_received += n as u64;
                drop(state);
                drain_frames(&shared, &mut rx_buf);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("serial queue: read error: {e}");
            }
        }

        let mut state = shared.state.lock();

        if state.exiting {
            let drained = state.send_queue.is_empty() && state.sent_queue.is_empty();
            let deadline_passed = state
                .exit_deadline
                .is_some_and(|deadline| Instant::now() >= deadline);
            if drained || deadline_passed {
                if deadline_passed && !drained {
                    warn!(
                        "serial queue: exit deadline reached with {} queued / {} unacked, force-closing",
                        state.send_queue.len(),
                        state.sent_queue.len()
                    );
                }
                state.exited = true;
                drop(state);
                shared.not_full.notify_all();
                shared.not_empty.notify_all();
                return;
            }
        }

        let now_host = now_host_time();

        // Retransmit the head of sent_queue if its timeout has elapsed.
        let due_retransmit = state.sent_queue.front().and_then(|head| {
            let rtt = state.stats.last_rtt.max(0.0);
            let timeout = retransmit_timeout(rtt, head.retransmits, shared.min_retransmit);
            if head.sent_at.elapsed() >= timeout {
                Some((head.seq, head.bytes.clone()))
            } else {
                None
            }
        });
        if let Some((seq, bytes)) = due_retransmit {
            if let Some(head) = state.sent_queue.front_mut() {
                head.sent_at = Instant::now();
                head.retransmits += 1;
            }
            state.stats.retransmits += 1;
            drop(state);
            send_frame(&mut transport, seq, &bytes, &shared);
            state = shared.state.lock();
        }

        // Send side: pick one eligible queued message and ship it.
        if let Some(idx) = pick_eligible(&state, now_host) {
            let q = state.send_queue.remove(idx).expect("index just selected");
            state.last_cmdq_served = q.cmdq;
            // The wire only carries the sequence's low 4 bits (frame.rs's
            // `SEQ_MASK`), and acks echo that masked value back
            // (`parse()`'s `seq = buf[1] & SEQ_MASK`) — mask here too so
            // `Sent.seq` is directly comparable against an ack's
            // `next_expected` in `handle_ack`, instead of drifting apart
            // once `send_seq` free-runs past 16.
            let seq = state.send_seq & SEQ_MASK;
            state.send_seq = state.send_seq.wrapping_add(1);
            state.sent_queue.push_back(Sent {
                seq,
                cmdq: q.cmdq,
                bytes: q.bytes.clone(),
                min_clock: q.min_clock,
                req_clock: q.req_clock,
                sent_at: Instant::now(),
                retransmits: 0,
            });
            shared.not_full.notify_one();
            drop(state);
            send_frame(&mut transport, seq, &q.bytes, &shared);
        } else {
            // Nothing to do right now; let the condvar-aware callers wake us,
            // but don't block forever so retransmit timers still fire.
            let _ = shared.woken.wait_for(&mut state, POLL_INTERVAL);
        }
    }
}

fn send_frame(transport: &mut Box<dyn SerialTransport>, seq: u8, payload: &[u8], shared: &Arc<Shared>) {
    match build_frame(seq, payload) {
        Ok(frame) => {
            if let Err(e) = transport.write_all(&frame) {
                warn!("serial queue: write error: {e}");
                return;
            }
            let mut state = shared.state.lock();
            state.stats.bytes_sent += frame.len() as u64;
        }
        Err(e) => {
            warn!("serial queue: failed to frame outgoing message: {e:?}");
        }
    }
}

/// Parses as many complete frames as `buf` holds, acking data frames and
/// reconciling acks against `sent_queue`; resyncs one byte at a time on
/// malformed leading bytes.
fn drain_frames(shared: &Arc<Shared>, buf: &mut Vec<u8>) {
    loop {
        match parse(buf) {
            Ok(Some(parsed)) => {
                let consumed = parsed.consumed;
                if is_ack_frame(&parsed) {
                    handle_ack(shared, parsed.seq);
                } else {
                    let payload = buf[parsed.payload_start..parsed.payload_end].to_vec();
                    handle_data_frame(shared, parsed.seq, payload);
                }
                buf.drain(..consumed);
            }
            Ok(None) => break,
            Err((err, consumed)) => {
                trace!("serial queue: resyncing after {err:?}");
                let mut state = shared.state.lock();
                state.stats.dropped_frames += 1;
                drop(state);
                buf.drain(..consumed);
            }
        }
    }
}

fn handle_ack(shared: &Arc<Shared>, next_expected: u8) {
    let mut state = shared.state.lock();
    let now = now_host_time();
    let mut acked_rtt: Option<f64> = None;
    while let Some(front) = state.sent_queue.front() {
        if front.seq == next_expected {
            break;
        }
        let sent = state.sent_queue.pop_front().expect("front checked above");
        let rtt = sent.sent_at.elapsed().as_secs_f64();
        acked_rtt = Some(rtt);
        push_history(
            &mut state,
            HistoryEntry {
                seq: sent.seq,
                bytes: sent.bytes,
                sent_time: now - rtt,
                receive_time: Some(now),
            },
        );
    }
    if let Some(rtt) = acked_rtt {
        state.stats.last_rtt = rtt;
    }
    drop(state);
    shared.not_full.notify_all();
}

fn handle_data_frame(shared: &Arc<Shared>, seq: u8, payload: Vec<u8>) {
    let mut state = shared.state.lock();
    state.receive_seq = seq.wrapping_add(1) & 0x0f;
    let now = now_host_time();
    state.receive_queue.push_back(PulledMessage {
        msg: payload,
        sent_time: now,
        receive_time: now,
    });
    drop(state);
    shared.not_empty.notify_all();
}

fn push_history(state: &mut State, entry: HistoryEntry) {
    state.history.push_back(entry);
    while state.history.len() > HISTORY_MAX {
        state.history.pop_front();
    }
}
