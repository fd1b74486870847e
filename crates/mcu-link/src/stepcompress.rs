//! Step compression: absolute step clocks -> parametric `queue_step` runs
//! (spec §4.B).
//!
//! The bisection search below is adapted from Klipper's own
//! `stepcompress.c` (by way of the Rust port in this workspace's reference
//! pack, `step_compressor.rs`): for the pending run of absolute clocks it
//! searches for the longest prefix representable as a single `(interval,
//! add)` pair such that every reconstructed step lands within `max_error` of
//! its input. Unlike the upstream C, this compressor has no notion of step
//! direction or position history — `spec.md` §4.B's public contract pushes
//! bare absolute clocks, so that bookkeeping (and the `SDS_FILTER` direction
//! logic it exists to support) is out of scope here.

use std::collections::VecDeque;

use klipper_proto::commands::{encode_queue_step, CommandQueueStep};

/// One compressed command ready to hand to the serial queue, tagged with the
/// clock of its first reconstructed step (`req_clock` in spec §3/§4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutCommand {
    pub bytes: Vec<u8>,
    pub req_clock: u64,
}

enum Pending {
    Step(u64),
    Msg(Vec<u8>),
}

/// Per-motor compressor state (spec §3 "Step-compressor state").
pub struct StepCompressor {
    oid: u8,
    queue_step_msgid: u16,
    max_error: u32,
    last_step_clock: u64,
    last_pushed_clock: Option<u64>,
    pending: VecDeque<Pending>,
    error_count: u64,
}

/// Feasible window `[minp, maxp]` (relative to `last_step_clock`) for one
/// pending step, derived the same way upstream Klipper derives it: half the
/// gap to the previous point, clamped to `max_error`, giving runs headroom
/// to keep extending rather than immediately saturating the error budget.
struct Window {
    minp: i64,
    maxp: i64,
}

fn windows(points: &[i64], max_error: i64) -> Vec<Window> {
    let mut out = Vec::with_capacity(points.len());
    let mut prev = 0i64;
    for &p in points {
        let mut half = (p - prev) / 2;
        if half > max_error {
            half = max_error;
        }
        out.push(Window {
            minp: p - half,
            maxp: p,
        });
        prev = p;
    }
    out
}

/// Result of searching for the best `(interval, add)` run over a prefix.
struct StepMove {
    interval: u32,
    count: u16,
    add: i16,
}

/// Checks whether `(interval, add)` reconstructs every point in
/// `windows[..count]` within its feasible window, and keeps the running
/// interval within the MCU's 32-bit field throughout.
fn check_line(windows: &[Window], interval: i64, add: i64) -> bool {
    let mut running = interval;
    let mut total = 0i64;
    for w in windows {
        if running < 0 || running > i64::from(u32::MAX) {
            return false;
        }
        total += running;
        if total < w.minp || total > w.maxp {
            return false;
        }
        running += add;
    }
    true
}

/// Cumulative total after `count` steps of `(interval, add)` — i.e. the run's
/// final position relative to `last_step_clock`. Used as the tie-break
/// "reach": the candidate that banks the largest total leaves the most
/// headroom for the run to keep extending past this window.
fn reach_of(interval: i64, add: i64, count: i64) -> i64 {
    interval * count + add * count * (count - 1) / 2
}

/// Finds the longest run starting at the front of `points` (already
/// windowed) that some `(interval, add)` reproduces within error, bisecting
/// on `add` for each candidate count. Mirrors the shape of Klipper's
/// `compress_bisect_add`, simplified since this compressor tracks no
/// direction/history state.
fn compress_bisect_add(points: &[i64], max_error: u32) -> StepMove {
    let all_windows = windows(points, max_error as i64);
    debug_assert!(!all_windows.is_empty());

    // Single-step run: an exact hit, no search needed.
    if all_windows.len() == 1 {
        let w = &all_windows[0];
        let interval = w.maxp.clamp(0, i64::from(u32::MAX));
        return StepMove {
            interval: interval as u32,
            count: 1,
            add: 0,
        };
    }

    let mut best_count = 1usize;
    let mut best_interval: i64 = all_windows[0].maxp;
    let mut best_add: i64 = 0;

    // Extend the run one point at a time; for each candidate length, search
    // a small neighborhood of `add` values (bounded by how far the first
    // window can move) for one that keeps every point in range. Among valid
    // candidates, prefer the one that maximizes "reach" — the cumulative
    // total at the run's last (i.e. next-unconsumed-step's) window, matching
    // Klipper's own `compress_bisect_add`/`bestreach` comparison: banking the
    // largest feasible total against the last window leaves the most
    // headroom for the run to keep extending, rather than just landing near
    // the midpoint of the first step's window. Ties broken by larger
    // interval.
    'grow: for count in 2..=all_windows.len() {
        let slice = &all_windows[..count];
        let first = &slice[0];

        // Bound the search: add can range so that count*add doesn't overrun
        // the last window's slack relative to a flat (add=0) run.
        let last = &slice[count - 1];
        let span = (last.maxp - last.minp).max(1) + (first.maxp - first.minp).max(1);
        let add_bound = (span / (count as i64)).max(1) + 1;

        let mut found: Option<(i64, i64)> = None;
        let mut best_reach = i64::MIN;
        for add in -add_bound..=add_bound {
            for interval in first.minp..=first.maxp {
                if !check_line(slice, interval, add) {
                    continue;
                }
                let reach = reach_of(interval, add, count as i64);
                let better = match found {
                    None => true,
                    Some((found_interval, _)) => {
                        reach > best_reach || (reach == best_reach && interval > found_interval)
                    }
                };
                if better {
                    best_reach = reach;
                    found = Some((interval, add));
                }
            }
        }

        match found {
            Some((interval, add)) => {
                best_count = count;
                best_interval = interval;
                best_add = add;
            }
            None => break 'grow,
        }
    }

    StepMove {
        interval: best_interval.clamp(0, i64::from(u32::MAX)) as u32,
        count: best_count as u16,
        add: best_add.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16,
    }
}

impl StepCompressor {
    pub fn new(oid: u8, queue_step_msgid: u16, max_error: u32) -> Self {
        StepCompressor {
            oid,
            queue_step_msgid,
            max_error,
            last_step_clock: 0,
            last_pushed_clock: None,
            pending: VecDeque::new(),
            error_count: 0,
        }
    }

    /// Appends one absolute step clock; must be >= every previously pushed
    /// clock. Duplicate clocks are collapsed and counted (spec §4.B edge
    /// case).
    pub fn push(&mut self, step_clock: u64) {
        if let Some(last) = self.last_pushed_clock {
            if step_clock == last {
                self.error_count += 1;
                return;
            }
        } else if step_clock == self.last_step_clock {
            self.error_count += 1;
            return;
        }
        self.last_pushed_clock = Some(step_clock);
        self.pending.push_back(Pending::Step(step_clock));
    }

    /// Bulk enqueue of an arithmetic progression of step clocks (constant
    /// velocity): `clock_offset + (step_offset + i) * factor` for `i` in
    /// `1..=steps`.
    pub fn push_factor(&mut self, steps: u32, step_offset: f64, clock_offset: f64, factor: f64) {
        for i in 1..=steps {
            let clock = clock_offset + (step_offset + i as f64) * factor;
            self.push(clock.round() as u64);
        }
    }

    /// Bulk enqueue of a square-root progression of step clocks (constant
    /// acceleration): `clock_offset + factor * sqrt(sqrt_offset + step_offset + i)`.
    pub fn push_sqrt(
        &mut self,
        steps: u32,
        step_offset: f64,
        clock_offset: f64,
        sqrt_offset: f64,
        factor: f64,
    ) {
        for i in 1..=steps {
            let clock = clock_offset + factor * (sqrt_offset + step_offset + i as f64).sqrt();
            self.push(clock.round() as u64);
        }
    }

    /// Enqueues a pre-formed message to be emitted in-band, preserving order
    /// relative to steps pushed before and after it.
    pub fn queue_msg(&mut self, buf: Vec<u8>) {
        self.pending.push_back(Pending::Msg(buf));
    }

    /// Discards pending state and sets a new reference clock, e.g. after a
    /// homing/endstop trigger.
    pub fn reset(&mut self, last_step_clock: u64) {
        self.pending.clear();
        self.last_pushed_clock = None;
        self.last_step_clock = last_step_clock;
    }

    pub fn get_errors(&self) -> u64 {
        self.error_count
    }

    pub fn oid(&self) -> u8 {
        self.oid
    }

    pub fn last_step_clock(&self) -> u64 {
        self.last_step_clock
    }

    /// Emits all complete `queue_step` commands whose last step clock is
    /// `<= move_clock`, preserving the relative order of interleaved
    /// `queue_msg` messages.
    pub fn flush(&mut self, move_clock: u64) -> Vec<OutCommand> {
        let mut out = Vec::new();
        loop {
            match self.pending.front() {
                None => break,
                Some(Pending::Msg(_)) => {
                    let Some(Pending::Msg(bytes)) = self.pending.pop_front() else {
                        unreachable!()
                    };
                    out.push(OutCommand {
                        bytes,
                        req_clock: self.last_step_clock,
                    });
                }
                Some(Pending::Step(_)) => {
                    let run_len = self
                        .pending
                        .iter()
                        .take_while(|p| matches!(p, Pending::Step(c) if *c <= move_clock))
                        .count();
                    if run_len == 0 {
                        break;
                    }
                    self.compress_run(run_len, &mut out);
                }
            }
        }
        out
    }

    /// Compresses the first `run_len` pending steps (all already confirmed
    /// `<= move_clock`), possibly emitting more than one command if the run
    /// doesn't fit the error budget or the 32-bit field in one piece.
    fn compress_run(&mut self, run_len: usize, out: &mut Vec<OutCommand>) {
        let mut clocks: Vec<u64> = Vec::with_capacity(run_len);
        for _ in 0..run_len {
            if let Some(Pending::Step(c)) = self.pending.pop_front() {
                clocks.push(c);
            }
        }

        let mut idx = 0;
        while idx < clocks.len() {
            let points: Vec<i64> = clocks[idx..]
                .iter()
                .map(|&c| (c - self.last_step_clock) as i64)
                .collect();
            let mv = compress_bisect_add(&points, self.max_error);
            let count = mv.count as usize;

            let first_clock = clocks[idx];
            let last_clock = clocks[idx + count - 1];

            // Verify the chosen run actually honors max_error on every step;
            // a search bug here must never silently desync the MCU, so any
            // miss is counted and the run is split at the offending step.
            let mut running = mv.interval as i64;
            let mut total = 0i64;
            let mut actual_count = 0usize;
            for &c in &clocks[idx..idx + count] {
                total += running;
                let target = (c - self.last_step_clock) as i64;
                if (total - target).unsigned_abs() > self.max_error as u64 {
                    break;
                }
                actual_count += 1;
                running += mv.add as i64;
            }
            let actual_count = actual_count.max(1);

            // `mv.add` is exactly the run the verification loop above just
            // checked step-by-step (it accumulates `running += mv.add`), so
            // the truncated `actual_count`-step run must keep it too —
            // forcing `add` to 0 here would encode a different, unverified
            // sequence (a flat run) that could itself violate max_error.
            let mut payload = Vec::new();
            encode_queue_step(
                self.queue_step_msgid,
                CommandQueueStep {
                    oid: self.oid,
                    interval: mv.interval,
                    count: actual_count as u16,
                    add: mv.add,
                },
                &mut payload,
            );

            if actual_count < count {
                self.error_count += (count - actual_count) as u64;
            }

            self.last_step_clock = if actual_count == count {
                last_clock
            } else {
                clocks[idx + actual_count - 1]
            };

            out.push(OutCommand {
                bytes: payload,
                req_clock: first_clock,
            });

            idx += actual_count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(last_step_clock: u64, interval: u32, count: u16, add: i16) -> Vec<u64> {
        let mut t = last_step_clock as i64;
        let mut running = interval as i64;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            t += running;
            out.push(t as u64);
            running += add as i64;
        }
        out
    }

    #[test]
    fn s1_constant_interval_run() {
        let mut c = StepCompressor::new(2, 0x10, 25);
        c.reset(900);
        for clock in (1000..=2000).step_by(100) {
            c.push(clock);
        }
        let cmds = c.flush(2000);
        assert_eq!(cmds.len(), 1);
        assert_eq!(c.last_step_clock(), 2000);
        assert_eq!(c.get_errors(), 0);

        let (_msgid, n) = klipper_proto::vlq::decode_uint(&cmds[0].bytes).unwrap();
        let step = klipper_proto::commands::decode_queue_step(&cmds[0].bytes[n..]).unwrap();
        assert_eq!(step.count, 11);
        assert_eq!(step.add, 0);
        let rec = reconstruct(900, step.interval, step.count, step.add);
        assert_eq!(rec, (1000..=2000).step_by(100).collect::<Vec<_>>());
    }

    #[test]
    fn accelerating_run_reproduces_within_error() {
        let max_error = 25;
        let mut c = StepCompressor::new(0, 0x10, max_error);
        c.reset(890);
        let targets = [1000u64, 1110, 1230, 1360, 1500];
        for &t in &targets {
            c.push(t);
        }
        let cmds = c.flush(1500);
        assert_eq!(c.get_errors(), 0);

        let mut last_clock = 890u64;
        let mut reconstructed = Vec::new();
        for cmd in &cmds {
            let (_msgid, n) = klipper_proto::vlq::decode_uint(&cmd.bytes).unwrap();
            let step = klipper_proto::commands::decode_queue_step(&cmd.bytes[n..]).unwrap();
            let rec = reconstruct(last_clock, step.interval, step.count, step.add);
            last_clock = *rec.last().unwrap();
            reconstructed.extend(rec);
        }
        assert_eq!(reconstructed.len(), targets.len());
        for (r, t) in reconstructed.iter().zip(targets.iter()) {
            assert!(
                (*r as i64 - *t as i64).unsigned_abs() <= max_error as u64,
                "reconstructed {r} too far from target {t}"
            );
        }
    }

    #[test]
    fn duplicate_consecutive_clocks_are_collapsed_and_counted() {
        let mut c = StepCompressor::new(0, 0x10, 10);
        c.reset(900);
        c.push(1000);
        c.push(1000);
        c.push(1100);
        assert_eq!(c.get_errors(), 1);
        let cmds = c.flush(1100);
        assert_eq!(cmds.len(), 1);
    }

    #[test]
    fn reset_mid_stream_starts_a_fresh_run() {
        let mut c = StepCompressor::new(0, 0x10, 10);
        c.reset(900);
        c.push(1000);
        c.push(1100);
        let first = c.flush(1100);
        assert_eq!(first.len(), 1);
        assert_eq!(c.last_step_clock(), 1100);

        c.reset(5000);
        c.push(5100);
        c.push(5200);
        let second = c.flush(5200);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].req_clock, 5100);
    }

    #[test]
    fn queue_msg_preserves_order_relative_to_steps() {
        let mut c = StepCompressor::new(0, 0x10, 10);
        c.push(1000);
        c.queue_msg(vec![0xAA]);
        c.push(1100);
        let cmds = c.flush(1100);
        // the marker message must land after the step(s) pushed before it.
        assert!(cmds.len() >= 2);
        assert_eq!(cmds[1].bytes, vec![0xAA]);
    }

    #[test]
    fn flush_only_emits_steps_up_to_move_clock() {
        let mut c = StepCompressor::new(0, 0x10, 10);
        c.push(1000);
        c.push(2000);
        c.push(3000);
        let cmds = c.flush(2000);
        assert!(!cmds.is_empty());
        assert_eq!(c.last_step_clock(), 2000);
        // the step at 3000 must still be pending
        let more = c.flush(3000);
        assert!(!more.is_empty());
        assert_eq!(c.last_step_clock(), 3000);
    }
}
