//! Multi-stepper synchronization: interleave-merge of per-motor compressor
//! output up to a shared move clock (spec §4.C).
//!
//! The sync object holds a non-owning list of compressors (spec §3
//! "ownership/lifecycle"): compressors are created once per motor at
//! configuration time and must outlive the sync. `Rc<RefCell<_>>` is used
//! rather than borrowed references so the same compressor can also be held
//! directly by its owning stepper/kinematics code between sync flushes.

use std::cell::RefCell;
use std::rc::Rc;

use crate::stepcompress::StepCompressor;

/// A command ready for the serial queue, tagged with the scheduling fields
/// spec §3 attaches to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCommand {
    pub bytes: Vec<u8>,
    pub min_clock: u64,
    pub req_clock: u64,
}

/// Merges multiple compressors' output into one time-ordered stream.
pub struct StepperSync {
    compressors: Vec<Rc<RefCell<StepCompressor>>>,
    last_req_clock: Vec<u64>,
}

impl StepperSync {
    pub fn new(compressors: Vec<Rc<RefCell<StepCompressor>>>) -> Self {
        let last_req_clock = vec![0u64; compressors.len()];
        StepperSync {
            compressors,
            last_req_clock,
        }
    }

    pub fn add_stepper(&mut self, compressor: Rc<RefCell<StepCompressor>>) {
        self.compressors.push(compressor);
        self.last_req_clock.push(0);
    }

    /// Flushes every compressor up to `move_clock` and returns the merged
    /// stream ordered by `req_clock`, ties broken by stepper index (spec
    /// §4.C step 2 and §9's fixed open question).
    pub fn flush(&mut self, move_clock: u64) -> Vec<ScheduledCommand> {
        struct Tagged {
            stepper_idx: usize,
            req_clock: u64,
            bytes: Vec<u8>,
        }

        let mut merged: Vec<Tagged> = Vec::new();
        for (idx, compressor) in self.compressors.iter().enumerate() {
            let out = compressor.borrow_mut().flush(move_clock);
            for cmd in out {
                merged.push(Tagged {
                    stepper_idx: idx,
                    req_clock: cmd.req_clock,
                    bytes: cmd.bytes,
                });
            }
        }

        // stable sort: equal req_clock keeps arrival order, which is
        // already per-stepper-index ascending since compressors were
        // iterated in index order above.
        merged.sort_by_key(|t| t.req_clock);

        let mut scheduled = Vec::with_capacity(merged.len());
        for item in merged {
            let min_clock = self.last_req_clock[item.stepper_idx];
            self.last_req_clock[item.stepper_idx] = item.req_clock;
            scheduled.push(ScheduledCommand {
                bytes: item.bytes,
                min_clock,
                req_clock: item.req_clock,
            });
        }
        scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(oid: u8) -> Rc<RefCell<StepCompressor>> {
        Rc::new(RefCell::new(StepCompressor::new(oid, 0x10, 25)))
    }

    #[test]
    fn s4_ties_on_req_clock_break_by_stepper_index() {
        let a = compressor(0);
        let b = compressor(1);
        a.borrow_mut().reset(900);
        a.borrow_mut().push(1000);
        b.borrow_mut().reset(900);
        b.borrow_mut().push(1001);

        let mut sync = StepperSync::new(vec![a, b]);
        let cmds = sync.flush(2000);
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].req_clock <= cmds[1].req_clock);
        // A (index 0, req_clock 1000) must precede B (index 1, req_clock 1001).
        assert_eq!(cmds[0].req_clock, 1000);
        assert_eq!(cmds[1].req_clock, 1001);
    }

    #[test]
    fn min_clock_is_the_previous_req_clock_for_that_stepper() {
        let a = compressor(0);
        a.borrow_mut().reset(900);
        a.borrow_mut().push(1000);

        let mut sync = StepperSync::new(vec![a.clone()]);
        let first = sync.flush(1000);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].min_clock, 0);
        assert_eq!(first[0].req_clock, 1000);

        a.borrow_mut().push(1100);
        let second = sync.flush(1100);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].min_clock, 1000);
        assert_eq!(second[0].req_clock, 1100);
    }

    #[test]
    fn equal_req_clocks_preserve_stepper_index_order() {
        let a = compressor(0);
        let b = compressor(1);
        a.borrow_mut().reset(900);
        a.borrow_mut().push(1000);
        b.borrow_mut().reset(900);
        b.borrow_mut().push(1000);

        let mut sync = StepperSync::new(vec![a, b]);
        let cmds = sync.flush(1000);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].req_clock, 1000);
        assert_eq!(cmds[1].req_clock, 1000);
    }

    #[test]
    fn add_stepper_after_construction_participates_in_next_flush() {
        let a = compressor(0);
        a.borrow_mut().reset(900);
        a.borrow_mut().push(1000);

        let mut sync = StepperSync::new(vec![a]);
        let b = compressor(1);
        b.borrow_mut().reset(900);
        b.borrow_mut().push(1050);
        sync.add_stepper(b);

        let cmds = sync.flush(1100);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].req_clock, 1000);
        assert_eq!(cmds[1].req_clock, 1050);
    }
}
