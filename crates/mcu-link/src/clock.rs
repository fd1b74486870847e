//! Bidirectional host <-> MCU clock estimation (spec §4.A).
//!
//! The host maintains an affine mapping `mcu_clock(t) ~= est_freq * (t -
//! last_ack_time) + last_ack_clock`, refreshed on every ack that carries an
//! MCU clock sample. The estimate is monotone non-decreasing in MCU clock by
//! construction: each update simply replaces the reference point, and
//! `est_freq` is always positive.

use crate::error::CoreError;

/// Affine host-time <-> MCU-clock mapping, updated from periodic acks.
#[derive(Debug, Clone, Copy)]
pub struct ClockEstimate {
    est_freq: f64,
    last_ack_clock: u64,
    last_ack_time: f64,
    baud_adjust: f64,
    ready: bool,
}

impl Default for ClockEstimate {
    fn default() -> Self {
        ClockEstimate {
            est_freq: 1.0,
            last_ack_clock: 0,
            last_ack_time: 0.0,
            baud_adjust: 0.0,
            ready: false,
        }
    }
}

impl ClockEstimate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a fresh ack sample. `est_freq` must be positive so the
    /// mapping stays monotone; non-positive samples are ignored.
    pub fn update(&mut self, est_freq: f64, last_ack_time: f64, last_ack_clock: u64) {
        if est_freq <= 0.0 {
            return;
        }
        self.est_freq = est_freq;
        self.last_ack_time = last_ack_time;
        self.last_ack_clock = last_ack_clock;
        self.ready = true;
    }

    pub fn set_baud_adjust(&mut self, baud_adjust: f64) {
        self.baud_adjust = baud_adjust;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Converts a host timestamp (seconds, monotonic clock) to an estimated
    /// MCU clock tick.
    pub fn host_to_mcu(&self, host_time: f64) -> Result<u64, CoreError> {
        if !self.ready {
            return Err(CoreError::ClockNotReady);
        }
        let delta = self.est_freq * (host_time - self.last_ack_time);
        Ok((self.last_ack_clock as f64 + delta).max(0.0) as u64)
    }

    /// Inverse of [`host_to_mcu`](Self::host_to_mcu).
    pub fn mcu_to_host(&self, mcu_clock: u64) -> Result<f64, CoreError> {
        if !self.ready {
            return Err(CoreError::ClockNotReady);
        }
        let delta = mcu_clock as f64 - self.last_ack_clock as f64;
        Ok(self.last_ack_time + delta / self.est_freq)
    }

    /// Whether a message due at `req_clock`, `msglen` bytes long, is eligible
    /// to go out now given on-wire delay compensation.
    pub fn is_eligible(&self, now_host_time: f64, min_clock: u64, msglen: usize) -> bool {
        match self.host_to_mcu(now_host_time) {
            Ok(now_mcu) => {
                let due = (min_clock as f64 - self.baud_adjust * msglen as f64).max(0.0);
                now_mcu as f64 >= due
            }
            Err(_) => false,
        }
    }
}
