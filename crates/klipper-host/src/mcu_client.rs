//! MCU Client
//!
//! Bridges the async G-code dispatcher to `mcu-link`'s synchronous motion
//! core (step compression, stepper sync, the clock-aware serial queue).
//!
//! Per spec §5, the serial queue's own worker is the only dedicated I/O
//! thread; everything else that touches a compressor or the sync object
//! runs cooperatively on a single host thread. That thread here is the
//! "motion worker" spawned by [`mcu_comm_loop`]: it owns every
//! `StepCompressor`, the `StepperSync`, and the `SerialQueue` handle, and is
//! fed commands over a `crossbeam_channel` from the async side so a full
//! `sent_queue` can block it without blocking the tokio runtime.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver as SyncReceiver, Sender as SyncSender};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::Receiver;
use tokio::time::sleep;
use tokio_serial::TTYPort;
use tracing::{error, info, warn};

use mcu_link::serialqueue::{CommandQueueId, SerialQueue};
use mcu_link::steppersync::StepperSync;
use mcu_link::stepcompress::StepCompressor;

use crate::config::PrinterConfig;
use crate::gcode::McuCommand;
use crate::kinematics::Step;
use crate::state::{PrinterState, PrinterStatus};

/// Wire id for `queue_step`, fixed here rather than resolved from a fetched
/// data dictionary: the connect-time `identify` handshake that negotiates
/// one is MCU-firmware territory, out of this crate's scope per spec §1.
const QUEUE_STEP_MSGID: u16 = 0x10;

const STEPPER_OIDS: [(&str, u8); 3] = [("stepper_x", 0), ("stepper_y", 1), ("stepper_z", 2)];

fn oid_for_motor(motor: &str) -> Option<u8> {
    STEPPER_OIDS
        .iter()
        .find(|(name, _)| *name == motor)
        .map(|(_, oid)| *oid)
}

fn steps_per_mm_for(config: &PrinterConfig, motor: &str) -> f32 {
    match motor {
        "stepper_x" => config.stepper_x.steps_per_mm,
        "stepper_y" => config.stepper_y.steps_per_mm,
        "stepper_z" => config.stepper_z.steps_per_mm,
        _ => 1.0,
    }
}

fn now_host_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The main task for the real MCU client.
pub async fn run_mcu_client(
    printer_config: Arc<PrinterConfig>,
    mut mcu_rx: Receiver<McuCommand>,
    state: Arc<Mutex<PrinterState>>,
) {
    let mcu_config = printer_config.mcu.clone();
    info!(
        "Attempting to connect to MCU at {} with baud rate {}",
        mcu_config.serial_port, mcu_config.baud_rate
    );

    loop {
        let builder = tokio_serial::new(&mcu_config.serial_port, mcu_config.baud_rate);
        match TTYPort::open(&builder) {
            Ok(port) => {
                info!("Successfully connected to MCU.");
                state.lock().status = PrinterStatus::Ready;
                state.lock().status_message = "Printer is ready".to_string();

                match mcu_comm_loop(port, &mut mcu_rx, printer_config.clone(), state.clone()).await
                {
                    Ok(true) => {
                        // mcu_rx itself closed; the dispatcher is gone, nothing left to serve.
                        return;
                    }
                    Ok(false) => {
                        // The motion worker exited on its own (e.g. emergency stop) while
                        // the dispatcher is still alive; reconnect instead of abandoning it.
                        warn!("motion worker exited; will attempt to reconnect.");
                    }
                    Err(e) => {
                        error!("MCU communication error: {}. Will attempt to reconnect.", e);
                    }
                }
            }
            Err(e) => {
                let error_msg = format!("Failed to connect to MCU: {}. Retrying in 5s.", e);
                warn!("{}", error_msg);
                let mut locked_state = state.lock();
                locked_state.status = PrinterStatus::Disconnected;
                locked_state.status_message = error_msg;
            }
        }

        sleep(Duration::from_secs(5)).await;
    }
}

/// Bridges `mcu_rx` to the synchronous motion worker until the channel
/// closes or the worker exits on its own (e.g. after an emergency stop).
///
/// Returns `Ok(true)` if `mcu_rx` itself closed (the G-code dispatcher is
/// gone for good) and `Ok(false)` if the motion worker exited early while
/// `mcu_rx` is still open — the caller should reconnect in the latter case
/// rather than treating the whole client as done.
async fn mcu_comm_loop(
    port: TTYPort,
    mcu_rx: &mut Receiver<McuCommand>,
    printer_config: Arc<PrinterConfig>,
    state: Arc<Mutex<PrinterState>>,
) -> Result<bool> {
    let (cmd_tx, cmd_rx): (SyncSender<McuCommand>, SyncReceiver<McuCommand>) =
        crossbeam_channel::unbounded();

    let worker_config = printer_config.clone();
    let worker_state = state.clone();
    let worker = std::thread::Builder::new()
        .name("motion-worker".into())
        .spawn(move || run_motion_worker(worker_config, Box::new(port), cmd_rx, worker_state))
        .context("failed to spawn motion worker thread")?;

    info!("MCU communication loop started.");
    let mut mcu_rx_closed = false;
    loop {
        let Some(command) = mcu_rx.recv().await else {
            mcu_rx_closed = true;
            break;
        };
        if cmd_tx.send(command).is_err() {
            // The motion worker has exited (e.g. emergency stop); stop forwarding.
            break;
        }
    }
    drop(cmd_tx);

    info!("MCU command channel closed. Exiting communication loop.");
    tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("motion worker thread panicked")?
        .map_err(|_| anyhow::anyhow!("motion worker thread panicked"))?;
    Ok(mcu_rx_closed)
}

/// Owns every `StepCompressor`, the `StepperSync`, and the `SerialQueue` for
/// the lifetime of one MCU connection. Runs on its own thread so a full
/// `sent_queue` (spec §4.D backpressure) blocks this worker, not the async
/// G-code dispatcher.
fn run_motion_worker(
    printer_config: Arc<PrinterConfig>,
    transport: Box<dyn mcu_link::serialqueue::SerialTransport>,
    cmd_rx: SyncReceiver<McuCommand>,
    state: Arc<Mutex<PrinterState>>,
) {
    let mcu = printer_config.mcu.clone();
    let compressors: Vec<Rc<RefCell<StepCompressor>>> = STEPPER_OIDS
        .iter()
        .map(|&(_, oid)| Rc::new(RefCell::new(StepCompressor::new(oid, QUEUE_STEP_MSGID, mcu.max_error_ticks))))
        .collect();
    let mut sync = StepperSync::new(compressors.clone());
    let mut queue = SerialQueue::new(transport, mcu.sent_queue_max, mcu.retransmit_timeout_ms);
    let cmdq: CommandQueueId = queue.alloc_command_queue();

    // Bootstrap the clock estimate from the configured nominal frequency; a
    // live connection would refine `est_freq`/`last_ack_clock` from the
    // MCU's periodic clock responses (spec §4.A), but negotiating those
    // requires the `identify` handshake this crate leaves external (§1).
    queue.set_clock_est(mcu.clock_freq_hz, now_host_time(), 0);

    let mut cursor_clock: u64 = 0;

    loop {
        let command = match cmd_rx.recv() {
            Ok(c) => c,
            Err(_) => {
                info!("motion worker: command channel closed, shutting down");
                break;
            }
        };

        match command {
            McuCommand::Move(steps) => {
                cursor_clock = apply_move(
                    &printer_config,
                    &compressors,
                    &mut sync,
                    &mut queue,
                    cmdq,
                    cursor_clock,
                    steps,
                );
            }
            McuCommand::Home => {
                for compressor in &compressors {
                    compressor.borrow_mut().reset(cursor_clock);
                }
                // No endstop-input channel exists in this offline harness
                // (endstop triggers are MCU-firmware territory, spec §1), so
                // the outcome is always `Completed` here; a live connection
                // would report `EndstopHit` back from the triggering oid's
                // last queue_step ack, which the branch below is ready to
                // consume (mcu-link's `HomingOutcome::EndstopHit`).
                let outcome = mcu_link::HomingOutcome::Completed;
                match outcome {
                    mcu_link::HomingOutcome::Completed => {
                        state.lock().homed = Some(true);
                        info!("homing: compressors reset at clock {cursor_clock}");
                    }
                    mcu_link::HomingOutcome::EndstopHit { stepper_oid, trigger_clock } => {
                        state.lock().homed = Some(false);
                        warn!(
                            "homing: endstop hit on oid {stepper_oid} at clock {trigger_clock}"
                        );
                    }
                }
            }
            McuCommand::EmergencyStop => {
                warn!("emergency stop: closing the MCU link");
                state.lock().status = PrinterStatus::Error;
                state.lock().status_message = "Emergency Stop".to_string();
                break;
            }
            McuCommand::GetTemp => {
                // Temperature reporting rides the MCU's thermal/ADC response
                // path, a collaborator out of this crate's scope (spec §1).
            }
        }
    }

    let total_errors: u64 = compressors.iter().map(|c| c.borrow().get_errors()).sum();
    if total_errors > 0 {
        warn!("motion worker: {total_errors} steps exceeded max_error over the connection");
    }
    queue.exit();
}

/// Converts one G-code move's per-motor step counts into absolute step
/// clocks (a constant-velocity model driven by the configured max
/// velocity), pushes them into each motor's compressor, flushes the
/// stepper-sync merge up to the move's end clock, and hands the merged
/// stream to the serial queue. Returns the new cursor clock.
fn apply_move(
    printer_config: &PrinterConfig,
    compressors: &[Rc<RefCell<StepCompressor>>],
    sync: &mut StepperSync,
    queue: &mut SerialQueue,
    cmdq: CommandQueueId,
    cursor_clock: u64,
    steps: Vec<Step>,
) -> u64 {
    let clock_freq_hz = printer_config.mcu.clock_freq_hz;
    let max_velocity = printer_config.printer.max_velocity.max(1) as f32;

    let mut move_end = cursor_clock;
    for step in steps {
        let Some(oid) = oid_for_motor(&step.motor) else {
            warn!("move references unknown motor {:?}; skipping", step.motor);
            continue;
        };
        let count = step.steps.unsigned_abs();
        if count == 0 {
            continue;
        }

        let steps_per_mm = steps_per_mm_for(printer_config, &step.motor).max(f32::EPSILON);
        let steps_per_sec = (max_velocity * steps_per_mm) as f64;
        let interval_ticks = clock_freq_hz / steps_per_sec.max(1.0);

        compressors[oid as usize]
            .borrow_mut()
            .push_factor(count, 0.0, cursor_clock as f64, interval_ticks);

        let end = cursor_clock + (count as f64 * interval_ticks).round() as u64;
        move_end = move_end.max(end);
    }

    for scheduled in sync.flush(move_end) {
        if let Err(e) = queue.send(cmdq, scheduled.bytes, scheduled.min_clock, scheduled.req_clock) {
            warn!("failed to send queue_step: {e}");
            break;
        }
    }

    move_end
}

/// The main task for the mock MCU client, used with `--mock-mcu`.
pub async fn run_mock_mcu(mut mcu_rx: Receiver<McuCommand>, state: Arc<Mutex<PrinterState>>) {
    info!("Mock MCU is running.");
    state.lock().status = PrinterStatus::Ready;
    state.lock().status_message = "Printer is ready (Mock MCU)".to_string();

    // Simulate periodic temperature updates.
    let temp_state = state.clone();
    tokio::spawn(async move {
        let mut rng = rand::thread_rng();
        loop {
            sleep(Duration::from_secs(2)).await;
            let mut locked_state = temp_state.lock();
            if let Some(extruder_temp) = locked_state.temperatures.get_mut("extruder") {
                extruder_temp.actual += rng.gen_range(-0.5..0.5);
            }
            if let Some(bed_temp) = locked_state.temperatures.get_mut("heater_bed") {
                bed_temp.actual += rng.gen_range(-0.5..0.5);
            }
        }
    });

    // Process incoming commands.
    while let Some(command) = mcu_rx.recv().await {
        info!("[Mock MCU] Received command: {:?}", command);
        sleep(Duration::from_millis(50)).await; // Simulate work
        info!("[Mock MCU] Command processed successfully.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_lookup_matches_configured_axes() {
        assert_eq!(oid_for_motor("stepper_x"), Some(0));
        assert_eq!(oid_for_motor("stepper_y"), Some(1));
        assert_eq!(oid_for_motor("stepper_z"), Some(2));
        assert_eq!(oid_for_motor("stepper_e"), None);
    }
}
