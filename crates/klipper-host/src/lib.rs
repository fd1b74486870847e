//! Library half of the Klipper host process: G-code dispatch, printer state,
//! kinematics, and the MCU link. `main.rs` is a thin binary wrapper over
//! this crate so integration tests can exercise it directly.

pub mod api;
pub mod batch;
pub mod config;
pub mod gcode;
pub mod kinematics;
pub mod mcu_client;
pub mod state;
pub mod virtual_printer;
