//! Klipper Configuration Loader
//!
//! This module is responsible for parsing and interpreting Klipper's `printer.cfg`
//! file format using an INI-style parser. It provides strongly-typed structs
//! for accessing configuration values.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::path::Path;

/// Represents the [mcu] section of the config.
#[derive(Debug, Clone)]
pub struct McuConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    /// Maximum permitted per-step timing deviation, in MCU ticks (mcu-link's
    /// `StepCompressor::max_error`).
    pub max_error_ticks: u32,
    /// Base retransmit timeout for the serial queue, milliseconds.
    pub retransmit_timeout_ms: u32,
    /// Backpressure depth of the serial queue's in-flight `sent_queue`.
    pub sent_queue_max: usize,
    /// Assumed MCU clock frequency (ticks/second) used to bootstrap the
    /// clock estimate (`mcu-link`'s `ClockEstimate`) before the first real
    /// sample refines it.
    pub clock_freq_hz: f64,
}

const DEFAULT_MAX_ERROR_TICKS: u32 = 25;
const DEFAULT_RETRANSMIT_TIMEOUT_MS: u32 = 20;
const DEFAULT_SENT_QUEUE_MAX: usize = 32;
const DEFAULT_CLOCK_FREQ_HZ: f64 = 16_000_000.0;

/// Represents a generic [stepper] section.
#[derive(Debug, Clone)]
pub struct StepperConfig {
    pub steps_per_mm: f32,
    pub max_velocity: f32,
}

/// Represents the main [printer] section.
#[derive(Debug, Clone)]
pub struct PrinterInfoConfig {
    pub kinematics: String,
    pub max_velocity: u32,
    pub max_accel: u32,
}

/// Holds the entire parsed printer configuration.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub mcu: McuConfig,
    pub printer: PrinterInfoConfig,
    pub stepper_x: StepperConfig,
    pub stepper_y: StepperConfig,
    pub stepper_z: StepperConfig,
}

/// Reads a required `u64` key, surfacing both "parse failed" and "key
/// missing" as one contextual error.
fn required_uint(config: &Ini, section: &str, key: &str) -> Result<u64> {
    config
        .getuint(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key} is not a valid integer"))?
        .with_context(|| format!("[{section}] {key} not found"))
}

/// Reads a required `f64` key, same shape as [`required_uint`].
fn required_float(config: &Ini, section: &str, key: &str) -> Result<f64> {
    config
        .getfloat(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key} is not a valid number"))?
        .with_context(|| format!("[{section}] {key} not found"))
}

/// Reads an optional `u64` key, defaulting when absent or unparseable.
fn optional_uint(config: &Ini, section: &str, key: &str, default: u64) -> u64 {
    config
        .getuint(section, key)
        .ok()
        .flatten()
        .unwrap_or(default)
}

/// Reads an optional `f64` key, defaulting when absent or unparseable.
fn optional_float(config: &Ini, section: &str, key: &str, default: f64) -> f64 {
    config
        .getfloat(section, key)
        .ok()
        .flatten()
        .unwrap_or(default)
}

impl PrinterConfig {
    /// Loads and parses the configuration file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Failed to load configuration file: {path:?}"))?;

        let mcu = McuConfig {
            serial_port: config.get("mcu", "serial").context("[mcu] serial not found")?,
            baud_rate: required_uint(&config, "mcu", "baud")? as u32,
            max_error_ticks: optional_uint(&config, "mcu", "max_error_ticks", DEFAULT_MAX_ERROR_TICKS.into())
                as u32,
            retransmit_timeout_ms: optional_uint(
                &config,
                "mcu",
                "retransmit_timeout_ms",
                DEFAULT_RETRANSMIT_TIMEOUT_MS.into(),
            ) as u32,
            sent_queue_max: optional_uint(&config, "mcu", "sent_queue_max", DEFAULT_SENT_QUEUE_MAX as u64)
                as usize,
            clock_freq_hz: optional_float(&config, "mcu", "clock_freq_hz", DEFAULT_CLOCK_FREQ_HZ),
        };

        let printer = PrinterInfoConfig {
            kinematics: config.get("printer", "kinematics").context("[printer] kinematics not found")?,
            max_velocity: required_uint(&config, "printer", "max_velocity")? as u32,
            max_accel: required_uint(&config, "printer", "max_accel")? as u32,
        };

        let stepper_x = Self::load_stepper(&config, "stepper_x")?;
        let stepper_y = Self::load_stepper(&config, "stepper_y")?;
        let stepper_z = Self::load_stepper(&config, "stepper_z")?;

        Ok(Self {
            mcu,
            printer,
            stepper_x,
            stepper_y,
            stepper_z,
        })
    }

    /// Helper function to load a stepper configuration section.
    fn load_stepper(config: &Ini, section: &str) -> Result<StepperConfig> {
        Ok(StepperConfig {
            steps_per_mm: required_float(config, section, "steps_per_mm")? as f32,
            max_velocity: required_float(config, section, "max_velocity")? as f32,
        })
    }
}
