//! TOML configuration loader with validation.
//!
//! Compile-time defaults live in [`Settings::default`]; a TOML file may
//! override any subset of fields. `load()` runs parse → validate, the
//! same pipeline the rest of the controller expects at startup.
//!
//! Ring capacities and the line-buffer length are compile-time constants
//! because the motion pipeline allocates them statically.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::N_AXIS;

// ─── Compile-Time Capacities ────────────────────────────────────────

/// Planner ring capacity (one slot is always kept open).
pub const PLANNER_RING_SIZE: usize = 16;

/// Segment ring capacity (one slot is always kept open).
pub const SEGMENT_RING_SIZE: usize = 6;

/// Depth of the G-code line queue between CLI readers and the parser worker.
pub const GCODE_QUEUE_DEPTH: usize = 16;

/// Maximum accepted input line length, exclusive of the newline.
pub const LINE_BUFFER_LEN: usize = 80;

static_assertions::const_assert!(PLANNER_RING_SIZE >= 4);
static_assertions::const_assert!(SEGMENT_RING_SIZE >= 3);

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config validation: {0}")]
    Validation(String),
}

// ─── Settings ───────────────────────────────────────────────────────

/// Per-axis kinematic limits and scaling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Steps per millimetre of travel.
    pub steps_per_mm: f32,
    /// Maximum rate [mm/min].
    pub max_rate: f32,
    /// Maximum acceleration [mm/s²].
    pub acceleration: f32,
    /// Maximum travel from home [mm], positive magnitude.
    pub max_travel: f32,
}

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Axis order: X, Y, Z.
    pub axes: [AxisSettings; N_AXIS],
    /// Junction deviation distance [mm].
    pub junction_deviation: f32,
    /// Floor for computed junction speeds [mm/min].
    pub min_junction_speed: f32,
    /// Maximum chordal error when splitting arcs [mm].
    pub arc_tolerance: f32,
    /// Step generator tick frequency [Hz].
    pub step_frequency: u32,
    /// Driver microstep divisor.
    pub microsteps: u32,
    /// Segment preparer slice rate [segments/s].
    pub acceleration_ticks_per_second: u32,
    /// Maximum S word value (laser power ceiling).
    pub spindle_max: f32,
    /// Axes included in the homing cycle, as a bit mask.
    pub homing_axes_mask: u8,
    /// Per-axis homing direction: bit set = home toward positive travel.
    pub homing_dir_mask: u8,
    /// Homing seek rate [mm/min].
    pub homing_seek_rate: f32,
    /// Pull-off distance after a homing contact [mm].
    pub homing_pulloff: f32,
    /// CPU core the step generator is pinned to.
    pub stepper_cpu: usize,
    /// SCHED_FIFO priority of the step generator.
    pub stepper_priority: i32,
    /// SCHED_FIFO priority of the input watchers.
    pub watcher_priority: i32,
    /// TCP transport listen address.
    pub listen_addr: String,
    /// TCP transport listen port.
    pub listen_port: u16,
    /// Start the cycle automatically when a line queues motion.
    pub mdi_auto_start: bool,
    /// Root of the stepper driver attribute directory.
    pub sysfs_root: String,
    /// Pulse FIFO device path.
    pub pulse_fifo: String,
    /// Input event device delivering switch/limit records.
    pub event_device: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            axes: [
                AxisSettings {
                    steps_per_mm: 106.666,
                    max_rate: 8000.0,
                    acceleration: 800.0,
                    max_travel: 515.0,
                },
                AxisSettings {
                    steps_per_mm: 106.666,
                    max_rate: 8000.0,
                    acceleration: 800.0,
                    max_travel: 290.0,
                },
                AxisSettings {
                    steps_per_mm: 1600.0,
                    max_rate: 300.0,
                    acceleration: 30.0,
                    max_travel: 50.0,
                },
            ],
            junction_deviation: 0.01,
            min_junction_speed: 0.0,
            arc_tolerance: 0.002,
            step_frequency: 100_000,
            microsteps: 16,
            acceleration_ticks_per_second: 100,
            spindle_max: 255.0,
            homing_axes_mask: 0x03,
            homing_dir_mask: 0x03,
            homing_seek_rate: 1500.0,
            homing_pulloff: 2.0,
            stepper_cpu: 3,
            stepper_priority: 80,
            watcher_priority: 60,
            listen_addr: "0.0.0.0".into(),
            listen_port: 23023,
            mdi_auto_start: true,
            sysfs_root: "/sys/class/photon_stepper".into(),
            pulse_fifo: "/dev/photon_pulse".into(),
            event_device: "/dev/input/event0".into(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse settings from a TOML string (also used by tests).
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (idx, axis) in self.axes.iter().enumerate() {
            if axis.steps_per_mm <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "axis {idx}: steps_per_mm must be positive"
                )));
            }
            if axis.max_rate <= 0.0 || axis.acceleration <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "axis {idx}: max_rate and acceleration must be positive"
                )));
            }
            if axis.max_travel <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "axis {idx}: max_travel must be positive"
                )));
            }
            // Peak step rate must fit under half the tick frequency so
            // every step gets at least one spacer tick.
            let peak_step_rate = axis.max_rate / 60.0 * axis.steps_per_mm;
            if peak_step_rate > self.step_frequency as f32 / 2.0 {
                return Err(ConfigError::Validation(format!(
                    "axis {idx}: max step rate {peak_step_rate:.0}/s exceeds step_frequency/2"
                )));
            }
        }
        if self.junction_deviation < 0.0 {
            return Err(ConfigError::Validation(
                "junction_deviation must be non-negative".into(),
            ));
        }
        if self.arc_tolerance <= 0.0 {
            return Err(ConfigError::Validation(
                "arc_tolerance must be positive".into(),
            ));
        }
        if self.acceleration_ticks_per_second == 0 || self.step_frequency == 0 {
            return Err(ConfigError::Validation(
                "step_frequency and acceleration_ticks_per_second must be positive".into(),
            ));
        }
        if !self.microsteps.is_power_of_two() {
            return Err(ConfigError::Validation(
                "microsteps must be a power of two".into(),
            ));
        }
        if self.spindle_max <= 0.0 {
            return Err(ConfigError::Validation("spindle_max must be positive".into()));
        }
        if self.homing_seek_rate <= 0.0 || self.homing_pulloff <= 0.0 {
            return Err(ConfigError::Validation(
                "homing_seek_rate and homing_pulloff must be positive".into(),
            ));
        }
        Ok(())
    }
}
