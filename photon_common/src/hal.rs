//! Stepper hardware trait and error types.
//!
//! This module defines the hardware surface the motion pipeline consumes:
//! a pulse FIFO taking single bytes, a device state attribute, run/stop
//! and enable/disable controls, a step-frequency attribute, and per-axis
//! driver register sets addressed by attribute name.
//!
//! Concrete drivers live in `photon_hal` (sysfs-backed hardware and a
//! simulation driver); the trait lives here so the motion crate never
//! depends on a specific backend.
//!
//! # Lifecycle
//!
//! 1. `bring_up()` - write + verify driver registers, set step frequency
//!    (pre-RT, may block)
//! 2. `enable()` → `push_pulses()`/`run()` from the step generator
//! 3. `stop()`/`disable()` on idle, sleep, alarm, or fault
//!
//! # Timing contract
//!
//! `push_pulses()` and `state()` are called from the hard-RT step
//! generator and must not block beyond the FIFO write itself.

use thiserror::Error;

/// Error type for hardware operations. Every variant maps onto a fault
/// condition; there is no soft-retry surface except register bring-up.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Attribute file missing where the driver expected one.
    #[error("missing attribute: {0}")]
    MissingAttribute(String),

    /// Pulse FIFO could not be opened or written.
    #[error("pulse FIFO error: {0}")]
    Fifo(String),

    /// Attribute read/write failed.
    #[error("attribute I/O error on {name}: {reason}")]
    AttributeIo { name: String, reason: String },

    /// Attribute contents could not be parsed.
    #[error("malformed attribute {name}: {value:?}")]
    Malformed { name: String, value: String },

    /// Register verification did not converge during bring-up.
    #[error("register {name} on axis {axis} failed verification")]
    RegisterVerify { axis: usize, name: String },
}

/// Reported state of the stepper device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwState {
    /// Drivers unpowered.
    Disabled,
    /// Powered, FIFO not streaming.
    Idle,
    /// FIFO streaming pulses.
    Running,
}

impl HwState {
    /// Parse the state attribute contents.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "disabled" => Some(Self::Disabled),
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            _ => None,
        }
    }
}

/// One register initialization entry for bring-up.
#[derive(Debug, Clone, Copy)]
pub struct RegInit {
    /// Attribute name within the axis register directory.
    pub name: &'static str,
    /// 64-bit register value.
    pub value: u64,
}

/// Interface to the stepper hardware.
pub trait StepperHw: Send {
    /// Power the drivers up.
    fn enable(&mut self) -> Result<(), HalError>;

    /// Power the drivers down.
    fn disable(&mut self) -> Result<(), HalError>;

    /// Start streaming the pulse FIFO.
    fn run(&mut self) -> Result<(), HalError>;

    /// Stop streaming the pulse FIFO.
    fn stop(&mut self) -> Result<(), HalError>;

    /// Read the device state attribute.
    fn state(&mut self) -> Result<HwState, HalError>;

    /// Program the tick frequency [Hz].
    fn set_step_frequency(&mut self, hz: u32) -> Result<(), HalError>;

    /// Append pulse bytes to the FIFO. Returns the number accepted,
    /// which may be short when the FIFO is near full.
    fn push_pulses(&mut self, bytes: &[u8]) -> Result<usize, HalError>;

    /// Read one 64-bit driver register by attribute name.
    fn read_reg(&mut self, axis: usize, name: &str) -> Result<u64, HalError>;

    /// Write one 64-bit driver register by attribute name.
    fn write_reg(&mut self, axis: usize, name: &str, value: u64) -> Result<(), HalError>;
}

/// Number of verification polls during register bring-up.
pub const REG_VERIFY_POLLS: u32 = 10;

/// Interval between verification polls.
pub const REG_VERIFY_INTERVAL: std::time::Duration = std::time::Duration::from_micros(100);

/// Write the register table to every axis and verify each value with up
/// to [`REG_VERIFY_POLLS`] polls at [`REG_VERIFY_INTERVAL`] before
/// declaring a fault.
pub fn bring_up(
    hw: &mut dyn StepperHw,
    table: &[RegInit],
    axes: usize,
    step_frequency: u32,
) -> Result<(), HalError> {
    for axis in 0..axes {
        for reg in table {
            hw.write_reg(axis, reg.name, reg.value)?;
            let mut verified = false;
            for _ in 0..REG_VERIFY_POLLS {
                if hw.read_reg(axis, reg.name)? == reg.value {
                    verified = true;
                    break;
                }
                std::thread::sleep(REG_VERIFY_INTERVAL);
            }
            if !verified {
                return Err(HalError::RegisterVerify {
                    axis,
                    name: reg.name.to_string(),
                });
            }
        }
    }
    hw.set_step_frequency(step_frequency)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hw_state_parse() {
        assert_eq!(HwState::parse("disabled\n"), Some(HwState::Disabled));
        assert_eq!(HwState::parse("idle"), Some(HwState::Idle));
        assert_eq!(HwState::parse(" running "), Some(HwState::Running));
        assert_eq!(HwState::parse("bogus"), None);
    }
}
