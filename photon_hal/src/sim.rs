//! Simulation stepper driver.
//!
//! Implements the full [`StepperHw`] surface in memory for tests and
//! `--simulate` runs: pushed pulse bytes are recorded and decoded back
//! into signed per-axis step counts, registers settle after a
//! configurable number of polls so the bring-up retry path can be
//! exercised, and the FIFO can be given a finite capacity to provoke
//! short writes.

use std::collections::HashMap;

use photon_common::N_AXIS;
use photon_common::hal::{HalError, HwState, StepperHw};

/// In-memory stand-in for the stepper hardware.
pub struct SimStepper {
    state: HwState,
    regs: HashMap<(usize, String), u64>,
    /// Reads return zero for this many polls after each write.
    settle_polls: u32,
    pending_settle: HashMap<(usize, String), u32>,
    step_frequency: u32,
    pulses: Vec<u8>,
    fifo_capacity: Option<usize>,
}

impl SimStepper {
    pub fn new() -> Self {
        Self {
            state: HwState::Disabled,
            regs: HashMap::new(),
            settle_polls: 0,
            pending_settle: HashMap::new(),
            step_frequency: 0,
            pulses: Vec::new(),
            fifo_capacity: None,
        }
    }

    /// Registers read back zero for `polls` reads after each write,
    /// mimicking slow driver latching.
    pub fn with_register_settle(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Limit how many un-consumed bytes the FIFO accepts.
    pub fn with_fifo_capacity(mut self, capacity: usize) -> Self {
        self.fifo_capacity = Some(capacity);
        self
    }

    /// Every pulse byte pushed so far.
    pub fn pulses(&self) -> &[u8] {
        &self.pulses
    }

    pub fn step_frequency(&self) -> u32 {
        self.step_frequency
    }

    pub fn hw_state(&self) -> HwState {
        self.state
    }

    /// Decode the pulse stream into signed per-axis step counts.
    pub fn step_counts(&self) -> [i64; N_AXIS] {
        let mut counts = [0i64; N_AXIS];
        for byte in &self.pulses {
            for axis in 0..N_AXIS {
                if byte & (1 << axis) != 0 {
                    if byte & (0x10 << axis) != 0 {
                        counts[axis] -= 1;
                    } else {
                        counts[axis] += 1;
                    }
                }
            }
        }
        counts
    }
}

impl Default for SimStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl StepperHw for SimStepper {
    fn enable(&mut self) -> Result<(), HalError> {
        if self.state == HwState::Disabled {
            self.state = HwState::Idle;
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<(), HalError> {
        self.state = HwState::Disabled;
        Ok(())
    }

    fn run(&mut self) -> Result<(), HalError> {
        if self.state == HwState::Disabled {
            return Err(HalError::AttributeIo {
                name: "run".to_string(),
                reason: "device disabled".to_string(),
            });
        }
        self.state = HwState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HalError> {
        if self.state == HwState::Running {
            self.state = HwState::Idle;
        }
        Ok(())
    }

    fn state(&mut self) -> Result<HwState, HalError> {
        Ok(self.state)
    }

    fn set_step_frequency(&mut self, hz: u32) -> Result<(), HalError> {
        self.step_frequency = hz;
        Ok(())
    }

    fn push_pulses(&mut self, bytes: &[u8]) -> Result<usize, HalError> {
        let accepted = match self.fifo_capacity {
            Some(capacity) => bytes.len().min(capacity.saturating_sub(self.pulses.len())),
            None => bytes.len(),
        };
        self.pulses.extend_from_slice(&bytes[..accepted]);
        Ok(accepted)
    }

    fn read_reg(&mut self, axis: usize, name: &str) -> Result<u64, HalError> {
        let key = (axis, name.to_string());
        if let Some(remaining) = self.pending_settle.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(0);
            }
        }
        Ok(self.regs.get(&key).copied().unwrap_or(0))
    }

    fn write_reg(&mut self, axis: usize, name: &str, value: u64) -> Result<(), HalError> {
        let key = (axis, name.to_string());
        if self.settle_polls > 0 {
            self.pending_settle.insert(key.clone(), self.settle_polls);
        }
        self.regs.insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_common::hal::{REG_VERIFY_POLLS, RegInit, bring_up};

    #[test]
    fn lifecycle_transitions() {
        let mut hw = SimStepper::new();
        assert_eq!(hw.hw_state(), HwState::Disabled);
        assert!(hw.run().is_err());
        hw.enable().unwrap();
        hw.run().unwrap();
        assert_eq!(hw.hw_state(), HwState::Running);
        hw.stop().unwrap();
        assert_eq!(hw.hw_state(), HwState::Idle);
    }

    #[test]
    fn step_counts_decode_directions() {
        let mut hw = SimStepper::new();
        // Two +X steps, one -Y step, spacers interleaved.
        hw.push_pulses(&[0x01, 0x00, 0x01, 0x22, 0x20]).unwrap();
        assert_eq!(hw.step_counts(), [2, -1, 0]);
    }

    #[test]
    fn fifo_capacity_causes_short_writes() {
        let mut hw = SimStepper::new().with_fifo_capacity(4);
        assert_eq!(hw.push_pulses(&[0; 3]).unwrap(), 3);
        assert_eq!(hw.push_pulses(&[0; 3]).unwrap(), 1);
        assert_eq!(hw.push_pulses(&[0; 3]).unwrap(), 0);
    }

    #[test]
    fn bring_up_retries_through_slow_settle() {
        let table = [RegInit {
            name: "chopconf",
            value: 0xABCD,
        }];
        // Settles within the poll budget: succeeds.
        let mut hw = SimStepper::new().with_register_settle(3);
        bring_up(&mut hw, &table, 1, 50_000).unwrap();
        assert_eq!(hw.step_frequency(), 50_000);

        // Never settles within the budget: fault.
        let mut hw = SimStepper::new().with_register_settle(REG_VERIFY_POLLS + 5);
        let err = bring_up(&mut hw, &table, 1, 50_000).unwrap_err();
        assert!(matches!(err, HalError::RegisterVerify { .. }));
    }
}
