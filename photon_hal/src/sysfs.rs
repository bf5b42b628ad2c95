//! Sysfs-backed stepper driver.
//!
//! The kernel driver exposes one directory of attribute files:
//!
//! - `state` - reads `disabled|idle|running`
//! - `enable` / `disable` / `run` / `stop` - accept `"1"`
//! - `step_freq` - accepts a decimal integer
//! - `axis<N>/<reg>` - per-axis driver registers, read/written as
//!   hex-stringified 64-bit words
//!
//! plus a character device taking pulse bytes for the hardware FIFO.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use photon_common::hal::{HalError, HwState, StepperHw};

/// Attribute files that must exist for the driver to come up.
const REQUIRED_ATTRS: [&str; 6] = ["state", "enable", "disable", "run", "stop", "step_freq"];

/// Stepper hardware reached through a sysfs attribute directory and a
/// pulse FIFO device.
#[derive(Debug)]
pub struct SysfsStepper {
    root: PathBuf,
    fifo: File,
}

impl SysfsStepper {
    /// Open the attribute directory and the pulse FIFO.
    pub fn open(root: &Path, fifo_path: &Path) -> Result<Self, HalError> {
        for attr in REQUIRED_ATTRS {
            if !root.join(attr).exists() {
                return Err(HalError::MissingAttribute(attr.to_string()));
            }
        }
        let fifo = OpenOptions::new()
            .write(true)
            .open(fifo_path)
            .map_err(|e| HalError::Fifo(format!("{}: {e}", fifo_path.display())))?;
        Ok(Self {
            root: root.to_path_buf(),
            fifo,
        })
    }

    fn write_attr(&self, name: &str, value: &str) -> Result<(), HalError> {
        let path = self.root.join(name);
        if !path.exists() {
            return Err(HalError::MissingAttribute(name.to_string()));
        }
        std::fs::write(&path, value).map_err(|e| HalError::AttributeIo {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn read_attr(&self, name: &str) -> Result<String, HalError> {
        let path = self.root.join(name);
        if !path.exists() {
            return Err(HalError::MissingAttribute(name.to_string()));
        }
        std::fs::read_to_string(&path).map_err(|e| HalError::AttributeIo {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn reg_attr(axis: usize, name: &str) -> String {
        format!("axis{axis}/{name}")
    }
}

impl StepperHw for SysfsStepper {
    fn enable(&mut self) -> Result<(), HalError> {
        self.write_attr("enable", "1")
    }

    fn disable(&mut self) -> Result<(), HalError> {
        self.write_attr("disable", "1")
    }

    fn run(&mut self) -> Result<(), HalError> {
        self.write_attr("run", "1")
    }

    fn stop(&mut self) -> Result<(), HalError> {
        self.write_attr("stop", "1")
    }

    fn state(&mut self) -> Result<HwState, HalError> {
        let text = self.read_attr("state")?;
        HwState::parse(&text).ok_or(HalError::Malformed {
            name: "state".to_string(),
            value: text.trim().to_string(),
        })
    }

    fn set_step_frequency(&mut self, hz: u32) -> Result<(), HalError> {
        self.write_attr("step_freq", &hz.to_string())
    }

    fn push_pulses(&mut self, bytes: &[u8]) -> Result<usize, HalError> {
        // A full FIFO surfaces as a short write; callers retry the tail.
        self.fifo
            .write(bytes)
            .map_err(|e| HalError::Fifo(e.to_string()))
    }

    fn read_reg(&mut self, axis: usize, name: &str) -> Result<u64, HalError> {
        let attr = Self::reg_attr(axis, name);
        let text = self.read_attr(&attr)?;
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u64::from_str_radix(digits, 16).map_err(|_| HalError::Malformed {
            name: attr,
            value: trimmed.to_string(),
        })
    }

    fn write_reg(&mut self, axis: usize, name: &str, value: u64) -> Result<(), HalError> {
        self.write_attr(&Self::reg_attr(axis, name), &format!("{value:#018x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_common::N_AXIS;
    use photon_common::hal::{RegInit, bring_up};

    fn fake_sysfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for attr in REQUIRED_ATTRS {
            std::fs::write(dir.path().join(attr), "").unwrap();
        }
        std::fs::write(dir.path().join("state"), "disabled\n").unwrap();
        for axis in 0..N_AXIS {
            let reg_dir = dir.path().join(format!("axis{axis}"));
            std::fs::create_dir(&reg_dir).unwrap();
            // Register attributes pre-exist on real hardware.
            for reg in ["amax", "vmax"] {
                std::fs::write(reg_dir.join(reg), "0x0").unwrap();
            }
        }
        std::fs::write(dir.path().join("pulse"), "").unwrap();
        dir
    }

    fn open(dir: &tempfile::TempDir) -> SysfsStepper {
        SysfsStepper::open(dir.path(), &dir.path().join("pulse")).unwrap()
    }

    #[test]
    fn missing_attribute_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let err = SysfsStepper::open(dir.path(), &dir.path().join("pulse")).unwrap_err();
        assert!(matches!(err, HalError::MissingAttribute(_)));
    }

    #[test]
    fn control_attributes_receive_ones() {
        let dir = fake_sysfs();
        let mut hw = open(&dir);
        hw.enable().unwrap();
        hw.run().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("enable")).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(dir.path().join("run")).unwrap(), "1");
        hw.set_step_frequency(100_000).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("step_freq")).unwrap(),
            "100000"
        );
    }

    #[test]
    fn state_attribute_parses() {
        let dir = fake_sysfs();
        let mut hw = open(&dir);
        assert_eq!(hw.state().unwrap(), HwState::Disabled);
        std::fs::write(dir.path().join("state"), "running").unwrap();
        assert_eq!(hw.state().unwrap(), HwState::Running);
        std::fs::write(dir.path().join("state"), "garbage").unwrap();
        assert!(matches!(hw.state(), Err(HalError::Malformed { .. })));
    }

    #[test]
    fn registers_round_trip_as_hex() {
        let dir = fake_sysfs();
        let mut hw = open(&dir);
        hw.write_reg(1, "amax", 0xDEAD_BEEF_0123).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("axis1/amax")).unwrap();
        assert_eq!(raw, "0x0000deadbeef0123");
        assert_eq!(hw.read_reg(1, "amax").unwrap(), 0xDEAD_BEEF_0123);
    }

    #[test]
    fn bring_up_verifies_registers() {
        let dir = fake_sysfs();
        let mut hw = open(&dir);
        let table = [
            RegInit {
                name: "amax",
                value: 0x1000,
            },
            RegInit {
                name: "vmax",
                value: 0x2000,
            },
        ];
        bring_up(&mut hw, &table, N_AXIS, 100_000).unwrap();
        assert_eq!(hw.read_reg(2, "vmax").unwrap(), 0x2000);
    }

    #[test]
    fn pulse_bytes_reach_the_fifo() {
        let dir = fake_sysfs();
        let mut hw = open(&dir);
        assert_eq!(hw.push_pulses(&[0x01, 0x11, 0x10]).unwrap(), 3);
        let contents = std::fs::read(dir.path().join("pulse")).unwrap();
        assert_eq!(contents, vec![0x01, 0x11, 0x10]);
    }
}
