//! Photon Control Library
//!
//! The outer surface of the Photon laser CNC controller: CLI transports
//! and command decoding, protocol replies and status reports, and the
//! parser worker. The binary in `main.rs` wires these to the motion
//! core and the hardware layer.

pub mod cli;
pub mod report;
pub mod worker;
