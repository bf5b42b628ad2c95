//! Photon Motion Core
//!
//! The real-time motion pipeline of the Photon laser CNC controller.
//! Data flows one way: text line → parser → planner block → segment →
//! pulse byte.
//!
//! - [`line`] - line grooming and numeric word reading
//! - [`gcode`] - modal G-code interpreter
//! - [`planner`] - look-ahead planner and block ring
//! - [`segment`] - segment preparer and the SPSC segment ring
//! - [`stepgen`] - Bresenham tracer and the hard-RT step generator
//! - [`motion_ctrl`] - lines, arcs, dwells, homing, hold/resume

pub mod gcode;
pub mod line;
pub mod motion_ctrl;
pub mod planner;
pub mod segment;
pub mod stepgen;
