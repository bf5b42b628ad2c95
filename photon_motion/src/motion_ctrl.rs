//! Motion-control layer.
//!
//! The seam between the G-code interpreter and the planner: straight
//! lines, arc subdivision, dwells, feed hold and resume, homing, and
//! soft reset. Owns the planner, the segment preparer, and the producer
//! side of the segment ring; everything here runs on the parser-worker
//! thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use photon_common::N_AXIS;
use photon_common::settings::Settings;
use photon_common::state::{StatePort, SubSystem, SysState, SystemSignals};
use photon_common::status::{Alarm, Status};

use crate::planner::{BlockCond, NoExec, PlanLineData, Planner};
use crate::segment::{Preparer, SegProducer};
use crate::stepgen::{StepgenMsg, motion_sub};

/// Exact trig refresh interval during arc subdivision.
pub const N_ARC_CORRECTION: u32 = 12;

/// Arc direction disambiguation band for atan2 results near zero.
const ARC_ANGULAR_TRAVEL_EPSILON: f32 = 5.0e-7;

/// Poll interval for dwells and buffer synchronization.
const DWELL_TIME_STEP: Duration = Duration::from_millis(50);

/// Sleep while the planner ring is full.
const PLANNER_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// View of the limit-switch bank used by the homing cycle.
pub trait LimitProbe: Send + Sync {
    /// Whether the limit switch of `axis` is currently tripped.
    fn tripped(&self, axis: usize) -> bool;
}

/// Number of straight segments an arc is split into for a given chordal
/// tolerance.
pub fn arc_segment_count(radius: f32, angular_travel: f32, tolerance: f32) -> u32 {
    let denom = (tolerance * (2.0 * radius - tolerance)).sqrt();
    if denom <= 0.0 {
        return 0;
    }
    ((0.5 * angular_travel.abs() * radius) / denom).floor() as u32
}

/// Motion control context, owned by the parser worker.
pub struct MotionCtrl {
    pub planner: Planner,
    pub prep: Preparer,
    seg: SegProducer,
    signals: Arc<SystemSignals>,
    port: StatePort,
    stepgen_tx: Sender<StepgenMsg>,
    pub settings: Settings,
}

impl MotionCtrl {
    pub fn new(
        settings: Settings,
        port: StatePort,
        stepgen_tx: Sender<StepgenMsg>,
        seg: SegProducer,
    ) -> Self {
        let signals = Arc::clone(port.signals());
        Self {
            planner: Planner::new(&settings),
            prep: Preparer::new(&settings),
            seg,
            signals,
            port,
            stepgen_tx,
            settings,
        }
    }

    #[inline]
    pub fn signals(&self) -> &Arc<SystemSignals> {
        &self.signals
    }

    /// Top up the segment ring from the planner.
    pub fn top_up(&mut self) -> bool {
        if matches!(
            self.signals.state(),
            SysState::Alarm | SysState::Fault | SysState::Sleep
        ) {
            return false;
        }
        self.prep.top_up(&mut self.planner, &mut self.seg)
    }

    fn wake_stepgen(&self) {
        let _ = self.stepgen_tx.try_send(StepgenMsg::Wake);
    }

    /// Request a cycle start when idle work is pending.
    pub fn auto_start(&mut self) {
        if !self.settings.mdi_auto_start {
            return;
        }
        self.start_pending_work();
    }

    /// Unconditional cycle start (`~` and program resume paths).
    pub fn start_pending_work(&mut self) {
        if self.signals.state() == SysState::Idle && !self.seg.is_empty() {
            self.port.request(SysState::Run);
            self.wake_stepgen();
        }
    }

    /// Refill pass driven by step-generator requests and idle ticks:
    /// top up the ring and re-wake the stepper if work is waiting.
    pub fn pump(&mut self) {
        let produced = self.top_up();
        if (produced || !self.seg.is_empty())
            && matches!(
                self.signals.state(),
                SysState::Run | SysState::Homing | SysState::Hold
            )
        {
            self.wake_stepgen();
        }
        self.auto_start();
    }

    /// `$T`: jog every homing axis one millimetre out and back through
    /// single-shot system motions.
    pub fn run_test_jog(&mut self) -> Result<(), Status> {
        let mask = self.settings.homing_axes_mask;
        for axis in 0..N_AXIS {
            if mask & (1 << axis) == 0 {
                continue;
            }
            // System motions bypass the queue and its target checks, so
            // guard the jog envelope here.
            let position = self.signals.position();
            let current = position[axis] as f32 / self.settings.axes[axis].steps_per_mm;
            if current.abs() + 1.0 > self.settings.axes[axis].max_travel {
                return Err(Status::SoftLimitError);
            }
            for delta in [1.0f32, -1.0] {
                self.system_move(axis, delta);
                loop {
                    self.top_up();
                    self.wake_stepgen();
                    if self.signals.aborted() || self.system_move_finished() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                self.halt_motion();
                if self.signals.aborted() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Called when the aggregator adopts `Run`.
    pub fn on_run_adopted(&mut self) {
        if self.prep.is_held() {
            self.resume();
        } else {
            self.port.report(SubSystem::Motion, motion_sub::RUNNING);
            self.top_up();
            self.wake_stepgen();
        }
    }

    fn pipeline_blocked(&self) -> bool {
        matches!(
            self.signals.state(),
            SysState::Alarm | SysState::Fault | SysState::Sleep
        ) || self.signals.aborted()
    }

    /// Validate a target against the soft travel limits (also used by
    /// check-gcode mode, which queues nothing).
    pub fn check_target(&self, target: &[f32; N_AXIS]) -> Result<(), Status> {
        self.check_soft_limits(target)
    }

    fn check_soft_limits(&self, target: &[f32; N_AXIS]) -> Result<(), Status> {
        for axis in 0..N_AXIS {
            let travel = self.settings.axes[axis].max_travel;
            if target[axis] > travel + 1e-3 || target[axis] < -travel - 1e-3 {
                return Err(Status::TravelExceeded);
            }
        }
        Ok(())
    }

    /// Plan a straight-line motion to `target` [mm].
    ///
    /// Blocks (sleeping between preparer top-ups) while the planner ring
    /// is full. Returns without queueing after an alarm or fault.
    pub fn mc_line(&mut self, target: &[f32; N_AXIS], pl_data: &PlanLineData) -> Result<(), Status> {
        if self.pipeline_blocked() {
            return Ok(());
        }
        self.check_soft_limits(target)?;

        while self.planner.is_full() {
            self.top_up();
            self.auto_start();
            if self.pipeline_blocked() {
                return Ok(());
            }
            thread::sleep(PLANNER_FULL_BACKOFF);
        }

        let (planner, prep) = (&mut self.planner, &mut self.prep);
        planner.buffer_line(target, pl_data, prep);
        self.top_up();
        self.auto_start();
        Ok(())
    }

    /// Split an arc into straight segments and feed them to `mc_line`.
    ///
    /// `position` is the interpreter's current point and is advanced to
    /// the arc endpoint. `offset` is the center offset in plane axes,
    /// `radius` the arc radius, all in millimetres.
    #[allow(clippy::too_many_arguments)]
    pub fn mc_arc(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &PlanLineData,
        position: &mut [f32; N_AXIS],
        offset: &[f32; N_AXIS],
        radius: f32,
        axis_0: usize,
        axis_1: usize,
        axis_linear: usize,
        is_clockwise: bool,
    ) -> Result<(), Status> {
        let center_0 = position[axis_0] + offset[axis_0];
        let center_1 = position[axis_1] + offset[axis_1];
        // Radius vector from the center to the current position.
        let mut r_axis0 = -offset[axis_0];
        let mut r_axis1 = -offset[axis_1];
        let rt_0 = target[axis_0] - center_0;
        let rt_1 = target[axis_1] - center_1;

        // CCW angle between position and target, from atan2 of the
        // cross and dot products.
        let mut angular_travel =
            (r_axis0 * rt_1 - r_axis1 * rt_0).atan2(r_axis0 * rt_0 + r_axis1 * rt_1);
        if is_clockwise {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                angular_travel -= 2.0 * std::f32::consts::PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * std::f32::consts::PI;
        }

        let segments = arc_segment_count(radius, angular_travel, self.settings.arc_tolerance);
        let mut pl_data = *pl_data;
        if segments > 0 {
            if pl_data.condition.contains(BlockCond::INVERSE_TIME) {
                // Compensate inverse time for the subdivision: each
                // segment covers 1/segments of the programmed time.
                pl_data.feed_rate *= segments as f32;
                pl_data.condition.remove(BlockCond::INVERSE_TIME);
            }

            let theta_per_segment = angular_travel / segments as f32;
            let linear_per_segment = (target[axis_linear] - position[axis_linear]) / segments as f32;

            // Third-order small-angle rotation, refreshed with exact
            // trig every N_ARC_CORRECTION segments.
            let mut cos_t = 2.0 - theta_per_segment * theta_per_segment;
            let sin_t = theta_per_segment * 0.166_666_67 * (cos_t + 4.0);
            cos_t *= 0.5;

            let mut count = 0u32;
            for i in 1..segments {
                if count < N_ARC_CORRECTION {
                    let r_axisi = r_axis0 * sin_t + r_axis1 * cos_t;
                    r_axis0 = r_axis0 * cos_t - r_axis1 * sin_t;
                    r_axis1 = r_axisi;
                    count += 1;
                } else {
                    let cos_ti = (i as f32 * theta_per_segment).cos();
                    let sin_ti = (i as f32 * theta_per_segment).sin();
                    r_axis0 = -offset[axis_0] * cos_ti + offset[axis_1] * sin_ti;
                    r_axis1 = -offset[axis_0] * sin_ti - offset[axis_1] * cos_ti;
                    count = 0;
                }

                position[axis_0] = center_0 + r_axis0;
                position[axis_1] = center_1 + r_axis1;
                position[axis_linear] += linear_per_segment;
                let waypoint = *position;
                self.mc_line(&waypoint, &pl_data)?;
                if self.signals.aborted() {
                    return Ok(());
                }
            }
        }
        // Land exactly on the programmed endpoint.
        *position = *target;
        self.mc_line(target, &pl_data)
    }

    /// Wait for the motion pipeline to drain completely.
    pub fn buffer_synchronize(&mut self) {
        loop {
            self.top_up();
            self.auto_start();
            if self.pipeline_blocked() {
                return;
            }
            if self.planner.is_empty() && self.seg.is_empty() && !self.signals.stepper_busy() {
                return;
            }
            thread::sleep(DWELL_TIME_STEP);
        }
    }

    /// G4 dwell: synchronize, then wait, polling the system state every
    /// 50 ms and terminating early on alarm or fault.
    pub fn mc_dwell(&mut self, seconds: f32) {
        if self.pipeline_blocked() {
            return;
        }
        self.buffer_synchronize();
        let mut remaining = Duration::from_secs_f32(seconds.max(0.0));
        while remaining > Duration::ZERO {
            if self.pipeline_blocked() {
                return;
            }
            let chunk = remaining.min(DWELL_TIME_STEP);
            thread::sleep(chunk);
            remaining -= chunk;
        }
    }

    /// Feed hold: freeze the executing block and stream the forced
    /// deceleration.
    pub fn begin_hold(&mut self) {
        self.prep.begin_hold(&mut self.planner);
        self.port.report(SubSystem::Motion, motion_sub::HOLDING);
        self.top_up();
        self.wake_stepgen();
        info!("feed hold engaged");
    }

    /// Resume from a completed hold.
    pub fn resume(&mut self) {
        if !self.prep.is_held() {
            return;
        }
        self.prep.resume(&mut self.planner);
        self.port.report(SubSystem::Motion, motion_sub::RUNNING);
        self.top_up();
        self.wake_stepgen();
        info!("resuming from feed hold");
    }

    /// Cancel in-flight motion and wait for the step generator to park.
    fn halt_motion(&mut self) {
        self.signals.set_motion_cancel(true);
        self.wake_stepgen();
        for _ in 0..200 {
            if !self.signals.stepper_busy() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.prep.cancel(&mut self.planner);
        self.signals.set_motion_cancel(false);
    }

    /// Soft reset: drop all queued motion and re-anchor the planner at
    /// the machine position.
    pub fn reset(&mut self) {
        self.halt_motion();
        self.planner.flush();
        // The parked step generator drains stale ring segments and
        // re-enables the drivers.
        let _ = self.stepgen_tx.try_send(StepgenMsg::Reinit);
        thread::sleep(Duration::from_millis(10));
        self.planner.sync_position(self.signals.position());
        self.port.report(SubSystem::Motion, motion_sub::IDLE);
        debug!("motion pipeline reset");
    }

    // ─── Homing ─────────────────────────────────────────────────────

    /// Run the homing cycle: seek each configured axis into its limit
    /// switch, pull off, then zero the homed axes.
    pub fn run_homing(&mut self, limits: &dyn LimitProbe) -> Result<(), Alarm> {
        let axes_mask = self.settings.homing_axes_mask;
        for axis in 0..N_AXIS {
            if axes_mask & (1 << axis) == 0 {
                continue;
            }
            self.home_axis(axis, limits)?;
            if self.signals.aborted() {
                return Ok(());
            }
        }
        // Zeroing goes through the step generator: position is only
        // ever mutated on its thread.
        let _ = self.stepgen_tx.try_send(StepgenMsg::ZeroAxes(axes_mask));
        thread::sleep(Duration::from_millis(20));
        self.planner.sync_position(self.signals.position());
        info!("homing complete");
        Ok(())
    }

    fn home_axis(&mut self, axis: usize, limits: &dyn LimitProbe) -> Result<(), Alarm> {
        let dir_positive = self.settings.homing_dir_mask & (1 << axis) != 0;
        let seek = self.settings.axes[axis].max_travel * 1.5;
        let delta = if dir_positive { seek } else { -seek };

        debug!(axis, "homing seek");
        self.system_move(axis, delta);
        let contact = loop {
            self.top_up();
            self.wake_stepgen();
            if limits.tripped(axis) {
                break true;
            }
            if self.signals.aborted() {
                break false;
            }
            if self.system_move_finished() {
                break false;
            }
            thread::sleep(Duration::from_millis(1));
        };
        self.halt_motion();

        if self.signals.aborted() {
            return Ok(());
        }
        if !contact {
            warn!(axis, "homing seek exhausted travel without contact");
            return Err(Alarm::HomingFail);
        }

        // Pull off the switch.
        debug!(axis, "homing pull-off");
        let pulloff = if dir_positive {
            -self.settings.homing_pulloff
        } else {
            self.settings.homing_pulloff
        };
        self.system_move(axis, pulloff);
        loop {
            self.top_up();
            self.wake_stepgen();
            if self.signals.aborted() || self.system_move_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.halt_motion();

        if limits.tripped(axis) {
            warn!(axis, "limit still engaged after pull-off");
            return Err(Alarm::HomingFail);
        }
        Ok(())
    }

    /// Queue a single-axis system motion relative to the machine
    /// position.
    fn system_move(&mut self, axis: usize, delta_mm: f32) {
        self.planner.sync_position(self.signals.position());
        let position = self.signals.position();
        let mut target = [0.0f32; N_AXIS];
        for idx in 0..N_AXIS {
            target[idx] = position[idx] as f32 / self.settings.axes[idx].steps_per_mm;
        }
        target[axis] += delta_mm;

        let pl_data = PlanLineData {
            feed_rate: self.settings.homing_seek_rate,
            condition: BlockCond::SYSTEM_MOTION,
            ..PlanLineData::default()
        };
        self.planner.buffer_line(&target, &pl_data, &mut NoExec);
        self.prep.begin_system_motion();
        self.top_up();
        self.wake_stepgen();
    }

    fn system_move_finished(&mut self) -> bool {
        self.planner.system_block().is_none()
            && !self.prep.in_system_motion()
            && self.seg.is_empty()
            && !self.signals.stepper_busy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::segment_ring;
    use photon_common::state::state_machine;

    fn ctrl_with(settings: Settings) -> (MotionCtrl, crate::segment::SegConsumer) {
        let (_aggregator, port) = state_machine();
        let (tx, _rx) = crossbeam_channel::bounded(8);
        let (producer, consumer) = segment_ring();
        let mc = MotionCtrl::new(settings, port, tx, producer);
        (mc, consumer)
    }

    fn ctrl() -> (MotionCtrl, crate::segment::SegConsumer) {
        ctrl_with(Settings::default())
    }

    #[test]
    fn full_circle_segment_count_meets_tolerance() {
        // Radius 50 full circle at 0.002 mm tolerance splits into well
        // over 200 chords.
        let segments = arc_segment_count(50.0, 2.0 * std::f32::consts::PI, 0.002);
        assert!(segments >= 200, "got {segments}");

        // Sum of chord lengths stays within 1% of the true
        // circumference.
        let n = segments as f32;
        let chord = 2.0 * 50.0 * (std::f32::consts::PI / n).sin();
        let total = chord * n;
        let circumference = 2.0 * std::f32::consts::PI * 50.0;
        assert!((total - circumference).abs() / circumference < 0.01);
    }

    #[test]
    fn quarter_arc_queues_subdivided_blocks() {
        // Coarser tolerance keeps the chord count inside the planner
        // ring so the test needs no consumer draining behind it.
        let (mut mc, _consumer) = ctrl_with(Settings {
            arc_tolerance: 0.02,
            ..Settings::default()
        });
        // Quarter arc, radius 5 mm, from (5,0) around (0,0) to (0,5).
        let mut position = [5.0f32, 0.0, 0.0];
        let target = [0.0f32, 5.0, 0.0];
        let offset = [-5.0f32, 0.0, 0.0];
        let pl = PlanLineData {
            feed_rate: 1000.0,
            ..PlanLineData::default()
        };
        mc.mc_arc(&target, &pl, &mut position, &offset, 5.0, 0, 1, 2, false)
            .unwrap();

        let expected = arc_segment_count(5.0, 0.5 * std::f32::consts::PI, 0.02) as u64;
        assert!(expected >= 2);
        assert_eq!(mc.planner.stats.blocks_queued, expected);
        assert_eq!(position, target);

        // Total queued path length approximates the true arc length.
        let arc_len = 0.5 * std::f32::consts::PI * 5.0;
        let queued = mc.planner.stats.millimeters_queued as f32;
        assert!(
            (queued - arc_len).abs() / arc_len < 0.01,
            "queued {queued} vs arc {arc_len}"
        );
    }

    #[test]
    fn arc_endpoint_matches_exactly() {
        let (mut mc, _consumer) = ctrl();
        let mut position = [1.0f32, 0.0, 0.0];
        let target = [0.0f32, 1.0, 0.0];
        let offset = [-1.0f32, 0.0, 0.0];
        let pl = PlanLineData {
            feed_rate: 600.0,
            ..PlanLineData::default()
        };
        mc.mc_arc(&target, &pl, &mut position, &offset, 1.0, 0, 1, 2, false)
            .unwrap();
        // The planner's final position is the rounded-step image of the
        // exact endpoint.
        let pos = mc.planner.position_steps();
        let spmm = mc.settings.axes[0].steps_per_mm;
        assert_eq!(pos[0], (target[0] * spmm).round() as i32);
        assert_eq!(pos[1], (target[1] * mc.settings.axes[1].steps_per_mm).round() as i32);
    }

    #[test]
    fn soft_limit_rejected() {
        let (mut mc, _consumer) = ctrl();
        let pl = PlanLineData {
            feed_rate: 1000.0,
            ..PlanLineData::default()
        };
        let err = mc.mc_line(&[10_000.0, 0.0, 0.0], &pl).unwrap_err();
        assert_eq!(err, Status::TravelExceeded);
        assert!(mc.planner.is_empty());
    }

    #[test]
    fn inverse_time_scaled_by_subdivision() {
        let (mut mc, _consumer) = ctrl();
        let mut position = [1.0f32, 0.0, 0.0];
        let target = [0.0f32, 1.0, 0.0];
        let offset = [-1.0f32, 0.0, 0.0];
        let pl = PlanLineData {
            feed_rate: 2.0, // complete in 1/2 minute
            condition: BlockCond::INVERSE_TIME,
            ..PlanLineData::default()
        };
        mc.mc_arc(&target, &pl, &mut position, &offset, 1.0, 0, 1, 2, false)
            .unwrap();
        // Inverse time was converted to a plain rate per segment: the
        // blocks carry a finite programmed rate, not an inverse time.
        for block in mc.planner.blocks() {
            assert!(!block.condition.contains(BlockCond::INVERSE_TIME));
            assert!(block.programmed_rate > 0.0);
        }
    }
}
