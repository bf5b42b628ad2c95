//! Segment preparer and the segment ring.
//!
//! Draws from the planner's tail block and slices it into short
//! constant-rate segments sized to roughly one segment-time each. The
//! velocity profile is re-derived whenever a new block becomes current
//! or the planner updates the executing block: the canonical trapezoid,
//! triangle, pure-acceleration, and pure-deceleration shapes, plus an
//! explicit deceleration-override ramp when the entry speed already
//! exceeds nominal, and a forced-deceleration profile during feed hold.
//!
//! Per-segment step rounding carries its sub-step time into the next
//! segment (`dt_remainder`) so long-range step timing stays exact.
//!
//! The segment ring is the single-producer/single-consumer boundary
//! between the soft preparer task and the hard-RT step generator:
//! the preparer writes the head index with Release ordering, the step
//! generator writes the tail. Segments reference a per-block "shadow"
//! (step counts, event count, direction bits) copied out of the planner
//! block, because the planner may retire the block while segments are
//! still in flight.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use photon_common::N_AXIS;
use photon_common::settings::{SEGMENT_RING_SIZE, Settings};

use crate::planner::{Block, ExecBlockOwner, Planner};
use crate::planner::DirBits;

/// Number of stepper-block shadows. A shadow is reused only after every
/// ring slot has turned over, so no in-flight segment can reference it.
pub const SHADOW_COUNT: usize = SEGMENT_RING_SIZE - 1;

static_assertions::const_assert!(SHADOW_COUNT >= 2);

/// Fractional steps below this margin extend the segment instead of
/// emitting a zero-step segment (expressed in steps).
const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

// ─── Segment Data ───────────────────────────────────────────────────

/// A constant-rate slice of a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Step events to emit.
    pub n_step: u16,
    /// Ticks between step events.
    pub cycles_per_tick: u32,
    /// Index into the shadow table.
    pub st_block_index: u8,
    /// Laser PWM for this slice. Carried for pulse-stream compatibility;
    /// zero until the laser subsystem is reintroduced.
    pub spindle_pwm: u8,
    /// Terminator marking the end of a forced deceleration.
    pub end_of_motion: bool,
}

/// Copy of the planner block data the step generator needs. Outlives
/// the planner block for every segment that references it.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepperBlock {
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    pub direction_bits: DirBits,
}

// ─── Segment Ring ───────────────────────────────────────────────────

/// SPSC ring of segments plus the shadow table.
///
/// Ownership is partitioned: the producer writes `head` and slots at
/// the head, the consumer writes `tail` and reads slots at the tail.
/// Both sides read both indices.
struct SegmentRing {
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: [UnsafeCell<Segment>; SEGMENT_RING_SIZE],
    shadows: [UnsafeCell<StepperBlock>; SHADOW_COUNT],
}

// SAFETY: slots strictly between tail and head are immutable and
// published with Release/Acquire on `head`; the slot at `head` is
// written only by the single producer, slots before `tail` are dead.
// Shadows are written only by the producer, and only at an index no
// live segment references (see `SHADOW_COUNT`).
unsafe impl Sync for SegmentRing {}

#[inline]
fn ring_next(index: usize) -> usize {
    (index + 1) % SEGMENT_RING_SIZE
}

/// Create a segment ring, returning its two endpoint tokens.
pub fn segment_ring() -> (SegProducer, SegConsumer) {
    let ring = Arc::new(SegmentRing {
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        slots: [const { UnsafeCell::new(Segment {
            n_step: 0,
            cycles_per_tick: 0,
            st_block_index: 0,
            spindle_pwm: 0,
            end_of_motion: false,
        }) }; SEGMENT_RING_SIZE],
        shadows: [const { UnsafeCell::new(StepperBlock {
            steps: [0; N_AXIS],
            step_event_count: 0,
            direction_bits: DirBits::empty(),
        }) }; SHADOW_COUNT],
    });
    (
        SegProducer {
            ring: Arc::clone(&ring),
        },
        SegConsumer { ring },
    )
}

/// Producer endpoint (segment preparer side).
pub struct SegProducer {
    ring: Arc<SegmentRing>,
}

impl SegProducer {
    pub fn is_full(&self) -> bool {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        ring_next(head) == tail
    }

    pub fn is_empty(&self) -> bool {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        head == tail
    }

    /// Append a segment. Returns `false` when the ring is full.
    pub fn push(&mut self, segment: Segment) -> bool {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if ring_next(head) == tail {
            return false;
        }
        // SAFETY: single producer; `head` slot is not visible to the
        // consumer until the Release store below.
        unsafe { *self.ring.slots[head].get() = segment };
        self.ring.head.store(ring_next(head), Ordering::Release);
        true
    }

    /// Overwrite a shadow slot.
    ///
    /// Callers must only write a shadow no in-flight segment references;
    /// the preparer guarantees this by cycling through [`SHADOW_COUNT`]
    /// shadows round-robin.
    pub fn write_shadow(&mut self, index: usize, block: StepperBlock) {
        // SAFETY: see above; publication happens with the head store of
        // the first segment referencing this shadow.
        unsafe { *self.ring.shadows[index].get() = block };
    }
}

/// Consumer endpoint (step generator side).
pub struct SegConsumer {
    ring: Arc<SegmentRing>,
}

impl SegConsumer {
    pub fn is_empty(&self) -> bool {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        tail == head
    }

    /// Copy of the segment at the tail, if any. The slot stays owned by
    /// the consumer until [`advance`](Self::advance).
    pub fn peek(&self) -> Option<Segment> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        // SAFETY: slot is published (before `head`) and not yet retired.
        Some(unsafe { *self.ring.slots[tail].get() })
    }

    /// Retire the tail segment.
    pub fn advance(&mut self) {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        if tail != head {
            self.ring.tail.store(ring_next(tail), Ordering::Release);
        }
    }

    /// Copy of one stepper-block shadow.
    pub fn shadow(&self, index: usize) -> StepperBlock {
        // SAFETY: shadows referenced by live segments are never
        // overwritten; publication rides the `head` Release store.
        unsafe { *self.ring.shadows[index % SHADOW_COUNT].get() }
    }

    /// Drop every queued segment (motion cancel).
    pub fn drain(&mut self) {
        let head = self.ring.head.load(Ordering::Acquire);
        self.ring.tail.store(head, Ordering::Release);
    }
}

// ─── Preparer ───────────────────────────────────────────────────────

/// Velocity ramp the preparer is currently tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ramp {
    Accel,
    Cruise,
    Decel,
    /// Unwinding an entry speed above nominal down to the cruise speed.
    DecelOverride,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepStats {
    pub segments_emitted: u64,
    pub blocks_completed: u64,
}

/// The "where am I" cursor that survives across segment generations.
pub struct Preparer {
    // Block binding.
    has_block: bool,
    recalculate: bool,
    decel_override: bool,
    end_motion: bool,
    hold: bool,
    sys_motion: bool,
    /// Hold terminator still owed to the ring (ring was full).
    pending_terminator: bool,
    st_block_index: usize,

    // Profile state.
    ramp: Ramp,
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,
    dt_remainder: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    accelerate_until: f32,
    decelerate_after: f32,
    mm_complete: f32,

    // Derived constants.
    /// Segment slice duration [min].
    dt_segment: f32,
    /// Step generator ticks per minute.
    ticks_per_minute: f32,

    pub stats: PrepStats,
}

impl ExecBlockOwner for Preparer {
    fn freeze_exec_entry(&mut self, block: &mut Block) {
        if self.has_block {
            block.entry_speed_sqr = self.current_speed * self.current_speed;
            self.recalculate = true;
            self.has_block = false;
        }
    }
}

impl Preparer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            has_block: false,
            recalculate: false,
            decel_override: false,
            end_motion: false,
            hold: false,
            sys_motion: false,
            pending_terminator: false,
            st_block_index: 0,
            ramp: Ramp::Accel,
            steps_remaining: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            dt_remainder: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            mm_complete: 0.0,
            dt_segment: 1.0 / (settings.acceleration_ticks_per_second as f32 * 60.0),
            ticks_per_minute: settings.step_frequency as f32 * 60.0,
            stats: PrepStats::default(),
        }
    }

    /// Whether a block is partially prepared.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.has_block || self.recalculate
    }

    /// Whether a forced deceleration has completed and motion is parked.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.hold && self.end_motion
    }

    #[inline]
    pub fn in_hold(&self) -> bool {
        self.hold
    }

    /// Route the preparer at the planner's single-shot system block.
    pub fn begin_system_motion(&mut self) {
        self.sys_motion = true;
    }

    #[inline]
    pub fn in_system_motion(&self) -> bool {
        self.sys_motion
    }

    /// Enter feed hold: freeze the stepper's current speed as the
    /// executing block's entry speed and switch to forced deceleration.
    pub fn begin_hold(&mut self, planner: &mut Planner) {
        if self.hold {
            return;
        }
        self.hold = true;
        self.end_motion = false;
        if self.has_block {
            let entry = self.current_speed * self.current_speed;
            if let Some(block) = self.active_block(planner) {
                block.entry_speed_sqr = entry;
            }
            self.recalculate = true;
            self.has_block = false;
        }
    }

    /// Resume from a completed hold: re-plan the buffer from rest.
    pub fn resume(&mut self, planner: &mut Planner) {
        if !self.hold {
            return;
        }
        self.hold = false;
        self.end_motion = false;
        planner.cycle_reinitialize(self);
    }

    /// Hard reset of the cursor (soft reset, homing abort).
    pub fn cancel(&mut self, planner: &mut Planner) {
        if self.sys_motion {
            planner.discard_system_block();
        }
        self.has_block = false;
        self.recalculate = false;
        self.decel_override = false;
        self.end_motion = false;
        self.hold = false;
        self.sys_motion = false;
        self.pending_terminator = false;
        self.dt_remainder = 0.0;
        self.current_speed = 0.0;
        self.steps_remaining = 0.0;
    }

    fn active_block<'a>(&self, planner: &'a mut Planner) -> Option<&'a mut Block> {
        if self.sys_motion {
            planner.system_block()
        } else {
            planner.current_block()
        }
    }

    /// Idempotently top up the segment ring from the planner until the
    /// ring is full or the planner is empty. Returns `true` when at
    /// least one segment was produced.
    pub fn top_up(&mut self, planner: &mut Planner, out: &mut SegProducer) -> bool {
        let mut produced = false;

        loop {
            // A terminator owed from a completed hold goes out first.
            if self.pending_terminator {
                if !out.push(self.terminator()) {
                    return produced;
                }
                self.pending_terminator = false;
                produced = true;
            }
            if self.end_motion || out.is_full() {
                return produced;
            }
            // ── Bind or refresh the active planner block ──
            if !self.has_block {
                let Some(block) = self.active_block(planner).map(|b| *b) else {
                    return produced;
                };

                if self.recalculate {
                    // Same block continues; only the velocity profile is
                    // re-derived. The running speed is kept as-is.
                    self.recalculate = false;
                } else {
                    // Load the Bresenham data into the next shadow slot.
                    self.st_block_index = (self.st_block_index + 1) % SHADOW_COUNT;
                    out.write_shadow(
                        self.st_block_index,
                        StepperBlock {
                            steps: block.steps,
                            step_event_count: block.step_event_count,
                            direction_bits: block.direction_bits,
                        },
                    );
                    self.steps_remaining = block.step_event_count as f32;
                    self.step_per_mm = self.steps_remaining / block.millimeters;
                    self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
                    self.dt_remainder = 0.0;

                    if self.hold || self.decel_override {
                        // New block loaded mid-hold (or mid-override):
                        // entry continues from the forced exit speed.
                        self.current_speed = self.exit_speed;
                        if let Some(live) = self.active_block(planner) {
                            live.entry_speed_sqr = self.exit_speed * self.exit_speed;
                        }
                        self.decel_override = false;
                    } else {
                        self.current_speed = block.entry_speed_sqr.sqrt();
                    }
                }
                self.has_block = true;
                self.compute_profile(planner);
            }

            // ── Synthesize one segment ──
            if !self.generate_segment(planner, out) {
                return produced;
            }
            produced = true;
        }
    }

    /// Build the velocity profile for the freshly bound block.
    fn compute_profile(&mut self, planner: &mut Planner) {
        let block = match self.active_block(planner) {
            Some(block) => *block,
            None => return,
        };
        self.mm_complete = 0.0;
        let inv_2_accel = 0.5 / block.acceleration;

        if self.hold {
            // Forced deceleration to zero velocity.
            self.ramp = Ramp::Decel;
            self.maximum_speed = self.current_speed;
            self.accelerate_until = block.millimeters;
            self.decelerate_after = block.millimeters;
            let decel_dist = block.millimeters - inv_2_accel * block.entry_speed_sqr;
            if decel_dist < 0.0 {
                // Zero speed is not reachable within this block.
                self.exit_speed = (block.entry_speed_sqr
                    - 2.0 * block.acceleration * block.millimeters)
                    .max(0.0)
                    .sqrt();
            } else {
                // The profile completes early, leaving distance behind.
                self.mm_complete = decel_dist;
                self.exit_speed = 0.0;
            }
            return;
        }

        self.ramp = Ramp::Accel;
        self.accelerate_until = block.millimeters;
        self.decelerate_after = 0.0;

        let exit_speed_sqr = if self.sys_motion {
            0.0
        } else {
            planner.exec_block_exit_speed_sqr()
        };
        self.exit_speed = exit_speed_sqr.sqrt();

        let nominal_speed = planner.compute_profile_nominal_speed(&block);
        let nominal_speed_sqr = nominal_speed * nominal_speed;
        let intersect_distance =
            0.5 * (block.millimeters + inv_2_accel * (block.entry_speed_sqr - exit_speed_sqr));
        self.maximum_speed = nominal_speed;

        if block.entry_speed_sqr > nominal_speed_sqr {
            // Entry above nominal: only happens after an override
            // reduction. Unwind with an explicit deceleration ramp.
            self.accelerate_until =
                block.millimeters - inv_2_accel * (block.entry_speed_sqr - nominal_speed_sqr);
            if self.accelerate_until <= 0.0 {
                // Deceleration through the whole block; the true exit
                // speed differs from the planner's, so the next block
                // must load as a deceleration override too.
                self.ramp = Ramp::Decel;
                self.decelerate_after = block.millimeters;
                self.maximum_speed = self.current_speed;
                self.exit_speed = (block.entry_speed_sqr
                    - 2.0 * block.acceleration * block.millimeters)
                    .max(0.0)
                    .sqrt();
                self.decel_override = true;
            } else {
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                self.maximum_speed = nominal_speed;
                self.ramp = Ramp::DecelOverride;
            }
        } else if intersect_distance > 0.0 {
            if intersect_distance < block.millimeters {
                // Trapezoid or triangle.
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                if self.decelerate_after < intersect_distance {
                    // Trapezoid (or acceleration-cruise / cruise-only).
                    self.maximum_speed = nominal_speed;
                    if block.entry_speed_sqr == nominal_speed_sqr {
                        self.ramp = Ramp::Cruise;
                    } else {
                        self.accelerate_until -=
                            inv_2_accel * (nominal_speed_sqr - block.entry_speed_sqr);
                    }
                } else {
                    // Triangle: acceleration meets deceleration.
                    self.accelerate_until = intersect_distance;
                    self.decelerate_after = intersect_distance;
                    self.maximum_speed =
                        (2.0 * block.acceleration * intersect_distance + exit_speed_sqr).sqrt();
                }
            } else {
                // Deceleration-only.
                self.ramp = Ramp::Decel;
                self.decelerate_after = block.millimeters;
                self.maximum_speed = self.current_speed;
            }
        } else {
            // Acceleration-only.
            self.accelerate_until = 0.0;
            self.maximum_speed = self.exit_speed;
        }
    }

    /// Produce one segment. Returns `false` when nothing was emitted
    /// (hold completed with less than one step pending).
    fn generate_segment(&mut self, planner: &mut Planner, out: &mut SegProducer) -> bool {
        let block = match self.active_block(planner) {
            Some(block) => *block,
            None => return false,
        };
        let acceleration = block.acceleration;

        let mut dt_max = self.dt_segment;
        let mut dt = 0.0f32;
        let mut time_var = dt_max;
        let mut mm_remaining = block.millimeters;
        let minimum_mm = (mm_remaining - self.req_mm_increment).max(0.0);

        loop {
            match self.ramp {
                Ramp::DecelOverride => {
                    let speed_var = acceleration * time_var;
                    let mm_var = time_var * (self.current_speed - 0.5 * speed_var);
                    mm_remaining -= mm_var;
                    if mm_remaining < self.accelerate_until || mm_var <= 0.0 {
                        // Override ramp complete; cruise at nominal.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (block.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        self.ramp = Ramp::Cruise;
                        self.current_speed = self.maximum_speed;
                    } else {
                        self.current_speed -= speed_var;
                    }
                }
                Ramp::Accel => {
                    let speed_var = acceleration * time_var;
                    mm_remaining -= time_var * (self.current_speed + 0.5 * speed_var);
                    if mm_remaining < self.accelerate_until {
                        // End of the acceleration ramp.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (block.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        self.ramp = if mm_remaining == self.decelerate_after {
                            Ramp::Decel
                        } else {
                            Ramp::Cruise
                        };
                        self.current_speed = self.maximum_speed;
                    } else {
                        self.current_speed += speed_var;
                    }
                }
                Ramp::Cruise => {
                    let mm_var = mm_remaining - self.maximum_speed * time_var;
                    if mm_var < self.decelerate_after {
                        // End of cruise.
                        time_var = (mm_remaining - self.decelerate_after) / self.maximum_speed;
                        mm_remaining = self.decelerate_after;
                        self.ramp = Ramp::Decel;
                    } else {
                        mm_remaining = mm_var;
                    }
                }
                Ramp::Decel => {
                    let speed_var = acceleration * time_var;
                    let mut terminal = true;
                    if self.current_speed > speed_var {
                        let mm_var =
                            mm_remaining - time_var * (self.current_speed - 0.5 * speed_var);
                        if mm_var > self.mm_complete {
                            mm_remaining = mm_var;
                            self.current_speed -= speed_var;
                            terminal = false;
                        }
                    }
                    if terminal {
                        // End of block or end of forced deceleration.
                        let denom = self.current_speed + self.exit_speed;
                        time_var = if denom > 0.0 {
                            2.0 * (mm_remaining - self.mm_complete) / denom
                        } else {
                            0.0
                        };
                        mm_remaining = self.mm_complete;
                        self.current_speed = self.exit_speed;
                    }
                }
            }

            dt += time_var;
            if dt < dt_max {
                time_var = dt_max - dt;
            } else if mm_remaining > minimum_mm {
                // Less than one whole step in this slice: stretch the
                // segment time to guarantee forward progress.
                dt_max += self.dt_segment;
                time_var = dt_max - dt;
            } else {
                break;
            }
            if mm_remaining <= self.mm_complete {
                break;
            }
        }

        // ── Convert the slice to whole steps and an integer rate ──
        let step_dist_remaining = self.step_per_mm * mm_remaining;
        let n_steps_remaining = step_dist_remaining.ceil();
        let last_n_steps_remaining = self.steps_remaining.ceil();
        let n_step = (last_n_steps_remaining - n_steps_remaining) as u32;

        if n_step == 0 {
            // Possible only at the end of a feed hold: less than one
            // step left to decelerate. Park without emitting.
            if self.hold {
                self.finish_forced_deceleration(planner, n_steps_remaining, out);
            }
            return false;
        }

        dt += self.dt_remainder;
        let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);
        let cycles_per_tick = (self.ticks_per_minute * inv_rate).ceil().max(1.0) as u32;

        let accepted = out.push(Segment {
            n_step: n_step as u16,
            cycles_per_tick,
            st_block_index: self.st_block_index as u8,
            spindle_pwm: 0,
            end_of_motion: false,
        });
        debug_assert!(accepted, "segment ring overrun");
        self.stats.segments_emitted += 1;

        // Carry the partial-step time into the next segment.
        self.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;
        self.steps_remaining = n_steps_remaining;
        if let Some(live) = self.active_block(planner) {
            live.millimeters = mm_remaining;
        }

        if mm_remaining == self.mm_complete {
            if mm_remaining > 0.0 {
                // Forced deceleration reached zero speed before the end
                // of the block; the remainder stays queued for resume.
                self.finish_forced_deceleration(planner, step_dist_remaining.ceil(), out);
            } else {
                // Block fully consumed.
                self.stats.blocks_completed += 1;
                self.has_block = false;
                if self.sys_motion {
                    self.sys_motion = false;
                    planner.discard_system_block();
                } else {
                    planner.discard_current_block();
                }
            }
        }
        true
    }

    /// Close out a completed forced deceleration: snap the remaining
    /// distance to whole steps, re-plan from rest, and emit the
    /// end-of-motion terminator.
    fn finish_forced_deceleration(
        &mut self,
        planner: &mut Planner,
        steps_remaining: f32,
        out: &mut SegProducer,
    ) {
        self.end_motion = true;
        self.current_speed = 0.0;
        self.exit_speed = 0.0;
        self.dt_remainder = 0.0;
        self.steps_remaining = steps_remaining;
        if let Some(live) = self.active_block(planner) {
            live.millimeters = steps_remaining / self.step_per_mm;
        }
        if !out.push(self.terminator()) {
            self.pending_terminator = true;
        }
        planner.cycle_reinitialize(self);
    }

    fn terminator(&self) -> Segment {
        Segment {
            n_step: 0,
            cycles_per_tick: 1,
            st_block_index: self.st_block_index as u8,
            spindle_pwm: 0,
            end_of_motion: true,
        }
    }
}
