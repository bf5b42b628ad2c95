//! Look-ahead motion planner.
//!
//! Maintains a bounded ring of straight-line motion blocks. Every
//! insertion recomputes the acceleration-limited velocity profile across
//! the whole buffer: a reverse pass propagates reachable entry speeds
//! from the newest block toward the tail, then a forward pass caps each
//! entry by what the previous block can actually reach, advancing an
//! "optimal" watermark past blocks that need no further optimization.
//!
//! Corner speeds come from the junction-deviation model: the centripetal
//! acceleration at a path bend is bounded by the machine's linear
//! acceleration limit acting over a tunable deviation radius.
//!
//! The block at the ring tail may be mid-execution in the segment
//! preparer; it is never touched directly. Whenever a pass would modify
//! it, the preparer freezes its own current speed into the block entry
//! through [`ExecBlockOwner`] and re-derives its profile.

use bitflags::bitflags;

use photon_common::N_AXIS;
use photon_common::settings::{PLANNER_RING_SIZE, Settings};

/// Stand-in for "no speed limit" before axis clamping.
const SOME_LARGE_VALUE: f32 = 1.0e+30;

/// Feed rates are never planned below this [mm/min].
pub const MINIMUM_FEED_RATE: f32 = 1.0;

bitflags! {
    /// Per-axis direction bits, stored pre-shifted into the pulse-byte
    /// layout (low nibble = step bits, high nibble = direction bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirBits: u8 {
        const X = 0x10;
        const Y = 0x20;
        const Z = 0x40;
    }

    /// Block condition bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockCond: u8 {
        /// Rapid motion: programmed rate is the axis-limited maximum.
        const RAPID         = 1 << 0;
        /// Feed value is an inverse completion time, not a rate.
        const INVERSE_TIME  = 1 << 1;
        /// Single-shot motion outside the queue (homing, park).
        const SYSTEM_MOTION = 1 << 2;
        /// Laser/spindle energized for this block.
        const SPINDLE_CW    = 1 << 3;
        /// Air assist on.
        const COOLANT_FLOOD = 1 << 4;
        /// Exhaust on.
        const COOLANT_MIST  = 1 << 5;
    }
}

impl DirBits {
    /// Direction bit for one axis index.
    #[inline]
    pub fn for_axis(axis: usize) -> DirBits {
        match axis {
            0 => DirBits::X,
            1 => DirBits::Y,
            _ => DirBits::Z,
        }
    }
}

/// Feed/spindle/condition descriptor accompanying one motion target.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanLineData {
    /// Feed rate [mm/min], or inverse time [1/min] with `INVERSE_TIME`.
    pub feed_rate: f32,
    /// Spindle (laser) speed at block entry.
    pub spindle_speed: f32,
    pub condition: BlockCond,
    /// Line number for diagnostics, 0 when absent.
    pub line_number: i32,
}

/// A planned straight-line motion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Block {
    /// Per-axis unsigned step counts.
    pub steps: [u32; N_AXIS],
    /// Maximum of the per-axis step counts.
    pub step_event_count: u32,
    pub direction_bits: DirBits,
    pub condition: BlockCond,

    /// Current planned entry speed squared [(mm/min)²].
    pub entry_speed_sqr: f32,
    /// Upper bound for the entry speed squared at this junction.
    pub max_entry_speed_sqr: f32,
    /// Line acceleration [mm/min²].
    pub acceleration: f32,
    /// Remaining travel [mm]; consumed by the segment preparer.
    pub millimeters: f32,

    /// Junction speed limit squared [(mm/min)²].
    pub max_junction_speed_sqr: f32,
    /// Programmed rate [mm/min].
    pub programmed_rate: f32,
    /// Axis-limited rapid rate [mm/min].
    pub rapid_rate: f32,
    /// Spindle speed at block entry.
    pub spindle_speed: f32,
}

/// Outcome of a `buffer_line` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanResult {
    /// Block appended to the ring.
    Queued,
    /// Zero-length move rejected as a no-op (spindle sync still applies).
    ZeroLength,
}

/// The executing block is owned by the segment preparer; the planner
/// calls back through this trait when a pass needs to update it.
pub trait ExecBlockOwner {
    /// Freeze the stepper's current speed as the block's new entry speed
    /// and flag the preparer to re-derive its velocity profile.
    fn freeze_exec_entry(&mut self, block: &mut Block);
}

/// No-op owner for contexts with no preparer attached.
pub struct NoExec;
impl ExecBlockOwner for NoExec {
    fn freeze_exec_entry(&mut self, _block: &mut Block) {}
}

/// Monotonic counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlannerStats {
    /// Total blocks accepted since startup.
    pub blocks_queued: u64,
    /// Total path length accepted [mm].
    pub millimeters_queued: f64,
}

/// Axis limit tables derived from settings at construction; the planner
/// itself never touches the settings object again.
#[derive(Debug, Clone, Copy)]
struct PlannerParams {
    steps_per_mm: [f32; N_AXIS],
    max_rate: [f32; N_AXIS],
    /// [mm/min²]
    max_accel: [f32; N_AXIS],
    junction_deviation: f32,
    min_junction_speed_sqr: f32,
}

/// The planner ring plus look-ahead state.
pub struct Planner {
    buffer: [Block; PLANNER_RING_SIZE],
    /// Oldest queued block (consumer side).
    tail: usize,
    /// Next empty slot (producer side).
    head: usize,
    /// Watermark: blocks before it are optimally planned.
    planned: usize,

    /// Planned machine position in steps.
    position: [i32; N_AXIS],
    previous_unit_vec: [f32; N_AXIS],
    previous_nominal_speed: f32,

    system_block: Option<Block>,
    params: PlannerParams,
    pub stats: PlannerStats,
}

#[inline]
fn next_index(index: usize) -> usize {
    (index + 1) % PLANNER_RING_SIZE
}

#[inline]
fn prev_index(index: usize) -> usize {
    (index + PLANNER_RING_SIZE - 1) % PLANNER_RING_SIZE
}

/// Smallest axis-limited magnitude along a unit vector.
fn limit_value_by_axis_maximum(max_value: &[f32; N_AXIS], unit_vec: &[f32; N_AXIS]) -> f32 {
    let mut limit = SOME_LARGE_VALUE;
    for idx in 0..N_AXIS {
        if unit_vec[idx] != 0.0 {
            limit = limit.min((max_value[idx] / unit_vec[idx]).abs());
        }
    }
    limit
}

/// Normalize in place, returning the original magnitude.
fn convert_delta_vector_to_unit_vector(vector: &mut [f32; N_AXIS]) -> f32 {
    let mut magnitude_sqr = 0.0;
    for value in vector.iter() {
        magnitude_sqr += value * value;
    }
    let magnitude = magnitude_sqr.sqrt();
    if magnitude > 0.0 {
        let inv = 1.0 / magnitude;
        for value in vector.iter_mut() {
            *value *= inv;
        }
    }
    magnitude
}

impl Planner {
    pub fn new(settings: &Settings) -> Self {
        let mut steps_per_mm = [0.0; N_AXIS];
        let mut max_rate = [0.0; N_AXIS];
        let mut max_accel = [0.0; N_AXIS];
        for idx in 0..N_AXIS {
            steps_per_mm[idx] = settings.axes[idx].steps_per_mm;
            max_rate[idx] = settings.axes[idx].max_rate;
            // Settings carry mm/s²; the planner works in mm/min².
            max_accel[idx] = settings.axes[idx].acceleration * 3600.0;
        }
        Self {
            buffer: [Block::default(); PLANNER_RING_SIZE],
            tail: 0,
            head: 0,
            planned: 0,
            position: [0; N_AXIS],
            previous_unit_vec: [0.0; N_AXIS],
            previous_nominal_speed: 0.0,
            system_block: None,
            params: PlannerParams {
                steps_per_mm,
                max_rate,
                max_accel,
                junction_deviation: settings.junction_deviation,
                min_junction_speed_sqr: settings.min_junction_speed * settings.min_junction_speed,
            },
            stats: PlannerStats::default(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        next_index(self.head) == self.tail
    }

    /// Number of queued blocks.
    pub fn block_count(&self) -> usize {
        (self.head + PLANNER_RING_SIZE - self.tail) % PLANNER_RING_SIZE
    }

    /// Iterate queued blocks from tail to head.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        let mut index = self.tail;
        let head = self.head;
        std::iter::from_fn(move || {
            if index == head {
                return None;
            }
            let block = &self.buffer[index];
            index = next_index(index);
            Some(block)
        })
    }

    /// Planned position in steps.
    pub fn position_steps(&self) -> [i32; N_AXIS] {
        self.position
    }

    /// Re-anchor the planned position (after reset or homing).
    pub fn sync_position(&mut self, position_steps: [i32; N_AXIS]) {
        self.position = position_steps;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed = 0.0;
    }

    /// Drop every queued block (soft reset).
    pub fn flush(&mut self) {
        self.tail = 0;
        self.head = 0;
        self.planned = 0;
        self.system_block = None;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed = 0.0;
    }

    /// Nominal speed for a block: the programmed rate capped by the
    /// axis-limited rapid rate, floored at the minimum feed rate.
    pub fn compute_profile_nominal_speed(&self, block: &Block) -> f32 {
        let mut nominal_speed = block.programmed_rate;
        if nominal_speed > block.rapid_rate {
            nominal_speed = block.rapid_rate;
        }
        nominal_speed.max(MINIMUM_FEED_RATE)
    }

    /// Entry-speed cap at the junction between the previous block and
    /// this one: the junction limit clamped by both nominal speeds.
    fn compute_profile_parameters(block: &mut Block, nominal_speed: f32, prev_nominal_speed: f32) {
        let lesser = nominal_speed.min(prev_nominal_speed);
        block.max_entry_speed_sqr = (lesser * lesser).min(block.max_junction_speed_sqr);
    }

    /// Plan a straight-line motion to `target` [mm].
    ///
    /// Returns `ZeroLength` when the move collapses to zero steps; the
    /// caller still observes spindle synchronization in that case.
    pub fn buffer_line(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &PlanLineData,
        exec: &mut dyn ExecBlockOwner,
    ) -> PlanResult {
        let mut block = Block {
            condition: pl_data.condition,
            spindle_speed: pl_data.spindle_speed,
            ..Block::default()
        };

        // Per-axis step deltas, direction bits, and the unit vector.
        let mut target_steps = [0i32; N_AXIS];
        let mut unit_vec = [0.0f32; N_AXIS];
        for idx in 0..N_AXIS {
            target_steps[idx] = (target[idx] * self.params.steps_per_mm[idx]).round() as i32;
            let delta_steps = target_steps[idx] - self.position[idx];
            block.steps[idx] = delta_steps.unsigned_abs();
            block.step_event_count = block.step_event_count.max(block.steps[idx]);
            let delta_mm = delta_steps as f32 / self.params.steps_per_mm[idx];
            unit_vec[idx] = delta_mm;
            if delta_mm < 0.0 {
                block.direction_bits |= DirBits::for_axis(idx);
            }
        }

        if block.step_event_count == 0 {
            return PlanResult::ZeroLength;
        }

        block.millimeters = convert_delta_vector_to_unit_vector(&mut unit_vec);
        block.acceleration = limit_value_by_axis_maximum(&self.params.max_accel, &unit_vec);
        block.rapid_rate = limit_value_by_axis_maximum(&self.params.max_rate, &unit_vec);

        if block.condition.contains(BlockCond::RAPID) {
            block.programmed_rate = block.rapid_rate;
        } else {
            block.programmed_rate = pl_data.feed_rate;
            if block.condition.contains(BlockCond::INVERSE_TIME) {
                // Inverse time: feed value is 1/minutes for the whole move.
                block.programmed_rate *= block.millimeters;
            }
        }

        let nominal_speed = self.compute_profile_nominal_speed(&block);

        if self.is_empty() && !block.condition.contains(BlockCond::SYSTEM_MOTION) {
            // First block starts from rest with no junction to consider.
            block.entry_speed_sqr = 0.0;
            block.max_junction_speed_sqr = 0.0;
        } else {
            // Junction deviation between the previous path direction and
            // this one. cos(theta) is negated so that a straight line
            // gives -1 and a full reversal gives +1.
            let mut junction_cos_theta = 0.0;
            let mut junction_unit_vec = [0.0f32; N_AXIS];
            for idx in 0..N_AXIS {
                junction_cos_theta -= self.previous_unit_vec[idx] * unit_vec[idx];
                junction_unit_vec[idx] = unit_vec[idx] - self.previous_unit_vec[idx];
            }

            if junction_cos_theta > 0.999999 {
                // Full reversal: crawl through the junction.
                block.max_junction_speed_sqr = self.params.min_junction_speed_sqr;
            } else if junction_cos_theta < -0.999999 {
                // Straight continuation: junction imposes no limit.
                block.max_junction_speed_sqr = SOME_LARGE_VALUE;
            } else {
                convert_delta_vector_to_unit_vector(&mut junction_unit_vec);
                let junction_acceleration =
                    limit_value_by_axis_maximum(&self.params.max_accel, &junction_unit_vec);
                let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
                block.max_junction_speed_sqr = self.params.min_junction_speed_sqr.max(
                    junction_acceleration * self.params.junction_deviation * sin_theta_d2
                        / (1.0 - sin_theta_d2),
                );
            }
        }

        if block.condition.contains(BlockCond::SYSTEM_MOTION) {
            // Single-shot motion: starts and ends at rest, bypasses the
            // queue, and leaves the planned position untouched.
            block.entry_speed_sqr = 0.0;
            block.max_entry_speed_sqr = 0.0;
            self.system_block = Some(block);
            return PlanResult::Queued;
        }

        Self::compute_profile_parameters(&mut block, nominal_speed, self.previous_nominal_speed);
        self.previous_nominal_speed = nominal_speed;
        self.previous_unit_vec = unit_vec;
        self.position = target_steps;

        self.buffer[self.head] = block;
        self.head = next_index(self.head);
        self.stats.blocks_queued += 1;
        self.stats.millimeters_queued += block.millimeters as f64;

        self.recalculate(exec);
        PlanResult::Queued
    }

    /// Reverse-then-forward look-ahead pass over the plannable buffer.
    ///
    /// The reverse pass never modifies the tail (executing) block; when
    /// it reaches the tail's successor it notifies the preparer so the
    /// stepper's current speed becomes the frozen entry speed.
    fn recalculate(&mut self, exec: &mut dyn ExecBlockOwner) {
        // Newest queued block.
        let mut current_index = prev_index(self.head);
        if current_index == self.planned {
            // Single plannable block: nothing to optimize.
            return;
        }

        // ── Reverse pass ──
        // The newest block always decelerates to rest at the buffer end.
        {
            let newest = &mut self.buffer[current_index];
            newest.entry_speed_sqr = newest
                .max_entry_speed_sqr
                .min(2.0 * newest.acceleration * newest.millimeters);
        }

        let mut block_index = prev_index(current_index);
        if block_index == self.planned {
            // Exactly two plannable blocks.
            if block_index == self.tail {
                let tail = self.tail;
                exec.freeze_exec_entry(&mut self.buffer[tail]);
            }
        } else {
            while block_index != self.planned {
                let next_entry = self.buffer[current_index].entry_speed_sqr;
                current_index = block_index;
                block_index = prev_index(block_index);

                if block_index == self.tail {
                    let tail = self.tail;
                    exec.freeze_exec_entry(&mut self.buffer[tail]);
                }

                let current = &mut self.buffer[current_index];
                if current.entry_speed_sqr != current.max_entry_speed_sqr {
                    let reachable = next_entry + 2.0 * current.acceleration * current.millimeters;
                    current.entry_speed_sqr = reachable.min(current.max_entry_speed_sqr);
                }
            }
        }

        // ── Forward pass ──
        let mut current_index = self.planned;
        let mut block_index = next_index(self.planned);
        while block_index != self.head {
            let current_entry = self.buffer[current_index].entry_speed_sqr;
            let current_accel = self.buffer[current_index].acceleration;
            let current_mm = self.buffer[current_index].millimeters;
            let next = &mut self.buffer[block_index];

            // An exit speed the previous block cannot reach caps this entry.
            if current_entry < next.entry_speed_sqr {
                let reachable = current_entry + 2.0 * current_accel * current_mm;
                if reachable < next.entry_speed_sqr {
                    next.entry_speed_sqr = reachable;
                    // Accelerating as hard as possible: nothing upstream
                    // can improve this junction any further.
                    self.planned = block_index;
                }
            }
            if next.entry_speed_sqr == next.max_entry_speed_sqr {
                self.planned = block_index;
            }
            current_index = block_index;
            block_index = next_index(block_index);
        }
    }

    /// Block currently at the ring tail, if any.
    pub fn current_block(&mut self) -> Option<&mut Block> {
        if self.is_empty() {
            return None;
        }
        Some(&mut self.buffer[self.tail])
    }

    /// Exit speed of the executing block = entry speed of its successor.
    pub fn exec_block_exit_speed_sqr(&self) -> f32 {
        let next = next_index(self.tail);
        if next == self.head {
            return 0.0;
        }
        self.buffer[next].entry_speed_sqr
    }

    /// Retire the tail block once the preparer has drained it.
    pub fn discard_current_block(&mut self) {
        if self.is_empty() {
            return;
        }
        if self.planned == self.tail {
            self.planned = next_index(self.tail);
        }
        self.tail = next_index(self.tail);
    }

    /// Single-shot system motion block accessor.
    pub fn system_block(&mut self) -> Option<&mut Block> {
        self.system_block.as_mut()
    }

    pub fn discard_system_block(&mut self) {
        self.system_block = None;
    }

    /// Re-plan the whole buffer from a complete stop (feed-hold resume,
    /// post-alarm recovery).
    pub fn cycle_reinitialize(&mut self, exec: &mut dyn ExecBlockOwner) {
        if self.is_empty() {
            return;
        }
        let tail = self.tail;
        exec.freeze_exec_entry(&mut self.buffer[tail]);
        self.planned = self.tail;
        self.recalculate(exec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> Planner {
        Planner::new(&Settings::default())
    }

    fn feed(rate: f32) -> PlanLineData {
        PlanLineData {
            feed_rate: rate,
            ..PlanLineData::default()
        }
    }

    #[test]
    fn linear_block_step_counts() {
        let mut planner = planner();
        let result = planner.buffer_line(&[100.0, 0.0, 0.0], &feed(3000.0), &mut NoExec);
        assert_eq!(result, PlanResult::Queued);

        let block = planner.blocks().next().unwrap();
        assert_eq!(block.steps, [10667, 0, 0]);
        assert_eq!(block.step_event_count, 10667);
        assert!(block.direction_bits.is_empty());
        assert!((block.millimeters - 10667.0 / 106.666).abs() < 1e-3);
    }

    #[test]
    fn step_event_count_is_axis_maximum() {
        let mut planner = planner();
        planner.buffer_line(&[10.0, -20.0, 1.0], &feed(1000.0), &mut NoExec);
        let block = planner.blocks().next().unwrap();
        assert_eq!(
            block.step_event_count,
            *block.steps.iter().max().unwrap()
        );
        assert!(block.direction_bits.contains(DirBits::Y));
        assert!(!block.direction_bits.contains(DirBits::X));
    }

    #[test]
    fn signed_step_deltas_sum_to_target() {
        let mut planner = planner();
        let targets = [
            [10.0, 5.0, 0.0],
            [20.0, -5.0, 1.0],
            [0.0, 0.0, 0.0],
            [33.3, 12.7, 0.5],
        ];
        let mut sums = [0i64; N_AXIS];
        let mut prev = [0i32; N_AXIS];
        for target in targets {
            planner.buffer_line(&target, &feed(2000.0), &mut NoExec);
            let pos = planner.position_steps();
            for idx in 0..N_AXIS {
                sums[idx] += (pos[idx] - prev[idx]) as i64;
            }
            prev = pos;
        }
        let settings = Settings::default();
        for idx in 0..N_AXIS {
            let expected = (targets[3][idx] * settings.axes[idx].steps_per_mm).round() as i64;
            assert_eq!(sums[idx], expected, "axis {idx}");
        }
    }

    #[test]
    fn zero_length_move_is_rejected() {
        let mut planner = planner();
        assert_eq!(
            planner.buffer_line(&[0.0, 0.0, 0.0], &feed(1000.0), &mut NoExec),
            PlanResult::ZeroLength
        );
        assert!(planner.is_empty());
    }

    #[test]
    fn junction_speeds_are_monotonically_feasible() {
        let mut planner = planner();
        // A zig-zag path with sharp corners.
        let targets = [
            [50.0, 0.0, 0.0],
            [50.0, 50.0, 0.0],
            [0.0, 50.0, 0.0],
            [0.0, 10.0, 0.0],
            [60.0, 10.0, 0.0],
        ];
        for target in targets {
            planner.buffer_line(&target, &feed(6000.0), &mut NoExec);
        }

        let blocks: Vec<Block> = planner.blocks().copied().collect();
        for pair in blocks.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            assert!(next.entry_speed_sqr <= next.max_junction_speed_sqr + 1.0);
            let reachable =
                current.entry_speed_sqr + 2.0 * current.acceleration * current.millimeters;
            assert!(
                next.entry_speed_sqr <= reachable + 1.0,
                "entry {} exceeds reachable {}",
                next.entry_speed_sqr,
                reachable
            );
        }
        for block in &blocks {
            let nominal = planner.compute_profile_nominal_speed(block);
            assert!(block.entry_speed_sqr <= nominal * nominal + 1.0);
        }
    }

    #[test]
    fn straight_path_keeps_speed_through_junctions() {
        let mut planner = planner();
        planner.buffer_line(&[20.0, 0.0, 0.0], &feed(3000.0), &mut NoExec);
        planner.buffer_line(&[40.0, 0.0, 0.0], &feed(3000.0), &mut NoExec);
        planner.buffer_line(&[60.0, 0.0, 0.0], &feed(3000.0), &mut NoExec);
        let blocks: Vec<Block> = planner.blocks().copied().collect();
        // Middle junction of a colinear path is not junction-limited.
        assert!(blocks[1].max_junction_speed_sqr >= 3000.0 * 3000.0);
        // Entry into block 1 is acceleration-limited, not junction-limited.
        let reachable = 2.0 * blocks[0].acceleration * blocks[0].millimeters;
        assert!((blocks[1].entry_speed_sqr - reachable.min(3000.0 * 3000.0)).abs() < 1.0);
    }

    #[test]
    fn ring_reports_full_and_discards_in_order() {
        let mut planner = planner();
        let mut x = 0.0;
        while !planner.is_full() {
            x += 1.0;
            planner.buffer_line(&[x, 0.0, 0.0], &feed(1000.0), &mut NoExec);
        }
        assert_eq!(planner.block_count(), PLANNER_RING_SIZE - 1);

        let first_steps = planner.blocks().next().unwrap().steps;
        planner.discard_current_block();
        assert_eq!(planner.block_count(), PLANNER_RING_SIZE - 2);
        // Discard retired the oldest block, not any other.
        assert_ne!(planner.blocks().next().unwrap().steps, first_steps);
    }

    #[test]
    fn system_motion_bypasses_queue_and_position() {
        let mut planner = planner();
        planner.buffer_line(&[10.0, 0.0, 0.0], &feed(1000.0), &mut NoExec);
        let planned_position = planner.position_steps();

        let pl = PlanLineData {
            feed_rate: 1500.0,
            condition: BlockCond::SYSTEM_MOTION,
            ..PlanLineData::default()
        };
        planner.buffer_line(&[-500.0, 0.0, 0.0], &pl, &mut NoExec);

        assert_eq!(planner.block_count(), 1);
        assert_eq!(planner.position_steps(), planned_position);
        let sys = planner.system_block().unwrap();
        assert_eq!(sys.entry_speed_sqr, 0.0);
        assert!(sys.condition.contains(BlockCond::SYSTEM_MOTION));
        planner.discard_system_block();
        assert!(planner.system_block().is_none());
    }

    #[test]
    fn rapid_uses_axis_limited_rate() {
        let mut planner = planner();
        let pl = PlanLineData {
            feed_rate: 0.0,
            condition: BlockCond::RAPID,
            ..PlanLineData::default()
        };
        planner.buffer_line(&[100.0, 0.0, 0.0], &pl, &mut NoExec);
        let block = planner.blocks().next().unwrap();
        assert_eq!(block.programmed_rate, block.rapid_rate);
        assert!((block.rapid_rate - 8000.0).abs() < 1.0);
    }
}
