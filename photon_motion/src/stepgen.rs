//! Step generator - the hard real-time task.
//!
//! A single periodic task at the highest user priority on a pinned CPU.
//! Each tick either advances the Bresenham line tracer (emitting a pulse
//! byte with step bits) or emits a spacer byte carrying only direction
//! bits. Bytes stream into the hardware pulse FIFO in batches of one
//! scheduling period; the per-tick state machine itself is pure, so the
//! cooperative test pacer can drive it tick by tick.
//!
//! Wake policy: suspended at initialization, resumed by a wake message
//! once the preparer has queued at least one segment. The FIFO `run`
//! attribute is asserted only after a full tick-second of data has been
//! buffered or the system is already running, so the DMA engine is not
//! starved at start-up.
//!
//! `sys_position` is mutated here and nowhere else.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use photon_common::N_AXIS;
use photon_common::hal::StepperHw;
use photon_common::rt::Pacer;
use photon_common::settings::Settings;
use photon_common::state::{StateHandler, StatePort, SubSystem, SysState, SystemSignals};

use crate::planner::DirBits;
use crate::segment::SegConsumer;

/// Motion sub-FSM substates and acceptance table.
pub mod motion_sub {
    use photon_common::state::{AcceptTable, SysState};

    pub const IDLE: u8 = 0;
    pub const RUNNING: u8 = 1;
    pub const HOLDING: u8 = 2;
    pub const HELD: u8 = 3;
    pub const HOMING: u8 = 4;
    pub const ALARMED: u8 = 5;

    pub fn accept_table() -> AcceptTable {
        AcceptTable::new()
            .allow(SysState::Idle, &[IDLE])
            .allow(SysState::Sleep, &[IDLE])
            .allow(SysState::Run, &[IDLE, RUNNING, HELD])
            .allow(SysState::Homing, &[IDLE, HOMING])
            .allow(SysState::Hold, &[RUNNING, HOLDING, HELD])
            .allow(SysState::Alarm, &[ALARMED])
    }
}

/// Hardware sub-FSM substates and acceptance table.
pub mod hardware_sub {
    use photon_common::state::{AcceptTable, SysState};

    pub const IDLE: u8 = 0;
    pub const RUNNING: u8 = 1;
    pub const DISABLED: u8 = 2;
    pub const FAULTED: u8 = 3;

    pub fn accept_table() -> AcceptTable {
        AcceptTable::new()
            .allow(SysState::Idle, &[IDLE, RUNNING])
            .allow(SysState::Run, &[IDLE, RUNNING])
            .allow(SysState::Homing, &[IDLE, RUNNING])
            .allow(SysState::Hold, &[IDLE, RUNNING])
            .allow(SysState::Sleep, &[IDLE, DISABLED])
            .allow(SysState::Fault, &[FAULTED])
    }
}

/// Control messages into the step generator task.
#[derive(Debug, Clone, Copy)]
pub enum StepgenMsg {
    /// Segments are waiting; start (or continue) streaming.
    Wake,
    /// Adopted system state, forwarded by the hardware FSM handler.
    Control(SysState),
    /// Zero the position of the masked axes (post-homing, while parked).
    ZeroAxes(u8),
    /// Re-enable hardware after a soft reset.
    Reinit,
    /// Orderly shutdown.
    Shutdown,
}

/// FSM handler for the hardware sub: forwards adopted states into the
/// step generator's queue so hardware control stays on its thread.
pub struct HardwareHandler {
    tx: Sender<StepgenMsg>,
}

impl HardwareHandler {
    pub fn new(tx: Sender<StepgenMsg>) -> Self {
        Self { tx }
    }
}

impl StateHandler for HardwareHandler {
    fn on_system_state(&mut self, state: SysState) {
        let _ = self.tx.try_send(StepgenMsg::Control(state));
    }
}

// ─── Bresenham Tracer ───────────────────────────────────────────────

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Pulse byte to stream (step bits | direction bits, or spacer).
    Pulse(u8),
    /// Segment ring is empty.
    Idle,
    /// End-of-motion terminator consumed (hold complete).
    HoldPoint,
}

/// Tracer statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracerStats {
    pub ticks: u64,
    pub steps_fired: u64,
    pub segments_consumed: u64,
}

/// Per-tick Bresenham state over the segment ring.
pub struct Tracer {
    consumer: SegConsumer,
    n_step_left: u16,
    cycles_per_tick: u32,
    tick_counter: u32,
    shadow_index: Option<u8>,
    steps: [u32; N_AXIS],
    step_event_count: u32,
    direction_bits: u8,
    counters: [u32; N_AXIS],
    pub stats: TracerStats,
}

impl Tracer {
    pub fn new(consumer: SegConsumer) -> Self {
        Self {
            consumer,
            n_step_left: 0,
            cycles_per_tick: 1,
            tick_counter: 0,
            shadow_index: None,
            steps: [0; N_AXIS],
            step_event_count: 0,
            direction_bits: 0,
            counters: [0; N_AXIS],
            stats: TracerStats::default(),
        }
    }

    /// Whether the tracer sits between segments.
    #[inline]
    pub fn at_segment_boundary(&self) -> bool {
        self.n_step_left == 0
    }

    /// Drop the in-flight segment and drain the ring (motion cancel).
    pub fn cancel(&mut self) {
        self.n_step_left = 0;
        self.tick_counter = 0;
        self.consumer.drain();
    }

    /// Advance one tick at the step frequency.
    pub fn tick(&mut self, signals: &SystemSignals) -> Tick {
        while self.n_step_left == 0 {
            let Some(segment) = self.consumer.peek() else {
                return Tick::Idle;
            };
            if segment.end_of_motion {
                self.consumer.advance();
                self.stats.segments_consumed += 1;
                return Tick::HoldPoint;
            }
            if segment.n_step == 0 {
                self.consumer.advance();
                self.stats.segments_consumed += 1;
                continue;
            }
            if self.shadow_index != Some(segment.st_block_index) {
                // New stepper block: reinitialize the Bresenham counters
                // to half the event count for symmetric rounding.
                let shadow = self.consumer.shadow(segment.st_block_index as usize);
                self.steps = shadow.steps;
                self.step_event_count = shadow.step_event_count;
                self.direction_bits = shadow.direction_bits.bits();
                self.counters = [self.step_event_count / 2; N_AXIS];
                self.shadow_index = Some(segment.st_block_index);
            }
            self.n_step_left = segment.n_step;
            self.cycles_per_tick = segment.cycles_per_tick.max(1);
            self.tick_counter = 0;
        }

        self.stats.ticks += 1;
        let mut byte = self.direction_bits;
        self.tick_counter += 1;
        if self.tick_counter >= self.cycles_per_tick {
            self.tick_counter = 0;
            for axis in 0..N_AXIS {
                self.counters[axis] += self.steps[axis];
                if self.counters[axis] > self.step_event_count {
                    self.counters[axis] -= self.step_event_count;
                    byte |= 1 << axis;
                    self.stats.steps_fired += 1;
                    let delta = if self.direction_bits & DirBits::for_axis(axis).bits() != 0 {
                        -1
                    } else {
                        1
                    };
                    signals.sys_position[axis].fetch_add(delta, Ordering::Relaxed);
                }
            }
            self.n_step_left -= 1;
            if self.n_step_left == 0 {
                self.consumer.advance();
                self.stats.segments_consumed += 1;
            }
        }
        Tick::Pulse(byte)
    }
}

// ─── Step Generator Task ────────────────────────────────────────────

/// Largest tick batch streamed per period.
const MAX_BATCH: usize = 4096;

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    RanDry,
    HoldComplete,
    Stopped,
    Cancelled,
    HwFault,
}

/// The periodic step generator task.
pub struct StepGen {
    tracer: Tracer,
    hw: Box<dyn StepperHw>,
    signals: Arc<SystemSignals>,
    port: StatePort,
    rx: Receiver<StepgenMsg>,
    refill_tx: Sender<()>,
    pacer: Box<dyn Pacer>,
    step_frequency: u32,
    batch_ticks: usize,
    batch: [u8; MAX_BATCH],
    enabled: bool,
}

impl StepGen {
    pub fn new(
        consumer: SegConsumer,
        hw: Box<dyn StepperHw>,
        signals: Arc<SystemSignals>,
        port: StatePort,
        rx: Receiver<StepgenMsg>,
        refill_tx: Sender<()>,
        pacer: Box<dyn Pacer>,
        settings: &Settings,
    ) -> Self {
        let batch_ticks = (settings.step_frequency / settings.acceleration_ticks_per_second)
            .clamp(1, MAX_BATCH as u32) as usize;
        Self {
            tracer: Tracer::new(consumer),
            hw,
            signals,
            port,
            rx,
            refill_tx,
            pacer,
            step_frequency: settings.step_frequency,
            batch_ticks,
            batch: [0; MAX_BATCH],
            enabled: false,
        }
    }

    /// Task body: parked until woken, then streams until the ring runs
    /// dry or the system leaves a motion state.
    pub fn run(mut self) {
        self.port.report(SubSystem::Hardware, hardware_sub::IDLE);
        info!("step generator parked");
        loop {
            match self.rx.recv() {
                Err(_) => return,
                Ok(StepgenMsg::Shutdown) => {
                    let _ = self.hw.stop();
                    let _ = self.hw.disable();
                    return;
                }
                Ok(StepgenMsg::ZeroAxes(mask)) => {
                    for axis in 0..N_AXIS {
                        if mask & (1 << axis) != 0 {
                            self.signals.sys_position[axis].store(0, Ordering::Relaxed);
                        }
                    }
                }
                Ok(StepgenMsg::Reinit) => {
                    self.tracer.cancel();
                    if self.ensure_enabled() {
                        self.port.report(SubSystem::Hardware, hardware_sub::IDLE);
                    }
                }
                Ok(StepgenMsg::Control(state)) => self.apply_control(state),
                Ok(StepgenMsg::Wake) => self.stream_session(),
            }
        }
    }

    fn apply_control(&mut self, state: SysState) {
        match state {
            SysState::Sleep => {
                let _ = self.hw.stop();
                if self.hw.disable().is_ok() {
                    self.enabled = false;
                    self.port.report(SubSystem::Hardware, hardware_sub::DISABLED);
                }
            }
            SysState::Alarm | SysState::Fault => {
                let _ = self.hw.stop();
            }
            _ => {}
        }
    }

    fn ensure_enabled(&mut self) -> bool {
        if self.enabled {
            return true;
        }
        match self.hw.enable() {
            Ok(()) => {
                self.enabled = true;
                true
            }
            Err(e) => {
                error!("stepper enable failed: {e}");
                self.port.report(SubSystem::Hardware, hardware_sub::FAULTED);
                false
            }
        }
    }

    fn stream_session(&mut self) {
        let sys = self.signals.state();
        if matches!(sys, SysState::Alarm | SysState::Fault | SysState::Sleep) {
            return;
        }
        if !self.ensure_enabled() {
            return;
        }
        self.signals.set_stepper_busy(true);
        self.port.report(SubSystem::Hardware, hardware_sub::RUNNING);
        self.pacer.rearm();

        let mut primed = false;
        let mut buffered_ticks: u64 = 0;
        let mut pending = 0usize;
        let mut pending_start = 0usize;
        let mut boundary: Option<SessionEnd> = None;
        let end;

        'session: loop {
            // Drain control messages without blocking.
            loop {
                match self.rx.try_recv() {
                    Ok(StepgenMsg::Shutdown) => {
                        end = SessionEnd::Stopped;
                        break 'session;
                    }
                    Ok(StepgenMsg::Control(state)) => self.apply_control(state),
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        end = SessionEnd::Stopped;
                        break 'session;
                    }
                }
            }

            let sys = self.signals.state();
            let stopping = matches!(sys, SysState::Alarm | SysState::Fault | SysState::Sleep);

            if self.signals.motion_cancelled() {
                self.tracer.cancel();
                end = SessionEnd::Cancelled;
                break 'session;
            }

            // Fill the next batch, never splitting past a segment
            // boundary while a stop is pending.
            if pending == 0 {
                pending_start = 0;
                let consumed_before = self.tracer.stats.segments_consumed;
                let mut n = 0;
                while n < self.batch_ticks {
                    if stopping && self.tracer.at_segment_boundary() {
                        boundary = Some(SessionEnd::Stopped);
                        break;
                    }
                    match self.tracer.tick(&self.signals) {
                        Tick::Pulse(byte) => {
                            self.batch[n] = byte;
                            n += 1;
                        }
                        Tick::Idle => {
                            boundary = Some(SessionEnd::RanDry);
                            break;
                        }
                        Tick::HoldPoint => {
                            boundary = Some(SessionEnd::HoldComplete);
                            break;
                        }
                    }
                }
                pending = n;
                if self.tracer.stats.segments_consumed != consumed_before {
                    // Ask the preparer to refill behind us.
                    let _ = self.refill_tx.try_send(());
                }
            }

            // Stream the batch; short writes retry next period.
            if pending > 0 {
                match self
                    .hw
                    .push_pulses(&self.batch[pending_start..pending_start + pending])
                {
                    Ok(written) => {
                        pending_start += written;
                        pending -= written;
                        buffered_ticks += written as u64;
                    }
                    Err(e) => {
                        error!("pulse FIFO write failed: {e}");
                        self.port.report(SubSystem::Hardware, hardware_sub::FAULTED);
                        end = SessionEnd::HwFault;
                        break 'session;
                    }
                }
            }

            // Prime window: keep the FIFO from streaming until a full
            // tick-second is buffered or the system is already running.
            if !primed && (buffered_ticks >= self.step_frequency as u64 || sys == SysState::Run) {
                if let Err(e) = self.hw.run() {
                    error!("stepper run failed: {e}");
                    self.port.report(SubSystem::Hardware, hardware_sub::FAULTED);
                    end = SessionEnd::HwFault;
                    break 'session;
                }
                primed = true;
            }

            if pending == 0 {
                if let Some(reason) = boundary {
                    end = reason;
                    break 'session;
                }
            }

            self.pacer.wait();
        }

        self.signals.set_stepper_busy(false);

        match end {
            SessionEnd::RanDry => {
                // Short streams never reached the prime threshold; start
                // the FIFO now and let it drain on its own.
                if !primed && buffered_ticks > 0 {
                    let _ = self.hw.run();
                }
                // One last chance for the preparer before going idle.
                let _ = self.refill_tx.try_send(());
                if self.signals.state() == SysState::Run {
                    self.port.report(SubSystem::Motion, motion_sub::IDLE);
                    self.port.request(SysState::Idle);
                }
                self.port.report(SubSystem::Hardware, hardware_sub::IDLE);
                debug!("step generator idle");
            }
            SessionEnd::HoldComplete => {
                if !primed && buffered_ticks > 0 {
                    let _ = self.hw.run();
                }
                self.port.report(SubSystem::Motion, motion_sub::HELD);
                self.port.report(SubSystem::Hardware, hardware_sub::IDLE);
                info!("feed hold complete");
            }
            SessionEnd::Cancelled | SessionEnd::Stopped => {
                // Truncate deliberately: halt the FIFO mid-stream.
                let _ = self.hw.stop();
                self.port.report(SubSystem::Hardware, hardware_sub::IDLE);
            }
            SessionEnd::HwFault => {
                let _ = self.hw.stop();
                warn!("streaming aborted on hardware fault");
            }
        }
    }
}
