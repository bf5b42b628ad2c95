//! Hierarchical finite state machine.
//!
//! Five independent sub-FSMs (CLI, hardware, switches, motion, limits)
//! report their local state into a queue. The [`Aggregator`] collapses
//! those votes into one published [`SysState`] under priority and
//! consensus rules:
//!
//! 1. A priority state (fault > alarm > init) accepted by at least one
//!    sub-FSM is adopted immediately.
//! 2. A requested state accepted by every registered sub-FSM is adopted.
//! 3. A unique non-priority state with full consensus is adopted.
//! 4. Otherwise the current state is kept; two simultaneous non-priority
//!    consensuses are a design bug and are reported, not auto-resolved.
//!
//! On every adopted-state change the registered handlers are notified
//! synchronously, serially, in registration order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::N_AXIS;

// ─── System State ───────────────────────────────────────────────────

/// Aggregated machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SysState {
    /// Subsystems still initializing.
    Init = 0,
    /// Drivers powered down, waiting for reset.
    Sleep = 1,
    /// Ready, no motion.
    Idle = 2,
    /// Homing cycle in progress.
    Homing = 3,
    /// Executing queued motion.
    Run = 4,
    /// Feed hold - decelerating or stopped mid-program.
    Hold = 5,
    /// Unsafe condition latched; reset required.
    Alarm = 6,
    /// Unrecoverable failure; restart required.
    Fault = 7,
}

/// Number of real system states (pseudo-states excluded).
pub const SYS_STATE_COUNT: usize = 8;

/// Sentinel for "no system state requested".
pub const NO_REQUEST: u8 = 0xFE;

/// Sentinel substate for a sub-FSM that has not reported yet.
/// Accepts only [`SysState::Init`].
pub const SUBSTATE_UNINIT: u8 = 0xFF;

impl SysState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::Sleep),
            2 => Some(Self::Idle),
            3 => Some(Self::Homing),
            4 => Some(Self::Run),
            5 => Some(Self::Hold),
            6 => Some(Self::Alarm),
            7 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Label used in status reports. Every state has a distinct label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Sleep => "Sleep",
            Self::Idle => "Idle",
            Self::Homing => "Home",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Alarm => "Alarm",
            Self::Fault => "Fault",
        }
    }

    /// Priority states are adopted on any single acceptance, highest first.
    pub const PRIORITY: [SysState; 3] = [SysState::Fault, SysState::Alarm, SysState::Init];

    #[inline]
    pub const fn is_priority(self) -> bool {
        matches!(self, Self::Fault | Self::Alarm | Self::Init)
    }
}

// ─── Sub-FSM Identity ───────────────────────────────────────────────

/// Identifies one of the five sub-FSMs feeding the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubSystem {
    /// Command-line interface readers.
    Cli = 0,
    /// Stepper hardware device.
    Hardware = 1,
    /// Interlock switches.
    Switches = 2,
    /// Motion pipeline (planner/preparer/step generator).
    Motion = 3,
    /// Limit switches.
    Limits = 4,
}

/// Number of sub-FSM slots.
pub const SUB_COUNT: usize = 5;

impl SubSystem {
    pub const ALL: [SubSystem; SUB_COUNT] = [
        SubSystem::Cli,
        SubSystem::Hardware,
        SubSystem::Switches,
        SubSystem::Motion,
        SubSystem::Limits,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Hardware => "hardware",
            Self::Switches => "switches",
            Self::Motion => "motion",
            Self::Limits => "limits",
        }
    }
}

// ─── Acceptance Table ───────────────────────────────────────────────

/// For one sub-FSM: which of its substates are compatible with each
/// system state. Substate ids are small integers (< 32); each system
/// state maps to a bitmask over them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptTable([u32; SYS_STATE_COUNT]);

impl AcceptTable {
    pub const fn new() -> Self {
        Self([0; SYS_STATE_COUNT])
    }

    /// Mark `substates` acceptable for `sys`.
    pub const fn allow(mut self, sys: SysState, substates: &[u8]) -> Self {
        let mut i = 0;
        while i < substates.len() {
            self.0[sys as usize] |= 1 << substates[i];
            i += 1;
        }
        self
    }

    /// Whether `substate` is compatible with `sys`.
    ///
    /// The uninitialized sentinel is compatible with `Init` only, so the
    /// system stays in `Init` until every sub-FSM has reported.
    #[inline]
    pub fn accepts(&self, sys: SysState, substate: u8) -> bool {
        if substate == SUBSTATE_UNINIT {
            return matches!(sys, SysState::Init);
        }
        self.0[sys as usize] & (1u32 << substate) != 0
    }
}

// ─── Handlers & Updates ─────────────────────────────────────────────

/// Callback object invoked when the adopted system state changes.
///
/// Handlers run on the aggregator thread, synchronously and serially in
/// registration order, so they must be quick and must not post updates
/// back into the queue from within the callback.
pub trait StateHandler: Send {
    fn on_system_state(&mut self, state: SysState);
}

/// One message on the aggregator queue.
#[derive(Debug, Clone, Copy)]
pub enum StateUpdate {
    /// A sub-FSM reports a new local substate.
    Sub { sub: SubSystem, substate: u8 },
    /// Some task requests a system state transition.
    Request { state: SysState },
}

// ─── Published Signals ──────────────────────────────────────────────

/// Lock-free signals shared by every task.
///
/// `sys_position` is written only by the step generator; everyone else
/// reads it without locking.
#[derive(Debug)]
pub struct SystemSignals {
    sys_state: AtomicU8,
    requested: AtomicU8,
    /// Absolute machine position in steps, per axis.
    pub sys_position: [AtomicI32; N_AXIS],
    abort: AtomicBool,
    motion_cancel: AtomicBool,
    stepper_busy: AtomicBool,
}

impl SystemSignals {
    pub fn new() -> Self {
        Self {
            sys_state: AtomicU8::new(SysState::Init as u8),
            requested: AtomicU8::new(NO_REQUEST),
            sys_position: [const { AtomicI32::new(0) }; N_AXIS],
            abort: AtomicBool::new(false),
            motion_cancel: AtomicBool::new(false),
            stepper_busy: AtomicBool::new(false),
        }
    }

    /// Current adopted system state.
    #[inline]
    pub fn state(&self) -> SysState {
        // Only valid SysState values are ever stored.
        SysState::from_u8(self.sys_state.load(Ordering::Acquire)).unwrap_or(SysState::Fault)
    }

    #[inline]
    pub(crate) fn publish_state(&self, state: SysState) {
        self.sys_state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn requested(&self) -> Option<SysState> {
        SysState::from_u8(self.requested.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn publish_request(&self, raw: u8) {
        self.requested.store(raw, Ordering::Release);
    }

    /// Snapshot of the machine position in steps.
    pub fn position(&self) -> [i32; N_AXIS] {
        let mut out = [0i32; N_AXIS];
        for (slot, atom) in out.iter_mut().zip(self.sys_position.iter()) {
            *slot = atom.load(Ordering::Relaxed);
        }
        out
    }

    /// Soft-reset flag (`X` command). Polled by the parser worker loops.
    #[inline]
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_abort(&self, value: bool) {
        self.abort.store(value, Ordering::Release);
    }

    /// Drop-remaining-segments flag, honored by the step generator at
    /// segment boundaries (homing seek cancellation).
    #[inline]
    pub fn motion_cancelled(&self) -> bool {
        self.motion_cancel.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_motion_cancel(&self, value: bool) {
        self.motion_cancel.store(value, Ordering::Release);
    }

    /// Whether the step generator is currently streaming a session.
    #[inline]
    pub fn stepper_busy(&self) -> bool {
        self.stepper_busy.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_stepper_busy(&self, value: bool) {
        self.stepper_busy.store(value, Ordering::Release);
    }
}

impl Default for SystemSignals {
    fn default() -> Self {
        Self::new()
    }
}

// ─── State Port ─────────────────────────────────────────────────────

/// Cheap cloneable handle for posting updates to the aggregator.
#[derive(Clone)]
pub struct StatePort {
    tx: Sender<StateUpdate>,
    signals: Arc<SystemSignals>,
}

impl StatePort {
    /// Report a sub-FSM substate change.
    ///
    /// Queue overflow is unrecoverable: the published state is forced to
    /// `Fault` directly so the step generator stops feeding pulses.
    pub fn report(&self, sub: SubSystem, substate: u8) {
        if self.tx.try_send(StateUpdate::Sub { sub, substate }).is_err() {
            error!(sub = sub.name(), "FSM queue overflow, forcing fault");
            self.signals.publish_state(SysState::Fault);
        }
    }

    /// Request a system state transition. The requested state is
    /// published immediately; adoption happens on the aggregator.
    pub fn request(&self, state: SysState) {
        self.signals.publish_request(state as u8);
        if self.tx.try_send(StateUpdate::Request { state }).is_err() {
            error!(?state, "FSM queue overflow, forcing fault");
            self.signals.publish_state(SysState::Fault);
        }
    }

    pub fn signals(&self) -> &Arc<SystemSignals> {
        &self.signals
    }
}

// ─── Aggregator ─────────────────────────────────────────────────────

struct SubEntry {
    accepts: AcceptTable,
    handler: Option<Box<dyn StateHandler>>,
    current: u8,
}

/// Collapses sub-FSM votes into the published system state.
pub struct Aggregator {
    entries: [Option<SubEntry>; SUB_COUNT],
    signals: Arc<SystemSignals>,
    rx: Receiver<StateUpdate>,
}

/// Capacity of the aggregator update queue.
const FSM_QUEUE_DEPTH: usize = 64;

/// Create the aggregator with its shared signals and a posting port.
pub fn state_machine() -> (Aggregator, StatePort) {
    let (tx, rx) = crossbeam_channel::bounded(FSM_QUEUE_DEPTH);
    let signals = Arc::new(SystemSignals::new());
    let aggregator = Aggregator {
        entries: [const { None }; SUB_COUNT],
        signals: Arc::clone(&signals),
        rx,
    };
    let port = StatePort { tx, signals };
    (aggregator, port)
}

impl Aggregator {
    /// Register a sub-FSM with its acceptance table and optional handler.
    ///
    /// Registration is startup-only; re-registering a slot replaces it.
    pub fn register(
        &mut self,
        sub: SubSystem,
        accepts: AcceptTable,
        handler: Option<Box<dyn StateHandler>>,
    ) {
        self.entries[sub as usize] = Some(SubEntry {
            accepts,
            handler,
            current: SUBSTATE_UNINIT,
        });
    }

    /// Process queued updates until every [`StatePort`] is dropped.
    pub fn run(mut self) {
        info!("FSM aggregator running");
        while let Ok(update) = self.rx.recv() {
            self.apply(update);
        }
        debug!("FSM aggregator stopped");
    }

    /// Apply a single update and re-evaluate. Exposed for tests and for
    /// cooperative scheduling.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Sub { sub, substate } => {
                match self.entries[sub as usize] {
                    Some(ref mut entry) => entry.current = substate,
                    None => {
                        warn!(sub = sub.name(), substate, "update from unregistered sub-FSM dropped");
                        return;
                    }
                }
            }
            StateUpdate::Request { state } => {
                self.signals.publish_request(state as u8);
            }
        }
        self.evaluate();
    }

    /// Current substate of a registered sub (tests / diagnostics).
    pub fn substate(&self, sub: SubSystem) -> Option<u8> {
        self.entries[sub as usize].as_ref().map(|e| e.current)
    }

    fn registered(&self) -> impl Iterator<Item = &SubEntry> {
        self.entries.iter().flatten()
    }

    /// Re-run the aggregation rules and publish/notify on change.
    fn evaluate(&mut self) {
        let registered_count = self.registered().count();
        if registered_count == 0 {
            return;
        }

        // Per-system-state acceptance census.
        let mut accept_count = [0usize; SYS_STATE_COUNT];
        for entry in self.registered() {
            for s in 0..SYS_STATE_COUNT {
                let sys = SysState::from_u8(s as u8).unwrap_or(SysState::Fault);
                if entry.accepts.accepts(sys, entry.current) {
                    accept_count[s] += 1;
                }
            }
        }

        // Rule 1: priority states adopt on any single acceptance.
        for sys in SysState::PRIORITY {
            if accept_count[sys as usize] >= 1 {
                self.adopt(sys);
                return;
            }
        }

        // Rule 2: a requested state with full consensus.
        if let Some(requested) = self.signals.requested() {
            if !requested.is_priority() && accept_count[requested as usize] == registered_count {
                self.signals.publish_request(NO_REQUEST);
                self.adopt(requested);
                return;
            }
        }

        // Rule 3: a unique non-priority full consensus.
        let current = self.signals.state();
        let mut consensus: Option<SysState> = None;
        let mut ambiguous = false;
        for s in 0..SYS_STATE_COUNT {
            let sys = SysState::from_u8(s as u8).unwrap_or(SysState::Fault);
            if sys.is_priority() || accept_count[s] != registered_count {
                continue;
            }
            match consensus {
                None => consensus = Some(sys),
                Some(_) => ambiguous = true,
            }
        }
        if ambiguous {
            warn!(current = current.label(), "multiple non-priority consensuses; keeping current state");
            return;
        }
        if let Some(sys) = consensus {
            self.adopt(sys);
        }
        // Rule 4: otherwise keep the current state.
    }

    fn adopt(&mut self, state: SysState) {
        if self.signals.state() == state {
            return;
        }
        info!(state = state.label(), "system state");
        self.signals.publish_state(state);
        for entry in self.entries.iter_mut().flatten() {
            if let Some(handler) = entry.handler.as_mut() {
                handler.on_system_state(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // A permissive table used for subs that do not gate anything in a test.
    fn permissive(substate: u8) -> AcceptTable {
        AcceptTable::new()
            .allow(SysState::Idle, &[substate])
            .allow(SysState::Run, &[substate])
            .allow(SysState::Homing, &[substate])
            .allow(SysState::Hold, &[substate])
            .allow(SysState::Sleep, &[substate])
    }

    fn full_registry() -> (Aggregator, StatePort) {
        let (mut agg, port) = state_machine();
        for sub in SubSystem::ALL {
            agg.register(sub, permissive(0), None);
        }
        (agg, port)
    }

    fn report_all_ready(agg: &mut Aggregator) {
        for sub in SubSystem::ALL {
            agg.apply(StateUpdate::Sub { sub, substate: 0 });
        }
    }

    #[test]
    fn starts_in_init_until_all_report() {
        let (mut agg, port) = full_registry();
        assert_eq!(port.signals().state(), SysState::Init);

        // Four of five ready: still Init (uninit substate votes Init).
        for sub in &SubSystem::ALL[..4] {
            agg.apply(StateUpdate::Sub { sub: *sub, substate: 0 });
            assert_eq!(port.signals().state(), SysState::Init);
        }
        // Fifth ready with an Idle request pending: adopts Idle.
        agg.apply(StateUpdate::Request { state: SysState::Idle });
        agg.apply(StateUpdate::Sub { sub: SubSystem::Limits, substate: 0 });
        assert_eq!(port.signals().state(), SysState::Idle);
    }

    #[test]
    fn run_requires_full_consensus() {
        let (mut agg, port) = state_machine();
        // Switches substate 1 = unsafe: does not accept Run.
        let unsafe_table = AcceptTable::new()
            .allow(SysState::Idle, &[0, 1])
            .allow(SysState::Run, &[0])
            .allow(SysState::Hold, &[0, 1])
            .allow(SysState::Sleep, &[0, 1])
            .allow(SysState::Homing, &[0]);
        for sub in SubSystem::ALL {
            if sub == SubSystem::Switches {
                agg.register(sub, unsafe_table, None);
            } else {
                agg.register(sub, permissive(0), None);
            }
        }
        report_all_ready(&mut agg);
        agg.apply(StateUpdate::Sub { sub: SubSystem::Switches, substate: 1 });

        agg.apply(StateUpdate::Request { state: SysState::Run });
        // Switches are unsafe: request cannot reach consensus.
        assert_ne!(port.signals().state(), SysState::Run);

        // Switch closes, re-report: the pending request is satisfied.
        agg.apply(StateUpdate::Sub { sub: SubSystem::Switches, substate: 0 });
        assert_eq!(port.signals().state(), SysState::Run);
    }

    #[test]
    fn alarm_adopts_on_single_vote() {
        let (mut agg, port) = state_machine();
        // Limits substate 1 = tripped, acceptable only for Alarm.
        let limits = AcceptTable::new()
            .allow(SysState::Idle, &[0])
            .allow(SysState::Run, &[0])
            .allow(SysState::Homing, &[0])
            .allow(SysState::Hold, &[0])
            .allow(SysState::Sleep, &[0])
            .allow(SysState::Alarm, &[1]);
        for sub in SubSystem::ALL {
            if sub == SubSystem::Limits {
                agg.register(sub, limits, None);
            } else {
                agg.register(sub, permissive(0), None);
            }
        }
        report_all_ready(&mut agg);
        agg.apply(StateUpdate::Request { state: SysState::Run });
        assert_eq!(port.signals().state(), SysState::Run);

        // Limit trips: alarm within one update cycle, by priority.
        agg.apply(StateUpdate::Sub { sub: SubSystem::Limits, substate: 1 });
        assert_eq!(port.signals().state(), SysState::Alarm);
    }

    #[test]
    fn fault_outranks_alarm() {
        let (mut agg, port) = state_machine();
        let table = AcceptTable::new()
            .allow(SysState::Alarm, &[1])
            .allow(SysState::Fault, &[2]);
        for sub in SubSystem::ALL {
            agg.register(sub, table, None);
        }
        report_all_ready(&mut agg);
        agg.apply(StateUpdate::Sub { sub: SubSystem::Hardware, substate: 2 });
        agg.apply(StateUpdate::Sub { sub: SubSystem::Limits, substate: 1 });
        assert_eq!(port.signals().state(), SysState::Fault);
    }

    #[test]
    fn unregistered_update_is_dropped() {
        let (mut agg, port) = state_machine();
        agg.register(SubSystem::Cli, permissive(0), None);
        agg.apply(StateUpdate::Sub { sub: SubSystem::Motion, substate: 3 });
        assert_eq!(agg.substate(SubSystem::Motion), None);
        assert_eq!(port.signals().state(), SysState::Init);
    }

    #[test]
    fn double_consensus_keeps_current_state() {
        let (mut agg, port) = state_machine();
        // Substate 0 accepts both Idle and Sleep for every sub.
        let table = AcceptTable::new()
            .allow(SysState::Idle, &[0])
            .allow(SysState::Sleep, &[0]);
        for sub in SubSystem::ALL {
            agg.register(sub, table, None);
        }
        // Reach Idle via request first.
        agg.apply(StateUpdate::Request { state: SysState::Idle });
        report_all_ready(&mut agg);
        assert_eq!(port.signals().state(), SysState::Idle);

        // Another update: both Idle and Sleep have consensus; state sticks.
        agg.apply(StateUpdate::Sub { sub: SubSystem::Cli, substate: 0 });
        assert_eq!(port.signals().state(), SysState::Idle);
    }

    struct Recorder(Arc<Mutex<Vec<(SubSystem, SysState)>>>, SubSystem);
    impl StateHandler for Recorder {
        fn on_system_state(&mut self, state: SysState) {
            self.0.lock().unwrap().push((self.1, state));
        }
    }

    #[test]
    fn handlers_notified_in_registration_order() {
        let log: Arc<Mutex<Vec<(SubSystem, SysState)>>> = Arc::default();
        let (mut agg, port) = state_machine();
        for sub in SubSystem::ALL {
            agg.register(
                sub,
                permissive(0),
                Some(Box::new(Recorder(Arc::clone(&log), sub))),
            );
        }
        agg.apply(StateUpdate::Request { state: SysState::Idle });
        report_all_ready(&mut agg);
        assert_eq!(port.signals().state(), SysState::Idle);

        let calls = log.lock().unwrap();
        let idle_calls: Vec<_> = calls.iter().filter(|(_, s)| *s == SysState::Idle).collect();
        assert_eq!(idle_calls.len(), SUB_COUNT);
        // Registration order == SubSystem::ALL order.
        for (call, sub) in idle_calls.iter().zip(SubSystem::ALL) {
            assert_eq!(call.0, sub);
        }
    }

    #[test]
    fn labels_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for s in 0..SYS_STATE_COUNT as u8 {
            let state = SysState::from_u8(s).unwrap();
            assert!(seen.insert(state.label()), "duplicate label {}", state.label());
        }
    }
}
