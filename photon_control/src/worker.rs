//! Parser worker.
//!
//! Dequeues lines from the CLI transports, grooms and parses them,
//! dispatches motion, and services refill requests from the step
//! generator. Also executes the long-running `$` commands (homing,
//! sleep, self-test) because it owns the planner.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use photon_common::state::{
    StateHandler, StatePort, SubSystem, SysState, SystemSignals,
};
use photon_common::status::{Alarm, Status};
use photon_hal::input::LimitBank;
use photon_motion::gcode::{ParserState, ProgramFlow, execute_line};
use photon_motion::line::groom_line;
use photon_motion::motion_ctrl::{LimitProbe, MotionCtrl};
use photon_motion::stepgen::motion_sub;

use crate::report::{self, Reply};

/// CLI sub-FSM substates and acceptance table.
pub mod cli_sub {
    use photon_common::state::{AcceptTable, SysState};

    pub const READY: u8 = 0;
    pub const SLEEPING: u8 = 1;

    pub fn accept_table() -> AcceptTable {
        AcceptTable::new()
            .allow(SysState::Idle, &[READY])
            .allow(SysState::Run, &[READY])
            .allow(SysState::Homing, &[READY])
            .allow(SysState::Hold, &[READY])
            .allow(SysState::Sleep, &[SLEEPING])
    }
}

/// Requests into the parser worker.
#[derive(Debug)]
pub enum Request {
    /// A raw G-code line with its reply channel.
    Gcode { line: String, reply: Sender<Reply> },
    /// `$H` - run the homing cycle.
    Home { reply: Sender<Reply> },
    /// `$SLP` - enter sleep.
    Sleep { reply: Sender<Reply> },
    /// `$T` - stepper self-test jog.
    Test { reply: Sender<Reply> },
    /// `$C` - toggle check-gcode mode.
    CheckToggle { reply: Sender<Reply> },
    /// `X` - soft reset.
    Reset { reply: Sender<Reply> },
    /// `~` while idle - start the queued cycle.
    CycleStart { reply: Sender<Reply> },
    /// Adopted system state, forwarded by the motion FSM handler.
    StateChanged(SysState),
}

/// FSM handler for the motion sub: forwards adopted states onto the
/// worker queue so hold/resume run on the thread that owns the planner.
pub struct MotionHandler {
    tx: Sender<Request>,
}

impl MotionHandler {
    pub fn new(tx: Sender<Request>) -> Self {
        Self { tx }
    }
}

impl StateHandler for MotionHandler {
    fn on_system_state(&mut self, state: SysState) {
        let _ = self.tx.try_send(Request::StateChanged(state));
    }
}

/// Adapter exposing the limit bank to the homing cycle.
struct LimitView(Arc<LimitBank>);

impl LimitProbe for LimitView {
    fn tripped(&self, axis: usize) -> bool {
        self.0.engaged(axis)
    }
}

/// The parser worker task.
pub struct Worker {
    mc: MotionCtrl,
    parser: ParserState,
    rx: Receiver<Request>,
    refill_rx: Receiver<()>,
    port: StatePort,
    signals: Arc<SystemSignals>,
    limits: Arc<LimitBank>,
    check_mode: bool,
    paused: bool,
}

impl Worker {
    pub fn new(
        mc: MotionCtrl,
        rx: Receiver<Request>,
        refill_rx: Receiver<()>,
        port: StatePort,
        limits: Arc<LimitBank>,
    ) -> Self {
        let signals = Arc::clone(port.signals());
        Self {
            mc,
            parser: ParserState::new(),
            rx,
            refill_rx,
            port,
            signals,
            limits,
            check_mode: false,
            paused: false,
        }
    }

    /// Worker loop: blocks on the line queue, services refill requests,
    /// and tops the pipeline up on an idle tick.
    pub fn run(mut self) {
        self.port.report(SubSystem::Cli, cli_sub::READY);
        self.port.report(SubSystem::Motion, motion_sub::IDLE);
        self.port.request(SysState::Idle);
        info!("parser worker running");

        let rx = self.rx.clone();
        let refill_rx = self.refill_rx.clone();
        loop {
            crossbeam_channel::select! {
                recv(rx) -> msg => match msg {
                    Ok(request) => self.handle(request),
                    Err(_) => return,
                },
                recv(refill_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                    self.mc.pump();
                }
                default(Duration::from_millis(50)) => {
                    self.mc.pump();
                    // Safety net: a lost Run notification must not leave
                    // a completed hold parked forever.
                    if self.signals.state() == SysState::Run && self.mc.prep.is_held() {
                        self.mc.resume();
                    }
                }
            }
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Gcode { line, reply } => {
                let outcome = self.execute_gcode(&line);
                let _ = reply.send(outcome);
            }
            Request::Home { reply } => {
                let _ = reply.send(self.run_homing());
            }
            Request::Sleep { reply } => {
                let _ = reply.send(self.enter_sleep());
            }
            Request::Test { reply } => {
                let _ = reply.send(self.run_test());
            }
            Request::CheckToggle { reply } => {
                let _ = reply.send(self.toggle_check_mode());
            }
            Request::Reset { reply } => {
                let _ = reply.send(self.soft_reset());
            }
            Request::CycleStart { reply } => {
                if self.paused {
                    self.paused = false;
                }
                self.mc.start_pending_work();
                let _ = reply.send(Reply::Ok);
            }
            Request::StateChanged(state) => match state {
                SysState::Run => self.mc.on_run_adopted(),
                SysState::Hold => self.mc.begin_hold(),
                _ => {}
            },
        }
    }

    fn execute_gcode(&mut self, line: &str) -> Reply {
        if matches!(
            self.signals.state(),
            SysState::Alarm | SysState::Fault | SysState::Sleep
        ) || self.paused
        {
            return Reply::Error(Status::IdleError);
        }
        let groomed = match groom_line(line) {
            Ok(groomed) => groomed,
            Err(status) => return Reply::Error(status),
        };
        if let Err(status) = execute_line(&mut self.parser, &groomed, &mut self.mc, self.check_mode)
        {
            return Reply::Error(status);
        }
        match self.parser.take_program_flow() {
            ProgramFlow::Default => Reply::Ok,
            ProgramFlow::Paused => {
                if !self.check_mode {
                    self.mc.buffer_synchronize();
                    self.paused = true;
                }
                Reply::Msg("Pgm Pause".into())
            }
            ProgramFlow::Completed => {
                if !self.check_mode {
                    self.mc.buffer_synchronize();
                }
                Reply::Msg("Pgm End".into())
            }
        }
    }

    fn run_homing(&mut self) -> Reply {
        if self.signals.state() != SysState::Idle {
            return Reply::Error(Status::IdleError);
        }
        self.port.report(SubSystem::Motion, motion_sub::HOMING);
        self.port.request(SysState::Homing);
        if !self.await_state(SysState::Homing, Duration::from_millis(500)) {
            warn!("homing request not adopted");
            self.port.report(SubSystem::Motion, motion_sub::IDLE);
            return Reply::Error(Status::IdleError);
        }

        let limits = LimitView(Arc::clone(&self.limits));
        let result = self.mc.run_homing(&limits);
        match result {
            Ok(()) => {
                self.parser.sync_position(self.machine_position_mm());
                self.port.report(SubSystem::Motion, motion_sub::IDLE);
                self.port.request(SysState::Idle);
                Reply::Ok
            }
            Err(alarm) => {
                self.port.report(SubSystem::Motion, motion_sub::ALARMED);
                Reply::Alarm(alarm)
            }
        }
    }

    fn enter_sleep(&mut self) -> Reply {
        if self.signals.state() != SysState::Idle {
            return Reply::Error(Status::IdleError);
        }
        self.port.report(SubSystem::Cli, cli_sub::SLEEPING);
        self.port.request(SysState::Sleep);
        Reply::Msg("Sleeping".into())
    }

    fn run_test(&mut self) -> Reply {
        if self.signals.state() != SysState::Idle {
            return Reply::Error(Status::IdleError);
        }
        match self.mc.run_test_jog() {
            Ok(()) => Reply::Msg("Test complete".into()),
            Err(status) => Reply::Error(status),
        }
    }

    fn toggle_check_mode(&mut self) -> Reply {
        if self.check_mode {
            self.check_mode = false;
            // Leaving check mode discards the simulated interpreter
            // position along with the rest of the parser state.
            self.parser = ParserState::new();
            self.parser.sync_position(self.machine_position_mm());
            Reply::Msg("Disabled".into())
        } else {
            if self.signals.state() != SysState::Idle {
                return Reply::Error(Status::IdleError);
            }
            self.check_mode = true;
            Reply::Msg("Enabled".into())
        }
    }

    fn soft_reset(&mut self) -> Reply {
        info!("soft reset");
        self.mc.reset();
        self.parser = ParserState::new();
        self.parser.sync_position(self.machine_position_mm());
        self.paused = false;
        self.signals.set_abort(false);
        self.port.report(SubSystem::Cli, cli_sub::READY);
        self.port.report(SubSystem::Motion, motion_sub::IDLE);
        self.port.request(SysState::Idle);
        Reply::Raw(format!("{}\r\nok", report::banner()))
    }

    fn machine_position_mm(&self) -> [f32; photon_common::N_AXIS] {
        let position = self.signals.position();
        let mut mm = [0.0f32; photon_common::N_AXIS];
        for idx in 0..photon_common::N_AXIS {
            mm[idx] = position[idx] as f32 / self.mc.settings.axes[idx].steps_per_mm;
        }
        mm
    }

    fn await_state(&self, state: SysState, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.signals.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use photon_common::settings::Settings;
    use photon_common::state::{AcceptTable, Aggregator, state_machine};
    use photon_hal::input::LimitDef;
    use photon_motion::segment::segment_ring;

    fn permissive_registry() -> (Aggregator, StatePort) {
        let (mut aggregator, port) = state_machine();
        let table = AcceptTable::new()
            .allow(SysState::Idle, &[0, 1, 2, 3, 4, 5])
            .allow(SysState::Run, &[0, 1, 2, 3, 4, 5])
            .allow(SysState::Homing, &[0, 1, 2, 3, 4, 5])
            .allow(SysState::Hold, &[0, 1, 2, 3, 4, 5])
            .allow(SysState::Sleep, &[0, 1, 2, 3, 4, 5]);
        for sub in photon_common::state::SubSystem::ALL {
            aggregator.register(sub, table, None);
        }
        (aggregator, port)
    }

    fn worker_harness() -> (Worker, Aggregator) {
        let (aggregator, port) = permissive_registry();
        let (_line_tx, line_rx) = bounded(4);
        let (_refill_tx, refill_rx) = bounded(4);
        let (stepgen_tx, _stepgen_rx) = bounded(8);
        let (producer, _consumer) = segment_ring();
        let mc = MotionCtrl::new(Settings::default(), port.clone(), stepgen_tx, producer);
        let limits = Arc::new(LimitBank::new(&[LimitDef {
            axis: 0,
            code: 10,
            invert: false,
        }]));
        (
            Worker::new(mc, line_rx, refill_rx, port, limits),
            aggregator,
        )
    }

    #[test]
    fn gcode_executes_and_acknowledges() {
        let (mut worker, _aggregator) = worker_harness();
        assert_eq!(worker.execute_gcode("G0 X10"), Reply::Ok);
        assert_eq!(worker.mc.planner.stats.blocks_queued, 1);
    }

    #[test]
    fn gcode_rejected_while_paused() {
        let (mut worker, _aggregator) = worker_harness();
        worker.paused = true;
        assert_eq!(worker.execute_gcode("G0 X1"), Reply::Error(Status::IdleError));
    }

    #[test]
    fn parse_errors_map_to_error_replies() {
        let (mut worker, _aggregator) = worker_harness();
        assert_eq!(
            worker.execute_gcode("G0 G1 X1"),
            Reply::Error(Status::ModalGroupViolation)
        );
    }

    #[test]
    fn check_mode_round_trip() {
        let (mut worker, mut aggregator) = worker_harness();
        // Force Idle so check mode can engage.
        aggregator.apply(photon_common::state::StateUpdate::Request {
            state: SysState::Idle,
        });
        for sub in photon_common::state::SubSystem::ALL {
            aggregator.apply(photon_common::state::StateUpdate::Sub { sub, substate: 0 });
        }
        assert_eq!(worker.signals.state(), SysState::Idle);

        assert_eq!(worker.toggle_check_mode(), Reply::Msg("Enabled".into()));
        assert_eq!(worker.execute_gcode("G1 X10 F500"), Reply::Ok);
        // Nothing queued in check mode.
        assert_eq!(worker.mc.planner.stats.blocks_queued, 0);
        assert_eq!(worker.parser.position[0], 10.0);

        assert_eq!(worker.toggle_check_mode(), Reply::Msg("Disabled".into()));
        // Parser state dropped with check mode.
        assert_eq!(worker.parser.position[0], 0.0);
    }

    #[test]
    fn program_end_synchronizes_and_reports() {
        let (mut worker, _aggregator) = worker_harness();
        let reply = worker.execute_gcode("M2");
        assert_eq!(reply, Reply::Msg("Pgm End".into()));
    }

    #[test]
    fn sleep_requires_idle() {
        let (mut worker, _aggregator) = worker_harness();
        // Still in Init: rejected.
        assert_eq!(worker.enter_sleep(), Reply::Error(Status::IdleError));
    }
}
