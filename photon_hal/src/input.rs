//! Input-event watchers for interlock switches and limit switches.
//!
//! A raw event device delivers typed (type, code, value) records; type
//! 5 is the switch class. Each configured switch keeps a present-state
//! boolean, the bit position (event code) it listens on, and an invert
//! flag. The invert flag is always the one belonging to the switch
//! being examined. Bank states combine into a monotone safe/not-safe
//! predicate.
//!
//! The watcher thread runs at a real-time priority below the step
//! generator, blocks on device readiness, and treats device closure as
//! a fault.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use photon_common::rt::{RtConfig, spawn_task};
use photon_common::state::{StatePort, SubSystem, SysState};

/// Event type of the switch class.
pub const EV_SW: u16 = 0x05;

/// Size of one raw event record.
pub const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();

/// Maximum switches per bank.
const MAX_POINTS: usize = 8;

/// Switches sub-FSM substates and acceptance table.
pub mod switches_sub {
    use photon_common::state::{AcceptTable, SysState};

    pub const SAFE: u8 = 0;
    pub const UNSAFE: u8 = 1;
    pub const TRIPPED: u8 = 2;
    pub const FAULTED: u8 = 3;

    pub fn accept_table() -> AcceptTable {
        AcceptTable::new()
            .allow(SysState::Idle, &[SAFE, UNSAFE])
            .allow(SysState::Run, &[SAFE])
            .allow(SysState::Homing, &[SAFE])
            .allow(SysState::Hold, &[SAFE, UNSAFE])
            .allow(SysState::Sleep, &[SAFE, UNSAFE])
            .allow(SysState::Alarm, &[TRIPPED])
            .allow(SysState::Fault, &[FAULTED])
    }
}

/// Limits sub-FSM substates and acceptance table.
pub mod limits_sub {
    use photon_common::state::{AcceptTable, SysState};

    pub const OK: u8 = 0;
    pub const TRIPPED: u8 = 1;
    /// A limit engaged during homing is the expected contact.
    pub const CONTACT: u8 = 2;
    pub const FAULTED: u8 = 3;

    pub fn accept_table() -> AcceptTable {
        AcceptTable::new()
            .allow(SysState::Idle, &[OK])
            .allow(SysState::Run, &[OK])
            .allow(SysState::Homing, &[OK, CONTACT])
            .allow(SysState::Hold, &[OK])
            .allow(SysState::Sleep, &[OK])
            .allow(SysState::Alarm, &[TRIPPED])
            .allow(SysState::Fault, &[FAULTED])
    }
}

// ─── Raw Events ─────────────────────────────────────────────────────

/// One decoded event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

/// Decode a raw record. The leading timeval is skipped; type, code,
/// and value follow in native byte order.
pub fn decode_event(buf: &[u8; EVENT_SIZE]) -> RawEvent {
    let off = std::mem::size_of::<libc::timeval>();
    let mut kind = [0u8; 2];
    kind.copy_from_slice(&buf[off..off + 2]);
    let mut code = [0u8; 2];
    code.copy_from_slice(&buf[off + 2..off + 4]);
    let mut value = [0u8; 4];
    value.copy_from_slice(&buf[off + 4..off + 8]);
    RawEvent {
        kind: u16::from_ne_bytes(kind),
        code: u16::from_ne_bytes(code),
        value: i32::from_ne_bytes(value),
    }
}

// ─── Switch Bank ────────────────────────────────────────────────────

/// Static description of one interlock switch.
#[derive(Debug, Clone, Copy)]
pub struct SwitchDef {
    pub name: &'static str,
    /// Event code the switch reports on.
    pub code: u16,
    /// Inverted wiring: a zero value means engaged.
    pub invert: bool,
}

#[derive(Debug, Clone, Copy)]
struct SwitchPoint {
    def: SwitchDef,
    engaged: bool,
}

/// Interlock switches behind one mutex.
pub struct SwitchBank {
    points: Mutex<heapless::Vec<SwitchPoint, MAX_POINTS>>,
}

impl SwitchBank {
    pub fn new(defs: &[SwitchDef]) -> Self {
        let mut points = heapless::Vec::new();
        for def in defs.iter().take(MAX_POINTS) {
            let _ = points.push(SwitchPoint {
                def: *def,
                engaged: false,
            });
        }
        Self {
            points: Mutex::new(points),
        }
    }

    /// Apply one event. Returns `true` when a switch changed state.
    pub fn apply(&self, event: RawEvent) -> bool {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        for point in points.iter_mut() {
            if point.def.code != event.code {
                continue;
            }
            // Polarity comes from this switch's own invert flag.
            let engaged = (event.value != 0) != point.def.invert;
            if point.engaged != engaged {
                point.engaged = engaged;
                changed = true;
            }
        }
        changed
    }

    /// Monotone predicate: safe only while no switch is engaged.
    pub fn is_safe(&self) -> bool {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.iter().all(|point| !point.engaged)
    }
}

// ─── Limit Bank ─────────────────────────────────────────────────────

/// Static description of one limit switch.
#[derive(Debug, Clone, Copy)]
pub struct LimitDef {
    pub axis: usize,
    pub code: u16,
    pub invert: bool,
}

#[derive(Debug, Clone, Copy)]
struct LimitPoint {
    def: LimitDef,
    engaged: bool,
}

/// Limit switches behind one mutex.
pub struct LimitBank {
    points: Mutex<heapless::Vec<LimitPoint, MAX_POINTS>>,
}

impl LimitBank {
    pub fn new(defs: &[LimitDef]) -> Self {
        let mut points = heapless::Vec::new();
        for def in defs.iter().take(MAX_POINTS) {
            let _ = points.push(LimitPoint {
                def: *def,
                engaged: false,
            });
        }
        Self {
            points: Mutex::new(points),
        }
    }

    pub fn apply(&self, event: RawEvent) -> bool {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        for point in points.iter_mut() {
            if point.def.code != event.code {
                continue;
            }
            let engaged = (event.value != 0) != point.def.invert;
            if point.engaged != engaged {
                point.engaged = engaged;
                changed = true;
            }
        }
        changed
    }

    /// Whether the limit switch of `axis` is engaged.
    pub fn engaged(&self, axis: usize) -> bool {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points
            .iter()
            .any(|point| point.def.axis == axis && point.engaged)
    }

    pub fn any_engaged(&self) -> bool {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.iter().any(|point| point.engaged)
    }
}

// ─── Watcher Task ───────────────────────────────────────────────────

fn publish_switches(bank: &SwitchBank, port: &StatePort) {
    if bank.is_safe() {
        port.report(SubSystem::Switches, switches_sub::SAFE);
    } else if matches!(
        port.signals().state(),
        SysState::Run | SysState::Homing
    ) {
        // An interlock opening mid-motion is alarm-worthy.
        port.report(SubSystem::Switches, switches_sub::TRIPPED);
    } else {
        port.report(SubSystem::Switches, switches_sub::UNSAFE);
    }
}

fn publish_limits(bank: &LimitBank, port: &StatePort) {
    if !bank.any_engaged() {
        port.report(SubSystem::Limits, limits_sub::OK);
    } else if port.signals().state() == SysState::Homing {
        port.report(SubSystem::Limits, limits_sub::CONTACT);
    } else {
        port.report(SubSystem::Limits, limits_sub::TRIPPED);
    }
}

/// Report both banks as present and healthy without a device attached
/// (simulation runs).
pub fn report_static_safe(port: &StatePort) {
    port.report(SubSystem::Switches, switches_sub::SAFE);
    port.report(SubSystem::Limits, limits_sub::OK);
}

/// Spawn the event watcher at RT priority. The thread publishes both
/// banks once at startup and then on every state change; device errors
/// escalate to a fault.
pub fn spawn_watcher(
    device: &Path,
    switches: Arc<SwitchBank>,
    limits: Arc<LimitBank>,
    port: StatePort,
    priority: i32,
) -> std::thread::JoinHandle<()> {
    let device = device.to_path_buf();
    let rt = RtConfig {
        cpu: None,
        priority: Some(priority),
    };
    spawn_task("input-watcher", rt, move || {
        let mut file = match File::open(&device) {
            Ok(file) => file,
            Err(e) => {
                error!("event device {}: {e}", device.display());
                port.report(SubSystem::Switches, switches_sub::FAULTED);
                port.report(SubSystem::Limits, limits_sub::FAULTED);
                return;
            }
        };
        info!("input watcher on {}", device.display());
        publish_switches(&switches, &port);
        publish_limits(&limits, &port);

        let mut buf = [0u8; EVENT_SIZE];
        loop {
            if let Err(e) = file.read_exact(&mut buf) {
                error!("event device closed: {e}");
                port.report(SubSystem::Switches, switches_sub::FAULTED);
                port.report(SubSystem::Limits, limits_sub::FAULTED);
                return;
            }
            let event = decode_event(&buf);
            if event.kind != EV_SW {
                continue;
            }
            debug!(code = event.code, value = event.value, "switch event");
            if switches.apply(event) {
                publish_switches(&switches, &port);
            }
            if limits.apply(event) {
                publish_limits(&limits, &port);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_common::state::{StateUpdate, state_machine};

    fn sw_event(code: u16, value: i32) -> RawEvent {
        RawEvent {
            kind: EV_SW,
            code,
            value,
        }
    }

    #[test]
    fn decode_reads_fields_past_the_timeval() {
        let mut buf = [0u8; EVENT_SIZE];
        let off = std::mem::size_of::<libc::timeval>();
        buf[off..off + 2].copy_from_slice(&EV_SW.to_ne_bytes());
        buf[off + 2..off + 4].copy_from_slice(&7u16.to_ne_bytes());
        buf[off + 4..off + 8].copy_from_slice(&1i32.to_ne_bytes());
        assert_eq!(decode_event(&buf), sw_event(7, 1));
    }

    #[test]
    fn invert_flag_is_per_switch() {
        // Two switches with opposite wiring on adjacent codes.
        let bank = SwitchBank::new(&[
            SwitchDef {
                name: "lid",
                code: 3,
                invert: false,
            },
            SwitchDef {
                name: "interlock",
                code: 4,
                invert: true,
            },
        ]);
        assert!(!bank.is_safe()); // inverted switch reads engaged at rest
        // A zero on the inverted switch releases it.
        assert!(bank.apply(sw_event(4, 1)));
        assert!(bank.is_safe());
        // A one on the non-inverted switch engages only that switch.
        assert!(bank.apply(sw_event(3, 1)));
        assert!(!bank.is_safe());
        assert!(bank.apply(sw_event(3, 0)));
        assert!(bank.is_safe());
    }

    #[test]
    fn repeated_events_do_not_toggle() {
        let bank = SwitchBank::new(&[SwitchDef {
            name: "lid",
            code: 3,
            invert: false,
        }]);
        assert!(bank.apply(sw_event(3, 1)));
        assert!(!bank.apply(sw_event(3, 1)));
        assert!(bank.apply(sw_event(3, 0)));
    }

    #[test]
    fn limit_bank_maps_axes() {
        let bank = LimitBank::new(&[
            LimitDef {
                axis: 0,
                code: 10,
                invert: false,
            },
            LimitDef {
                axis: 1,
                code: 11,
                invert: false,
            },
        ]);
        assert!(!bank.any_engaged());
        assert!(bank.apply(sw_event(10, 1)));
        assert!(bank.engaged(0));
        assert!(!bank.engaged(1));
        assert!(bank.any_engaged());
    }

    #[test]
    fn limit_trip_during_run_escalates_to_alarm() {
        let (mut aggregator, port) = state_machine();
        aggregator.register(SubSystem::Cli, switches_sub::accept_table(), None);
        aggregator.register(SubSystem::Hardware, switches_sub::accept_table(), None);
        aggregator.register(SubSystem::Switches, switches_sub::accept_table(), None);
        aggregator.register(SubSystem::Motion, switches_sub::accept_table(), None);
        aggregator.register(SubSystem::Limits, limits_sub::accept_table(), None);
        for sub in SubSystem::ALL {
            aggregator.apply(StateUpdate::Sub { sub, substate: 0 });
        }
        aggregator.apply(StateUpdate::Request {
            state: SysState::Run,
        });
        assert_eq!(port.signals().state(), SysState::Run);

        // Limit bit clears mid-run: the watcher publishes TRIPPED and
        // the aggregator adopts Alarm within one update.
        let bank = LimitBank::new(&[LimitDef {
            axis: 0,
            code: 10,
            invert: false,
        }]);
        assert!(bank.apply(sw_event(10, 1)));
        publish_limits(&bank, &port);
        // The port queues the update; drive the aggregator by hand.
        aggregator.apply(StateUpdate::Sub {
            sub: SubSystem::Limits,
            substate: limits_sub::TRIPPED,
        });
        assert_eq!(port.signals().state(), SysState::Alarm);
    }
}
