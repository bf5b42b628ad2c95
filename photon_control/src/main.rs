//! # Photon Control
//!
//! Main control binary for the Photon laser CNC controller: brings up
//! the stepper hardware, wires the hierarchical FSM, and runs the five
//! long-lived tasks (CLI readers, parser worker, FSM aggregator, step
//! generator, input watcher).
//!
//! # Usage
//!
//! ```bash
//! # Run against real hardware
//! photon_control --config /etc/photon/photon.toml
//!
//! # Run with the simulation driver
//! photon_control --simulate -v
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use photon_common::hal::{StepperHw, bring_up};
use photon_common::rt::{MonotonicPacer, RtConfig, spawn_task};
use photon_common::settings::{GCODE_QUEUE_DEPTH, Settings};
use photon_common::state::{SubSystem, state_machine};
use photon_hal::DEFAULT_REG_TABLE;
use photon_hal::input::{
    LimitBank, LimitDef, SwitchBank, SwitchDef, limits_sub, report_static_safe, spawn_watcher,
    switches_sub,
};
use photon_hal::sim::SimStepper;
use photon_hal::sysfs::SysfsStepper;
use photon_motion::motion_ctrl::MotionCtrl;
use photon_motion::segment::segment_ring;
use photon_motion::stepgen::{HardwareHandler, StepGen, StepgenMsg, hardware_sub, motion_sub};

use photon_control::{cli, worker};
use worker::{MotionHandler, Worker, cli_sub};

/// Event codes for the interlock switches.
const SWITCH_DEFS: [SwitchDef; 2] = [
    SwitchDef {
        name: "lid",
        code: 0,
        invert: false,
    },
    SwitchDef {
        name: "interlock",
        code: 1,
        invert: false,
    },
];

/// Event codes for the axis limit switches.
const LIMIT_DEFS: [LimitDef; 2] = [
    LimitDef {
        axis: 0,
        code: 4,
        invert: false,
    },
    LimitDef {
        axis: 1,
        code: 5,
        invert: false,
    },
];

/// Photon laser CNC controller
#[derive(Parser, Debug)]
#[command(name = "photon_control")]
#[command(version)]
#[command(about = "Real-time motion controller for laser CNC hardware")]
struct Args {
    /// Path to the settings file (TOML). Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the simulation stepper driver instead of real hardware.
    #[arg(short, long)]
    simulate: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);
    info!("Photon control v{} starting...", env!("CARGO_PKG_VERSION"));

    // ── Settings ──
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let settings = Arc::new(settings);

    // ── FSM ──
    let (mut aggregator, port) = state_machine();

    // ── Hardware bring-up ──
    let (stepgen_tx, stepgen_rx) = crossbeam_channel::bounded::<StepgenMsg>(16);
    let mut hw: Box<dyn StepperHw> = if args.simulate {
        info!("simulation driver selected");
        Box::new(SimStepper::new())
    } else {
        Box::new(SysfsStepper::open(
            std::path::Path::new(&settings.sysfs_root),
            std::path::Path::new(&settings.pulse_fifo),
        )?)
    };
    bring_up(
        hw.as_mut(),
        &DEFAULT_REG_TABLE,
        photon_common::N_AXIS,
        settings.step_frequency,
    )?;
    info!("stepper registers verified");

    // ── Channels and shared structures ──
    let (line_tx, line_rx) = crossbeam_channel::bounded(GCODE_QUEUE_DEPTH);
    let (refill_tx, refill_rx) = crossbeam_channel::bounded(4);
    let (seg_producer, seg_consumer) = segment_ring();
    let switches = Arc::new(SwitchBank::new(&SWITCH_DEFS));
    let limits = Arc::new(LimitBank::new(&LIMIT_DEFS));

    // ── Sub-FSM registration (order fixes notification order) ──
    aggregator.register(SubSystem::Cli, cli_sub::accept_table(), None);
    aggregator.register(
        SubSystem::Hardware,
        hardware_sub::accept_table(),
        Some(Box::new(HardwareHandler::new(stepgen_tx.clone()))),
    );
    aggregator.register(SubSystem::Switches, switches_sub::accept_table(), None);
    aggregator.register(
        SubSystem::Motion,
        motion_sub::accept_table(),
        Some(Box::new(MotionHandler::new(line_tx.clone()))),
    );
    aggregator.register(SubSystem::Limits, limits_sub::accept_table(), None);

    std::thread::Builder::new()
        .name("fsm-aggregator".into())
        .spawn(move || aggregator.run())?;

    // ── Step generator (hard RT) ──
    let stepgen_period = Duration::from_secs_f64(1.0 / settings.acceleration_ticks_per_second as f64);
    let stepgen = StepGen::new(
        seg_consumer,
        hw,
        Arc::clone(port.signals()),
        port.clone(),
        stepgen_rx,
        refill_tx,
        Box::new(MonotonicPacer::new(stepgen_period)),
        &settings,
    );
    let stepgen_rt = RtConfig {
        cpu: Some(settings.stepper_cpu),
        priority: Some(settings.stepper_priority),
    };
    let _stepgen_handle = spawn_task("step-generator", stepgen_rt, move || stepgen.run());

    // ── Input watcher ──
    if args.simulate {
        report_static_safe(&port);
    } else {
        let _watcher_handle = spawn_watcher(
            std::path::Path::new(&settings.event_device),
            Arc::clone(&switches),
            Arc::clone(&limits),
            port.clone(),
            settings.watcher_priority,
        );
    }

    // ── Parser worker ──
    let mc = MotionCtrl::new(
        (*settings).clone(),
        port.clone(),
        stepgen_tx.clone(),
        seg_producer,
    );
    let worker = Worker::new(mc, line_rx, refill_rx, port.clone(), Arc::clone(&limits));
    std::thread::Builder::new()
        .name("parser-worker".into())
        .spawn(move || worker.run())?;

    // ── CLI transports ──
    let ctx = cli::CliContext {
        tx: line_tx,
        port: port.clone(),
        settings: Arc::clone(&settings),
    };
    let _tcp_handle = cli::spawn_tcp_listener(ctx.clone())?;

    // Orderly shutdown on SIGINT.
    let shutdown_tx = stepgen_tx.clone();
    let shutdown_port = port.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        shutdown_port.signals().set_abort(true);
        let _ = shutdown_tx.send(StepgenMsg::Shutdown);
        std::process::exit(0);
    })?;

    // Stdin transport runs on the main thread until EOF.
    cli::stdin_loop(ctx);

    // Stdin closed: park the stepper and exit.
    let _ = stepgen_tx.send(StepgenMsg::Shutdown);
    info!("stdin closed, exiting");
    Ok(())
}

fn setup_tracing(args: &Args) {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
