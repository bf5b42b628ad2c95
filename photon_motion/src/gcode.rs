//! G-code parser and modal-state interpreter.
//!
//! Takes one pre-groomed text line (upper-case, no whitespace, no
//! comments) and the persistent parser state; validates the line
//! against the modal-group rules, then dispatches the resulting motion
//! to the motion-control layer. On any error the line is rejected as a
//! whole and the parser state is left untouched.
//!
//! The semantic pass follows the canonical NGC ordering: non-modal
//! commands, motion mode, plane select, distance mode, arc-IJK mode,
//! feed-rate mode, units, cutter compensation, coordinate selection,
//! path control, then the M-code groups for program flow, spindle
//! (laser), and coolant.

use bitflags::bitflags;

use photon_common::{AXIS_X, AXIS_Y, AXIS_Z, MM_PER_INCH, N_AXIS};
use photon_common::status::Status;

use crate::line::next_word;
use crate::motion_ctrl::MotionCtrl;
use crate::planner::{BlockCond, PlanLineData};

/// Largest accepted N word.
const MAX_LINE_NUMBER: i32 = 9_999_999;

bitflags! {
    /// Value words seen on the current line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValueWords: u16 {
        const F = 1 << 0;
        const I = 1 << 1;
        const J = 1 << 2;
        const K = 1 << 3;
        const L = 1 << 4;
        const N = 1 << 5;
        const P = 1 << 6;
        const R = 1 << 7;
        const S = 1 << 8;
        const T = 1 << 9;
        const X = 1 << 10;
        const Y = 1 << 11;
        const Z = 1 << 12;
    }

    /// Modal groups claimed by commands on the current line; a group
    /// claimed twice is a modal-group violation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct ModalGroups: u16 {
        const G0_NON_MODAL   = 1 << 0;
        const G1_MOTION      = 1 << 1;
        const G2_PLANE       = 1 << 2;
        const G3_DISTANCE    = 1 << 3;
        const G4_ARC_IJK     = 1 << 4;
        const G5_FEED_RATE   = 1 << 5;
        const G6_UNITS       = 1 << 6;
        const G7_CUTTER_COMP = 1 << 7;
        const G12_COORD_SEL  = 1 << 8;
        const G13_PATH       = 1 << 9;
        const M4_PROGRAM     = 1 << 10;
        const M7_SPINDLE     = 1 << 11;
        const M8_COOLANT     = 1 << 12;
    }
}

impl ValueWords {
    const AXIS: ValueWords = ValueWords::X.union(ValueWords::Y).union(ValueWords::Z);
    const IJK: ValueWords = ValueWords::I.union(ValueWords::J).union(ValueWords::K);

    fn axis(idx: usize) -> ValueWords {
        match idx {
            AXIS_X => ValueWords::X,
            AXIS_Y => ValueWords::Y,
            _ => ValueWords::Z,
        }
    }

    fn ijk(idx: usize) -> ValueWords {
        match idx {
            AXIS_X => ValueWords::I,
            AXIS_Y => ValueWords::J,
            _ => ValueWords::K,
        }
    }
}

// ─── Modal State ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Seek,
    Linear,
    CwArc,
    CcwArc,
    /// G80 - motion canceled.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    InverseTime,
    #[default]
    UnitsPerMin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitsMode {
    #[default]
    Mm,
    Inches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneSelect {
    #[default]
    Xy,
    Zx,
    Yz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Default,
    /// M0 - pause until cycle start.
    Paused,
    /// M2/M30 - program complete.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleMode {
    #[default]
    Disable,
    Cw,
    Ccw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoolantState {
    pub flood: bool,
    pub mist: bool,
}

/// Persistent modal settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModalState {
    pub motion: MotionMode,
    pub feed_rate: FeedRateMode,
    pub units: UnitsMode,
    pub distance: DistanceMode,
    pub plane: PlaneSelect,
    /// Selected work coordinate system, 0 = G54 … 5 = G59. Selection is
    /// tracked; offsets are not persisted.
    pub coord_select: u8,
    pub program_flow: ProgramFlow,
    pub coolant: CoolantState,
    pub spindle: SpindleMode,
}

/// The interpreter state surviving across lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParserState {
    pub modal: ModalState,
    pub spindle_speed: f32,
    /// Feed rate [mm/min] (G94 modal value).
    pub feed_rate: f32,
    pub line_number: i32,
    /// Interpreter's tool position [mm].
    pub position: [f32; N_AXIS],
}

impl ParserState {
    pub fn new() -> Self {
        Self {
            modal: ModalState::default(),
            spindle_speed: 0.0,
            feed_rate: 0.0,
            line_number: 0,
            position: [0.0; N_AXIS],
        }
    }

    /// Consume a pending program-flow event (M0/M2/M30).
    pub fn take_program_flow(&mut self) -> ProgramFlow {
        std::mem::replace(&mut self.modal.program_flow, ProgramFlow::Default)
    }

    /// Re-anchor the interpreter position [mm] (reset, homing).
    pub fn sync_position(&mut self, position_mm: [f32; N_AXIS]) {
        self.position = position_mm;
    }
}

impl Default for ParserState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Per-Line Scratch ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonModal {
    None,
    Dwell,
    /// G28 - go to primary home position.
    GoHome0,
    /// G30 - go to secondary home position.
    GoHome1,
    /// G53 - machine-coordinate override for this line.
    AbsoluteOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisCommand {
    None,
    NonModal,
    MotionMode,
}

#[derive(Debug, Clone, Copy, Default)]
struct ValueGroup {
    f: f32,
    ijk: [f32; N_AXIS],
    n: i32,
    p: f32,
    r: f32,
    s: f32,
    xyz: [f32; N_AXIS],
}

/// Scratch record populated per line and discarded on accept/reject.
struct ParserBlock {
    modal: ModalState,
    values: ValueGroup,
    words: ValueWords,
    non_modal: NonModal,
    axis_command: AxisCommand,
}

// ─── Parser Entry Point ─────────────────────────────────────────────

/// Parse and execute one groomed line.
///
/// On success the parser state is committed and any motion has been
/// dispatched; on error the state is untouched and nothing was queued.
pub fn execute_line(
    state: &mut ParserState,
    line: &str,
    mc: &mut MotionCtrl,
    check_mode: bool,
) -> Result<(), Status> {
    let mut block = ParserBlock {
        modal: state.modal,
        values: ValueGroup::default(),
        words: ValueWords::empty(),
        non_modal: NonModal::None,
        axis_command: AxisCommand::None,
    };
    block.modal.program_flow = ProgramFlow::Default;
    let mut groups = ModalGroups::empty();

    // ── Pass 1: tokenize and map words ──
    let mut pos = 0usize;
    while let Some(word) = next_word(line, &mut pos)? {
        match word.letter {
            'G' => parse_g_word(&mut block, &mut groups, word.int_value, word.mantissa)?,
            'M' => {
                if word.mantissa != 0 {
                    return Err(Status::CommandValueNotInteger);
                }
                parse_m_word(&mut block, &mut groups, word.int_value)?
            }
            letter => parse_value_word(&mut block, letter, word.value, word.mantissa)?,
        }
    }

    if line.is_empty() {
        return Ok(());
    }

    // ── Pass 2: semantic checks ──
    let axis_words = block.words & ValueWords::AXIS;

    // Line number.
    if block.words.contains(ValueWords::N) && block.values.n > MAX_LINE_NUMBER {
        return Err(Status::InvalidLineNumber);
    }

    // G53 rides on a G0/G1 motion only.
    if block.non_modal == NonModal::AbsoluteOverride
        && !matches!(block.modal.motion, MotionMode::Seek | MotionMode::Linear)
    {
        return Err(Status::InvalidStatement);
    }

    // Unit conversion for linear words.
    let unit_factor = if block.modal.units == UnitsMode::Inches {
        MM_PER_INCH
    } else {
        1.0
    };
    for idx in 0..N_AXIS {
        block.values.xyz[idx] *= unit_factor;
        block.values.ijk[idx] *= unit_factor;
    }
    block.values.r *= unit_factor;

    // Feed rate: inverse time never carries across lines.
    let mut claimed = ValueWords::N;
    if block.modal.feed_rate == FeedRateMode::InverseTime {
        if block.axis_command == AxisCommand::MotionMode
            && !matches!(block.modal.motion, MotionMode::Seek | MotionMode::None)
            && !block.words.contains(ValueWords::F)
        {
            return Err(Status::UndefinedFeedRate);
        }
    } else if block.words.contains(ValueWords::F) {
        block.values.f *= unit_factor;
        // A programmed rate the tick frequency cannot deliver on any
        // axis is rejected outright rather than silently clamped.
        let mut min_steps_per_mm = f32::MAX;
        for axis in &mc.settings.axes {
            min_steps_per_mm = min_steps_per_mm.min(axis.steps_per_mm);
        }
        if block.values.f / 60.0 * min_steps_per_mm > mc.settings.step_frequency as f32 / 2.0 {
            return Err(Status::MaxStepRateExceeded);
        }
    } else {
        block.values.f = state.feed_rate;
    }
    claimed |= ValueWords::F;

    // Spindle (laser) speed ceiling.
    if block.words.contains(ValueWords::S) {
        if block.values.s > mc.settings.spindle_max {
            return Err(Status::MaxValueExceeded);
        }
        claimed |= ValueWords::S;
    }
    claimed |= ValueWords::T; // Tool selection is accepted and ignored.

    // Dwell needs its P word.
    if block.non_modal == NonModal::Dwell {
        if !block.words.contains(ValueWords::P) {
            return Err(Status::ValueWordMissing);
        }
        claimed |= ValueWords::P;
    }

    // ── Target computation ──
    let mut target = state.position;
    if !axis_words.is_empty() {
        for idx in 0..N_AXIS {
            if !axis_words.contains(ValueWords::axis(idx)) {
                continue;
            }
            target[idx] = match block.modal.distance {
                _ if block.non_modal == NonModal::AbsoluteOverride => block.values.xyz[idx],
                DistanceMode::Absolute => block.values.xyz[idx],
                DistanceMode::Incremental => state.position[idx] + block.values.xyz[idx],
            };
        }
    }

    // ── Motion mode checks ──
    // The modal motion applies when explicitly commanded, or when axis
    // words are present and no non-modal command claims them.
    let motion_applies = block.axis_command == AxisCommand::MotionMode
        || (!axis_words.is_empty() && block.axis_command == AxisCommand::None);
    let mut arc = None;
    if motion_applies {
        match block.modal.motion {
            MotionMode::None => {
                if !axis_words.is_empty() {
                    return Err(Status::AxisWordsExist);
                }
            }
            MotionMode::Seek => {
                if block.axis_command == AxisCommand::MotionMode && axis_words.is_empty() {
                    return Err(Status::NoAxisWords);
                }
                mc.check_target(&target)?;
                claimed |= ValueWords::AXIS;
            }
            MotionMode::Linear => {
                if block.axis_command == AxisCommand::MotionMode && axis_words.is_empty() {
                    return Err(Status::NoAxisWords);
                }
                if block.modal.feed_rate == FeedRateMode::UnitsPerMin && block.values.f == 0.0 {
                    return Err(Status::UndefinedFeedRate);
                }
                mc.check_target(&target)?;
                claimed |= ValueWords::AXIS;
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                if block.modal.feed_rate == FeedRateMode::UnitsPerMin && block.values.f == 0.0 {
                    return Err(Status::UndefinedFeedRate);
                }
                mc.check_target(&target)?;
                arc = Some(check_arc(state, &mut block, &target, &mut claimed)?);
                claimed |= ValueWords::AXIS;
            }
        }
    }

    // G28/G30 claim axis words as an intermediate point.
    if matches!(block.non_modal, NonModal::GoHome0 | NonModal::GoHome1) {
        claimed |= ValueWords::AXIS;
    }

    // ── Unused words ──
    if !(block.words & !claimed).is_empty() {
        return Err(Status::UnusedWords);
    }

    // ── Pass 3: execute and commit ──
    if block.words.contains(ValueWords::N) {
        state.line_number = block.values.n;
    }
    state.modal.feed_rate = block.modal.feed_rate;
    if block.modal.feed_rate == FeedRateMode::UnitsPerMin {
        state.feed_rate = block.values.f;
    }
    if block.words.contains(ValueWords::S) {
        state.spindle_speed = block.values.s;
    }
    state.modal.spindle = block.modal.spindle;
    state.modal.coolant = block.modal.coolant;
    state.modal.units = block.modal.units;
    state.modal.plane = block.modal.plane;
    state.modal.distance = block.modal.distance;
    state.modal.coord_select = block.modal.coord_select;
    state.modal.motion = block.modal.motion;

    let mut pl_data = PlanLineData {
        feed_rate: block.values.f,
        spindle_speed: state.spindle_speed,
        condition: BlockCond::empty(),
        line_number: state.line_number,
    };
    if state.modal.spindle != SpindleMode::Disable {
        pl_data.condition |= BlockCond::SPINDLE_CW;
    }
    if state.modal.coolant.flood {
        pl_data.condition |= BlockCond::COOLANT_FLOOD;
    }
    if state.modal.coolant.mist {
        pl_data.condition |= BlockCond::COOLANT_MIST;
    }
    if state.modal.feed_rate == FeedRateMode::InverseTime {
        pl_data.condition |= BlockCond::INVERSE_TIME;
    }

    // Dwell.
    if block.non_modal == NonModal::Dwell && !check_mode {
        mc.mc_dwell(block.values.p);
    }

    // Move-to-home non-modals: optional intermediate point, then the
    // stored (zero) home position for the commanded axes.
    if matches!(block.non_modal, NonModal::GoHome0 | NonModal::GoHome1) {
        let mut rapid = pl_data;
        rapid.condition |= BlockCond::RAPID;
        if !axis_words.is_empty() {
            dispatch_line(mc, &target, &rapid, check_mode)?;
            state.position = target;
        }
        let mut home = state.position;
        for idx in 0..N_AXIS {
            if axis_words.is_empty() || axis_words.contains(ValueWords::axis(idx)) {
                home[idx] = 0.0;
            }
        }
        dispatch_line(mc, &home, &rapid, check_mode)?;
        state.position = home;
    }

    // Modal motion.
    if motion_applies && !axis_words.is_empty() {
        match state.modal.motion {
            MotionMode::Seek => {
                let mut rapid = pl_data;
                rapid.condition |= BlockCond::RAPID;
                rapid.condition.remove(BlockCond::INVERSE_TIME);
                dispatch_line(mc, &target, &rapid, check_mode)?;
                state.position = target;
            }
            MotionMode::Linear => {
                dispatch_line(mc, &target, &pl_data, check_mode)?;
                state.position = target;
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                if let Some((offset, radius, axis_0, axis_1, axis_linear)) = arc {
                    if check_mode {
                        mc.check_target(&target)?;
                    } else {
                        let mut position = state.position;
                        mc.mc_arc(
                            &target,
                            &pl_data,
                            &mut position,
                            &offset,
                            radius,
                            axis_0,
                            axis_1,
                            axis_linear,
                            state.modal.motion == MotionMode::CwArc,
                        )?;
                    }
                    state.position = target;
                }
            }
            MotionMode::None => {}
        }
    }

    // Program flow.
    match block.modal.program_flow {
        ProgramFlow::Default => {}
        ProgramFlow::Paused => {
            state.modal.program_flow = ProgramFlow::Paused;
        }
        ProgramFlow::Completed => {
            // M2/M30: modal reset to power-up defaults.
            state.modal = ModalState {
                program_flow: ProgramFlow::Completed,
                ..ModalState::default()
            };
            state.spindle_speed = 0.0;
            state.feed_rate = 0.0;
        }
    }
    Ok(())
}

fn dispatch_line(
    mc: &mut MotionCtrl,
    target: &[f32; N_AXIS],
    pl_data: &PlanLineData,
    check_mode: bool,
) -> Result<(), Status> {
    if check_mode {
        mc.check_target(target)
    } else {
        mc.mc_line(target, pl_data)
    }
}

// ─── Word Mapping ───────────────────────────────────────────────────

fn claim_group(groups: &mut ModalGroups, group: ModalGroups) -> Result<(), Status> {
    if groups.contains(group) {
        return Err(Status::ModalGroupViolation);
    }
    groups.insert(group);
    Ok(())
}

fn set_axis_command(block: &mut ParserBlock, command: AxisCommand) -> Result<(), Status> {
    if block.axis_command != AxisCommand::None {
        return Err(Status::AxisCommandConflict);
    }
    block.axis_command = command;
    Ok(())
}

fn parse_g_word(
    block: &mut ParserBlock,
    groups: &mut ModalGroups,
    int_value: i32,
    mantissa: u16,
) -> Result<(), Status> {
    match (int_value, mantissa) {
        (0..=3, 0) => {
            claim_group(groups, ModalGroups::G1_MOTION)?;
            set_axis_command(block, AxisCommand::MotionMode)?;
            block.modal.motion = match int_value {
                0 => MotionMode::Seek,
                1 => MotionMode::Linear,
                2 => MotionMode::CwArc,
                _ => MotionMode::CcwArc,
            };
        }
        (80, 0) => {
            claim_group(groups, ModalGroups::G1_MOTION)?;
            set_axis_command(block, AxisCommand::MotionMode)?;
            block.modal.motion = MotionMode::None;
        }
        (4, 0) => {
            claim_group(groups, ModalGroups::G0_NON_MODAL)?;
            block.non_modal = NonModal::Dwell;
        }
        (28, 0) | (30, 0) => {
            claim_group(groups, ModalGroups::G0_NON_MODAL)?;
            set_axis_command(block, AxisCommand::NonModal)?;
            block.non_modal = if int_value == 28 {
                NonModal::GoHome0
            } else {
                NonModal::GoHome1
            };
        }
        (53, 0) => {
            claim_group(groups, ModalGroups::G0_NON_MODAL)?;
            block.non_modal = NonModal::AbsoluteOverride;
        }
        // Coordinate-offset persistence is out of scope.
        (10, _) | (92, _) | (28, 10) | (30, 10) => return Err(Status::UnsupportedCommand),
        (17..=19, 0) => {
            claim_group(groups, ModalGroups::G2_PLANE)?;
            block.modal.plane = match int_value {
                17 => PlaneSelect::Xy,
                18 => PlaneSelect::Zx,
                _ => PlaneSelect::Yz,
            };
        }
        (20, 0) | (21, 0) => {
            claim_group(groups, ModalGroups::G6_UNITS)?;
            block.modal.units = if int_value == 20 {
                UnitsMode::Inches
            } else {
                UnitsMode::Mm
            };
        }
        (40, 0) => {
            // Cutter compensation off: the only supported mode.
            claim_group(groups, ModalGroups::G7_CUTTER_COMP)?;
        }
        (54..=59, 0) => {
            claim_group(groups, ModalGroups::G12_COORD_SEL)?;
            block.modal.coord_select = (int_value - 54) as u8;
        }
        (61, 0) => {
            // Exact-path mode: the only supported mode.
            claim_group(groups, ModalGroups::G13_PATH)?;
        }
        (90, 0) | (91, 0) => {
            claim_group(groups, ModalGroups::G3_DISTANCE)?;
            block.modal.distance = if int_value == 90 {
                DistanceMode::Absolute
            } else {
                DistanceMode::Incremental
            };
        }
        (91, 10) => {
            // G91.1: incremental arc IJK, the only supported mode.
            claim_group(groups, ModalGroups::G4_ARC_IJK)?;
        }
        (93, 0) | (94, 0) => {
            claim_group(groups, ModalGroups::G5_FEED_RATE)?;
            block.modal.feed_rate = if int_value == 93 {
                FeedRateMode::InverseTime
            } else {
                FeedRateMode::UnitsPerMin
            };
        }
        _ => return Err(Status::UnsupportedCommand),
    }
    Ok(())
}

fn parse_m_word(
    block: &mut ParserBlock,
    groups: &mut ModalGroups,
    int_value: i32,
) -> Result<(), Status> {
    match int_value {
        0 | 1 | 2 | 30 => {
            claim_group(groups, ModalGroups::M4_PROGRAM)?;
            block.modal.program_flow = match int_value {
                0 => ProgramFlow::Paused,
                1 => ProgramFlow::Default, // Optional stop: no switch fitted.
                _ => ProgramFlow::Completed,
            };
        }
        3 | 4 | 5 => {
            claim_group(groups, ModalGroups::M7_SPINDLE)?;
            block.modal.spindle = match int_value {
                3 => SpindleMode::Cw,
                4 => SpindleMode::Ccw,
                _ => SpindleMode::Disable,
            };
        }
        7 | 8 | 9 => {
            claim_group(groups, ModalGroups::M8_COOLANT)?;
            match int_value {
                7 => block.modal.coolant.mist = true,
                8 => block.modal.coolant.flood = true,
                _ => block.modal.coolant = CoolantState::default(),
            }
        }
        _ => return Err(Status::UnsupportedCommand),
    }
    Ok(())
}

fn parse_value_word(
    block: &mut ParserBlock,
    letter: char,
    value: f32,
    mantissa: u16,
) -> Result<(), Status> {
    let bit = match letter {
        'F' => ValueWords::F,
        'I' => ValueWords::I,
        'J' => ValueWords::J,
        'K' => ValueWords::K,
        'L' => ValueWords::L,
        'N' => ValueWords::N,
        'P' => ValueWords::P,
        'R' => ValueWords::R,
        'S' => ValueWords::S,
        'T' => ValueWords::T,
        'X' => ValueWords::X,
        'Y' => ValueWords::Y,
        'Z' => ValueWords::Z,
        _ => return Err(Status::UnsupportedCommand),
    };
    if block.words.contains(bit) {
        return Err(Status::WordRepeated);
    }
    block.words.insert(bit);

    if matches!(letter, 'F' | 'N' | 'P' | 'S' | 'T') && value < 0.0 {
        return Err(Status::NegativeValue);
    }
    if matches!(letter, 'L' | 'N' | 'T') && mantissa != 0 {
        return Err(Status::CommandValueNotInteger);
    }

    match letter {
        'F' => block.values.f = value,
        'I' => block.values.ijk[AXIS_X] = value,
        'J' => block.values.ijk[AXIS_Y] = value,
        'K' => block.values.ijk[AXIS_Z] = value,
        'L' => {}
        'N' => block.values.n = value as i32,
        'P' => block.values.p = value,
        'R' => block.values.r = value,
        'S' => block.values.s = value,
        'T' => {}
        'X' => block.values.xyz[AXIS_X] = value,
        'Y' => block.values.xyz[AXIS_Y] = value,
        _ => block.values.xyz[AXIS_Z] = value,
    }
    Ok(())
}

// ─── Arc Validation ─────────────────────────────────────────────────

type ArcData = ([f32; N_AXIS], f32, usize, usize, usize);

/// Resolve the plane, validate the offsets/radius form, and compute the
/// arc center offset.
fn check_arc(
    state: &ParserState,
    block: &mut ParserBlock,
    target: &[f32; N_AXIS],
    claimed: &mut ValueWords,
) -> Result<ArcData, Status> {
    let (axis_0, axis_1, axis_linear) = match block.modal.plane {
        PlaneSelect::Xy => (AXIS_X, AXIS_Y, AXIS_Z),
        PlaneSelect::Zx => (AXIS_Z, AXIS_X, AXIS_Y),
        PlaneSelect::Yz => (AXIS_Y, AXIS_Z, AXIS_X),
    };

    let axis_words = block.words & ValueWords::AXIS;
    if !axis_words.contains(ValueWords::axis(axis_0))
        && !axis_words.contains(ValueWords::axis(axis_1))
    {
        return Err(Status::NoAxisWordsInPlane);
    }

    let x = target[axis_0] - state.position[axis_0];
    let y = target[axis_1] - state.position[axis_1];
    let mut offset = [0.0f32; N_AXIS];

    if block.words.contains(ValueWords::R) {
        // R-form: solve the chord for the center.
        *claimed |= ValueWords::R;
        if x == 0.0 && y == 0.0 {
            return Err(Status::InvalidTarget);
        }
        let mut r = block.values.r;
        let h_x2_div_d = 4.0 * r * r - x * x - y * y;
        if h_x2_div_d < 0.0 {
            return Err(Status::ArcRadiusError);
        }
        let mut h = -h_x2_div_d.sqrt() / (x * x + y * y).sqrt();
        if block.modal.motion == MotionMode::CcwArc {
            h = -h;
        }
        // A negative R selects the longer of the two chord solutions.
        if r < 0.0 {
            h = -h;
            r = -r;
        }
        offset[axis_0] = 0.5 * (x - y * h);
        offset[axis_1] = 0.5 * (y + x * h);
        block.values.r = r;
    } else {
        // IJK-form.
        let in_plane = ValueWords::ijk(axis_0) | ValueWords::ijk(axis_1);
        if (block.words & in_plane).is_empty() {
            return Err(Status::NoOffsetsInPlane);
        }
        *claimed |= in_plane;
        offset[axis_0] = block.values.ijk[axis_0];
        offset[axis_1] = block.values.ijk[axis_1];

        // The two endpoint radii must agree: within 0.5 mm or 0.1 % of
        // the radius, whichever is tighter above 0.005 mm.
        let radius = (offset[axis_0] * offset[axis_0] + offset[axis_1] * offset[axis_1]).sqrt();
        let dx = x - offset[axis_0];
        let dy = y - offset[axis_1];
        let target_r = (dx * dx + dy * dy).sqrt();
        let delta_r = (target_r - radius).abs();
        if delta_r > 0.005 {
            if delta_r > 0.5 {
                return Err(Status::ArcRadiusError);
            }
            if delta_r > 0.001 * radius {
                return Err(Status::ArcRadiusError);
            }
        }
        block.values.r = radius;
    }
    Ok((offset, block.values.r, axis_0, axis_1, axis_linear))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::segment_ring;
    use photon_common::settings::Settings;
    use photon_common::state::state_machine;

    fn ctrl() -> MotionCtrl {
        let (_aggregator, port) = state_machine();
        let (tx, _rx) = crossbeam_channel::bounded(8);
        let (producer, _consumer) = segment_ring();
        MotionCtrl::new(Settings::default(), port, tx, producer)
    }

    fn exec(state: &mut ParserState, mc: &mut MotionCtrl, line: &str) -> Result<(), Status> {
        let groomed = crate::line::groom_line(line)?;
        execute_line(state, &groomed, mc, false)
    }

    #[test]
    fn modal_state_round_trip() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G1 X10 Y5 F500").unwrap();
        let snapshot = state;
        exec(&mut state, &mut mc, "G1 X10 Y5 F500").unwrap();
        assert_eq!(state, snapshot);
    }

    #[test]
    fn modal_group_violation_leaves_state_untouched() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        let before = state;
        assert_eq!(
            exec(&mut state, &mut mc, "G0 G1 X1"),
            Err(Status::ModalGroupViolation)
        );
        assert_eq!(state, before);
        assert!(mc.planner.is_empty());
    }

    #[test]
    fn seek_plans_rapid_block() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G0 X100 Y0 F0").unwrap();
        assert_eq!(state.position, [100.0, 0.0, 0.0]);
        assert_eq!(mc.planner.stats.blocks_queued, 1);
        let block = mc.planner.blocks().next().unwrap();
        assert_eq!(block.steps[0], 10667);
        assert_eq!(block.step_event_count, 10667);
        assert!(block.direction_bits.is_empty());
        assert!(block.condition.contains(BlockCond::RAPID));
    }

    #[test]
    fn linear_requires_feed() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        assert_eq!(
            exec(&mut state, &mut mc, "G1 X5"),
            Err(Status::UndefinedFeedRate)
        );
        // Feed is modal once set.
        exec(&mut state, &mut mc, "G1 X5 F300").unwrap();
        exec(&mut state, &mut mc, "X10").unwrap();
        assert_eq!(state.feed_rate, 300.0);
        assert_eq!(state.position[0], 10.0);
    }

    #[test]
    fn inverse_time_feed_never_carries() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G93").unwrap();
        exec(&mut state, &mut mc, "G1 X5 F2").unwrap();
        assert_eq!(
            exec(&mut state, &mut mc, "G1 X10"),
            Err(Status::UndefinedFeedRate)
        );
    }

    #[test]
    fn inch_units_convert_to_mm() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G20").unwrap();
        exec(&mut state, &mut mc, "G0 X1").unwrap();
        assert!((state.position[0] - 25.4).abs() < 1e-4);
    }

    #[test]
    fn incremental_distance_accumulates() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G91").unwrap();
        exec(&mut state, &mut mc, "G0 X5").unwrap();
        exec(&mut state, &mut mc, "G0 X5 Y-2").unwrap();
        assert_eq!(state.position, [10.0, -2.0, 0.0]);
    }

    #[test]
    fn word_errors() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        assert_eq!(
            exec(&mut state, &mut mc, "G1 X1 X2 F100"),
            Err(Status::WordRepeated)
        );
        assert_eq!(exec(&mut state, &mut mc, "G1 F-10 X1"), Err(Status::NegativeValue));
        assert_eq!(exec(&mut state, &mut mc, "G1 F100"), Err(Status::NoAxisWords));
        assert_eq!(exec(&mut state, &mut mc, "G2 X1 F100"), Err(Status::NoOffsetsInPlane));
        assert_eq!(exec(&mut state, &mut mc, "G92 X0"), Err(Status::UnsupportedCommand));
        assert_eq!(exec(&mut state, &mut mc, "G4"), Err(Status::ValueWordMissing));
        assert_eq!(exec(&mut state, &mut mc, "G4 P0 R5"), Err(Status::UnusedWords));
        assert_eq!(exec(&mut state, &mut mc, "Q5"), Err(Status::UnsupportedCommand));
        assert_eq!(exec(&mut state, &mut mc, "N12345678 G0 X1"), Err(Status::InvalidLineNumber));
        assert_eq!(exec(&mut state, &mut mc, "G80 X1"), Err(Status::AxisWordsExist));
        assert_eq!(exec(&mut state, &mut mc, "G28 G2 X1"), Err(Status::AxisCommandConflict));
    }

    #[test]
    fn arc_radius_form_rejects_impossible_radius() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        // Chord of 10 mm cannot be spanned by r = 2 mm.
        assert_eq!(
            exec(&mut state, &mut mc, "G2 X10 R2 F600"),
            Err(Status::ArcRadiusError)
        );
    }

    #[test]
    fn arc_ijk_radius_mismatch_rejected() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        // Start radius 5, end radius wildly different.
        assert_eq!(
            exec(&mut state, &mut mc, "G2 X20 Y0 I5 J0 F600"),
            Err(Status::ArcRadiusError)
        );
    }

    #[test]
    fn small_arc_queues_blocks() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G0 X1").unwrap();
        // Quarter arc from (1,0) to (0,1) around (0,0).
        exec(&mut state, &mut mc, "G3 X0 Y1 I-1 J0 F600").unwrap();
        assert!(mc.planner.stats.blocks_queued > 2);
        assert_eq!(state.position, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn full_circle_r_form_is_invalid_target() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G0 X10").unwrap();
        assert_eq!(
            exec(&mut state, &mut mc, "G2 X10 Y0 R5 F600"),
            Err(Status::InvalidTarget)
        );
    }

    #[test]
    fn program_end_resets_modal_state() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G20 G91 M3 S100").unwrap();
        exec(&mut state, &mut mc, "M2").unwrap();
        assert_eq!(state.modal.units, UnitsMode::Mm);
        assert_eq!(state.modal.distance, DistanceMode::Absolute);
        assert_eq!(state.modal.spindle, SpindleMode::Disable);
        assert_eq!(state.take_program_flow(), ProgramFlow::Completed);
        assert_eq!(state.modal.program_flow, ProgramFlow::Default);
    }

    #[test]
    fn laser_condition_rides_on_blocks() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "M3 S200").unwrap();
        exec(&mut state, &mut mc, "G1 X5 F1000").unwrap();
        let block = mc.planner.blocks().next().unwrap();
        assert!(block.condition.contains(BlockCond::SPINDLE_CW));
        assert_eq!(block.spindle_speed, 200.0);
    }

    #[test]
    fn check_mode_validates_without_queueing() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        let groomed = crate::line::groom_line("G1 X10 F500").unwrap();
        execute_line(&mut state, &groomed, &mut mc, true).unwrap();
        assert!(mc.planner.is_empty());
        assert_eq!(state.position[0], 10.0);

        let groomed = crate::line::groom_line("G0 X9999").unwrap();
        assert_eq!(
            execute_line(&mut state, &groomed, &mut mc, true),
            Err(Status::TravelExceeded)
        );
    }

    #[test]
    fn go_home_moves_through_intermediate_point() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        exec(&mut state, &mut mc, "G0 X10 Y10").unwrap();
        exec(&mut state, &mut mc, "G28 X5").unwrap();
        // Intermediate X5, then X homed to zero; Y untouched.
        assert_eq!(state.position, [0.0, 10.0, 0.0]);
        assert_eq!(mc.planner.stats.blocks_queued, 3);
    }

    #[test]
    fn spindle_speed_ceiling_enforced() {
        let mut mc = ctrl();
        let mut state = ParserState::new();
        assert_eq!(
            exec(&mut state, &mut mc, "M3 S9000"),
            Err(Status::MaxValueExceeded)
        );
    }
}
