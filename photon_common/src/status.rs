//! Status, alarm, and fault codes.
//!
//! Three severities, matching the controller's error handling design:
//! [`Status`] codes are returned synchronously from the parser and motion
//! primitives and never change machine state. [`Alarm`] codes describe
//! unsafe conditions that require a reset. [`Fault`] codes describe
//! unrecoverable subsystem failures that require a restart.
//!
//! All enums are `#[repr(u8)]` so the numeric value is the wire code
//! (`error:<n>` / `ALARM:<n>`).

use thiserror::Error;

// ─── Status Codes ───────────────────────────────────────────────────

/// Synchronous diagnostic outcome of parsing or motion primitives.
///
/// Reported to the user as `error:<n>`; the machine state is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum Status {
    /// Line does not begin with a letter where a command word is expected.
    #[error("expected command letter")]
    ExpectedCommandLetter = 1,
    /// Numeric value has a malformed format.
    #[error("bad number format")]
    BadNumberFormat = 2,
    /// Statement is recognized but not valid in this context.
    #[error("invalid statement")]
    InvalidStatement = 3,
    /// Negative value for a word that must be non-negative.
    #[error("negative value")]
    NegativeValue = 4,
    /// Command requires the machine to be idle.
    #[error("machine not idle")]
    IdleError = 5,
    /// Soft limit would be violated by a system motion.
    #[error("soft limit")]
    SoftLimitError = 6,
    /// Numeric value overflows the supported range.
    #[error("value overflow")]
    Overflow = 7,
    /// Programmed rate exceeds what the step frequency can deliver.
    #[error("max step rate exceeded")]
    MaxStepRateExceeded = 8,
    /// Input line longer than the line buffer.
    #[error("line length exceeded")]
    LineLengthExceeded = 9,
    /// Target outside the configured axis travel.
    #[error("travel exceeded")]
    TravelExceeded = 10,
    /// Word or command the parser does not support.
    #[error("unsupported command")]
    UnsupportedCommand = 11,
    /// Two commands from the same modal group on one line.
    #[error("modal group violation")]
    ModalGroupViolation = 12,
    /// Feed-rate mode requires an F word that is missing or zero.
    #[error("undefined feed rate")]
    UndefinedFeedRate = 13,
    /// Word value must be an integer.
    #[error("command value not integer")]
    CommandValueNotInteger = 14,
    /// Two commands on one line both require axis words.
    #[error("axis command conflict")]
    AxisCommandConflict = 15,
    /// The same word letter appears twice on one line.
    #[error("word repeated")]
    WordRepeated = 16,
    /// Command requires axis words but none are present.
    #[error("no axis words")]
    NoAxisWords = 17,
    /// Line number out of range.
    #[error("invalid line number")]
    InvalidLineNumber = 18,
    /// Command requires a value word that is missing.
    #[error("value word missing")]
    ValueWordMissing = 19,
    /// Axis words present but no command on the line uses them.
    #[error("unused axis words")]
    AxisWordsExist = 20,
    /// Arc command without axis words in the selected plane.
    #[error("no axis words in plane")]
    NoAxisWordsInPlane = 21,
    /// Motion target cannot be reached (e.g. zero-length R-form arc).
    #[error("invalid target")]
    InvalidTarget = 22,
    /// Arc radius is impossible or endpoint radii disagree.
    #[error("arc radius error")]
    ArcRadiusError = 23,
    /// Arc command without IJK offsets or R in the selected plane.
    #[error("no offsets in plane")]
    NoOffsetsInPlane = 24,
    /// Value words left unclaimed after all commands consumed theirs.
    #[error("unused value words")]
    UnusedWords = 25,
    /// Value exceeds its configured maximum.
    #[error("max value exceeded")]
    MaxValueExceeded = 26,
}

impl Status {
    /// Numeric wire code, as reported in `error:<n>`.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Convert from a raw wire code. Returns `None` for unknown codes.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ExpectedCommandLetter),
            2 => Some(Self::BadNumberFormat),
            3 => Some(Self::InvalidStatement),
            4 => Some(Self::NegativeValue),
            5 => Some(Self::IdleError),
            6 => Some(Self::SoftLimitError),
            7 => Some(Self::Overflow),
            8 => Some(Self::MaxStepRateExceeded),
            9 => Some(Self::LineLengthExceeded),
            10 => Some(Self::TravelExceeded),
            11 => Some(Self::UnsupportedCommand),
            12 => Some(Self::ModalGroupViolation),
            13 => Some(Self::UndefinedFeedRate),
            14 => Some(Self::CommandValueNotInteger),
            15 => Some(Self::AxisCommandConflict),
            16 => Some(Self::WordRepeated),
            17 => Some(Self::NoAxisWords),
            18 => Some(Self::InvalidLineNumber),
            19 => Some(Self::ValueWordMissing),
            20 => Some(Self::AxisWordsExist),
            21 => Some(Self::NoAxisWordsInPlane),
            22 => Some(Self::InvalidTarget),
            23 => Some(Self::ArcRadiusError),
            24 => Some(Self::NoOffsetsInPlane),
            25 => Some(Self::UnusedWords),
            26 => Some(Self::MaxValueExceeded),
            _ => None,
        }
    }
}

// ─── Alarm Codes ────────────────────────────────────────────────────

/// Unsafe condition requiring a reset, reported as `ALARM:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum Alarm {
    /// A limit switch opened while the machine was in motion.
    #[error("hard limit violation")]
    HardLimit = 1,
    /// A motion command arrived while the machine was not idle.
    #[error("command while not idle")]
    CommandWhileBusy = 2,
    /// Stepper hardware reported disabled while it should be active.
    #[error("hardware unexpectedly disabled")]
    HardwareDisabled = 3,
    /// Homing finished its travel without reaching a limit switch.
    #[error("homing failed")]
    HomingFail = 4,
}

impl Alarm {
    /// Numeric wire code, as reported in `ALARM:<n>`.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::HardLimit),
            2 => Some(Self::CommandWhileBusy),
            3 => Some(Self::HardwareDisabled),
            4 => Some(Self::HomingFail),
            _ => None,
        }
    }
}

// ─── Fault Codes ────────────────────────────────────────────────────

/// Unrecoverable subsystem failure; the controller must be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum Fault {
    /// An input event device closed underneath its watcher.
    #[error("event device closed")]
    EventDeviceClosed = 1,
    /// A required kernel attribute file is missing.
    #[error("missing kernel attribute")]
    MissingAttribute = 2,
    /// The pulse FIFO could not be opened.
    #[error("pulse FIFO open failed")]
    FifoOpenFailed = 3,
    /// An internal queue overflowed.
    #[error("queue overflow")]
    QueueOverflow = 4,
    /// Stepper driver registers failed bring-up verification.
    #[error("register verification failed")]
    RegisterVerify = 5,
}

impl Fault {
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}
