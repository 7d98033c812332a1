//! Enumerations and constants shared with the MCU firmware.
//!
//! The numeric values are fixed by the firmware and travel as plain integers
//! inside `mcu:notify:` lines and `set ...` commands.

use std::fmt;

/// Power state reported by the MCU in `mcu:notify:state=<n>`.
///
/// `Transition` is a named firmware value but carries no behaviour on this
/// side; it is handled exactly like an unrecognized integer.  `NotNumeric`
/// records a `state=` value that was not an integer at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Off,
    On,
    PreOff,
    PreOn,
    Transition,
    Unknown(i64),
    NotNumeric,
}

impl PowerState {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => PowerState::Off,
            1 => PowerState::On,
            2 => PowerState::PreOff,
            3 => PowerState::PreOn,
            4 => PowerState::Transition,
            other => PowerState::Unknown(other),
        }
    }

    pub fn raw(self) -> Option<i64> {
        match self {
            PowerState::Off => Some(0),
            PowerState::On => Some(1),
            PowerState::PreOff => Some(2),
            PowerState::PreOn => Some(3),
            PowerState::Transition => Some(4),
            PowerState::Unknown(raw) => Some(raw),
            PowerState::NotNumeric => None,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Off => f.write_str("OFF"),
            PowerState::On => f.write_str("ON"),
            PowerState::PreOff => f.write_str("PRE_OFF"),
            PowerState::PreOn => f.write_str("PRE_ON"),
            PowerState::Transition => f.write_str("TRANSITION"),
            PowerState::Unknown(raw) => write!(f, "UNKNOWN({raw})"),
            PowerState::NotNumeric => f.write_str("UNKNOWN(?)"),
        }
    }
}

/// Host readiness as reported to the MCU with `set status <n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpiStatus {
    Ready = 0,
    NotReady = 1,
    Error = 2,
    Unknown = 3,
}

impl RpiStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            RpiStatus::Ready => "RPiReady",
            RpiStatus::NotReady => "RPiNotReady",
            RpiStatus::Error => "RPiError",
            RpiStatus::Unknown => "RPiUnknown",
        }
    }

    /// The command body that carries this status to the MCU.
    pub fn command(self) -> String {
        format!("set status {}", self.code())
    }
}

// ── buttons ───────────────────────────────────────────────────────────────────

/// Bits of the button bitfield in `mcu:notify:button=<bits>,<phase>`.
pub const BUTTON_POWER: i64 = 1;
pub const BUTTON_BT: i64 = 2;
pub const BUTTON_PLAY: i64 = 4;
pub const BUTTON_PLUS: i64 = 8;
pub const BUTTON_MINUS: i64 = 16;

/// Press phase reported alongside the button bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    ShortPress,
    ShortRelease,
    MediumPress,
    MediumRelease,
    LongPress,
    LongRelease,
    VeryLongPress,
    VeryLongRelease,
    VeryVeryLongPress,
    VeryVeryLongRelease,
    DoublePress,
    DoubleRelease,
    TriplePress,
    TripleRelease,
    Hold,
    Unknown(i64),
}

impl InputState {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => InputState::ShortPress,
            1 => InputState::ShortRelease,
            2 => InputState::MediumPress,
            3 => InputState::MediumRelease,
            4 => InputState::LongPress,
            5 => InputState::LongRelease,
            6 => InputState::VeryLongPress,
            7 => InputState::VeryLongRelease,
            8 => InputState::VeryVeryLongPress,
            9 => InputState::VeryVeryLongRelease,
            10 => InputState::DoublePress,
            11 => InputState::DoubleRelease,
            12 => InputState::TriplePress,
            13 => InputState::TripleRelease,
            14 => InputState::Hold,
            other => InputState::Unknown(other),
        }
    }
}

// ── MCU command bodies ────────────────────────────────────────────────────────

pub const CMD_SYSTEM_SNAPSHOTS_ON: &str = "set send_system_snapshots 1";
pub const CMD_SYSTEM_SNAPSHOTS_OFF: &str = "set send_system_snapshots 0";
pub const CMD_BUTTON_EVENTS_ON: &str = "set send_button_events 1";
pub const CMD_BUTTON_EVENTS_OFF: &str = "set send_button_events 0";
/// LED 2 in Raspberry Pi red.
pub const CMD_LED_ON: &str = "set led_2 227 27 27";
pub const CMD_LED_OFF: &str = "set led_2 0 0 0";
pub const CMD_SHUTDOWN_READY: &str = "shutdown_ready";

pub fn streaming_active_command(active: bool) -> String {
    format!("set streaming_active {}", u8::from(active))
}
