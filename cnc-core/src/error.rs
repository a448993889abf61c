use serde::Serialize;
use thiserror::Error;

/// Line-level result codes. The numeric values are the `error:<n>` codes of
/// the Grbl protocol and must not be renumbered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[error("expected command letter")]
    ExpectedCommandLetter,
    #[error("bad number format")]
    BadNumberFormat,
    #[error("invalid statement")]
    InvalidStatement,
    #[error("negative value")]
    NegativeValue,
    #[error("setting disabled")]
    SettingDisabled,
    #[error("setting read fail")]
    SettingReadFail,
    #[error("idle error")]
    IdleError,
    #[error("g-code locked")]
    SystemGcLock,
    #[error("soft limit error")]
    SoftLimitError,
    #[error("overflow")]
    Overflow,
    #[error("max step rate exceeded")]
    MaxStepRateExceeded,
    #[error("check door")]
    CheckDoor,
    #[error("line length exceeded")]
    LineLengthExceeded,
    #[error("travel exceeded")]
    TravelExceeded,
    #[error("invalid jog command")]
    InvalidJogCommand,
    #[error("unsupported command")]
    UnsupportedCommand,
    #[error("modal group violation")]
    ModalGroupViolation,
    #[error("undefined feed rate")]
    UndefinedFeedRate,
    #[error("command value not integer")]
    ValueNotInteger,
    #[error("axis command conflict")]
    AxisCommandConflict,
    #[error("word repeated")]
    WordRepeated,
    #[error("no axis words")]
    NoAxisWords,
    #[error("invalid line number")]
    InvalidLineNumber,
    #[error("value word missing")]
    ValueWordMissing,
    #[error("unsupported coordinate system")]
    UnsupportedCoordSys,
    #[error("G53 invalid motion mode")]
    G53InvalidMotionMode,
    #[error("axis words exist")]
    AxisWordsExist,
    #[error("no axis words in plane")]
    NoAxisWordsInPlane,
    #[error("invalid target")]
    InvalidTarget,
    #[error("arc radius error")]
    ArcRadiusError,
    #[error("no offsets in plane")]
    NoOffsetsInPlane,
    #[error("unused words")]
    UnusedWords,
    #[error("G43 dynamic axis error")]
    G43DynamicAxisError,
    #[error("max value exceeded")]
    MaxValueExceeded,
    #[error("bad comment format")]
    BadCommentFormat,
    #[error("invalid tool")]
    InvalidTool,
    #[error("feed not set")]
    FeedNotSet,
    #[error("setting write fail")]
    SettingWriteFail,
    #[error("program ended")]
    ProgramEnded,
    #[error("critical fail")]
    CriticalFail,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::ExpectedCommandLetter => 1,
            Status::BadNumberFormat => 2,
            Status::InvalidStatement => 3,
            Status::NegativeValue => 4,
            Status::SettingDisabled => 5,
            Status::SettingReadFail => 7,
            Status::IdleError => 8,
            Status::SystemGcLock => 9,
            Status::SoftLimitError => 10,
            Status::Overflow => 11,
            Status::MaxStepRateExceeded => 12,
            Status::CheckDoor => 13,
            Status::LineLengthExceeded => 14,
            Status::TravelExceeded => 15,
            Status::InvalidJogCommand => 16,
            Status::UnsupportedCommand => 20,
            Status::ModalGroupViolation => 21,
            Status::UndefinedFeedRate => 22,
            Status::ValueNotInteger => 23,
            Status::AxisCommandConflict => 24,
            Status::WordRepeated => 25,
            Status::NoAxisWords => 26,
            Status::InvalidLineNumber => 27,
            Status::ValueWordMissing => 28,
            Status::UnsupportedCoordSys => 29,
            Status::G53InvalidMotionMode => 30,
            Status::AxisWordsExist => 31,
            Status::NoAxisWordsInPlane => 32,
            Status::InvalidTarget => 33,
            Status::ArcRadiusError => 34,
            Status::NoOffsetsInPlane => 35,
            Status::UnusedWords => 36,
            Status::G43DynamicAxisError => 37,
            Status::MaxValueExceeded => 38,
            Status::BadCommentFormat => 39,
            Status::InvalidTool => 40,
            Status::FeedNotSet => 41,
            Status::SettingWriteFail => 42,
            Status::ProgramEnded => 44,
            Status::CriticalFail => 255,
        }
    }

    pub fn from_code(code: u8) -> Option<Status> {
        ALL_STATUS.iter().copied().find(|s| s.code() == code)
    }
}

const ALL_STATUS: [Status; 40] = [
    Status::ExpectedCommandLetter,
    Status::BadNumberFormat,
    Status::InvalidStatement,
    Status::NegativeValue,
    Status::SettingDisabled,
    Status::SettingReadFail,
    Status::IdleError,
    Status::SystemGcLock,
    Status::SoftLimitError,
    Status::Overflow,
    Status::MaxStepRateExceeded,
    Status::CheckDoor,
    Status::LineLengthExceeded,
    Status::TravelExceeded,
    Status::InvalidJogCommand,
    Status::UnsupportedCommand,
    Status::ModalGroupViolation,
    Status::UndefinedFeedRate,
    Status::ValueNotInteger,
    Status::AxisCommandConflict,
    Status::WordRepeated,
    Status::NoAxisWords,
    Status::InvalidLineNumber,
    Status::ValueWordMissing,
    Status::UnsupportedCoordSys,
    Status::G53InvalidMotionMode,
    Status::AxisWordsExist,
    Status::NoAxisWordsInPlane,
    Status::InvalidTarget,
    Status::ArcRadiusError,
    Status::NoOffsetsInPlane,
    Status::UnusedWords,
    Status::G43DynamicAxisError,
    Status::MaxValueExceeded,
    Status::BadCommentFormat,
    Status::InvalidTool,
    Status::FeedNotSet,
    Status::SettingWriteFail,
    Status::ProgramEnded,
    Status::CriticalFail,
];

/// System alarms. Raising one latches the kill bit until unlock or reset.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Alarm {
    #[error("soft reset")]
    SoftReset,
    #[error("emergency stop")]
    EmergencyStop,
    #[error("hard limit")]
    HardLimit,
    #[error("soft limit")]
    SoftLimit,
    #[error("abort during cycle")]
    AbortCycle,
    #[error("probe fail initial")]
    ProbeFailInitial,
    #[error("probe fail contact")]
    ProbeFailContact,
    #[error("homing fail reset")]
    HomingFailReset,
    #[error("homing fail door")]
    HomingFailDoor,
    #[error("homing fail pulloff")]
    HomingFailPulloff,
    #[error("homing fail approach")]
    HomingFailApproach,
    #[error("homing fail dual approach")]
    HomingFailDualApproach,
    #[error("homing fail limit active")]
    HomingFailLimitActive,
    #[error("hard limit without motion")]
    HardLimitNoMotion,
}

impl Alarm {
    pub fn code(self) -> i8 {
        match self {
            Alarm::SoftReset => -2,
            Alarm::EmergencyStop => -1,
            Alarm::HardLimit => 1,
            Alarm::SoftLimit => 2,
            Alarm::AbortCycle => 3,
            Alarm::ProbeFailInitial => 4,
            Alarm::ProbeFailContact => 5,
            Alarm::HomingFailReset => 6,
            Alarm::HomingFailDoor => 7,
            Alarm::HomingFailPulloff => 8,
            Alarm::HomingFailApproach => 9,
            Alarm::HomingFailDualApproach => 10,
            Alarm::HomingFailLimitActive => 11,
            Alarm::HardLimitNoMotion => 13,
        }
    }

    pub fn from_code(code: i8) -> Option<Alarm> {
        ALL_ALARMS.iter().copied().find(|a| a.code() == code)
    }

    /// Alarms below the probe range stop the steppers and wait for the
    /// physical fault inputs to clear before the controller may reset.
    pub fn is_critical(self) -> bool {
        self.code() < Alarm::ProbeFailInitial.code()
    }
}

const ALL_ALARMS: [Alarm; 14] = [
    Alarm::SoftReset,
    Alarm::EmergencyStop,
    Alarm::HardLimit,
    Alarm::SoftLimit,
    Alarm::AbortCycle,
    Alarm::ProbeFailInitial,
    Alarm::ProbeFailContact,
    Alarm::HomingFailReset,
    Alarm::HomingFailDoor,
    Alarm::HomingFailPulloff,
    Alarm::HomingFailApproach,
    Alarm::HomingFailDualApproach,
    Alarm::HomingFailLimitActive,
    Alarm::HardLimitNoMotion,
];

pub type CncResult<T = ()> = Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_through_wire_value() {
        for s in ALL_STATUS {
            assert_eq!(Status::from_code(s.code()), Some(s));
        }
        assert_eq!(Status::FeedNotSet.code(), 41);
        assert_eq!(Status::ModalGroupViolation.code(), 21);
        assert_eq!(Status::from_code(6), None);
    }

    #[test]
    fn alarm_criticality_follows_code_order() {
        assert!(Alarm::HardLimit.is_critical());
        assert!(Alarm::EmergencyStop.is_critical());
        assert!(Alarm::AbortCycle.is_critical());
        assert!(!Alarm::ProbeFailContact.is_critical());
        assert!(!Alarm::HomingFailApproach.is_critical());
        assert_eq!(Alarm::from_code(-2), Some(Alarm::SoftReset));
    }

    #[test]
    fn status_displays_readable_message() {
        assert_eq!(Status::ArcRadiusError.to_string(), "arc radius error");
        assert_eq!(Alarm::AbortCycle.to_string(), "abort during cycle");
    }
}
