//! Typed bit sets for exec state, input masks and the real-time command
//! latches.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

bitflags! {
    /// Machine activity and safety bits owned by the controller.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExecState: u16 {
        const RUN = 1 << 0;
        const HOLD = 1 << 1;
        const JOG = 1 << 2;
        const HOMING = 1 << 3;
        const DOOR = 1 << 4;
        const UNHOMED = 1 << 5;
        const LIMITS = 1 << 6;
        const KILL = 1 << 7;
        const RESUMING = 1 << 8;
    }
}

impl ExecState {
    /// Latched hard stop. Shares its bit with the not-yet-homed condition.
    pub const HALT: ExecState = ExecState::UNHOMED;
    pub const ALARM: ExecState = Self::UNHOMED.union(Self::LIMITS).union(Self::KILL);
    pub const GCODE_LOCKED: ExecState =
        Self::ALARM.union(Self::DOOR).union(Self::HOMING).union(Self::JOG);
    pub const RESET_LOCKED: ExecState = Self::ALARM.union(Self::DOOR).union(Self::HOLD);
    pub const HOMING_HIT: ExecState = Self::HOMING.union(Self::LIMITS);
    pub const ALL_ACTIVE: ExecState = ExecState::from_bits_retain(0xFF);
}

bitflags! {
    /// Operator control inputs after the invert mask is applied.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ControlInputs: u8 {
        const ESTOP = 1 << 0;
        const SAFETY_DOOR = 1 << 1;
        const FHOLD = 1 << 2;
        const CS_RES = 1 << 3;
    }
}

bitflags! {
    /// One bit per axis limit switch, after the invert mask is applied.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LimitInputs: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
    }
}

impl LimitInputs {
    pub fn axis(index: usize) -> LimitInputs {
        LimitInputs::from_bits_retain(1 << index)
    }
}

bitflags! {
    /// Coolant outputs.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Coolant: u8 {
        const FLOOD = 1 << 0;
        const MIST = 1 << 1;
    }
}

bitflags! {
    /// Per-stepper bits used for step, direction and enable masks.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StepperMask: u8 {
        const ALL = 0xFF;
    }
}

impl StepperMask {
    pub fn stepper(index: usize) -> StepperMask {
        StepperMask::from_bits_retain(1 << index)
    }
}

bitflags! {
    /// Per-request motion options set by the parser.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MotionFlags: u8 {
        const INVERSE_FEED = 1 << 0;
        const CONTINUOUS = 1 << 1;
        const EXACT_STOP = 1 << 2;
    }
}

/// A command that occupies one bit of a real-time latch. `BITS` lists the
/// variants from the least to the most significant bit.
pub trait RtBit: Copy + 'static {
    const BITS: &'static [Self];
}

/// Latched real-time commands of one category. Set from the byte decoder,
/// drained once per loop iteration from the most significant bit down.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RtLatch<E: RtBit> {
    bits: u8,
    _cmd: PhantomData<E>,
}

impl<E: RtBit + PartialEq> RtLatch<E> {
    pub const fn new() -> Self {
        RtLatch { bits: 0, _cmd: PhantomData }
    }

    fn bit_of(cmd: E) -> u8 {
        E::BITS
            .iter()
            .position(|c| *c == cmd)
            .map(|i| 1u8 << i)
            .unwrap_or(0)
    }

    pub fn set(&mut self, cmd: E) {
        self.bits |= Self::bit_of(cmd);
    }

    pub fn remove(&mut self, cmd: E) {
        self.bits &= !Self::bit_of(cmd);
    }

    pub fn contains(&self, cmd: E) -> bool {
        self.bits & Self::bit_of(cmd) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    /// Clears the latch and returns its commands, most significant first.
    pub fn drain_msb_first(&mut self) -> impl Iterator<Item = E> + use<E> {
        let bits = std::mem::take(&mut self.bits);
        E::BITS
            .iter()
            .enumerate()
            .rev()
            .filter(move |(i, _)| bits & (1 << i) != 0)
            .map(|(_, c)| *c)
    }
}

impl<E: RtBit + PartialEq> Default for RtLatch<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtCommand {
    Reset,
    CycleStart,
    Report,
}

impl RtBit for RtCommand {
    const BITS: &'static [Self] = &[RtCommand::Reset, RtCommand::CycleStart, RtCommand::Report];
}

/// Feed and rapid override requests. Bit order follows the 0x90..0x97
/// control bytes so a byte maps to `BITS[byte - 0x90]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOverrideCmd {
    FeedReset,
    FeedIncCoarse,
    FeedDecCoarse,
    FeedIncFine,
    FeedDecFine,
    RapidReset,
    RapidMedium,
    RapidLow,
}

impl RtBit for FeedOverrideCmd {
    const BITS: &'static [Self] = &[
        FeedOverrideCmd::FeedReset,
        FeedOverrideCmd::FeedIncCoarse,
        FeedOverrideCmd::FeedDecCoarse,
        FeedOverrideCmd::FeedIncFine,
        FeedOverrideCmd::FeedDecFine,
        FeedOverrideCmd::RapidReset,
        FeedOverrideCmd::RapidMedium,
        FeedOverrideCmd::RapidLow,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOverrideCmd {
    SpindleReset,
    SpindleIncCoarse,
    SpindleDecCoarse,
    SpindleIncFine,
    SpindleDecFine,
    SpindleToggle,
    CoolantFloodToggle,
    CoolantMistToggle,
}

impl RtBit for ToolOverrideCmd {
    const BITS: &'static [Self] = &[
        ToolOverrideCmd::SpindleReset,
        ToolOverrideCmd::SpindleIncCoarse,
        ToolOverrideCmd::SpindleDecCoarse,
        ToolOverrideCmd::SpindleIncFine,
        ToolOverrideCmd::SpindleDecFine,
        ToolOverrideCmd::SpindleToggle,
        ToolOverrideCmd::CoolantFloodToggle,
        ToolOverrideCmd::CoolantMistToggle,
    ];
}
