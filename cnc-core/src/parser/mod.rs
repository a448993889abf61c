//! RS274/NGC G-code interpreter with Grbl `$` system commands.
//!
//! A line goes through three stages. [`parse_block`] reads words into a
//! copy of the modal state, [`ParsedBlock::validate`] checks the block as
//! a whole, and the controller executes it (see `execute.rs`). Nothing in
//! the persistent parser state changes unless all three succeed.

mod execute;
mod system;
mod tokenizer;
mod validate;

pub use tokenizer::{Tokenizer, Word};

use bitflags::bitflags;

use crate::cnc::Cnc;
use crate::config::{AXIS_COUNT, COORD_SYS_COUNT, RX_BUFFER_SIZE};
use crate::error::{CncResult, Status};
use crate::flags::{Coolant, ExecState};
use crate::hal::Board;
use crate::kinematics::AxisVec;
use crate::motion::ProbeMode;
use crate::settings;

// ── Modal groups ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Seek,
    Linear,
    CwArc,
    CcwArc,
    Probe(ProbeMode),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Plane {
    #[default]
    XY,
    ZX,
    YZ,
}

impl Plane {
    /// The two in-plane axes, ordered so that a clockwise arc turns from
    /// the first toward the negative second axis.
    pub fn axes(self) -> (usize, usize) {
        match self {
            Plane::XY => (0, 1),
            Plane::ZX => (2, 0),
            Plane::YZ => (1, 2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedMode {
    InverseTime,
    #[default]
    UnitsPerMinute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    Inches,
    #[default]
    Millimeters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolLengthMode {
    #[default]
    Cancel,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    ExactPath,
    ExactStop,
    #[default]
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Running,
    Paused,
    OptionalStop,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleState {
    #[default]
    Off,
    Cw,
    Ccw,
}

/// Group 0 codes. They act on the line they appear in only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonModal {
    #[default]
    None,
    Dwell,
    SetParams,
    Home28,
    SetHome28,
    Home30,
    SetHome30,
    AbsoluteOverride,
    SetOffset,
    ResetOffset,
    SuspendOffset,
    RestoreOffset,
}

impl NonModal {
    /// Codes that take the line's axis words for themselves.
    pub fn uses_axis_words(self) -> bool {
        matches!(self, NonModal::SetParams | NonModal::Home28 | NonModal::Home30 | NonModal::SetOffset)
    }
}

/// The modal state of the interpreter, plus the last programmed feed,
/// spindle speed and tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalState {
    pub motion: MotionMode,
    pub plane: Plane,
    pub distance: DistanceMode,
    pub feed_mode: FeedMode,
    pub units: Units,
    pub tool_length: ToolLengthMode,
    /// 0 is G54.
    pub coord_system: usize,
    pub path: PathMode,
    pub program_flow: ProgramFlow,
    pub spindle: SpindleState,
    pub coolant: Coolant,
    pub overrides_enabled: bool,
    /// mm/min.
    pub feed: f64,
    pub spindle_speed: f64,
    pub tool: u8,
}

impl Default for ModalState {
    fn default() -> Self {
        ModalState {
            motion: MotionMode::default(),
            plane: Plane::default(),
            distance: DistanceMode::default(),
            feed_mode: FeedMode::default(),
            units: Units::default(),
            tool_length: ToolLengthMode::default(),
            coord_system: 0,
            path: PathMode::default(),
            program_flow: ProgramFlow::default(),
            spindle: SpindleState::default(),
            coolant: Coolant::empty(),
            overrides_enabled: true,
            feed: 0.0,
            spindle_speed: 0.0,
            tool: 0,
        }
    }
}

fn fmt_number(value: f64) -> String {
    if value.fract() == 0.0 { format!("{}", value as i64) } else { crate::protocol::fmt_float(value) }
}

impl ModalState {
    /// Signed spindle speed for the planner, negative when counter-clockwise.
    pub fn signed_spindle(&self) -> f64 {
        match self.spindle {
            SpindleState::Off => 0.0,
            SpindleState::Cw => self.spindle_speed,
            SpindleState::Ccw => -self.spindle_speed,
        }
    }

    /// Active codes in `$G` order.
    pub fn describe(&self) -> String {
        let mut codes: Vec<String> = Vec::new();
        let motion = match self.motion {
            MotionMode::Seek => "G0",
            MotionMode::Linear => "G1",
            MotionMode::CwArc => "G2",
            MotionMode::CcwArc => "G3",
            MotionMode::Probe(ProbeMode { away: false, no_error: false }) => "G38.2",
            MotionMode::Probe(ProbeMode { away: false, no_error: true }) => "G38.3",
            MotionMode::Probe(ProbeMode { away: true, no_error: false }) => "G38.4",
            MotionMode::Probe(ProbeMode { away: true, no_error: true }) => "G38.5",
            MotionMode::Cancel => "G80",
        };
        codes.push(motion.to_string());
        codes.push(
            match self.plane {
                Plane::XY => "G17",
                Plane::ZX => "G18",
                Plane::YZ => "G19",
            }
            .to_string(),
        );
        codes.push(if self.distance == DistanceMode::Absolute { "G90" } else { "G91" }.to_string());
        codes.push(if self.feed_mode == FeedMode::InverseTime { "G93" } else { "G94" }.to_string());
        codes.push(if self.units == Units::Inches { "G20" } else { "G21" }.to_string());
        codes.push(if self.tool_length == ToolLengthMode::Dynamic { "G43.1" } else { "G49" }.to_string());
        codes.push(if self.coord_system < 6 {
            format!("G{}", 54 + self.coord_system)
        } else {
            format!("G59.{}", self.coord_system - 5)
        });
        codes.push(
            match self.path {
                PathMode::ExactPath => "G61",
                PathMode::ExactStop => "G61.1",
                PathMode::Continuous => "G64",
            }
            .to_string(),
        );
        match self.program_flow {
            ProgramFlow::Paused => codes.push("M0".to_string()),
            ProgramFlow::OptionalStop => codes.push("M1".to_string()),
            ProgramFlow::End => codes.push("M2".to_string()),
            ProgramFlow::Running => {}
        }
        codes.push(
            match self.spindle {
                SpindleState::Cw => "M3",
                SpindleState::Ccw => "M4",
                SpindleState::Off => "M5",
            }
            .to_string(),
        );
        let flood = self.coolant.contains(Coolant::FLOOD);
        let mist = self.coolant.contains(Coolant::MIST);
        codes.push(
            match (mist, flood) {
                (false, false) => "M9",
                (true, false) => "M7",
                (false, true) => "M8",
                (true, true) => "M7 M8",
            }
            .to_string(),
        );
        codes.push(if self.overrides_enabled { "M48" } else { "M49" }.to_string());
        codes.push(format!("T{}", self.tool));
        codes.push(format!("F{}", fmt_number(self.feed)));
        codes.push(format!("S{}", fmt_number(self.spindle_speed)));
        codes.join(" ")
    }
}

// ── Words and groups of one line ──────────────────────────────────────

bitflags! {
    /// Modal groups touched by the current line.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct GroupMask: u16 {
        const NONMODAL = 1 << 0;
        const MOTION = 1 << 1;
        const PLANE = 1 << 2;
        const DISTANCE = 1 << 3;
        const FEED_MODE = 1 << 4;
        const UNITS = 1 << 5;
        const CUTTER_RADIUS = 1 << 6;
        const TOOL_LENGTH = 1 << 7;
        const COORD_SYS = 1 << 8;
        const PATH = 1 << 9;
        const STOPPING = 1 << 10;
        const TOOL_CHANGE = 1 << 11;
        const SPINDLE = 1 << 12;
        const COOLANT = 1 << 13;
        const OVERRIDE = 1 << 14;
    }
}

bitflags! {
    /// Value words present on the current line.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct WordMask: u16 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
        const I = 1 << 3;
        const J = 1 << 4;
        const K = 1 << 5;
        const F = 1 << 6;
        const L = 1 << 7;
        const P = 1 << 8;
        const R = 1 << 9;
        const S = 1 << 10;
        const T = 1 << 11;
        const N = 1 << 12;
    }
}

impl WordMask {
    pub const AXES: WordMask = Self::X.union(Self::Y).union(Self::Z);
    pub const IJK: WordMask = Self::I.union(Self::J).union(Self::K);

    pub fn axis(index: usize) -> WordMask {
        WordMask::from_bits_retain(1 << index)
    }

    pub fn offset(index: usize) -> WordMask {
        WordMask::from_bits_retain(Self::I.bits() << index)
    }
}

/// Values of the words present on the line, in program units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParserWords {
    pub axis: AxisVec,
    pub ijk: [f64; 3],
    pub f: f64,
    pub l: u8,
    pub p: f64,
    pub r: f64,
    pub s: f64,
    pub t: u8,
    pub n: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParserCmd {
    pub groups: GroupMask,
    pub words: WordMask,
    pub nonmodal: NonModal,
    /// A motion code or an axis-using non-modal code claimed the axis words.
    pub axis_claimed: bool,
}

/// A parsed line: the modal state it would leave behind, its words and
/// which groups it touched.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBlock {
    pub state: ModalState,
    pub words: ParserWords,
    pub cmd: ParserCmd,
    pub message: Option<String>,
}

impl ParsedBlock {
    /// True when a motion command uses the line's axis words.
    pub fn moves(&self) -> bool {
        if self.cmd.nonmodal.uses_axis_words() {
            return false;
        }
        self.cmd.groups.contains(GroupMask::MOTION) || self.cmd.words.intersects(WordMask::AXES)
    }
}

fn enter_group(cmd: &mut ParserCmd, group: GroupMask) -> CncResult {
    if cmd.groups.contains(group) {
        return Err(Status::ModalGroupViolation);
    }
    cmd.groups.insert(group);
    Ok(())
}

fn claim_axes(cmd: &mut ParserCmd) -> CncResult {
    if cmd.axis_claimed {
        return Err(Status::AxisCommandConflict);
    }
    cmd.axis_claimed = true;
    Ok(())
}

fn gcode(word: &Word, state: &mut ModalState, cmd: &mut ParserCmd) -> CncResult {
    let code = word.code();
    let mantissa = word.mantissa();
    if mantissa != 0 && !matches!(code, 28 | 30 | 38 | 43 | 59 | 61 | 92) {
        return Err(Status::ValueNotInteger);
    }

    let nonmodal = match (code, mantissa) {
        (4, 0) => Some(NonModal::Dwell),
        (10, 0) => Some(NonModal::SetParams),
        (28, 0) => Some(NonModal::Home28),
        (28, 10) => Some(NonModal::SetHome28),
        (30, 0) => Some(NonModal::Home30),
        (30, 10) => Some(NonModal::SetHome30),
        (53, 0) => Some(NonModal::AbsoluteOverride),
        (92, 0) => Some(NonModal::SetOffset),
        (92, 10) => Some(NonModal::ResetOffset),
        (92, 20) => Some(NonModal::SuspendOffset),
        (92, 30) => Some(NonModal::RestoreOffset),
        _ => None,
    };
    if let Some(nonmodal) = nonmodal {
        enter_group(cmd, GroupMask::NONMODAL)?;
        if matches!(code, 10 | 28 | 30 | 92) {
            claim_axes(cmd)?;
        }
        cmd.nonmodal = nonmodal;
        return Ok(());
    }

    match code {
        0..=3 | 38 | 80 => {
            enter_group(cmd, GroupMask::MOTION)?;
            state.motion = match (code, mantissa) {
                (0, _) => MotionMode::Seek,
                (1, _) => MotionMode::Linear,
                (2, _) => MotionMode::CwArc,
                (3, _) => MotionMode::CcwArc,
                (80, _) => MotionMode::Cancel,
                (38, 20) => MotionMode::Probe(ProbeMode { away: false, no_error: false }),
                (38, 30) => MotionMode::Probe(ProbeMode { away: false, no_error: true }),
                (38, 40) => MotionMode::Probe(ProbeMode { away: true, no_error: false }),
                (38, 50) => MotionMode::Probe(ProbeMode { away: true, no_error: true }),
                _ => return Err(Status::UnsupportedCommand),
            };
            if code != 80 {
                claim_axes(cmd)?;
            }
        }
        17..=19 => {
            enter_group(cmd, GroupMask::PLANE)?;
            state.plane = match code {
                17 => Plane::XY,
                18 => Plane::ZX,
                _ => Plane::YZ,
            };
        }
        90 | 91 => {
            enter_group(cmd, GroupMask::DISTANCE)?;
            state.distance = if code == 90 { DistanceMode::Absolute } else { DistanceMode::Incremental };
        }
        93 | 94 => {
            enter_group(cmd, GroupMask::FEED_MODE)?;
            state.feed_mode = if code == 93 { FeedMode::InverseTime } else { FeedMode::UnitsPerMinute };
        }
        20 | 21 => {
            enter_group(cmd, GroupMask::UNITS)?;
            state.units = if code == 20 { Units::Inches } else { Units::Millimeters };
        }
        40 => enter_group(cmd, GroupMask::CUTTER_RADIUS)?,
        43 | 49 => {
            enter_group(cmd, GroupMask::TOOL_LENGTH)?;
            state.tool_length = match (code, mantissa) {
                (49, _) => ToolLengthMode::Cancel,
                (43, 10) => ToolLengthMode::Dynamic,
                _ => return Err(Status::UnsupportedCommand),
            };
        }
        54..=59 => {
            enter_group(cmd, GroupMask::COORD_SYS)?;
            let index = (code - 54) as usize + (mantissa / 10) as usize;
            if index >= COORD_SYS_COUNT {
                return Err(Status::UnsupportedCoordSys);
            }
            state.coord_system = index;
        }
        61 | 64 => {
            enter_group(cmd, GroupMask::PATH)?;
            state.path = match (code, mantissa) {
                (61, 0) => PathMode::ExactPath,
                (61, 10) => PathMode::ExactStop,
                (64, _) => PathMode::Continuous,
                _ => return Err(Status::UnsupportedCommand),
            };
        }
        _ => return Err(Status::UnsupportedCommand),
    }
    Ok(())
}

fn mcode(word: &Word, state: &mut ModalState, cmd: &mut ParserCmd) -> CncResult {
    if word.mantissa() != 0 {
        return Err(Status::UnsupportedCommand);
    }
    match word.code() {
        code @ (0 | 1 | 2 | 30 | 60) => {
            enter_group(cmd, GroupMask::STOPPING)?;
            state.program_flow = match code {
                0 | 60 => ProgramFlow::Paused,
                1 => ProgramFlow::OptionalStop,
                _ => ProgramFlow::End,
            };
        }
        code @ 3..=5 => {
            enter_group(cmd, GroupMask::SPINDLE)?;
            state.spindle = match code {
                3 => SpindleState::Cw,
                4 => SpindleState::Ccw,
                _ => SpindleState::Off,
            };
        }
        6 => enter_group(cmd, GroupMask::TOOL_CHANGE)?,
        // Mist and flood may share a line.
        7 => {
            cmd.groups.insert(GroupMask::COOLANT);
            state.coolant.insert(Coolant::MIST);
        }
        8 => {
            cmd.groups.insert(GroupMask::COOLANT);
            state.coolant.insert(Coolant::FLOOD);
        }
        9 => {
            cmd.groups.insert(GroupMask::COOLANT);
            state.coolant = Coolant::empty();
        }
        code @ (48 | 49) => {
            enter_group(cmd, GroupMask::OVERRIDE)?;
            state.overrides_enabled = code == 48;
        }
        _ => return Err(Status::UnsupportedCommand),
    }
    Ok(())
}

fn value_word(word: &Word, words: &mut ParserWords, cmd: &mut ParserCmd) -> CncResult {
    let (mask, negative_ok) = match word.letter {
        b'X' => (WordMask::X, true),
        b'Y' => (WordMask::Y, true),
        b'Z' => (WordMask::Z, true),
        b'I' => (WordMask::I, true),
        b'J' => (WordMask::J, true),
        b'K' => (WordMask::K, true),
        b'F' => (WordMask::F, false),
        b'R' => (WordMask::R, true),
        b'L' => (WordMask::L, false),
        b'P' => (WordMask::P, false),
        b'S' => (WordMask::S, false),
        b'T' => (WordMask::T, false),
        _ => return Err(Status::UnusedWords),
    };
    if cmd.words.contains(mask) {
        return Err(Status::WordRepeated);
    }
    if !negative_ok && word.value < 0.0 {
        return Err(Status::NegativeValue);
    }
    if matches!(word.letter, b'L' | b'T') && word.value.fract() != 0.0 {
        return Err(Status::ValueNotInteger);
    }
    if matches!(word.letter, b'L' | b'T') && word.value > u8::MAX as f64 {
        return Err(Status::MaxValueExceeded);
    }
    cmd.words.insert(mask);

    let v = word.value;
    match word.letter {
        b'X' => words.axis[0] = v,
        b'Y' => words.axis[1] = v,
        b'Z' => words.axis[2] = v,
        b'I' => words.ijk[0] = v,
        b'J' => words.ijk[1] = v,
        b'K' => words.ijk[2] = v,
        b'F' => words.f = v,
        b'R' => words.r = v,
        b'L' => words.l = v as u8,
        b'P' => words.p = v,
        b'S' => words.s = v,
        _ => words.t = v as u8,
    }
    Ok(())
}

/// Reads a G-code line on top of `modal`. Fails on the first malformed
/// or conflicting word.
pub fn parse_block(line: &str, modal: &ModalState) -> CncResult<ParsedBlock> {
    if line.len() >= RX_BUFFER_SIZE {
        return Err(Status::Overflow);
    }
    let mut tokens = Tokenizer::new(line);
    let mut block = ParsedBlock {
        state: modal.clone(),
        words: ParserWords::default(),
        cmd: ParserCmd::default(),
        message: None,
    };
    let mut word_count = 0;

    while let Some(word) = tokens.next_word()? {
        match word.letter {
            b'G' | b'M' if word.value < 0.0 => return Err(Status::InvalidStatement),
            b'G' => gcode(&word, &mut block.state, &mut block.cmd)?,
            b'M' => mcode(&word, &mut block.state, &mut block.cmd)?,
            b'N' => {
                if word_count != 0 || word.value < 0.0 || word.value.fract() != 0.0 {
                    return Err(Status::InvalidLineNumber);
                }
                block.cmd.words.insert(WordMask::N);
                block.words.n = word.value as u32;
            }
            _ => value_word(&word, &mut block.words, &mut block.cmd)?,
        }
        word_count += 1;
    }
    block.message = tokens.take_message();
    Ok(block)
}

// ── Persistent parser state ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ParserState {
    pub modal: ModalState,
    /// Offset of the active G54..G59 system.
    pub coord_offset: AxisVec,
    pub g92_offset: AxisVec,
    /// G92 offset kept for G92.3.
    pub g92_saved: AxisVec,
    pub tool_length_offset: f64,
    pub last_probe_position: AxisVec,
    pub last_probe_ok: bool,
    /// Status reports left until the next `WCO:` field; 0 forces one.
    pub wco_counter: u8,
}

impl ParserState {
    /// Machine position minus this is the work position.
    pub fn work_offset(&self) -> AxisVec {
        let mut offset = [0.0; AXIS_COUNT];
        for (i, o) in offset.iter_mut().enumerate() {
            *o = self.coord_offset[i] + self.g92_offset[i];
        }
        offset[crate::config::AXIS_Z] += self.tool_length_offset;
        offset
    }
}

impl<B: Board> Cnc<B> {
    /// Restores the modal groups to their power-on codes. Feed, speed and
    /// tool survive, the G92 offset does not.
    pub(crate) fn parser_reset(&mut self) {
        let modal = &mut self.parser.modal;
        *modal = ModalState {
            feed: modal.feed,
            spindle_speed: modal.spindle_speed,
            tool: modal.tool,
            ..ModalState::default()
        };
        self.parser.g92_offset = [0.0; AXIS_COUNT];
        self.parser.tool_length_offset = 0.0;
        self.parser.coord_offset = settings::load_params(&self.board, 0).unwrap_or_default();
        self.parser.wco_counter = 0;
    }

    /// Full parser restart after a controller reset.
    pub(crate) fn parser_init(&mut self) {
        self.parser = ParserState::default();
        self.parser_reset();
    }

    /// Runs one command line, G-code or `$` command.
    pub fn execute_line(&mut self, line: &str) -> CncResult {
        let trimmed = line.trim_start();
        if let Some(command) = trimmed.strip_prefix('$') {
            return self.system_command(command);
        }
        if self.exec.intersects(!(ExecState::RUN | ExecState::HOLD | ExecState::RESUMING)) || self.has_alarm() {
            return Err(Status::SystemGcLock);
        }
        self.gcode_line(line, false)
    }

    /// Parses, validates and executes a G-code line.
    pub(crate) fn gcode_line(&mut self, line: &str, jog: bool) -> CncResult {
        let mut block = parse_block(line, &self.parser.modal)?;
        block.validate(jog)?;
        self.exec_block(block, jog)
    }

    /// Takes the next line off the command source and runs it.
    pub(crate) fn parser_read_command(&mut self) -> CncResult {
        let mut line = Vec::new();
        let mut overflow = false;
        while let Some(c) = self.board.get() {
            if c == b'\n' {
                break;
            }
            if line.len() < RX_BUFFER_SIZE {
                line.push(c);
            } else {
                overflow = true;
            }
        }
        if overflow {
            return Err(Status::Overflow);
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        self.execute_line(&text)
    }
}
