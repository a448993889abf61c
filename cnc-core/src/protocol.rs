//! Grbl 1.1 compatible response protocol.
//!
//! Everything operator-visible leaves the controller through a
//! [`ReportSink`]. The functions here only format; they never touch
//! machine state.

use crate::cnc::Cnc;
use crate::config::{AXIS_COUNT, COORD_SYS_COUNT, GRBL_VERSION, MM_INCH_MULT, STATUS_WCO_REPORT_MIN_FREQUENCY};
use crate::error::{Alarm, Status};
use crate::flags::{ControlInputs, Coolant, ExecState, LimitInputs};
use crate::hal::Board;
use crate::kinematics::AxisVec;
use crate::settings::{self, G28_SLOT, G30_SLOT};

/// Receives the response stream, one complete line per call (without the
/// line terminator).
pub trait ReportSink {
    fn write_str(&mut self, s: &str);
}

/// `[MSG:...]` feedback texts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    ResetToContinue,
    Unlock,
    Unlocked,
    Enabled,
    Disabled,
    CheckDoor,
    CheckLimits,
    ProgramEnd,
    RestoringDefaults,
    CheckEmergencyStop,
}

impl Feedback {
    pub fn text(self) -> &'static str {
        match self {
            Feedback::ResetToContinue => "Reset to continue",
            Feedback::Unlock => "'$H'|'$X' to unlock",
            Feedback::Unlocked => "Caution: Unlocked",
            Feedback::Enabled => "Enabled",
            Feedback::Disabled => "Disabled",
            Feedback::CheckDoor => "Check Door",
            Feedback::CheckLimits => "Check Limits",
            Feedback::ProgramEnd => "Pgm End",
            Feedback::RestoringDefaults => "Restoring defaults",
            Feedback::CheckEmergencyStop => "Check Emergency stop",
        }
    }
}

pub const HELP_MESSAGE: &str = "[HLP:$$ $# $G $N $x=val $Nx=line $J=line $C $X $H ~ ! ? ctrl-x]";

pub fn banner() -> String {
    format!("Grbl {} ['$' for help]", GRBL_VERSION)
}

pub fn fmt_float(value: f64) -> String {
    // Avoids printing "-0.000".
    let v = if value.abs() < 0.0005 { 0.0 } else { value };
    format!("{:.3}", v)
}

pub fn fmt_axes(values: &[f64]) -> String {
    values.iter().map(|v| fmt_float(*v)).collect::<Vec<_>>().join(",")
}

pub fn send_ok(sink: &mut dyn ReportSink) {
    sink.write_str("ok");
}

pub fn send_error(sink: &mut dyn ReportSink, status: Status) {
    sink.write_str(&format!("error:{}", status.code()));
}

pub fn send_alarm(sink: &mut dyn ReportSink, alarm: Alarm) {
    sink.write_str(&format!("ALARM:{}", alarm.code()));
}

pub fn send_feedback(sink: &mut dyn ReportSink, feedback: Feedback) {
    send_message(sink, feedback.text());
}

pub fn send_message(sink: &mut dyn ReportSink, text: &str) {
    sink.write_str(&format!("[MSG:{}]", text));
}

/// Report name of the exec state. The most significant active bit wins.
pub fn state_name(exec: ExecState, controls: ControlInputs, checkmode: bool, alarmed: bool) -> String {
    if alarmed {
        return "Alarm".to_string();
    }
    if checkmode {
        return "Check".to_string();
    }
    let active = exec.intersection(ExecState::ALL_ACTIVE).bits();
    let top = if active == 0 { 0 } else { 1u16 << (15 - active.leading_zeros()) };
    let run = exec.contains(ExecState::RUN);
    match ExecState::from_bits_retain(top) {
        ExecState::KILL => "Alarm".to_string(),
        ExecState::DOOR => {
            let n = match (controls.contains(ControlInputs::SAFETY_DOOR), run) {
                (true, true) => 2,
                (true, false) => 1,
                (false, true) => 3,
                (false, false) => 0,
            };
            format!("Door:{}", n)
        }
        ExecState::LIMITS | ExecState::UNHOMED => {
            if exec.contains(ExecState::HOMING) { "Home".to_string() } else { "Alarm".to_string() }
        }
        ExecState::HOLD => format!("Hold:{}", if run { 1 } else { 0 }),
        ExecState::HOMING => "Home".to_string(),
        ExecState::JOG => "Jog".to_string(),
        ExecState::RUN => "Run".to_string(),
        _ => "Idle".to_string(),
    }
}

pub fn pin_letters(controls: ControlInputs, limits: LimitInputs, probe: bool) -> String {
    let mut pins = String::new();
    if controls.contains(ControlInputs::ESTOP) {
        pins.push('R');
    }
    if controls.contains(ControlInputs::SAFETY_DOOR) {
        pins.push('D');
    }
    if controls.contains(ControlInputs::FHOLD) {
        pins.push('H');
    }
    if probe {
        pins.push('P');
    }
    for (i, letter) in crate::config::AXIS_LETTERS.iter().enumerate() {
        if limits.contains(LimitInputs::axis(i)) {
            pins.push(*letter);
        }
    }
    pins
}

// ── Controller reports ────────────────────────────────────────────────

impl<B: Board> Cnc<B> {
    pub(crate) fn send_ok(&mut self) {
        send_ok(&mut self.board);
    }

    pub(crate) fn send_error(&mut self, status: Status) {
        send_error(&mut self.board, status);
    }

    pub(crate) fn send_feedback(&mut self, feedback: Feedback) {
        send_feedback(&mut self.board, feedback);
    }

    pub(crate) fn send_line(&mut self, line: &str) {
        self.board.write_str(line);
    }

    fn to_report_units(&self, mut axis: AxisVec) -> AxisVec {
        if self.settings.report_inches {
            for v in axis.iter_mut() {
                *v *= MM_INCH_MULT;
            }
        }
        axis
    }

    /// `<Idle|MPos:0.000,0.000,0.000|FS:0,0|...>`
    pub fn send_status(&mut self) {
        let controls = self.read_controls();
        let limits = self.read_limits();
        let probe = self.read_probe();
        let state = state_name(self.exec, controls, self.mc.checkmode, self.alarm.is_some());

        let mut machine = self.rt_machine_position();
        let mut line = format!("<{}", state);
        if self.settings.status_report_mask & 1 != 0 {
            machine = self.to_report_units(machine);
            line.push_str(&format!("|MPos:{}", fmt_axes(&machine)));
        } else {
            let wco = self.parser.work_offset();
            let mut work = machine;
            for i in 0..AXIS_COUNT {
                work[i] -= wco[i];
            }
            work = self.to_report_units(work);
            line.push_str(&format!("|WPos:{}", fmt_axes(&work)));
        }

        let mut feed = self.rt_feed();
        if self.settings.report_inches {
            feed *= MM_INCH_MULT;
        }
        line.push_str(&format!("|FS:{},{}", feed.round() as i64, self.tool.speed.abs().round() as i64));
        line.push_str(&format!("|Ln:{}", self.stepper.line()));

        let pins = pin_letters(controls, limits, probe);
        if !pins.is_empty() {
            line.push_str(&format!("|Pn:{}", pins));
        }

        if self.settings.status_report_mask & 2 != 0 {
            line.push_str(&format!("|Buf:{},{}", self.planner.free(), self.board.free_bytes()));
        }

        if self.parser.wco_counter == 0 {
            self.parser.wco_counter = STATUS_WCO_REPORT_MIN_FREQUENCY;
            let wco = self.to_report_units(self.parser.work_offset());
            line.push_str(&format!("|WCO:{}", fmt_axes(&wco)));
        } else {
            self.parser.wco_counter -= 1;
            if self.planner.take_override_report() {
                let ovr = self.planner.overrides();
                line.push_str(&format!("|Ov:{},{},{}", ovr.feed, ovr.rapid, ovr.spindle));
                let mut tools = String::new();
                if self.tool.speed > 0.0 {
                    tools.push('S');
                } else if self.tool.speed < 0.0 {
                    tools.push('C');
                }
                if self.tool.coolant.contains(Coolant::FLOOD) {
                    tools.push('F');
                }
                if self.tool.coolant.contains(Coolant::MIST) {
                    tools.push('M');
                }
                if !tools.is_empty() {
                    line.push_str(&format!("|A:{}", tools));
                }
            }
        }

        line.push('>');
        self.board.write_str(&line);
    }

    /// `$#`
    pub fn send_coordinates(&mut self) {
        for i in 0..COORD_SYS_COUNT {
            let offsets = settings::load_params(&self.board, i).unwrap_or_default();
            let line = format!("[G{}:{}]", 54 + i, fmt_axes(&self.to_report_units(offsets)));
            self.board.write_str(&line);
        }
        for (name, slot) in [("G28", G28_SLOT), ("G30", G30_SLOT)] {
            let pos = settings::load_params(&self.board, slot).unwrap_or_default();
            let line = format!("[{}:{}]", name, fmt_axes(&self.to_report_units(pos)));
            self.board.write_str(&line);
        }
        let g92 = self.to_report_units(self.parser.g92_offset);
        self.board.write_str(&format!("[G92:{}]", fmt_axes(&g92)));
        let mut tlo = self.parser.tool_length_offset;
        if self.settings.report_inches {
            tlo *= MM_INCH_MULT;
        }
        self.board.write_str(&format!("[TLO:{}]", fmt_float(tlo)));
        self.send_probe_result();
    }

    /// `[PRB:x,y,z:ok]` for the last probe cycle.
    pub fn send_probe_result(&mut self) {
        let prb = self.to_report_units(self.parser.last_probe_position);
        let ok = if self.parser.last_probe_ok { 1 } else { 0 };
        self.board.write_str(&format!("[PRB:{}:{}]", fmt_axes(&prb), ok));
    }

    /// `$G`
    pub fn send_modes(&mut self) {
        let line = format!("[GC:{}]", self.parser.modal.describe());
        self.board.write_str(&line);
    }

    /// `$$`
    pub fn send_settings(&mut self) {
        for (id, value) in self.settings.entries() {
            let text = if value.fract() == 0.0 { format!("${}={}", id, value as i64) } else { format!("${}={}", id, fmt_float(value)) };
            self.board.write_str(&text);
        }
    }

    /// `$N`
    pub fn send_startup_blocks(&mut self) {
        for i in 0..crate::config::STARTUP_BLOCKS_COUNT {
            let block = settings::load_startup_block(&self.board, i).unwrap_or_default();
            self.board.write_str(&format!("$N{}={}", i, block));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_exec_bit_names_the_state() {
        let none = ControlInputs::empty();
        assert_eq!(state_name(ExecState::empty(), none, false, false), "Idle");
        assert_eq!(state_name(ExecState::RUN, none, false, false), "Run");
        assert_eq!(state_name(ExecState::RUN | ExecState::HOLD, none, false, false), "Hold:1");
        assert_eq!(state_name(ExecState::HOLD, none, false, false), "Hold:0");
        assert_eq!(state_name(ExecState::RUN | ExecState::JOG, none, false, false), "Jog");
        assert_eq!(state_name(ExecState::HOMING | ExecState::LIMITS, none, false, false), "Home");
        assert_eq!(state_name(ExecState::HOLD | ExecState::DOOR, ControlInputs::SAFETY_DOOR, false, false), "Door:1");
        assert_eq!(state_name(ExecState::RUN | ExecState::DOOR, none, false, false), "Door:3");
        assert_eq!(state_name(ExecState::UNHOMED, none, false, false), "Alarm");
    }

    #[test]
    fn alarm_and_check_mode_override_exec_bits() {
        let none = ControlInputs::empty();
        assert_eq!(state_name(ExecState::RUN, none, true, false), "Check");
        assert_eq!(state_name(ExecState::RUN, none, true, true), "Alarm");
    }

    #[test]
    fn floats_print_three_decimals_without_negative_zero() {
        assert_eq!(fmt_float(1.23456), "1.235");
        assert_eq!(fmt_float(-0.0001), "0.000");
        assert_eq!(fmt_axes(&[1.0, -2.5, 0.0]), "1.000,-2.500,0.000");
    }

    #[test]
    fn pins_list_controls_then_probe_then_limits() {
        let pins = pin_letters(ControlInputs::ESTOP | ControlInputs::FHOLD, LimitInputs::X | LimitInputs::Z, true);
        assert_eq!(pins, "RHPXZ");
    }
}
