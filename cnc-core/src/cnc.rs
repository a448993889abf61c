//! The controller: owns every subsystem and runs the cooperative main
//! loop.
//!
//! Nothing here blocks on its own. Waiting (queue full, dwell, homing)
//! is a loop around [`Cnc::dotasks`], which services the board, decodes
//! real-time commands, checks the safety interlocks and feeds the step
//! generator.

use crate::config::{FEED_OVR_COARSE, FEED_OVR_FINE, RAPID_FEED_OVR1, RAPID_FEED_OVR2, SPINDLE_OVR_COARSE, SPINDLE_OVR_FINE, STARTUP_BLOCKS_COUNT};
use crate::error::Alarm;
use crate::flags::{
    ControlInputs, Coolant, ExecState, FeedOverrideCmd, LimitInputs, RtBit, RtCommand, RtLatch, StepperMask,
    ToolOverrideCmd,
};
use crate::hal::Board;
use crate::interpolator::{Interpolator, StepGenerator, segment_queue};
use crate::kinematics::{Cartesian, Kinematics, StepVec};
use crate::motion::{MotionState, ToolOutput};
use crate::parser::ParserState;
use crate::planner::{CapacityError, Planner};
use crate::protocol::{Feedback, banner, send_alarm};
use crate::settings::{self, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    StartupReset,
    FirstRun,
    Running,
    /// Waiting for a reset after a critical alarm.
    ErrorReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockResult {
    Ok,
    /// An alarm still holds the lock; `$X` or `$H` may clear it.
    Locked,
    /// Killed; only a reset helps.
    Error,
}

/// Input latches and probe capture, written by the input callbacks.
#[derive(Debug, Clone, Default)]
pub struct IoState {
    pub limits: LimitInputs,
    pub controls: ControlInputs,
    /// Limit bits read inverted, used while pulling off a homing switch.
    pub homing_invert: LimitInputs,
    pub probe_enabled: bool,
    pub probe_away: bool,
    pub probe_hit: bool,
    pub probe_position: StepVec,
}

pub struct Cnc<B: Board> {
    pub board: B,
    pub settings: Settings,
    pub(crate) kinematics: Box<dyn Kinematics>,
    pub exec: ExecState,
    pub loop_state: LoopState,
    pub alarm: Option<Alarm>,
    pub(crate) rt_cmd: RtLatch<RtCommand>,
    pub(crate) feed_ovr_cmd: RtLatch<FeedOverrideCmd>,
    pub(crate) tool_ovr_cmd: RtLatch<ToolOverrideCmd>,
    pub planner: Planner,
    pub(crate) itp: Interpolator,
    pub(crate) stepper: StepGenerator,
    pub parser: ParserState,
    pub(crate) mc: MotionState,
    pub(crate) io: IoState,
    pub tool: ToolOutput,
}

impl<B: Board> Cnc<B> {
    /// Builds a controller around `board`. Settings come from the board's
    /// store; an invalid record is replaced by the defaults.
    pub fn new(mut board: B) -> Result<Self, CapacityError> {
        let settings = match settings::load_settings(&board) {
            Ok(settings) => settings,
            Err(_) => {
                console_log!("settings record invalid, restoring defaults");
                let defaults = Settings::default();
                settings::save_settings(&mut board, &defaults);
                defaults
            }
        };
        let (itp, stepper) = segment_queue();
        Ok(Cnc {
            board,
            settings,
            kinematics: Box::new(Cartesian),
            exec: ExecState::ALARM | ExecState::HOLD,
            loop_state: LoopState::StartupReset,
            alarm: None,
            rt_cmd: RtLatch::new(),
            feed_ovr_cmd: RtLatch::new(),
            tool_ovr_cmd: RtLatch::new(),
            planner: Planner::new()?,
            itp,
            stepper,
            parser: ParserState::default(),
            mc: MotionState::default(),
            io: IoState::default(),
            tool: ToolOutput::default(),
        })
    }

    // ── Inputs ────────────────────────────────────────────────────────

    pub fn read_limits(&self) -> LimitInputs {
        let raw = self.board.read_limits().bits() ^ self.settings.limits_invert_mask;
        LimitInputs::from_bits_truncate(raw ^ self.io.homing_invert.bits())
    }

    pub fn read_controls(&self) -> ControlInputs {
        ControlInputs::from_bits_truncate(self.board.read_controls().bits() ^ self.settings.control_invert_mask)
    }

    pub fn read_probe(&self) -> bool {
        self.board.read_probe() != self.settings.probe_invert
    }

    // ── Exec state ────────────────────────────────────────────────────

    pub fn has_alarm(&self) -> bool {
        self.exec.intersects(ExecState::ALARM) || self.alarm.is_some()
    }

    pub(crate) fn set_exec_state(&mut self, state: ExecState) {
        self.exec.insert(state);
    }

    /// Clears exec bits, except those still held by a physical input or a
    /// pending alarm. Releasing a hold restores the tool outputs.
    pub(crate) fn clear_exec_state(&mut self, mut mask: ExecState) {
        let controls = self.read_controls();
        if controls.contains(ControlInputs::ESTOP) {
            mask.remove(ExecState::KILL);
        }
        if controls.contains(ControlInputs::SAFETY_DOOR) {
            mask.remove(ExecState::DOOR | ExecState::HOLD);
        }
        if controls.contains(ControlInputs::FHOLD) {
            mask.remove(ExecState::HOLD);
        }
        if self.alarm.is_some() {
            mask.remove(ExecState::HALT);
        }
        if self.settings.hard_limits_enabled && !self.read_limits().is_empty() {
            mask.remove(ExecState::HALT | ExecState::LIMITS);
        }
        if self.settings.homing_enabled {
            mask.remove(ExecState::HALT);
        }

        if mask.contains(ExecState::HOLD) && self.exec.contains(ExecState::HOLD) {
            self.exec.insert(ExecState::RESUMING);
            self.exec.remove(ExecState::HOLD);
            self.apply_tool_outputs();
            self.exec.remove(ExecState::RESUMING);
        }
        self.exec.remove(mask);
    }

    /// Latches an alarm and stops everything.
    pub(crate) fn alarm(&mut self, code: Alarm) {
        console_warn!("alarm {}: {}", code.code(), code);
        self.exec.insert(ExecState::KILL | ExecState::HALT);
        self.cnc_stop();
        self.alarm = Some(code);
    }

    /// Stops stepping and switches the tools off.
    pub(crate) fn cnc_stop(&mut self) {
        self.itp_stop();
        self.board.set_spindle(0.0, 0);
        self.board.set_coolant(Coolant::empty());
        self.tool = ToolOutput::default();
    }

    /// Turns safety conditions into alarms or stops. Returns false while
    /// motion must not be fed.
    pub(crate) fn check_interlocking(&mut self) -> bool {
        if self.exec.contains(ExecState::KILL) {
            let code = if self.read_controls().contains(ControlInputs::ESTOP) {
                Some(Alarm::EmergencyStop)
            } else if self.exec.contains(ExecState::HOMING) {
                Some(Alarm::HomingFailReset)
            } else if self.exec.contains(ExecState::RUN) {
                Some(Alarm::AbortCycle)
            } else {
                None
            };
            if let Some(code) = code.filter(|c| self.alarm != Some(*c)) {
                self.alarm(code);
            }
            return false;
        }

        if self.exec.contains(ExecState::DOOR | ExecState::HOMING) {
            self.alarm(Alarm::HomingFailDoor);
            return false;
        }

        if self.exec.contains(ExecState::HALT | ExecState::RUN) {
            if !self.exec.contains(ExecState::HOMING) && !self.read_limits().is_empty() {
                self.alarm(Alarm::HardLimit);
            } else {
                self.exec.remove(ExecState::RUN);
            }
            return false;
        }

        if self.exec.intersects(ExecState::DOOR | ExecState::HOLD) && !self.exec.contains(ExecState::RUN) {
            if self.exec.contains(ExecState::DOOR) {
                self.cnc_stop();
            } else {
                self.itp_stop();
            }
            if self.exec.intersects(ExecState::HOMING | ExecState::JOG) {
                self.itp_clear();
                self.planner.clear();
                self.mc_sync_position();
                self.exec.remove(ExecState::HOMING | ExecState::JOG | ExecState::HOLD);
            }
            return false;
        }
        true
    }

    // ── Real-time commands ────────────────────────────────────────────

    /// Decodes one real-time byte. Runs from the receive path, so it only
    /// sets bits.
    pub fn call_rt_command(&mut self, c: u8) {
        match c {
            0x18 => self.rt_cmd.set(RtCommand::Reset),
            b'!' => self.exec.insert(ExecState::HOLD),
            b'?' => self.rt_cmd.set(RtCommand::Report),
            b'~' => {
                if !self.exec.contains(ExecState::RESUMING) {
                    self.rt_cmd.set(RtCommand::CycleStart);
                }
            }
            0x84 => self.exec.insert(ExecState::HOLD | ExecState::DOOR),
            0x85 => {
                if self.exec.contains(ExecState::JOG | ExecState::RUN) {
                    self.exec.insert(ExecState::HOLD);
                }
            }
            0x90..=0x97 => {
                if let Some(cmd) = FeedOverrideCmd::BITS.get((c - 0x90) as usize) {
                    self.feed_ovr_cmd.set(*cmd);
                }
            }
            0x99..=0x9E => {
                if let Some(cmd) = ToolOverrideCmd::BITS.get((c - 0x99) as usize) {
                    self.tool_ovr_cmd.set(*cmd);
                }
            }
            0xA0 => self.tool_ovr_cmd.set(ToolOverrideCmd::CoolantFloodToggle),
            0xA1 => self.tool_ovr_cmd.set(ToolOverrideCmd::CoolantMistToggle),
            _ => {}
        }
    }

    fn exec_rt_commands(&mut self) {
        for cmd in self.rt_cmd.drain_msb_first() {
            match cmd {
                RtCommand::Reset => {
                    // Resetting mid-move loses the position.
                    let code = if self.exec.contains(ExecState::RUN) { Alarm::AbortCycle } else { Alarm::SoftReset };
                    self.alarm(code);
                    return;
                }
                RtCommand::CycleStart => self.clear_exec_state(ExecState::HOLD | ExecState::DOOR),
                RtCommand::Report => self.send_status(),
            }
        }

        for cmd in self.feed_ovr_cmd.drain_msb_first() {
            match cmd {
                FeedOverrideCmd::FeedReset => self.planner.feed_ovr_reset(),
                FeedOverrideCmd::FeedIncCoarse => self.planner.feed_ovr_inc(FEED_OVR_COARSE),
                FeedOverrideCmd::FeedDecCoarse => self.planner.feed_ovr_inc(-FEED_OVR_COARSE),
                FeedOverrideCmd::FeedIncFine => self.planner.feed_ovr_inc(FEED_OVR_FINE),
                FeedOverrideCmd::FeedDecFine => self.planner.feed_ovr_inc(-FEED_OVR_FINE),
                FeedOverrideCmd::RapidReset => self.planner.rapid_feed_ovr(100),
                FeedOverrideCmd::RapidMedium => self.planner.rapid_feed_ovr(RAPID_FEED_OVR1),
                FeedOverrideCmd::RapidLow => self.planner.rapid_feed_ovr(RAPID_FEED_OVR2),
            }
        }

        let mut update_tools = false;
        let mut spindle_stopped = false;
        for cmd in self.tool_ovr_cmd.drain_msb_first() {
            update_tools = true;
            match cmd {
                ToolOverrideCmd::SpindleReset => self.planner.spindle_ovr_reset(),
                ToolOverrideCmd::SpindleIncCoarse => self.planner.spindle_ovr_inc(SPINDLE_OVR_COARSE),
                ToolOverrideCmd::SpindleDecCoarse => self.planner.spindle_ovr_inc(-SPINDLE_OVR_COARSE),
                ToolOverrideCmd::SpindleIncFine => self.planner.spindle_ovr_inc(SPINDLE_OVR_FINE),
                ToolOverrideCmd::SpindleDecFine => self.planner.spindle_ovr_inc(-SPINDLE_OVR_FINE),
                ToolOverrideCmd::SpindleToggle => {
                    // Only in a hold that has come to rest.
                    let state = self.exec.intersection(ExecState::HOLD | ExecState::DOOR | ExecState::RUN);
                    if state == ExecState::HOLD && self.tool.speed != 0.0 {
                        self.board.set_spindle(0.0, 0);
                        self.tool.speed = 0.0;
                        spindle_stopped = true;
                    }
                }
                ToolOverrideCmd::CoolantFloodToggle => {
                    if !self.exec.intersects(ExecState::ALARM) {
                        self.planner.coolant_ovr_toggle(Coolant::FLOOD);
                    }
                }
                ToolOverrideCmd::CoolantMistToggle => {
                    if !self.exec.intersects(ExecState::ALARM) {
                        self.planner.coolant_ovr_toggle(Coolant::MIST);
                    }
                }
            }
        }

        if update_tools && !spindle_stopped {
            self.apply_tool_outputs();
        }
    }

    // ── Board servicing ───────────────────────────────────────────────

    /// Services the board: real-time bytes, step timer periods and input
    /// changes. Safe to call from any wait loop.
    pub(crate) fn io_dotasks(&mut self) {
        self.board.poll();
        while let Some(c) = self.board.take_realtime() {
            self.call_rt_command(c);
        }

        let ticks = self.board.pending_step_ticks();
        for _ in 0..ticks {
            if !self.exec.contains(ExecState::RUN) {
                break;
            }
            self.step_isr();
            self.limits_changed();
            self.probe_changed();
        }

        self.limits_changed();
        self.controls_changed();
        self.probe_changed();

        if self.rt_cmd.contains(RtCommand::Report) {
            self.rt_cmd.remove(RtCommand::Report);
            self.send_status();
        }
    }

    fn limits_changed(&mut self) {
        if !self.settings.hard_limits_enabled && !self.exec.contains(ExecState::HOMING) {
            return;
        }
        let limits = self.read_limits();
        if limits == self.io.limits {
            return;
        }
        self.io.limits = limits;
        if limits.is_empty() {
            return;
        }
        self.itp_stop();
        self.exec.insert(ExecState::LIMITS);
        if !self.exec.contains(ExecState::HOMING) {
            self.alarm(Alarm::HardLimit);
        }
    }

    fn controls_changed(&mut self) {
        let controls = self.read_controls();
        if controls == self.io.controls {
            return;
        }
        self.io.controls = controls;
        if controls.contains(ControlInputs::ESTOP) {
            self.call_rt_command(0x18);
            return;
        }
        if controls.contains(ControlInputs::SAFETY_DOOR) {
            self.exec.insert(ExecState::HOLD | ExecState::DOOR);
        }
        if controls.contains(ControlInputs::FHOLD) {
            self.exec.insert(ExecState::HOLD);
        }
        if controls.contains(ControlInputs::CS_RES) {
            self.call_rt_command(b'~');
        }
    }

    fn probe_changed(&mut self) {
        if !self.io.probe_enabled || self.io.probe_hit {
            return;
        }
        if self.read_probe() != self.io.probe_away {
            self.io.probe_hit = true;
            self.io.probe_position = self.stepper.rt_position();
            self.itp_stop();
        }
    }

    /// Keeps servicing the board for `ms` milliseconds.
    pub(crate) fn delay_ms(&mut self, ms: u64) {
        let start = self.board.millis();
        while self.board.millis().saturating_sub(start) < ms {
            self.io_dotasks();
        }
    }

    /// One pass of background work. Returns false when the caller must
    /// abandon what it is waiting for.
    pub fn dotasks(&mut self) -> bool {
        self.io_dotasks();
        if self.loop_state == LoopState::StartupReset {
            return false;
        }
        self.exec_rt_commands();
        if self.loop_state == LoopState::ErrorReset {
            return !self.exec.contains(ExecState::KILL);
        }
        if !self.check_interlocking() {
            return !self.exec.contains(ExecState::KILL);
        }
        if self.has_alarm() {
            return !self.exec.intersects(ExecState::KILL | ExecState::HOMING);
        }
        self.itp_run();
        !self.exec.contains(ExecState::KILL)
    }

    // ── Lock, reset and the main loop ─────────────────────────────────

    /// Tries to release the alarm lock. `force` is `$X`/`$H`: it also
    /// drops the halt bit and the pending alarm code.
    pub(crate) fn unlock(&mut self, force: bool) -> UnlockResult {
        self.clear_exec_state(ExecState::ALARM | ExecState::HOLD);
        self.check_interlocking();
        if force {
            self.exec.remove(ExecState::HALT);
            self.alarm = None;
        }

        if self.exec.intersects(ExecState::ALARM) {
            if !self.exec.contains(ExecState::KILL) {
                self.send_feedback(Feedback::Unlock);
                return UnlockResult::Locked;
            }
            return UnlockResult::Error;
        }

        self.exec.remove(ExecState::HALT);
        self.clear_exec_state(ExecState::GCODE_LOCKED | ExecState::HOLD);
        self.board.set_steps(StepperMask::from_bits_truncate(self.settings.step_invert_mask));
        self.board.enable_steppers(StepperMask::from_bits_truncate(self.settings.step_enable_invert));
        self.parser_reset();
        if self.loop_state == LoopState::StartupReset && !self.settings.homing_enabled {
            self.run_startup_blocks();
        }
        console_log!("unlocked");
        UnlockResult::Ok
    }

    fn reset(&mut self) {
        console_log!("reset");
        self.loop_state = LoopState::StartupReset;
        self.rt_cmd.clear();
        self.feed_ovr_cmd.clear();
        self.tool_ovr_cmd.clear();
        self.exec = ExecState::ALARM | ExecState::HOLD;
        self.alarm = None;

        self.board.clear();
        self.board.stop_step_timer();
        self.itp_clear();
        self.planner.clear();
        self.mc = MotionState::default();
        self.io = IoState { controls: self.read_controls(), ..IoState::default() };
        self.io.limits = self.read_limits();
        self.parser_init();
        self.mc_sync_position();
        self.send_line(&banner());
    }

    /// Resets every subsystem, prints the banner and unlocks when no
    /// fault input is active.
    pub fn start(&mut self) {
        self.reset();
        match self.unlock(false) {
            UnlockResult::Error => self.enter_error_reset(),
            _ => self.loop_state = LoopState::FirstRun,
        }
    }

    /// One iteration of the main loop.
    pub fn run_once(&mut self) {
        match self.loop_state {
            LoopState::StartupReset => self.start(),
            LoopState::FirstRun | LoopState::Running => {
                if !self.exec_cmd() {
                    self.enter_error_reset();
                } else if self.loop_state == LoopState::FirstRun {
                    self.loop_state = LoopState::Running;
                }
            }
            LoopState::ErrorReset => {
                if !self.board.is_empty() {
                    while let Some(c) = self.board.get() {
                        if c == b'\n' {
                            break;
                        }
                    }
                    let feedback = if self.read_controls().contains(ControlInputs::ESTOP) {
                        Feedback::CheckEmergencyStop
                    } else {
                        Feedback::ResetToContinue
                    };
                    self.send_feedback(feedback);
                    self.send_ok();
                }
                self.io_dotasks();
                if self.rt_cmd.contains(RtCommand::Reset) {
                    if !self.read_controls().contains(ControlInputs::ESTOP) {
                        self.start();
                        return;
                    }
                    self.rt_cmd.remove(RtCommand::Reset);
                }
                self.dotasks();
            }
        }
    }

    /// Executes the next pending line, if any, then runs the background
    /// tasks.
    fn exec_cmd(&mut self) -> bool {
        if !self.board.is_empty() {
            if self.board.peek() == Some(b'\n') {
                self.board.get();
            } else {
                match self.parser_read_command() {
                    Ok(()) => self.send_ok(),
                    Err(status) => self.send_error(status),
                }
            }
        }
        self.dotasks()
    }

    fn enter_error_reset(&mut self) {
        self.loop_state = LoopState::ErrorReset;
        self.board.clear();
        if let Some(alarm) = self.alarm {
            if alarm.code() > 0 {
                send_alarm(&mut self.board, alarm);
            }
        }

        let critical = self.alarm.is_none_or(|a| a.is_critical());
        if critical {
            self.board.disable_steppers();
            self.check_fault_systems();
            let soft = matches!(self.alarm, None | Some(Alarm::SoftReset));
            if soft && !self.read_controls().contains(ControlInputs::ESTOP) {
                self.start();
            }
            return;
        }

        if self.unlock(false) != UnlockResult::Error {
            self.loop_state = LoopState::Running;
        }
    }

    /// Reports which fault input keeps the controller locked.
    fn check_fault_systems(&mut self) {
        let controls = self.read_controls();
        if controls.contains(ControlInputs::ESTOP) {
            self.send_feedback(Feedback::CheckEmergencyStop);
        }
        if controls.contains(ControlInputs::SAFETY_DOOR) {
            self.send_feedback(Feedback::CheckDoor);
        }
        if self.settings.hard_limits_enabled && !self.read_limits().is_empty() {
            self.send_feedback(Feedback::CheckLimits);
        }
        if self.exec.contains(ExecState::KILL) && self.alarm.is_some_and(|a| a != Alarm::SoftReset) {
            self.send_feedback(Feedback::ResetToContinue);
        }
    }

    pub(crate) fn run_startup_blocks(&mut self) {
        for i in 0..STARTUP_BLOCKS_COUNT {
            let Ok(block) = settings::load_startup_block(&self.board, i) else {
                continue;
            };
            if block.is_empty() {
                continue;
            }
            self.send_line(&format!("[echo:{}]", block));
            match self.gcode_line(&block, false) {
                Ok(()) => self.send_ok(),
                Err(status) => self.send_error(status),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FEED_OVR_MAX, FEED_OVR_MIN};
    use crate::error::Status;
    use crate::sim::SimBoard;

    fn approx_eq(a: f64, b: f64) {
        assert!(
            (a - b).abs() <= 1e-3,
            "expected {:.6}, got {:.6} (|diff|={:.6})",
            b,
            a,
            (a - b).abs()
        );
    }

    fn idle_cnc() -> Cnc<SimBoard> {
        let mut cnc = Cnc::new(SimBoard::new()).unwrap();
        cnc.start();
        cnc.board.take_output();
        cnc
    }

    fn run_until(cnc: &mut Cnc<SimBoard>, mut done: impl FnMut(&Cnc<SimBoard>) -> bool) {
        for _ in 0..100_000 {
            if done(cnc) {
                return;
            }
            cnc.dotasks();
        }
        panic!("condition never reached, exec {:?}", cnc.exec);
    }

    fn settled(cnc: &Cnc<SimBoard>) -> bool {
        cnc.planner.is_empty() && cnc.itp_is_empty() && !cnc.exec.contains(ExecState::RUN)
    }

    #[test]
    fn start_prints_banner_and_unlocks() {
        let mut cnc = Cnc::new(SimBoard::new()).unwrap();
        cnc.start();
        assert_eq!(cnc.board.take_output(), vec![banner()]);
        assert_eq!(cnc.loop_state, LoopState::FirstRun);
        assert!(cnc.exec.is_empty());
        assert!(cnc.board.steppers_enabled());
    }

    #[test]
    fn homing_enabled_keeps_the_machine_locked_until_homed() {
        let mut cnc = Cnc::new(SimBoard::new()).unwrap();
        cnc.settings.homing_enabled = true;
        cnc.start();
        assert!(cnc.exec.contains(ExecState::HALT));
        assert_eq!(cnc.execute_line("G0 X1"), Err(Status::SystemGcLock));
        assert!(cnc.board.output().iter().any(|l| l == "[MSG:'$H'|'$X' to unlock]"));
    }

    #[test]
    fn kill_while_running_aborts_the_cycle() {
        let mut cnc = idle_cnc();
        cnc.exec.insert(ExecState::RUN | ExecState::KILL);
        assert!(!cnc.check_interlocking());
        assert_eq!(cnc.alarm, Some(Alarm::AbortCycle));
        assert!(!cnc.exec.contains(ExecState::RUN));
    }

    #[test]
    fn reset_during_motion_aborts_the_cycle() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G1 X10 F100").unwrap();
        run_until(&mut cnc, |c| c.exec.contains(ExecState::RUN));
        cnc.board.push_bytes(&[0x18]);
        assert!(!cnc.dotasks());
        assert_eq!(cnc.alarm, Some(Alarm::AbortCycle));

        cnc.enter_error_reset();
        assert!(cnc.board.take_output().contains(&"ALARM:3".to_string()));
        assert_eq!(cnc.loop_state, LoopState::ErrorReset);
        assert!(!cnc.board.steppers_enabled());
    }

    #[test]
    fn idle_soft_reset_restarts_with_banner() {
        let mut cnc = idle_cnc();
        cnc.board.push_bytes(&[0x18]);
        cnc.run_once();
        assert_eq!(cnc.board.take_output(), vec![banner()]);
        assert_eq!(cnc.alarm, None);
        assert!(cnc.exec.is_empty());
    }

    #[test]
    fn homing_and_estop_pick_their_own_kill_alarm() {
        let mut cnc = idle_cnc();
        cnc.exec.insert(ExecState::HOMING | ExecState::RUN | ExecState::KILL);
        cnc.check_interlocking();
        assert_eq!(cnc.alarm, Some(Alarm::HomingFailReset));

        let mut cnc = idle_cnc();
        cnc.board.set_inputs(LimitInputs::empty(), ControlInputs::ESTOP, false);
        cnc.exec.insert(ExecState::RUN | ExecState::KILL);
        cnc.check_interlocking();
        assert_eq!(cnc.alarm, Some(Alarm::EmergencyStop));
    }

    #[test]
    fn unlock_without_faults_is_idempotent() {
        let mut cnc = idle_cnc();
        cnc.exec.insert(ExecState::HOLD);
        assert_eq!(cnc.execute_line("$X"), Ok(()));
        assert!(cnc.exec.is_empty());
        assert_eq!(cnc.execute_line("$X"), Ok(()));
        assert!(cnc.exec.is_empty());
        assert_eq!(cnc.alarm, None);
        let out = cnc.board.take_output();
        assert_eq!(out.iter().filter(|l| *l == "[MSG:Caution: Unlocked]").count(), 2);
    }

    #[test]
    fn alarm_locks_gcode_until_unlocked() {
        let mut cnc = idle_cnc();
        cnc.alarm(Alarm::HardLimit);
        assert_eq!(cnc.execute_line("G0 X1"), Err(Status::SystemGcLock));
        assert!(cnc.planner.is_empty());
        assert_eq!(cnc.execute_line("$X"), Ok(()));
        assert_eq!(cnc.execute_line("G0 X1"), Ok(()));
        assert_eq!(cnc.planner.len(), 1);
    }

    #[test]
    fn hard_limit_input_raises_alarm() {
        let mut cnc = idle_cnc();
        cnc.settings.hard_limits_enabled = true;
        cnc.board.set_inputs(LimitInputs::Y, ControlInputs::empty(), false);
        assert!(!cnc.dotasks());
        assert_eq!(cnc.alarm, Some(Alarm::HardLimit));
        assert!(cnc.exec.contains(ExecState::LIMITS | ExecState::KILL));
    }

    #[test]
    fn feed_override_saturates() {
        let mut cnc = idle_cnc();
        for _ in 0..30 {
            cnc.board.push_bytes(&[0x91]);
            cnc.dotasks();
        }
        assert_eq!(cnc.planner.overrides().feed, FEED_OVR_MAX);
        for _ in 0..300 {
            cnc.board.push_bytes(&[0x94]);
            cnc.dotasks();
        }
        assert_eq!(cnc.planner.overrides().feed, FEED_OVR_MIN);
        cnc.board.push_bytes(&[0x90]);
        cnc.dotasks();
        assert_eq!(cnc.planner.overrides().feed, 100);
    }

    #[test]
    fn feed_hold_and_cycle_start_resume_the_move() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G1 X2 F300").unwrap();
        run_until(&mut cnc, |c| c.exec.contains(ExecState::RUN));
        cnc.board.push_bytes(b"!");
        cnc.dotasks();
        assert!(cnc.exec.contains(ExecState::HOLD));
        for _ in 0..200 {
            cnc.dotasks();
        }
        cnc.board.push_bytes(b"~");
        cnc.dotasks();
        assert!(!cnc.exec.contains(ExecState::HOLD));
        run_until(&mut cnc, settled);
        approx_eq(cnc.rt_machine_position()[0], 2.0);
    }

    #[test]
    fn jog_moves_without_touching_modal_state() {
        let mut cnc = idle_cnc();
        assert_eq!(cnc.execute_line("$J=G91 X2 F300"), Ok(()));
        assert!(cnc.exec.contains(ExecState::JOG));
        assert_eq!(cnc.execute_line("G0 Y1"), Err(Status::SystemGcLock));
        run_until(&mut cnc, |c| !c.exec.contains(ExecState::JOG));
        approx_eq(cnc.rt_machine_position()[0], 2.0);
        assert_eq!(cnc.parser.modal.distance, crate::parser::DistanceMode::Absolute);
        assert_eq!(cnc.execute_line("G0 Y1"), Ok(()));
    }

    #[test]
    fn jog_cancel_flushes_the_queue() {
        let mut cnc = idle_cnc();
        cnc.execute_line("$J=G91 X50 F300").unwrap();
        run_until(&mut cnc, |c| c.exec.contains(ExecState::RUN));
        cnc.board.push_bytes(&[0x85]);
        run_until(&mut cnc, |c| !c.exec.contains(ExecState::JOG));
        assert!(cnc.planner.is_empty());
        assert!(cnc.alarm.is_none());
        assert!(cnc.rt_machine_position()[0] < 50.0);
        assert_eq!(cnc.mc_get_position(), cnc.rt_machine_position());
    }

    #[test]
    fn homing_finds_each_switch_and_zeroes_the_origin() {
        let mut cnc = idle_cnc();
        cnc.settings.homing_enabled = true;
        cnc.settings.homing_fast_feed_rate = 300.0;
        cnc.settings.homing_slow_feed_rate = 60.0;
        cnc.settings.debounce_ms = 10;
        for stepper in 0..3 {
            cnc.board.place_limit_switch(stepper, -200, true);
        }
        assert_eq!(cnc.execute_line("$H"), Ok(()));
        assert_eq!(cnc.alarm, None);
        assert!(cnc.exec.is_empty(), "exec {:?}", cnc.exec);
        assert_eq!(cnc.mc_get_position(), [0.0; 3]);
        assert_eq!(cnc.rt_machine_position(), [0.0; 3]);
        for pos in cnc.board.step_position() {
            assert!(pos > -200 && pos < -190, "pulled off to {}", pos);
        }
    }

    #[test]
    fn homing_without_a_switch_fails_the_approach() {
        let mut cnc = idle_cnc();
        cnc.settings.homing_enabled = true;
        cnc.settings.homing_fast_feed_rate = 3000.0;
        cnc.settings.max_feed_rate = [3000.0; 3];
        cnc.settings.acceleration = [500.0; 3];
        cnc.settings.max_distance = [1.0; 3];
        cnc.settings.debounce_ms = 10;
        assert_eq!(cnc.execute_line("$H"), Ok(()));
        assert_eq!(cnc.alarm, Some(Alarm::HomingFailApproach));
        assert!(!cnc.exec.contains(ExecState::HOMING));
    }

    #[test]
    fn door_holds_and_needs_cycle_start() {
        let mut cnc = idle_cnc();
        cnc.board.set_inputs(LimitInputs::empty(), ControlInputs::SAFETY_DOOR, false);
        cnc.dotasks();
        assert!(cnc.exec.contains(ExecState::DOOR | ExecState::HOLD));
        assert_eq!(cnc.execute_line("$X"), Err(Status::CheckDoor));

        cnc.board.set_inputs(LimitInputs::empty(), ControlInputs::empty(), false);
        cnc.dotasks();
        cnc.board.push_bytes(b"~");
        cnc.dotasks();
        assert!(cnc.exec.is_empty());
    }

    #[test]
    fn error_reset_answers_lines_until_reset() {
        let mut cnc = idle_cnc();
        cnc.alarm(Alarm::HardLimit);
        cnc.enter_error_reset();
        cnc.board.take_output();
        cnc.board.push_line("G0 X1");
        cnc.run_once();
        assert_eq!(cnc.board.take_output(), vec!["[MSG:Reset to continue]".to_string(), "ok".to_string()]);

        cnc.board.push_bytes(&[0x18]);
        cnc.run_once();
        assert_eq!(cnc.board.take_output(), vec![banner()]);
        assert_eq!(cnc.loop_state, LoopState::FirstRun);
    }
}
