//! Block execution in RS274/NGC order of execution.

use super::{
    DistanceMode, FeedMode, GroupMask, MotionMode, NonModal, ParsedBlock, PathMode, ProgramFlow,
    ToolLengthMode, Units, WordMask,
};
use crate::cnc::Cnc;
use crate::config::{
    ARC_TOLERANCE_CHECK, AXIS_COUNT, AXIS_Z, DELAY_ON_SPINDLE_SPEED_CHANGE, INCH_MM_MULT,
};
use crate::error::{Alarm, CncResult, Status};
use crate::flags::{Coolant, MotionFlags};
use crate::hal::Board;
use crate::kinematics::AxisVec;
use crate::motion::{ArcRequest, MotionData};
use crate::protocol::{Feedback, send_message};
use crate::settings::{self, G28_SLOT, G30_SLOT};

/// Center offset of an R-format arc from the chord `(x, y)`. A negative
/// radius selects the long way round.
fn radius_center(x: f64, y: f64, r: f64, clockwise: bool) -> CncResult<[f64; 2]> {
    let chord_sqr = x * x + y * y;
    if chord_sqr == 0.0 {
        return Err(Status::InvalidTarget);
    }
    let h = 4.0 * r * r - chord_sqr;
    if h < 0.0 {
        return Err(Status::ArcRadiusError);
    }
    let mut h = -h.sqrt() / chord_sqr.sqrt();
    if !clockwise {
        h = -h;
    }
    if r < 0.0 {
        h = -h;
    }
    Ok([0.5 * (x - y * h), 0.5 * (y + x * h)])
}

impl<B: Board> Cnc<B> {
    pub(crate) fn exec_block(&mut self, block: ParsedBlock, jog: bool) -> CncResult {
        let ParsedBlock { mut state, mut words, cmd, message } = block;
        let groups = cmd.groups;
        let mut mask = cmd.words;

        if let Some(text) = message {
            send_message(&mut self.board, &text);
        }

        if state.program_flow != ProgramFlow::Running && !groups.contains(GroupMask::STOPPING) {
            state.program_flow = ProgramFlow::Running;
        }

        let mut data = MotionData { line: words.n, ..MotionData::default() };
        if state.feed_mode == FeedMode::InverseTime {
            data.flags.insert(MotionFlags::INVERSE_FEED);
        }

        // Program units to mm before anything reads a length.
        if state.units == Units::Inches {
            for v in words.axis.iter_mut().chain(words.ijk.iter_mut()) {
                *v *= INCH_MM_MULT;
            }
            words.r *= INCH_MM_MULT;
        }

        if mask.contains(WordMask::F) && state.feed_mode == FeedMode::UnitsPerMinute {
            state.feed = if state.units == Units::Inches { words.f * INCH_MM_MULT } else { words.f };
        }
        if mask.contains(WordMask::S) {
            state.spindle_speed = words.s;
        }
        if mask.contains(WordMask::T) {
            state.tool = words.t;
        }

        // Spindle and coolant.
        let mut update_tools = false;
        let mut dwell_ms = 0u32;
        data.spindle = state.signed_spindle();
        data.coolant = state.coolant;
        if data.spindle != self.parser.modal.signed_spindle() {
            update_tools = true;
            if data.spindle != 0.0 && !self.settings.laser_mode {
                dwell_ms = (DELAY_ON_SPINDLE_SPEED_CHANGE * 1000.0) as u32;
            }
        }
        if state.coolant != self.parser.modal.coolant {
            update_tools = true;
        }
        if groups.contains(GroupMask::OVERRIDE) {
            self.planner.set_overrides_enabled(state.overrides_enabled);
        }

        if cmd.nonmodal == NonModal::Dwell {
            dwell_ms = dwell_ms.max((words.p * 1000.0).round() as u32);
        }
        if update_tools {
            self.mc_update_tools(&data)?;
        }
        if dwell_ms > 0 {
            self.mc_dwell(dwell_ms)?;
        }

        // Offsets are staged and committed only once the block succeeds.
        let mut tool_length_offset = self.parser.tool_length_offset;
        if groups.contains(GroupMask::TOOL_LENGTH) {
            tool_length_offset = match state.tool_length {
                ToolLengthMode::Dynamic => {
                    mask.remove(WordMask::Z);
                    words.axis[AXIS_Z]
                }
                ToolLengthMode::Cancel => 0.0,
            };
        }
        let mut coord_offset = self.parser.coord_offset;
        if groups.contains(GroupMask::COORD_SYS) {
            coord_offset = settings::load_params(&self.board, state.coord_system).unwrap_or_default();
        }

        match state.path {
            PathMode::ExactStop => data.flags.insert(MotionFlags::EXACT_STOP),
            PathMode::Continuous => data.flags.insert(MotionFlags::CONTINUOUS),
            PathMode::ExactPath => {}
        }

        data.feed = if state.feed_mode == FeedMode::InverseTime { words.f } else { state.feed };

        let current = self.mc_get_position();
        let absolute = cmd.nonmodal == NonModal::AbsoluteOverride;
        let mut target: AxisVec = current;
        for i in 0..AXIS_COUNT {
            if !mask.contains(WordMask::axis(i)) {
                continue;
            }
            target[i] = if absolute {
                words.axis[i]
            } else if state.distance == DistanceMode::Incremental {
                current[i] + words.axis[i]
            } else {
                let tlo = if i == AXIS_Z { tool_length_offset } else { 0.0 };
                words.axis[i] + coord_offset[i] + self.parser.g92_offset[i] + tlo
            };
        }
        let has_axes = mask.intersects(WordMask::AXES);

        match cmd.nonmodal {
            NonModal::SetParams => {
                let slot = if words.p == 0.0 { state.coord_system } else { words.p as usize - 1 };
                let mut values = settings::load_params(&self.board, slot).unwrap_or_default();
                for i in 0..AXIS_COUNT {
                    if !mask.contains(WordMask::axis(i)) {
                        continue;
                    }
                    values[i] = if words.l == 20 {
                        let tlo = if i == AXIS_Z { tool_length_offset } else { 0.0 };
                        current[i] - words.axis[i] - self.parser.g92_offset[i] - tlo
                    } else {
                        words.axis[i]
                    };
                }
                settings::save_params(&mut self.board, slot, &values);
                if slot == state.coord_system {
                    coord_offset = values;
                }
                self.parser.wco_counter = 0;
            }
            NonModal::Home28 | NonModal::Home30 => {
                let slot = if cmd.nonmodal == NonModal::Home28 { G28_SLOT } else { G30_SLOT };
                data.feed = f64::MAX;
                if self.settings.laser_mode {
                    data.spindle = 0.0;
                }
                if has_axes {
                    self.mc_line(&target, &mut data)?;
                }
                let home = settings::load_params(&self.board, slot).unwrap_or_default();
                self.mc_line(&home, &mut data)?;
            }
            NonModal::SetHome28 => settings::save_params(&mut self.board, G28_SLOT, &current),
            NonModal::SetHome30 => settings::save_params(&mut self.board, G30_SLOT, &current),
            NonModal::SetOffset => {
                // The programmed values become the current work position.
                for i in 0..AXIS_COUNT {
                    if mask.contains(WordMask::axis(i)) {
                        let tlo = if i == AXIS_Z { tool_length_offset } else { 0.0 };
                        self.parser.g92_offset[i] = current[i] - coord_offset[i] - tlo - words.axis[i];
                    }
                }
                self.parser.g92_saved = self.parser.g92_offset;
                self.parser.wco_counter = 0;
            }
            NonModal::ResetOffset => {
                self.parser.g92_offset = [0.0; AXIS_COUNT];
                self.parser.g92_saved = [0.0; AXIS_COUNT];
                self.parser.wco_counter = 0;
            }
            NonModal::SuspendOffset => {
                self.parser.g92_offset = [0.0; AXIS_COUNT];
                self.parser.wco_counter = 0;
            }
            NonModal::RestoreOffset => {
                self.parser.g92_offset = self.parser.g92_saved;
                self.parser.wco_counter = 0;
            }
            NonModal::None | NonModal::Dwell | NonModal::AbsoluteOverride => {}
        }

        if !cmd.nonmodal.uses_axis_words() && has_axes {
            let r_format = mask.contains(WordMask::R);
            self.exec_motion(&state, &words, r_format, &target, &mut data)?;
        }

        if tool_length_offset != self.parser.tool_length_offset || coord_offset != self.parser.coord_offset {
            self.parser.wco_counter = 0;
        }
        self.parser.tool_length_offset = tool_length_offset;
        self.parser.coord_offset = coord_offset;

        match state.program_flow {
            ProgramFlow::Paused if groups.contains(GroupMask::STOPPING) => self.mc_pause()?,
            ProgramFlow::End if groups.contains(GroupMask::STOPPING) => {
                if !self.mc.checkmode {
                    self.itp_sync()?;
                }
                self.planner.sync_tools(0.0, Coolant::empty());
                self.cnc_stop();
                self.parser.modal = state;
                self.parser_reset();
                self.send_feedback(Feedback::ProgramEnd);
                return Ok(());
            }
            _ => {}
        }

        if !jog {
            self.parser.modal = state;
        }
        Ok(())
    }

    fn exec_motion(
        &mut self,
        state: &super::ModalState,
        words: &super::ParserWords,
        r_format: bool,
        target: &AxisVec,
        data: &mut MotionData,
    ) -> CncResult {
        match state.motion {
            MotionMode::Seek => {
                data.feed = f64::MAX;
                if self.settings.laser_mode {
                    data.spindle = 0.0;
                }
                self.mc_line(target, data)
            }
            MotionMode::Linear => {
                if data.feed == 0.0 {
                    return Err(Status::FeedNotSet);
                }
                self.mc_line(target, data)
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                if data.feed == 0.0 {
                    return Err(Status::FeedNotSet);
                }
                let clockwise = state.motion == MotionMode::CwArc;
                let (a, b) = state.plane.axes();
                let current = self.mc_get_position();
                let x = target[a] - current[a];
                let y = target[b] - current[b];

                let (center_offset, radius) = if r_format {
                    (radius_center(x, y, words.r, clockwise)?, words.r.abs())
                } else {
                    let offset = [words.ijk[a], words.ijk[b]];
                    let start_radius = offset[0].hypot(offset[1]);
                    let end_radius = (x - offset[0]).hypot(y - offset[1]);
                    if (start_radius - end_radius).abs() > ARC_TOLERANCE_CHECK {
                        return Err(Status::InvalidTarget);
                    }
                    (offset, start_radius)
                };
                let arc = ArcRequest { center_offset, radius, axes: (a, b), clockwise };
                self.mc_arc(target, arc, data)
            }
            MotionMode::Probe(mode) => {
                let hit = self.mc_probe(target, mode, data)?;
                self.parser.last_probe_ok = hit;
                if !hit && !mode.no_error && self.alarm.is_none() {
                    self.alarm(Alarm::ProbeFailContact);
                }
                if self.alarm.is_none() {
                    self.send_probe_result();
                }
                Ok(())
            }
            MotionMode::Cancel => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ModalState;
    use super::*;
    use crate::hal::IoPort;
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

    fn work_x(cnc: &Cnc<SimBoard>) -> f64 {
        cnc.mc_get_position()[0] - cnc.parser.work_offset()[0]
    }

    #[test]
    fn r_arc_shorter_than_half_chord_enqueues_nothing() {
        let mut cnc = idle_cnc();
        assert_eq!(cnc.execute_line("G2 X10 R2 F100"), Err(Status::ArcRadiusError));
        assert!(cnc.planner.is_empty());
        assert_eq!(cnc.parser.modal, ModalState::default());
    }

    #[test]
    fn r_arc_and_ijk_arc_reach_the_same_end() {
        let mut cnc = idle_cnc();
        assert_eq!(cnc.execute_line("G2 X10 Y0 R5 F100"), Ok(()));
        assert!(cnc.planner.len() > 2);
        approx_eq(cnc.mc_get_position()[0], 10.0);

        let mut cnc = idle_cnc();
        assert_eq!(cnc.execute_line("G3 X10 I5 F100"), Ok(()));
        approx_eq(cnc.mc_get_position()[0], 10.0);
        assert_eq!(cnc.execute_line("G3 X0 I-4"), Err(Status::InvalidTarget));
    }

    #[test]
    fn modal_violation_leaves_state_unchanged() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G91 F250").unwrap();
        let before = cnc.parser.modal.clone();
        assert_eq!(cnc.execute_line("G0 G1 X1"), Err(Status::ModalGroupViolation));
        assert_eq!(cnc.parser.modal, before);
        assert!(cnc.planner.is_empty());
    }

    #[test]
    fn inch_and_mm_targets_land_on_the_same_machine_point() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G20 G0 X1").unwrap();
        approx_eq(cnc.mc_get_position()[0], 25.4);
        cnc.execute_line("G21 G0 X25.4").unwrap();
        approx_eq(cnc.mc_get_position()[0], 25.4);
        assert_eq!(cnc.planner.len(), 1);
    }

    #[test]
    fn feed_is_reused_until_changed() {
        let mut cnc = idle_cnc();
        assert_eq!(cnc.execute_line("G1 X10"), Err(Status::FeedNotSet));
        assert!(cnc.planner.is_empty());
        assert_eq!(cnc.execute_line("G1 X10 F100"), Ok(()));
        assert_eq!(cnc.execute_line("G1 Y10"), Ok(()));
        assert_eq!(cnc.planner.len(), 2);
        assert_eq!(cnc.parser.modal.feed, 100.0);
    }

    #[test]
    fn g92_sets_and_clears_the_work_offset() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G0 X3").unwrap();
        cnc.execute_line("G92 X5").unwrap();
        approx_eq(work_x(&cnc), 5.0);
        approx_eq(cnc.mc_get_position()[0], 3.0);
        assert_eq!(cnc.planner.len(), 1);

        cnc.execute_line("G92.2").unwrap();
        approx_eq(work_x(&cnc), 3.0);
        cnc.execute_line("G92.3").unwrap();
        approx_eq(work_x(&cnc), 5.0);

        cnc.execute_line("G92.1").unwrap();
        approx_eq(work_x(&cnc), 3.0);
        assert_eq!(cnc.parser.g92_offset, [0.0; 3]);
    }

    #[test]
    fn g10_l20_makes_the_current_position_read_the_value() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G0 X4").unwrap();
        cnc.execute_line("G10 L20 P1 X1").unwrap();
        approx_eq(cnc.parser.coord_offset[0], 3.0);
        approx_eq(work_x(&cnc), 1.0);
        let stored = settings::load_params(&cnc.board, 0).unwrap();
        approx_eq(stored[0], 3.0);
    }

    #[test]
    fn g10_l2_on_another_system_applies_when_selected() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G10 L2 P2 X7").unwrap();
        assert_eq!(cnc.parser.coord_offset, [0.0; 3]);
        cnc.execute_line("G55").unwrap();
        approx_eq(cnc.parser.coord_offset[0], 7.0);
        cnc.execute_line("G0 X1").unwrap();
        approx_eq(cnc.mc_get_position()[0], 8.0);
        cnc.execute_line("G53 G0 X1").unwrap();
        approx_eq(cnc.mc_get_position()[0], 1.0);
    }

    #[test]
    fn dynamic_tool_length_offsets_z() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G43.1 Z2").unwrap();
        assert_eq!(cnc.planner.len(), 0);
        cnc.execute_line("G0 Z0").unwrap();
        approx_eq(cnc.mc_get_position()[2], 2.0);
        cnc.execute_line("G49 G0 Z0").unwrap();
        approx_eq(cnc.mc_get_position()[2], 0.0);
    }

    #[test]
    fn g28_returns_through_the_stored_position() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G0 X5 Y1").unwrap();
        cnc.execute_line("G28.1").unwrap();
        cnc.execute_line("G0 X0 Y0").unwrap();
        cnc.execute_line("G28 Y2").unwrap();
        let pos = cnc.mc_get_position();
        approx_eq(pos[0], 5.0);
        approx_eq(pos[1], 1.0);
        assert_eq!(cnc.planner.len(), 4);
    }

    #[test]
    fn spindle_and_coolant_reach_the_board() {
        let mut cnc = idle_cnc();
        let start = cnc.board.millis();
        cnc.execute_line("M3 S500 M8").unwrap();
        assert_eq!(cnc.board.spindle(), 500.0);
        assert_eq!(cnc.board.coolant(), Coolant::FLOOD);
        assert!(cnc.board.millis() - start >= 1000, "spindle change dwells");

        let start = cnc.board.millis();
        cnc.execute_line("M5 M9").unwrap();
        assert_eq!(cnc.board.spindle(), 0.0);
        assert!(cnc.board.coolant().is_empty());
        assert!(cnc.board.millis() - start < 1000);
    }

    #[test]
    fn dwell_waits_in_seconds() {
        let mut cnc = idle_cnc();
        let start = cnc.board.millis();
        cnc.execute_line("G4 P0.25").unwrap();
        assert!(cnc.board.millis() - start >= 250);
    }

    #[test]
    fn program_end_resets_modes_and_outputs() {
        let mut cnc = idle_cnc();
        cnc.execute_line("G91 G20 M8 F40").unwrap();
        cnc.execute_line("M2").unwrap();
        assert!(cnc.board.coolant().is_empty());
        assert_eq!(cnc.parser.modal.distance, DistanceMode::Absolute);
        assert_eq!(cnc.parser.modal.units, Units::Millimeters);
        assert_eq!(cnc.parser.modal.program_flow, ProgramFlow::Running);
        approx_eq(cnc.parser.modal.feed, 40.0 * INCH_MM_MULT);
        assert!(cnc.board.take_output().contains(&"[MSG:Pgm End]".to_string()));
    }

    #[test]
    fn program_pause_holds_until_cycle_start() {
        let mut cnc = idle_cnc();
        cnc.execute_line("M0").unwrap();
        assert!(cnc.exec.contains(crate::flags::ExecState::HOLD));
        assert_eq!(cnc.parser.modal.program_flow, ProgramFlow::Paused);
        cnc.execute_line("G21").unwrap();
        assert_eq!(cnc.parser.modal.program_flow, ProgramFlow::Running);
    }

    #[test]
    fn probe_without_contact() {
        let mut cnc = idle_cnc();
        assert_eq!(cnc.execute_line("G38.3 Z-1 F200"), Ok(()));
        assert_eq!(cnc.alarm, None);
        assert!(!cnc.parser.last_probe_ok);
        approx_eq(cnc.mc_get_position()[2], -1.0);
        let out = cnc.board.take_output();
        assert!(out.iter().any(|l| l.starts_with("[PRB:") && l.ends_with(":0]")), "{:?}", out);

        assert_eq!(cnc.execute_line("G38.2 Z-2 F200"), Ok(()));
        assert_eq!(cnc.alarm, Some(Alarm::ProbeFailContact));
        let out = cnc.board.take_output();
        assert!(!out.iter().any(|l| l.starts_with("[PRB:")), "{:?}", out);
    }

    #[test]
    fn probe_touch_reports_the_trip_position() {
        let mut cnc = idle_cnc();
        cnc.board.place_probe_plate(AXIS_Z, -100, true);
        assert_eq!(cnc.execute_line("G38.2 Z-2 F200"), Ok(()));
        assert_eq!(cnc.alarm, None);
        assert!(cnc.parser.last_probe_ok);
        approx_eq(cnc.parser.last_probe_position[AXIS_Z], -0.5);
        let out = cnc.board.take_output();
        assert!(out.contains(&"[PRB:0.000,0.000,-0.500:1]".to_string()), "{:?}", out);
    }

    #[test]
    fn probe_already_tripped_fails_initial() {
        let mut cnc = idle_cnc();
        cnc.board.set_probe(true);
        assert_eq!(cnc.execute_line("G38.2 Z-2 F200"), Ok(()));
        assert_eq!(cnc.alarm, Some(Alarm::ProbeFailInitial));
        assert!(!cnc.parser.last_probe_ok);
        assert!(cnc.planner.is_empty());
    }

    #[test]
    fn message_comment_is_sent() {
        let mut cnc = idle_cnc();
        cnc.execute_line("(MSG,tool change)").unwrap();
        assert_eq!(cnc.board.take_output(), vec!["[MSG:tool change]".to_string()]);
    }
}
