//! Motion control: turns machine-frame targets from the parser into
//! planner blocks in actuator-step space.

use crate::cnc::Cnc;
use crate::config::{AXIS_COUNT, MAX_STEPS_PER_LINE, N_ARC_CORRECTION, STEPPER_COUNT};
use crate::error::{Alarm, CncResult, Status};
use crate::flags::{Coolant, ExecState, LimitInputs, MotionFlags, StepperMask};
use crate::hal::Board;
use crate::kinematics::{AxisVec, StepVec};
use serde::Serialize;
use std::f64::consts::PI;

/// One motion request. The parser fills feed, tools, flags and line; the
/// step fields are filled here for every planner block it produces.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionData {
    pub steps: [u32; STEPPER_COUNT],
    pub total_steps: u32,
    pub dirbits: StepperMask,
    pub main_stepper: usize,
    /// Unit vector of the move in machine axes.
    pub dir_vect: AxisVec,
    /// mm/min as requested (`f64::MAX` for rapids, 1/min under inverse
    /// time). Each queued block carries the dominant stepper's steps/min.
    pub feed: f64,
    pub feed_conversion: f64,
    pub flags: MotionFlags,
    pub spindle: f64,
    pub coolant: Coolant,
    pub dwell_ms: u32,
    pub line: u32,
}

/// Arc geometry in the active plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcRequest {
    /// Center offset from the current position along the two plane axes.
    pub center_offset: [f64; 2],
    pub radius: f64,
    pub axes: (usize, usize),
    pub clockwise: bool,
}

/// G38.2 to G38.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeMode {
    /// Trip on contact loss instead of contact.
    pub away: bool,
    /// Missing contact is not an alarm.
    pub no_error: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MotionState {
    pub last_step_pos: StepVec,
    pub last_target: AxisVec,
    pub checkmode: bool,
}

/// Tool outputs as last written to the board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ToolOutput {
    pub speed: f64,
    pub coolant: Coolant,
}

impl<B: Board> Cnc<B> {
    pub fn mc_get_position(&self) -> AxisVec {
        self.mc.last_target
    }

    /// Aligns the motion position with the real-time step position.
    pub fn mc_sync_position(&mut self) {
        self.mc.last_step_pos = self.stepper.rt_position();
        self.mc.last_target = self.rt_machine_position();
    }

    pub fn mc_toggle_checkmode(&mut self) -> bool {
        self.mc.checkmode = !self.mc.checkmode;
        self.mc.checkmode
    }

    /// True when the target lies inside the travel envelope.
    fn check_boundaries(&self, target: &AxisVec) -> bool {
        for (i, t) in target.iter().enumerate() {
            let value = if self.settings.homing_dir_invert_mask & (1 << i) != 0 { -t } else { *t };
            if value < 0.0 || value > self.settings.max_distance[i] {
                return false;
            }
        }
        true
    }

    pub(crate) fn mc_line(&mut self, target: &AxisVec, data: &mut MotionData) -> CncResult {
        if self.settings.soft_limits_enabled && !self.exec.contains(ExecState::HOMING) && !self.check_boundaries(target)
        {
            if self.exec.contains(ExecState::JOG) {
                return Err(Status::TravelExceeded);
            }
            self.alarm(Alarm::SoftLimit);
            return Ok(());
        }

        if self.mc.checkmode {
            self.mc.last_target = *target;
            return Ok(());
        }

        let start = self.mc.last_target;
        let mut delta = [0.0; AXIS_COUNT];
        let mut distance = 0.0;
        for i in 0..AXIS_COUNT {
            delta[i] = target[i] - start[i];
            distance += delta[i] * delta[i];
        }
        distance = distance.sqrt();
        if distance == 0.0 {
            return Ok(());
        }
        for i in 0..AXIS_COUNT {
            data.dir_vect[i] = delta[i] / distance;
        }

        let feed = if data.flags.contains(MotionFlags::INVERSE_FEED) { data.feed * distance } else { data.feed };

        let mut end = *target;
        self.kinematics.apply_transform(&mut end);
        let end_steps = self.kinematics.apply_inverse(&self.settings, &end);
        let max_delta = end_steps
            .iter()
            .zip(self.mc.last_step_pos.iter())
            .map(|(n, o)| (n - o).unsigned_abs())
            .max()
            .unwrap_or(0);
        let pieces = max_delta.div_ceil(MAX_STEPS_PER_LINE).max(1);
        let piece_distance = distance / pieces as f64;

        for k in 1..=pieces {
            let mut point = *target;
            if k < pieces {
                let f = k as f64 / pieces as f64;
                for i in 0..AXIS_COUNT {
                    point[i] = start[i] + delta[i] * f;
                }
            }
            self.kinematics.apply_transform(&mut point);
            let step_pos = self.kinematics.apply_inverse(&self.settings, &point);

            data.total_steps = 0;
            data.dirbits = StepperMask::empty();
            for i in 0..STEPPER_COUNT {
                let d = step_pos[i] - self.mc.last_step_pos[i];
                data.steps[i] = d.unsigned_abs();
                if d < 0 {
                    data.dirbits.insert(StepperMask::stepper(i));
                }
                if data.steps[i] > data.total_steps {
                    data.total_steps = data.steps[i];
                    data.main_stepper = i;
                }
            }
            if data.total_steps == 0 {
                continue;
            }

            let mut block = *data;
            block.feed = feed * data.total_steps as f64 / piece_distance;
            block.feed_conversion = 60.0 * piece_distance / data.total_steps as f64;

            while self.planner.is_full() {
                if !self.dotasks() {
                    return Err(Status::CriticalFail);
                }
            }
            self.planner.add_line(&block, &self.settings);
            self.mc.last_step_pos = step_pos;
        }

        self.mc.last_target = *target;
        Ok(())
    }

    /// Splits an arc into chords within the arc tolerance.
    pub(crate) fn mc_arc(&mut self, target: &AxisVec, arc: ArcRequest, data: &mut MotionData) -> CncResult {
        let mut position = self.mc_get_position();
        let (a0, a1) = arc.axes;
        let [offset_a, offset_b] = arc.center_offset;
        let center_a = position[a0] + offset_a;
        let center_b = position[a1] + offset_b;

        let mut r_a = -offset_a;
        let mut r_b = -offset_b;
        let rt_a = target[a0] - center_a;
        let rt_b = target[a1] - center_b;

        let mut angle = (r_a * rt_b - r_b * rt_a).atan2(r_a * rt_a + r_b * rt_b);
        if arc.clockwise {
            if angle >= 0.0 {
                angle -= 2.0 * PI;
            }
        } else if angle <= 0.0 {
            angle += 2.0 * PI;
        }

        let tol = self.settings.arc_tolerance;
        let half_sweep = (0.5 * arc.radius * angle).abs();
        let segments = (half_sweep / (tol * (2.0 * arc.radius - tol)).sqrt()).floor().max(0.0) as u32;
        if segments < 2 {
            return self.mc_line(target, data);
        }
        let theta = angle / segments as f64;

        let mut increment = [0.0; AXIS_COUNT];
        for i in 0..AXIS_COUNT {
            if i != a0 && i != a1 {
                increment[i] = (target[i] - position[i]) / segments as f64;
            }
        }
        if data.flags.contains(MotionFlags::INVERSE_FEED) {
            data.feed *= segments as f64;
        }

        let theta_sqr = theta * theta;
        let sin_t = theta * (1.0 - theta_sqr / 6.0);
        let cos_t = 1.0 - 0.5 * theta_sqr;

        let mut count = 0;
        for i in 1..segments {
            if count < N_ARC_CORRECTION {
                let next_b = r_a * sin_t + r_b * cos_t;
                r_a = r_a * cos_t - r_b * sin_t;
                r_b = next_b;
                count += 1;
            } else {
                let (sin_i, cos_i) = (i as f64 * theta).sin_cos();
                r_a = -offset_a * cos_i + offset_b * sin_i;
                r_b = -offset_a * sin_i - offset_b * cos_i;
                count = 0;
            }
            position[a0] = center_a + r_a;
            position[a1] = center_b + r_b;
            for (p, inc) in position.iter_mut().zip(increment.iter()) {
                *p += inc;
            }
            self.mc_line(&position, data)?;
        }
        self.mc_line(target, data)
    }

    /// Waits for the queue to drain, then for `ms` milliseconds.
    pub(crate) fn mc_dwell(&mut self, ms: u32) -> CncResult {
        if self.mc.checkmode {
            return Ok(());
        }
        self.itp_sync()?;
        self.delay_ms(ms as u64);
        Ok(())
    }

    /// M0: waits for the queue to drain and holds until cycle start.
    pub(crate) fn mc_pause(&mut self) -> CncResult {
        if self.mc.checkmode {
            return Ok(());
        }
        self.itp_sync()?;
        self.set_exec_state(ExecState::HOLD);
        Ok(())
    }

    /// Applies spindle and coolant once every queued motion completed.
    pub(crate) fn mc_update_tools(&mut self, data: &MotionData) -> CncResult {
        if self.mc.checkmode {
            return Ok(());
        }
        self.itp_sync()?;
        self.planner.sync_tools(data.spindle, data.coolant);
        self.apply_tool_outputs();
        Ok(())
    }

    /// Writes the planner's current tool state to the board.
    pub(crate) fn apply_tool_outputs(&mut self) {
        let (mut speed, mut pwm) = self.planner.spindle_speed(&self.settings);
        if self.settings.laser_mode && !self.exec.contains(ExecState::RUN) {
            speed = 0.0;
            pwm = 0;
        }
        let coolant = self.planner.coolant();
        if speed != self.tool.speed {
            self.board.set_spindle(speed, pwm);
        }
        if coolant != self.tool.coolant {
            self.board.set_coolant(coolant);
        }
        self.tool = ToolOutput { speed, coolant };
    }

    /// Moves toward `target` until the probe trips. Returns whether it
    /// tripped; the trip position is kept for `$#`.
    pub(crate) fn mc_probe(&mut self, target: &AxisVec, mode: ProbeMode, data: &mut MotionData) -> CncResult<bool> {
        if self.mc.checkmode {
            return Ok(true);
        }
        self.itp_sync()?;
        if self.read_probe() != mode.away {
            self.alarm(Alarm::ProbeFailInitial);
            return Ok(false);
        }

        self.io.probe_away = mode.away;
        self.io.probe_hit = false;
        self.io.probe_enabled = true;
        self.board.enable_probe();

        let result = self.mc_line(target, data);
        if result.is_ok() {
            while !self.io.probe_hit && (!self.itp_is_empty() || !self.planner.is_empty()) {
                if !self.dotasks() {
                    break;
                }
            }
        }

        self.board.disable_probe();
        self.io.probe_enabled = false;
        self.itp_stop();
        self.exec.remove(ExecState::HALT);
        self.itp_clear();
        self.planner.clear();
        self.planner.sync_tools(data.spindle, data.coolant);
        self.mc_sync_position();
        result?;

        let hit = self.io.probe_hit;
        if hit {
            let mut axis = self.kinematics.apply_forward(&self.settings, &self.io.probe_position);
            self.kinematics.apply_reverse_transform(&mut axis);
            self.parser.last_probe_position = axis;
        }
        Ok(hit)
    }

    /// `$H`: homes every axis in kinematics order and resets the origin.
    pub(crate) fn mc_home(&mut self) -> CncResult {
        console_log!("homing started");
        self.exec.insert(ExecState::HOMING);
        for &axis in self.kinematics.homing_order() {
            if axis < AXIS_COUNT {
                self.mc_home_axis(axis)?;
            }
        }

        let origin = [0.0; AXIS_COUNT];
        let steps = self.kinematics.apply_inverse(&self.settings, &origin);
        self.stepper.set_rt_position(steps);
        self.mc_sync_position();
        self.exec.remove(ExecState::HOMING | ExecState::HALT | ExecState::LIMITS);
        self.parser.wco_counter = 0;
        console_log!("homing finished");
        Ok(())
    }

    fn mc_home_axis(&mut self, axis: usize) -> CncResult {
        let axis_limit = LimitInputs::axis(axis);
        let inverted = self.settings.homing_dir_invert_mask & (1 << axis) != 0;

        self.unlock(true);
        if self.exec.intersects(ExecState::HOLD | ExecState::ALARM) || self.read_limits().contains(axis_limit) {
            self.alarm(Alarm::HomingFailLimitActive);
            return Err(Status::CriticalFail);
        }

        let mut travel = -1.5 * self.settings.max_distance[axis];
        if inverted {
            travel = -travel;
        }
        self.mc_sync_position();
        let mut target = self.mc_get_position();
        target[axis] += travel;
        let mut data = MotionData { feed: self.settings.homing_fast_feed_rate, ..MotionData::default() };

        self.unlock(true);
        self.exec.insert(ExecState::HOMING);
        self.mc_line(&target, &mut data)?;
        self.itp_sync()?;

        self.itp_stop();
        self.itp_clear();
        self.planner.clear();
        self.delay_ms(self.settings.debounce_ms as u64);

        if !self.read_limits().contains(axis_limit) {
            self.exec.insert(ExecState::HALT);
            self.alarm(Alarm::HomingFailApproach);
            return Err(Status::CriticalFail);
        }

        // Pull off at low speed. The limit reads inverted so its release
        // stops the move.
        let mut pull_off = 5.0 * self.settings.homing_offset;
        if inverted {
            pull_off = -pull_off;
        }
        self.mc_sync_position();
        target = self.mc_get_position();
        target[axis] += pull_off;
        data.feed = self.settings.homing_slow_feed_rate;

        self.io.homing_invert = axis_limit;
        self.io.limits = self.read_limits();
        self.unlock(true);
        self.exec.insert(ExecState::HOMING);
        self.mc_line(&target, &mut data)?;
        self.itp_sync()?;

        self.io.homing_invert = LimitInputs::empty();
        self.io.limits = self.read_limits();
        self.cnc_stop();
        self.itp_clear();
        self.planner.clear();
        self.delay_ms(self.settings.debounce_ms as u64);

        if self.read_limits().contains(axis_limit) {
            self.exec.insert(ExecState::HALT);
            self.alarm(Alarm::HomingFailPulloff);
            return Err(Status::CriticalFail);
        }
        self.exec.remove(ExecState::LIMITS | ExecState::HALT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
        cnc
    }

    fn feed(f: f64) -> MotionData {
        MotionData { feed: f, ..MotionData::default() }
    }

    #[test]
    fn line_queues_one_block_with_signed_directions() {
        let mut cnc = idle_cnc();
        cnc.mc_line(&[2.0, -1.0, 0.0], &mut feed(100.0)).unwrap();
        let block = cnc.planner.front().copied().unwrap();
        assert_eq!(block.steps, [400, 200, 0]);
        assert_eq!(block.total_steps, 400);
        assert_eq!(block.main_stepper, 0);
        assert!(block.dirbits.contains(StepperMask::stepper(1)));
        assert!(!block.dirbits.contains(StepperMask::stepper(0)));
        // 100 mm/min along a sqrt(5) mm move.
        let expected = 100.0 / 60.0 * 400.0 / 5f64.sqrt();
        approx_eq(block.feed_sqr.sqrt(), expected);
        assert_eq!(cnc.mc_get_position(), [2.0, -1.0, 0.0]);
    }

    #[test]
    fn repeated_target_queues_nothing() {
        let mut cnc = idle_cnc();
        cnc.mc_line(&[0.0; AXIS_COUNT], &mut feed(100.0)).unwrap();
        assert!(cnc.planner.is_empty());
    }

    #[test]
    fn check_mode_tracks_position_without_motion() {
        let mut cnc = idle_cnc();
        cnc.mc_toggle_checkmode();
        cnc.mc_line(&[5.0, 0.0, 0.0], &mut feed(100.0)).unwrap();
        assert!(cnc.planner.is_empty());
        assert_eq!(cnc.mc_get_position(), [5.0, 0.0, 0.0]);
    }

    #[test]
    fn synced_line_comes_to_rest_on_its_last_step() {
        let mut cnc = idle_cnc();
        cnc.mc_line(&[1.0, 0.0, 0.0], &mut feed(600.0)).unwrap();
        cnc.itp_sync().unwrap();
        assert!(cnc.itp_is_empty());
        assert_eq!(cnc.stepper.rt_position()[0], 200);
        assert_eq!(cnc.board.step_position()[0], 200);
        approx_eq(cnc.rt_machine_position()[0], 1.0);
    }

    #[test]
    fn arc_ends_exactly_on_target_and_stays_on_radius() {
        let mut cnc = idle_cnc();
        let arc = ArcRequest { center_offset: [5.0, 0.0], radius: 5.0, axes: (0, 1), clockwise: false };
        let mut data = feed(200.0);
        // Quarter circle from (0,0) around (5,0) to (5,-5) counter-clockwise.
        cnc.mc_arc(&[5.0, -5.0, 0.0], arc, &mut data).unwrap();
        assert!(cnc.planner.len() > 2);
        let end = cnc.mc_get_position();
        approx_eq(end[0], 5.0);
        approx_eq(end[1], -5.0);
    }

    #[test]
    fn soft_limit_raises_alarm_and_jog_reports_travel_exceeded() {
        let mut cnc = idle_cnc();
        cnc.settings.homing_enabled = true;
        cnc.settings.soft_limits_enabled = true;
        cnc.exec.insert(ExecState::JOG);
        assert_eq!(cnc.mc_line(&[-1.0, 0.0, 0.0], &mut feed(100.0)), Err(Status::TravelExceeded));
        cnc.exec.remove(ExecState::JOG);
        assert_eq!(cnc.mc_line(&[-1.0, 0.0, 0.0], &mut feed(100.0)), Ok(()));
        assert_eq!(cnc.alarm, Some(Alarm::SoftLimit));
        assert!(cnc.exec.contains(ExecState::KILL));
        assert!(cnc.planner.is_empty());
    }

    #[test]
    fn long_lines_are_split_below_the_step_limit() {
        let mut cnc = idle_cnc();
        cnc.settings.step_per_mm[0] = 1_000_000.0;
        cnc.mc_line(&[300.0, 0.0, 0.0], &mut feed(100.0)).unwrap();
        assert!(cnc.planner.len() >= 3);
        assert!(cnc.planner.blocks().all(|b| b.total_steps <= MAX_STEPS_PER_LINE));
        let total: u64 = cnc.planner.blocks().map(|b| b.total_steps as u64).sum();
        assert_eq!(total, 300_000_000);
    }

    #[test]
    fn tool_update_waits_and_drives_outputs() {
        let mut cnc = idle_cnc();
        let data = MotionData { spindle: 600.0, coolant: Coolant::FLOOD, ..MotionData::default() };
        cnc.mc_update_tools(&data).unwrap();
        assert_eq!(cnc.tool.speed, 600.0);
        assert_eq!(cnc.board.spindle(), 600.0);
        assert_eq!(cnc.board.coolant(), Coolant::FLOOD);
    }
}
