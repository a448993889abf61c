//! Step interpolation.
//!
//! The main loop side ([`Interpolator`]) cuts the front planner block into
//! fixed-time segments that follow the block's trapezoidal speed profile.
//! The timer side ([`StepGenerator`]) pops those segments and runs the
//! Bresenham step distribution once per timer tick. The two halves only
//! share the SPSC segment queue, so each field has exactly one writer.

use crate::cnc::Cnc;
use crate::config::{
    DSS_CUTOFF_FREQ, DSS_MAX_OVERSAMPLING, F_STEP_MIN, INTERPOLATOR_BUFFER_SIZE, INTERPOLATOR_DELTA_T,
    STEPPER_COUNT,
};
use crate::error::{CncResult, Status};
use crate::flags::{ExecState, StepperMask};
use crate::hal::{Board, IoPort};
use crate::kinematics::{AxisVec, StepVec};
use crate::planner::{Planner, PlannerBlock};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

/// Bresenham state of one planner block as seen by the step timer.
///
/// Accumulators run at the finest oversampling resolution, so a change of
/// oversampling level only changes the per-tick increment and no step is
/// ever lost to rescaling. Step counts are doubled so the error can start
/// at half a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepBlock {
    pub steps: [u64; STEPPER_COUNT],
    pub total_steps: u64,
    pub errors: [u64; STEPPER_COUNT],
    pub dirbits: StepperMask,
    pub line: u32,
}

impl StepBlock {
    pub fn from_planner(block: &PlannerBlock) -> Self {
        let mut steps = [0; STEPPER_COUNT];
        for (s, b) in steps.iter_mut().zip(block.steps.iter()) {
            *s = (*b as u64) << 1;
        }
        let total = block.total_steps as u64;
        StepBlock {
            steps,
            total_steps: (total << 1) << DSS_MAX_OVERSAMPLING,
            errors: [total << DSS_MAX_OVERSAMPLING; STEPPER_COUNT],
            dirbits: block.dirbits,
            line: block.line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Set on the first segment of a block; later segments continue the
    /// block the generator already holds.
    pub block: Option<StepBlock>,
    /// Timer ticks left in this segment.
    pub remaining_steps: u32,
    /// Oversampling level: the timer runs `2^dss` ticks per step period.
    pub dss: u8,
    pub timer_freq: f64,
    pub update_timer: bool,
    /// Tool feed in mm/min while this segment runs.
    pub feed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Stepped,
    /// No segment left; the timer must stop.
    Drained,
}

pub fn segment_queue() -> (Interpolator, StepGenerator) {
    let (producer, consumer) = HeapRb::<Segment>::new(INTERPOLATOR_BUFFER_SIZE - 1).split();
    (Interpolator::new(producer), StepGenerator::new(consumer))
}

// ── Main loop side ────────────────────────────────────────────────────

pub struct Interpolator {
    segments: HeapProducer<Segment>,
    block_loaded: bool,
    needs_update: bool,
    unprocessed_steps: u32,
    accel_until: u32,
    deaccel_from: u32,
    junction_speed_sqr: f64,
    half_speed_change: f64,
    initial_accel_negative: bool,
    feed_conversion: f64,
    last_freq: f64,
}

impl Interpolator {
    fn new(segments: HeapProducer<Segment>) -> Self {
        Interpolator {
            segments,
            block_loaded: false,
            needs_update: false,
            unprocessed_steps: 0,
            accel_until: 0,
            deaccel_from: 0,
            junction_speed_sqr: 0.0,
            half_speed_change: 0.0,
            initial_accel_negative: false,
            feed_conversion: 0.0,
            last_freq: 0.0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.segments.is_full()
    }

    /// A planner block is being cut into segments.
    pub fn has_block(&self) -> bool {
        self.block_loaded
    }

    /// Forces the speed profile of the current block to be recomputed.
    pub fn update(&mut self) {
        self.needs_update = true;
    }

    fn reset(&mut self) {
        self.block_loaded = false;
        self.needs_update = false;
        self.unprocessed_steps = 0;
        self.last_freq = 0.0;
    }

    fn load_block(&mut self, block: &PlannerBlock) -> StepBlock {
        self.unprocessed_steps = block.total_steps;
        self.feed_conversion = block.feed_conversion;
        self.half_speed_change = 0.5 * INTERPOLATOR_DELTA_T * block.acceleration;
        self.needs_update = true;
        self.block_loaded = true;
        StepBlock::from_planner(block)
    }

    fn update_profile(&mut self, planner: &mut Planner) {
        self.needs_update = false;
        let exit_speed_sqr = planner.exit_speed_sqr();
        let junction = planner.top_speed_sqr(exit_speed_sqr);
        let Some(front) = planner.front_mut() else { return };

        self.junction_speed_sqr = junction;
        self.accel_until = self.unprocessed_steps;
        self.deaccel_from = 0;
        if junction != front.entry_feed_sqr {
            let accel_dist = 0.5 * (junction - front.entry_feed_sqr).abs() / front.acceleration;
            self.accel_until = self.accel_until.saturating_sub(accel_dist.floor() as u32);
            self.initial_accel_negative = junction < front.entry_feed_sqr;
        }
        if self.accel_until == self.unprocessed_steps {
            front.entry_feed_sqr = junction;
        }
        if junction > exit_speed_sqr {
            let deaccel_dist = 0.5 * (junction - exit_speed_sqr) / front.acceleration;
            self.deaccel_from = deaccel_dist.floor() as u32;
        }
    }

    /// Cuts the next segment off the front planner block. Returns `None`
    /// when the planner is empty or a hold has brought the speed to zero.
    pub fn produce(&mut self, planner: &mut Planner, max_step_rate: f64, hold: bool) -> Option<Segment> {
        let mut handoff = None;
        if !self.block_loaded {
            let block = *planner.front()?;
            handoff = Some(self.load_block(&block));
        }

        let front_changed = planner.take_front_changed();
        if hold {
            self.accel_until = self.unprocessed_steps;
            self.deaccel_from = self.unprocessed_steps;
            self.needs_update = true;
        } else if self.needs_update || front_changed {
            self.update_profile(planner);
        }

        let (speed_change, profile_limit) = if self.unprocessed_steps > self.accel_until {
            let change = if self.initial_accel_negative { -self.half_speed_change } else { self.half_speed_change };
            (change, self.accel_until)
        } else if self.unprocessed_steps > self.deaccel_from {
            (0.0, self.deaccel_from)
        } else {
            (-self.half_speed_change, 0)
        };

        let front = planner.front_mut()?;
        let entry = front.entry_feed_sqr;
        let mut current_speed = entry.sqrt() + speed_change;
        if hold && current_speed < 0.0 {
            return None;
        }

        let partial = (current_speed * INTERPOLATOR_DELTA_T).min(65535.0);
        let segm_steps = (partial.floor() as u32).max(1).min(self.unprocessed_steps - profile_limit);

        if speed_change != 0.0 {
            let delta = 2.0 * front.acceleration * segm_steps as f64;
            let new_speed_sqr = if speed_change > 0.0 { entry + delta } else { (entry - delta).max(0.0) };
            current_speed = 0.5 * (new_speed_sqr.sqrt() + entry.sqrt());
            front.entry_feed_sqr = new_speed_sqr;
        }

        let mut step_rate = current_speed.round().clamp(F_STEP_MIN, max_step_rate.max(F_STEP_MIN));
        let mut dss = 0u8;
        while step_rate < DSS_CUTOFF_FREQ && dss < DSS_MAX_OVERSAMPLING && segm_steps > 0 {
            step_rate *= 2.0;
            dss += 1;
        }

        self.unprocessed_steps -= segm_steps;
        front.total_steps = self.unprocessed_steps;
        if self.unprocessed_steps == self.accel_until && !hold {
            front.entry_feed_sqr = self.junction_speed_sqr;
        }

        let update_timer = step_rate != self.last_freq;
        self.last_freq = step_rate;
        let segment = Segment {
            block: handoff,
            remaining_steps: segm_steps << dss,
            dss,
            timer_freq: step_rate,
            update_timer,
            feed: current_speed * self.feed_conversion,
        };

        if self.unprocessed_steps == 0 {
            planner.discard_front();
            self.block_loaded = false;
        }
        Some(segment)
    }
}

// ── Timer side ────────────────────────────────────────────────────────

pub struct StepGenerator {
    segments: HeapConsumer<Segment>,
    running: Option<Segment>,
    block: Option<StepBlock>,
    stepbits: StepperMask,
    dirbits: StepperMask,
    rt_position: StepVec,
    feed: f64,
    line: u32,
}

impl StepGenerator {
    fn new(segments: HeapConsumer<Segment>) -> Self {
        StepGenerator {
            segments,
            running: None,
            block: None,
            stepbits: StepperMask::empty(),
            dirbits: StepperMask::empty(),
            rt_position: [0; STEPPER_COUNT],
            feed: 0.0,
            line: 0,
        }
    }

    pub fn rt_position(&self) -> StepVec {
        self.rt_position
    }

    pub fn set_rt_position(&mut self, steps: StepVec) {
        self.rt_position = steps;
    }

    pub fn feed(&self) -> f64 {
        self.feed
    }

    /// Line number of the executing block.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Nothing left to run, including the steps decided on the last tick
    /// that go out on the next one.
    pub fn is_idle(&self) -> bool {
        self.running.is_none() && self.segments.is_empty() && self.stepbits.is_empty()
    }

    /// Timer frequency of the segment that runs next.
    pub fn next_freq(&self) -> Option<f64> {
        self.running.as_ref().or_else(|| self.segments.iter().next()).map(|s| s.timer_freq)
    }

    pub fn clear(&mut self) {
        while self.segments.pop().is_some() {}
        self.running = None;
        self.block = None;
        self.stepbits = StepperMask::empty();
        self.feed = 0.0;
    }

    fn load(&mut self, mut segment: Segment, io: &mut dyn IoPort, dir_invert: u8) {
        if let Some(block) = segment.block.take() {
            self.dirbits = block.dirbits;
            io.set_dirs(StepperMask::from_bits_truncate(block.dirbits.bits() ^ dir_invert));
            self.line = block.line;
            self.block = Some(block);
        }
        if segment.update_timer {
            io.change_step_timer(segment.timer_freq);
        }
        self.feed = segment.feed;
        self.running = Some(segment);
    }

    /// First phase of one timer period: emits the steps decided on the
    /// previous tick and decides the next ones.
    pub fn tick(&mut self, io: &mut dyn IoPort, dir_invert: u8) -> StepEvent {
        if !self.stepbits.is_empty() {
            io.toggle_steps(self.stepbits);
            for (i, pos) in self.rt_position.iter_mut().enumerate() {
                let bit = StepperMask::stepper(i);
                if self.stepbits.contains(bit) {
                    if self.dirbits.contains(bit) {
                        *pos -= 1;
                    } else {
                        *pos += 1;
                    }
                }
            }
            self.stepbits = StepperMask::empty();
        }

        if self.running.is_none() {
            match self.segments.pop() {
                Some(segment) => self.load(segment, io, dir_invert),
                None => {
                    self.feed = 0.0;
                    return StepEvent::Drained;
                }
            }
        }

        let shift = self.running.as_ref().map(|s| DSS_MAX_OVERSAMPLING - s.dss.min(DSS_MAX_OVERSAMPLING)).unwrap_or(0);
        if let Some(block) = self.block.as_mut() {
            for i in 0..STEPPER_COUNT {
                block.errors[i] += block.steps[i] << shift;
                if block.errors[i] > block.total_steps {
                    block.errors[i] -= block.total_steps;
                    self.stepbits.insert(StepperMask::stepper(i));
                }
            }
        }

        if let Some(segment) = self.running.as_mut() {
            segment.remaining_steps = segment.remaining_steps.saturating_sub(1);
            if segment.remaining_steps == 0 {
                self.running = None;
            }
        }
        StepEvent::Stepped
    }
}

// ── Controller glue ───────────────────────────────────────────────────

impl<B: Board> Cnc<B> {
    /// Refills the segment queue and starts the step timer when idle.
    pub(crate) fn itp_run(&mut self) {
        // A finished jog releases the jog lock.
        if self.exec.contains(ExecState::JOG)
            && !self.exec.contains(ExecState::RUN)
            && self.planner.is_empty()
            && self.itp_is_empty()
        {
            self.exec.remove(ExecState::JOG);
        }

        while !self.itp.is_full() {
            if self.exec.intersects(ExecState::ALARM) {
                return;
            }
            let hold = self.exec.contains(ExecState::HOLD);
            let Some(segment) = self.itp.produce(&mut self.planner, self.settings.max_step_rate, hold) else {
                break;
            };
            if self.itp.segments.push(segment).is_err() {
                break;
            }
        }

        self.apply_tool_outputs();
        self.itp_start();
    }

    fn itp_start(&mut self) {
        if self.exec.intersects(ExecState::RUN | ExecState::HOLD | ExecState::ALARM) {
            return;
        }
        if let Some(freq) = self.stepper.next_freq() {
            self.exec.insert(ExecState::RUN);
            self.board.start_step_timer(freq);
        }
    }

    pub(crate) fn itp_stop(&mut self) {
        if self.exec.contains(ExecState::RUN) {
            // Steps may have been lost mid-block.
            self.exec.insert(ExecState::HALT);
        }
        self.board.set_steps(StepperMask::from_bits_truncate(self.settings.step_invert_mask));
        if self.settings.laser_mode {
            self.board.set_spindle(0.0, 0);
            self.tool.speed = 0.0;
        }
        self.board.stop_step_timer();
        self.exec.remove(ExecState::RUN);
    }

    pub(crate) fn itp_clear(&mut self) {
        self.itp.reset();
        self.stepper.clear();
    }

    pub fn itp_is_empty(&self) -> bool {
        self.stepper.is_idle() && !self.itp.has_block()
    }

    /// Runs the main loop until every queued motion has been stepped out.
    pub(crate) fn itp_sync(&mut self) -> CncResult {
        while !self.itp_is_empty() || !self.planner.is_empty() {
            if !self.dotasks() {
                if self.exec.contains(ExecState::HOMING_HIT) {
                    break;
                }
                return Err(Status::CriticalFail);
            }
        }
        Ok(())
    }

    /// One step timer period, both phases.
    pub(crate) fn step_isr(&mut self) {
        let event = self.stepper.tick(&mut self.board, self.settings.dir_invert_mask);
        self.board.set_steps(StepperMask::from_bits_truncate(self.settings.step_invert_mask));
        if event == StepEvent::Drained {
            self.exec.remove(ExecState::RUN);
            self.itp_stop();
        }
    }

    pub fn rt_feed(&self) -> f64 {
        if self.exec.contains(ExecState::RUN) { self.stepper.feed() } else { 0.0 }
    }

    pub fn rt_machine_position(&self) -> AxisVec {
        let mut axis = self.kinematics.apply_forward(&self.settings, &self.stepper.rt_position());
        self.kinematics.apply_reverse_transform(&mut axis);
        axis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::MotionData;
    use crate::settings::Settings;
    use crate::sim::SimBoard;

    fn line(steps: [u32; STEPPER_COUNT], feed_mm_min: f64) -> MotionData {
        let mut data = MotionData::default();
        data.steps = steps;
        data.total_steps = *steps.iter().max().unwrap();
        data.main_stepper = steps.iter().position(|s| *s == data.total_steps).unwrap();
        data.dir_vect = [1.0, 0.0, 0.0];
        data.feed = feed_mm_min * 200.0;
        data.feed_conversion = 60.0 / 200.0;
        data
    }

    /// Drains the planner through both halves without a controller.
    fn run_to_end(planner: &mut Planner, settings: &Settings) -> (StepVec, u32) {
        let (mut itp, mut stepper) = segment_queue();
        let mut board = SimBoard::new();
        let mut ticks = 0u32;
        loop {
            while !itp.is_full() {
                match itp.produce(planner, settings.max_step_rate, false) {
                    Some(s) => {
                        itp.segments.push(s).unwrap();
                    }
                    None => break,
                }
            }
            if stepper.tick(&mut board, 0) == StepEvent::Drained && planner.is_empty() && !itp.has_block() {
                break;
            }
            ticks += 1;
            assert!(ticks < 5_000_000, "interpolator never finished");
        }
        (stepper.rt_position(), ticks)
    }

    #[test]
    fn every_planned_step_is_emitted() {
        let settings = Settings::default();
        let mut planner = Planner::new().unwrap();
        planner.add_line(&line([2000, 700, 3], 300.0), &settings);
        let (pos, _) = run_to_end(&mut planner, &settings);
        assert_eq!(pos, [2000, 700, 3]);
    }

    #[test]
    fn consecutive_blocks_accumulate_position() {
        let settings = Settings::default();
        let mut planner = Planner::new().unwrap();
        planner.add_line(&line([400, 0, 0], 200.0), &settings);
        planner.add_line(&line([400, 100, 0], 200.0), &settings);
        let (pos, _) = run_to_end(&mut planner, &settings);
        assert_eq!(pos, [800, 100, 0]);
    }

    #[test]
    fn generator_stays_busy_until_the_last_step_is_out() {
        let settings = Settings::default();
        let mut planner = Planner::new().unwrap();
        planner.add_line(&line([200, 0, 0], 600.0), &settings);
        let (mut itp, mut stepper) = segment_queue();
        let mut board = SimBoard::new();
        let mut ticks = 0u32;
        loop {
            while !itp.is_full() {
                match itp.produce(&mut planner, settings.max_step_rate, false) {
                    Some(s) => itp.segments.push(s).unwrap(),
                    None => break,
                }
            }
            if stepper.is_idle() && planner.is_empty() && !itp.has_block() {
                break;
            }
            stepper.tick(&mut board, 0);
            ticks += 1;
            assert!(ticks < 1_000_000, "generator never went idle");
        }
        assert_eq!(stepper.rt_position(), [200, 0, 0]);
        assert_eq!(board.step_position(), [200, 0, 0]);
    }

    #[test]
    fn slow_segments_are_oversampled() {
        let settings = Settings::default();
        let mut planner = Planner::new().unwrap();
        // 10 mm/min is 33 steps/s, well below the oversampling cutoff.
        planner.add_line(&line([200, 0, 0], 10.0), &settings);
        let (mut itp, _stepper) = segment_queue();
        let mut dss_seen = false;
        while let Some(s) = itp.produce(&mut planner, settings.max_step_rate, false) {
            if s.dss > 0 {
                dss_seen = true;
            }
            assert!(s.timer_freq >= F_STEP_MIN);
            assert!(s.timer_freq <= settings.max_step_rate);
        }
        assert!(dss_seen);
    }

    #[test]
    fn hold_decelerates_to_rest_before_block_end() {
        let settings = Settings::default();
        let mut planner = Planner::new().unwrap();
        planner.add_line(&line([100_000, 0, 0], 500.0), &settings);
        let (mut itp, _stepper) = segment_queue();
        for _ in 0..50 {
            itp.produce(&mut planner, settings.max_step_rate, false).unwrap();
        }
        let cruise = planner.front().unwrap().entry_feed_sqr;
        assert!(cruise > 0.0);
        let mut produced = 0;
        while itp.produce(&mut planner, settings.max_step_rate, true).is_some() {
            produced += 1;
            assert!(produced < 10_000);
        }
        assert!(!planner.is_empty());
        assert!(planner.front().unwrap().entry_feed_sqr < 1e-9);
    }

    #[test]
    fn segment_feed_tracks_the_programmed_feed() {
        let settings = Settings::default();
        let mut planner = Planner::new().unwrap();
        planner.add_line(&line([40_000, 0, 0], 120.0), &settings);
        let (mut itp, _stepper) = segment_queue();
        let mut top = 0.0f64;
        while let Some(s) = itp.produce(&mut planner, settings.max_step_rate, false) {
            top = top.max(s.feed);
        }
        assert!((top - 120.0).abs() < 1.0, "cruise feed {top}");
    }
}
