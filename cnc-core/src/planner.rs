//! Look-ahead motion planner.
//!
//! Blocks are stored in actuator-step space. Speeds are squared step rates
//! of the dominant stepper (steps²/s²) and accelerations are steps/s², so
//! the interpolator can integrate them without unit conversions.

use crate::config::{
    AXIS_COUNT, FEED_OVR_MAX, FEED_OVR_MIN, MIN_SEC_MULT, PLANNER_BUFFER_SIZE, RAPID_FEED_OVR1, RAPID_FEED_OVR2,
    SPINDLE_OVR_MAX, SPINDLE_OVR_MIN, STATUS_FEED_OVR_REPORT_MIN_FREQUENCY, STEPPER_COUNT,
};
use crate::flags::{Coolant, MotionFlags, StepperMask};
use crate::kinematics::AxisVec;
use crate::motion::MotionData;
use crate::settings::Settings;
use ringbuf::ring_buffer::RbBase;
use ringbuf::{LocalRb, Rb};
use serde::Serialize;
use std::mem::MaybeUninit;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("planner capacity {0} is too small, at least 2 slots are required")]
pub struct CapacityError(pub usize);

/// One slot of the configured size is kept free, so a queue sized
/// `capacity` holds at most `capacity - 1` blocks.
type BlockQueue = LocalRb<PlannerBlock, Vec<MaybeUninit<PlannerBlock>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlannerBlock {
    pub steps: [u32; STEPPER_COUNT],
    pub total_steps: u32,
    pub dirbits: StepperMask,
    pub main_stepper: usize,

    pub entry_feed_sqr: f64,
    pub entry_max_feed_sqr: f64,
    pub feed_sqr: f64,
    pub rapid_feed_sqr: f64,
    pub acceleration: f64,
    /// Multiplier from dominant step rate (steps/s) to tool feed (mm/min).
    pub feed_conversion: f64,

    /// Entry speed can no longer be raised by looking further ahead.
    pub optimal: bool,
    /// Feed override applies to this block (M48 was active when queued).
    pub feed_override: bool,

    pub spindle: f64,
    pub coolant: Coolant,
    pub line: u32,
}

/// Override percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Overrides {
    pub feed: u8,
    pub rapid: u8,
    pub spindle: u8,
    pub coolant: Coolant,
    pub enabled: bool,
}

impl Default for Overrides {
    fn default() -> Self {
        Overrides { feed: 100, rapid: 100, spindle: 100, coolant: Coolant::empty(), enabled: true }
    }
}

pub struct Planner {
    blocks: BlockQueue,
    last_dir: AxisVec,
    overrides: Overrides,
    ovr_counter: u8,
    /// Tool state of the last discarded block, reported when the queue is
    /// empty.
    spindle: f64,
    coolant: Coolant,
    front_changed: bool,
}

fn apply_override(value: u8, delta: i16, min: u8, max: u8) -> u8 {
    (value as i16 + delta).clamp(min as i16, max as i16) as u8
}

impl Planner {
    pub fn new() -> Result<Self, CapacityError> {
        Self::with_capacity(PLANNER_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, CapacityError> {
        if capacity < 2 {
            return Err(CapacityError(capacity));
        }
        Ok(Planner {
            blocks: BlockQueue::new(capacity - 1),
            last_dir: [0.0; AXIS_COUNT],
            overrides: Overrides::default(),
            ovr_counter: 0,
            spindle: 0.0,
            coolant: Coolant::empty(),
            front_changed: false,
        })
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.last_dir = [0.0; AXIS_COUNT];
        self.spindle = 0.0;
        self.coolant = Coolant::empty();
        self.front_changed = false;
    }

    pub fn is_full(&self) -> bool {
        self.blocks.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn free(&self) -> usize {
        self.blocks.free_len()
    }

    pub fn front(&self) -> Option<&PlannerBlock> {
        self.blocks.iter().next()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut PlannerBlock> {
        self.blocks.iter_mut().next()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &PlannerBlock> + '_ {
        self.blocks.iter()
    }

    /// Drops the executing block once the interpolator consumed it.
    pub fn discard_front(&mut self) {
        if let Some(block) = self.blocks.pop() {
            self.spindle = block.spindle;
            self.coolant = block.coolant;
        }
    }

    /// True once after the look-ahead changed the speed the front block
    /// must leave with.
    pub fn take_front_changed(&mut self) -> bool {
        std::mem::take(&mut self.front_changed)
    }

    /// Queues one line. Returns false when the buffer is full; callers wait
    /// for a free slot before calling. Zero-length lines are dropped.
    pub fn add_line(&mut self, data: &MotionData, settings: &Settings) -> bool {
        if data.total_steps == 0 {
            return true;
        }

        let was_empty = self.blocks.is_empty();
        let mut block = PlannerBlock {
            steps: data.steps,
            total_steps: data.total_steps,
            dirbits: data.dirbits,
            main_stepper: data.main_stepper,
            feed_conversion: data.feed_conversion,
            feed_override: self.overrides.enabled,
            spindle: data.spindle,
            coolant: data.coolant,
            line: data.line,
            ..PlannerBlock::default()
        };

        let mut cos_theta = 0.0;
        if !was_empty {
            for i in 0..AXIS_COUNT {
                cos_theta += data.dir_vect[i] * self.last_dir[i];
            }
        }
        self.last_dir = data.dir_vect;

        // Limits per stepper, rescaled to the dominant stepper.
        let mut rapid_feed = f64::MAX;
        let mut acceleration = f64::MAX;
        for i in 0..STEPPER_COUNT {
            if data.steps[i] == 0 {
                continue;
            }
            let step_ratio = settings.step_per_mm[i] / data.steps[i] as f64;
            rapid_feed = rapid_feed.min(settings.max_feed_rate[i] * step_ratio);
            acceleration = acceleration.min(settings.acceleration[i] * step_ratio);
        }
        let total = data.total_steps as f64;
        rapid_feed *= MIN_SEC_MULT * total;
        acceleration *= total;

        let feed = (data.feed * MIN_SEC_MULT).min(rapid_feed);
        block.feed_sqr = feed * feed;
        block.rapid_feed_sqr = rapid_feed * rapid_feed;
        block.acceleration = acceleration;

        // Junction speed from the angle between this line and the previous one.
        if !was_empty && !data.flags.contains(MotionFlags::EXACT_STOP) {
            let mut angle_factor = 1.0;
            if cos_theta != 0.0 {
                angle_factor = (1.0 - cos_theta * cos_theta).max(0.0).sqrt() / (1.0 + cos_theta);
            }
            if data.flags.contains(MotionFlags::CONTINUOUS) {
                angle_factor -= settings.g64_angle_factor;
            }
            let angle_factor = if angle_factor.is_finite() { angle_factor.clamp(0.0, 1.0) } else { 1.0 };
            if angle_factor < 1.0 {
                if let Some(prev) = self.blocks.iter().next_back() {
                    let junction = 1.0 - angle_factor;
                    block.entry_max_feed_sqr = block.feed_sqr.min(junction * junction * prev.feed_sqr);
                }
            }
        }

        if self.blocks.push(block).is_err() {
            return false;
        }
        self.recompute();
        true
    }

    /// Look-ahead pass. Walks back from the newest block raising entry
    /// speeds to what the following blocks allow, then forward to keep
    /// every entry reachable from the previous block.
    pub fn recompute(&mut self) {
        let mut blocks: Vec<&mut PlannerBlock> = self.blocks.iter_mut().collect();
        let len = blocks.len();
        if len == 0 {
            return;
        }
        if len < 2 {
            blocks[0].entry_feed_sqr = 0.0;
            return;
        }

        let last = len - 1;
        let mut next_entry = 0.0;
        let mut first = 1;
        let mut i = last;
        while i >= 1 {
            let block = &mut *blocks[i];
            if block.optimal {
                first = i;
                break;
            }
            let reachable = next_entry + 2.0 * block.acceleration * block.total_steps as f64;
            block.entry_feed_sqr = block.entry_max_feed_sqr.min(reachable);
            next_entry = block.entry_feed_sqr;
            first = i;
            i -= 1;
        }

        let start = first.saturating_sub(1);
        for i in start..last {
            let cur = &blocks[i];
            let (cur_entry, cur_reach) =
                (cur.entry_feed_sqr, cur.entry_feed_sqr + 2.0 * cur.acceleration * cur.total_steps as f64);
            let next = &mut *blocks[i + 1];
            if cur_entry < next.entry_feed_sqr && cur_reach < next.entry_feed_sqr {
                next.entry_feed_sqr = next.entry_max_feed_sqr.min(cur_reach);
                next.optimal = true;
            }
            if next.entry_feed_sqr == next.entry_max_feed_sqr {
                next.optimal = true;
            }
        }

        self.front_changed = true;
    }

    fn feed_factor(&self, block: &PlannerBlock) -> f64 {
        if block.feed_override && self.overrides.feed != 100 {
            let f = self.overrides.feed as f64 * 0.01;
            f * f
        } else {
            1.0
        }
    }

    fn rapid_factor(&self) -> f64 {
        let f = self.overrides.rapid as f64 * 0.01;
        f * f
    }

    /// Speed² the front block must end with: the entry speed of the next
    /// block, overridden, or zero when nothing follows.
    pub fn exit_speed_sqr(&self) -> f64 {
        let Some(next) = self.blocks.iter().nth(1) else { return 0.0 };
        let mut exit = next.entry_feed_sqr * self.feed_factor(next);
        exit = exit.min(next.rapid_feed_sqr * self.rapid_factor());
        exit
    }

    /// Highest speed² the front block can reach given its entry, the
    /// requested exit and its remaining steps.
    pub fn top_speed_sqr(&self, exit_speed_sqr: f64) -> f64 {
        let Some(block) = self.front() else { return 0.0 };
        let entry = block.entry_feed_sqr;
        let junction = 2.0 * block.acceleration * block.total_steps as f64;
        let top = if junction >= (exit_speed_sqr - entry) {
            (junction + exit_speed_sqr + entry) * 0.5
        } else if exit_speed_sqr > entry {
            junction + entry
        } else {
            entry
        };
        let target = block.feed_sqr * self.feed_factor(block);
        let rapid = block.rapid_feed_sqr * self.rapid_factor();
        top.min(target).min(rapid)
    }

    // ── Overrides ─────────────────────────────────────────────────────

    pub fn overrides(&self) -> Overrides {
        self.overrides
    }

    fn overrides_changed(&mut self) {
        self.ovr_counter = 0;
        self.front_changed = true;
    }

    pub fn set_overrides_enabled(&mut self, enabled: bool) {
        self.overrides.enabled = enabled;
    }

    pub fn feed_ovr_inc(&mut self, delta: i16) {
        let value = apply_override(self.overrides.feed, delta, FEED_OVR_MIN, FEED_OVR_MAX);
        if value != self.overrides.feed {
            self.overrides.feed = value;
            self.overrides_changed();
        }
    }

    pub fn feed_ovr_reset(&mut self) {
        if self.overrides.feed != 100 {
            self.overrides.feed = 100;
            self.overrides_changed();
        }
    }

    /// Rapid override only takes 100, 50 or 25 percent.
    pub fn rapid_feed_ovr(&mut self, value: u8) {
        let value = match value {
            RAPID_FEED_OVR1 | RAPID_FEED_OVR2 => value,
            _ => 100,
        };
        if value != self.overrides.rapid {
            self.overrides.rapid = value;
            self.overrides_changed();
        }
    }

    pub fn spindle_ovr_inc(&mut self, delta: i16) {
        let value = apply_override(self.overrides.spindle, delta, SPINDLE_OVR_MIN, SPINDLE_OVR_MAX);
        if value != self.overrides.spindle {
            self.overrides.spindle = value;
            self.ovr_counter = 0;
        }
    }

    pub fn spindle_ovr_reset(&mut self) {
        if self.overrides.spindle != 100 {
            self.overrides.spindle = 100;
            self.ovr_counter = 0;
        }
    }

    pub fn coolant_ovr_toggle(&mut self, mask: Coolant) {
        self.overrides.coolant.toggle(mask);
        self.ovr_counter = 0;
    }

    /// True when the status report should carry the override field.
    pub fn take_override_report(&mut self) -> bool {
        if self.ovr_counter == 0 {
            self.ovr_counter = STATUS_FEED_OVR_REPORT_MIN_FREQUENCY;
            return true;
        }
        self.ovr_counter -= 1;
        false
    }

    // ── Tools ─────────────────────────────────────────────────────────

    /// Tool state applied when the queue drains, e.g. after M5 with no
    /// motion pending.
    pub fn sync_tools(&mut self, spindle: f64, coolant: Coolant) {
        self.spindle = spindle;
        self.coolant = coolant;
    }

    pub fn programmed_spindle(&self) -> f64 {
        self.front().map(|b| b.spindle).unwrap_or(self.spindle)
    }

    pub fn programmed_coolant(&self) -> Coolant {
        self.front().map(|b| b.coolant).unwrap_or(self.coolant)
    }

    /// Signed spindle speed after override and rpm clamping, with its
    /// PWM duty.
    pub fn spindle_speed(&self, settings: &Settings) -> (f64, u8) {
        let programmed = self.programmed_spindle();
        if programmed == 0.0 {
            return (0.0, 0);
        }
        let mut speed = programmed.abs();
        let overridden = self.front().map(|b| b.feed_override).unwrap_or(self.overrides.enabled);
        if overridden {
            speed *= 0.01 * self.overrides.spindle as f64;
        }
        speed = speed.clamp(settings.spindle_min_rpm, settings.spindle_max_rpm.max(settings.spindle_min_rpm));
        let pwm = if settings.spindle_max_rpm > 0.0 { (255.0 * speed / settings.spindle_max_rpm).trunc() as u8 } else { 0 };
        (speed.copysign(programmed), pwm)
    }

    pub fn coolant(&self) -> Coolant {
        let programmed = self.programmed_coolant();
        Coolant::from_bits_truncate(programmed.bits() ^ self.overrides.coolant.bits())
    }
}
