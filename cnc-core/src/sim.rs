//! A software board: a 1 ms clock, counted step pins, scriptable inputs
//! and an in-memory store. Drives the browser build and the tests.

use crate::config::STEPPER_COUNT;
use crate::flags::{ControlInputs, Coolant, LimitInputs, StepperMask};
use crate::hal::{CommandSource, IoPort, LineBuffer};
use crate::protocol::ReportSink;
use crate::settings::{MemoryStore, SettingsStore};

/// A switch that closes once a stepper passes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LimitSwitch {
    stepper: usize,
    at_steps: i64,
    toward_negative: bool,
}

impl LimitSwitch {
    fn closed(&self, steps: &[i64; STEPPER_COUNT]) -> bool {
        let Some(&pos) = steps.get(self.stepper) else {
            return false;
        };
        if self.toward_negative {
            pos <= self.at_steps
        } else {
            pos >= self.at_steps
        }
    }
}

pub struct SimBoard {
    rx: LineBuffer,
    store: MemoryStore,
    output: Vec<String>,
    millis: u64,
    timer_freq: Option<f64>,
    tick_budget: f64,
    steps: [i64; STEPPER_COUNT],
    step_pins: StepperMask,
    dir_pins: StepperMask,
    steppers_enabled: bool,
    limits: LimitInputs,
    controls: ControlInputs,
    probe: bool,
    probe_enabled: bool,
    switches: [Option<LimitSwitch>; STEPPER_COUNT],
    probe_switch: Option<LimitSwitch>,
    spindle: f64,
    spindle_pwm: u8,
    coolant: Coolant,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    pub fn new() -> Self {
        SimBoard {
            rx: LineBuffer::new(),
            store: MemoryStore::new(),
            output: Vec::new(),
            millis: 0,
            timer_freq: None,
            tick_budget: 0.0,
            steps: [0; STEPPER_COUNT],
            step_pins: StepperMask::empty(),
            dir_pins: StepperMask::empty(),
            steppers_enabled: false,
            limits: LimitInputs::empty(),
            controls: ControlInputs::empty(),
            probe: false,
            probe_enabled: false,
            switches: [None; STEPPER_COUNT],
            probe_switch: None,
            spindle: 0.0,
            spindle_pwm: 0,
            coolant: Coolant::empty(),
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.rx.push_line(line);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.rx.push_bytes(bytes);
    }

    /// Response lines written since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn set_inputs(&mut self, limits: LimitInputs, controls: ControlInputs, probe: bool) {
        self.limits = limits;
        self.controls = controls;
        self.probe = probe;
    }

    pub fn set_probe(&mut self, probe: bool) {
        self.probe = probe;
    }

    /// Installs a switch on `stepper` that reads active at or beyond
    /// `at_steps` in the given direction.
    pub fn place_limit_switch(&mut self, stepper: usize, at_steps: i64, toward_negative: bool) {
        if let Some(slot) = self.switches.get_mut(stepper) {
            *slot = Some(LimitSwitch { stepper, at_steps, toward_negative });
        }
    }

    /// Places a workpiece under the probe: the probe input reads active
    /// once `stepper` reaches `at_steps` in the given direction.
    pub fn place_probe_plate(&mut self, stepper: usize, at_steps: i64, toward_negative: bool) {
        self.probe_switch = Some(LimitSwitch { stepper, at_steps, toward_negative });
    }

    /// Signed step counts as seen on the step and direction pins.
    pub fn step_position(&self) -> [i64; STEPPER_COUNT] {
        self.steps
    }

    pub fn spindle(&self) -> f64 {
        self.spindle
    }

    pub fn spindle_pwm(&self) -> u8 {
        self.spindle_pwm
    }

    pub fn coolant(&self) -> Coolant {
        self.coolant
    }

    pub fn steppers_enabled(&self) -> bool {
        self.steppers_enabled
    }

    pub fn probe_enabled(&self) -> bool {
        self.probe_enabled
    }

    pub fn timer_running(&self) -> bool {
        self.timer_freq.is_some()
    }

    fn switch_limits(&self) -> LimitInputs {
        let mut limits = LimitInputs::empty();
        for (i, switch) in self.switches.iter().enumerate() {
            if switch.is_some_and(|s| s.closed(&self.steps)) {
                limits.insert(LimitInputs::axis(i));
            }
        }
        limits
    }
}

impl IoPort for SimBoard {
    fn enable_steppers(&mut self, _invert: StepperMask) {
        self.steppers_enabled = true;
    }

    fn disable_steppers(&mut self) {
        self.steppers_enabled = false;
    }

    fn set_steps(&mut self, mask: StepperMask) {
        self.step_pins = mask;
    }

    fn toggle_steps(&mut self, mask: StepperMask) {
        self.step_pins.toggle(mask);
        for (i, pos) in self.steps.iter_mut().enumerate() {
            let bit = StepperMask::stepper(i);
            if mask.contains(bit) {
                *pos += if self.dir_pins.contains(bit) { -1 } else { 1 };
            }
        }
    }

    fn set_dirs(&mut self, mask: StepperMask) {
        self.dir_pins = mask;
    }

    fn read_limits(&self) -> LimitInputs {
        self.limits | self.switch_limits()
    }

    fn read_controls(&self) -> ControlInputs {
        self.controls
    }

    fn read_probe(&self) -> bool {
        self.probe || self.probe_switch.is_some_and(|s| s.closed(&self.steps))
    }

    fn enable_probe(&mut self) {
        self.probe_enabled = true;
    }

    fn disable_probe(&mut self) {
        self.probe_enabled = false;
    }

    fn start_step_timer(&mut self, freq: f64) {
        self.timer_freq = Some(freq);
    }

    fn change_step_timer(&mut self, freq: f64) {
        if self.timer_freq.is_some() {
            self.timer_freq = Some(freq);
        }
    }

    fn stop_step_timer(&mut self) {
        self.timer_freq = None;
        self.tick_budget = 0.0;
    }

    fn pending_step_ticks(&mut self) -> u32 {
        let ticks = self.tick_budget.floor();
        self.tick_budget -= ticks;
        ticks as u32
    }

    fn millis(&self) -> u64 {
        self.millis
    }

    fn poll(&mut self) {
        self.millis += 1;
        if let Some(freq) = self.timer_freq {
            self.tick_budget += freq / 1000.0;
        }
    }

    fn set_spindle(&mut self, speed: f64, pwm: u8) {
        self.spindle = speed;
        self.spindle_pwm = pwm;
    }

    fn set_coolant(&mut self, coolant: Coolant) {
        self.coolant = coolant;
    }
}

impl CommandSource for SimBoard {
    fn peek(&self) -> Option<u8> {
        self.rx.peek()
    }

    fn get(&mut self) -> Option<u8> {
        self.rx.get()
    }

    fn unget(&mut self) {
        self.rx.unget();
    }

    fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn clear(&mut self) {
        self.rx.clear();
    }

    fn take_realtime(&mut self) -> Option<u8> {
        self.rx.take_realtime()
    }

    fn free_bytes(&self) -> usize {
        self.rx.free_bytes()
    }
}

impl SettingsStore for SimBoard {
    fn read(&self, address: usize, buf: &mut [u8]) {
        self.store.read(address, buf);
    }

    fn write(&mut self, address: usize, data: &[u8]) {
        self.store.write(address, data);
    }
}

impl ReportSink for SimBoard {
    fn write_str(&mut self, s: &str) {
        self.output.push(s.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_timer_delivers_ticks_per_millisecond() {
        let mut board = SimBoard::new();
        board.start_step_timer(2500.0);
        board.poll();
        board.poll();
        assert_eq!(board.pending_step_ticks(), 5);
        board.poll();
        assert_eq!(board.pending_step_ticks(), 2);
        board.poll();
        assert_eq!(board.pending_step_ticks(), 3);
        board.stop_step_timer();
        board.poll();
        assert_eq!(board.pending_step_ticks(), 0);
        assert_eq!(board.millis(), 5);
    }

    #[test]
    fn limit_switch_follows_counted_steps() {
        let mut board = SimBoard::new();
        board.place_limit_switch(0, -3, true);
        board.set_dirs(StepperMask::stepper(0));
        assert!(board.read_limits().is_empty());
        for _ in 0..3 {
            board.toggle_steps(StepperMask::stepper(0));
        }
        assert_eq!(board.step_position()[0], -3);
        assert_eq!(board.read_limits(), LimitInputs::X);
        board.set_dirs(StepperMask::empty());
        board.toggle_steps(StepperMask::stepper(0));
        assert!(board.read_limits().is_empty());
    }
}
