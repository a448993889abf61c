use serde::Serialize;
use wasm_bindgen::prelude::*;

// --- LOGGING ---
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

#[cfg(not(target_arch = "wasm32"))]
fn log(_s: &str) {}

#[cfg(target_arch = "wasm32")]
fn warn(s: &str) {
    web_sys::console::warn_1(&JsValue::from_str(s));
}

#[cfg(not(target_arch = "wasm32"))]
fn warn(_s: &str) {}

macro_rules! console_log {
    ($($t:tt)*) => ($crate::log(&format!($($t)*)))
}

macro_rules! console_warn {
    ($($t:tt)*) => ($crate::warn(&format!($($t)*)))
}

pub mod config;
pub mod error;
pub mod flags;
pub mod settings;
pub mod hal;
pub mod kinematics;
pub mod protocol;
pub mod planner;
pub mod interpolator;
pub mod motion;
pub mod parser;
pub mod cnc;
pub mod sim;

use crate::cnc::Cnc;
use crate::config::AXIS_COUNT;
use crate::flags::{ControlInputs, LimitInputs};
use crate::hal::CommandSource;
use crate::kinematics::AxisVec;
use crate::planner::Overrides;
use crate::protocol::state_name;
use crate::settings::Settings;
use crate::sim::SimBoard;

#[derive(Serialize)]
pub struct ControllerState {
    pub state: String,
    pub exec: u16,
    pub alarm: Option<i8>,
    pub machine_position: AxisVec,
    pub work_position: AxisVec,
    pub feed: f64,
    pub spindle: f64,
    pub coolant: u8,
    pub overrides: Overrides,
    pub modes: String,
    pub planner_blocks: usize,
    pub line: u32,
}

/// Browser-facing controller running on the simulated board.
#[wasm_bindgen]
pub struct CncController {
    cnc: Cnc<SimBoard>,
}

#[wasm_bindgen]
impl CncController {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Result<CncController, JsValue> {
        let cnc = Cnc::new(SimBoard::new()).map_err(|e| JsValue::from_str(&e.to_string()))?;
        console_log!("cnc core {} ready", crate::config::CORE_VERSION);
        Ok(CncController { cnc })
    }

    /// Runs a command line and returns everything the controller wrote
    /// while doing so. Real-time bytes inside the line are split off.
    pub fn send_line(&mut self, line: &str) -> Vec<String> {
        self.cnc.board.push_line(line);
        while !self.cnc.board.is_empty() {
            self.cnc.run_once();
        }
        self.cnc.board.take_output()
    }

    /// Queues a command line without running it.
    pub fn queue_line(&mut self, line: &str) {
        self.cnc.board.push_line(line);
    }

    pub fn realtime(&mut self, byte: u8) {
        self.cnc.board.push_bytes(&[byte]);
    }

    // ── Tick ──────────────────────────────────────────────────────────────

    /// Runs `iterations` passes of the main loop. Each pass advances the
    /// simulated clock by at least one millisecond.
    pub fn tick(&mut self, iterations: u32) {
        for _ in 0..iterations {
            self.cnc.run_once();
        }
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.cnc.board.take_output()
    }

    pub fn set_inputs(&mut self, limits: u8, controls: u8, probe: bool) {
        self.cnc.board.set_inputs(LimitInputs::from_bits_truncate(limits), ControlInputs::from_bits_truncate(controls), probe);
    }

    pub fn get_full_state(&self) -> JsValue {
        serde_wasm_bindgen::to_value(&self.snapshot()).unwrap_or(JsValue::NULL)
    }

    pub fn get_settings(&self) -> JsValue {
        serde_wasm_bindgen::to_value(&self.cnc.settings).unwrap_or(JsValue::NULL)
    }

    /// Replaces the settings record and persists it.
    pub fn load_settings(&mut self, value: JsValue) -> Result<(), JsValue> {
        let settings: Settings = serde_wasm_bindgen::from_value(value)?;
        self.apply_settings(settings);
        Ok(())
    }
}

impl CncController {
    pub fn snapshot(&self) -> ControllerState {
        let cnc = &self.cnc;
        let machine = cnc.rt_machine_position();
        let wco = cnc.parser.work_offset();
        let mut work = machine;
        for i in 0..AXIS_COUNT {
            work[i] -= wco[i];
        }
        ControllerState {
            state: state_name(cnc.exec, cnc.read_controls(), cnc.mc.checkmode, cnc.alarm.is_some()),
            exec: cnc.exec.bits(),
            alarm: cnc.alarm.map(|a| a.code()),
            machine_position: machine,
            work_position: work,
            feed: cnc.rt_feed(),
            spindle: cnc.tool.speed,
            coolant: cnc.tool.coolant.bits(),
            overrides: cnc.planner.overrides(),
            modes: cnc.parser.modal.describe(),
            planner_blocks: cnc.planner.len(),
            line: cnc.stepper.line(),
        }
    }

    fn apply_settings(&mut self, settings: Settings) {
        settings::save_settings(&mut self.cnc.board, &settings);
        self.cnc.settings = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) {
        assert!(
            (a - b).abs() <= 1e-6,
            "expected {:.6}, got {:.6} (|diff|={:.6})",
            b,
            a,
            (a - b).abs()
        );
    }

    fn idle_controller() -> CncController {
        let mut ctl = CncController::new().unwrap();
        ctl.tick(2);
        ctl.take_output();
        ctl
    }

    fn run_until_idle(ctl: &mut CncController) {
        for _ in 0..20_000 {
            ctl.tick(1);
            let cnc = &ctl.cnc;
            if cnc.board.is_empty() && cnc.exec.is_empty() && cnc.planner.is_empty() && cnc.itp_is_empty() {
                return;
            }
        }
        panic!("machine did not settle");
    }

    #[test]
    fn boots_with_banner_and_answers_ok() {
        let mut ctl = CncController::new().unwrap();
        ctl.tick(1);
        let out = ctl.take_output();
        assert!(out.iter().any(|l| l.starts_with("Grbl")), "missing banner: {:?}", out);

        assert_eq!(ctl.send_line("G21"), vec!["ok".to_string()]);
        assert_eq!(ctl.send_line("G0 X1 Y"), vec!["error:2".to_string()]);
    }

    #[test]
    fn line_moves_and_snapshot_reports_positions() {
        let mut ctl = idle_controller();
        ctl.queue_line("G10 L2 P1 X1");
        ctl.queue_line("G1 X5 Y-2 F600");
        run_until_idle(&mut ctl);
        let out = ctl.take_output();
        assert_eq!(out.iter().filter(|l| *l == "ok").count(), 2, "{:?}", out);

        let state = ctl.snapshot();
        assert_eq!(state.state, "Idle");
        approx_eq(state.machine_position[0], 6.0);
        approx_eq(state.machine_position[1], -2.0);
        approx_eq(state.work_position[0], 5.0);
        assert_eq!(state.planner_blocks, 0);
        assert_eq!(state.modes, "G1 G17 G90 G94 G21 G49 G54 G64 M5 M9 M48 T0 F600 S0");
    }

    #[test]
    fn snapshot_serializes_for_the_ui() {
        let ctl = idle_controller();
        let json = serde_json::to_value(ctl.snapshot()).unwrap();
        assert_eq!(json["state"], "Idle");
        assert_eq!(json["exec"], 0);
        assert!(json["alarm"].is_null());
        assert_eq!(json["overrides"]["feed"], 100);
        assert_eq!(json["machine_position"].as_array().map(|a| a.len()), Some(AXIS_COUNT));
    }

    #[test]
    fn realtime_bytes_reach_the_controller() {
        let mut ctl = idle_controller();
        ctl.realtime(b'?');
        ctl.tick(1);
        let out = ctl.take_output();
        assert!(out.iter().any(|l| l.starts_with("<Idle|")), "{:?}", out);

        ctl.realtime(0x91);
        ctl.tick(1);
        assert_eq!(ctl.snapshot().overrides.feed, 110);
    }

    #[test]
    fn estop_input_raises_alarm_and_blocks_gcode() {
        let mut ctl = idle_controller();
        ctl.set_inputs(0, ControlInputs::ESTOP.bits(), false);
        ctl.tick(3);
        assert_eq!(ctl.snapshot().alarm, Some(-1));

        let out = ctl.send_line("G0 X1");
        assert!(out.iter().any(|l| l == "[MSG:Check Emergency stop]"), "{:?}", out);
    }

    #[test]
    fn settings_changes_persist_in_the_store() {
        let mut ctl = idle_controller();
        let mut settings = ctl.cnc.settings.clone();
        settings.max_feed_rate[0] = 1234.0;
        ctl.apply_settings(settings);
        let stored = settings::load_settings(&ctl.cnc.board).unwrap();
        approx_eq(stored.max_feed_rate[0], 1234.0);
    }
}
