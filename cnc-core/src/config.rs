//! Compile-time machine configuration.
//!
//! Runtime-tunable values live in [`crate::settings::Settings`]; everything
//! here sizes buffers or fixes protocol constants.

pub const AXIS_COUNT: usize = 3;
pub const STEPPER_COUNT: usize = 3;
pub const AXIS_LETTERS: [char; AXIS_COUNT] = ['X', 'Y', 'Z'];
pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;

// ── Buffers ───────────────────────────────────────────────────────────
pub const PLANNER_BUFFER_SIZE: usize = 20;
pub const INTERPOLATOR_BUFFER_SIZE: usize = 5;
pub const RX_BUFFER_SIZE: usize = 128;

// ── Step generation ───────────────────────────────────────────────────
/// Segment rate of the interpolator in Hz.
pub const INTERPOLATOR_FREQ: f64 = 100.0;
pub const INTERPOLATOR_DELTA_T: f64 = 1.0 / INTERPOLATOR_FREQ;
pub const DSS_MAX_OVERSAMPLING: u8 = 3;
pub const DSS_CUTOFF_FREQ: f64 = 500.0;
pub const F_STEP_MAX: f64 = 30_000.0;
pub const F_STEP_MIN: f64 = 4.0;
/// Largest dominant step count a single planner block may carry. Longer
/// lines are split so the doubled Bresenham counters never overflow.
pub const MAX_STEPS_PER_LINE: u32 = 1 << (32 - (2 + DSS_MAX_OVERSAMPLING as u32));

// ── Overrides (percent) ───────────────────────────────────────────────
pub const FEED_OVR_MIN: u8 = 10;
pub const FEED_OVR_MAX: u8 = 200;
pub const FEED_OVR_COARSE: i16 = 10;
pub const FEED_OVR_FINE: i16 = 1;
pub const RAPID_FEED_OVR1: u8 = 50;
pub const RAPID_FEED_OVR2: u8 = 25;
pub const SPINDLE_OVR_MIN: u8 = 10;
pub const SPINDLE_OVR_MAX: u8 = 200;
pub const SPINDLE_OVR_COARSE: i16 = 10;
pub const SPINDLE_OVR_FINE: i16 = 1;

// ── Parser ────────────────────────────────────────────────────────────
pub const COORD_SYS_COUNT: usize = 6;
pub const TOOL_COUNT: usize = 1;
pub const STARTUP_BLOCKS_COUNT: usize = 2;
pub const ARC_TOLERANCE_CHECK: f64 = 0.002;
pub const N_ARC_CORRECTION: u16 = 12;
/// Seconds to wait after a spindle speed or direction change.
pub const DELAY_ON_SPINDLE_SPEED_CHANGE: f64 = 1.0;
pub const INCH_MM_MULT: f64 = 25.4;
pub const MM_INCH_MULT: f64 = 1.0 / INCH_MM_MULT;
pub const MIN_SEC_MULT: f64 = 1.0 / 60.0;

// ── Reporting ─────────────────────────────────────────────────────────
pub const STATUS_WCO_REPORT_MIN_FREQUENCY: u8 = 30;
pub const STATUS_FEED_OVR_REPORT_MIN_FREQUENCY: u8 = STATUS_WCO_REPORT_MIN_FREQUENCY;
pub const GRBL_VERSION: &str = "1.1f";
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
