//! Runtime settings (`$n=value`) and the checksummed persistent store layout
//! shared by settings, coordinate systems and startup blocks.

use crate::config::{
    AXIS_COUNT, COORD_SYS_COUNT, F_STEP_MAX, RX_BUFFER_SIZE, STARTUP_BLOCKS_COUNT, STEPPER_COUNT,
    TOOL_COUNT,
};
use crate::error::{CncResult, Status};
use serde::{Deserialize, Serialize};

const SETTINGS_VERSION: [u8; 3] = *b"V01";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Highest step frequency the board may be driven at (steps/s).
    pub max_step_rate: f64,
    pub step_invert_mask: u8,
    pub dir_invert_mask: u8,
    pub step_enable_invert: u8,
    pub limits_invert_mask: u8,
    pub probe_invert: bool,
    pub control_invert_mask: u8,
    pub status_report_mask: u8,
    pub g64_angle_factor: f64,
    pub arc_tolerance: f64,
    pub report_inches: bool,
    pub soft_limits_enabled: bool,
    pub hard_limits_enabled: bool,
    pub homing_enabled: bool,
    pub homing_dir_invert_mask: u8,
    pub homing_slow_feed_rate: f64,
    pub homing_fast_feed_rate: f64,
    pub debounce_ms: u16,
    pub homing_offset: f64,
    pub spindle_max_rpm: f64,
    pub spindle_min_rpm: f64,
    pub laser_mode: bool,
    pub step_per_mm: [f64; STEPPER_COUNT],
    pub max_feed_rate: [f64; STEPPER_COUNT],
    pub acceleration: [f64; STEPPER_COUNT],
    pub max_distance: [f64; AXIS_COUNT],
    pub tool_length_offset: [f64; TOOL_COUNT],
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_step_rate: F_STEP_MAX,
            step_invert_mask: 0,
            dir_invert_mask: 0,
            step_enable_invert: 0,
            limits_invert_mask: 0,
            probe_invert: false,
            control_invert_mask: 0,
            status_report_mask: 1,
            g64_angle_factor: 0.2,
            arc_tolerance: 0.002,
            report_inches: false,
            soft_limits_enabled: false,
            hard_limits_enabled: false,
            homing_enabled: false,
            homing_dir_invert_mask: 0,
            homing_slow_feed_rate: 10.0,
            homing_fast_feed_rate: 50.0,
            debounce_ms: 250,
            homing_offset: 2.0,
            spindle_max_rpm: 1000.0,
            spindle_min_rpm: 0.0,
            laser_mode: false,
            step_per_mm: [200.0; STEPPER_COUNT],
            max_feed_rate: [500.0; STEPPER_COUNT],
            acceleration: [10.0; STEPPER_COUNT],
            max_distance: [200.0; AXIS_COUNT],
            tool_length_offset: [0.0; TOOL_COUNT],
        }
    }
}

/// Every `$` id in dump order.
fn setting_ids() -> Vec<u16> {
    let mut ids: Vec<u16> = vec![
        0, 2, 3, 4, 5, 6, 7, 10, 11, 12, 13, 20, 21, 22, 23, 24, 25, 26, 27, 30, 31, 32,
    ];
    ids.extend((0..TOOL_COUNT as u16).map(|t| 41 + t));
    for base in [100u16, 110, 120] {
        ids.extend((0..STEPPER_COUNT as u16).map(|i| base + i));
    }
    ids.extend((0..AXIS_COUNT as u16).map(|i| 130 + i));
    ids
}

fn flag(v: bool) -> f64 {
    if v { 1.0 } else { 0.0 }
}

impl Settings {
    /// Applies `$<id>=<value>`.
    pub fn change(&mut self, id: u16, value: f64) -> CncResult {
        if value < 0.0 {
            return Err(Status::NegativeValue);
        }
        let on = value != 0.0;
        let byte = value as u8;
        match id {
            0 => {
                let rate = 1_000_000.0 / value;
                if rate > F_STEP_MAX {
                    return Err(Status::MaxStepRateExceeded);
                }
                self.max_step_rate = rate;
            }
            2 => self.step_invert_mask = byte,
            3 => self.dir_invert_mask = byte,
            4 => self.step_enable_invert = byte,
            5 => self.limits_invert_mask = byte,
            6 => self.probe_invert = on,
            7 => self.control_invert_mask = byte & 0x0F,
            10 => self.status_report_mask = byte,
            11 => self.g64_angle_factor = value,
            12 => self.arc_tolerance = value,
            13 => self.report_inches = on,
            20 => {
                if on && !self.homing_enabled {
                    return Err(Status::SoftLimitError);
                }
                self.soft_limits_enabled = on;
            }
            21 => self.hard_limits_enabled = on,
            22 => self.homing_enabled = on,
            23 => self.homing_dir_invert_mask = byte,
            24 => self.homing_slow_feed_rate = value,
            25 => self.homing_fast_feed_rate = value,
            26 => self.debounce_ms = value as u16,
            27 => self.homing_offset = value,
            30 => self.spindle_max_rpm = value,
            31 => self.spindle_min_rpm = value,
            32 => self.laser_mode = on,
            _ => {
                let slot = self.indexed_slot(id).ok_or(Status::InvalidStatement)?;
                *slot = value;
            }
        }
        Ok(())
    }

    fn indexed_slot(&mut self, id: u16) -> Option<&mut f64> {
        let id = id as usize;
        match id {
            41..=55 => self.tool_length_offset.get_mut(id - 41),
            100..=109 => self.step_per_mm.get_mut(id - 100),
            110..=119 => self.max_feed_rate.get_mut(id - 110),
            120..=129 => self.acceleration.get_mut(id - 120),
            130..=139 => self.max_distance.get_mut(id - 130),
            _ => None,
        }
    }

    pub fn value(&self, id: u16) -> Option<f64> {
        let v = match id {
            0 => 1_000_000.0 / self.max_step_rate,
            2 => self.step_invert_mask as f64,
            3 => self.dir_invert_mask as f64,
            4 => self.step_enable_invert as f64,
            5 => self.limits_invert_mask as f64,
            6 => flag(self.probe_invert),
            7 => self.control_invert_mask as f64,
            10 => self.status_report_mask as f64,
            11 => self.g64_angle_factor,
            12 => self.arc_tolerance,
            13 => flag(self.report_inches),
            20 => flag(self.soft_limits_enabled),
            21 => flag(self.hard_limits_enabled),
            22 => flag(self.homing_enabled),
            23 => self.homing_dir_invert_mask as f64,
            24 => self.homing_slow_feed_rate,
            25 => self.homing_fast_feed_rate,
            26 => self.debounce_ms as f64,
            27 => self.homing_offset,
            30 => self.spindle_max_rpm,
            31 => self.spindle_min_rpm,
            32 => flag(self.laser_mode),
            _ => {
                let i = id as usize;
                return match i {
                    41..=55 => self.tool_length_offset.get(i - 41).copied(),
                    100..=109 => self.step_per_mm.get(i - 100).copied(),
                    110..=119 => self.max_feed_rate.get(i - 110).copied(),
                    120..=129 => self.acceleration.get(i - 120).copied(),
                    130..=139 => self.max_distance.get(i - 130).copied(),
                    _ => None,
                };
            }
        };
        Some(v)
    }

    /// `(id, value)` pairs for the `$$` dump.
    pub fn entries(&self) -> Vec<(u16, f64)> {
        setting_ids()
            .into_iter()
            .filter_map(|id| self.value(id).map(|v| (id, v)))
            .collect()
    }

    fn to_record(&self) -> Vec<u8> {
        let mut bytes = SETTINGS_VERSION.to_vec();
        for (_, v) in self.entries() {
            bytes.extend_from_slice(&(v as f32).to_le_bytes());
        }
        bytes
    }

    fn from_record(bytes: &[u8]) -> Option<Settings> {
        if bytes.get(..3)? != SETTINGS_VERSION {
            return None;
        }
        let mut s = Settings::default();
        for (n, id) in setting_ids().into_iter().enumerate() {
            let at = 3 + n * 4;
            let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
            s.restore(id, f32::from_le_bytes(raw) as f64);
        }
        Some(s)
    }

    /// Like `change` but without validation, for values read back from the
    /// store.
    fn restore(&mut self, id: u16, value: f64) {
        if id == 0 {
            if value > 0.0 {
                self.max_step_rate = 1_000_000.0 / value;
            }
            return;
        }
        if id == 20 {
            self.soft_limits_enabled = value != 0.0;
            return;
        }
        let _ = self.change(id, value);
    }
}

// ── Persistent store ──────────────────────────────────────────────────

/// Raw non-volatile byte storage (EEPROM or flash emulation).
pub trait SettingsStore {
    fn read(&self, address: usize, buf: &mut [u8]);
    fn write(&mut self, address: usize, data: &[u8]);
    fn flush(&mut self) {}
}

pub const SETTINGS_ADDRESS: usize = 0;
pub const SETTINGS_RECORD_SIZE: usize = 3 + 4 * (22 + TOOL_COUNT + 3 * STEPPER_COUNT + AXIS_COUNT);
pub const PARSER_PARAM_SIZE: usize = 4 * AXIS_COUNT;
pub const PARSER_PARAMS_ADDRESS: usize = SETTINGS_ADDRESS + SETTINGS_RECORD_SIZE + 1;
/// Parameter slot indexes following the coordinate systems.
pub const G28_SLOT: usize = COORD_SYS_COUNT;
pub const G30_SLOT: usize = COORD_SYS_COUNT + 1;
pub const G92_SLOT: usize = COORD_SYS_COUNT + 2;
const PARAM_SLOTS: usize = COORD_SYS_COUNT + 3;
pub const STARTUP_BLOCKS_ADDRESS: usize = PARSER_PARAMS_ADDRESS + PARAM_SLOTS * (PARSER_PARAM_SIZE + 1);
pub const STORE_SIZE: usize = STARTUP_BLOCKS_ADDRESS + STARTUP_BLOCKS_COUNT * (RX_BUFFER_SIZE + 1);

pub fn param_address(slot: usize) -> usize {
    PARSER_PARAMS_ADDRESS + slot * (PARSER_PARAM_SIZE + 1)
}

pub fn startup_block_address(index: usize) -> usize {
    STARTUP_BLOCKS_ADDRESS + index * (RX_BUFFER_SIZE + 1)
}

fn crc7(byte: u8, crc: u8) -> u8 {
    let mut c = byte ^ crc;
    for i in 0..8 {
        if c & 0x80 != 0 {
            c ^= 0x89;
        }
        if i < 7 {
            c <<= 1;
        }
    }
    c
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, b| crc7(*b, crc))
}

/// Reads `buf.len()` bytes and verifies the trailing checksum.
pub fn load(store: &dyn SettingsStore, address: usize, buf: &mut [u8]) -> CncResult {
    store.read(address, buf);
    let mut crc = [0u8];
    store.read(address + buf.len(), &mut crc);
    if checksum(buf) != crc[0] {
        return Err(Status::SettingReadFail);
    }
    Ok(())
}

pub fn save(store: &mut dyn SettingsStore, address: usize, data: &[u8]) {
    store.write(address, data);
    store.write(address + data.len(), &[checksum(data)]);
    store.flush();
}

/// Zeroes a record and its checksum byte. An erased record loads as zeros.
pub fn erase(store: &mut dyn SettingsStore, address: usize, size: usize) {
    store.write(address, &vec![0u8; size + 1]);
    store.flush();
}

pub fn load_settings(store: &dyn SettingsStore) -> CncResult<Settings> {
    let mut buf = vec![0u8; SETTINGS_RECORD_SIZE];
    load(store, SETTINGS_ADDRESS, &mut buf)?;
    Settings::from_record(&buf).ok_or(Status::SettingReadFail)
}

pub fn save_settings(store: &mut dyn SettingsStore, settings: &Settings) {
    save(store, SETTINGS_ADDRESS, &settings.to_record());
}

pub fn load_params(store: &dyn SettingsStore, slot: usize) -> CncResult<[f64; AXIS_COUNT]> {
    let mut buf = [0u8; PARSER_PARAM_SIZE];
    load(store, param_address(slot), &mut buf)?;
    let mut out = [0.0; AXIS_COUNT];
    for (i, chunk) in buf.chunks_exact(4).enumerate() {
        out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64;
    }
    Ok(out)
}

pub fn save_params(store: &mut dyn SettingsStore, slot: usize, values: &[f64; AXIS_COUNT]) {
    let mut buf = Vec::with_capacity(PARSER_PARAM_SIZE);
    for v in values {
        buf.extend_from_slice(&(*v as f32).to_le_bytes());
    }
    save(store, param_address(slot), &buf);
}

pub fn load_startup_block(store: &dyn SettingsStore, index: usize) -> CncResult<String> {
    let mut buf = vec![0u8; RX_BUFFER_SIZE];
    load(store, startup_block_address(index), &mut buf)?;
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

pub fn save_startup_block(store: &mut dyn SettingsStore, index: usize, line: &str) {
    let mut buf = vec![0u8; RX_BUFFER_SIZE];
    let bytes = line.as_bytes();
    let n = bytes.len().min(RX_BUFFER_SIZE - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    save(store, startup_block_address(index), &buf);
}

/// In-memory store used by the simulator and the browser build.
#[derive(Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { bytes: vec![0; STORE_SIZE] }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemoryStore {
    fn read(&self, address: usize, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.bytes.get(address + i).copied().unwrap_or(0);
        }
    }

    fn write(&mut self, address: usize, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            if let Some(slot) = self.bytes.get_mut(address + i) {
                *slot = *b;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) {
        assert!(
            (a - b).abs() <= 1e-3,
            "expected {:.6}, got {:.6} (|diff|={:.6})",
            b,
            a,
            (a - b).abs()
        );
    }

    #[test]
    fn change_rejects_negative_and_unknown_ids() {
        let mut s = Settings::default();
        assert_eq!(s.change(100, -1.0), Err(Status::NegativeValue));
        assert_eq!(s.change(99, 1.0), Err(Status::InvalidStatement));
        assert_eq!(s.change(103, 1.0), Err(Status::InvalidStatement));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn soft_limits_need_homing() {
        let mut s = Settings::default();
        assert_eq!(s.change(20, 1.0), Err(Status::SoftLimitError));
        s.change(22, 1.0).unwrap();
        s.change(20, 1.0).unwrap();
        assert!(s.soft_limits_enabled);
    }

    #[test]
    fn step_pulse_period_maps_to_max_step_rate() {
        let mut s = Settings::default();
        s.change(0, 100.0).unwrap();
        approx_eq(s.max_step_rate, 10_000.0);
        approx_eq(s.value(0).unwrap(), 100.0);
        assert_eq!(s.change(0, 10.0), Err(Status::MaxStepRateExceeded));
    }

    #[test]
    fn indexed_settings_address_each_axis() {
        let mut s = Settings::default();
        s.change(101, 400.0).unwrap();
        s.change(112, 800.0).unwrap();
        s.change(130, 300.0).unwrap();
        s.change(41, 12.5).unwrap();
        approx_eq(s.step_per_mm[1], 400.0);
        approx_eq(s.max_feed_rate[2], 800.0);
        approx_eq(s.max_distance[0], 300.0);
        approx_eq(s.tool_length_offset[0], 12.5);
        assert!(s.entries().iter().any(|(id, v)| *id == 101 && (*v - 400.0).abs() < 1e-9));
    }

    #[test]
    fn settings_survive_store_round_trip() {
        let mut store = MemoryStore::new();
        assert_eq!(load_settings(&store), Err(Status::SettingReadFail));

        let mut s = Settings::default();
        s.change(22, 1.0).unwrap();
        s.change(20, 1.0).unwrap();
        s.change(100, 80.0).unwrap();
        save_settings(&mut store, &s);
        let loaded = load_settings(&store).unwrap();
        assert!(loaded.soft_limits_enabled);
        approx_eq(loaded.step_per_mm[0], 80.0);
    }

    #[test]
    fn corrupted_record_fails_checksum() {
        let mut store = MemoryStore::new();
        save_params(&mut store, 1, &[1.0, 2.0, 3.0]);
        assert_eq!(load_params(&store, 1).unwrap(), [1.0, 2.0, 3.0]);
        store.write(param_address(1), &[0xAA]);
        assert_eq!(load_params(&store, 1), Err(Status::SettingReadFail));
        // Untouched slots read back as zeros.
        assert_eq!(load_params(&store, G92_SLOT).unwrap(), [0.0; AXIS_COUNT]);
    }

    #[test]
    fn startup_blocks_store_and_erase() {
        let mut store = MemoryStore::new();
        save_startup_block(&mut store, 1, "G21 G90");
        assert_eq!(load_startup_block(&store, 1).unwrap(), "G21 G90");
        assert_eq!(load_startup_block(&store, 0).unwrap(), "");
        erase(&mut store, startup_block_address(1), RX_BUFFER_SIZE);
        assert_eq!(load_startup_block(&store, 1).unwrap(), "");
    }
}
