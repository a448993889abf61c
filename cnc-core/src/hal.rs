//! Board-facing contracts. Everything the controller needs from pins,
//! timers, the command channel and storage goes through these traits.

use crate::config::RX_BUFFER_SIZE;
use crate::flags::{ControlInputs, Coolant, LimitInputs, StepperMask};
use crate::protocol::ReportSink;
use crate::settings::SettingsStore;
use std::collections::VecDeque;

/// Pin, timer and tool outputs of the board.
pub trait IoPort {
    /// Switches every driver on. `invert` holds the enable pins that are
    /// active low.
    fn enable_steppers(&mut self, invert: StepperMask);
    fn disable_steppers(&mut self);
    /// Drives step pins to the given level mask.
    fn set_steps(&mut self, mask: StepperMask);
    fn toggle_steps(&mut self, mask: StepperMask);
    fn set_dirs(&mut self, mask: StepperMask);

    /// Raw pin levels; the controller applies the invert masks.
    fn read_limits(&self) -> LimitInputs;
    fn read_controls(&self) -> ControlInputs;
    fn read_probe(&self) -> bool;
    fn enable_probe(&mut self);
    fn disable_probe(&mut self);

    fn start_step_timer(&mut self, freq: f64);
    fn change_step_timer(&mut self, freq: f64);
    fn stop_step_timer(&mut self);
    /// Timer periods elapsed since the previous call.
    fn pending_step_ticks(&mut self) -> u32;

    fn millis(&self) -> u64;
    /// Services the board once (transport, clocks).
    fn poll(&mut self);

    /// Signed speed, negative for counter-clockwise. `pwm` is the 0..255
    /// duty derived from the configured rpm range.
    fn set_spindle(&mut self, speed: f64, pwm: u8);
    fn set_coolant(&mut self, coolant: Coolant);
}

/// A byte channel delivering command lines. Real-time control bytes are
/// separated from the line stream before they reach the parser.
pub trait CommandSource {
    fn peek(&self) -> Option<u8>;
    fn get(&mut self) -> Option<u8>;
    /// Puts back the byte returned by the last `get`.
    fn unget(&mut self);
    /// True when no complete line is waiting.
    fn is_empty(&self) -> bool;
    fn clear(&mut self);
    /// Next pending real-time byte, if any.
    fn take_realtime(&mut self) -> Option<u8>;
    fn free_bytes(&self) -> usize {
        RX_BUFFER_SIZE
    }
}

/// Bytes that bypass the line buffer.
pub fn is_realtime_byte(c: u8) -> bool {
    matches!(c, 0x18 | b'!' | b'?' | b'~' | 0x84 | 0x85 | 0x90..=0x97 | 0x99..=0x9E | 0xA0 | 0xA1)
}

/// In-memory command channel. Incoming bytes are split into line bytes
/// and real-time bytes as they arrive, the way a UART receive interrupt
/// would.
#[derive(Default)]
pub struct LineBuffer {
    rx: VecDeque<u8>,
    realtime: VecDeque<u8>,
    last: Option<u8>,
    lines: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &c in bytes {
            if is_realtime_byte(c) {
                self.realtime.push_back(c);
                continue;
            }
            let c = if c == b'\r' { b'\n' } else { c };
            if c == b'\n' {
                self.lines += 1;
            }
            self.rx.push_back(c);
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.push_bytes(line.as_bytes());
        self.push_bytes(b"\n");
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl CommandSource for LineBuffer {
    fn peek(&self) -> Option<u8> {
        if self.lines == 0 && self.rx.len() < RX_BUFFER_SIZE {
            return None;
        }
        self.rx.front().copied()
    }

    fn get(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.rx.pop_front();
        if c == b'\n' {
            self.lines -= 1;
        }
        self.last = Some(c);
        Some(c)
    }

    fn unget(&mut self) {
        if let Some(c) = self.last.take() {
            if c == b'\n' {
                self.lines += 1;
            }
            self.rx.push_front(c);
        }
    }

    fn is_empty(&self) -> bool {
        self.peek().is_none()
    }

    fn clear(&mut self) {
        self.rx.clear();
        self.lines = 0;
        self.last = None;
    }

    fn take_realtime(&mut self) -> Option<u8> {
        self.realtime.pop_front()
    }

    fn free_bytes(&self) -> usize {
        RX_BUFFER_SIZE.saturating_sub(self.rx.len())
    }
}

/// Everything a controller instance needs from its host.
pub trait Board: IoPort + CommandSource + SettingsStore + ReportSink {}

impl<T: IoPort + CommandSource + SettingsStore + ReportSink> Board for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_bytes_are_split_from_lines() {
        let mut buf = LineBuffer::new();
        buf.push_bytes(b"G1?X1\x85");
        assert!(buf.is_empty());
        assert_eq!(buf.take_realtime(), Some(b'?'));
        assert_eq!(buf.take_realtime(), Some(0x85));
        assert_eq!(buf.take_realtime(), None);
        buf.push_bytes(b"\r");
        let mut line = Vec::new();
        while let Some(c) = buf.get() {
            line.push(c);
            if c == b'\n' {
                break;
            }
        }
        assert_eq!(line, b"G1X1\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn unget_restores_last_byte() {
        let mut buf = LineBuffer::new();
        buf.push_line("AB");
        assert_eq!(buf.get(), Some(b'A'));
        buf.unget();
        assert_eq!(buf.peek(), Some(b'A'));
        assert_eq!(buf.pending(), 3);
    }
}
