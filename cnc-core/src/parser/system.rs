//! Grbl `$` commands.

use super::{Tokenizer, parse_block};
use crate::cnc::{Cnc, UnlockResult};
use crate::config::{AXIS_COUNT, COORD_SYS_COUNT, STARTUP_BLOCKS_COUNT};
use crate::error::{CncResult, Status};
use crate::flags::ExecState;
use crate::hal::Board;
use crate::protocol::{Feedback, HELP_MESSAGE};
use crate::settings::{self, G28_SLOT, G30_SLOT, G92_SLOT, PARSER_PARAM_SIZE, Settings};

impl<B: Board> Cnc<B> {
    /// Runs the text after the `$`.
    pub(crate) fn system_command(&mut self, command: &str) -> CncResult {
        let head = command.trim();
        let upper = head.to_ascii_uppercase();
        let jogging = upper.starts_with("J=") && self.exec.contains(ExecState::JOG);
        if self.exec.contains(ExecState::RUN) && !jogging {
            return Err(Status::IdleError);
        }

        match upper.as_str() {
            "" => {
                self.send_line(HELP_MESSAGE);
                return Ok(());
            }
            "$" => {
                self.send_settings();
                return Ok(());
            }
            "#" => {
                self.send_coordinates();
                return Ok(());
            }
            "G" => {
                self.send_modes();
                return Ok(());
            }
            "N" => {
                self.send_startup_blocks();
                return Ok(());
            }
            "C" => {
                if self.mc_toggle_checkmode() {
                    self.send_feedback(Feedback::Enabled);
                } else {
                    self.cnc_stop();
                    self.alarm(crate::error::Alarm::SoftReset);
                    self.send_feedback(Feedback::Disabled);
                }
                return Ok(());
            }
            "X" => return self.system_unlock(),
            "H" => return self.system_home(),
            "RST=$" | "RST=#" | "RST=*" => {
                self.system_restore(&upper[4..]);
                return Ok(());
            }
            _ => {}
        }

        if let Some(line) = head.get(2..).filter(|_| upper.starts_with("J=")) {
            return self.system_jog(line);
        }
        if upper.starts_with('N') {
            return self.system_startup_block(&head[1..]);
        }
        if upper.starts_with(|c: char| c.is_ascii_digit()) {
            return self.system_setting(head);
        }
        Err(Status::InvalidStatement)
    }

    fn system_unlock(&mut self) -> CncResult {
        let result = self.unlock(true);
        if self.exec.contains(ExecState::DOOR) {
            return Err(Status::CheckDoor);
        }
        if result == UnlockResult::Ok {
            self.send_feedback(Feedback::Unlocked);
        }
        Ok(())
    }

    fn system_home(&mut self) -> CncResult {
        if !self.settings.homing_enabled {
            return Err(Status::SettingDisabled);
        }
        self.unlock(true);
        if self.exec.contains(ExecState::DOOR) {
            return Err(Status::CheckDoor);
        }
        if let Err(status) = self.mc_home() {
            self.exec.remove(ExecState::HOMING);
            if self.alarm.is_none() {
                return Err(status);
            }
            return Ok(());
        }
        self.run_startup_blocks();
        Ok(())
    }

    fn system_jog(&mut self, line: &str) -> CncResult {
        if self.exec.intersects(ExecState::ALL_ACTIVE) && !self.exec.contains(ExecState::JOG) {
            return Err(Status::IdleError);
        }
        self.exec.insert(ExecState::JOG);
        if self.exec.intersects(!(ExecState::JOG | ExecState::RUN)) || self.has_alarm() {
            return Err(Status::SystemGcLock);
        }
        self.gcode_line(line, true)
    }

    /// `$Nn=line`. The block must pass the parser before it is stored.
    fn system_startup_block(&mut self, rest: &str) -> CncResult {
        let mut tokens = Tokenizer::new(rest);
        let (index, is_float) = tokens.number().map_err(|_| Status::InvalidStatement)?;
        if is_float || index < 0.0 || index as usize >= STARTUP_BLOCKS_COUNT {
            return Err(Status::InvalidStatement);
        }
        if !tokens.accept(b'=')? {
            return Err(Status::InvalidStatement);
        }
        let block = tokens.rest().trim();
        if !block.is_empty() {
            parse_block(block, &self.parser.modal)?.validate(false)?;
        }
        settings::save_startup_block(&mut self.board, index as usize, block);
        Ok(())
    }

    /// `$id=value`.
    fn system_setting(&mut self, text: &str) -> CncResult {
        let mut tokens = Tokenizer::new(text);
        let (id, is_float) = tokens.number().map_err(|_| Status::InvalidStatement)?;
        if is_float || id < 0.0 || id > 255.0 {
            return Err(Status::InvalidStatement);
        }
        if !tokens.accept(b'=')? {
            return Err(Status::InvalidStatement);
        }
        let (value, _) = tokens.number()?;
        if !tokens.at_end()? {
            return Err(Status::InvalidStatement);
        }
        self.settings.change(id as u16, value)?;
        settings::save_settings(&mut self.board, &self.settings);
        Ok(())
    }

    /// `$RST=$` settings, `$RST=#` coordinate parameters, `$RST=*` both
    /// plus the startup blocks.
    fn system_restore(&mut self, what: &str) {
        console_log!("restoring defaults ({})", what);
        if matches!(what, "$" | "*") {
            self.settings = Settings::default();
            settings::save_settings(&mut self.board, &self.settings);
        }
        if matches!(what, "#" | "*") {
            for slot in (0..COORD_SYS_COUNT).chain([G28_SLOT, G30_SLOT, G92_SLOT]) {
                settings::erase(&mut self.board, settings::param_address(slot), PARSER_PARAM_SIZE);
            }
            self.parser.coord_offset = [0.0; AXIS_COUNT];
            self.parser.g92_offset = [0.0; AXIS_COUNT];
            self.parser.g92_saved = [0.0; AXIS_COUNT];
            self.parser.wco_counter = 0;
        }
        if what == "*" {
            for i in 0..STARTUP_BLOCKS_COUNT {
                settings::save_startup_block(&mut self.board, i, "");
            }
        }
        self.send_feedback(Feedback::RestoringDefaults);
    }
}
