//! Whole-block checks that need every word of the line.

use super::{FeedMode, GroupMask, MotionMode, NonModal, ParsedBlock, ToolLengthMode, WordMask};
use crate::config::{COORD_SYS_COUNT, TOOL_COUNT};
use crate::error::{CncResult, Status};

impl ParsedBlock {
    pub fn validate(&mut self, jog: bool) -> CncResult {
        let groups = self.cmd.groups;
        let words = self.cmd.words;

        if jog {
            let allowed = GroupMask::DISTANCE | GroupMask::UNITS | GroupMask::NONMODAL;
            if groups.intersects(!allowed)
                || !matches!(self.cmd.nonmodal, NonModal::None | NonModal::AbsoluteOverride)
                || words.intersects(!(WordMask::AXES | WordMask::F | WordMask::N))
            {
                return Err(Status::InvalidJogCommand);
            }
            if !words.contains(WordMask::F) {
                return Err(Status::UndefinedFeedRate);
            }
            self.state.motion = MotionMode::Linear;
            self.state.feed_mode = FeedMode::UnitsPerMinute;
            self.cmd.groups.insert(GroupMask::MOTION);
        }

        match self.cmd.nonmodal {
            NonModal::SetParams => {
                if !words.contains(WordMask::L | WordMask::P) {
                    return Err(Status::ValueWordMissing);
                }
                if !matches!(self.words.l, 2 | 20) {
                    return Err(Status::UnsupportedCommand);
                }
                if self.words.p.fract() != 0.0 {
                    return Err(Status::ValueNotInteger);
                }
                if self.words.p as usize > COORD_SYS_COUNT {
                    return Err(Status::UnsupportedCoordSys);
                }
                if !words.intersects(WordMask::AXES) {
                    return Err(Status::NoAxisWords);
                }
            }
            NonModal::SetOffset => {
                if !words.intersects(WordMask::AXES) {
                    return Err(Status::NoAxisWords);
                }
            }
            NonModal::Dwell => {
                if !words.contains(WordMask::P) {
                    return Err(Status::ValueWordMissing);
                }
            }
            NonModal::AbsoluteOverride => {
                if !matches!(self.state.motion, MotionMode::Seek | MotionMode::Linear) {
                    return Err(Status::G53InvalidMotionMode);
                }
            }
            _ => {}
        }

        if self.moves() {
            self.validate_motion()?;
        }

        if groups.contains(GroupMask::TOOL_LENGTH)
            && self.state.tool_length == ToolLengthMode::Dynamic
            && !words.contains(WordMask::Z)
        {
            return Err(Status::G43DynamicAxisError);
        }

        if words.contains(WordMask::T) && self.words.t as usize > TOOL_COUNT {
            return Err(Status::InvalidTool);
        }
        Ok(())
    }

    fn validate_motion(&self) -> CncResult {
        let words = self.cmd.words;
        let has_axes = words.intersects(WordMask::AXES);
        match self.state.motion {
            MotionMode::Cancel => {
                if has_axes {
                    return Err(Status::AxisWordsExist);
                }
            }
            MotionMode::Probe(_) => {
                if !has_axes {
                    return Err(Status::NoAxisWords);
                }
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                let (a, b) = self.state.plane.axes();
                if !words.intersects(WordMask::axis(a) | WordMask::axis(b)) {
                    return Err(Status::NoAxisWordsInPlane);
                }
                if !words.intersects(WordMask::offset(a) | WordMask::offset(b) | WordMask::R) {
                    return Err(Status::NoOffsetsInPlane);
                }
            }
            MotionMode::Seek | MotionMode::Linear => {}
        }

        if matches!(self.state.motion, MotionMode::Linear | MotionMode::CwArc | MotionMode::CcwArc) {
            if words.contains(WordMask::F) {
                if self.words.f <= 0.0 {
                    return Err(Status::UndefinedFeedRate);
                }
            } else if self.state.feed_mode == FeedMode::InverseTime && has_axes {
                return Err(Status::UndefinedFeedRate);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ModalState, parse_block};
    use super::*;

    fn check(line: &str) -> CncResult {
        parse_block(line, &ModalState::default())?.validate(false)
    }

    #[test]
    fn non_modal_codes_need_their_words() {
        assert_eq!(check("G4"), Err(Status::ValueWordMissing));
        assert_eq!(check("G10 L2 X1"), Err(Status::ValueWordMissing));
        assert_eq!(check("G10 L3 P1 X1"), Err(Status::UnsupportedCommand));
        assert_eq!(check("G10 L2 P7 X1"), Err(Status::UnsupportedCoordSys));
        assert_eq!(check("G10 L20 P1"), Err(Status::NoAxisWords));
        assert_eq!(check("G92"), Err(Status::NoAxisWords));
        assert_eq!(check("G53 G2 X1 R1"), Err(Status::G53InvalidMotionMode));
        assert!(check("G10 L20 P0 X0").is_ok());
        assert!(check("G4 P0.5").is_ok());
    }

    #[test]
    fn arcs_need_plane_words_and_a_center() {
        assert_eq!(check("G2 Z1 I1"), Err(Status::NoAxisWordsInPlane));
        assert_eq!(check("G2 X1 K1"), Err(Status::NoOffsetsInPlane));
        assert_eq!(check("G18 G2 X1 K1 F10"), Ok(()));
        assert!(check("G3 X1 R2 F10").is_ok());
    }

    #[test]
    fn feed_rules() {
        assert_eq!(check("G1 X1 F0"), Err(Status::UndefinedFeedRate));
        assert_eq!(check("G93 G1 X1"), Err(Status::UndefinedFeedRate));
        // No feed programmed yet is an execution error, not a word error.
        assert!(check("G1 X1").is_ok());
        assert!(check("G0 X1").is_ok());
    }

    #[test]
    fn other_motion_rules() {
        assert_eq!(check("G80 X1"), Err(Status::AxisWordsExist));
        assert_eq!(check("G38.2 F10"), Err(Status::NoAxisWords));
        assert_eq!(check("G43.1"), Err(Status::G43DynamicAxisError));
        assert_eq!(check("T2"), Err(Status::InvalidTool));
        assert!(check("T1").is_ok());
        assert!(check("G80 G92 X1").is_ok());
    }

    #[test]
    fn jog_lines_are_restricted() {
        let jog = |line: &str| parse_block(line, &ModalState::default()).and_then(|mut b| {
            b.validate(true)?;
            Ok(b)
        });
        let block = jog("G91 X10 F100").unwrap();
        assert_eq!(block.state.motion, MotionMode::Linear);
        assert_eq!(jog("G91 X10"), Err(Status::UndefinedFeedRate));
        assert_eq!(jog("G1 X10 F100"), Err(Status::InvalidJogCommand));
        assert_eq!(jog("G91 X10 F100 M3"), Err(Status::InvalidJogCommand));
        assert_eq!(jog("G4 P1 F10"), Err(Status::InvalidJogCommand));
        assert!(jog("G53 X1 F100").is_ok());
    }
}
