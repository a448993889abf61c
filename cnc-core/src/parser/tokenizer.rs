//! Word scanner for one command line.
//!
//! Spaces are ignored everywhere, including inside numbers. Comments in
//! parentheses are skipped; a `(MSG,...)` comment is kept as an operator
//! message. A `;` ends the line.

use crate::error::{CncResult, Status};

/// A letter and its value, e.g. `G38.2` or `X-1.5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    pub letter: u8,
    pub value: f64,
    /// The number carried a decimal point.
    pub is_float: bool,
}

impl Word {
    /// Integer part of a G or M code. Negative codes are rejected before
    /// this is read.
    pub fn code(&self) -> u16 {
        self.value.trunc() as u16
    }

    /// Hundredths after the code, `38.2` gives 20.
    pub fn mantissa(&self) -> u8 {
        ((self.value - self.value.trunc()).abs() * 100.0).round() as u8
    }
}

pub struct Tokenizer<'a> {
    bytes: &'a [u8],
    pos: usize,
    message: Option<String>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(line: &'a str) -> Self {
        Tokenizer { bytes: line.as_bytes(), pos: 0, message: None }
    }

    /// Operator message from a `(MSG,...)` comment.
    pub fn take_message(&mut self) -> Option<String> {
        self.message.take()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Skips blanks and comments.
    fn skip_blank(&mut self) -> CncResult {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'(' => self.comment()?,
                b';' => self.pos = self.bytes.len(),
                _ => break,
            }
        }
        Ok(())
    }

    fn comment(&mut self) -> CncResult {
        self.pos += 1;
        let start = self.pos;
        let Some(len) = self.bytes[start..].iter().position(|c| *c == b')') else {
            return Err(Status::BadCommentFormat);
        };
        self.pos = start + len + 1;

        let body = String::from_utf8_lossy(&self.bytes[start..start + len]);
        let trimmed = body.trim_start();
        if trimmed.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("MSG,")) {
            self.message = Some(trimmed[4..].to_string());
        }
        Ok(())
    }

    /// Next word, or `None` at the end of the line.
    pub fn next_word(&mut self) -> CncResult<Option<Word>> {
        self.skip_blank()?;
        let Some(c) = self.peek() else {
            return Ok(None);
        };
        self.pos += 1;
        let letter = c.to_ascii_uppercase();
        if !letter.is_ascii_uppercase() {
            return Err(Status::ExpectedCommandLetter);
        }
        let (value, is_float) = self.number()?;
        Ok(Some(Word { letter, value, is_float }))
    }

    /// Fixed-point number: optional sign, digits and at most one dot.
    pub fn number(&mut self) -> CncResult<(f64, bool)> {
        self.skip_blank()?;
        let mut negative = false;
        match self.peek() {
            Some(b'-') => {
                negative = true;
                self.pos += 1;
            }
            Some(b'+') => self.pos += 1,
            _ => {}
        }

        let mut mantissa: u64 = 0;
        let mut digits = 0;
        let mut decimals: Option<i32> = None;
        loop {
            self.skip_blank()?;
            match self.peek() {
                Some(c @ b'0'..=b'9') => {
                    mantissa = mantissa
                        .checked_mul(10)
                        .and_then(|m| m.checked_add((c - b'0') as u64))
                        .ok_or(Status::BadNumberFormat)?;
                    digits += 1;
                    if let Some(d) = decimals.as_mut() {
                        *d += 1;
                    }
                }
                Some(b'.') if decimals.is_none() => decimals = Some(0),
                _ => break,
            }
            self.pos += 1;
        }

        if digits == 0 {
            return Err(Status::BadNumberFormat);
        }
        let mut value = mantissa as f64 / 10f64.powi(decimals.unwrap_or(0));
        if negative {
            value = -value;
        }
        Ok((value, decimals.is_some()))
    }

    /// True once only blanks and comments remain.
    pub fn at_end(&mut self) -> CncResult<bool> {
        self.skip_blank()?;
        Ok(self.peek().is_none())
    }

    /// The unread rest of the line.
    pub fn rest(&self) -> &'a str {
        std::str::from_utf8(&self.bytes[self.pos..]).unwrap_or("")
    }

    /// Consumes `c` if it is the next non-blank byte.
    pub fn accept(&mut self, c: u8) -> CncResult<bool> {
        self.skip_blank()?;
        if self.peek().map(|p| p.to_ascii_uppercase()) == Some(c) {
            self.pos += 1;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> CncResult<Vec<(char, f64)>> {
        let mut t = Tokenizer::new(line);
        let mut out = Vec::new();
        while let Some(w) = t.next_word()? {
            out.push((w.letter as char, w.value));
        }
        Ok(out)
    }

    #[test]
    fn splits_words_ignoring_case_and_spaces() {
        let w = words("g1 x 1 0.5 y-2 f1 00").unwrap();
        assert_eq!(w, vec![('G', 1.0), ('X', 10.5), ('Y', -2.0), ('F', 100.0)]);
    }

    #[test]
    fn comments_are_skipped_and_messages_kept() {
        let mut t = Tokenizer::new("G0 (move) X1 (MSG, tool change) ; trailing");
        let mut letters = Vec::new();
        while let Some(w) = t.next_word().unwrap() {
            letters.push(w.letter);
        }
        assert_eq!(letters, b"GX");
        assert_eq!(t.take_message().as_deref(), Some(" tool change"));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(words("G0 (open"), Err(Status::BadCommentFormat));
        assert_eq!(words("G0 X"), Err(Status::BadNumberFormat));
        assert_eq!(words("G0 X1..2"), Err(Status::ExpectedCommandLetter));
        assert_eq!(words("1G0"), Err(Status::ExpectedCommandLetter));
    }

    #[test]
    fn code_and_mantissa_split_at_the_dot() {
        let mut t = Tokenizer::new("G38.2 G61.1 G1");
        let a = t.next_word().unwrap().unwrap();
        assert_eq!((a.code(), a.mantissa(), a.is_float), (38, 20, true));
        let b = t.next_word().unwrap().unwrap();
        assert_eq!((b.code(), b.mantissa()), (61, 10));
        let c = t.next_word().unwrap().unwrap();
        assert_eq!((c.code(), c.mantissa(), c.is_float), (1, 0, false));
    }
}
