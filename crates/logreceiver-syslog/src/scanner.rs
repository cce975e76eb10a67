//! Byte cursor with the primitive token readers used by the parser.

use crate::error::{ParseError, Result};

pub(crate) const SP: u8 = b' ';
pub(crate) const NIL: u8 = b'-';

/// Read position over one datagram.
pub(crate) struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    pub(crate) fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    pub(crate) fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.input.get(self.pos + ahead).copied()
    }

    pub(crate) fn next(&mut self) -> Result<u8> {
        match self.peek() {
            Some(b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(ParseError::syntax(self.pos, "Premature end of input")),
        }
    }

    pub(crate) fn consume(&mut self, expected: u8) -> Result<()> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError::syntax(
                self.pos,
                format!("Expected '{}'", expected as char),
            ))
        }
    }

    pub(crate) fn maybe_consume(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consumes a NILVALUE (`-` followed by SP or end of input).
    pub(crate) fn maybe_nil(&mut self) -> bool {
        if self.peek() == Some(NIL) && matches!(self.peek_at(1), None | Some(SP)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Reads 1..=`max_len` printable US-ASCII characters (33..=126).
    pub(crate) fn us_ascii(&mut self, max_len: usize) -> Result<String> {
        let start = self.pos;
        while self.pos - start < max_len {
            match self.peek() {
                Some(b) if (33..=126).contains(&b) => self.pos += 1,
                _ => break,
            }
        }
        if self.pos == start {
            return Err(ParseError::syntax(
                start,
                "Expected at least one US ASCII character",
            ));
        }
        Ok(self.slice_to_string(start, self.pos))
    }

    /// Reads an SD-NAME: up to `max_len` printable characters, stopping at
    /// `=`, SP or `]`. A double quote is never legal inside a name.
    pub(crate) fn sd_name(&mut self, max_len: usize) -> Result<String> {
        let start = self.pos;
        while self.pos - start < max_len {
            match self.peek() {
                Some(b'"') => {
                    return Err(ParseError::syntax(
                        self.pos,
                        "Illegal character '\"' in SD name",
                    ))
                }
                Some(b'=') | Some(SP) | Some(b']') => break,
                Some(b) if (33..=126).contains(&b) => self.pos += 1,
                _ => break,
            }
        }
        if self.pos == start {
            return Err(ParseError::syntax(
                start,
                "Expected at least one US ASCII character",
            ));
        }
        Ok(self.slice_to_string(start, self.pos))
    }

    /// Reads between `min_len` and `max_len` decimal digits.
    pub(crate) fn number(&mut self, min_len: usize, max_len: usize, what: &str) -> Result<u32> {
        let start = self.pos;
        let mut value: u32 = 0;
        while self.pos - start < max_len {
            match self.peek() {
                Some(b) if b.is_ascii_digit() => {
                    value = value * 10 + u32::from(b - b'0');
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if self.pos - start < min_len {
            return Err(ParseError::syntax(
                self.pos,
                format!("Expected {} digit(s) for {}", min_len, what),
            ));
        }
        Ok(value)
    }

    /// Reads exactly `len` digits and checks them with `valid`.
    pub(crate) fn fixed_number(
        &mut self,
        len: usize,
        what: &str,
        valid: impl Fn(u32) -> bool,
    ) -> Result<u32> {
        let start = self.pos;
        let value = self.number(len, len, what)?;
        if !valid(value) {
            return Err(ParseError::syntax(
                start,
                format!("Number {} is out-of-range for {}", value, what),
            ));
        }
        Ok(value)
    }

    /// Raw bytes up to (not including) `terminator`.
    pub(crate) fn until(&mut self, terminator: u8) -> Result<&'a [u8]> {
        let start = self.pos;
        match self.input[start..].iter().position(|&b| b == terminator) {
            Some(len) => {
                self.pos += len;
                Ok(&self.input[start..start + len])
            }
            None => Err(ParseError::syntax(self.input.len(), "Premature end of input")),
        }
    }

    /// Everything not consumed yet.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let start = self.pos.min(self.input.len());
        self.pos = self.input.len();
        &self.input[start..]
    }

    fn slice_to_string(&self, start: usize, end: usize) -> String {
        // Printable US-ASCII is always valid UTF-8.
        String::from_utf8_lossy(&self.input[start..end]).into_owned()
    }
}
