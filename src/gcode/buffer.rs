//! Incremental line assembly and field extraction for one command source.
//!
//! Bytes are appended one at a time until a terminator (`\n`, `\r` or NUL)
//! completes the line. A line may carry a leading `N<line>` tag and a trailing
//! `*<checksum>`; both are stripped once the checksum (XOR of every byte
//! before `*`) validates. A mismatching checksum completes the buffer in the
//! [`LineStatus::Resend`] state instead, which is answered with `rs <line>`
//! and never executed.
//!
//! Text after `;` is a comment. It is kept aside and never parsed as fields,
//! except in [`CaptureMode::GCodeFile`] where the line is kept verbatim so it
//! can be written out unchanged.

use std::borrow::Cow;
use std::collections::VecDeque;

use super::error::ParseError;

/// Longest line a buffer holds; anything longer is an overflow.
pub const GCODE_LENGTH: usize = 100;

/// XOR of every byte, the legacy host checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Off,
    /// Lines (comments included) are handed over for writing to a file.
    GCodeFile,
    /// Raw bytes are handed over in chunks until `marker` has been seen.
    RawUntil { marker: Vec<u8>, matched: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Filling,
    Ready,
    /// Checksum mismatch; the host must resend `line`.
    Resend { line: i64 },
    /// Line exceeded [`GCODE_LENGTH`].
    Overflow,
    /// A raw capture chunk; `last` once the end marker arrived.
    Captured { last: bool },
}

/// The command word of a line, e.g. `G1` or `T` (no code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandWord {
    pub letter: char,
    pub code: Option<i64>,
}

impl std::fmt::Display for CommandWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}{}", self.letter, code),
            None => write!(f, "{}", self.letter),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuffer {
    identity: &'static str,
    text: Vec<u8>,
    comment: Vec<u8>,
    in_comment: bool,
    overflowed: bool,
    status: LineStatus,
    executed: bool,
    line_number: Option<i64>,
    last_line_number: i64,
    capture: CaptureMode,
    /// Input handed over with [`append_line`](Self::append_line) but not yet consumed.
    pending: VecDeque<u8>,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        CommandBuffer {
            identity: "",
            text: Vec::new(),
            comment: Vec::new(),
            in_comment: false,
            overflowed: false,
            status: LineStatus::Filling,
            executed: false,
            line_number: None,
            last_line_number: 0,
            capture: CaptureMode::Off,
            pending: VecDeque::new(),
        }
    }
}

impl CommandBuffer {
    pub fn new(identity: &'static str) -> Self {
        CommandBuffer {
            identity,
            text: Vec::with_capacity(GCODE_LENGTH),
            comment: Vec::new(),
            in_comment: false,
            overflowed: false,
            status: LineStatus::Filling,
            executed: false,
            line_number: None,
            last_line_number: 0,
            capture: CaptureMode::Off,
            pending: VecDeque::new(),
        }
    }

    pub fn identity(&self) -> &'static str {
        self.identity
    }

    /// Adds one byte. Returns true when this byte completed a line.
    ///
    /// A completed line must be executed before the buffer takes more input;
    /// bytes offered before that are refused and false is returned.
    pub fn append(&mut self, byte: u8) -> bool {
        if self.status != LineStatus::Filling {
            if !self.executed {
                tracing::trace!(source = self.identity, "byte refused, line not yet executed");
                return false;
            }
            self.reset_line();
            self.executed = false;
        }
        if matches!(self.capture, CaptureMode::RawUntil { .. }) {
            return self.append_raw(byte);
        }
        match byte {
            b'\n' | b'\r' | 0 => self.finish_line(),
            _ if self.overflowed => false,
            b';' if self.capture == CaptureMode::Off => {
                self.in_comment = true;
                false
            }
            _ if self.in_comment => {
                if self.comment.len() < GCODE_LENGTH {
                    self.comment.push(byte);
                }
                false
            }
            _ => {
                if self.text.len() >= GCODE_LENGTH {
                    tracing::error!(source = self.identity, "G-code buffer length overflow");
                    self.overflowed = true;
                } else {
                    self.text.push(byte);
                }
                false
            }
        }
    }

    /// Queues a whole line and its terminator, then consumes it up to the
    /// first completed line. True if a line completed.
    ///
    /// A chunk may hold several lines (`\r` or NUL separated); whatever
    /// follows the first is kept for [`feed_pending`](Self::feed_pending).
    pub fn append_line(&mut self, line: &[u8]) -> bool {
        self.pending.extend(line);
        self.pending.push_back(b'\n');
        self.feed_pending()
    }

    /// Consumes queued input until a line completes or the queue runs dry.
    pub fn feed_pending(&mut self) -> bool {
        while self.accepts_input() {
            let Some(byte) = self.pending.pop_front() else {
                return false;
            };
            if self.append(byte) {
                return true;
            }
        }
        false
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn append_raw(&mut self, byte: u8) -> bool {
        self.text.push(byte);
        let CaptureMode::RawUntil { marker, matched } = &mut self.capture else {
            return false;
        };
        if marker.get(*matched) == Some(&byte) {
            *matched += 1;
        } else {
            *matched = usize::from(marker.first() == Some(&byte));
        }
        let last = *matched == marker.len();
        if last || self.text.len() >= GCODE_LENGTH {
            self.complete(LineStatus::Captured { last });
            return true;
        }
        false
    }

    fn complete(&mut self, status: LineStatus) {
        self.status = status;
        self.executed = false;
    }

    fn finish_line(&mut self) -> bool {
        if self.overflowed {
            self.complete(LineStatus::Overflow);
            return true;
        }
        self.trim_text();
        if self.text.is_empty() {
            self.reset_line();
            return false;
        }
        // Checksum and line number live before any comment.
        let fields_end = self.fields_end();
        if let Some(star) = self.text[..fields_end].iter().position(|&b| b == b'*') {
            let line = self.leading_line_number().unwrap_or(self.last_line_number + 1);
            let sent = std::str::from_utf8(&self.text[star + 1..fields_end])
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            let expected = checksum(&self.text[..star]);
            if sent != Some(u32::from(expected)) {
                tracing::warn!(source = self.identity, line, ?sent, expected, "checksum mismatch");
                self.line_number = Some(line);
                self.complete(LineStatus::Resend { line });
                return true;
            }
            self.text.truncate(star);
            self.trim_text();
        }
        self.line_number = None;
        if let Some(n) = self.leading_line_number() {
            let digits_end = 1 + self.text[1..].iter().take_while(|b| b.is_ascii_digit() || **b == b'-').count();
            self.text.drain(..digits_end);
            self.trim_text();
            self.line_number = Some(n);
            self.last_line_number = n;
        }
        if self.text.is_empty() {
            self.reset_line();
            return false;
        }
        self.complete(LineStatus::Ready);
        true
    }

    fn leading_line_number(&self) -> Option<i64> {
        if self.text.first() != Some(&b'N') {
            return None;
        }
        let digits: &[u8] = &self.text[1..];
        let len = digits.iter().take_while(|b| b.is_ascii_digit() || **b == b'-').count();
        std::str::from_utf8(&digits[..len]).ok()?.parse().ok()
    }

    fn trim_text(&mut self) {
        let end = self.text.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |i| i + 1);
        self.text.truncate(end);
        let start = self.text.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(self.text.len());
        self.text.drain(..start);
    }

    fn reset_line(&mut self) {
        self.text.clear();
        self.comment.clear();
        self.in_comment = false;
        self.overflowed = false;
        self.status = LineStatus::Filling;
    }

    /// Clears the completed line and any queued input so the buffer accepts
    /// input again.
    pub fn rearm(&mut self) {
        self.reset_line();
        self.executed = false;
        self.pending.clear();
    }

    pub fn status(&self) -> LineStatus {
        self.status
    }

    /// A complete line that has not been executed.
    pub fn is_ready(&self) -> bool {
        self.status != LineStatus::Filling && !self.executed
    }

    pub fn accepts_input(&self) -> bool {
        self.status == LineStatus::Filling || self.executed
    }

    pub fn mark_executed(&mut self, executed: bool) {
        self.executed = executed;
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn capture(&self) -> &CaptureMode {
        &self.capture
    }

    pub fn set_capture(&mut self, capture: CaptureMode) {
        self.capture = capture;
    }

    /// `N` tag of the current line, or the line a resend asks for.
    pub fn line_number(&self) -> Option<i64> {
        self.line_number
    }

    pub fn last_line_number(&self) -> i64 {
        self.last_line_number
    }

    pub fn set_last_line_number(&mut self, line: i64) {
        self.last_line_number = line;
    }

    /// The stored line: without comment normally, verbatim in capture modes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.text
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }

    pub fn comment(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.comment)
    }

    fn fields_end(&self) -> usize {
        self.text.iter().position(|&b| b == b';').unwrap_or(self.text.len())
    }

    fn fields(&self) -> &[u8] {
        &self.text[..self.fields_end()]
    }

    /// Leading command letter and numeric code.
    pub fn command(&self) -> Result<CommandWord, ParseError> {
        let fields = self.fields();
        let letter = match fields.first().map(|b| b.to_ascii_uppercase()) {
            Some(b @ (b'G' | b'M' | b'T')) => b as char,
            _ => return Err(ParseError::NoCommand),
        };
        let digits = number_prefix(&fields[1..], false);
        if digits.is_empty() {
            return match letter {
                'T' => Ok(CommandWord { letter, code: None }),
                _ => Err(ParseError::Malformed { letter, value: String::new() }),
            };
        }
        let code = parse_long(letter, digits)?;
        Ok(CommandWord { letter, code: Some(code) })
    }

    pub fn has_field(&self, letter: char) -> bool {
        self.value_of(letter).is_some()
    }

    /// Bytes following the first occurrence of `letter` after the command word.
    fn value_of(&self, letter: char) -> Option<&[u8]> {
        let fields = self.fields();
        let key = u8::try_from(letter).ok()?;
        // Skip the command word itself so `T` in "T1" or `M` in "M98" is not a field.
        let start = match fields.first() {
            Some(b) if b.is_ascii_alphabetic() => {
                1 + fields[1..].iter().take_while(|b| b.is_ascii_digit() || **b == b'-').count()
            }
            _ => 0,
        };
        let search = &fields[start..];
        let pos = search.iter().position(|&b| b == key)?;
        Some(&search[pos + 1..])
    }

    fn require(&self, letter: char) -> Result<&[u8], ParseError> {
        self.value_of(letter).ok_or(ParseError::MissingField(letter))
    }

    pub fn float_field(&self, letter: char) -> Result<f64, ParseError> {
        let value = self.require(letter)?;
        parse_float(letter, number_prefix(value, true))
    }

    pub fn long_field(&self, letter: char) -> Result<i64, ParseError> {
        let value = self.require(letter)?;
        parse_long(letter, number_prefix(value, false))
    }

    pub fn int_field(&self, letter: char) -> Result<i32, ParseError> {
        let value = self.long_field(letter)?;
        i32::try_from(value).map_err(|_| ParseError::Malformed { letter, value: value.to_string() })
    }

    /// Colon separated numbers, e.g. `E0.5:0.25`.
    pub fn float_array(&self, letter: char, capacity: usize) -> Result<Vec<f64>, ParseError> {
        split_vector(self.require(letter)?, letter, capacity, true)?
            .into_iter()
            .map(|item| parse_float(letter, item))
            .collect()
    }

    pub fn long_array(&self, letter: char, capacity: usize) -> Result<Vec<i64>, ParseError> {
        split_vector(self.require(letter)?, letter, capacity, false)?
            .into_iter()
            .map(|item| parse_long(letter, item))
            .collect()
    }

    /// Rest of the line after `letter`, trimmed.
    pub fn string_field(&self, letter: char) -> Result<&str, ParseError> {
        let value = self.require(letter)?;
        let s = std::str::from_utf8(value).map_err(|_| ParseError::Malformed {
            letter,
            value: String::from_utf8_lossy(value).into_owned(),
        })?;
        match s.trim() {
            "" => Err(ParseError::StringExpected),
            s => Ok(s),
        }
    }

    /// Everything after the command word, as in `M23 part.g`.
    pub fn unkeyed_string(&self) -> Result<&str, ParseError> {
        let fields = self.fields();
        let Some(space) = fields.iter().position(|b| b.is_ascii_whitespace()) else {
            return Err(ParseError::StringExpected);
        };
        let s = std::str::from_utf8(&fields[space..]).map_err(|_| ParseError::StringExpected)?;
        match s.trim() {
            "" => Err(ParseError::StringExpected),
            s => Ok(s),
        }
    }
}

/// Longest numeric prefix: optional spaces, sign, digits and (for floats) one
/// decimal point. There is no exponent form since `E` is a field letter.
fn number_prefix(bytes: &[u8], fraction: bool) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b' ').unwrap_or(bytes.len());
    let bytes = &bytes[start..];
    let mut end = 0;
    let mut seen_point = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'+' | b'-' if i == 0 => {}
            b'0'..=b'9' => {}
            b'.' if fraction && !seen_point => seen_point = true,
            _ => break,
        }
        end = i + 1;
    }
    &bytes[..end]
}

fn malformed(letter: char, value: &[u8]) -> ParseError {
    ParseError::Malformed { letter, value: String::from_utf8_lossy(value).into_owned() }
}

fn parse_float(letter: char, digits: &[u8]) -> Result<f64, ParseError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| malformed(letter, digits))
}

fn parse_long(letter: char, digits: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| malformed(letter, digits))
}

fn split_vector(value: &[u8], letter: char, capacity: usize, fraction: bool) -> Result<Vec<&[u8]>, ParseError> {
    let mut items = Vec::new();
    let mut rest = value;
    loop {
        let item = number_prefix(rest, fraction);
        if items.len() == capacity {
            return Err(ParseError::TooManyValues { letter, capacity });
        }
        items.push(item);
        let consumed = rest.len() - rest.iter().skip_while(|b| **b == b' ').count() + item.len();
        rest = &rest[consumed..];
        match rest.first() {
            Some(b':') => rest = &rest[1..],
            _ => break,
        }
    }
    Ok(items)
}
