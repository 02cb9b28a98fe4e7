//! Recursive-descent parser for GDB/MI output.
//!
//! ```text
//! record  := [token] nature body
//! nature  := '^' | '*' | '+' | '=' | '~' | '@' | '&'
//! body    := class ("," result)*          for ^ * + =
//!          | c-string                     for ~ @ &
//! result  := name "=" value
//! value   := c-string | tuple | list
//! tuple   := "{}" | "{" result ("," result)* "}"
//! list    := "[]" | "[" value ("," value)* "]" | "[" result ("," result)* "]"
//! ```
//!
//! Every line is parsed on its own. A line that fails still yields a
//! [`Record`] holding whatever was parsed before the failure, the error and
//! the raw line.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{NamedValue, Nature, Record, Value};

/// Prompt line that closes every turn of MI output.
pub const PROMPT: &str = "(gdb)";

/// Deepest tuple/list nesting accepted on one line.
pub const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub element: &'static str,
    pub expected: &'static str,
    /// Offending character and its byte offset, `None` at end of input.
    pub found: Option<(char, usize)>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed {}, expected {}, ", self.element, self.expected)?;
        match self.found {
            Some((c, pos)) => write!(f, "found '{c}' at {pos}"),
            None => write!(f, "found EOF"),
        }
    }
}

impl std::error::Error for ParseError {}

impl Serialize for ParseError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parses a block of MI output into one record per non-blank line.
/// Prompt lines are dropped.
pub fn parse_output(text: &str) -> Vec<Record> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(PROMPT))
        .map(parse_record)
        .collect()
}

/// Parses a single line of MI output.
pub fn parse_record(line: &str) -> Record {
    let mut record = Record::default();
    if let Err(err) = Parser::new(line).record(&mut record) {
        tracing::debug!("unparsable MI line {:?}: {}", line, err);
        record.parse_error = Some(err);
        record.error_data = Some(line.to_string());
    }
    record
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn record(&mut self, record: &mut Record) -> Result<(), ParseError> {
        let token = self.digits();
        if !token.is_empty() {
            record.token = Some(token.to_string());
        }

        let nature = match self.src[self.pos..].chars().next() {
            Some(c) => Nature::from_char(c)
                .ok_or_else(|| self.error("record", "record nature character"))?,
            None => {
                return Err(self.error(
                    "record",
                    "record nature character (^, *, +, =, ~, @ or &)",
                ))
            }
        };
        self.pos += 1;
        record.nature = Some(nature);

        if nature.is_stream() {
            if self.peek() != Some(b'"') {
                return Err(self.error("stream", "'\"'"));
            }
            let text = self.string("stream")?;
            record.stream = Some(text.to_string());
            if !self.at_end() {
                return Err(self.error("stream", "end of line after terminating '\"'"));
            }
            return Ok(());
        }

        record.class = self.word().to_string();
        if record.class.is_empty() {
            return Err(self.error(
                "result-record or async-record",
                "result-class or async-class",
            ));
        }
        if self.at_end() {
            return Ok(());
        }
        if !self.consume(b',') {
            return Err(self.error("result-record or async-record", "','"));
        }
        self.results_into(&mut record.data)
    }

    /// `result ("," result)*` running to the end of the line.
    fn results_into(&mut self, data: &mut BTreeMap<String, Value>) -> Result<(), ParseError> {
        loop {
            let (name, value) = self.result()?;
            data.insert(name, value);
            if self.at_end() {
                return Ok(());
            }
            if !self.consume(b',') {
                return Err(self.error("record results", "','"));
            }
        }
    }

    fn result(&mut self) -> Result<(String, Value), ParseError> {
        let name = self.word();
        if name.is_empty() {
            return Err(self.error("result", "name"));
        }
        if !self.consume(b'=') {
            return Err(self.error("result", "'='"));
        }
        let value = self.value()?;
        Ok((name.to_string(), value))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b'"') => Ok(Value::String(self.string("string")?.to_string())),
            Some(open @ (b'{' | b'[')) => {
                if self.depth >= MAX_NESTING {
                    return Err(self.error("value", "at most 256 nested tuples or lists"));
                }
                self.depth += 1;
                let value = if open == b'{' { self.tuple() } else { self.list() };
                self.depth -= 1;
                value
            }
            _ => Err(self.error("value", "'\"', '{' or '['")),
        }
    }

    /// Returns the text between the quotes with escapes left in place.
    fn string(&mut self, element: &'static str) -> Result<&'a str, ParseError> {
        if !self.consume(b'"') {
            return Err(self.error(element, "'\"'"));
        }
        let start = self.pos;
        let mut i = start;
        loop {
            match self.bytes.get(i) {
                None => {
                    self.pos = self.bytes.len();
                    return Err(self.error(element, "a character or terminating '\"'"));
                }
                Some(b'\\') => i += 2,
                Some(b'"') => {
                    self.pos = i + 1;
                    return Ok(&self.src[start..i]);
                }
                Some(_) => i += 1,
            }
        }
    }

    fn tuple(&mut self) -> Result<Value, ParseError> {
        if !self.consume(b'{') {
            return Err(self.error("tuple", "'{'"));
        }
        let mut tuple = BTreeMap::new();
        if self.consume(b'}') {
            return Ok(Value::Tuple(tuple));
        }
        loop {
            let (name, value) = self.result()?;
            tuple.insert(name, value);
            if self.at_end() {
                return Err(self.error("tuple", "',' or '}'"));
            }
            if !self.consume(b',') {
                break;
            }
        }
        if !self.consume(b'}') {
            return Err(self.error("tuple", "'}'"));
        }
        Ok(Value::Tuple(tuple))
    }

    fn list(&mut self) -> Result<Value, ParseError> {
        if !self.consume(b'[') {
            return Err(self.error("list", "'['"));
        }
        if self.consume(b']') {
            return Ok(Value::List(Vec::new()));
        }

        let list = match self.peek() {
            Some(b'"' | b'{' | b'[') => {
                let mut values = Vec::new();
                loop {
                    values.push(self.value()?);
                    if !self.list_continues()? {
                        break;
                    }
                }
                Value::List(values)
            }
            Some(c) if c.is_ascii_lowercase() || c == b'-' => {
                let mut results = Vec::new();
                loop {
                    let (name, value) = self.result()?;
                    results.push(NamedValue { name, value });
                    if !self.list_continues()? {
                        break;
                    }
                }
                Value::Results(results)
            }
            _ => return Err(self.error("list", "value, result or ']'")),
        };

        if !self.consume(b']') {
            return Err(self.error("list", "']'"));
        }
        Ok(list)
    }

    fn list_continues(&mut self) -> Result<bool, ParseError> {
        if self.at_end() {
            return Err(self.error("list", "',' or ']'"));
        }
        Ok(self.consume(b','))
    }

    /// Letters, digits, '-' and '_'.
    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.src[start..self.pos]
    }

    fn digits(&mut self) -> &'a str {
        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn consume(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, element: &'static str, expected: &'static str) -> ParseError {
        ParseError {
            element,
            expected,
            found: self.src[self.pos.min(self.src.len())..]
                .chars()
                .next()
                .map(|c| (c, self.pos)),
        }
    }
}
