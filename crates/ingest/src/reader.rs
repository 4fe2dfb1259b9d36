use std::fs::File;
use std::io::{self, BufRead, BufReader, Bytes, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;
use usage_core::ReadCursor;

use crate::types::{IngestError, Result};

/// One decoded line. `end` is the byte offset just past its newline.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonLine {
    pub line: u64,
    pub end: u64,
    pub value: Value,
}

/// One JSON object per line. Blank lines are ignored; anything else that is
/// not a JSON object stops the stream with an error.
pub struct JsonLines<R> {
    reader: R,
    location: String,
    line: u64,
    offset: u64,
    buf: String,
    done: bool,
}

impl<R: BufRead> JsonLines<R> {
    pub fn new(reader: R, location: impl Into<String>) -> Self {
        Self::starting_at(reader, location, 0, 0)
    }

    /// A reader already positioned at byte `offset`, just after line `line`.
    pub fn starting_at(reader: R, location: impl Into<String>, line: u64, offset: u64) -> Self {
        Self {
            reader,
            location: location.into(),
            line,
            offset,
            buf: String::new(),
            done: false,
        }
    }
}

/// Opens a line-oriented log, seeking past `cursor` when one is given.
pub fn open_lines(
    location: &Path,
    cursor: Option<&ReadCursor>,
) -> Result<JsonLines<BufReader<File>>> {
    let label = location.display().to_string();
    let mut file = File::open(location).map_err(|err| IngestError::io(&label, err))?;
    let (line, offset) = match cursor {
        Some(cursor) => {
            file.seek(SeekFrom::Start(cursor.byte_offset))
                .map_err(|err| IngestError::io(&label, err))?;
            (cursor.line, cursor.byte_offset)
        }
        None => (0, 0),
    };
    Ok(JsonLines::starting_at(
        BufReader::new(file),
        label,
        line,
        offset,
    ))
}

impl<R: BufRead> Iterator for JsonLines<R> {
    type Item = Result<JsonLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(read) => {
                    self.line += 1;
                    self.offset += read as u64;
                    let line = self.buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let parsed = match serde_json::from_str::<Value>(line) {
                        Ok(value) if value.is_object() => Ok(JsonLine {
                            line: self.line,
                            end: self.offset,
                            value,
                        }),
                        Ok(_) => Err(malformed(&self.location, self.line, "expected a JSON object")),
                        Err(err) => Err(malformed(&self.location, self.line, &err.to_string())),
                    };
                    if parsed.is_err() {
                        self.done = true;
                    }
                    return Some(parsed);
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(IngestError::Read {
                        location: self.location.clone(),
                        position: self.line + 1,
                        source: err,
                    }));
                }
            }
        }
    }
}

/// Concatenated top-level JSON objects with no reliable line framing.
/// Object boundaries are found by brace balance outside of string literals;
/// the yielded position is the line on which the object starts.
pub struct ConcatenatedObjects<R> {
    bytes: Bytes<R>,
    location: String,
    line: u64,
    done: bool,
}

impl<R: io::Read> ConcatenatedObjects<R> {
    pub fn new(reader: R, location: impl Into<String>) -> Self {
        Self {
            bytes: reader.bytes(),
            location: location.into(),
            line: 1,
            done: false,
        }
    }

    fn fail(&mut self, position: u64, message: &str) -> Option<Result<(u64, Value)>> {
        self.done = true;
        Some(Err(malformed(&self.location, position, message)))
    }
}

impl<R: io::Read> Iterator for ConcatenatedObjects<R> {
    type Item = Result<(u64, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut start_line = self.line;
        loop {
            let byte = match self.bytes.next() {
                None if depth == 0 => {
                    self.done = true;
                    return None;
                }
                None => return self.fail(start_line, "unterminated object at end of input"),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(IngestError::Read {
                        location: self.location.clone(),
                        position: self.line,
                        source: err,
                    }));
                }
                Some(Ok(byte)) => byte,
            };
            let line = self.line;
            if byte == b'\n' {
                self.line += 1;
            }
            if depth == 0 {
                if byte.is_ascii_whitespace() {
                    continue;
                }
                if byte != b'{' {
                    return self.fail(line, "unexpected data between objects");
                }
                start_line = line;
                depth = 1;
                buf.push(byte);
                continue;
            }
            buf.push(byte);
            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return match serde_json::from_slice::<Value>(&buf) {
                            Ok(value) => Some(Ok((start_line, value))),
                            Err(err) => self.fail(start_line, &err.to_string()),
                        };
                    }
                }
                _ => {}
            }
        }
    }
}

fn malformed(location: &str, position: u64, message: &str) -> IngestError {
    IngestError::MalformedJson {
        location: location.to_string(),
        position,
        message: message.to_string(),
    }
}
