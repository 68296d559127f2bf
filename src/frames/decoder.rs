//! Line accumulator and streaming frame decoder.

use std::io::{self, BufRead};
use tracing::debug;

/// One blank-line-terminated block of the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub id: Option<String>,
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub payload: String,
}

/// Accumulates the fields of the frame currently being read.
#[derive(Debug, Default)]
pub struct FrameParser {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (with or without its line terminator).
    ///
    /// Returns a frame when the line is a blank terminator and an event type
    /// has been seen since the last frame.
    pub fn push_line(&mut self, line: &str) -> Option<RawFrame> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.trim().is_empty() {
            return self.finish();
        }

        // Comment / keep-alive line.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.id = Some(value.trim().to_string()),
            "event" => {
                let value = value.trim();
                if !value.is_empty() {
                    self.event = Some(value.to_string());
                }
            }
            "data" => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }

        None
    }

    /// True if some field of an unfinished frame has been accumulated.
    pub fn has_partial(&self) -> bool {
        self.id.is_some() || self.event.is_some() || self.data.is_some()
    }

    /// Drop any partially accumulated frame.
    pub fn reset(&mut self) {
        self.id = None;
        self.event = None;
        self.data = None;
    }

    fn finish(&mut self) -> Option<RawFrame> {
        let id = self.id.take();
        let data = self.data.take();
        let event = self.event.take()?;

        Some(RawFrame {
            id,
            event,
            payload: data.unwrap_or_default(),
        })
    }
}

/// Lazily decodes frames from a buffered byte stream.
///
/// Yields `Err` once if the underlying reader fails, then ends. A clean end
/// of stream discards any partial frame without an error.
pub struct FrameDecoder<R> {
    reader: R,
    parser: FrameParser,
    line: Vec<u8>,
    done: bool,
}

impl<R: BufRead> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: FrameParser::new(),
            line: Vec::with_capacity(256),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for FrameDecoder<R> {
    type Item = io::Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    if self.parser.has_partial() {
                        debug!("discarding partial frame at end of stream");
                    }
                    self.parser.reset();
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.line);
                    if let Some(frame) = self.parser.push_line(&line) {
                        return Some(Ok(frame));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
