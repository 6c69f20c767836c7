use std::time::Duration;

use regex::bytes::Regex;

use crate::Result;

/// Something that ends an engine response: the console prompt, or one of the
/// interactive questions the engine asks in the middle of a command.
#[derive(Debug, Clone)]
pub enum Marker {
    Literal(String),
    Pattern(Regex),
}

impl Marker {
    pub fn literal(text: impl Into<String>) -> Self {
        Marker::Literal(text.into())
    }

    pub fn pattern(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(pattern).map(Marker::Pattern)
    }

    /// Byte range of the first occurrence of this marker in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        match self {
            Marker::Literal(needle) => {
                let needle = needle.as_bytes();
                if needle.is_empty() || needle.len() > haystack.len() {
                    return None;
                }
                haystack
                    .windows(needle.len())
                    .position(|window| window == needle)
                    .map(|start| (start, start + needle.len()))
            }
            Marker::Pattern(regex) => regex.find(haystack).map(|m| (m.start(), m.end())),
        }
    }
}

/// Earliest match of any of `markers`, as `(marker index, start, end)`.
pub fn find_first(markers: &[Marker], haystack: &[u8]) -> Option<(usize, usize, usize)> {
    markers
        .iter()
        .enumerate()
        .filter_map(|(i, marker)| marker.find(haystack).map(|(start, end)| (i, start, end)))
        .min_by_key(|&(i, start, _)| (start, i))
}

/// Text read from the engine up to a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Index into the marker list of the marker that ended this chunk.
    pub marker: usize,
}

/// Synchronous request/response exchange with one engine. Implementations own
/// the engine; at most one request is in flight at a time.
pub trait EngineChannel {
    /// Writes `line` followed by the engine's line terminator.
    fn send(&mut self, line: &str) -> Result<()>;

    /// Blocks until one of `markers` shows up in the output of the most recent
    /// request, then returns everything before it. Output still owed for an
    /// earlier request that timed out is read and thrown away first.
    fn read_until(&mut self, markers: &[Marker], timeout: Option<Duration>) -> Result<Chunk>;

    /// The console prompt that ends ordinary responses.
    fn prompt(&self) -> &Marker;

    fn is_alive(&mut self) -> bool;

    /// Asks the engine to quit and releases it. Safe to call more than once.
    fn close(&mut self) -> Result<()>;

    /// Terminates the engine without asking.
    fn kill(&mut self) -> Result<()>;

    fn read_response(&mut self, timeout: Option<Duration>) -> Result<String> {
        let prompt = self.prompt().clone();
        self.read_until(std::slice::from_ref(&prompt), timeout)
            .map(|chunk| chunk.text)
    }
}
