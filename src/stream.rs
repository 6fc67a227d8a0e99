//! Streaming response parser.
//!
//! Splits a growing token stream into a reasoning segment and an answer
//! segment as delimiters arrive. The parser keeps only the accumulated text
//! and re-derives the split from scratch on every [`StreamParser::feed`], so
//! parsing the full accumulated string always yields a result consistent
//! with incremental feeding. That property lets callers re-parse at any
//! point instead of maintaining fragile incremental state.

/// Default delimiters marking the reasoning segment of a response.
pub const DEFAULT_OPEN_DELIMITER: &str = "<think>";
pub const DEFAULT_CLOSE_DELIMITER: &str = "</think>";

/// Point-in-time view of the parsed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    /// Reasoning text accumulated so far (may still be growing).
    pub reasoning: String,
    /// Answer text accumulated so far.
    pub answer: String,
    /// Whether the reasoning segment has been closed by its delimiter.
    pub reasoning_complete: bool,
}

/// Final split produced when the stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Reasoning segment; empty if the stream carried none.
    pub reasoning: String,
    /// Answer segment.
    pub answer: String,
}

/// Incremental parser over a delimited token stream.
#[derive(Debug, Clone)]
pub struct StreamParser {
    open: String,
    close: String,
    buffer: String,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_DELIMITER, DEFAULT_CLOSE_DELIMITER)
    }
}

impl StreamParser {
    /// Create a parser with custom delimiters.
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            buffer: String::new(),
        }
    }

    /// Append a chunk and return the current split.
    pub fn feed(&mut self, chunk: &str) -> StreamSnapshot {
        self.buffer.push_str(chunk);
        self.snapshot()
    }

    /// The full text accumulated so far.
    pub fn accumulated(&self) -> &str {
        &self.buffer
    }

    /// Current split of the accumulated text.
    ///
    /// The split is a pure function of the accumulated text, so this is
    /// identical to parsing the whole string in one `feed` call.
    pub fn snapshot(&self) -> StreamSnapshot {
        match self.buffer.find(&self.open) {
            None => StreamSnapshot {
                reasoning: String::new(),
                answer: self.buffer.clone(),
                reasoning_complete: false,
            },
            Some(open_at) => {
                let after_open = open_at + self.open.len();
                match self.buffer[after_open..].find(&self.close) {
                    Some(close_rel) => {
                        let close_at = after_open + close_rel;
                        let mut answer = String::new();
                        answer.push_str(self.buffer[..open_at].trim());
                        let tail = self.buffer[close_at + self.close.len()..].trim_start();
                        if !answer.is_empty() && !tail.is_empty() {
                            answer.push('\n');
                        }
                        answer.push_str(tail);
                        StreamSnapshot {
                            reasoning: self.buffer[after_open..close_at].trim().to_string(),
                            answer,
                            reasoning_complete: true,
                        }
                    }
                    None => StreamSnapshot {
                        reasoning: self.buffer[after_open..].trim_start().to_string(),
                        answer: String::new(),
                        reasoning_complete: false,
                    },
                }
            }
        }
    }

    /// Finalize at end of stream.
    ///
    /// If the closing delimiter never arrived, the whole content is treated
    /// as answer-only with no reasoning segment.
    pub fn finish(self) -> ParsedResponse {
        let snapshot = self.snapshot();
        if snapshot.reasoning_complete {
            ParsedResponse {
                reasoning: snapshot.reasoning,
                answer: snapshot.answer,
            }
        } else {
            ParsedResponse {
                reasoning: String::new(),
                answer: self.buffer.trim().to_string(),
            }
        }
    }

    /// Split a complete response in one shot.
    pub fn parse_complete(text: &str) -> ParsedResponse {
        let mut parser = StreamParser::default();
        parser.feed(text);
        parser.finish()
    }
}
