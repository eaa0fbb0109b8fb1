//! Newline framing for object-mode streams.
//!
//! Records travel as one JSON document per line (NDJSON). Byte transports
//! deliver arbitrary fragments, so [`LineSplitter`] keeps the partial tail of
//! the previous fragment until its newline shows up.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("line exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Incremental line splitter.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
    limit: Option<usize>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject lines longer than `limit` bytes instead of buffering forever.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Feed a fragment and take every line it completes, newline stripped.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut lines = Vec::new();
        for &byte in fragment {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                trim_carriage_return(&mut line);
                lines.push(line);
                continue;
            }
            self.pending.push(byte);
            if let Some(limit) = self.limit {
                if self.pending.len() > limit {
                    self.pending.clear();
                    return Err(FrameError::LineTooLong { limit });
                }
            }
        }
        Ok(lines)
    }

    /// The unterminated tail left once the input ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.pending);
        trim_carriage_return(&mut line);
        Some(line)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn trim_carriage_return(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

/// Serialize one record as an NDJSON line.
pub fn encode_record(value: &Value) -> Result<Vec<u8>, FrameError> {
    let mut out = serde_json::to_vec(value)?;
    out.push(b'\n');
    Ok(out)
}

/// Parse one NDJSON line (without its newline).
pub fn decode_record(line: &[u8]) -> Result<Value, FrameError> {
    Ok(serde_json::from_slice(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lines_split_across_fragments() {
        let mut split = LineSplitter::new();
        assert!(split.push(b"Ping: a").unwrap().is_empty());
        let lines = split.push(b"bc\nPing: x\r\nPi").unwrap();
        assert_eq!(lines, vec![b"Ping: abc".to_vec(), b"Ping: x".to_vec()]);
        assert_eq!(split.pending(), 2);
        assert_eq!(split.finish(), Some(b"Pi".to_vec()));
        assert_eq!(split.finish(), None);
    }

    #[test]
    fn empty_lines_are_kept() {
        let mut split = LineSplitter::new();
        let lines = split.push(b"\n\nx\n").unwrap();
        assert_eq!(lines, vec![vec![], vec![], b"x".to_vec()]);
    }

    #[test]
    fn limit_guards_unterminated_input() {
        let mut split = LineSplitter::with_limit(4);
        assert!(matches!(
            split.push(b"abcdef"),
            Err(FrameError::LineTooLong { limit: 4 })
        ));
        assert_eq!(split.pending(), 0);
    }

    #[test]
    fn records_round_trip_through_lines() {
        let line = encode_record(&json!({"z": 202})).unwrap();
        assert_eq!(line, b"{\"z\":202}\n".to_vec());
        let value = decode_record(&line[..line.len() - 1]).unwrap();
        assert_eq!(value, json!({"z": 202}));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_record(b"{nope"),
            Err(FrameError::Malformed(_))
        ));
    }
}
