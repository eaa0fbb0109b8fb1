//! Transforms between byte streams and record streams.

use async_trait::async_trait;
use sluice_wire::framing::{decode_record, encode_record, FrameError, LineSplitter};

use crate::chunk::Chunk;
use crate::error::ProtocolViolation;
use crate::stage::{Emitter, Transform};

fn violation(err: FrameError) -> anyhow::Error {
    ProtocolViolation(err.to_string()).into()
}

fn expect_bytes(chunk: &Chunk, stage: &str) -> anyhow::Result<()> {
    if chunk.is_record() {
        return Err(ProtocolViolation(format!("'{stage}' expects bytes, got a record")).into());
    }
    Ok(())
}

/// Re-chunks bytes on newlines. Each output chunk is one line without its
/// terminator; an unterminated tail is emitted at end of input.
#[derive(Debug, Default)]
pub struct Lines {
    split: LineSplitter,
}

impl Lines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            split: LineSplitter::with_limit(limit),
        }
    }
}

#[async_trait]
impl Transform for Lines {
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()> {
        expect_bytes(&chunk, "lines")?;
        let data = chunk.as_bytes().unwrap_or_default();
        for line in self.split.push(data).map_err(violation)? {
            out.push(line);
        }
        Ok(())
    }

    async fn flush(&mut self, out: &mut Emitter) -> anyhow::Result<()> {
        if let Some(tail) = self.split.finish() {
            out.push(tail);
        }
        Ok(())
    }

    fn name(&self) -> String {
        "lines".into()
    }
}

/// Records in, NDJSON bytes out.
#[derive(Debug, Default)]
pub struct NdjsonEncoder;

#[async_trait]
impl Transform for NdjsonEncoder {
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()> {
        let Some(record) = chunk.as_record() else {
            return Err(ProtocolViolation("ndjson encoder expects records".into()).into());
        };
        out.push(encode_record(record)?);
        Ok(())
    }

    fn name(&self) -> String {
        "ndjson_encode".into()
    }
}

/// NDJSON bytes in, records out. Blank lines are skipped; anything that is
/// not JSON is a protocol violation.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    split: LineSplitter,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(line: &[u8], out: &mut Emitter) -> anyhow::Result<()> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        out.push(Chunk::Record(decode_record(line).map_err(violation)?));
        Ok(())
    }
}

#[async_trait]
impl Transform for NdjsonDecoder {
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()> {
        expect_bytes(&chunk, "ndjson_decode")?;
        let data = chunk.as_bytes().unwrap_or_default();
        for line in self.split.push(data).map_err(violation)? {
            Self::emit(&line, out)?;
        }
        Ok(())
    }

    async fn flush(&mut self, out: &mut Emitter) -> anyhow::Result<()> {
        match self.split.finish() {
            Some(tail) => Self::emit(&tail, out),
            None => Ok(()),
        }
    }

    fn name(&self) -> String {
        "ndjson_decode".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn feed(t: &mut dyn Transform, parts: &[&'static str]) -> Vec<Chunk> {
        let mut out = Emitter::default();
        for part in parts {
            t.transform(Chunk::from(*part), &mut out).await.unwrap();
        }
        t.flush(&mut out).await.unwrap();
        out.take().into_iter().collect()
    }

    #[tokio::test]
    async fn lines_rejoin_fragments() {
        let got = feed(&mut Lines::new(), &["he", "llo\nwor", "ld"]).await;
        assert_eq!(got, vec![Chunk::from("hello"), Chunk::from("world")]);
    }

    #[tokio::test]
    async fn decoder_handles_split_records() {
        let got = feed(&mut NdjsonDecoder::new(), &["{\"a\":", "1}\n\n{\"b\":2}"]).await;
        assert_eq!(
            got,
            vec![Chunk::Record(json!({"a": 1})), Chunk::Record(json!({"b": 2}))]
        );
    }

    #[tokio::test]
    async fn decoder_flags_garbage() {
        let mut out = Emitter::default();
        let err = NdjsonDecoder::new()
            .transform(Chunk::from("nope\n"), &mut out)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ProtocolViolation>().is_some());
    }

    #[tokio::test]
    async fn encoder_appends_newline() {
        let mut out = Emitter::default();
        NdjsonEncoder
            .transform(Chunk::Record(json!({"x": true})), &mut out)
            .await
            .unwrap();
        assert_eq!(out.take().pop_front(), Some(Chunk::from("{\"x\":true}\n")));
    }
}
