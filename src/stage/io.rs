//! Stages over tokio byte streams.
//!
//! Byte adapters move raw reads and writes. Framed adapters carry one JSON
//! record per newline-terminated line.

use async_trait::async_trait;
use bytes::BytesMut;
use sluice_wire::framing::{decode_record, encode_record, FrameError};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tracing::{debug, trace};

use super::{Sink, Source};
use crate::chunk::Chunk;
use crate::error::{PipelineError, ProtocolViolation};

pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;

/// Reads up to `chunk_size` bytes per chunk until EOF.
pub struct ReadSource<R> {
    reader: R,
    chunk_size: usize,
    name: String,
}

impl<R> ReadSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_READ_CHUNK)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            name: "read".into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<R> Source for ReadSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let n = self.reader.read_buf(&mut buf).await?;
        if n == 0 {
            debug!(stage = %self.name, "reader reached EOF");
            return Ok(None);
        }
        trace!(stage = %self.name, bytes = n, "read");
        Ok(Some(Chunk::Bytes(buf.freeze())))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Writes byte chunks verbatim; shuts the writer down on close.
pub struct WriteSink<W> {
    writer: W,
    name: String,
}

impl<W> WriteSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            name: "write".into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<W> Sink for WriteSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        let Some(data) = chunk.as_bytes() else {
            return Err(ProtocolViolation(format!("'{}' only accepts bytes", self.name)).into());
        };
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn destroy(&mut self, _cause: &PipelineError) {
        let _ = self.writer.shutdown().await;
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Longest line a [`FramedSource`] buffers by default.
pub const DEFAULT_LINE_LIMIT: usize = 1024 * 1024;

/// Decodes one JSON record per line. Blank lines are skipped. A line that
/// is not JSON (invalid UTF-8 included) or that runs past the line limit is
/// a protocol error.
pub struct FramedSource<R> {
    lines: BufReader<R>,
    line: Vec<u8>,
    limit: usize,
    name: String,
}

impl<R> FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader),
            line: Vec::new(),
            limit: DEFAULT_LINE_LIMIT,
            name: "framed_read".into(),
        }
    }

    /// Fail the stream on lines longer than `limit` bytes, newline excluded.
    pub fn with_line_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<R> Source for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        // room for the limit plus the "\r\n" terminator
        let window = self.limit as u64 + 2;
        loop {
            self.line.clear();
            let n = (&mut self.lines)
                .take(window)
                .read_until(b'\n', &mut self.line)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            let terminated = self.line.last() == Some(&b'\n');
            let mut line = self.line.as_slice();
            if let Some(stripped) = line.strip_suffix(b"\n") {
                line = stripped;
            }
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > self.limit || (!terminated && n as u64 == window) {
                let err = FrameError::LineTooLong { limit: self.limit };
                return Err(ProtocolViolation(err.to_string()).into());
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record =
                decode_record(line).map_err(|e| ProtocolViolation(e.to_string()))?;
            return Ok(Some(Chunk::Record(record)));
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Encodes each record as one line.
pub struct FramedSink<W: AsyncWrite> {
    writer: BufWriter<W>,
    name: String,
}

impl<W> FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            name: "framed_write".into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<W> Sink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        let Some(record) = chunk.as_record() else {
            return Err(ProtocolViolation(format!("'{}' only accepts records", self.name)).into());
        };
        let line = encode_record(record)?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn destroy(&mut self, _cause: &PipelineError) {
        let _ = self.writer.shutdown().await;
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
