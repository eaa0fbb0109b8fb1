// src/duplex.rs
//
// A Duplex joins a sink half and a source half under one identity. Writes go
// to the sink half, reads come from the source half, and the two never see
// each other's data. Failure of either half tears down both.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::config::PipelineConfig;
use crate::error::{classify, Fault, PipelineError};
use crate::pipe::pipe;
use crate::pump::{aggregate, Pipeline};
use crate::stage::io::{FramedSink, FramedSource, ReadSource, WriteSink, DEFAULT_LINE_LIMIT};
use crate::stage::{Sink, Source, Stage, StageState};

const READ: usize = 0;
const WRITE: usize = 1;

struct Core {
    name: String,
    token: CancellationToken,
    // fired by close_half before it waits for the half's lock
    closing: [CancellationToken; 2],
    error: Mutex<Option<PipelineError>>,
    states: Mutex<[StageState; 2]>,
    reader: tokio::sync::Mutex<Box<dyn Source>>,
    writer: tokio::sync::Mutex<Box<dyn Sink>>,
}

impl Core {
    fn states(&self) -> MutexGuard<'_, [StageState; 2]> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn state(&self, half: usize) -> StageState {
        self.states()[half]
    }

    fn set_state(&self, half: usize, state: StageState) {
        self.states()[half] = state;
    }

    fn error(&self) -> Option<PipelineError> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Record the first error and halt both halves. Returns the recorded one.
    fn fail(&self, err: PipelineError) -> PipelineError {
        let recorded = {
            let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
            slot.get_or_insert(err).clone()
        };
        self.token.cancel();
        recorded
    }

    fn torn_down(&self) -> PipelineError {
        self.error()
            .unwrap_or_else(|| PipelineError::destroyed(format!("duplex '{}' torn down", self.name)))
    }

    fn check(&self, half: usize, op: &str) -> Result<(), PipelineError> {
        match self.state(half) {
            StageState::Failed => Err(self.torn_down()),
            StageState::Closed => Err(PipelineError::protocol(
                &self.name,
                format!("{op} after close"),
            )),
            _ if self.token.is_cancelled() => Err(self.torn_down()),
            StageState::Idle => {
                self.set_state(half, StageState::Active);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The source half already said end of stream, or is being closed.
    fn read_ended(&self) -> bool {
        self.state(READ) == StageState::Draining || self.closing[READ].is_cancelled()
    }

    async fn produce(&self) -> Result<Option<Chunk>, PipelineError> {
        self.check(READ, "read")?;
        if self.read_ended() {
            return Ok(None);
        }
        let closing = &self.closing[READ];
        let mut source = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.torn_down()),
            _ = closing.cancelled() => return Ok(None),
            guard = self.reader.lock() => guard,
        };
        // another reader may have hit the end while we waited for the lock
        self.check(READ, "read")?;
        if self.read_ended() {
            return Ok(None);
        }
        let produced = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.torn_down()),
            _ = closing.cancelled() => return Ok(None),
            produced = source.produce() => produced,
        };
        match produced {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.set_state(READ, StageState::Draining);
                Ok(None)
            }
            Err(e) => Err(self.fail(classify(e, &self.name, Fault::Production))),
        }
    }

    fn write_after_close(&self) -> PipelineError {
        PipelineError::protocol(&self.name, "write after close")
    }

    async fn consume(&self, chunk: Chunk) -> Result<(), PipelineError> {
        self.check(WRITE, "write")?;
        let closing = &self.closing[WRITE];
        if closing.is_cancelled() {
            return Err(self.write_after_close());
        }
        let mut sink = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.torn_down()),
            _ = closing.cancelled() => return Err(self.write_after_close()),
            guard = self.writer.lock() => guard,
        };
        self.check(WRITE, "write")?;
        let consumed = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.torn_down()),
            _ = closing.cancelled() => return Err(self.write_after_close()),
            consumed = sink.consume(chunk) => consumed,
        };
        consumed.map_err(|e| self.fail(classify(e, &self.name, Fault::Consumption)))
    }

    /// Close one half. Closing a half that already finished is a no-op.
    /// A read or write pending on that half is interrupted first.
    async fn close_half(&self, half: usize) -> Result<(), PipelineError> {
        self.closing[half].cancel();
        let result = if half == READ {
            let mut source = self.reader.lock().await;
            if self.state(READ).is_terminal() {
                return Ok(());
            }
            source
                .close()
                .await
                .map_err(|e| classify(e, &self.name, Fault::Production))
        } else {
            let mut sink = self.writer.lock().await;
            if self.state(WRITE).is_terminal() {
                return Ok(());
            }
            sink.close()
                .await
                .map_err(|e| classify(e, &self.name, Fault::Consumption))
        };
        match result {
            Ok(()) => {
                self.set_state(half, StageState::Closed);
                Ok(())
            }
            Err(err) => {
                self.set_state(half, StageState::Failed);
                Err(self.fail(err))
            }
        }
    }

    /// Destroy every half that has not reached a terminal state.
    async fn destroy_all(&self, cause: &PipelineError) {
        let cause = self.fail(cause.clone());
        {
            let mut source = self.reader.lock().await;
            if !self.state(READ).is_terminal() {
                source.destroy(&cause).await;
                self.set_state(READ, StageState::Failed);
            }
        }
        {
            let mut sink = self.writer.lock().await;
            if !self.state(WRITE).is_terminal() {
                sink.destroy(&cause).await;
                self.set_state(WRITE, StageState::Failed);
            }
        }
        debug!(duplex = %self.name, error = %cause, "duplex destroyed");
    }
}

/// Sink half and source half presented as one stage.
pub struct Duplex {
    reader: DuplexReader,
    writer: DuplexWriter,
}

/// The readable side of a [`Duplex`], usable as a pipeline head.
pub struct DuplexReader {
    core: Arc<Core>,
}

/// The writable side of a [`Duplex`], usable as a pipeline tail.
pub struct DuplexWriter {
    core: Arc<Core>,
}

impl Duplex {
    pub fn new(
        name: impl Into<String>,
        sink: impl Sink + 'static,
        source: impl Source + 'static,
    ) -> Self {
        let core = Arc::new(Core {
            name: name.into(),
            token: CancellationToken::new(),
            closing: [CancellationToken::new(), CancellationToken::new()],
            error: Mutex::new(None),
            states: Mutex::new([StageState::Idle; 2]),
            reader: tokio::sync::Mutex::new(Box::new(source)),
            writer: tokio::sync::Mutex::new(Box::new(sink)),
        });
        Self {
            reader: DuplexReader { core: core.clone() },
            writer: DuplexWriter { core },
        }
    }

    /// Bytes over any tokio stream: reads become byte chunks, byte chunks
    /// are written through.
    pub fn from_io<T>(io: T, name: impl Into<String>, read_chunk: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (read, write) = tokio::io::split(io);
        Self::new(
            name.clone(),
            WriteSink::new(write).named(format!("{name}.write")),
            ReadSource::with_chunk_size(read, read_chunk).named(format!("{name}.read")),
        )
    }

    /// Newline-delimited JSON records over any tokio stream.
    pub fn framed<T>(io: T, name: impl Into<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::framed_with_limit(io, name, DEFAULT_LINE_LIMIT)
    }

    /// Like [`Duplex::framed`], failing the read side on lines longer than
    /// `max_line` bytes.
    pub fn framed_with_limit<T>(io: T, name: impl Into<String>, max_line: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (read, write) = tokio::io::split(io);
        Self::new(
            name.clone(),
            FramedSink::new(write).named(format!("{name}.write")),
            FramedSource::new(read)
                .with_line_limit(max_line)
                .named(format!("{name}.read")),
        )
    }

    /// Compose `stages` (transforms or duplexes) into one Duplex. Writes
    /// enter the first stage, reads come out of the last one. The inner
    /// chain runs on its own task, so this needs a tokio runtime.
    pub fn chain(stages: Vec<Stage>, config: PipelineConfig) -> Result<Self, PipelineError> {
        let inner_names: Vec<String> = stages.iter().map(Stage::name).collect();
        let name = format!("chain({})", inner_names.join(","));
        let (entry_tx, entry_rx) = pipe(format!("{name}.in"), config.high_water_mark);
        let (exit_tx, exit_rx) = pipe(format!("{name}.out"), config.high_water_mark);

        let mut all = Vec::with_capacity(stages.len() + 2);
        all.push(Stage::source(entry_rx));
        all.extend(stages);
        all.push(Stage::sink(exit_tx));
        let inner = Pipeline::new(all)?.with_config(config);

        tokio::spawn(inner.run());
        Ok(Self::new(name, entry_tx, exit_rx))
    }

    pub fn name(&self) -> &str {
        &self.reader.core.name
    }

    /// Forward one chunk to the sink half.
    pub async fn write(&self, chunk: Chunk) -> Result<(), PipelineError> {
        let result = self.core().consume(chunk).await;
        if let Err(err) = &result {
            self.core().destroy_all(err).await;
        }
        result
    }

    /// Next chunk from the source half, `None` at its end of stream.
    pub async fn read(&self) -> Result<Option<Chunk>, PipelineError> {
        let result = self.core().produce().await;
        if let Err(err) = &result {
            self.core().destroy_all(err).await;
        }
        result
    }

    /// Close both halves: the sink half first, then the source half.
    pub async fn close(&self) -> Result<(), PipelineError> {
        let result = match self.core().close_half(WRITE).await {
            Ok(()) => self.core().close_half(READ).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(duplex = %self.name(), error = %err, "duplex close failed");
            self.core().destroy_all(err).await;
        }
        result
    }

    pub async fn destroy(&self, reason: impl Into<String>) {
        self.destroy_with(PipelineError::destroyed(reason)).await
    }

    /// Destroy both halves, each at most once.
    pub async fn destroy_with(&self, cause: PipelineError) {
        self.core().destroy_all(&cause).await
    }

    /// The error either half failed with, if any.
    pub fn error(&self) -> Option<PipelineError> {
        self.core().error()
    }

    pub fn state(&self) -> StageState {
        aggregate(&*self.core().states())
    }

    pub fn split(self) -> (DuplexReader, DuplexWriter) {
        (self.reader, self.writer)
    }

    pub(crate) fn halves_mut(&mut self) -> (&mut DuplexReader, &mut DuplexWriter) {
        (&mut self.reader, &mut self.writer)
    }

    /// Feed everything the source half produces back into the sink half,
    /// under the same backpressure rules as any other pipeline.
    pub fn looped(self, config: PipelineConfig) -> Pipeline {
        let (reader, writer) = self.split();
        Pipeline::from_source(reader)
            .config(config)
            .into_sink(writer)
    }

    fn core(&self) -> &Core {
        &self.reader.core
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl DuplexReader {
    pub fn error(&self) -> Option<PipelineError> {
        self.core.error()
    }
}

impl DuplexWriter {
    pub fn error(&self) -> Option<PipelineError> {
        self.core.error()
    }
}

#[async_trait]
impl Source for DuplexReader {
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        Ok(self.core.produce().await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(self.core.close_half(READ).await?)
    }

    async fn destroy(&mut self, cause: &PipelineError) {
        self.core.destroy_all(cause).await
    }

    fn name(&self) -> String {
        self.core.name.clone()
    }
}

#[async_trait]
impl Sink for DuplexWriter {
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        Ok(self.core.consume(chunk).await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(self.core.close_half(WRITE).await?)
    }

    async fn destroy(&mut self, cause: &PipelineError) {
        self.core.destroy_all(cause).await
    }

    fn name(&self) -> String {
        self.core.name.clone()
    }
}
