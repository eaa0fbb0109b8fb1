// src/stage.rs

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::PipelineError;

pub mod func;
pub mod io;

/// Lifecycle of a stage. `Closed` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Idle,
    Active,
    Draining,
    Closed,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Closed | StageState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Source,
    Sink,
    Transform,
    Duplex,
}

// -----------------------------------------------------------------------------
// Stage contracts
// -----------------------------------------------------------------------------

/// Produces chunks. `Ok(None)` is end of stream, after which `produce` is never
/// called again.
#[async_trait]
pub trait Source: Send {
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>>;

    /// Release resources after end of stream.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources after a failure anywhere in the chain.
    async fn destroy(&mut self, _cause: &PipelineError) {}

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Consumes chunks. `consume` may suspend until the chunk is persisted or
/// forwarded; the driver never calls it again before that completes.
#[async_trait]
pub trait Sink: Send {
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()>;

    /// Input ended: flush and release.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&mut self, _cause: &PipelineError) {}

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Consumes one chunk and emits zero or more.
#[async_trait]
pub trait Transform: Send {
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()>;

    /// Input ended: emit whatever is still buffered.
    async fn flush(&mut self, _out: &mut Emitter) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&mut self, _cause: &PipelineError) {}

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Output buffer handed to a [`Transform`]. The driver forwards what was
/// pushed, honoring the downstream flow controller between chunks.
#[derive(Debug, Default)]
pub struct Emitter {
    chunks: VecDeque<Chunk>,
}

impl Emitter {
    pub fn push(&mut self, chunk: impl Into<Chunk>) {
        self.chunks.push_back(chunk.into());
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn take(&mut self) -> VecDeque<Chunk> {
        std::mem::take(&mut self.chunks)
    }
}

#[async_trait]
impl<S: Source + ?Sized> Source for Box<S> {
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        (**self).produce().await
    }
    async fn close(&mut self) -> anyhow::Result<()> {
        (**self).close().await
    }
    async fn destroy(&mut self, cause: &PipelineError) {
        (**self).destroy(cause).await
    }
    fn name(&self) -> String {
        (**self).name()
    }
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        (**self).consume(chunk).await
    }
    async fn close(&mut self) -> anyhow::Result<()> {
        (**self).close().await
    }
    async fn destroy(&mut self, cause: &PipelineError) {
        (**self).destroy(cause).await
    }
    fn name(&self) -> String {
        (**self).name()
    }
}

#[async_trait]
impl<T: Transform + ?Sized> Transform for Box<T> {
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()> {
        (**self).transform(chunk, out).await
    }
    async fn flush(&mut self, out: &mut Emitter) -> anyhow::Result<()> {
        (**self).flush(out).await
    }
    async fn close(&mut self) -> anyhow::Result<()> {
        (**self).close().await
    }
    async fn destroy(&mut self, cause: &PipelineError) {
        (**self).destroy(cause).await
    }
    fn name(&self) -> String {
        (**self).name()
    }
}

/// One member of a chain, tagged by capability.
pub enum Stage {
    Source(Box<dyn Source>),
    Transform(Box<dyn Transform>),
    Sink(Box<dyn Sink>),
    /// Driven as a pair: upstream chunks go into the sink half, the source
    /// half feeds downstream.
    Duplex(Duplex),
}

impl Stage {
    pub fn source(source: impl Source + 'static) -> Self {
        Stage::Source(Box::new(source))
    }

    pub fn transform(transform: impl Transform + 'static) -> Self {
        Stage::Transform(Box::new(transform))
    }

    pub fn sink(sink: impl Sink + 'static) -> Self {
        Stage::Sink(Box::new(sink))
    }

    pub fn role(&self) -> Role {
        match self {
            Stage::Source(_) => Role::Source,
            Stage::Transform(_) => Role::Transform,
            Stage::Sink(_) => Role::Sink,
            Stage::Duplex(_) => Role::Duplex,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Stage::Source(s) => s.name(),
            Stage::Transform(t) => t.name(),
            Stage::Sink(k) => k.name(),
            Stage::Duplex(d) => d.name().to_string(),
        }
    }

    /// Can this stage head a chain?
    pub fn can_source(&self) -> bool {
        matches!(self, Stage::Source(_))
    }

    /// Can this stage end a chain?
    pub fn can_sink(&self) -> bool {
        matches!(self, Stage::Sink(_))
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.role(), self.name())
    }
}

/// `sluice::stage::func::Map<F>` becomes `Map`.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
