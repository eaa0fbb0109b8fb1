//! Stages built from plain iterators and closures.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;

use super::{Emitter, Sink, Source, Transform};
use crate::chunk::Chunk;

/// Source that yields every item of an iterator, then ends.
pub fn iter<I>(items: I) -> FromIter<I::IntoIter>
where
    I: IntoIterator,
    I::Item: Into<Chunk>,
    I::IntoIter: Send,
{
    FromIter {
        items: items.into_iter(),
        name: "iter".into(),
    }
}

pub struct FromIter<I> {
    items: I,
    name: String,
}

impl<I> FromIter<I> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<I> Source for FromIter<I>
where
    I: Iterator + Send,
    I::Item: Into<Chunk>,
{
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        Ok(self.items.next().map(Into::into))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Source driven by an async closure. Returning `Ok(None)` ends the stream.
pub fn from_fn<F, Fut>(produce: F) -> FromFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<Option<Chunk>>> + Send + 'static,
{
    FromFn {
        produce,
        name: "from_fn".into(),
    }
}

pub struct FromFn<F> {
    produce: F,
    name: String,
}

impl<F> FromFn<F> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Source for FromFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<Option<Chunk>>> + Send + 'static,
{
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        (self.produce)().await
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Sink driven by an async closure.
pub fn to_fn<F, Fut>(consume: F) -> ToFn<F>
where
    F: FnMut(Chunk) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    ToFn {
        consume,
        name: "to_fn".into(),
    }
}

pub struct ToFn<F> {
    consume: F,
    name: String,
}

impl<F> ToFn<F> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Sink for ToFn<F>
where
    F: FnMut(Chunk) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        (self.consume)(chunk).await
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Synchronous one-to-one transform. `Ok(None)` drops the chunk.
pub fn map<F>(f: F) -> Map<F>
where
    F: FnMut(Chunk) -> anyhow::Result<Option<Chunk>> + Send,
{
    Map {
        f,
        name: "map".into(),
    }
}

pub struct Map<F> {
    f: F,
    name: String,
}

impl<F> Map<F> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<F> Transform for Map<F>
where
    F: FnMut(Chunk) -> anyhow::Result<Option<Chunk>> + Send,
{
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()> {
        if let Some(mapped) = (self.f)(chunk)? {
            out.push(mapped);
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Sink that keeps everything it receives, plus a handle to read it back.
pub fn collect() -> (Collect, Collected) {
    let collected = Collected::default();
    (
        Collect {
            into: collected.clone(),
        },
        collected,
    )
}

pub struct Collect {
    into: Collected,
}

#[async_trait]
impl Sink for Collect {
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        self.into.lock().chunks.push(chunk);
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.into.lock().closed = true;
        Ok(())
    }

    fn name(&self) -> String {
        "collect".into()
    }
}

#[derive(Debug, Default)]
struct Gathered {
    chunks: Vec<Chunk>,
    closed: bool,
}

/// Shared view of what a [`Collect`] sink received.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    inner: Arc<Mutex<Gathered>>,
}

impl Collected {
    fn lock(&self) -> std::sync::MutexGuard<'_, Gathered> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.lock().chunks.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    /// Byte chunks concatenated in arrival order.
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for chunk in self.lock().chunks.iter() {
            if let Some(data) = chunk.as_bytes() {
                buf.extend_from_slice(data);
            }
        }
        buf.to_vec()
    }

    pub fn records(&self) -> Vec<Value> {
        self.lock()
            .chunks
            .iter()
            .filter_map(|c| c.as_record().cloned())
            .collect()
    }

    /// True once the sink saw end of stream.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
