// tests/duplex_test.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice::codec::{Lines, NdjsonDecoder, NdjsonEncoder};
use sluice::error::ErrorKind;
use sluice::stage::func::{collect, from_fn, iter, map};
use sluice::{
    Chunk, Duplex, Pipeline, PipelineConfig, PipelineError, Sink, Source, Stage, StageState,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Default)]
struct Hooks {
    destroyed: AtomicUsize,
    closed: AtomicUsize,
}

/// Never ends on its own.
struct Idle(Arc<Hooks>);

#[async_trait]
impl Source for Idle {
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        std::future::pending().await
    }
    async fn close(&mut self) -> anyhow::Result<()> {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn destroy(&mut self, _cause: &PipelineError) {
        self.0.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Discard(Arc<Hooks>);

#[async_trait]
impl Sink for Discard {
    async fn consume(&mut self, _chunk: Chunk) -> anyhow::Result<()> {
        Ok(())
    }
    async fn close(&mut self) -> anyhow::Result<()> {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn destroy(&mut self, _cause: &PipelineError) {
        self.0.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn looped_duplex_feeds_its_own_sink() {
    let (sink, seen) = collect();
    let duplex = Duplex::new("echo", sink, iter(["a", "b", "c"]));
    duplex.looped(PipelineConfig::default()).run().await.unwrap();
    assert_eq!(seen.bytes(), b"abc");
    assert!(seen.is_closed());
}

#[tokio::test]
async fn duplex_mid_chain_is_transparent() {
    let (inner_sink, written) = collect();
    let duplex = Duplex::new("side", inner_sink, iter(["from-duplex"]));
    let (sink, seen) = collect();

    Pipeline::from_source(iter(["from-head"]))
        .through_duplex(duplex)
        .into_sink(sink)
        .run()
        .await
        .unwrap();

    assert_eq!(written.bytes(), b"from-head");
    assert_eq!(seen.bytes(), b"from-duplex");
}

#[tokio::test]
async fn chain_composes_transforms_into_one_duplex() {
    let upper = map(|c: Chunk| {
        let text = String::from_utf8_lossy(c.as_bytes().unwrap_or_default()).to_uppercase();
        Ok(Some(Chunk::from(text)))
    });
    let composed = Duplex::chain(
        vec![Stage::transform(Lines::new()), Stage::transform(upper)],
        PipelineConfig::default(),
    )
    .unwrap();
    assert_eq!(composed.name(), "chain(lines,map)");

    let (sink, seen) = collect();
    Pipeline::from_source(iter(["hel", "lo\nwor", "ld"]))
        .through_duplex(composed)
        .into_sink(sink)
        .run()
        .await
        .unwrap();
    assert_eq!(
        seen.chunks(),
        vec![Chunk::from("HELLO"), Chunk::from("WORLD")]
    );
}

#[tokio::test]
async fn chain_rejects_sources_inside() {
    let err = Duplex::chain(vec![Stage::source(iter(["x"]))], PipelineConfig::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn destroying_one_half_tears_down_both() {
    let hooks = Arc::new(Hooks::default());
    let duplex = Duplex::new("pair", Discard(hooks.clone()), Idle(hooks.clone()));
    let (reader, writer) = duplex.split();

    let (sink, _) = collect();
    let reading = Pipeline::from_source(reader).into_sink(sink).spawn();

    let ticks = from_fn(|| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        anyhow::Ok(Some(Chunk::from("tick")))
    });
    let writing = Pipeline::from_source(ticks).into_sink(writer).spawn();

    tokio::time::sleep(Duration::from_millis(20)).await;
    reading.destroy("reader side gone");

    let read_err = reading.wait().await.unwrap_err();
    assert_eq!(read_err, PipelineError::destroyed("reader side gone"));

    let write_err = tokio::time::timeout(Duration::from_secs(2), writing.wait())
        .await
        .expect("peer pipeline must notice")
        .unwrap_err();
    assert_eq!(write_err, PipelineError::destroyed("reader side gone"));

    assert_eq!(hooks.destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn explicit_close_closes_both_halves_once() {
    let hooks = Arc::new(Hooks::default());
    let duplex = Duplex::new("pair", Discard(hooks.clone()), Idle(hooks.clone()));
    duplex.write("x".into()).await.unwrap();
    duplex.close().await.unwrap();
    duplex.close().await.unwrap();
    assert_eq!(hooks.closed.load(Ordering::SeqCst), 2);
    assert_eq!(duplex.state(), StageState::Closed);
}

#[tokio::test]
async fn byte_duplex_over_an_io_stream() {
    let (near, mut far) = tokio::io::duplex(256);
    let duplex = Duplex::from_io(near, "bytes", 64);

    duplex.write("ping".into()).await.unwrap();
    let mut buf = [0u8; 4];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    far.write_all(b"pong").await.unwrap();
    far.shutdown().await.unwrap();
    let mut got = Vec::new();
    while let Some(chunk) = duplex.read().await.unwrap() {
        got.extend_from_slice(chunk.as_bytes().unwrap());
    }
    assert_eq!(got, b"pong");
}

#[tokio::test]
async fn ndjson_round_trip_through_a_pipeline() {
    let records = vec![json!({"n": 1}), json!({"n": 2, "s": "two"})];
    let (sink, seen) = collect();
    Pipeline::from_source(iter(records.clone()))
        .through(NdjsonEncoder)
        .through(NdjsonDecoder::new())
        .into_sink(sink)
        .run()
        .await
        .unwrap();
    assert_eq!(seen.records(), records);
}
