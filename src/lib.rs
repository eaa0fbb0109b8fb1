//! Backpressure-aware stream pipelines and pattern-routed services.
//!
//! Stages ([`Source`], [`Transform`], [`Sink`], [`Duplex`]) are chained into a
//! [`Pipeline`], which moves [`Chunk`]s between them through bounded pipes and
//! tears the whole chain down on the first failure. The [`Dispatcher`] routes
//! JSON envelopes to handlers by pattern and plugs into a pipeline as a
//! transform.

pub mod adder;
pub mod chunk;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod duplex;
pub mod error;
pub mod flow;
pub mod logger;
pub mod pipe;
pub mod pump;
pub mod server;
pub mod stage;

pub use chunk::{Chunk, Weight};
pub use client::Client;
pub use config::{PipelineConfig, ServiceConfig};
pub use dispatch::{Dispatched, Dispatcher, Handler};
pub use duplex::{Duplex, DuplexReader, DuplexWriter};
pub use error::{ErrorKind, PipelineError, ProtocolViolation};
pub use flow::{Delivery, FlowController, HighWaterMark};
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use pump::{Pipeline, PipelineBuilder, PipelineControl, PipelineHandle};
pub use server::Server;
pub use stage::{Emitter, Sink, Source, Stage, StageState, Transform};
pub use sluice_wire::{Envelope, Pattern, Response};
