// src/pipe.rs
//
// A bounded single-producer/single-consumer link between two stages. The
// writer side follows the delivery protocol of the flow controller: after a
// `Deferred` delivery it must await `ready()` before writing again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::chunk::{Chunk, Weight};
use crate::error::PipelineError;
use crate::flow::{Delivery, FlowController, HighWaterMark};
use crate::stage::{Sink, Source};

struct PipeState {
    queue: VecDeque<Chunk>,
    flow: FlowController,
    // handed to the reader but not yet released
    in_flight: Option<Weight>,
    ended: bool,
    reader_closed: bool,
    error: Option<PipelineError>,
}

struct Shared {
    name: String,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abort(&self, err: PipelineError) {
        {
            let mut st = self.lock();
            if st.error.is_none() {
                st.error = Some(err);
            }
        }
        self.readable.notify_one();
        self.writable.notify_one();
    }

    fn reader_gone(&self) -> PipelineError {
        PipelineError::destroyed(format!("pipe '{}' has no reader", self.name))
    }
}

/// Create a linked writer/reader pair bounded by `mark`.
pub fn pipe(name: impl Into<String>, mark: HighWaterMark) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        name: name.into(),
        state: Mutex::new(PipeState {
            queue: VecDeque::new(),
            flow: FlowController::new(mark),
            in_flight: None,
            ended: false,
            reader_closed: false,
            error: None,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Deliver one chunk.
    ///
    /// Returns `Deferred` when the pipe is at or above its high-water mark.
    /// Writing again before `ready()` resolves aborts the pipe with a
    /// backpressure violation.
    pub fn write(&self, chunk: Chunk) -> Result<Delivery, PipelineError> {
        let mut st = self.shared.lock();
        if let Some(err) = &st.error {
            return Err(err.clone());
        }
        if st.ended {
            return Err(PipelineError::protocol(
                &self.shared.name,
                "write after end of stream",
            ));
        }
        if st.reader_closed {
            return Err(self.shared.reader_gone());
        }
        match st.flow.admit(chunk.weight()) {
            Ok(delivery) => {
                st.queue.push_back(chunk);
                trace!(pipe = %self.shared.name, ?delivery, buffered = st.queue.len(), "write");
                drop(st);
                self.shared.readable.notify_one();
                Ok(delivery)
            }
            Err(_) => {
                let err = PipelineError::BackpressureViolation {
                    stage: self.shared.name.clone(),
                };
                st.error = Some(err.clone());
                drop(st);
                warn!(pipe = %self.shared.name, "write after Deferred without awaiting capacity");
                self.shared.readable.notify_one();
                self.shared.writable.notify_one();
                Err(err)
            }
        }
    }

    /// Resolve once the writer may deliver again. Immediate unless the last
    /// delivery was deferred.
    pub async fn ready(&self) -> Result<(), PipelineError> {
        loop {
            let notified = self.shared.writable.notified();
            {
                let mut st = self.shared.lock();
                if let Some(err) = &st.error {
                    return Err(err.clone());
                }
                if st.reader_closed {
                    return Err(self.shared.reader_gone());
                }
                if st.flow.acknowledge() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// `write` followed by `ready` when the delivery was deferred.
    pub async fn send(&self, chunk: Chunk) -> Result<(), PipelineError> {
        if self.write(chunk)? == Delivery::Deferred {
            self.ready().await?;
        }
        Ok(())
    }

    /// Signal end of stream. A second call is reported to the caller only.
    pub fn end(&self) -> Result<(), PipelineError> {
        {
            let mut st = self.shared.lock();
            if let Some(err) = &st.error {
                return Err(err.clone());
            }
            if st.ended {
                return Err(PipelineError::protocol(
                    &self.shared.name,
                    "end of stream signalled twice",
                ));
            }
            st.ended = true;
        }
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Fail the pipe. Both ends observe `err` on their next operation.
    pub fn abort(&self, err: PipelineError) {
        self.shared.abort(err);
    }

    pub fn is_deferred(&self) -> bool {
        self.shared.lock().flow.is_deferred()
    }

    pub fn outstanding(&self) -> Weight {
        self.shared.lock().flow.outstanding()
    }

    /// Highest outstanding weight the pipe ever held.
    pub fn peak(&self) -> Weight {
        self.shared.lock().flow.peak()
    }

    pub fn mark(&self) -> HighWaterMark {
        self.shared.lock().flow.mark()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let finished = {
            let st = self.shared.lock();
            st.ended || st.error.is_some()
        };
        if !finished {
            self.shared.abort(PipelineError::destroyed(format!(
                "writer of '{}' dropped before end of stream",
                self.shared.name
            )));
        }
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Next chunk, `None` at end of stream.
    ///
    /// The previously returned chunk stays counted against the high-water
    /// mark until this is called again.
    pub async fn recv(&mut self) -> Result<Option<Chunk>, PipelineError> {
        self.release_in_flight();
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut st = self.shared.lock();
                if let Some(err) = &st.error {
                    return Err(err.clone());
                }
                if let Some(chunk) = st.queue.pop_front() {
                    st.in_flight = Some(chunk.weight());
                    return Ok(Some(chunk));
                }
                if st.ended {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Stop reading. The writer fails its next operation.
    pub fn close(&mut self) {
        self.release_in_flight();
        self.shared.lock().reader_closed = true;
        self.shared.writable.notify_one();
    }

    pub fn abort(&self, err: PipelineError) {
        self.shared.abort(err);
    }

    /// Chunks waiting in the pipe.
    pub fn buffered(&self) -> usize {
        self.shared.lock().queue.len()
    }

    fn release_in_flight(&self) {
        let wake = {
            let mut st = self.shared.lock();
            match st.in_flight.take() {
                Some(weight) => st.flow.release(weight),
                None => false,
            }
        };
        if wake {
            self.shared.writable.notify_one();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Source for PipeReader {
    async fn produce(&mut self) -> anyhow::Result<Option<Chunk>> {
        Ok(self.recv().await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        PipeReader::close(self);
        Ok(())
    }

    async fn destroy(&mut self, cause: &PipelineError) {
        self.abort(cause.clone());
    }

    fn name(&self) -> String {
        self.shared.name.clone()
    }
}

#[async_trait]
impl Sink for PipeWriter {
    async fn consume(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        Ok(self.send(chunk).await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(self.end()?)
    }

    async fn destroy(&mut self, cause: &PipelineError) {
        self.abort(cause.clone());
    }

    fn name(&self) -> String {
        self.shared.name.clone()
    }
}
