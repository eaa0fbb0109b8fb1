// src/pump.rs
//
// Drives a validated chain of stages. Adjacent stages are linked by bounded
// pipes; every stage runs its own loop and all loops are polled together in
// the calling task. The first failure cancels every loop, after which each
// member receives exactly one terminal hook.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::duplex::Duplex;
use crate::error::{classify, Fault, PipelineError};
use crate::flow::HighWaterMark;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::stage::{Emitter, Sink, Source, Stage, StageState, Transform};

/// Called once with the run's outcome, after every terminal hook ran.
pub type Completion = Box<dyn FnOnce(&Result<(), PipelineError>) + Send>;

// -----------------------------------------------------------------------------
// Shared teardown record
// -----------------------------------------------------------------------------

#[derive(Default)]
struct Outcome {
    // origin index (None for external destroy) and the error
    first: Option<(Option<usize>, PipelineError)>,
    settled: bool,
}

struct Teardown {
    token: CancellationToken,
    outcome: Mutex<Outcome>,
    states: Mutex<Vec<StageState>>,
}

impl Teardown {
    fn new(stages: usize) -> Self {
        Self {
            token: CancellationToken::new(),
            outcome: Mutex::new(Outcome::default()),
            states: Mutex::new(vec![StageState::Idle; stages]),
        }
    }

    fn outcome(&self) -> MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn states(&self) -> MutexGuard<'_, Vec<StageState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record the first failure and halt every loop. Later calls are no-ops.
    fn fail(&self, origin: Option<usize>, err: PipelineError) -> bool {
        let mut outcome = self.outcome();
        if outcome.settled || outcome.first.is_some() {
            return false;
        }
        outcome.first = Some((origin, err));
        drop(outcome);
        self.token.cancel();
        true
    }

    fn first(&self) -> Option<(Option<usize>, PipelineError)> {
        self.outcome().first.clone()
    }

    fn settle(&self) {
        self.outcome().settled = true;
    }

    fn halted(&self) -> PipelineError {
        self.first()
            .map(|(_, err)| err)
            .unwrap_or_else(|| PipelineError::destroyed("halted"))
    }

    fn set_state(&self, index: usize, state: StageState) {
        if let Some(slot) = self.states().get_mut(index) {
            *slot = state;
        }
    }

    fn set_all(&self, state: StageState) {
        self.states().iter_mut().for_each(|s| *s = state);
    }
}

/// Await `work` unless the pipeline is halted first.
async fn guard<T>(
    td: &Teardown,
    work: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = td.token.cancelled() => Err(td.halted()),
        result = work => result,
    }
}

pub(crate) fn aggregate(states: &[StageState]) -> StageState {
    use StageState::*;
    if states.contains(&Failed) {
        Failed
    } else if states.iter().all(|s| *s == Closed) {
        Closed
    } else if states.iter().all(|s| *s == Idle) {
        Idle
    } else if states.contains(&Active) {
        Active
    } else {
        Draining
    }
}

// -----------------------------------------------------------------------------
// Control surface
// -----------------------------------------------------------------------------

/// Cloneable handle to observe or tear down a pipeline from outside.
#[derive(Clone)]
pub struct PipelineControl {
    teardown: Arc<Teardown>,
    names: Arc<Vec<String>>,
}

impl PipelineControl {
    /// Tear the pipeline down. Returns false if it already failed, was
    /// already destroyed, or has finished.
    pub fn destroy(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let first = self
            .teardown
            .fail(None, PipelineError::destroyed(reason.clone()));
        if first {
            info!(%reason, "pipeline destroyed");
        }
        first
    }

    /// Aggregate state over all members.
    pub fn state(&self) -> StageState {
        aggregate(&self.teardown.states())
    }

    pub fn stage_states(&self) -> Vec<(String, StageState)> {
        self.names
            .iter()
            .cloned()
            .zip(self.teardown.states().iter().copied())
            .collect()
    }

    /// The error that ended the run, if any.
    pub fn error(&self) -> Option<PipelineError> {
        self.teardown.first().map(|(_, err)| err)
    }
}

/// A pipeline running on its own task.
pub struct PipelineHandle {
    control: PipelineControl,
    join: JoinHandle<Result<(), PipelineError>>,
}

impl PipelineHandle {
    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    pub fn destroy(&self, reason: impl Into<String>) -> bool {
        self.control.destroy(reason)
    }

    pub fn state(&self) -> StageState {
        self.control.state()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the single completion.
    pub async fn wait(self) -> Result<(), PipelineError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::destroyed(format!("pipeline task failed: {e}"))),
        }
    }
}

// -----------------------------------------------------------------------------
// Pipeline
// -----------------------------------------------------------------------------

struct Slot {
    index: usize,
    name: String,
    stage: Stage,
    state: StageState,
}

impl Slot {
    async fn close(&mut self) -> Result<(), PipelineError> {
        let name = &self.name;
        match &mut self.stage {
            Stage::Source(s) => s
                .close()
                .await
                .map_err(|e| classify(e, name, Fault::Production)),
            Stage::Transform(t) => t
                .close()
                .await
                .map_err(|e| classify(e, name, Fault::Consumption)),
            Stage::Sink(k) => k
                .close()
                .await
                .map_err(|e| classify(e, name, Fault::Consumption)),
            Stage::Duplex(d) => d.close().await,
        }
    }

    async fn destroy(&mut self, cause: &PipelineError) {
        match &mut self.stage {
            Stage::Source(s) => s.destroy(cause).await,
            Stage::Transform(t) => t.destroy(cause).await,
            Stage::Sink(k) => k.destroy(cause).await,
            Stage::Duplex(d) => d.destroy_with(cause.clone()).await,
        }
    }
}

/// A validated chain: one source, zero or more transforms or duplexes, one sink.
pub struct Pipeline {
    slots: Vec<Slot>,
    config: PipelineConfig,
    on_complete: Option<Completion>,
    control: PipelineControl,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.describe())
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    /// Start a chain with `source`; see [`PipelineBuilder`].
    pub fn from_source(source: impl Source + 'static) -> PipelineBuilder {
        PipelineBuilder {
            stages: vec![Stage::source(source)],
            config: PipelineConfig::default(),
        }
    }

    /// Build from an explicit stage list.
    ///
    /// The head must be a source, the tail a sink, and everything between
    /// a transform or a duplex.
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        if stages.len() < 2 {
            return Err(PipelineError::Invalid(
                "a pipeline needs at least a source and a sink".into(),
            ));
        }
        let last = stages.len() - 1;
        for (i, stage) in stages.iter().enumerate() {
            let fits = match i {
                0 => stage.can_source(),
                i if i == last => stage.can_sink(),
                _ => matches!(stage, Stage::Transform(_) | Stage::Duplex(_)),
            };
            if !fits {
                let place = match i {
                    0 => "head",
                    i if i == last => "tail",
                    _ => "middle",
                };
                return Err(PipelineError::Invalid(format!(
                    "{} '{}' cannot be the {place} of a pipeline",
                    stage.role(),
                    stage.name()
                )));
            }
        }
        Ok(Self::assemble(stages, PipelineConfig::default()))
    }

    fn assemble(stages: Vec<Stage>, config: PipelineConfig) -> Self {
        let slots: Vec<Slot> = stages
            .into_iter()
            .enumerate()
            .map(|(index, stage)| Slot {
                index,
                name: stage.name(),
                stage,
                state: StageState::Idle,
            })
            .collect();
        let control = PipelineControl {
            teardown: Arc::new(Teardown::new(slots.len())),
            names: Arc::new(slots.iter().map(|s| s.name.clone()).collect()),
        };
        Self {
            slots,
            config,
            on_complete: None,
            control,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the completion callback.
    pub fn on_complete(
        mut self,
        callback: impl FnOnce(&Result<(), PipelineError>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn describe(&self) -> String {
        self.stage_names().join(" -> ")
    }

    /// Run on a fresh task.
    pub fn spawn(self) -> PipelineHandle {
        let control = self.control();
        let join = tokio::spawn(self.run());
        PipelineHandle { control, join }
    }

    /// Move data until the sink finishes or something fails.
    #[tracing::instrument(name = "pipeline", skip_all, fields(stages = self.slots.len()))]
    pub async fn run(self) -> Result<(), PipelineError> {
        let chain = self.describe();
        let Pipeline {
            mut slots,
            config,
            on_complete,
            control,
        } = self;
        let td = control.teardown.clone();

        info!(pipeline = %chain, "pipeline started");
        let links = link(&slots, config.high_water_mark);
        td.set_all(StageState::Active);
        for slot in slots.iter_mut() {
            slot.state = StageState::Active;
        }

        {
            let loops: Vec<BoxFuture<'_, ()>> = slots
                .iter_mut()
                .zip(links)
                .map(|(slot, (input, output))| drive(slot, input, output, &td).boxed())
                .collect();
            let all = join_all(loops);
            match config.timeout {
                Some(limit) => {
                    tokio::pin!(all);
                    if tokio::time::timeout(limit, &mut all).await.is_err() {
                        td.fail(
                            None,
                            PipelineError::destroyed(format!("timed out after {limit:?}")),
                        );
                        all.await;
                    }
                }
                None => {
                    all.await;
                }
            }
        }

        let result = settle(&mut slots, &td).await;
        match &result {
            Ok(()) => info!(pipeline = %chain, "pipeline closed"),
            Err(err) => error!(pipeline = %chain, error = %err, "pipeline failed"),
        }
        if let Some(callback) = on_complete {
            callback(&result);
        }
        result
    }
}

/// Stepwise construction that only accepts stages where they fit.
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn through(mut self, transform: impl Transform + 'static) -> Self {
        self.stages.push(Stage::transform(transform));
        self
    }

    pub fn through_duplex(mut self, duplex: Duplex) -> Self {
        self.stages.push(Stage::Duplex(duplex));
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn high_water_mark(mut self, mark: HighWaterMark) -> Self {
        self.config.high_water_mark = mark;
        self
    }

    pub fn into_sink(mut self, sink: impl Sink + 'static) -> Pipeline {
        self.stages.push(Stage::sink(sink));
        Pipeline::assemble(self.stages, self.config)
    }
}

// -----------------------------------------------------------------------------
// Driving
// -----------------------------------------------------------------------------

type Link = (Option<PipeReader>, Option<PipeWriter>);

/// One (input, output) pair per slot.
fn link(slots: &[Slot], mark: HighWaterMark) -> Vec<Link> {
    let mut links: Vec<Link> = slots.iter().map(|_| (None, None)).collect();
    for i in 1..slots.len() {
        let (writer, reader) = pipe(
            format!("{}->{}", slots[i - 1].name, slots[i].name),
            mark,
        );
        links[i - 1].1 = Some(writer);
        links[i].0 = Some(reader);
    }
    links
}

async fn drive(
    slot: &mut Slot,
    input: Option<PipeReader>,
    output: Option<PipeWriter>,
    td: &Teardown,
) {
    let index = slot.index;
    let name = slot.name.clone();
    let outcome = match (&mut slot.stage, input, output) {
        (Stage::Source(source), None, Some(output)) => {
            pump_source(&name, source.as_mut(), &output, td).await
        }
        (Stage::Transform(transform), Some(mut input), Some(output)) => {
            pump_transform(&name, transform.as_mut(), &mut input, &output, td).await
        }
        (Stage::Sink(sink), Some(mut input), None) => {
            pump_sink(&name, sink.as_mut(), &mut input, td).await
        }
        (Stage::Duplex(duplex), Some(mut input), Some(output)) => {
            pump_duplex(&name, duplex, &mut input, &output, td).await
        }
        _ => Err(PipelineError::Invalid(format!(
            "'{name}' is not wired for its position"
        ))),
    };
    match outcome {
        Ok(()) => {
            td.set_state(index, StageState::Draining);
            slot.state = StageState::Draining;
            debug!(stage = %name, index, "stage finished");
        }
        Err(err) => {
            if td.fail(Some(index), err.clone()) {
                warn!(stage = %name, index, error = %err, "stage failed");
            }
        }
    }
}

async fn pump_source(
    name: &str,
    source: &mut dyn Source,
    output: &PipeWriter,
    td: &Teardown,
) -> Result<(), PipelineError> {
    let mut produced = 0u64;
    loop {
        let next = guard(td, async {
            source
                .produce()
                .await
                .map_err(|e| classify(e, name, Fault::Production))
        })
        .await?;
        match next {
            Some(chunk) => {
                produced += 1;
                guard(td, output.send(chunk)).await?;
            }
            None => {
                debug!(stage = %name, produced, "end of stream");
                output.end()?;
                return Ok(());
            }
        }
    }
}

async fn pump_transform(
    name: &str,
    transform: &mut dyn Transform,
    input: &mut PipeReader,
    output: &PipeWriter,
    td: &Teardown,
) -> Result<(), PipelineError> {
    loop {
        let next = guard(td, input.recv()).await?;
        let mut out = Emitter::default();
        let ended = next.is_none();
        match next {
            Some(chunk) => {
                guard(td, async {
                    transform
                        .transform(chunk, &mut out)
                        .await
                        .map_err(|e| classify(e, name, Fault::Consumption))
                })
                .await?
            }
            None => {
                guard(td, async {
                    transform
                        .flush(&mut out)
                        .await
                        .map_err(|e| classify(e, name, Fault::Production))
                })
                .await?
            }
        }
        // the input chunk stays outstanding until its outputs are accepted
        for chunk in out.take() {
            guard(td, output.send(chunk)).await?;
        }
        if ended {
            output.end()?;
            return Ok(());
        }
    }
}

async fn pump_sink(
    name: &str,
    sink: &mut dyn Sink,
    input: &mut PipeReader,
    td: &Teardown,
) -> Result<(), PipelineError> {
    let mut consumed = 0u64;
    loop {
        match guard(td, input.recv()).await? {
            Some(chunk) => {
                guard(td, async {
                    sink.consume(chunk)
                        .await
                        .map_err(|e| classify(e, name, Fault::Consumption))
                })
                .await?;
                consumed += 1;
            }
            None => {
                debug!(stage = %name, consumed, "input ended");
                return Ok(());
            }
        }
    }
}

async fn pump_duplex(
    name: &str,
    duplex: &mut Duplex,
    input: &mut PipeReader,
    output: &PipeWriter,
    td: &Teardown,
) -> Result<(), PipelineError> {
    let (reader, writer) = duplex.halves_mut();
    let feed = async {
        loop {
            match guard(td, input.recv()).await? {
                Some(chunk) => {
                    guard(td, async {
                        writer
                            .consume(chunk)
                            .await
                            .map_err(|e| classify(e, name, Fault::Consumption))
                    })
                    .await?
                }
                None => {
                    guard(td, async {
                        writer
                            .close()
                            .await
                            .map_err(|e| classify(e, name, Fault::Consumption))
                    })
                    .await?;
                    return Ok::<(), PipelineError>(());
                }
            }
        }
    };
    let drain = pump_source(name, reader, output, td);
    tokio::try_join!(feed, drain).map(|_| ())
}

/// Run the terminal hooks once the loops are done.
///
/// On success members close downstream-first and the head last. On failure
/// the origin is destroyed first, then everything downstream of it, then
/// everything upstream walking back to the head.
async fn settle(slots: &mut [Slot], td: &Teardown) -> Result<(), PipelineError> {
    if td.first().is_none() {
        let order = (1..slots.len()).chain(std::iter::once(0));
        for i in order {
            if td.first().is_some() {
                break;
            }
            let slot = &mut slots[i];
            match slot.close().await {
                Ok(()) => {
                    slot.state = StageState::Closed;
                    td.set_state(i, StageState::Closed);
                }
                Err(err) => {
                    slot.state = StageState::Failed;
                    td.set_state(i, StageState::Failed);
                    td.fail(Some(i), err);
                    break;
                }
            }
        }
    }

    let result = match td.first() {
        None => Ok(()),
        Some((origin, err)) => {
            let origin = origin.unwrap_or(0);
            let order = (origin..slots.len()).chain((0..origin).rev());
            for i in order {
                let slot = &mut slots[i];
                if slot.state.is_terminal() {
                    continue;
                }
                slot.destroy(&err).await;
                slot.state = StageState::Failed;
                td.set_state(i, StageState::Failed);
                debug!(stage = %slot.name, index = i, "stage destroyed");
            }
            Err(err)
        }
    };
    td.settle();
    result
}
