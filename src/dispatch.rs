// src/dispatch.rs
//
// Routes envelopes to handlers by partial-field pattern. Registration order
// decides priority: the first pattern that matches wins.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use sluice_wire::response::HANDLER_FAILED;
use sluice_wire::{Envelope, Pattern, Response, REPLY_FIELD};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::chunk::Chunk;
use crate::error::ProtocolViolation;
use crate::stage::{Emitter, Transform};

/// Business logic behind a pattern. Called at most once per envelope.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<Value> {
        (self)(envelope).await
    }
}

/// Where an envelope is in its trip through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DispatchPhase {
    Received,
    Matching,
    Matched,
    Unmatched,
    Handled,
    Replied,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no pattern matches {envelope}")]
    Miss { envelope: String },

    #[error("handler for {pattern} failed: {message}")]
    Handler { pattern: String, message: String },
}

/// Outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: Response,
    /// Reply route copied from the envelope, if it carried one.
    pub reply_to: Option<Value>,
    /// Pattern that handled the envelope.
    pub matched: Option<Pattern>,
    pub error: Option<DispatchError>,
    pub phase: DispatchPhase,
}

impl Dispatched {
    /// Wire form of the reply, or `None` when the envelope named no route.
    /// Producing it moves the dispatch to [`DispatchPhase::Replied`].
    pub fn reply(&mut self, reply_field: &str) -> Option<Value> {
        let route = self.reply_to.clone()?;
        self.phase = DispatchPhase::Replied;
        Some(self.response.clone().into_reply(reply_field, route))
    }

    pub fn into_reply(mut self, reply_field: &str) -> Option<Value> {
        self.reply(reply_field)
    }
}

struct Route {
    pattern: Pattern,
    handler: Arc<dyn Handler>,
}

#[derive(Default)]
pub struct DispatcherBuilder {
    routes: Vec<Route>,
    reply_field: Option<String>,
}

impl DispatcherBuilder {
    /// Register `handler` for `pattern`. Earlier registrations take priority.
    pub fn add(mut self, pattern: Pattern, handler: impl Handler + 'static) -> Self {
        self.routes.push(Route {
            pattern,
            handler: Arc::new(handler),
        });
        self
    }

    /// Field that carries the reply route. Defaults to `returnPath`.
    pub fn reply_field(mut self, field: impl Into<String>) -> Self {
        self.reply_field = Some(field.into());
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            routes: self.routes,
            reply_field: self.reply_field.unwrap_or_else(|| REPLY_FIELD.to_string()),
        }
    }
}

pub struct Dispatcher {
    routes: Vec<Route>,
    reply_field: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("patterns", &self.patterns().collect::<Vec<_>>())
            .field("reply_field", &self.reply_field)
            .finish()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn reply_field(&self) -> &str {
        &self.reply_field
    }

    /// Registered patterns in priority order.
    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.routes.iter().map(|r| &r.pattern)
    }

    /// The first registered pattern matching `envelope`.
    pub fn lookup(&self, envelope: &Envelope) -> Option<&Pattern> {
        self.route_for(envelope).map(|r| &r.pattern)
    }

    fn route_for(&self, envelope: &Envelope) -> Option<&Route> {
        self.routes.iter().find(|r| r.pattern.matches(envelope))
    }

    /// Match `envelope` and run its handler. A miss never reaches any handler
    /// and answers `Not Implemented`; a handler error or panic answers with
    /// an error response. Either way the reply route is preserved.
    #[tracing::instrument(name = "dispatch", skip_all)]
    pub async fn dispatch(&self, envelope: Envelope) -> Dispatched {
        trace!(phase = %DispatchPhase::Received, %envelope);
        let reply_to = envelope.reply_to(&self.reply_field).cloned();

        trace!(phase = %DispatchPhase::Matching, routes = self.routes.len());
        let Some(route) = self.route_for(&envelope) else {
            let error = DispatchError::Miss {
                envelope: envelope.to_string(),
            };
            debug!(phase = %DispatchPhase::Unmatched, "{error}");
            return Dispatched {
                response: Response::not_implemented(&envelope),
                reply_to,
                matched: None,
                error: Some(error),
                phase: DispatchPhase::Unmatched,
            };
        };

        let pattern = route.pattern.clone();
        debug!(phase = %DispatchPhase::Matched, %pattern);

        let outcome = AssertUnwindSafe(route.handler.handle(envelope))
            .catch_unwind()
            .await;
        let (response, error) = match outcome {
            Ok(Ok(data)) => (Response::ok(data), None),
            Ok(Err(e)) => handler_failure(&pattern, format!("{e:#}")),
            Err(_) => handler_failure(&pattern, "handler panicked".to_string()),
        };
        trace!(phase = %DispatchPhase::Handled, ok = response.is_ok());

        Dispatched {
            response,
            reply_to,
            matched: Some(pattern),
            error,
            phase: DispatchPhase::Handled,
        }
    }

    /// A transform that dispatches every inbound record and emits the
    /// replies of envelopes that named a route.
    pub fn stage(self: &Arc<Self>) -> DispatchStage {
        DispatchStage {
            dispatcher: self.clone(),
        }
    }
}

fn handler_failure(pattern: &Pattern, message: String) -> (Response, Option<DispatchError>) {
    let error = DispatchError::Handler {
        pattern: pattern.to_string(),
        message,
    };
    warn!("{error}");
    (
        Response::fail(HANDLER_FAILED, error.to_string(), None),
        Some(error),
    )
}

/// Pipeline face of a [`Dispatcher`]. Anything that is not a JSON object
/// is a protocol violation and ends the stream.
pub struct DispatchStage {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl Transform for DispatchStage {
    async fn transform(&mut self, chunk: Chunk, out: &mut Emitter) -> anyhow::Result<()> {
        let Some(record) = chunk.into_record() else {
            return Err(ProtocolViolation("dispatch expects records, got bytes".into()).into());
        };
        let envelope = Envelope::try_from(record)
            .map_err(|e| ProtocolViolation(format!("malformed envelope: {e}")))?;

        let mut dispatched = self.dispatcher.dispatch(envelope).await;
        match dispatched.reply(self.dispatcher.reply_field()) {
            Some(reply) => {
                trace!(phase = %dispatched.phase, "reply emitted");
                out.push(Chunk::Record(reply));
            }
            None => debug!("no reply route, result discarded"),
        }
        Ok(())
    }

    fn name(&self) -> String {
        "dispatch".into()
    }
}
