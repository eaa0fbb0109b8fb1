use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Everything that can end a pipeline run.
///
/// The error is `Clone` because one failure is fanned out to every member
/// stage's `destroy` hook and to the run's single completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A source (or a transform's flush) could not produce its next chunk.
    #[error("stage '{stage}' failed to produce: {message}")]
    Production { stage: String, message: String },

    /// A sink or transform rejected or failed to forward a chunk.
    #[error("stage '{stage}' failed to consume: {message}")]
    Consumption { stage: String, message: String },

    /// A chunk was written after `Deferred` without awaiting capacity.
    #[error("backpressure violation at '{stage}': write after Deferred without awaiting capacity")]
    BackpressureViolation { stage: String },

    /// Malformed input or a broken stage contract.
    #[error("protocol error at '{stage}': {message}")]
    Protocol { stage: String, message: String },

    /// Torn down from outside (API call, timeout, peer failure).
    #[error("destroyed: {0}")]
    Destroyed(String),

    /// The chain cannot be built.
    #[error("invalid pipeline: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Production,
    Consumption,
    BackpressureViolation,
    Protocol,
    Destroyed,
    Invalid,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Production { .. } => ErrorKind::Production,
            PipelineError::Consumption { .. } => ErrorKind::Consumption,
            PipelineError::BackpressureViolation { .. } => ErrorKind::BackpressureViolation,
            PipelineError::Protocol { .. } => ErrorKind::Protocol,
            PipelineError::Destroyed(_) => ErrorKind::Destroyed,
            PipelineError::Invalid(_) => ErrorKind::Invalid,
        }
    }

    /// Name of the stage the error was raised in, when known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Production { stage, .. }
            | PipelineError::Consumption { stage, .. }
            | PipelineError::BackpressureViolation { stage }
            | PipelineError::Protocol { stage, .. } => Some(stage),
            PipelineError::Destroyed(_) | PipelineError::Invalid(_) => None,
        }
    }

    pub fn protocol(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Protocol {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn destroyed(reason: impl Into<String>) -> Self {
        PipelineError::Destroyed(reason.into())
    }
}

/// Raised by a stage hook to report malformed input or a contract breach.
///
/// The driver turns it into [`PipelineError::Protocol`] rather than a plain
/// production or consumption failure.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProtocolViolation(pub String);

/// Which side of a stage failed, used to classify opaque hook errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Production,
    Consumption,
}

/// Map an error returned by a stage hook onto the pipeline taxonomy.
pub(crate) fn classify(err: anyhow::Error, stage: &str, fault: Fault) -> PipelineError {
    if let Some(known) = err.downcast_ref::<PipelineError>() {
        return known.clone();
    }
    if let Some(violation) = err.downcast_ref::<ProtocolViolation>() {
        return PipelineError::protocol(stage, violation.0.clone());
    }
    let message = format!("{err:#}");
    match fault {
        Fault::Production => PipelineError::Production {
            stage: stage.to_string(),
            message,
        },
        Fault::Consumption => PipelineError::Consumption {
            stage: stage.to_string(),
            message,
        },
    }
}
