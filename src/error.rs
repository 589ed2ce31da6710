use std::fmt;
use thiserror::Error;

use crate::models::{MeterModel, Parameter};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Transport failure: {0}")]
    Transport(TransportError),
    #[error("No open connection to the meter")]
    NotConnected,
    #[error("{parameter} is not supported by {model}")]
    UnsupportedParameter { model: MeterModel, parameter: Parameter },
    #[error("Relay mode '{mode}' is not supported by {model}")]
    UnsupportedRelayMode { model: MeterModel, mode: String },
    #[error("{0} can not be changed through a Modbus gateway, change the gateway configuration instead")]
    UnsupportedOnGateway(Parameter),
    #[error("{0} is read only on this meter")]
    ReadOnlyParameter(Parameter),
    #[error("Writing {parameter} was acknowledged but the meter reports {actual} instead of {expected}")]
    WriteNotConfirmed { parameter: Parameter, expected: String, actual: String },
    #[error("Baudrate change to {requested} could not be confirmed: {reason}. The meter may now be talking at a speed this session is not using, some meters only accept the change after the 'set' button sequence")]
    BaudrateChangeUnconfirmed { requested: u32, reason: String },
    #[error("Malformed number '{0}', use decimal, 0x hexadecimal or 0b binary")]
    InvalidEncoding(String),
    #[error("Invalid value for {parameter}: {reason}")]
    InvalidValue { parameter: Parameter, reason: String },
    #[error("Unexpected value for {parameter}: {value}")]
    UnexpectedValue { parameter: Parameter, value: String },
}

impl From<TransportError> for MeterError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => MeterError::Timeout(d),
            other => MeterError::Transport(other),
        }
    }
}

/// Step of a command sequence, reported together with the error that stopped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    SanityRead,
    Unlock,
    Write,
    Confirm,
    Reconnect,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validation",
            Stage::SanityRead => "sanity read",
            Stage::Unlock => "unlock",
            Stage::Write => "write",
            Stage::Confirm => "confirmation",
            Stage::Reconnect => "reconnect",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct StepError {
    pub stage: Stage,
    #[source]
    pub source: MeterError,
    /// Value read before anything was written, when the sequence got that far
    pub before: Option<String>,
}

impl StepError {
    pub fn new(stage: Stage, source: MeterError) -> Self {
        return StepError { stage, source, before: None };
    }

    pub fn with_before(mut self, before: impl fmt::Display) -> Self {
        self.before = Some(before.to_string());
        self
    }
}

/// Tags a fallible step with its stage, `client.get(..).await.at(Stage::SanityRead)?`
pub trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StepError>;
}

impl<T> AtStage<T> for Result<T, MeterError> {
    fn at(self, stage: Stage) -> Result<T, StepError> {
        self.map_err(|e| StepError::new(stage, e))
    }
}
