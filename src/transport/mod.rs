//! Register exchange with the meter.
//!
//! A [`Transport`] performs one request/response exchange at a time on an open
//! channel. A [`Connector`] opens transports, the session keeps it around to
//! reopen the line at another speed or after the link fell out of step.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::Channel;
use crate::registers::RegisterKind;

pub mod modbus;
#[cfg(test)]
pub mod simulated;

pub use modbus::{ModbusConnector, ModbusLink};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Unable to open {channel}: {reason}")]
    Open { channel: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Modbus error: {0}")]
    Protocol(String),
    #[error("Connection already closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send {
    /// Reads `count` registers starting at `start` from the given register table
    async fn read(&mut self, unit: u8, kind: RegisterKind, start: u16, count: u16, timeout: Duration) -> Result<Vec<u16>, TransportError>;

    /// Write multiple holding registers starting at `start`
    async fn write(&mut self, unit: u8, start: u16, words: &[u16], timeout: Duration) -> Result<(), TransportError>;

    /// False once the link can no longer be trusted to pair requests with replies
    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, channel: &Channel, timeout: Duration) -> Result<Box<dyn Transport>, TransportError>;
}
