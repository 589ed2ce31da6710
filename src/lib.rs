//! Read and configure Fineco and Eastron electricity meters over Modbus.
//!
//! A [`MeterSession`] owns the channel to one meter, a [`MeterClient`] reads and
//! writes its registers by parameter name and the [`sequencer`] runs the
//! write-and-verify sequences for relay, baudrate, unit id and serial number.

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod registers;
pub mod relay_key;
pub mod sequencer;
pub mod session;
pub mod transport;

// Re-export common types for easier access
pub use client::{MeterClient, VoltageReading};
pub use config::{Config, SessionConfig};
pub use error::{MeterError, Stage, StepError};
pub use models::{Channel, GatewayFraming, MeterModel, Parameter, RelayState, SerialNumber};
pub use registers::{lookup, register_map, Value};
pub use session::MeterSession;
pub use transport::{Connector, ModbusConnector, Transport, TransportError};
