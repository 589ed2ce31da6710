use log::{debug, info, warn};
use serde::Serialize;

use crate::error::MeterError;
use crate::models::{MeterModel, Parameter, RelayState, SerialNumber};
use crate::registers::utils::{decode, encode};
use crate::registers::{RegisterMap, Value};
use crate::session::MeterSession;

/// L1 voltage with the outcome of the plausibility check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageReading {
    pub volts: f64,
    pub plausible: bool,
}

/// Typed register access on top of a [`MeterSession`]
pub struct MeterClient {
    session: MeterSession,
}

impl MeterClient {
    pub fn new(session: MeterSession) -> Self {
        return MeterClient { session };
    }

    pub fn model(&self) -> MeterModel {
        self.session.model()
    }

    pub fn map(&self) -> &'static RegisterMap {
        self.session.map()
    }

    pub fn session(&self) -> &MeterSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut MeterSession {
        &mut self.session
    }

    pub async fn get(&mut self, parameter: Parameter) -> Result<Value, MeterError> {
        let entry = self.map().lookup(parameter)?;
        let words = self.session.read_entry(entry).await?;
        let value = decode(entry, &words)?;
        debug!("{} = {} {}", parameter, value, entry.unit_of_measurement);
        return Ok(value);
    }

    pub async fn set(&mut self, parameter: Parameter, value: f64) -> Result<(), MeterError> {
        let entry = self.map().lookup(parameter)?;
        if entry.is_read_only() {
            return Err(MeterError::ReadOnlyParameter(parameter));
        }
        let words = encode(entry, value)?;
        self.session.write_words(entry.address, &words).await
    }

    /// Writes a prepared payload to the register of `parameter`, for writes that
    /// carry more than the value itself
    pub async fn set_words(&mut self, parameter: Parameter, words: &[u16]) -> Result<(), MeterError> {
        let entry = self.map().lookup(parameter)?;
        if entry.is_read_only() {
            return Err(MeterError::ReadOnlyParameter(parameter));
        }
        self.session.write_words(entry.address, words).await
    }

    /// Reads every register the model defines. A failing register is recorded
    /// and reading goes on with the next one.
    pub async fn probe_all(&mut self) -> Vec<(Parameter, Result<Value, MeterError>)> {
        let mut results = Vec::new();
        for parameter in self.map().parameters() {
            let result = self.get(parameter).await;
            if let Err(e) = &result {
                warn!("Reading {parameter} failed: {e}");
            }
            results.push((parameter, result));
        }
        results
    }

    pub async fn get_voltage(&mut self) -> Result<VoltageReading, MeterError> {
        let value = self.get(Parameter::L1Voltage).await?;
        let volts = value.as_f64().ok_or_else(|| unexpected(Parameter::L1Voltage, &value))?;

        let plausible = self.session.config().voltage_plausible(volts);
        if plausible {
            info!("Voltage test: {volts:.2} V");
        } else {
            warn!("Voltage test: {volts:.2} V is outside of the expected range, check wiring, unit id and baudrate");
        }
        Ok(VoltageReading { volts, plausible })
    }

    pub async fn get_relay_state(&mut self) -> Result<RelayState, MeterError> {
        let value = self.get(Parameter::RelayState).await?;
        match &value {
            Value::Bits(words) if words.len() == 1 => {
                RelayState::from_pattern(words[0]).ok_or_else(|| unexpected(Parameter::RelayState, &value))
            }
            _ => Err(unexpected(Parameter::RelayState, &value)),
        }
    }

    pub async fn get_baudrate(&mut self) -> Result<u32, MeterError> {
        let value = self.get(Parameter::Baudrate).await?;
        value
            .as_u32()
            .and_then(|raw| self.map().baudrate_coding.decode(raw))
            .ok_or_else(|| unexpected(Parameter::Baudrate, &value))
    }

    pub async fn get_unit_id(&mut self) -> Result<u8, MeterError> {
        let value = self.get(Parameter::UnitId).await?;
        match value.as_u32() {
            Some(id @ 1..=255) => Ok(id as u8),
            _ => Err(unexpected(Parameter::UnitId, &value)),
        }
    }

    pub async fn get_serial_number(&mut self) -> Result<SerialNumber, MeterError> {
        let value = self.get(Parameter::SerialNumber).await?;
        match value {
            Value::Unsigned(v) => Ok(SerialNumber(v)),
            other => Err(unexpected(Parameter::SerialNumber, &other)),
        }
    }
}

fn unexpected(parameter: Parameter, value: &Value) -> MeterError {
    MeterError::UnexpectedValue { parameter, value: value.to_string() }
}
