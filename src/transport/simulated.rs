//! In-memory meter used by the tests. It speaks the register layout of the
//! chosen model and reacts to writes of the unit id, baudrate and relay
//! registers the way the real devices do.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Connector, Transport, TransportError};
use crate::models::{Channel, MeterModel, Parameter, RelayState, SerialNumber};
use crate::registers::utils::{decode, encode, f32_to_words};
use crate::registers::{register_map, Encoding, RegisterKind, RegisterMap};
use crate::relay_key::derive_key;

pub struct SimulatedMeter {
    pub map: &'static RegisterMap,
    pub unit: u8,
    pub line_baudrate: u32,
    pub registers: HashMap<u16, u16>,
    /// Addresses that never answer
    pub timeouts: HashSet<u16>,
    /// Acknowledge writes without applying them
    pub ignore_writes: bool,
    /// Only the first open succeeds
    pub fail_reopen: bool,
    /// Pattern reported after the relay was put in auto mode, the relay position
    /// on real devices
    pub auto_position: Option<u16>,
    /// Every read or write that reached the meter
    pub calls: usize,
    pub writes: Vec<(u8, u16, Vec<u16>)>,
    pub opened: Vec<Channel>,
}

pub type SharedMeter = Arc<Mutex<SimulatedMeter>>;

impl SimulatedMeter {
    pub fn new(model: MeterModel) -> Self {
        let map = register_map(model);
        let mut meter = SimulatedMeter {
            map,
            unit: 1,
            line_baudrate: 9600,
            registers: HashMap::new(),
            timeouts: HashSet::new(),
            ignore_writes: false,
            fail_reopen: false,
            auto_position: None,
            calls: 0,
            writes: Vec::new(),
            opened: Vec::new(),
        };

        for entry in map.entries() {
            let value = match entry.parameter {
                Parameter::L1Voltage | Parameter::L2Voltage | Parameter::L3Voltage => 231.38,
                Parameter::L1Current | Parameter::L2Current | Parameter::L3Current => 1.5,
                Parameter::Power => 345.0,
                Parameter::TotalKwh | Parameter::ImportKwh => 1234.5,
                Parameter::ExportKwh => 12.25,
                Parameter::PowerFactor => 0.98,
                Parameter::Frequency => 50.0,
                Parameter::SerialNumber => 286331153.0,
                Parameter::RelayState => RelayState::Off.pattern() as f64,
                Parameter::Baudrate => map.baudrate_coding.encode(9600).unwrap_or(9600) as f64,
                Parameter::UnitId => 1.0,
            };
            let words = encode(entry, value).unwrap();
            meter.store(entry.address, &words);
        }

        meter
    }

    pub fn shared(self) -> SharedMeter {
        Arc::new(Mutex::new(self))
    }

    pub fn store(&mut self, address: u16, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            self.registers.insert(address + i as u16, *w);
        }
    }

    pub fn store_f32(&mut self, address: u16, value: f32) {
        self.store(address, &f32_to_words(value));
    }

    fn serial_number(&self) -> SerialNumber {
        let entry = self.map.lookup(Parameter::SerialNumber).unwrap();
        let words: Vec<u16> = (0..entry.count).map(|i| self.registers.get(&(entry.address + i)).copied().unwrap_or(0)).collect();
        SerialNumber(decode(entry, &words).unwrap().as_u32().unwrap())
    }

    fn reachable(&self, unit: u8, baudrate: Option<u32>, start: u16, count: u16) -> Result<(), TransportError> {
        let silent = Duration::from_millis(1);
        if unit != self.unit {
            return Err(TransportError::Timeout(silent));
        }
        if let Some(b) = baudrate {
            if b != self.line_baudrate {
                return Err(TransportError::Timeout(silent));
            }
        }
        if (start..start + count).any(|a| self.timeouts.contains(&a)) {
            return Err(TransportError::Timeout(silent));
        }
        Ok(())
    }

    fn read(&mut self, unit: u8, baudrate: Option<u32>, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        self.calls += 1;
        self.reachable(unit, baudrate, start, count)?;
        Ok((start..start + count).map(|a| self.registers.get(&a).copied().unwrap_or(0)).collect())
    }

    fn write(&mut self, unit: u8, baudrate: Option<u32>, start: u16, words: &[u16]) -> Result<(), TransportError> {
        self.calls += 1;
        self.reachable(unit, baudrate, start, words.len() as u16)?;
        self.writes.push((unit, start, words.to_vec()));

        if self.ignore_writes {
            return Ok(());
        }

        if let Some(relay) = self.map.get(Parameter::RelayState) {
            if relay.address == start {
                let requires_key = self.map.relay.map(|r| r.requires_key).unwrap_or(false);
                let pattern = match (requires_key, words) {
                    (true, [key, pattern]) if *key == derive_key(self.serial_number()) => Some(*pattern),
                    (false, [pattern]) => Some(*pattern),
                    _ => None,
                };
                /* a wrong key is acknowledged and ignored */
                if let Some(p) = pattern {
                    let reported = match self.auto_position {
                        Some(position) if p == RelayState::Auto.pattern() => position,
                        _ => p,
                    };
                    self.store(start, &[reported]);
                }
                return Ok(());
            }
        }

        self.store(start, words);

        for entry in self.map.entries() {
            if entry.address != start || entry.encoding == Encoding::Bitfield {
                continue;
            }
            let Some(value) = decode(entry, words).ok().and_then(|v| v.as_u32()) else {
                continue;
            };
            match entry.parameter {
                Parameter::UnitId => self.unit = value as u8,
                Parameter::Baudrate => {
                    if let Some(b) = self.map.baudrate_coding.decode(value) {
                        self.line_baudrate = b;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

pub struct SimulatedTransport {
    meter: SharedMeter,
    baudrate: Option<u32>,
    open: bool,
}

impl SimulatedTransport {
    /// Like a real link, a timeout leaves the line unusable
    fn track<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if matches!(result, Err(TransportError::Timeout(_))) {
            self.open = false;
        }
        result
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn read(&mut self, unit: u8, _kind: RegisterKind, start: u16, count: u16, _timeout: Duration) -> Result<Vec<u16>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let result = self.meter.lock().unwrap().read(unit, self.baudrate, start, count);
        self.track(result)
    }

    async fn write(&mut self, unit: u8, start: u16, words: &[u16], _timeout: Duration) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let result = self.meter.lock().unwrap().write(unit, self.baudrate, start, words);
        self.track(result)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}

pub struct SimulatedConnector {
    pub meter: SharedMeter,
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self, channel: &Channel, _timeout: Duration) -> Result<Box<dyn Transport>, TransportError> {
        let mut meter = self.meter.lock().unwrap();
        if meter.fail_reopen && !meter.opened.is_empty() {
            return Err(TransportError::Open { channel: channel.to_string(), reason: "No such device".to_string() });
        }
        meter.opened.push(channel.clone());

        let baudrate = match channel {
            Channel::Serial { baudrate, .. } => Some(*baudrate),
            Channel::Gateway { .. } => None,
        };
        Ok(Box::new(SimulatedTransport { meter: self.meter.clone(), baudrate, open: true }))
    }
}
