use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::MeterError;
use crate::models::{Brand, MeterModel, Parameter};

pub mod utils;

pub use utils::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegisterKind {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Encoding {
    Float32,
    UInt16,
    UInt32,
    Bitfield,
}

impl Encoding {
    pub fn word_count(&self) -> u16 {
        match self {
            Encoding::Float32 | Encoding::UInt32 => 2,
            Encoding::UInt16 | Encoding::Bitfield => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterEntry {
    pub parameter: Parameter,
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
    pub encoding: Encoding,
    pub scale: f32,
    pub access: Access,
    pub unit_of_measurement: &'static str,
}

impl RegisterEntry {
    fn new(parameter: Parameter, kind: RegisterKind, address: u16, encoding: Encoding, access: Access, unit: &'static str) -> Self {
        return RegisterEntry {
            parameter,
            kind,
            address,
            count: encoding.word_count(),
            encoding,
            scale: 1.0,
            access,
            unit_of_measurement: unit,
        };
    }

    pub fn is_read_only(&self) -> bool {
        self.access == Access::ReadOnly
    }
}

/// How a meter stores its line speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BaudrateCoding {
    /// The register holds the speed in bit/s
    Direct,
    /// The register holds an index into [`EASTRON_BAUDRATE_CODES`]
    EastronCode,
}

pub const SUPPORTED_BAUDRATES: [u32; 6] = [1200, 2400, 4800, 9600, 19200, 38400];

pub const EASTRON_BAUDRATE_CODES: [(u32, u32); 6] = [(0, 2400), (1, 4800), (2, 9600), (3, 19200), (4, 38400), (5, 1200)];

impl BaudrateCoding {
    /// Register content -> bit/s
    pub fn decode(&self, raw: u32) -> Option<u32> {
        match self {
            BaudrateCoding::Direct => SUPPORTED_BAUDRATES.contains(&raw).then_some(raw),
            BaudrateCoding::EastronCode => EASTRON_BAUDRATE_CODES.iter().find(|(code, _)| *code == raw).map(|(_, baud)| *baud),
        }
    }

    /// bit/s -> register content
    pub fn encode(&self, baudrate: u32) -> Option<u32> {
        match self {
            BaudrateCoding::Direct => SUPPORTED_BAUDRATES.contains(&baudrate).then_some(baudrate),
            BaudrateCoding::EastronCode => EASTRON_BAUDRATE_CODES.iter().find(|(_, baud)| *baud == baudrate).map(|(code, _)| *code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayTraits {
    /// Relay writes must carry the key derived from the serial number
    pub requires_key: bool,
    pub supports_auto: bool,
}

/// All registers of one model. Built once, shared read-only.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    pub model: MeterModel,
    pub baudrate_coding: BaudrateCoding,
    pub relay: Option<RelayTraits>,
    entries: BTreeMap<Parameter, RegisterEntry>,
}

impl RegisterMap {
    fn new(model: MeterModel, baudrate_coding: BaudrateCoding, relay: Option<RelayTraits>) -> Self {
        return RegisterMap { model, baudrate_coding, relay, entries: BTreeMap::new() };
    }

    fn add(&mut self, entry: RegisterEntry) {
        self.entries.insert(entry.parameter, entry);
    }

    pub fn get(&self, parameter: Parameter) -> Option<&RegisterEntry> {
        self.entries.get(&parameter)
    }

    pub fn lookup(&self, parameter: Parameter) -> Result<&RegisterEntry, MeterError> {
        self.get(parameter).ok_or(MeterError::UnsupportedParameter { model: self.model, parameter })
    }

    /// Supported parameters in curious mode order
    pub fn parameters(&self) -> Vec<Parameter> {
        Parameter::ALL.iter().copied().filter(|p| self.entries.contains_key(p)).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegisterEntry> {
        self.entries.values()
    }
}

use Access::{ReadOnly, ReadWrite};
use Encoding::{Bitfield, Float32, UInt16, UInt32};
use RegisterKind::{Holding, Input};

fn eastron_definition(model: MeterModel, three_phase: bool) -> RegisterMap {
    let mut map = RegisterMap::new(model, BaudrateCoding::EastronCode, None);

    map.add(RegisterEntry::new(Parameter::TotalKwh, Input, 0x156, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::ImportKwh, Input, 0x48, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::ExportKwh, Input, 0x4A, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::Power, Input, 0x34, Float32, ReadOnly, "W"));
    map.add(RegisterEntry::new(Parameter::L1Current, Input, 0x06, Float32, ReadOnly, "A"));
    map.add(RegisterEntry::new(Parameter::L1Voltage, Input, 0x00, Float32, ReadOnly, "V"));
    if three_phase {
        map.add(RegisterEntry::new(Parameter::L2Current, Input, 0x08, Float32, ReadOnly, "A"));
        map.add(RegisterEntry::new(Parameter::L3Current, Input, 0x0A, Float32, ReadOnly, "A"));
        map.add(RegisterEntry::new(Parameter::L2Voltage, Input, 0x02, Float32, ReadOnly, "V"));
        map.add(RegisterEntry::new(Parameter::L3Voltage, Input, 0x04, Float32, ReadOnly, "V"));
    }
    map.add(RegisterEntry::new(Parameter::PowerFactor, Input, 0x3E, Float32, ReadOnly, ""));
    map.add(RegisterEntry::new(Parameter::Frequency, Input, 0x46, Float32, ReadOnly, "Hz"));

    // Configuration lives in holding registers, small integers stored as float32
    map.add(RegisterEntry::new(Parameter::SerialNumber, Holding, 0xFC00, UInt32, ReadOnly, ""));
    map.add(RegisterEntry::new(Parameter::Baudrate, Holding, 0x1C, Float32, ReadWrite, "bit/s"));
    map.add(RegisterEntry::new(Parameter::UnitId, Holding, 0x14, Float32, ReadWrite, ""));

    map
}

const FINECO_RELAY: RelayTraits = RelayTraits { requires_key: true, supports_auto: true };

fn fineco_common(map: &mut RegisterMap) {
    map.add(RegisterEntry::new(Parameter::SerialNumber, Input, 0xFF00, UInt32, ReadWrite, ""));
    map.add(RegisterEntry::new(Parameter::RelayState, Input, 0x566, Bitfield, ReadWrite, "(01..=on, 10..=off)"));
    map.add(RegisterEntry::new(Parameter::Baudrate, Input, 0x525, UInt16, ReadWrite, "bit/s"));
}

pub fn get_em115_definition() -> RegisterMap {
    let mut map = RegisterMap::new(MeterModel::EM115, BaudrateCoding::Direct, Some(FINECO_RELAY));

    map.add(RegisterEntry::new(Parameter::TotalKwh, Input, 0x16A, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::ImportKwh, Input, 0x160, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::ExportKwh, Input, 0x166, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::Power, Input, 0x08, Float32, ReadOnly, "W"));
    map.add(RegisterEntry::new(Parameter::L1Current, Input, 0x06, Float32, ReadOnly, "A"));
    map.add(RegisterEntry::new(Parameter::L1Voltage, Input, 0x02, Float32, ReadOnly, "V"));
    map.add(RegisterEntry::new(Parameter::PowerFactor, Input, 0x0E, Float32, ReadOnly, ""));
    map.add(RegisterEntry::new(Parameter::Frequency, Input, 0x04, Float32, ReadOnly, "Hz"));
    fineco_common(&mut map);
    map.add(RegisterEntry::new(Parameter::UnitId, Input, 0x524, UInt16, ReadWrite, ""));

    map
}

pub fn get_em737_definition() -> RegisterMap {
    let mut map = RegisterMap::new(MeterModel::EM737, BaudrateCoding::Direct, Some(FINECO_RELAY));

    map.add(RegisterEntry::new(Parameter::TotalKwh, Input, 0x700, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::ImportKwh, Input, 0x800, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::ExportKwh, Input, 0x900, Float32, ReadOnly, "kWh"));
    map.add(RegisterEntry::new(Parameter::Power, Input, 0x26, Float32, ReadOnly, "W"));
    map.add(RegisterEntry::new(Parameter::L1Current, Input, 0x16, Float32, ReadOnly, "A"));
    map.add(RegisterEntry::new(Parameter::L2Current, Input, 0x18, Float32, ReadOnly, "A"));
    map.add(RegisterEntry::new(Parameter::L3Current, Input, 0x1A, Float32, ReadOnly, "A"));
    map.add(RegisterEntry::new(Parameter::L1Voltage, Input, 0x10, Float32, ReadOnly, "V"));
    map.add(RegisterEntry::new(Parameter::L2Voltage, Input, 0x12, Float32, ReadOnly, "V"));
    map.add(RegisterEntry::new(Parameter::L3Voltage, Input, 0x14, Float32, ReadOnly, "V"));
    map.add(RegisterEntry::new(Parameter::PowerFactor, Input, 0x3E, Float32, ReadOnly, ""));
    map.add(RegisterEntry::new(Parameter::Frequency, Input, 0x40, Float32, ReadOnly, "Hz"));
    fineco_common(&mut map);
    /* The EM737 answers the unit id on the holding table only */
    map.add(RegisterEntry::new(Parameter::UnitId, Holding, 0x524, UInt16, ReadWrite, ""));

    map
}

pub fn get_definition(model: MeterModel) -> RegisterMap {
    match model {
        MeterModel::EM115 => get_em115_definition(),
        MeterModel::EM737 => get_em737_definition(),
        MeterModel::SDM72 => eastron_definition(model, true),
        MeterModel::SDM120 => eastron_definition(model, false),
        MeterModel::SDM230 => eastron_definition(model, false),
        MeterModel::SDM630 => eastron_definition(model, true),
    }
}

lazy_static! {
    static ref REGISTER_MAPS: Vec<RegisterMap> = MeterModel::ALL.iter().map(|m| get_definition(*m)).collect();
}

/// The shared register map of `model`
pub fn register_map(model: MeterModel) -> &'static RegisterMap {
    let index = match model {
        MeterModel::EM115 => 0,
        MeterModel::EM737 => 1,
        MeterModel::SDM72 => 2,
        MeterModel::SDM120 => 3,
        MeterModel::SDM230 => 4,
        MeterModel::SDM630 => 5,
    };
    &REGISTER_MAPS[index]
}

pub fn lookup(model: MeterModel, parameter: Parameter) -> Result<&'static RegisterEntry, MeterError> {
    register_map(model).lookup(parameter)
}

/// Brand level sanity of a map, used by the tests and logged at startup
pub fn describe(map: &RegisterMap) -> String {
    let brand = match map.model.brand() {
        Brand::Fineco => "Fineco",
        Brand::Eastron => "Eastron",
    };
    format!("{brand} {} with {} registers", map.model, map.entries.len())
}
