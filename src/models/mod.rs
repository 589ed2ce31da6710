use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::MeterError;

/// Meter models known to the register tables
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum MeterModel {
    EM115,
    EM737,
    SDM72,
    SDM120,
    SDM230,
    SDM630,
}

impl MeterModel {
    pub const ALL: [MeterModel; 6] = [
        MeterModel::EM115,
        MeterModel::EM737,
        MeterModel::SDM72,
        MeterModel::SDM120,
        MeterModel::SDM230,
        MeterModel::SDM630,
    ];

    pub fn brand(&self) -> Brand {
        match self {
            MeterModel::EM115 | MeterModel::EM737 => Brand::Fineco,
            _ => Brand::Eastron,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MeterModel::EM115 => "EM115",
            MeterModel::EM737 => "EM737",
            MeterModel::SDM72 => "SDM72",
            MeterModel::SDM120 => "SDM120",
            MeterModel::SDM230 => "SDM230",
            MeterModel::SDM630 => "SDM630",
        }
    }
}

impl fmt::Display for MeterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for MeterModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeterModel::ALL.into_iter().find(|m| m.name().eq_ignore_ascii_case(s)).ok_or_else(|| {
            let names = MeterModel::ALL.map(|m| m.name());
            format!("unknown meter model '{s}', expected one of {}", names.join(", "))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Brand {
    Fineco,
    Eastron,
}

/// Semantic parameters a register map can resolve
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    TotalKwh,
    ImportKwh,
    ExportKwh,
    Power,
    L1Current,
    L2Current,
    L3Current,
    L1Voltage,
    L2Voltage,
    L3Voltage,
    PowerFactor,
    Frequency,
    SerialNumber,
    RelayState,
    Baudrate,
    UnitId,
}

impl Parameter {
    /// Curious mode order
    pub const ALL: [Parameter; 16] = [
        Parameter::TotalKwh,
        Parameter::ImportKwh,
        Parameter::ExportKwh,
        Parameter::Power,
        Parameter::L1Current,
        Parameter::L2Current,
        Parameter::L3Current,
        Parameter::L1Voltage,
        Parameter::L2Voltage,
        Parameter::L3Voltage,
        Parameter::PowerFactor,
        Parameter::Frequency,
        Parameter::SerialNumber,
        Parameter::RelayState,
        Parameter::Baudrate,
        Parameter::UnitId,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Parameter::TotalKwh => "total_kwh",
            Parameter::ImportKwh => "import_kwh",
            Parameter::ExportKwh => "export_kwh",
            Parameter::Power => "power",
            Parameter::L1Current => "l1_current",
            Parameter::L2Current => "l2_current",
            Parameter::L3Current => "l3_current",
            Parameter::L1Voltage => "l1_voltage",
            Parameter::L2Voltage => "l2_voltage",
            Parameter::L3Voltage => "l3_voltage",
            Parameter::PowerFactor => "power_factor",
            Parameter::Frequency => "frequency",
            Parameter::SerialNumber => "serial_number",
            Parameter::RelayState => "relay_state",
            Parameter::Baudrate => "baudrate",
            Parameter::UnitId => "unit_id",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Framing used on a TCP gateway: plain Modbus TCP or RTU frames tunnelled over TCP
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum GatewayFraming {
    Tcp,
    RtuOverTcp,
}

impl FromStr for GatewayFraming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(GatewayFraming::Tcp),
            "rtu" | "rtu-over-tcp" => Ok(GatewayFraming::RtuOverTcp),
            _ => Err(format!("unknown gateway framing '{s}', expected tcp or rtu")),
        }
    }
}

/// Where the meter is reached. Exactly one kind is active per session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum Channel {
    Serial { path: String, baudrate: u32 },
    Gateway { host: String, port: u16, framing: GatewayFraming },
}

impl Channel {
    pub fn is_gateway(&self) -> bool {
        matches!(self, Channel::Gateway { .. })
    }

    /// Same physical line at another speed. Gateways are returned unchanged.
    pub fn with_baudrate(&self, baudrate: u32) -> Channel {
        match self {
            Channel::Serial { path, .. } => Channel::Serial { path: path.clone(), baudrate },
            gateway => gateway.clone(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Serial { path, baudrate } => write!(f, "{path}@{baudrate}"),
            Channel::Gateway { host, port, framing } => write!(f, "{host}:{port} ({framing:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    On,
    Off,
    Auto,
}

impl RelayState {
    /// Register word, 2 bits per slot: `01` on, `10` off
    pub fn pattern(&self) -> u16 {
        match self {
            RelayState::On => 0x5555,
            RelayState::Off => 0xAAAA,
            RelayState::Auto => 0x8888,
        }
    }

    pub fn from_pattern(word: u16) -> Option<RelayState> {
        match word {
            0x5555 => Some(RelayState::On),
            0xAAAA => Some(RelayState::Off),
            0x8888 => Some(RelayState::Auto),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayState::On => "on",
            RelayState::Off => "off",
            RelayState::Auto => "auto",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RelayState {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "on" | "1" => Ok(RelayState::On),
            "off" | "0" => Ok(RelayState::Off),
            "auto" => Ok(RelayState::Auto),
            other => Err(MeterError::InvalidValue {
                parameter: Parameter::RelayState,
                reason: format!("'{other}' is not one of on, off, auto, 0, 1"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SerialNumber(pub u32);

impl SerialNumber {
    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn decimal(&self) -> String {
        format!("{}", self.0)
    }

    pub fn hex(&self) -> String {
        format!("{:#x}", self.0)
    }

    pub fn binary(&self) -> String {
        format!("{:#b}", self.0)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.decimal(), self.hex(), self.binary())
    }
}

impl FromStr for SerialNumber {
    type Err = MeterError;

    /// Accepts "1234", "0x4d2" and "0b10011010010"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let literal = s.trim();
        let lower = literal.to_lowercase();

        let parsed = if let Some(digits) = lower.strip_prefix("0x") {
            u32::from_str_radix(digits, 16)
        } else if let Some(digits) = lower.strip_prefix("0b") {
            u32::from_str_radix(digits, 2)
        } else {
            lower.parse::<u32>()
        };

        match parsed {
            Ok(v) => Ok(SerialNumber(v)),
            Err(_) => Err(MeterError::InvalidEncoding(literal.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_literals_canonicalize() {
        let dec: SerialNumber = "1234".parse().unwrap();
        let hex: SerialNumber = "0x4d2".parse().unwrap();
        let bin: SerialNumber = "0b10011010010".parse().unwrap();
        assert_eq!(dec, SerialNumber(1234));
        assert_eq!(dec, hex);
        assert_eq!(dec, bin);
        assert_eq!("0X4D2".parse::<SerialNumber>().unwrap(), dec);
    }

    #[test]
    fn test_serial_literal_rejects_garbage() {
        assert!(matches!("0xzz".parse::<SerialNumber>(), Err(MeterError::InvalidEncoding(_))));
        assert!(matches!("0b102".parse::<SerialNumber>(), Err(MeterError::InvalidEncoding(_))));
        assert!(matches!("".parse::<SerialNumber>(), Err(MeterError::InvalidEncoding(_))));
        assert!(matches!("-5".parse::<SerialNumber>(), Err(MeterError::InvalidEncoding(_))));
        assert!(matches!("4294967296".parse::<SerialNumber>(), Err(MeterError::InvalidEncoding(_))));
    }

    #[test]
    fn test_serial_renderings() {
        let sn = SerialNumber(1234);
        assert_eq!(sn.decimal(), "1234");
        assert_eq!(sn.hex(), "0x4d2");
        assert_eq!(sn.binary(), "0b10011010010");
    }

    #[test]
    fn test_relay_aliases() {
        assert_eq!("on".parse::<RelayState>().unwrap(), RelayState::On);
        assert_eq!("1".parse::<RelayState>().unwrap(), RelayState::On);
        assert_eq!("off".parse::<RelayState>().unwrap(), RelayState::Off);
        assert_eq!("0".parse::<RelayState>().unwrap(), RelayState::Off);
        assert_eq!("auto".parse::<RelayState>().unwrap(), RelayState::Auto);
        assert!("toggle".parse::<RelayState>().is_err());
    }

    #[test]
    fn test_relay_patterns() {
        for state in [RelayState::On, RelayState::Off, RelayState::Auto] {
            assert_eq!(RelayState::from_pattern(state.pattern()), Some(state));
        }
        assert_eq!(RelayState::from_pattern(0x1234), None);
    }

    #[test]
    fn test_model_names() {
        for model in MeterModel::ALL {
            assert_eq!(model.name().parse::<MeterModel>().unwrap(), model);
        }
        assert_eq!("sdm630".parse::<MeterModel>().unwrap(), MeterModel::SDM630);
        let err = "SDM999".parse::<MeterModel>().unwrap_err();
        assert_eq!(err, "unknown meter model 'SDM999', expected one of EM115, EM737, SDM72, SDM120, SDM230, SDM630");
        assert_eq!(MeterModel::EM737.brand(), Brand::Fineco);
        assert_eq!(MeterModel::SDM72.brand(), Brand::Eastron);
    }

    #[test]
    fn test_channel_with_baudrate() {
        let serial = Channel::Serial { path: "/dev/ttyUSB0".to_string(), baudrate: 9600 };
        assert_eq!(
            serial.with_baudrate(2400),
            Channel::Serial { path: "/dev/ttyUSB0".to_string(), baudrate: 2400 }
        );
        let gw = Channel::Gateway { host: "gw".to_string(), port: 502, framing: GatewayFraming::Tcp };
        assert!(gw.is_gateway());
        assert_eq!(gw.with_baudrate(2400), gw);
    }
}
