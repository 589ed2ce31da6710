//! Write-and-verify sequences for the settings that change how the meter is
//! reached or switched.
//!
//! Each sequence reads the current value, writes the new one and reads it back.
//! A failure is reported as a [`StepError`] naming the step that failed, so a
//! write that was acknowledged but did not stick can be told apart from a dead
//! line.

use log::{info, warn};
use serde::Serialize;

use crate::client::MeterClient;
use crate::error::{AtStage, MeterError, Stage, StepError};
use crate::models::{Parameter, RelayState, SerialNumber};
use crate::registers::SUPPORTED_BAUDRATES;
use crate::relay_key::derive_key;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayReport {
    pub before: RelayState,
    pub requested: RelayState,
    pub after: RelayState,
    /// The relay already was in the requested state, nothing was written
    pub skipped: bool,
    pub serial_number: Option<SerialNumber>,
    pub key: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeReport<T> {
    pub parameter: Parameter,
    pub before: T,
    pub after: T,
}

pub async fn set_relay_state(client: &mut MeterClient, requested: &str) -> Result<RelayReport, StepError> {
    let requested = requested.parse::<RelayState>().at(Stage::Validate)?;

    let model = client.model();
    let traits = client
        .map()
        .relay
        .ok_or(MeterError::UnsupportedParameter { model, parameter: Parameter::RelayState })
        .at(Stage::Validate)?;

    if requested == RelayState::Auto && !traits.supports_auto {
        return Err(StepError::new(Stage::Validate, MeterError::UnsupportedRelayMode { model, mode: requested.to_string() }));
    }

    let before = client.get_relay_state().await.at(Stage::SanityRead)?;
    info!("Relay is {before}");

    if before == requested {
        info!("Relay already {requested}, not writing");
        return Ok(RelayReport { before, requested, after: before, skipped: true, serial_number: None, key: None });
    }

    switch_relay(client, before, requested, traits.requires_key).await.map_err(|e| e.with_before(before))
}

async fn switch_relay(client: &mut MeterClient, before: RelayState, requested: RelayState, requires_key: bool) -> Result<RelayReport, StepError> {
    let (serial_number, key) = if requires_key {
        let serial = client.get_serial_number().await.at(Stage::Unlock)?;
        let key = derive_key(serial);
        info!("Unlock key for serial {} is {key}", serial.value());
        (Some(serial), Some(key))
    } else {
        (None, None)
    };

    let mut payload = Vec::with_capacity(2);
    if let Some(k) = key {
        payload.push(k);
    }
    payload.push(requested.pattern());

    client.set_words(Parameter::RelayState, &payload).await.at(Stage::Write)?;

    let after = client.get_relay_state().await.at(Stage::Confirm)?;
    match (requested, after) {
        /* in auto mode the meter reports the position the relay is in */
        (RelayState::Auto, RelayState::Auto) => {}
        (RelayState::Auto, position) => info!("Relay in auto mode, currently {position}"),
        _ if after != requested => {
            return Err(StepError::new(
                Stage::Confirm,
                MeterError::WriteNotConfirmed { parameter: Parameter::RelayState, expected: requested.to_string(), actual: after.to_string() },
            ));
        }
        _ => {}
    }

    info!("Relay switched {before} -> {after}");
    Ok(RelayReport { before, requested, after, skipped: false, serial_number, key })
}

/// Changes the line speed of a meter on a serial port. The port is closed after
/// the write and reopened at the new speed to confirm the change.
pub async fn set_baudrate(client: &mut MeterClient, requested: u32) -> Result<ChangeReport<u32>, StepError> {
    if client.session().channel().is_gateway() {
        return Err(StepError::new(Stage::Validate, MeterError::UnsupportedOnGateway(Parameter::Baudrate)));
    }

    let raw = client
        .map()
        .baudrate_coding
        .encode(requested)
        .ok_or_else(|| MeterError::InvalidValue {
            parameter: Parameter::Baudrate,
            reason: format!("{requested} is not one of {SUPPORTED_BAUDRATES:?}"),
        })
        .at(Stage::Validate)?;

    let before = client.get_baudrate().await.at(Stage::SanityRead)?;
    info!("Baudrate is {before}");

    change_baudrate(client, before, requested, raw).await.map_err(|e| e.with_before(before))
}

async fn change_baudrate(client: &mut MeterClient, before: u32, requested: u32, raw: u32) -> Result<ChangeReport<u32>, StepError> {
    client.set(Parameter::Baudrate, raw as f64).await.at(Stage::Write)?;

    let session = client.session_mut();
    let channel = session.channel().with_baudrate(requested);
    session.close().await;
    tokio::time::sleep(session.config().reconnect_delay).await;

    let unconfirmed = |reason: String| MeterError::BaudrateChangeUnconfirmed { requested, reason };

    if let Err(e) = session.reopen(channel).await {
        return Err(StepError::new(Stage::Reconnect, unconfirmed(format!("reopening the port failed: {e}"))));
    }

    let after = match client.get_baudrate().await {
        Ok(b) => b,
        Err(e) => {
            client.session_mut().close().await;
            return Err(StepError::new(Stage::Confirm, unconfirmed(format!("no valid answer at the new speed: {e}"))));
        }
    };

    if after != requested {
        client.session_mut().close().await;
        return Err(StepError::new(Stage::Confirm, unconfirmed(format!("meter reports {after}"))));
    }

    info!("Baudrate changed {before} -> {after}");
    Ok(ChangeReport { parameter: Parameter::Baudrate, before, after })
}

/// Moves the meter to another unit id. Later requests of this session go to the
/// new id.
pub async fn set_unit_id(client: &mut MeterClient, requested: u32) -> Result<ChangeReport<u8>, StepError> {
    let new_unit = match requested {
        1..=255 => requested as u8,
        _ => {
            return Err(StepError::new(
                Stage::Validate,
                MeterError::InvalidValue { parameter: Parameter::UnitId, reason: format!("{requested} is outside of 1..=255") },
            ));
        }
    };

    let before = client.get_unit_id().await.at(Stage::SanityRead)?;
    info!("Unit id is {before}");

    change_unit_id(client, before, new_unit).await.map_err(|e| e.with_before(before))
}

async fn change_unit_id(client: &mut MeterClient, before: u8, new_unit: u8) -> Result<ChangeReport<u8>, StepError> {
    client.set(Parameter::UnitId, new_unit as f64).await.at(Stage::Write)?;

    let old_unit = client.session().unit();
    client.session_mut().set_unit(new_unit);

    let not_confirmed = |actual: String| MeterError::WriteNotConfirmed { parameter: Parameter::UnitId, expected: new_unit.to_string(), actual };

    let failure = match client.get_unit_id().await {
        Ok(after) if after == new_unit => {
            info!("Unit id changed {before} -> {after}");
            return Ok(ChangeReport { parameter: Parameter::UnitId, before, after });
        }
        Ok(after) => not_confirmed(after.to_string()),
        Err(MeterError::Timeout(_)) => not_confirmed(format!("no answer at unit id {new_unit}")),
        Err(e) => e,
    };

    warn!("Unit id change not confirmed, keep talking to unit id {old_unit}");
    client.session_mut().set_unit(old_unit);
    Err(StepError::new(Stage::Confirm, failure))
}

/// Writes a new serial number given as decimal, `0x` hex or `0b` binary literal
pub async fn set_serial_number(client: &mut MeterClient, literal: &str) -> Result<ChangeReport<SerialNumber>, StepError> {
    let requested = literal.parse::<SerialNumber>().at(Stage::Validate)?;

    let entry = client.map().lookup(Parameter::SerialNumber).at(Stage::Validate)?;
    if entry.is_read_only() {
        return Err(StepError::new(Stage::Validate, MeterError::ReadOnlyParameter(Parameter::SerialNumber)));
    }

    let before = client.get_serial_number().await.at(Stage::SanityRead)?;
    info!("Serial number is {before}");

    change_serial_number(client, before, requested).await.map_err(|e| e.with_before(before))
}

async fn change_serial_number(client: &mut MeterClient, before: SerialNumber, requested: SerialNumber) -> Result<ChangeReport<SerialNumber>, StepError> {
    client.set(Parameter::SerialNumber, requested.value() as f64).await.at(Stage::Write)?;

    let after = client.get_serial_number().await.at(Stage::Confirm)?;
    if after != requested {
        return Err(StepError::new(
            Stage::Confirm,
            MeterError::WriteNotConfirmed { parameter: Parameter::SerialNumber, expected: requested.to_string(), actual: after.to_string() },
        ));
    }

    info!("Serial number changed {before} -> {after}");
    Ok(ChangeReport { parameter: Parameter::SerialNumber, before, after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::models::{Channel, GatewayFraming, MeterModel};
    use crate::registers::lookup;
    use crate::registers::utils::f32_to_words;
    use crate::session::MeterSession;
    use crate::transport::simulated::{SharedMeter, SimulatedConnector, SimulatedMeter};
    use std::time::Duration;

    fn serial_port() -> Channel {
        Channel::Serial { path: "/dev/ttyUSB0".to_string(), baudrate: 9600 }
    }

    async fn client_on(model: MeterModel, channel: Channel) -> (MeterClient, SharedMeter) {
        let meter = SimulatedMeter::new(model).shared();
        let config = SessionConfig { reconnect_delay: Duration::ZERO, ..SessionConfig::default() };
        let connector = Box::new(SimulatedConnector { meter: meter.clone() });
        let session = MeterSession::open(model, channel, 1, config, connector).await.unwrap();
        (MeterClient::new(session), meter)
    }

    async fn client(model: MeterModel) -> (MeterClient, SharedMeter) {
        client_on(model, serial_port()).await
    }

    #[tokio::test]
    async fn test_relay_on_with_key() {
        let (mut c, meter) = client(MeterModel::EM115).await;

        let report = set_relay_state(&mut c, "on").await.unwrap();
        assert_eq!(report.before, RelayState::Off);
        assert_eq!(report.after, RelayState::On);
        assert!(!report.skipped);
        assert_eq!(report.serial_number, Some(SerialNumber(286331153)));
        assert_eq!(report.key, Some(4128));

        assert_eq!(meter.lock().unwrap().writes, vec![(1, 0x566, vec![4128, 0x5555])]);
    }

    #[tokio::test]
    async fn test_relay_aliases_write_the_same_payload() {
        let mut payloads = Vec::new();
        for (on, off) in [("on", "off"), ("1", "0")] {
            let (mut c, meter) = client(MeterModel::EM737).await;
            set_relay_state(&mut c, on).await.unwrap();
            set_relay_state(&mut c, off).await.unwrap();
            payloads.push(meter.lock().unwrap().writes.clone());
        }
        assert_eq!(payloads[0], payloads[1]);
        assert_eq!(payloads[0][1].2, vec![4128, 0xAAAA]);
    }

    #[tokio::test]
    async fn test_relay_already_in_state_is_not_written() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        let report = set_relay_state(&mut c, "off").await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.after, RelayState::Off);
        assert!(meter.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_relay_auto() {
        let (mut c, _) = client(MeterModel::EM737).await;
        assert_eq!(set_relay_state(&mut c, "AUTO").await.unwrap().after, RelayState::Auto);
    }

    #[tokio::test]
    async fn test_relay_auto_reports_position() {
        let (mut c, meter) = client(MeterModel::EM737).await;
        meter.lock().unwrap().auto_position = Some(RelayState::On.pattern());

        let report = set_relay_state(&mut c, "auto").await.unwrap();
        assert_eq!(report.requested, RelayState::Auto);
        assert_eq!(report.after, RelayState::On);
        assert_eq!(meter.lock().unwrap().writes, vec![(1, 0x566, vec![4128, 0x8888])]);
    }

    #[tokio::test]
    async fn test_relay_auto_still_needs_known_pattern() {
        let (mut c, meter) = client(MeterModel::EM737).await;
        meter.lock().unwrap().auto_position = Some(0x1234);

        let err = set_relay_state(&mut c, "auto").await.unwrap_err();
        assert_eq!(err.stage, Stage::Confirm);
        assert!(matches!(err.source, MeterError::UnexpectedValue { parameter: Parameter::RelayState, .. }));
    }

    #[tokio::test]
    async fn test_relay_rejections() {
        let (mut c, meter) = client(MeterModel::SDM630).await;
        let err = set_relay_state(&mut c, "on").await.unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert!(matches!(err.source, MeterError::UnsupportedParameter { parameter: Parameter::RelayState, .. }));

        let err = set_relay_state(&mut c, "toggle").await.unwrap_err();
        assert!(matches!(err.source, MeterError::InvalidValue { .. }));
        assert_eq!(meter.lock().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_relay_write_not_confirmed() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        meter.lock().unwrap().ignore_writes = true;

        let err = set_relay_state(&mut c, "on").await.unwrap_err();
        assert_eq!(err.stage, Stage::Confirm);
        assert!(matches!(err.source, MeterError::WriteNotConfirmed { parameter: Parameter::RelayState, .. }));
        assert_eq!(err.before.as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn test_relay_unlock_needs_serial_number() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        let serial = lookup(MeterModel::EM115, Parameter::SerialNumber).unwrap().address;
        meter.lock().unwrap().timeouts.insert(serial);

        let err = set_relay_state(&mut c, "on").await.unwrap_err();
        assert_eq!(err.stage, Stage::Unlock);
        assert!(matches!(err.source, MeterError::Timeout(_)));
        assert_eq!(err.before.as_deref(), Some("off"));
        assert!(meter.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_baudrate_change_on_serial() {
        let (mut c, meter) = client(MeterModel::SDM120).await;

        let report = set_baudrate(&mut c, 19200).await.unwrap();
        assert_eq!(report.before, 9600);
        assert_eq!(report.after, 19200);

        let m = meter.lock().unwrap();
        /* Eastron stores the code, 3 = 19200 */
        assert_eq!(m.writes, vec![(1, 0x1C, f32_to_words(3.0).to_vec())]);
        assert_eq!(m.opened, vec![serial_port(), serial_port().with_baudrate(19200)]);
        drop(m);
        assert!(c.session().is_connected());
    }

    #[tokio::test]
    async fn test_failed_sanity_read_has_no_before() {
        let (mut c, meter) = client(MeterModel::SDM120).await;
        let baudrate = lookup(MeterModel::SDM120, Parameter::Baudrate).unwrap().address;
        meter.lock().unwrap().timeouts.insert(baudrate);

        let err = set_baudrate(&mut c, 19200).await.unwrap_err();
        assert_eq!(err.stage, Stage::SanityRead);
        assert_eq!(err.before, None);
        assert!(meter.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_baudrate_change_fineco_direct() {
        let (mut c, meter) = client(MeterModel::EM737).await;
        set_baudrate(&mut c, 38400).await.unwrap();
        assert_eq!(meter.lock().unwrap().writes, vec![(1, 0x525, vec![38400])]);
    }

    #[tokio::test]
    async fn test_baudrate_on_gateway_makes_no_request() {
        let gateway = Channel::Gateway { host: "10.0.0.2".to_string(), port: 502, framing: GatewayFraming::Tcp };
        let (mut c, meter) = client_on(MeterModel::SDM630, gateway).await;

        let err = set_baudrate(&mut c, 19200).await.unwrap_err();
        assert!(matches!(err.source, MeterError::UnsupportedOnGateway(Parameter::Baudrate)));
        assert_eq!(meter.lock().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_baudrate_not_supported() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        let err = set_baudrate(&mut c, 115200).await.unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert!(matches!(err.source, MeterError::InvalidValue { parameter: Parameter::Baudrate, .. }));
        assert_eq!(meter.lock().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_baudrate_reopen_failure() {
        let (mut c, meter) = client(MeterModel::SDM230).await;
        meter.lock().unwrap().fail_reopen = true;

        let err = set_baudrate(&mut c, 4800).await.unwrap_err();
        assert_eq!(err.stage, Stage::Reconnect);
        assert!(matches!(err.source, MeterError::BaudrateChangeUnconfirmed { requested: 4800, .. }));
        assert!(!c.session().is_connected());
    }

    #[tokio::test]
    async fn test_baudrate_ignored_by_meter() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        meter.lock().unwrap().ignore_writes = true;

        /* the meter stays at 9600 and does not answer at 2400 */
        let err = set_baudrate(&mut c, 2400).await.unwrap_err();
        assert_eq!(err.stage, Stage::Confirm);
        assert!(matches!(err.source, MeterError::BaudrateChangeUnconfirmed { requested: 2400, .. }));
        assert_eq!(err.before.as_deref(), Some("9600"));
        assert!(!c.session().is_connected());
    }

    #[tokio::test]
    async fn test_unit_id_change() {
        let (mut c, meter) = client(MeterModel::EM115).await;

        let report = set_unit_id(&mut c, 17).await.unwrap();
        assert_eq!((report.before, report.after), (1, 17));
        assert_eq!(c.session().unit(), 17);
        assert_eq!(meter.lock().unwrap().unit, 17);

        /* later reads go to the new unit */
        assert!(c.get_voltage().await.is_ok());
    }

    #[tokio::test]
    async fn test_unit_id_change_eastron_float() {
        let (mut c, meter) = client(MeterModel::SDM72).await;
        set_unit_id(&mut c, 2).await.unwrap();
        assert_eq!(meter.lock().unwrap().writes, vec![(1, 0x14, vec![0x4000, 0x0000])]);
    }

    #[tokio::test]
    async fn test_unit_id_out_of_range() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        for id in [0, 256] {
            let err = set_unit_id(&mut c, id).await.unwrap_err();
            assert!(matches!(err.source, MeterError::InvalidValue { parameter: Parameter::UnitId, .. }));
        }
        assert_eq!(meter.lock().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_unit_id_not_confirmed() {
        let (mut c, meter) = client(MeterModel::EM737).await;
        meter.lock().unwrap().ignore_writes = true;

        let err = set_unit_id(&mut c, 17).await.unwrap_err();
        assert_eq!(err.stage, Stage::Confirm);
        assert!(matches!(err.source, MeterError::WriteNotConfirmed { parameter: Parameter::UnitId, .. }));
        assert_eq!(err.before.as_deref(), Some("1"));
        assert_eq!(c.session().unit(), 1);
    }

    #[tokio::test]
    async fn test_serial_number_literals() {
        for literal in ["1234", "0x4d2", "0b10011010010"] {
            let (mut c, meter) = client(MeterModel::EM115).await;
            let report = set_serial_number(&mut c, literal).await.unwrap();
            assert_eq!(report.before, SerialNumber(286331153));
            assert_eq!(report.after, SerialNumber(1234));
            assert_eq!(report.after.hex(), "0x4d2");
            assert_eq!(report.after.binary(), "0b10011010010");
            assert_eq!(meter.lock().unwrap().writes, vec![(1, 0xFF00, vec![0, 1234])]);
        }
    }

    #[tokio::test]
    async fn test_serial_number_rejections() {
        let (mut c, meter) = client(MeterModel::EM115).await;
        for literal in ["12a", "0x1_0000_0000", "0b102", "4294967296", ""] {
            let err = set_serial_number(&mut c, literal).await.unwrap_err();
            assert!(matches!(err.source, MeterError::InvalidEncoding(_)), "{literal}");
        }
        assert_eq!(meter.lock().unwrap().calls, 0);

        let (mut c, _) = client(MeterModel::SDM120).await;
        let err = set_serial_number(&mut c, "1234").await.unwrap_err();
        assert!(matches!(err.source, MeterError::ReadOnlyParameter(Parameter::SerialNumber)));
    }

    #[tokio::test]
    async fn test_serial_number_not_confirmed() {
        let (mut c, meter) = client(MeterModel::EM737).await;
        meter.lock().unwrap().ignore_writes = true;

        let err = set_serial_number(&mut c, "0x10").await.unwrap_err();
        assert_eq!(err.stage, Stage::Confirm);
        assert!(matches!(err.source, MeterError::WriteNotConfirmed { parameter: Parameter::SerialNumber, .. }));
        assert_eq!(err.before, Some(SerialNumber(286331153).to_string()));
    }
}
