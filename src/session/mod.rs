use log::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::MeterError;
use crate::models::{Channel, MeterModel};
use crate::registers::{register_map, RegisterEntry, RegisterMap};
use crate::transport::{Connector, Transport};

/// One meter on one channel. Owns the open transport exclusively and runs a
/// single exchange at a time.
pub struct MeterSession {
    model: MeterModel,
    map: &'static RegisterMap,
    channel: Channel,
    unit: u8,
    config: SessionConfig,
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
}

impl MeterSession {
    /// A session that has not opened its channel yet
    pub fn new(model: MeterModel, channel: Channel, unit: u8, config: SessionConfig, connector: Box<dyn Connector>) -> Self {
        return MeterSession {
            model,
            map: register_map(model),
            channel,
            unit,
            config,
            connector,
            transport: None,
        };
    }

    pub async fn open(model: MeterModel, channel: Channel, unit: u8, config: SessionConfig, connector: Box<dyn Connector>) -> Result<Self, MeterError> {
        let mut session = MeterSession::new(model, channel, unit, config, connector);
        session.connect().await?;
        Ok(session)
    }

    pub async fn connect(&mut self) -> Result<(), MeterError> {
        if self.transport.is_some() {
            return Ok(());
        }
        let transport = self.connector.open(&self.channel, self.config.timeout).await?;
        info!("{} unit {} on {}", self.model, self.unit, self.channel);
        self.transport = Some(transport);
        Ok(())
    }

    pub fn model(&self) -> MeterModel {
        self.model
    }

    pub fn map(&self) -> &'static RegisterMap {
        self.map
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Addresses all further requests to `unit`
    pub fn set_unit(&mut self, unit: u8) {
        debug!("Switching unit id {} -> {}", self.unit, unit);
        self.unit = unit;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// The open transport. A link that lost step with the meter is replaced
    /// by a fresh one on the same channel first.
    async fn transport(&mut self) -> Result<&mut Box<dyn Transport>, MeterError> {
        let open = match self.transport.as_ref() {
            None => return Err(MeterError::NotConnected),
            Some(t) => t.is_open(),
        };
        if !open {
            warn!("Link to {} went stale, reconnecting", self.channel);
            self.close().await;
            self.connect().await?;
        }
        self.transport.as_mut().ok_or(MeterError::NotConnected)
    }

    pub async fn read_entry(&mut self, entry: &RegisterEntry) -> Result<Vec<u16>, MeterError> {
        let unit = self.unit;
        let timeout = self.config.timeout;
        let transport = self.transport().await?;

        debug!("Reading {} at {:#06x} ({:?}, {} words)", entry.parameter, entry.address, entry.kind, entry.count);
        let words = transport.read(unit, entry.kind, entry.address, entry.count, timeout).await?;
        return Ok(words);
    }

    pub async fn write_words(&mut self, start: u16, words: &[u16]) -> Result<(), MeterError> {
        let unit = self.unit;
        let timeout = self.config.timeout;
        let transport = self.transport().await?;

        debug!("Writing {:04x?} at {:#06x}", words, start);
        transport.write(unit, start, words, timeout).await?;
        return Ok(());
    }

    /// Releases the channel. Close errors are logged, the handle is gone either way.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Closing {} failed: {e}", self.channel);
            }
        }
    }

    /// Closes the current channel and opens `channel` instead. On failure the
    /// session stays without a transport.
    pub async fn reopen(&mut self, channel: Channel) -> Result<(), MeterError> {
        self.close().await;
        self.channel = channel;
        self.connect().await
    }
}
