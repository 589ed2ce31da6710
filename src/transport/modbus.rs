use async_trait::async_trait;
use log::{debug, info, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ErrorKind, ModbusProto};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Connector, Transport, TransportError};
use crate::models::{Channel, GatewayFraming};
use crate::registers::RegisterKind;

/// Modbus framing on top of any byte stream: RTU on a serial line or tunnelled
/// through a gateway, or Modbus TCP.
///
/// A link that timed out or received a frame it could not make sense of drops
/// its stream, a late answer would otherwise be taken for the reply to the next
/// request. The owner reopens the channel.
pub struct ModbusLink<S> {
    stream: Option<S>,
    proto: ModbusProto,
    label: String,
    tr_id: u16,
}

impl<S> ModbusLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, proto: ModbusProto, label: String) -> Self {
        return ModbusLink { stream: Some(stream), proto, label, tr_id: 0 };
    }

    /// Fresh request, Modbus TCP gets a new transaction id every time
    fn request(&mut self, unit: u8) -> ModbusRequest {
        let mut mreq = ModbusRequest::new(unit, self.proto);
        if matches!(self.proto, ModbusProto::TcpUdp) {
            self.tr_id = self.tr_id.wrapping_add(1);
            mreq.tr_id = self.tr_id;
        }
        mreq
    }

    fn out_of_sync(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            warn!("[{}] {reason}, dropping the connection", self.label);
        }
    }

    /// Exception responses are complete frames, anything else leaves the stream
    /// in an unknown state
    fn rejected(&mut self, e: ErrorKind, what: String) -> TransportError {
        if !e.is_modbus_error() {
            self.out_of_sync("Malformed response");
        }
        TransportError::Protocol(format!("{what}: {e:?}"))
    }

    async fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let proto = self.proto;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        debug!("[{}] -> {}", self.label, hex::encode(request));

        let roundtrip = async {
            stream.write_all(request).await?;
            stream.flush().await?;

            /* Enough of the header to know the frame length: MBAP for TCP, unit + function + byte count for RTU */
            let header_len = if matches!(proto, ModbusProto::TcpUdp) { 6 } else { 3 };
            let mut response = vec![0u8; header_len];
            stream.read_exact(&mut response).await?;

            let len = guess_response_frame_len(&response, proto)
                .map_err(|e| TransportError::Protocol(format!("Failed to determine response length: {e:?}")))? as usize;

            if len > header_len {
                let mut rest = vec![0u8; len - header_len];
                stream.read_exact(&mut rest).await?;
                response.extend_from_slice(&rest);
            }

            Ok::<Vec<u8>, TransportError>(response)
        };

        let outcome = tokio::time::timeout(timeout, roundtrip).await;
        let response = match outcome {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                self.out_of_sync("Exchange failed");
                return Err(e);
            }
            Err(_) => {
                self.out_of_sync("No response in time");
                return Err(TransportError::Timeout(timeout));
            }
        };

        debug!("[{}] <- {}", self.label, hex::encode(&response));
        return Ok(response);
    }
}

#[async_trait]
impl<S> Transport for ModbusLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, unit: u8, kind: RegisterKind, start: u16, count: u16, timeout: Duration) -> Result<Vec<u16>, TransportError> {
        let mut mreq = self.request(unit);
        let mut request: Vec<u8> = Vec::new();

        match kind {
            RegisterKind::Holding => mreq.generate_get_holdings(start, count, &mut request),
            RegisterKind::Input => mreq.generate_get_inputs(start, count, &mut request),
        }
        .map_err(|e| TransportError::Protocol(format!("Failed to build read request for {start:#06x}: {e:?}")))?;

        let response = self.exchange(&request, timeout).await?;

        let mut data: Vec<u16> = Vec::new();
        if let Err(e) = mreq.parse_u16(&response, &mut data) {
            return Err(self.rejected(e, format!("Error getting response for register {start:#06x}")));
        }

        return Ok(data);
    }

    async fn write(&mut self, unit: u8, start: u16, words: &[u16], timeout: Duration) -> Result<(), TransportError> {
        let mut mreq = self.request(unit);
        let mut request: Vec<u8> = Vec::new();

        mreq.generate_set_holdings_bulk(start, words, &mut request)
            .map_err(|e| TransportError::Protocol(format!("Failed to build write request for {start:#06x}: {e:?}")))?;

        let response = self.exchange(&request, timeout).await?;

        if let Err(e) = mreq.parse_ok(&response) {
            return Err(self.rejected(e, format!("Write to register {start:#06x} rejected")));
        }

        return Ok(());
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            info!("Closing {}", self.label);
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Opens real serial ports and TCP gateways
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(&self, channel: &Channel, timeout: Duration) -> Result<Box<dyn super::Transport>, TransportError> {
        match channel {
            Channel::Gateway { host, port, framing } => {
                let socket_addr = format!("{}:{}", host, port);
                let stream = match tokio::time::timeout(timeout, TcpStream::connect(&socket_addr)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        return Err(TransportError::Open { channel: channel.to_string(), reason: e.to_string() });
                    }
                    Err(_) => return Err(TransportError::Timeout(timeout)),
                };
                let _ = stream.set_nodelay(true);

                /* if we use RTU over TCP we need to add all of those fancy CRC stuff */
                let proto = match framing {
                    GatewayFraming::Tcp => ModbusProto::TcpUdp,
                    GatewayFraming::RtuOverTcp => ModbusProto::Rtu,
                };

                info!("Connected to gateway {}", channel);
                Ok(Box::new(ModbusLink::new(stream, proto, channel.to_string())))
            }
            Channel::Serial { path, baudrate } => open_serial(channel, path, *baudrate),
        }
    }
}

#[cfg(feature = "serial")]
fn open_serial(channel: &Channel, path: &str, baudrate: u32) -> Result<Box<dyn super::Transport>, TransportError> {
    use tokio_serial::SerialPortBuilderExt;

    /* 8N1, the only line setting the supported meters speak */
    let port = tokio_serial::new(path, baudrate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| TransportError::Open { channel: channel.to_string(), reason: e.to_string() })?;

    info!("Opened serial port {}", channel);
    Ok(Box::new(ModbusLink::new(port, ModbusProto::Rtu, channel.to_string())))
}

#[cfg(not(feature = "serial"))]
fn open_serial(channel: &Channel, _path: &str, _baudrate: u32) -> Result<Box<dyn super::Transport>, TransportError> {
    Err(TransportError::Open { channel: channel.to_string(), reason: "built without serial port support".to_string() })
}
