use std::fmt;
use std::future;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use tokio_modbus::prelude::*;
use tokio_retry::strategy::{jitter, FixedInterval};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, TransportError};
use crate::mask_write::{MaskWriteRequest, MaskWriteResponse};
use crate::responder::SerialConfig;
use crate::transaction::Connection;

pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_TCP_UNIT: u8 = 0;
pub const DEFAULT_SERIAL_UNIT: u8 = 1;

/// Where the master sends its requests.
///
/// `tcp:<host>[:<port>[:<unit>]]`, `device:<path>[:<unit>]` (or `rtu:`), or a
/// bare `<host>[:<port>[:<unit>]]` which means TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Tcp { host: String, port: u16, unit_id: u8 },
    Serial { path: String, unit_id: u8 },
}

impl ConnectionSpec {
    pub fn unit_id(&self) -> u8 {
        match self {
            ConnectionSpec::Tcp { unit_id, .. } | ConnectionSpec::Serial { unit_id, .. } => {
                *unit_id
            }
        }
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSpec::Tcp {
                host,
                port,
                unit_id,
            } => write!(f, "tcp:{host}:{port}:{unit_id}"),
            ConnectionSpec::Serial { path, unit_id } => write!(f, "device:{path}:{unit_id}"),
        }
    }
}

impl FromStr for ConnectionSpec {
    type Err = ConnectionError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConnectionError::InvalidSpec {
            spec: spec.to_owned(),
            reason: reason.to_owned(),
        };
        let unit = |token: Option<&str>, default: u8| match token {
            Some(token) => token.parse::<u8>().map_err(|_| invalid("unit must be 0-255")),
            None => Ok(default),
        };

        let mut parts = spec.split(':');
        let scheme = parts.next().unwrap_or_default();
        let (is_serial, first) = match scheme {
            "device" | "rtu" => (true, parts.next()),
            "tcp" => (false, parts.next()),
            _ => (false, Some(scheme)),
        };
        let first = first.filter(|s| !s.is_empty());

        let parsed = if is_serial {
            let path = first.ok_or_else(|| invalid("missing serial device"))?;
            ConnectionSpec::Serial {
                path: path.to_owned(),
                unit_id: unit(parts.next(), DEFAULT_SERIAL_UNIT)?,
            }
        } else {
            let host = first.ok_or_else(|| invalid("missing host"))?;
            let port = match parts.next() {
                Some(port) => port.parse().map_err(|_| invalid("port must be 0-65535"))?,
                None => DEFAULT_TCP_PORT,
            };
            ConnectionSpec::Tcp {
                host: host.to_owned(),
                port,
                unit_id: unit(parts.next(), DEFAULT_TCP_UNIT)?,
            }
        };

        if parts.next().is_some() {
            return Err(invalid("too many ':' separated fields"));
        }
        Ok(parsed)
    }
}

/// Resolves a [`ConnectionSpec`] to a live connection.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Connection: Connection;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<Self::Connection, ConnectionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusConnector;

impl ModbusConnector {
    fn retry_strategy_connect() -> impl Iterator<Item = Duration> {
        FixedInterval::from_millis(10).map(jitter).take(3)
    }

    async fn connect_tcp(host: &str, port: u16, unit_id: u8) -> io::Result<client::Context> {
        let socket_address: SocketAddr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "cannot resolve hostname")
            })?;

        let action = || async move {
            debug!("trying to connect modbus: {socket_address}");
            tcp::connect_slave(socket_address, Slave(unit_id)).await
        };
        Retry::spawn(Self::retry_strategy_connect(), action).await
    }

    async fn connect_serial(path: &str, unit_id: u8) -> io::Result<client::Context> {
        let builder = SerialConfig::new(path).builder();
        let action = || {
            debug!("trying to open serial port: {path}");
            future::ready(tokio_serial::SerialStream::open(&builder).map_err(io::Error::from))
        };
        let serial = Retry::spawn(Self::retry_strategy_connect(), action).await?;
        Ok(rtu::attach_slave(serial, Slave(unit_id)))
    }

    async fn open(spec: &ConnectionSpec) -> io::Result<client::Context> {
        match spec {
            ConnectionSpec::Tcp {
                host,
                port,
                unit_id,
            } => Self::connect_tcp(host, *port, *unit_id).await,
            ConnectionSpec::Serial { path, unit_id } => Self::connect_serial(path, *unit_id).await,
        }
    }
}

impl Connector for ModbusConnector {
    type Connection = ModbusConnection;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<ModbusConnection, ConnectionError> {
        let ctx = Self::open(spec)
            .await
            .map_err(|source| ConnectionError::Unreachable {
                target: spec.to_string(),
                source,
            })?;

        info!("Connected to {spec}");
        Ok(ModbusConnection {
            ctx,
            spec: spec.clone(),
        })
    }
}

/// A tokio-modbus client context speaking Mask Write Register PDUs.
#[derive(Debug)]
pub struct ModbusConnection {
    ctx: client::Context,
    spec: ConnectionSpec,
}

impl Connection for ModbusConnection {
    async fn exchange(
        &mut self,
        unit_id: u8,
        pdu: Bytes,
    ) -> Result<Option<Bytes>, TransportError> {
        let request = MaskWriteRequest::decode(unit_id, &pdu)?;
        self.ctx.set_slave(Slave(unit_id));

        let response = self
            .ctx
            .call(Request::MaskWriteRegister(
                request.reference,
                request.and_mask,
                request.or_mask,
            ))
            .await?;

        match response {
            Ok(Response::MaskWriteRegister(reference, and_mask, or_mask)) => Ok(Some(
                MaskWriteResponse {
                    reference,
                    and_mask,
                    or_mask,
                }
                .encode(),
            )),
            Ok(other) => Err(TransportError::UnexpectedResponse(format!("{other:?}"))),
            Err(exception) => Err(TransportError::Exception(exception)),
        }
    }

    /// The abandoned request may still be answered on this context, so it is
    /// replaced by a fresh one.
    async fn reset(&mut self) -> Result<(), TransportError> {
        warn!("reopening connection to {} after a timeout", self.spec);
        if let Err(err) = self.ctx.disconnect().await {
            debug!("disconnect from {} failed: {err}", self.spec);
        }
        self.ctx = ModbusConnector::open(&self.spec).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("closing connection to {}", self.spec);
        if let Err(err) = self.ctx.disconnect().await {
            warn!("disconnect from {} failed: {err}", self.spec);
            return Err(TransportError::Close(err.to_string()));
        }
        Ok(())
    }
}
