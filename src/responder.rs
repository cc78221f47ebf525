//! Serves a [`ProcessImage`] to a Modbus RTU master on a serial line.

use std::future;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::task::{JoinError, JoinHandle};
use tokio_modbus::prelude::*;
use tokio_modbus::server::rtu::Server;
use tokio_modbus::{Address, Quantity};
use tokio_serial::{DataBits, Parity, SerialPortBuilder, StopBits};
use tracing::{debug, error, info, trace, warn};

use crate::process_image::{BankKind, Coil, ProcessImage, Word};

pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Largest quantities a single read may ask for, so the byte count fits in one octet.
pub const MAX_READ_BITS: Quantity = 2000;
pub const MAX_READ_WORDS: Quantity = 125;

fn check_quantity(count: Quantity, max: Quantity) -> Result<(), Exception> {
    if count == 0 || count > max {
        warn!("read quantity {count} outside 1..={max}");
        return Err(Exception::IllegalDataValue);
    }
    Ok(())
}

/// Line settings for the RTU listener. Defaults to 19200 8N1 without echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub echo: bool,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            echo: false,
        }
    }

    pub fn builder(&self) -> SerialPortBuilder {
        tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
    }
}

/// Answers read requests addressed to one unit from an immutable image.
#[derive(Debug, Clone)]
pub struct ImageService {
    image: Arc<ProcessImage>,
    unit_id: u8,
}

impl ImageService {
    pub fn new(image: Arc<ProcessImage>, unit_id: u8) -> Self {
        Self { image, unit_id }
    }

    fn answer(&self, request: Request<'_>) -> Result<Response, Exception> {
        let response = match request {
            Request::ReadCoils(address, count) => {
                Response::ReadCoils(self.bits(BankKind::DiscreteOutputs, address, count)?)
            }
            Request::ReadDiscreteInputs(address, count) => {
                Response::ReadDiscreteInputs(self.bits(BankKind::DiscreteInputs, address, count)?)
            }
            Request::ReadHoldingRegisters(address, count) => Response::ReadHoldingRegisters(
                self.words(BankKind::HoldingRegisters, address, count)?,
            ),
            Request::ReadInputRegisters(address, count) => Response::ReadInputRegisters(
                self.words(BankKind::InputRegisters, address, count)?,
            ),
            other => {
                warn!("unsupported request: {other:?}");
                return Err(Exception::IllegalFunction);
            }
        };
        Ok(response)
    }

    fn bits(
        &self,
        kind: BankKind,
        address: Address,
        count: Quantity,
    ) -> Result<Vec<Coil>, Exception> {
        check_quantity(count, MAX_READ_BITS)?;
        self.image
            .read_bits(kind, address.into(), count.into())
            .map_err(|err| {
                warn!("{err}");
                Exception::IllegalDataAddress
            })
    }

    fn words(
        &self,
        kind: BankKind,
        address: Address,
        count: Quantity,
    ) -> Result<Vec<Word>, Exception> {
        check_quantity(count, MAX_READ_WORDS)?;
        self.image
            .read_words(kind, address.into(), count.into())
            .map_err(|err| {
                warn!("{err}");
                Exception::IllegalDataAddress
            })
    }
}

impl tokio_modbus::server::Service for ImageService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = Exception;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        if req.slave != self.unit_id {
            trace!(unit = req.slave, "ignoring request for another unit");
            return future::ready(Ok(None));
        }
        debug!("request: {:?}", req.request);
        future::ready(self.answer(req.request).map(Some))
    }
}

/// A running serial listener. It has no stop condition of its own; the
/// owner either joins it or aborts it.
#[derive(Debug)]
pub struct SerialResponder {
    handle: JoinHandle<()>,
}

impl SerialResponder {
    pub fn start(
        image: Arc<ProcessImage>,
        unit_id: u8,
        config: &SerialConfig,
    ) -> anyhow::Result<SerialResponder> {
        if config.echo {
            bail!("serial echo is not supported");
        }

        let serial = tokio_serial::SerialStream::open(&config.builder())
            .with_context(|| format!("cannot open serial port {}", config.port))?;
        let server = Server::new(serial);
        let service = ImageService::new(image, unit_id);
        let port = config.port.clone();

        let handle = tokio::spawn(async move {
            info!(unit = unit_id, "listening on {port}");
            if let Err(err) = server.serve_forever(service).await {
                error!("serial responder on {port} stopped: {err}");
            }
        });

        Ok(SerialResponder { handle })
    }

    /// Waits for the serving loop to end, which only happens on failure.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.handle).await
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_image::RegisterSpec;

    fn service() -> ImageService {
        let image = ProcessImage::build(
            2,
            4,
            RegisterSpec::Constant(251),
            RegisterSpec::Sequential(3),
        );
        ImageService::new(Arc::new(image), 2)
    }

    async fn send(
        service: &ImageService,
        slave: u8,
        request: Request<'static>,
    ) -> Result<Option<Response>, Exception> {
        use tokio_modbus::server::Service;
        service.call(SlaveRequest { slave, request }).await
    }

    #[test]
    fn test_serial_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert!(!config.echo);
    }

    #[tokio::test]
    async fn test_reads_each_bank() {
        let service = service();

        assert_eq!(
            send(&service, 2, Request::ReadCoils(0, 2)).await,
            Ok(Some(Response::ReadCoils(vec![true, false])))
        );
        assert_eq!(
            send(&service, 2, Request::ReadDiscreteInputs(1, 3)).await,
            Ok(Some(Response::ReadDiscreteInputs(vec![false, true, false])))
        );
        assert_eq!(
            send(&service, 2, Request::ReadHoldingRegisters(0, 1)).await,
            Ok(Some(Response::ReadHoldingRegisters(vec![251])))
        );
        assert_eq!(
            send(&service, 2, Request::ReadInputRegisters(1, 2)).await,
            Ok(Some(Response::ReadInputRegisters(vec![1, 2])))
        );
    }

    #[tokio::test]
    async fn test_other_unit_is_ignored() {
        let service = service();
        assert_eq!(send(&service, 3, Request::ReadCoils(0, 1)).await, Ok(None));
    }

    #[tokio::test]
    async fn test_out_of_range_read() {
        let service = service();
        assert_eq!(
            send(&service, 2, Request::ReadHoldingRegisters(1, 1)).await,
            Err(Exception::IllegalDataAddress)
        );
        assert_eq!(
            send(&service, 2, Request::ReadCoils(0, 0)).await,
            Err(Exception::IllegalDataValue)
        );
    }

    #[tokio::test]
    async fn test_oversized_reads_are_refused() {
        let image = ProcessImage::build(
            3000,
            3000,
            RegisterSpec::Sequential(300),
            RegisterSpec::Sequential(300),
        );
        let service = ImageService::new(Arc::new(image), 2);

        assert_eq!(
            send(&service, 2, Request::ReadHoldingRegisters(0, 126)).await,
            Err(Exception::IllegalDataValue)
        );
        assert_eq!(
            send(&service, 2, Request::ReadInputRegisters(0, 200)).await,
            Err(Exception::IllegalDataValue)
        );
        assert_eq!(
            send(&service, 2, Request::ReadCoils(0, 2001)).await,
            Err(Exception::IllegalDataValue)
        );
        assert_eq!(
            send(&service, 2, Request::ReadDiscreteInputs(0, 2001)).await,
            Err(Exception::IllegalDataValue)
        );

        let Ok(Some(Response::ReadHoldingRegisters(words))) =
            send(&service, 2, Request::ReadHoldingRegisters(0, 125)).await
        else {
            panic!("125 registers should be readable");
        };
        assert_eq!(words.len(), 125);
        let Ok(Some(Response::ReadCoils(bits))) =
            send(&service, 2, Request::ReadCoils(0, 2000)).await
        else {
            panic!("2000 coils should be readable");
        };
        assert_eq!(bits.len(), 2000);
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let service = service();
        assert_eq!(
            send(&service, 2, Request::MaskWriteRegister(0, 0xFFFF, 0)).await,
            Err(Exception::IllegalFunction)
        );
        assert_eq!(
            send(&service, 2, Request::WriteSingleRegister(0, 7)).await,
            Err(Exception::IllegalFunction)
        );
    }
}
