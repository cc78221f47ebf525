use std::cell::Cell;
use std::future;
use std::rc::Rc;

use bytes::Bytes;
use modbus_harness::cli::{run_master, EXIT_FAILURE, EXIT_OK};
use modbus_harness::connection::{ConnectionSpec, Connector};
use modbus_harness::error::{ConnectionError, TransportError};
use modbus_harness::mask_write;
use modbus_harness::transaction::Connection;

/// A device that holds one register per reference and applies mask writes.
struct LoopbackDevice {
    register: Rc<Cell<u16>>,
    closed: Rc<Cell<usize>>,
    fail_after: Option<usize>,
    sent: usize,
}

impl Connection for LoopbackDevice {
    async fn exchange(
        &mut self,
        unit_id: u8,
        pdu: Bytes,
    ) -> Result<Option<Bytes>, TransportError> {
        if self.fail_after == Some(self.sent) {
            return Err(TransportError::UnexpectedResponse("link dropped".to_string()));
        }
        self.sent += 1;

        let request = mask_write::MaskWriteRequest::decode(unit_id, &pdu)?;
        self.register.set(request.apply(self.register.get()));
        Ok(Some(request.expected_response().encode()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.set(self.closed.get() + 1);
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackConnector {
    connects: Cell<usize>,
    register: Rc<Cell<u16>>,
    closed: Rc<Cell<usize>>,
    fail_after: Option<usize>,
    refuse: bool,
}

impl Connector for LoopbackConnector {
    type Connection = LoopbackDevice;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<LoopbackDevice, ConnectionError> {
        self.connects.set(self.connects.get() + 1);
        if self.refuse {
            return Err(ConnectionError::Unreachable {
                target: spec.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        Ok(LoopbackDevice {
            register: self.register.clone(),
            closed: self.closed.clone(),
            fail_after: self.fail_after,
            sent: 0,
        })
    }
}

async fn run(args: &[&str], connector: &LoopbackConnector) -> u8 {
    let argv = std::iter::once("mask-write-register").chain(args.iter().copied());
    run_master(argv, connector, future::pending()).await
}

#[tokio::test]
async fn test_two_arguments_is_usage_error_without_connecting() {
    let connector = LoopbackConnector::default();

    let code = run(&["tcp:127.0.0.1", "4"], &connector).await;

    assert_eq!(code, EXIT_FAILURE);
    assert_eq!(connector.connects.get(), 0);
}

#[tokio::test]
async fn test_missing_or_mask_is_usage_error() {
    let connector = LoopbackConnector::default();

    let code = run(&["tcp:127.0.0.1", "4", "0xFF00"], &connector).await;

    assert_eq!(code, EXIT_FAILURE);
    assert_eq!(connector.connects.get(), 0);
}

#[tokio::test]
async fn test_mask_write_updates_device() {
    let connector = LoopbackConnector::default();
    connector.register.set(0x0012);

    let code = run(&["tcp:127.0.0.1:502:1", "4", "0x00F2", "0x0025"], &connector).await;

    assert_eq!(code, EXIT_OK);
    assert_eq!(connector.register.get(), 0x0017);
    assert_eq!(connector.connects.get(), 1);
    assert_eq!(connector.closed.get(), 1);
}

#[tokio::test]
async fn test_repeat_is_idempotent_on_device() {
    let connector = LoopbackConnector::default();
    connector.register.set(0xABCD);

    let code = run(&["tcp:127.0.0.1", "0", "0xFF00", "0x0042", "5"], &connector).await;

    assert_eq!(code, EXIT_OK);
    assert_eq!(connector.register.get(), 0xAB42);
    assert_eq!(connector.closed.get(), 1);
}

#[tokio::test]
async fn test_failure_mid_loop_releases_once() {
    let connector = LoopbackConnector {
        fail_after: Some(2),
        ..Default::default()
    };

    let code = run(&["tcp:127.0.0.1", "0", "0", "1", "10"], &connector).await;

    assert_eq!(code, EXIT_FAILURE);
    assert_eq!(connector.closed.get(), 1);
}

#[tokio::test]
async fn test_out_of_range_mask_never_connects() {
    let connector = LoopbackConnector::default();

    let code = run(&["tcp:127.0.0.1", "0", "65536", "0"], &connector).await;

    assert_eq!(code, EXIT_FAILURE);
    assert_eq!(connector.connects.get(), 0);
}

#[tokio::test]
async fn test_connection_error_skips_transaction() {
    let connector = LoopbackConnector {
        refuse: true,
        ..Default::default()
    };

    let code = run(&["tcp:127.0.0.1", "0", "0", "1"], &connector).await;

    assert_eq!(code, EXIT_FAILURE);
    assert_eq!(connector.connects.get(), 1);
    assert_eq!(connector.closed.get(), 0);
}
