use std::io;
use thiserror::Error;
use tokio_modbus::prelude::Exception;

use crate::process_image::BankKind;

/// Errors raised while building or parsing Mask Write Register PDUs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid argument: {field} = {value} does not fit in 16 bits")]
    InvalidArgument { field: &'static str, value: i64 },

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BankError {
    #[error("{kind} address {address} out of range (capacity {capacity})")]
    OutOfRange {
        kind: BankKind,
        address: usize,
        capacity: usize,
    },
}

/// Failures of the byte-moving layer underneath a transaction.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("modbus error: {0}")]
    Modbus(#[from] tokio_modbus::Error),

    #[error("device replied with exception {0:?}")]
    Exception(Exception),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("failed to close connection: {0}")]
    Close(String),
}

/// Bad command line. `help` marks an explicit `--help`, which is not a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UsageError {
    pub message: String,
    pub help: bool,
}

impl UsageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            help: false,
        }
    }
}

impl From<clap::Error> for UsageError {
    fn from(err: clap::Error) -> Self {
        Self {
            message: err.render().to_string(),
            help: !err.use_stderr(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid connection spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("cannot connect to {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// A send/receive failure that aborted the repeat loop.
#[derive(Error, Debug)]
#[error("attempt {attempt} failed: {source}")]
pub struct TransactionError {
    pub attempt: usize,
    #[source]
    pub source: TransportError,
}
