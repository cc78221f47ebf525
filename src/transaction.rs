use std::future::{self, Future};
use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::error::{CodecError, TransactionError, TransportError};
use crate::mask_write::{self, MaskWriteRequest, MaskWriteResponse};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// A request/response channel to one remote device.
///
/// `exchange` returns `Ok(None)` when the transport knows no reply will come.
#[allow(async_fn_in_trait)]
pub trait Connection {
    async fn exchange(&mut self, unit_id: u8, pdu: Bytes)
        -> Result<Option<Bytes>, TransportError>;

    /// Called after an exchange was abandoned mid-flight. A late reply to it
    /// must not be read as the answer to the next request.
    async fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Owns a connection and closes it at most once.
#[derive(Debug)]
pub struct ReleaseGuard<C: Connection> {
    connection: C,
    released: bool,
}

impl<C: Connection> ReleaseGuard<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub async fn release(&mut self) -> Result<(), TransportError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.connection.close().await
    }
}

impl<C: Connection> Drop for ReleaseGuard<C> {
    fn drop(&mut self) {
        if !self.released {
            warn!("connection dropped without being released");
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Responded(MaskWriteResponse),
    NoResponse,
    Failed(TransactionError),
}

#[derive(Debug)]
pub struct Attempt {
    pub index: usize,
    pub outcome: Outcome,
}

/// What a finished repeat loop produced.
#[derive(Debug)]
pub struct Execution {
    pub attempts: Vec<Attempt>,
    pub last_response: Option<MaskWriteResponse>,
    pub interrupted: bool,
}

impl Execution {
    pub fn failure(&self) -> Option<&TransactionError> {
        self.attempts.iter().find_map(|attempt| match &attempt.outcome {
            Outcome::Failed(err) => Some(err),
            _ => None,
        })
    }
}

/// One request bound to one connection, sent up to `repeat` times.
pub struct Transaction<C: Connection> {
    request: MaskWriteRequest,
    connection: ReleaseGuard<C>,
    timeout: Duration,
}

impl<C: Connection> Transaction<C> {
    pub fn new(request: MaskWriteRequest, connection: C) -> Self {
        Self {
            request,
            connection: ReleaseGuard::new(connection),
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn execute(self, repeat: usize) -> Execution {
        self.execute_until(repeat, future::pending()).await
    }

    /// Runs the repeat loop until all attempts are spent, one fails, or
    /// `shutdown` resolves. The connection is released before returning.
    pub async fn execute_until<F>(mut self, repeat: usize, shutdown: F) -> Execution
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = pin!(shutdown);
        let pdu = self.request.encode();
        info!("Request: {}", hex::encode(&pdu));

        let mut execution = Execution {
            attempts: Vec::new(),
            last_response: None,
            interrupted: false,
        };

        for index in 0..repeat {
            let outcome = tokio::select! {
                biased;
                outcome = self.attempt(index, pdu.clone()) => Some(outcome),
                _ = &mut shutdown => None,
            };
            let Some(outcome) = outcome else {
                warn!(attempt = index, "interrupted, skipping remaining attempts");
                execution.interrupted = true;
                break;
            };

            let failed = matches!(outcome, Outcome::Failed(_));
            if let Outcome::Responded(response) = outcome {
                execution.last_response = Some(response);
            }
            execution.attempts.push(Attempt { index, outcome });
            if failed {
                break;
            }
        }

        if let Err(err) = self.connection.release().await {
            warn!("{err}");
        }
        debug!(attempts = execution.attempts.len(), "transaction finished");

        execution
    }

    async fn attempt(&mut self, index: usize, pdu: Bytes) -> Outcome {
        let unit_id = self.request.unit_id;
        let exchange = self.connection.get_mut().exchange(unit_id, pdu);
        let result = time::timeout(self.timeout, exchange).await;

        let reply = match result {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                info!(attempt = index, "No response");
                return Outcome::NoResponse;
            }
            Err(_) => {
                info!(attempt = index, "No response");
                if let Err(source) = self.connection.get_mut().reset().await {
                    let err = TransactionError {
                        attempt: index,
                        source,
                    };
                    error!("{err}");
                    return Outcome::Failed(err);
                }
                return Outcome::NoResponse;
            }
            Ok(Err(source)) => {
                let err = TransactionError {
                    attempt: index,
                    source,
                };
                error!("{err}");
                return Outcome::Failed(err);
            }
        };

        match self.check(&reply) {
            Ok(response) => {
                info!(attempt = index, "Response: {}", hex::encode(&reply));
                Outcome::Responded(response)
            }
            Err(source) => {
                let err = TransactionError {
                    attempt: index,
                    source: source.into(),
                };
                error!("{err}");
                Outcome::Failed(err)
            }
        }
    }

    fn check(&self, reply: &[u8]) -> Result<MaskWriteResponse, CodecError> {
        let response = mask_write::decode(reply)?;
        let expected = self.request.expected_response();
        if response != expected {
            return Err(CodecError::MalformedMessage(format!(
                "response {response:?} does not echo request {expected:?}"
            )));
        }
        Ok(response)
    }
}
