//! Command lines of the two tools and the top-level flows behind them.

use std::env;
use std::ffi::OsString;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, CommandFactory, Parser};
use tracing::{error, info, warn};

use crate::connection::{ConnectionSpec, Connector};
use crate::error::UsageError;
use crate::mask_write::MaskWriteRequest;
use crate::process_image::{
    ProcessImage, RegisterSpec, DEFAULT_HOLDING_REGISTER, DEFAULT_INPUT_REGISTER,
    MAX_BANK_CAPACITY,
};
use crate::responder::{SerialConfig, SerialResponder};
use crate::transaction::{Transaction, DEFAULT_ATTEMPT_TIMEOUT};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const DEFAULT_SLAVE_UNIT: u8 = 2;

/// Accepts decimal or `0x` prefixed hex, with an optional sign.
fn parse_int(value: &str) -> Result<i64, String> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|err| format!("'{value}' is not an integer: {err}"))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Writes one holding register with Mask Write Register (0x16).
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "mask-write-register")]
pub struct MasterArgs {
    /// tcp:<host>[:<port>[:<unit>]] or device:<path>[:<unit>]
    pub connection: String,

    /// Register reference
    #[arg(value_parser = parse_int, allow_negative_numbers = true)]
    pub register: i64,

    /// Bits to keep from the current value
    #[arg(value_parser = parse_int, allow_negative_numbers = true)]
    pub and_mask: i64,

    /// Bits to set where the AND mask is zero
    #[arg(value_parser = parse_int, allow_negative_numbers = true)]
    pub or_mask: i64,

    /// How many times to send the same request
    #[arg(default_value_t = 1)]
    pub repeat: usize,
}

impl MasterArgs {
    pub fn parse_from_args<I, T>(args: I) -> Result<Self, UsageError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Self::try_parse_from(args)?)
    }
}

fn attempt_timeout() -> Duration {
    env::var("MODBUS_TIMEOUT_MS")
        .ok()
        .and_then(|ms| ms.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT)
}

fn report_usage(err: &UsageError) -> u8 {
    if err.help {
        print!("{}", err.message);
        EXIT_OK
    } else {
        eprint!("{}", err.message);
        EXIT_FAILURE
    }
}

/// Runs the master tool and returns its exit code.
pub async fn run_master<I, T, K, F>(args: I, connector: &K, shutdown: F) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    K: Connector,
    F: Future<Output = ()>,
{
    let args = match MasterArgs::parse_from_args(args) {
        Ok(args) => args,
        Err(err) => return report_usage(&err),
    };

    let spec: ConnectionSpec = match args.connection.parse() {
        Ok(spec) => spec,
        Err(err) => {
            error!("{err}");
            return EXIT_FAILURE;
        }
    };

    let request = match MaskWriteRequest::new(
        spec.unit_id(),
        args.register,
        args.and_mask,
        args.or_mask,
    ) {
        Ok(request) => request,
        Err(err) => {
            error!("{err}");
            return EXIT_FAILURE;
        }
    };

    let connection = match connector.connect(&spec).await {
        Ok(connection) => connection,
        Err(err) => {
            error!("{err}");
            return EXIT_FAILURE;
        }
    };

    let execution = Transaction::new(request, connection)
        .with_timeout(attempt_timeout())
        .execute_until(args.repeat, shutdown)
        .await;

    if let Some(err) = execution.failure() {
        error!("transaction aborted: {err}");
        return EXIT_FAILURE;
    }
    if execution.interrupted {
        warn!(
            completed = execution.attempts.len(),
            requested = args.repeat,
            "interrupted"
        );
    }
    EXIT_OK
}

/// Serves a synthetic process image over Modbus RTU.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "serial-slave", disable_help_flag = true)]
pub struct SlaveArgs {
    /// Serial port name
    #[arg(short, long)]
    pub port: Option<String>,

    /// Unit identifier to answer for [default: 2]
    #[arg(short, long)]
    pub unit: Option<u8>,

    /// Number of coils
    #[arg(short, long, default_value_t = 2)]
    pub coils: usize,

    /// Number of discrete inputs
    #[arg(short, long, default_value_t = 4)]
    pub discretes: usize,

    /// Number of input registers, holding 0..n (otherwise one register holding 45)
    #[arg(short, long)]
    pub inputs: Option<usize>,

    /// Number of holding registers, holding 0..n (otherwise one register holding 251)
    #[arg(short = 'h', long)]
    pub holdings: Option<usize>,

    #[allow(dead_code)]
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Port, then unit, when not given as flags
    #[arg(value_name = "PORT_OR_UNIT")]
    pub positional: Vec<String>,
}

/// Everything the slave needs after argument resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveConfig {
    pub serial: SerialConfig,
    pub unit_id: u8,
    pub coils: usize,
    pub discretes: usize,
    pub holding: RegisterSpec,
    pub input: RegisterSpec,
}

impl SlaveConfig {
    pub fn from_args<I, T>(args: I) -> Result<Self, UsageError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        SlaveArgs::try_parse_from(args)?.try_into()
    }

    pub fn image(&self) -> ProcessImage {
        ProcessImage::build(self.coils, self.discretes, self.holding, self.input)
    }
}

fn slave_usage(message: &str) -> UsageError {
    UsageError::new(format!(
        "error: {message}\n\n{}\n",
        SlaveArgs::command().render_usage()
    ))
}

fn bank_size(flag: &str, count: usize) -> Result<usize, UsageError> {
    if count > MAX_BANK_CAPACITY {
        return Err(slave_usage(&format!(
            "{flag} {count} exceeds {MAX_BANK_CAPACITY} addresses"
        )));
    }
    Ok(count)
}

impl TryFrom<SlaveArgs> for SlaveConfig {
    type Error = UsageError;

    fn try_from(args: SlaveArgs) -> Result<Self, Self::Error> {
        let coils = bank_size("--coils", args.coils)?;
        let discretes = bank_size("--discretes", args.discretes)?;
        let holdings = args.holdings.map(|n| bank_size("--holdings", n)).transpose()?;
        let inputs = args.inputs.map(|n| bank_size("--inputs", n)).transpose()?;

        let mut rest = args.positional.into_iter();

        let port = match args.port {
            Some(port) => port,
            None => rest
                .next()
                .ok_or_else(|| slave_usage("no serial port given"))?,
        };
        let unit_id = match args.unit {
            Some(unit) => unit,
            None => match rest.next() {
                Some(token) => token
                    .parse()
                    .map_err(|_| slave_usage(&format!("invalid unit '{token}'")))?,
                None => DEFAULT_SLAVE_UNIT,
            },
        };
        let extra: Vec<String> = rest.collect();
        if !extra.is_empty() {
            warn!("ignoring extra arguments: {extra:?}");
        }

        Ok(Self {
            serial: SerialConfig::new(port),
            unit_id,
            coils,
            discretes,
            holding: RegisterSpec::from_requested(holdings, DEFAULT_HOLDING_REGISTER),
            input: RegisterSpec::from_requested(inputs, DEFAULT_INPUT_REGISTER),
        })
    }
}

/// Runs the slave tool until `shutdown` resolves or the listener dies.
pub async fn run_slave<I, T, F>(args: I, shutdown: F) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: Future<Output = ()>,
{
    let config = match SlaveConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => return report_usage(&err),
    };

    if let RegisterSpec::Sequential(count) = config.holding {
        info!("Adding {count} holding registers");
    }
    if let RegisterSpec::Sequential(count) = config.input {
        info!("Adding {count} input registers");
    }
    let image = Arc::new(config.image());

    let mut responder = match SerialResponder::start(image, config.unit_id, &config.serial) {
        Ok(responder) => responder,
        Err(err) => {
            error!("{err:#}");
            return EXIT_FAILURE;
        }
    };

    let mut shutdown = std::pin::pin!(shutdown);
    let stopped = tokio::select! {
        joined = responder.join() => Some(joined),
        _ = &mut shutdown => None,
    };

    match stopped {
        Some(Ok(())) => {
            error!("serial responder stopped");
            EXIT_FAILURE
        }
        Some(Err(err)) => {
            error!("serial responder task failed: {err}");
            EXIT_FAILURE
        }
        None => {
            info!("shutting down");
            responder.abort();
            EXIT_OK
        }
    }
}
