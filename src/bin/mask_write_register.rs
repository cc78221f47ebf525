use std::env;
use std::process::ExitCode;

use modbus_harness::cli;
use modbus_harness::connection::ModbusConnector;
use modbus_harness::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::init();

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    ExitCode::from(cli::run_master(env::args_os(), &ModbusConnector, shutdown).await)
}
