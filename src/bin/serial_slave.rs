use std::env;
use std::process::ExitCode;

use modbus_harness::cli;
use modbus_harness::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::init();

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    ExitCode::from(cli::run_slave(env::args_os(), shutdown).await)
}
