#![deny(unsafe_code)]

use std::process::ExitCode;

mod telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    telemetry::init();

    let config = sync_http_api::ServerConfig::from_env();
    match sync_http_api::serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(source) => {
            tracing::error!(%source, "server exited with an error");
            ExitCode::FAILURE
        }
    }
}
