#![deny(unsafe_code)]

use std::io::Write;
use std::{env, io, process::ExitCode};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    run_with(env::args_os(), &mut stdout, &mut stderr).await
}

async fn run_with<I, Out, Err>(args: I, stdout: &mut Out, stderr: &mut Err) -> ExitCode
where
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
    Out: Write,
    Err: Write,
{
    let status = sync_http_cli::run(args, stdout, stderr).await;
    sync_http_cli::exit_code_from(status)
}

#[cfg(test)]
mod tests {
    use super::run_with;
    use std::process::ExitCode;

    #[tokio::test]
    async fn version_flag_reports_success() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = run_with(["sync-http-cli", "--version"], &mut stdout, &mut stderr).await;
        assert_eq!(exit, ExitCode::SUCCESS);
        assert!(!stdout.is_empty(), "version output should not be empty");
        assert!(stderr.is_empty(), "version flag should not write to stderr");
    }
}
