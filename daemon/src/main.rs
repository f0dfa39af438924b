use std::process::ExitCode;

use clap::{CommandFactory, Parser};

use crate::app::{keepalive_log, load_config, run_app};
use crate::cli::Cli;
use crate::utils::DailyLogFile;

mod app;
mod cli;
pub mod config;
mod error;
mod management;
mod provision;
mod storage;
mod utils;

fn init_logger(file: Option<DailyLogFile>) {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&filters);
    if let Some(file) = file {
        builder
            .target(env_logger::Target::Pipe(Box::new(file)))
            .write_style(env_logger::WriteStyle::Never);
    }
    builder.init();
}

fn fail(e: anyhow::Error) -> ExitCode {
    eprintln!("Error: {:?}", e);
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let Some(command) = cli.command.clone() else {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_logger(None);
            return fail(e);
        }
    };
    match keepalive_log(&config, &command) {
        Ok(file) => init_logger(file),
        Err(e) => {
            init_logger(None);
            return fail(e);
        }
    }

    match run_app(config, command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => fail(e),
    }
}
