use clap::Parser;
use env_logger::Env;
use keycustody_cli::{run, Cli};
use log::error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.to_config();

    let debug = cli.debug || config.as_ref().is_ok_and(|c| c.debug);
    env_logger::Builder::from_env(Env::default().default_filter_or(if debug { "debug" } else { "warn" }))
        .init();

    match config.and_then(|config| run(&cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
