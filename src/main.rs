use std::process::ExitCode;

use clap::Parser;

mod cli;

fn main() -> ExitCode {
    // clap exits 2 on malformed arguments, 0 on --help/--version.
    let parsed = cli::Cli::parse();
    match cli::run(parsed) {
        Ok(()) => ExitCode::SUCCESS,
        Err(cli::CliError::Usage(message)) => {
            eprintln!("error: {message}");
            eprintln!("usage: probkit <hll|bloom|cms> [options] (see --help)");
            ExitCode::from(2)
        }
        Err(cli::CliError::Failed(err)) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
