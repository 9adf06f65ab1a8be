mod cli;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match cli.run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("guard-fuzz: {error:#}");
            tracing::error!(?error, "Exiting on configuration error");
            ExitCode::from(1)
        }
    }
}
