use std::process::ExitCode;

use clap::Parser;
use offsite_backup::{Cli, EXIT_PRECONDITION, load_env_files, run};

fn main() -> ExitCode {
    load_env_files();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("offsite: {err:#}");
            ExitCode::from(EXIT_PRECONDITION)
        }
    }
}
