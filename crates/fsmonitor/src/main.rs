mod cli;
mod commands;
mod tracing;

use std::process;

fn main() {
    let exit_code = match cli::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    process::exit(exit_code);
}
