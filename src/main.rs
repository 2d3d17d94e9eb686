//! Binary entrypoint for the terminal chat client.

use std::process::ExitCode;

use maternal_chat::cli;

fn main() -> ExitCode {
    cli::run()
}
