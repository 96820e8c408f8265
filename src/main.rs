//! postkeeper CLI entry point
//!
//! Installs logging, then delegates everything to the CLI module. Errors
//! are printed to stderr and exit non-zero.

use postkeeper::cli;

fn main() {
    cli::init_tracing();
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
