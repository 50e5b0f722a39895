/// Cadence CLI
///
/// This binary is the reference host embedding: it creates a context,
/// spawns a microthread over a demo program, and drives the resume loop.

use cadence_core::cli;

fn main() {
    if let Err(e) = cli::run_cli() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
