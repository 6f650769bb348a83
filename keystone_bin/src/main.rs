//! The main entry point for the Keystone database.
//!
//! Configuration comes from the environment; the database directory is
//! primed (restoring the checkpoint snapshot if one exists), the log is
//! replayed, and the REPL runs over stdin/stdout.

use keystone_bin::config::Config;
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    if let Err(e) = keystone_bin::run(&config) {
        eprintln!("keystone: {e}");
        std::process::exit(1);
    }
}
