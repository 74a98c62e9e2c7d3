//! Host binary entry point.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal startup error, 2 when an
//! error escapes the run loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process;
use std::sync::Arc;

use clap::Parser;

use labhost::app::{Application, Cli};
use labhost::modules;

fn main() {
    let cli = Cli::parse();
    let registry = Arc::new(modules::default_registry());

    let app = match Application::bootstrap(&cli, registry) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("labhost: startup failed: {err:#}");
            process::exit(1);
        }
    };

    let code = match catch_unwind(AssertUnwindSafe(|| app.run())) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            eprintln!("labhost: error escaped the run loop: {err:#}");
            2
        }
        Err(_) => {
            eprintln!("labhost: panic escaped the run loop");
            2
        }
    };
    process::exit(code);
}
