//! Filebundle CLI Binary
//!
//! Command-line interface for inspecting and editing bundle directories.

use clap::Parser;
use filebundle::config::ConfigLoader;
use filebundle::logging::init_logging;
use filebundle::tooling::cli::{Cli, CliContext};
use std::process;

fn main() {
    let cli = Cli::parse();

    let mut config = match ConfigLoader::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    cli.apply_logging_overrides(&mut config);
    if let Err(e) = init_logging(Some(&config.logging)) {
        eprintln!("Error initializing logging: {}", e);
    }

    // Create CLI context
    let context = match CliContext::new(cli.bundle.clone(), config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error opening bundle: {:#}", e);
            process::exit(1);
        }
    };

    // Execute command
    match context.execute(&cli.command) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            drop(context);
            process::exit(1);
        }
    }
}
