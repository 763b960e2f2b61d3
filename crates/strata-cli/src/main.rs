//! Strata command-line interface.
//!
//! Exit codes: 0 on success, 2 when a precondition was unmet and nothing
//! changed, 3 when state was partially changed, 1 for any other error.

mod commands;
mod config;
mod formatter;

use clap::Parser;
use strata_core::{Engine, EngineError, OperationOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Args;

fn exit_code(error: &EngineError) -> i32 {
    if error.outcome() == OperationOutcome::PartialChange {
        3
    } else if error.is_precondition() {
        2
    } else {
        1
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=info,strata_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.to_config();
    tracing::debug!(
        root = %config.storage_root.display(),
        database = %config.database_path.display(),
        "configuration loaded"
    );

    let result = Engine::open(config)
        .and_then(|engine| commands::execute(&engine, args.command, args.format));

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = exit_code(&e);
            if code == 3 {
                eprintln!("State was partially changed; inspect `strata status` and `strata backups`.");
            }
            std::process::exit(code);
        }
    }
}
