use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

mod cmd_serve;

/// Run a farm of Bambu Lab printers.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "print-farm")]
struct Cli {
    /// Config file to use
    #[arg(long, short, default_value = "print-farm.toml", env = "PRINT_FARM_CONFIG")]
    config: PathBuf,

    /// Log as JSON lines.
    #[arg(long)]
    json: bool,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured printers and dispatch jobs until stopped.
    Serve,

    /// Print the color distance between two hex colors.
    DeltaE {
        /// First color, `#RRGGBB` or `#RRGGBBAA`.
        a: String,
        /// Second color.
        b: String,
    },

    /// Classify HMS fault codes. Fails when any of them is critical.
    ClassifyHms {
        /// Codes in `XXXX-XXXX-XXXX-XXXX` form.
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let (json, pretty) = if cli.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    // Initialize tracing.
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with({
            #[cfg(feature = "debug")]
            {
                // When running with `debug`, we're going to hook in the console
                // subscriber for tokio-console.
                console_subscriber::spawn()
            }
            #[cfg(not(feature = "debug"))]
            {
                // Under normal cases, we need a blank Layer that doesn't
                // do anything.
                tracing_subscriber::layer::Identity::new()
            }
        })
        .init();

    match cli.command {
        Commands::Serve => cmd_serve::main(&cli).await,
        Commands::DeltaE { ref a, ref b } => {
            println!("{:.3}", print_farm::color::delta_e(a, b)?);
            Ok(())
        }
        Commands::ClassifyHms { ref codes } => {
            let events = print_farm::hms::classify_all(codes.iter().map(String::as_str));
            for event in &events {
                println!("{}\t{}\t{}\t{}", event.code, event.severity, event.module, event.description);
            }
            if let Some(worst) = print_farm::hms::most_severe(&events) {
                println!("most severe: {} ({})", worst.code, worst.severity);
            }
            if print_farm::hms::has_critical(&events) {
                anyhow::bail!("critical fault present");
            }
            Ok(())
        }
    }
}
